//! Result publishing
//!
//! Publishing is fire-and-forget: a failed publish is logged and never
//! retried, and the engine never waits for an acknowledgement.

use crate::error::EngineError;
use crate::types::ResultMessage;
use serde::Serialize;
use std::io::Write;
use tracing::{info, warn};

/// Sink for result messages
pub trait ResultPublisher {
    /// Emit one payload on a topic
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), EngineError>;
}

/// Publish every message once, logging failures. Returns how many went out.
pub fn publish_all(publisher: &mut dyn ResultPublisher, messages: &[ResultMessage]) -> usize {
    let mut sent = 0;
    for message in messages {
        let payload = message.payload().to_string();
        match publisher.publish(message.topic(), &payload) {
            Ok(()) => {
                info!(topic = message.topic(), %payload, "published");
                sent += 1;
            }
            Err(e) => warn!(topic = message.topic(), error = %e, "publish failed"),
        }
    }
    sent
}

/// Collects published messages in memory
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    pub published: Vec<(String, serde_json::Value)>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads published on `topic`, in order
    pub fn on_topic(&self, topic: &str) -> Vec<&serde_json::Value> {
        self.published
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p)
            .collect()
    }

    pub fn clear(&mut self) {
        self.published.clear();
    }
}

impl ResultPublisher for MemoryPublisher {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), EngineError> {
        let value = serde_json::from_str(payload)?;
        self.published.push((topic.to_string(), value));
        Ok(())
    }
}

#[derive(Serialize)]
struct NdjsonRecord<'a> {
    topic: &'a str,
    payload: serde_json::Value,
}

/// Writes `{"topic": .., "payload": ..}` lines, one per published message
pub struct NdjsonPublisher<W: Write> {
    writer: W,
    flush: bool,
}

impl<W: Write> NdjsonPublisher<W> {
    pub fn new(writer: W, flush: bool) -> Self {
        Self { writer, flush }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ResultPublisher for NdjsonPublisher<W> {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), EngineError> {
        let record = NdjsonRecord {
            topic,
            payload: serde_json::from_str(payload)?,
        };
        writeln!(self.writer, "{}", serde_json::to_string(&record)?)?;
        if self.flush {
            self.writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ModelStatus, ANOMALY_TOPIC, STATUS_TOPIC};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct FailingPublisher;

    impl ResultPublisher for FailingPublisher {
        fn publish(&mut self, _topic: &str, _payload: &str) -> Result<(), EngineError> {
            Err(EngineError::Publish("broker gone".to_string()))
        }
    }

    #[test]
    fn test_publish_all_counts_successes() {
        let mut publisher = MemoryPublisher::new();
        let sent = publish_all(
            &mut publisher,
            &[
                ResultMessage::Anomaly { anomaly: false },
                ResultMessage::Status(ModelStatus::Active),
            ],
        );
        assert_eq!(sent, 2);
        assert_eq!(publisher.on_topic(ANOMALY_TOPIC), vec![&json!({"anomaly": 0})]);
        assert_eq!(publisher.on_topic(STATUS_TOPIC), vec![&json!({"status": "active"})]);
    }

    #[test]
    fn test_failed_publish_is_not_retried() {
        let sent = publish_all(
            &mut FailingPublisher,
            &[ResultMessage::Anomaly { anomaly: true }],
        );
        assert_eq!(sent, 0);
    }

    #[test]
    fn test_ndjson_lines() {
        let mut publisher = NdjsonPublisher::new(Vec::new(), false);
        publish_all(&mut publisher, &[ResultMessage::Probability { probability: 40 }]);

        let output = String::from_utf8(publisher.into_inner()).unwrap();
        let line: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(
            line,
            json!({"topic": "health/ml/metabolic_probability", "payload": {"probability": 40}})
        );
    }
}
