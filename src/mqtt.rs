//! MQTT channel bootstrap
//!
//! One long-lived broker connection per process. Inbound messages on the
//! input topic are dispatched to the engine one at a time on the thread that
//! drives the connection, so cycles never overlap.

use crate::config::Options;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::publisher::ResultPublisher;
use crate::types::INPUT_TOPIC;
use crate::PRODUCER_NAME;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 32;
const RECONNECT_PAUSE: Duration = Duration::from_secs(5);

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    pub client_id: String,
}

impl MqttSettings {
    pub fn from_options(options: &Options) -> Self {
        Self {
            host: options.mqtt_host.clone(),
            port: options.mqtt_port,
            credentials: options
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
            client_id: format!("{PRODUCER_NAME}-{}", Uuid::new_v4().simple()),
        }
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some((user, pass)) = &self.credentials {
            options.set_credentials(user, pass);
        }
        options
    }
}

/// Publishes QoS 0, non-retained, without waiting on the event loop
pub struct MqttPublisher {
    client: Client,
}

impl ResultPublisher for MqttPublisher {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), EngineError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .map_err(|e| EngineError::Publish(e.to_string()))
    }
}

/// Connect, subscribe and feed every inbound message to `engine`.
///
/// A connection error before the first acknowledgement is returned to the
/// caller. Once connected, the transport reconnects on its own.
pub fn run(engine: &mut Engine, settings: &MqttSettings) -> Result<(), EngineError> {
    info!(host = %settings.host, port = settings.port, "connecting to MQTT broker");

    let (client, mut connection) = Client::new(settings.mqtt_options(), REQUEST_CAPACITY);
    let mut publisher = MqttPublisher { client };
    let mut connected = false;

    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected = true;
                publisher
                    .client
                    .try_subscribe(INPUT_TOPIC, QoS::AtMostOnce)
                    .map_err(|e| EngineError::Connection(e.to_string()))?;
                info!(topic = INPUT_TOPIC, "connected and subscribed");
            }
            Ok(Event::Incoming(Packet::Publish(message))) => {
                if message.topic != INPUT_TOPIC {
                    debug!(topic = %message.topic, "ignoring message on foreign topic");
                    continue;
                }
                let outcome = engine.handle_message(&message.payload, &mut publisher);
                debug!(?outcome, "cycle finished");
            }
            Ok(_) => {}
            Err(e) if !connected => {
                error!(error = %e, "broker unreachable");
                return Err(EngineError::Connection(e.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "connection lost");
                thread::sleep(RECONNECT_PAUSE);
            }
        }
    }

    Ok(())
}
