//! health-ml CLI
//!
//! Commands:
//! - run: connect to the MQTT broker and process messages until stopped
//! - replay: feed NDJSON messages through the engine offline
//! - doctor: diagnose options and history log

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use health_ml::config::{DEFAULT_OPTIONS_PATH, EngineMode, Options};
use health_ml::history::{HistoryLog, HistoryStore, LogLayout};
use health_ml::mqtt::{self, MqttSettings};
use health_ml::publisher::NdjsonPublisher;
use health_ml::{CycleOutcome, Engine, EngineError, ENGINE_VERSION, PRODUCER_NAME};

/// health-ml - online anomaly detection and weight forecasting over MQTT
#[derive(Parser)]
#[command(name = "health-ml")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Score and forecast health metrics arriving over MQTT", long_about = None)]
struct Cli {
    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and process messages
    Run {
        /// Add-on options file
        #[arg(long, default_value = DEFAULT_OPTIONS_PATH)]
        options: PathBuf,

        /// Override the configured mode
        #[arg(long)]
        mode: Option<ModeArg>,

        /// Override the history log path
        #[arg(long)]
        history: Option<PathBuf>,

        /// Log a diagnostic instead of failing when the broker is unreachable
        #[arg(long)]
        guarded: bool,
    },

    /// Feed NDJSON messages through the engine and print results
    Replay {
        /// Input file path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Add-on options file (defaults apply when omitted)
        #[arg(long)]
        options: Option<PathBuf>,

        /// Override the configured mode
        #[arg(long)]
        mode: Option<ModeArg>,

        /// Override the history log path
        #[arg(long)]
        history: Option<PathBuf>,

        /// Keep history in memory only
        #[arg(long)]
        in_memory: bool,

        /// Flush output after each result (--flush false to buffer)
        #[arg(long, action = ArgAction::Set, default_value_t = true)]
        flush: bool,
    },

    /// Diagnose options and history log
    Doctor {
        /// Add-on options file
        #[arg(long, default_value = DEFAULT_OPTIONS_PATH)]
        options: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Isolation-forest anomaly flag
    Anomaly,
    /// Delta-adaptive weight forecast
    ForecastDelta,
    /// Absolute-value weight forecast
    ForecastAbsolute,
}

impl From<ModeArg> for EngineMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Anomaly => EngineMode::Anomaly,
            ModeArg::ForecastDelta => EngineMode::ForecastDelta,
            ModeArg::ForecastAbsolute => EngineMode::ForecastAbsolute,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run(cli: Cli) -> Result<(), HealthCliError> {
    match cli.command {
        Commands::Run {
            options,
            mode,
            history,
            guarded,
        } => cmd_run(&options, mode, history, guarded),

        Commands::Replay {
            input,
            options,
            mode,
            history,
            in_memory,
            flush,
        } => cmd_replay(&input, options.as_deref(), mode, history, in_memory, flush),

        Commands::Doctor { options, json } => cmd_doctor(&options, json),
    }
}

fn apply_overrides(options: &mut Options, mode: Option<ModeArg>, history: Option<PathBuf>) {
    if let Some(mode) = mode {
        options.mode = mode.into();
    }
    if let Some(history) = history {
        options.history_path = history;
    }
}

fn cmd_run(
    options_path: &Path,
    mode: Option<ModeArg>,
    history: Option<PathBuf>,
    guarded: bool,
) -> Result<(), HealthCliError> {
    let mut options = Options::load(options_path)?;
    apply_overrides(&mut options, mode, history);

    let mut engine = Engine::new(options.engine_config()?)?;
    let settings = MqttSettings::from_options(&options);

    info!(
        producer = PRODUCER_NAME,
        version = ENGINE_VERSION,
        mode = %options.mode,
        "health ML engine started"
    );

    match mqtt::run(&mut engine, &settings) {
        Err(EngineError::Connection(reason)) if guarded => {
            error!(
                host = %settings.host,
                port = settings.port,
                %reason,
                "could not connect to MQTT broker; check mqtt_host and credentials"
            );
            Ok(())
        }
        other => Ok(other?),
    }
}

fn cmd_replay(
    input: &Path,
    options_path: Option<&Path>,
    mode: Option<ModeArg>,
    history: Option<PathBuf>,
    in_memory: bool,
    flush: bool,
) -> Result<(), HealthCliError> {
    let mut options = match options_path {
        Some(path) => Options::load(path)?,
        None => Options::default(),
    };
    apply_overrides(&mut options, mode, history);

    let mut config = options.engine_config()?;
    if in_memory {
        config.history_path = None;
    }
    let mut engine = Engine::new(config)?;

    let reader: Box<dyn BufRead> = if input.to_string_lossy() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(input)?))
    };

    let mut publisher = NdjsonPublisher::new(io::stdout(), flush);
    let mut messages = 0usize;
    let mut dropped = 0usize;

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        messages += 1;
        if let CycleOutcome::Dropped { .. } =
            engine.handle_message(trimmed.as_bytes(), &mut publisher)
        {
            dropped += 1;
        }
    }

    info!(messages, dropped, history = engine.history().len(), "replay finished");
    Ok(())
}

fn cmd_doctor(options_path: &Path, json: bool) -> Result<(), HealthCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "version".to_string(),
        status: CheckStatus::Ok,
        message: format!("{} {}", PRODUCER_NAME, ENGINE_VERSION),
    });

    let options = if options_path.exists() {
        match Options::load(options_path) {
            Ok(options) => Some(options),
            Err(e) => {
                checks.push(DoctorCheck {
                    name: "options".to_string(),
                    status: CheckStatus::Error,
                    message: e.to_string(),
                });
                None
            }
        }
    } else {
        checks.push(DoctorCheck {
            name: "options".to_string(),
            status: CheckStatus::Warning,
            message: format!("{} does not exist, defaults apply", options_path.display()),
        });
        Some(Options::default())
    };

    if let Some(options) = &options {
        match options.engine_config() {
            Ok(config) => {
                checks.push(DoctorCheck {
                    name: "options".to_string(),
                    status: CheckStatus::Ok,
                    message: format!(
                        "mode {}, broker {}:{} ({})",
                        config.mode,
                        options.mqtt_host,
                        options.mqtt_port,
                        if options.credentials().is_some() {
                            "authenticated"
                        } else {
                            "anonymous"
                        }
                    ),
                });
                if let Some(path) = &config.history_path {
                    checks.push(check_history(path, LogLayout::for_schema(config.mode.schema())));
                }
            }
            Err(e) => checks.push(DoctorCheck {
                name: "options".to_string(),
                status: CheckStatus::Error,
                message: e.to_string(),
            }),
        }
    }

    checks.push(DoctorCheck {
        name: "stdin".to_string(),
        status: CheckStatus::Ok,
        message: if atty::is(atty::Stream::Stdin) {
            "stdin is a TTY (interactive mode)".to_string()
        } else {
            "stdin is a pipe (replay ready)".to_string()
        },
    });

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: ENGINE_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("health-ml Doctor Report");
        println!("=======================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");
        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report
        .checks
        .iter()
        .any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(HealthCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

fn check_history(path: &Path, layout: LogLayout) -> DoctorCheck {
    if !path.exists() {
        return DoctorCheck {
            name: "history".to_string(),
            status: CheckStatus::Warning,
            message: format!("{} does not exist yet, it will be created", path.display()),
        };
    }

    match HistoryLog::open(path, layout).and_then(HistoryStore::durable) {
        Ok(store) if store.is_empty() => DoctorCheck {
            name: "history".to_string(),
            status: CheckStatus::Ok,
            message: format!("{} has a header and no rows yet", path.display()),
        },
        Ok(store) => DoctorCheck {
            name: "history".to_string(),
            status: CheckStatus::Ok,
            message: format!("{} rows in {}", store.len(), path.display()),
        },
        Err(e) => DoctorCheck {
            name: "history".to_string(),
            status: CheckStatus::Error,
            message: e.to_string(),
        },
    }
}

#[derive(Debug)]
enum HealthCliError {
    Io(io::Error),
    Engine(EngineError),
    Json(serde_json::Error),
    DoctorFailed,
}

impl From<io::Error> for HealthCliError {
    fn from(e: io::Error) -> Self {
        HealthCliError::Io(e)
    }
}

impl From<EngineError> for HealthCliError {
    fn from(e: EngineError) -> Self {
        HealthCliError::Engine(e)
    }
}

impl From<serde_json::Error> for HealthCliError {
    fn from(e: serde_json::Error) -> Self {
        HealthCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<HealthCliError> for CliError {
    fn from(e: HealthCliError) -> Self {
        match e {
            HealthCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            HealthCliError::Engine(e @ EngineError::Config(_)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check the add-on options file".to_string()),
            },
            HealthCliError::Engine(e @ EngineError::Connection(_)) => CliError {
                code: "CONNECTION_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check mqtt_host, mqtt_port and broker availability".to_string()),
            },
            HealthCliError::Engine(
                e @ (EngineError::CorruptLog { .. } | EngineError::SchemaMismatch(_)),
            ) => CliError {
                code: "HISTORY_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'health-ml doctor' to inspect the history log".to_string()),
            },
            HealthCliError::Engine(e) => CliError {
                code: "ENGINE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            HealthCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            HealthCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
