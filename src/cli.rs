use clap::{Parser, Subcommand};
use metering_engine::config::Config;
use metering_engine::engine::{Engine, Submission};
use metering_engine::error::{Error, Result};
use metering_engine::formula::FormulaRegistry;
use metering_engine::logger::Logger;
use metering_engine::pricing::StaticPriceCatalog;
use metering_engine::replay::replay_and_persist;
use metering_engine::state::Resolution;
use metering_engine::storage::FileStorage;
use metering_engine::usage::{validate, UsageEvent, ValidationContext};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "metering-engine")]
#[command(about = "Metering engine CLI - usage accumulation, aggregation and reporting")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: "human" or "json"
    #[arg(short, long)]
    pub format: Option<String>,

    /// Data directory path
    #[arg(short, long)]
    pub data_dir: Option<String>,

    /// Log level: "error", "warn", "info", "debug" or "trace"
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the data directory
    Init,

    /// Submit usage (one event or a JSON array of events)
    Submit {
        /// Usage JSON (or read from stdin if neither this nor --file is given)
        #[arg(short, long)]
        event: Option<String>,

        /// Usage file path
        #[arg(long)]
        file: Option<String>,

        /// Processing time in ms since epoch (default: now)
        #[arg(long)]
        now: Option<i64>,

        /// Dry-run: validate but don't submit
        #[arg(long)]
        dry_run: bool,
    },

    /// Show the usage report of an organization
    Report {
        /// Organization id
        organization_id: String,

        /// Report time in ms since epoch (default: now)
        #[arg(short, long)]
        time: Option<i64>,

        /// Only this window: second, minute, hour, day or month
        #[arg(short, long)]
        resolution: Option<Resolution>,
    },

    /// List the published metering plans
    Plans,

    /// Rebuild organization snapshots from the usage log
    Replay,
}

fn engine(config: &Config) -> Engine<FileStorage> {
    Engine::new(
        FileStorage::new(config),
        FormulaRegistry::with_defaults(),
        Box::new(StaticPriceCatalog::linux_container()),
        config.clone(),
    )
}

/// Bring snapshots up to the log tip before serving a command.
fn catch_up(config: &Config) -> Result<usize> {
    let storage = FileStorage::new(config);
    let replayed = replay_and_persist(
        &storage,
        &FormulaRegistry::with_defaults(),
        &StaticPriceCatalog::linux_container(),
        config,
    )?;
    Ok(replayed.applied)
}

/// Parse usage from JSON: a single event or an array of events
fn parse_usage(json: &str) -> Result<Vec<UsageEvent>> {
    let parsed = if json.trim_start().starts_with('[') {
        serde_json::from_str(json)
    } else {
        serde_json::from_str(json).map(|event| vec![event])
    };
    parsed.map_err(|e| Error::MalformedInput(format!("Failed to parse usage JSON: {}", e)))
}

/// Read usage from file or stdin
fn read_usage(file: Option<&str>) -> Result<String> {
    match file {
        Some(path) => fs::read_to_string(path)
            .map_err(|e| Error::MalformedInput(format!("Failed to read file {}: {}", path, e))),
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| Error::MalformedInput(format!("Failed to read from stdin: {}", e)))?;
            Ok(buffer)
        }
    }
}

/// Format output based on format type
fn format_output<T: serde::Serialize + std::fmt::Debug>(data: &T, format: &str) -> Result<String> {
    match format {
        "json" => serde_json::to_string_pretty(data)
            .map_err(|e| Error::Storage(format!("Failed to serialize JSON: {}", e))),
        _ => Ok(format!("{:#?}", data)),
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let mut config = Config::from_env();
    if let Some(dir) = cli.data_dir {
        config.set_data_dir(PathBuf::from(dir));
    }
    if let Some(format) = cli.format {
        config.set_output_format(format);
    }
    if let Some(level) = cli.log_level {
        config.set_log_level(level);
    }
    Logger::init(config.get_log_level());
    let format = config.get_output_format().to_string();

    match cli.command {
        Commands::Init => {
            FileStorage::new(&config).ensure_dirs()?;
            println!("Initialized data directory at: {}", config.get_data_dir().display());
            Ok(())
        }

        Commands::Submit {
            event,
            file,
            now,
            dry_run,
        } => {
            let json = match event {
                Some(json) => json,
                None => read_usage(file.as_deref())?,
            };
            let events = parse_usage(&json)?;
            let now = now.unwrap_or_else(metering_engine::current_timestamp);

            if dry_run {
                let ctx = ValidationContext::live(now, config.slack_ms);
                for event in &events {
                    validate(event, &ctx)?;
                    println!("✓ Usage is valid: {}", event.event_id()?);
                }
                return Ok(());
            }

            catch_up(&config)?;
            let engine = engine(&config).with_clock(move || now);
            let mut outputs = Vec::with_capacity(events.len());
            let mut rejected = 0;
            for event in &events {
                let output = match engine.submit(event) {
                    Ok(Submission::Accepted { event_id, version }) => SubmitOutput {
                        event_id,
                        status: "accepted".to_string(),
                        version: Some(version),
                        error: None,
                    },
                    Ok(Submission::Duplicate { event_id }) => SubmitOutput {
                        event_id,
                        status: "duplicate".to_string(),
                        version: None,
                        error: None,
                    },
                    Err(rejection) => {
                        rejected += 1;
                        SubmitOutput {
                            event_id: rejection.event_id.clone(),
                            status: "rejected".to_string(),
                            version: None,
                            error: Some(rejection.to_string()),
                        }
                    }
                };
                outputs.push(output);
            }

            println!("{}", format_output(&outputs, &format)?);
            if rejected > 0 {
                return Err(Error::MalformedInput(format!(
                    "{} of {} usage events rejected",
                    rejected,
                    events.len()
                )));
            }
            Ok(())
        }

        Commands::Report {
            organization_id,
            time,
            resolution,
        } => {
            catch_up(&config)?;
            let time = time.unwrap_or_else(metering_engine::current_timestamp);
            let report = engine(&config).report(&organization_id, time, resolution)?;
            println!("{}", format_output(&report, &format)?);
            Ok(())
        }

        Commands::Plans => {
            let registry = FormulaRegistry::with_defaults();
            let mut plans = Vec::new();
            for plan_id in registry.plan_ids() {
                for plan in registry.versions(plan_id) {
                    plans.push(PlanOutput {
                        plan_id: plan.plan_id.clone(),
                        effective: plan.effective,
                        measures: plan.measures.iter().map(|m| m.name.clone()).collect(),
                        metrics: plan
                            .metrics
                            .iter()
                            .map(|m| format!("{} ({})", m.name, m.unit))
                            .collect(),
                    });
                }
            }
            println!("{}", format_output(&plans, &format)?);
            Ok(())
        }

        Commands::Replay => {
            let applied = catch_up(&config)?;
            println!("✓ Replayed {} usage events", applied);
            Ok(())
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct SubmitOutput {
    event_id: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct PlanOutput {
    plan_id: String,
    effective: i64,
    measures: Vec<String>,
    metrics: Vec<String>,
}
