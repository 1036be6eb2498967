use clap::{Args, Parser, Subcommand};
use loadmaster::config::{parse_stage, Options};
use loadmaster::error::{ConfigError, RunError};
use loadmaster::scenario::Scenario;
use loadmaster::types::parse_duration;
use loadmaster::{output, LoadTestExecutor};
use log::{error, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

const EXIT_THRESHOLDS_FAILED: u8 = 99;
const EXIT_INVALID_CONFIG: u8 = 104;
const EXIT_RUN_ABORTED: u8 = 107;

#[derive(Parser, Debug)]
#[command(name = "loadmaster")]
#[command(about = "Staged HTTP load generator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scenario file
    Run {
        scenario: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the consolidated options of a scenario without running it
    Inspect {
        scenario: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Command-line flags override the scenario file and the environment.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Replaces the scenario's stages; repeat for several stages
    #[arg(long = "stage", value_name = "DURATION:TARGET")]
    stages: Vec<String>,

    /// Hard cap on concurrent VUs
    #[arg(long)]
    vus_max: Option<u64>,

    /// Default per-request timeout, e.g. 30s
    #[arg(long)]
    http_timeout: Option<String>,

    /// How long in-flight iterations may run once draining starts
    #[arg(long)]
    grace_period: Option<String>,

    /// Abort once more than N iterations fail in a row
    #[arg(long, value_name = "N")]
    abort_on_consecutive_failures: Option<u64>,

    /// Write the JSON summary to this file
    #[arg(long)]
    summary_export: Option<PathBuf>,

    /// Write the summary in Prometheus text format to this file
    #[arg(long)]
    prometheus_export: Option<PathBuf>,

    /// Push the summary to this Pushgateway
    #[arg(long)]
    pushgateway_url: Option<String>,

    /// Publish progress and the summary to this AMQP broker
    #[arg(long)]
    amqp_url: Option<String>,

    #[arg(long)]
    amqp_queue: Option<String>,
}

impl Overrides {
    fn apply(&self, options: &mut Options) -> Result<(), ConfigError> {
        if !self.stages.is_empty() {
            options.stages = self
                .stages
                .iter()
                .map(|s| parse_stage(s))
                .collect::<Result<_, _>>()?;
        }
        if let Some(vus) = self.vus_max {
            options.max_vus = Some(vus);
        }
        if let Some(timeout) = &self.http_timeout {
            options.http_timeout = flag_duration("--http-timeout", timeout)?;
        }
        if let Some(grace) = &self.grace_period {
            options.grace_period = flag_duration("--grace-period", grace)?;
        }
        if let Some(limit) = self.abort_on_consecutive_failures {
            options.abort_on_consecutive_failures = Some(limit);
        }
        if let Some(path) = &self.summary_export {
            options.summary_export = Some(path.clone());
        }
        if let Some(path) = &self.prometheus_export {
            options.prometheus_export = Some(path.clone());
        }
        if let Some(url) = &self.pushgateway_url {
            options.pushgateway_url = Some(url.clone());
        }
        if let Some(url) = &self.amqp_url {
            options.amqp_url = Some(url.clone());
        }
        if let Some(queue) = &self.amqp_queue {
            options.amqp_queue = queue.clone();
        }
        Ok(())
    }
}

fn flag_duration(flag: &str, value: &str) -> Result<std::time::Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidValue {
        name: flag.to_string(),
        value: value.to_string(),
        reason: "not a duration".to_string(),
    })
}

/// Scenario file, then `LOADMASTER_*` variables, then flags.
fn load(path: &Path, overrides: &Overrides) -> Result<Scenario, ConfigError> {
    let mut scenario = Scenario::from_file(path)?;
    let env: HashMap<String, String> = std::env::vars().collect();
    scenario.options.apply_env(&env)?;
    overrides.apply(&mut scenario.options)?;
    scenario.options.validate()?;
    Ok(scenario)
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Inspect {
            scenario,
            overrides,
        } => match load(&scenario, &overrides) {
            Ok(loaded) => match serde_json::to_string_pretty(&loaded.options) {
                Ok(json) => {
                    println!("{}", json);
                    info!("📄 {} steps per iteration", loaded.script.steps().len());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!("❌ Failed to render options: {}", e);
                    ExitCode::FAILURE
                }
            },
            Err(e) => {
                error!("❌ Invalid configuration: {}", e);
                ExitCode::from(EXIT_INVALID_CONFIG)
            }
        },
        Command::Run {
            scenario,
            overrides,
        } => {
            let loaded = match load(&scenario, &overrides) {
                Ok(loaded) => loaded,
                Err(e) => {
                    error!("❌ Invalid configuration: {}", e);
                    return ExitCode::from(EXIT_INVALID_CONFIG);
                }
            };
            info!("🚀 LoadMaster starting {}", scenario.display());

            let outputs = match output::from_options(&loaded.options) {
                Ok(outputs) => outputs,
                Err(e) => {
                    error!("❌ Invalid output configuration: {}", e);
                    return ExitCode::from(EXIT_INVALID_CONFIG);
                }
            };
            let executor = LoadTestExecutor::new(loaded.options, Arc::new(loaded.script))
                .with_outputs(outputs);
            match executor.execute().await {
                Ok(summary) if summary.thresholds_passed() => ExitCode::SUCCESS,
                Ok(_) => {
                    error!("❌ Some thresholds have failed");
                    ExitCode::from(EXIT_THRESHOLDS_FAILED)
                }
                Err(RunError::Config(e)) => {
                    error!("❌ Invalid configuration: {}", e);
                    ExitCode::from(EXIT_INVALID_CONFIG)
                }
                Err(e) => {
                    error!("❌ {}", e);
                    ExitCode::from(EXIT_RUN_ABORTED)
                }
            }
        }
    }
}
