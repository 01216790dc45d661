use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use parley_core::config::{Config, LoggingConfig};
use parley_gateway::GatewayState;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Real-time voice conversation gateway",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the voice gateway
    Serve {
        /// Port to listen on (default: 8000)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration summary and probe a running gateway
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Check configuration and report missing credentials
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(|p| PathBuf::from(shellexpand::tilde(&p).into_owned()))
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    init_logging(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or_else(|| config.gateway_port());
            let config = Arc::new(config);
            report_validation(&config);

            #[allow(unused_mut)]
            let mut state = GatewayState::from_config(config)?;
            #[cfg(feature = "metrics")]
            {
                state.prometheus = Some(parley_gateway::metrics::install_prometheus_recorder()?);
            }

            tracing::info!(
                config = %config_path.display(),
                "Starting Parley gateway on port {port}"
            );
            parley_gateway::start_gateway(Arc::new(state), port).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for w in &warnings {
                    println!("warning: {w}");
                }
                for e in &errors {
                    println!("error: {e}");
                }
                let report = config.environment_report();
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !errors.is_empty() {
                    anyhow::bail!("configuration has {} error(s)", errors.len());
                }
                if warnings.is_empty() {
                    println!("Configuration OK");
                }
            }
        },
        Commands::Status => {
            println!("Parley v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Gateway: {}:{}", config.gateway_bind(), config.gateway_port());
            println!("Store: {:?}", config.store().kind);
            println!("Default model: {}", config.default_model());
            match probe_health(&config).await {
                Ok(body) => {
                    println!("Status: running");
                    println!(
                        "Active sessions: {}",
                        body["active_sessions"].as_u64().unwrap_or(0)
                    );
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Health probe failed");
                    println!("Status: not running");
                }
            }
        }
    }

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over config; `--verbose` wins over both.
fn init_logging(logging: Option<&LoggingConfig>, verbose: bool) {
    let defaults = LoggingConfig::default();
    let logging = logging.unwrap_or(&defaults);

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let mut directives = vec![logging.level.clone().unwrap_or_else(|| "info".into())];
            directives.extend(logging.filters.iter().cloned());
            EnvFilter::new(directives.join(","))
        })
    };

    let writer = match logging.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn report_validation(config: &Config) {
    let (warnings, errors) = config.validate();
    for w in warnings {
        tracing::warn!("{w}");
    }
    for e in errors {
        tracing::error!("{e}");
    }
}

async fn probe_health(config: &Config) -> anyhow::Result<serde_json::Value> {
    let host = match config.gateway_bind().as_str() {
        "0.0.0.0" => "127.0.0.1".to_string(),
        other => other.to_string(),
    };
    let url = format!("http://{host}:{}/health", config.gateway_port());
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    let body = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(body)
}
