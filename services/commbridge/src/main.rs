//! Commbridge service binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use commbridge::bootstrap::{build_service, configure_all};
use commbridge::{AppConfig, Variable, VariableIds};
use common::{init_with_config, wait_for_shutdown, LogConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "commbridge", version, about = "Modbus-TCP / S7 polling bridge")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, env = "COMMBRIDGE_CONFIG", default_value = "config/commbridge.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Directory for rolling log files; overrides the config file
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    validate: bool,
}

fn log_config(args: &Args, config: &AppConfig) -> anyhow::Result<LogConfig> {
    let logging = &config.service.logging;
    let level = args.log_level.as_deref().unwrap_or(&logging.level);
    let level: Level = level
        .parse()
        .with_context(|| format!("invalid log level '{}'", level))?;

    Ok(LogConfig {
        service_name: config.service.name.clone(),
        log_dir: args.log_dir.clone().or_else(|| logging.dir.clone()),
        level,
        enable_json: logging.json,
        ..LogConfig::default()
    })
}

/// Log every value change until `token` is cancelled
fn watch_values(variables: Vec<Arc<Variable>>, token: CancellationToken) {
    for variable in variables {
        let mut rx = variable.subscribe();
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!(variable = %variable.name(), "value changed: {}", variable);
                    },
                }
            }
        });
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_with_config(log_config(&args, &config)?)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;
    config.validate()?;

    if args.validate {
        info!(
            "Configuration {} is valid: {} protocols, {} variables",
            args.config.display(),
            config.protocols.len(),
            config.variables.len()
        );
        return Ok(());
    }

    let ids = VariableIds::new();
    let service = build_service(&config, &ids);

    let token = CancellationToken::new();

    let connected = configure_all(&service, &config).await;
    info!(
        "{}/{} protocols connected",
        connected,
        config.protocols.len()
    );

    watch_values(service.variables(), token.clone());

    if !service.start_polling(config.poll_interval()) {
        anyhow::bail!("failed to start polling");
    }

    let signal = wait_for_shutdown().await;
    info!("Received {:?}, shutting down", signal);

    service.stop_polling().await;
    service.disconnect_all().await;
    token.cancel();

    info!("Commbridge stopped");
    Ok(())
}
