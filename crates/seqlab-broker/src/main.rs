use std::path::PathBuf;

use clap::Parser;
use log::{error, info};

use seqlab_broker::auth::{CredentialVerifier, FileBackend, ShadowBackend};
use seqlab_broker::config::{AuthBackendKind, BrokerConfig};
use seqlab_broker::describe::CommandCatalog;
use seqlab_broker::dispatch::Broker;
use seqlab_broker::privilege::PrivilegeMode;

/// Privileged one-shot operation broker. Serves exactly one framed
/// request on stdin/stdout, then exits.
#[derive(Parser, Debug)]
#[command(name = "seqlab-broker", version, about)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long, env = "SEQLAB_BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `seqlab_broker=debug`. Logs go to
    /// stderr; stdout is the transport.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    env_logger::Builder::new()
        .parse_filters(&cli.log_level)
        .target(env_logger::Target::Stderr)
        .init();

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let cfg = match BrokerConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("startup: {e:#}");
            return 1;
        }
    };

    let mode = match PrivilegeMode::from_config(cfg.allow_unprivileged) {
        Ok(mode) => mode,
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };

    let verifier: Box<dyn CredentialVerifier> = match cfg.auth.backend {
        AuthBackendKind::Shadow => Box::new(ShadowBackend::new()),
        AuthBackendKind::File => match cfg.auth.file_path.clone() {
            Some(path) => Box::new(FileBackend::new(path)),
            None => {
                error!("auth backend 'file' requires auth.file_path");
                return 1;
            }
        },
    };
    let catalog = CommandCatalog::new(&cfg.describe, cfg.exec_timeout());

    let broker = Broker::new(
        tokio::io::stdin(),
        tokio::io::stdout(),
        cfg,
        verifier,
        catalog,
        mode,
    );
    match broker.run().await {
        Ok(()) => {
            info!("request served");
            0
        }
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}
