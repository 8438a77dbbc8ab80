//! Supervisor front-end: parse flags, load the configuration file, hand
//! the resolved config to the engine and run until signalled.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use tracing::info;

use pgvault::conf::{EngineConf, EngineState};
use pgvault::supervisor::Supervisor;
use utils::logging::{self, LogFormat};

#[derive(Parser)]
#[command(name = "pgvault", about = "PostgreSQL physical backup engine", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Utf8PathBuf,

    /// Log output format: plain or json.
    #[arg(long, default_value = "plain")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(LogFormat::from_config(&args.log_format)?)?;

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config file {}", args.config))?;
    let conf: EngineConf =
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", args.config))?;
    anyhow::ensure!(!conf.servers.is_empty(), "no servers configured");

    let state = EngineState::new(conf);
    let supervisor = Supervisor::new(state);
    let cancel = supervisor.cancel_token();

    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("signal handler");
        let mut int = signal(SignalKind::interrupt()).expect("signal handler");
        tokio::select! {
            _ = term.recv() => info!("received SIGTERM"),
            _ = int.recv() => info!("received SIGINT"),
        }
        cancel.cancel();
    });

    supervisor.run().await?;
    Ok(())
}
