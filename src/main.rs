use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use devsim::config::DEFAULT_CONFIG_PATH;
use devsim::{ConfigStore, Context, Result, Settings, Supervisor};

#[derive(Parser)]
#[command(name = "devsim")]
#[command(author, version, about = "A network endpoint simulator", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    file: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every enabled protocol until interrupted
    Run,
    /// Print the resolved settings as JSON
    ShowConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    if let Err(error) = run(cli).await {
        error!("{}", error);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let store = ConfigStore::load(&cli.file)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting device simulator with config: {:?}", cli.file);
            let mut ctx = Context::new(store);
            loop {
                if ctx.settings.dhcp.enabled || ctx.settings.upnp.enabled {
                    let interface = ctx.interface()?;
                    info!(
                        "Using interface {} (index {}, mac {:?}, ipv4 {:?})",
                        interface.name, interface.index, interface.mac, interface.ipv4
                    );
                }

                let mut supervisor = Supervisor::start(ctx.clone())?;
                let signal = supervisor.run_until(next_signal()).await;
                supervisor.shutdown().await;

                match signal? {
                    Signal::Shutdown => {
                        info!("Received shutdown signal, simulator stopped");
                        return Ok(());
                    }
                    Signal::Reload => {
                        info!("Received SIGHUP, restarting with reloaded configuration");
                        ctx = ctx.reload();
                    }
                }
            }
        }
        Commands::ShowConfig => {
            let settings = Settings::from_store(&store);
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

enum Signal {
    Shutdown,
    Reload,
}

async fn next_signal() -> Signal {
    #[cfg(unix)]
    let hangup = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!("Failed to listen for SIGHUP: {}", error);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = shutdown_signal() => Signal::Shutdown,
        _ = hangup => Signal::Reload,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", error);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!("Failed to listen for SIGTERM: {}", error);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
