use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::watch;

use gator::commands::{self, Command, State};
use gator::config::{self, Session};
use gator::feed::build_http_client;
use gator::storage::{Database, DatabaseError};

#[derive(Parser, Debug)]
#[command(name = "gator", about = "Multi-user RSS feed aggregator")]
struct Args {
    /// Session file (default: ~/.gatorconfig.json)
    #[arg(long, value_name = "FILE", env = "GATOR_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Resolve on the first SIGINT or SIGTERM.
async fn watch_signals() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down gracefully"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl-C, shutting down gracefully");
    }

    Ok(())
}

/// Flip `shutdown` to `true` once `signals` resolves.
///
/// If the handlers could not be installed the sender is held open forever,
/// since a dropped sender would stop the workers straight away.
async fn relay_shutdown<F>(shutdown: watch::Sender<bool>, signals: F)
where
    F: std::future::Future<Output = Result<()>>,
{
    match signals.await {
        Ok(()) => {
            let _ = shutdown.send(true);
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install signal handlers");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => config::default_path().context("HOME environment variable not set")?,
    };
    let session = Session::load(&config_path).with_context(|| {
        format!(
            "Failed to read session file '{}': create it with {{\"db_url\": \"<path to gator.db>\"}}",
            config_path.display()
        )
    })?;

    let db = match Database::open(session.db_url()).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: The gator database is locked by another process. Please try again.");
            std::process::exit(1);
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "Failed to open database '{}': {}",
                session.db_url(),
                e
            ));
        }
    };

    let client = build_http_client().context("Failed to create HTTP client")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = tokio::spawn(relay_shutdown(shutdown_tx, watch_signals()));

    let mut state = State {
        session,
        db,
        client,
        shutdown: shutdown_rx,
    };

    let mut stdout = std::io::stdout().lock();
    let result = commands::run(args.command, &mut state, &mut stdout).await;
    signals.abort();

    result.map_err(anyhow::Error::from)
}
