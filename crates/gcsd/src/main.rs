//! gcsd: the GCS store daemon.
//!
//! Serves the embedded backing store (redb keyspace + pub/sub broker) to
//! GCS clients over TCP, and offers a couple of operator commands that
//! talk to a running store through the regular client.
//!
//! # Usage
//!
//! ```text
//! gcsd serve --port 6379 --data-dir /var/lib/gcs
//! gcsd serve --in-memory
//! gcsd ping --config gcs.toml
//! gcsd members --host 10.0.0.5 --port 6379
//! gcsd show-config
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use gcs_client::{new_event_loop, AsyncGcsClient, EventLoop, Fatal, OpContext, Table};
use gcs_core::{ClientId, ClientTableData, GcsConfig, JobId};
use gcs_store::protocol::{Command as StoreCommand, Outcome};
use gcs_store::{StoreEngine, StoreServer};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "gcsd", about = "GCS store daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Target {
    /// Configuration file; flags override its `[store]` section.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store host.
    #[arg(long)]
    host: Option<String>,

    /// Store port.
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the store server.
    Serve {
        #[command(flatten)]
        target: Target,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/gcs", conflicts_with = "in_memory")]
        data_dir: PathBuf,

        /// Keep all state in memory; nothing survives a restart.
        #[arg(long)]
        in_memory: bool,
    },
    /// Check that a store answers.
    Ping {
        #[command(flatten)]
        target: Target,
    },
    /// List the cluster members recorded in a store.
    Members {
        #[command(flatten)]
        target: Target,
    },
    /// Print the effective configuration as TOML.
    ShowConfig {
        #[command(flatten)]
        target: Target,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gcsd=debug,gcs=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            target,
            data_dir,
            in_memory,
        } => {
            let config = load_config(&target)?;
            run_serve(&config, &data_dir, in_memory).await
        }
        Command::Ping { target } => {
            let config = load_config(&target)?;
            tokio::task::spawn_blocking(move || run_ping(&config)).await?
        }
        Command::Members { target } => {
            let config = load_config(&target)?;
            tokio::task::spawn_blocking(move || run_members(&config)).await?
        }
        Command::ShowConfig { target } => {
            print!("{}", load_config(&target)?.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(target: &Target) -> anyhow::Result<GcsConfig> {
    let mut config = match &target.config {
        Some(path) => GcsConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => GcsConfig::default(),
    };
    if let Some(host) = &target.host {
        config.store.host = host.clone();
    }
    if let Some(port) = target.port {
        config.store.port = port;
    }
    Ok(config)
}

async fn run_serve(config: &GcsConfig, data_dir: &Path, in_memory: bool) -> anyhow::Result<()> {
    info!("GCS store daemon starting");

    let engine = if in_memory {
        info!("using in-memory store");
        StoreEngine::open_in_memory()?
    } else {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("gcs.redb");
        let engine = StoreEngine::open(&db_path)?;
        info!(path = ?db_path, "store opened");
        engine
    };

    let addr = config.store.address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let server = Arc::new(StoreServer::new(engine));
    server.serve(listener, shutdown_rx).await?;

    info!("GCS store daemon stopped");
    Ok(())
}

/// Connect a client, attach it to the configured loop backend, and run the
/// loop until `submit`'s request stops it or `timeout` passes.
fn with_client(
    config: &GcsConfig,
    timeout: Duration,
    submit: impl FnOnce(&AsyncGcsClient, Arc<dyn EventLoop>) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let client = AsyncGcsClient::with_config(config.clone());
    client.connect_with_config()?;

    let event_loop = new_event_loop(config.client.event_loop)?;
    client.attach(Arc::clone(&event_loop))?;

    // First failure wins: a fatal fault or the watchdog.
    let failure: Arc<Mutex<Option<String>>> = Arc::default();
    {
        let event_loop = Arc::clone(&event_loop);
        let failure = Arc::clone(&failure);
        client.set_fatal_handler(Arc::new(move |fatal: &Fatal| {
            failure
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get_or_insert_with(|| fatal.to_string());
            event_loop.stop();
        }));
    }
    let watchdog = {
        let stop = Arc::clone(&event_loop);
        let failure = Arc::clone(&failure);
        let address = config.store.address();
        event_loop.add_timer(
            timeout,
            Box::new(move || {
                failure
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get_or_insert_with(|| {
                        format!("store at {address} did not answer within {timeout:?}")
                    });
                stop.stop();
            }),
        )
    };

    submit(&client, Arc::clone(&event_loop))?;
    event_loop.run();
    event_loop.cancel_timer(watchdog);
    drop(client);

    if let Some(reason) = failure.lock().unwrap_or_else(|e| e.into_inner()).take() {
        anyhow::bail!(reason);
    }
    Ok(())
}

fn run_ping(config: &GcsConfig) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    with_client(config, config.store.connect_timeout(), |client, event_loop| {
        client.connection().request(
            StoreCommand::Ping,
            OpContext::new("ping"),
            Box::new(move |outcome: Outcome| {
                event_loop.stop();
                match outcome {
                    Outcome::Pong => Ok(()),
                    other => Err(format!("unexpected reply to ping: {other:?}")),
                }
            }),
        )?;
        Ok(())
    })?;
    println!(
        "store at {} answered in {:?}",
        config.store.address(),
        started.elapsed()
    );
    Ok(())
}

fn run_members(config: &GcsConfig) -> anyhow::Result<()> {
    let members: Arc<Mutex<Vec<(ClientId, ClientTableData)>>> = Arc::default();
    {
        let members = Arc::clone(&members);
        with_client(config, config.store.connect_timeout(), move |client, event_loop| {
            let table: Table<ClientId, ClientTableData> = Table::new(client.connection().clone());
            table.lookup_all(&JobId::nil(), move |records| {
                *members.lock().unwrap_or_else(|e| e.into_inner()) = records;
                event_loop.stop();
            })?;
            Ok(())
        })?;
    }

    let members = members.lock().unwrap_or_else(|e| e.into_inner());
    if members.is_empty() {
        println!("no members recorded");
    }
    for (client_id, member) in members.iter() {
        let status = if member.is_insertion { "alive" } else { "removed" };
        println!(
            "{}  {:<7}  {}  node_manager={}  object_manager={}",
            client_id,
            status,
            member.node_manager_address,
            member.node_manager_port,
            member.object_manager_port
        );
    }
    Ok(())
}
