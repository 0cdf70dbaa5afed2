//! tbus device host entry point.
//!
//! Loads the host config, builds the device tree it describes, and serves it
//! to masters over TCP.  With `--remote` the tree's root device is instead
//! announced to another host's device acceptor and joins that host's bus.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ HostConfig::load()          -- TOML file, defaults when missing
//!  └─ build_device_tree()         -- root bus and everything nested below it
//!  └─ run_device_acceptor()       -- optional, remote devices join the root bus
//!  └─ run_server()                -- accept loop, one master at a time
//!       └─ HostPort per connection
//!  or
//!  └─ attach_remote()             -- --remote: serve the root on another bus
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tbus_device::config::HostConfig;
use tbus_device::server::{attach_remote, run_device_acceptor, run_server};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// tbus device host.
///
/// Serves a tree of buses and devices to a tbus master over TCP.
#[derive(Debug, Parser)]
#[command(name = "tbus-host", about = "Serves a tbus device tree over TCP", version)]
struct Cli {
    /// Path to the TOML host configuration.
    #[arg(long, short, default_value = "tbus-host.toml", env = "TBUS_HOST_CONFIG")]
    config: PathBuf,

    /// Overrides `server.bind_address` from the config file.
    #[arg(long, env = "TBUS_HOST_BIND")]
    bind: Option<String>,

    /// Join the bus of the host whose device acceptor is at this `host:port`
    /// instead of serving masters.
    #[arg(long, env = "TBUS_HOST_REMOTE", conflicts_with = "bind")]
    remote: Option<String>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = HostConfig::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }

    let tree = config
        .build_device_tree()
        .context("failed to build device tree")?;
    info!(
        "device tree ready: bus {} with {} device(s) attached, {} in total",
        tree.root.device_id(),
        tree.bus.enumerate().len(),
        config.bus.device_count()
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    if let Some(remote) = cli.remote {
        attach_remote(&remote, tree.root, &running)
            .await
            .with_context(|| format!("remote bus {remote} failed"))?;
        return Ok(());
    }

    if let Some(addr) = &config.server.device_bind_address {
        let devices = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let (bus, flag) = (Arc::clone(&tree.bus), Arc::clone(&running));
        tokio::spawn(async move {
            if let Err(e) = run_device_acceptor(devices, bus, flag).await {
                tracing::error!("remote device acceptor failed: {e}");
            }
        });
    }

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind_address))?;

    run_server(listener, tree.root, running).await?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
