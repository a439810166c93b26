//! Manager binary: serves spawn requests over the channel inherited from the
//! parent process.

use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

use anyhow::Context;

use spawnd::channel::transport::ChannelTransport;
use spawnd::manager::SpawnManager;
use spawnd::spawn::{FilesystemAppLoader, ProcessSpawner, SpawnerConfig, SystemPrivilegeResolver};

/// Descriptor number the parent process passes the control channel on.
const DEFAULT_CHANNEL_FD: i32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Safety: fd 3 is opened for us by the parent process per the startup
    // contract; nothing else in this process owns it.
    let channel_fd = unsafe { OwnedFd::from_raw_fd(DEFAULT_CHANNEL_FD) };
    let channel = ChannelTransport::from_owned_fd(channel_fd)
        .context("control channel descriptor is not a usable stream socket")?;

    let spawner = Arc::new(ProcessSpawner::new(
        Arc::new(SystemPrivilegeResolver),
        Arc::new(FilesystemAppLoader),
        SpawnerConfig::default(),
    ));
    let mut manager = SpawnManager::new(channel, spawner);

    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = manager.start_synchronously() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Manager stopped on channel error");
            }
        }
        _ = terminate.recv() => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }

    manager.cleanup();
    Ok(())
}
