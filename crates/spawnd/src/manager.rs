//! Manager serve loop: owns the channel, sequences decode, spawn, respond.
//!
//! One request is fully processed before the next is read; every request
//! yields exactly one reply. Request-local failures become error replies and
//! the loop keeps serving. Channel failures end the loop.

use std::sync::Arc;

use crate::channel::protocol::SpawnRequest;
use crate::channel::transport::{ChannelError, ChannelTransport};
use crate::reply;
use crate::spawn::WorkerSpawner;

/// Lifecycle state of the manager, observable for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Decoding,
    Spawning,
    Responding,
    Stopped,
}

/// Long-lived owner of the control channel.
///
/// Constructed once at process start with the pre-opened channel and the
/// spawner capability; torn down exactly once via [`cleanup`].
///
/// [`cleanup`]: Self::cleanup
pub struct SpawnManager {
    channel: Option<ChannelTransport>,
    spawner: Arc<dyn WorkerSpawner>,
    state: ManagerState,
}

impl SpawnManager {
    pub fn new(channel: ChannelTransport, spawner: Arc<dyn WorkerSpawner>) -> Self {
        Self {
            channel: Some(channel),
            spawner,
            state: ManagerState::Idle,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// Serve requests until the peer closes the channel or a channel error
    /// occurs. Requests are handled strictly one at a time.
    pub async fn start_synchronously(&mut self) -> Result<(), ChannelError> {
        let result = self.serve().await;
        self.state = ManagerState::Stopped;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Serve loop terminated");
        }
        result
    }

    async fn serve(&mut self) -> Result<(), ChannelError> {
        loop {
            self.state = ManagerState::Idle;
            let channel = self.channel.as_mut().ok_or(ChannelError::Closed)?;
            let Some(fields) = channel.read_message().await? else {
                tracing::info!("Channel closed by peer, stopping");
                return Ok(());
            };

            self.state = ManagerState::Decoding;
            let request = match SpawnRequest::decode(&fields) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(kind = e.kind(), error = %e, "Rejected spawn request");
                    self.state = ManagerState::Responding;
                    let channel = self.channel.as_mut().ok_or(ChannelError::Closed)?;
                    reply::write_failure(channel, &e).await?;
                    continue;
                }
            };

            self.state = ManagerState::Spawning;
            tracing::info!(
                app_root = %request.app_root.display(),
                method = %request.spawn_method,
                app_type = %request.app_type,
                "Handling spawn request"
            );
            let outcome = self.spawner.spawn(&request).await;

            self.state = ManagerState::Responding;
            let channel = self.channel.as_mut().ok_or(ChannelError::Closed)?;
            match outcome {
                Ok(worker) => reply::write_success(channel, worker).await?,
                Err(e) => {
                    tracing::warn!(kind = e.kind(), error = %e, "Spawn failed");
                    reply::write_failure(channel, &e).await?;
                }
            }
        }
    }

    /// Release the channel handle. Safe to call repeatedly; a second call
    /// finds nothing to close.
    pub fn cleanup(&mut self) {
        if self.channel.take().is_some() {
            tracing::debug!("Channel handle released");
        }
        self.state = ManagerState::Stopped;
    }
}
