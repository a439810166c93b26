//! Serializes spawn outcomes back over the control channel.
//!
//! A success is the status token, the worker tuple, then the diagnostic
//! descriptor; a failure is the status token and the error tuple, with no
//! descriptor. The descriptor send immediately follows the tuple on the same
//! stream, so the requester can associate it with the reply it belongs to.

use std::os::fd::AsFd;

use crate::channel::transport::{ChannelError, ChannelTransport};
use crate::error::SpawnError;
use crate::spawn::SpawnedWorker;

pub const STATUS_OK: &str = "ok";
pub const STATUS_ERROR: &str = "error";

/// Write a success reply. Consumes the worker handle; the manager's copy of
/// the diagnostic descriptor is released once it has been transmitted.
pub async fn write_success(
    channel: &mut ChannelTransport,
    worker: SpawnedWorker,
) -> Result<(), ChannelError> {
    let pid = worker.pid.to_string();
    let is_unix = if worker.socket_is_unix { "true" } else { "false" };

    channel.write_message(&[STATUS_OK]).await?;
    channel
        .write_message(&[pid.as_str(), worker.socket_path.as_str(), is_unix])
        .await?;
    channel.send_descriptor(worker.diagnostic_fd.as_fd()).await?;

    tracing::debug!(pid = worker.pid, socket = %worker.socket_path, "Success reply sent");
    Ok(())
}

/// Write a failure reply: the error's kind token and its message.
pub async fn write_failure(
    channel: &mut ChannelTransport,
    error: &SpawnError,
) -> Result<(), ChannelError> {
    channel.write_message(&[STATUS_ERROR]).await?;
    channel
        .write_message(&[error.kind(), error.to_string().as_str()])
        .await?;

    tracing::debug!(kind = error.kind(), "Failure reply sent");
    Ok(())
}
