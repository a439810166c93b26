//! Error taxonomy for spawn request processing.
//!
//! Every variant here is request-local: the manager converts it into an error
//! reply on the channel and keeps serving. Channel-level failures are a
//! separate type ([`crate::channel::transport::ChannelError`]) and stop the
//! serve loop.

use std::fmt;

/// Stage of the spawn sequence that a timeout occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnStage {
    /// Framework preparation (loading/caching the application framework).
    Framework,
    /// Application launch, up to the worker's readiness signal.
    App,
}

impl fmt::Display for SpawnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Framework => f.write_str("framework"),
            Self::App => f.write_str("app"),
        }
    }
}

/// Request-local spawn failures, each with a stable wire token.
///
/// `Display` renders the message sent to the requester; for timeouts that is
/// the `stage=` form so the requester can tell which budget was exceeded.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("{reason}")]
    MalformedRequest { reason: String },

    #[error("unrecognized spawn method '{token}'")]
    UnknownSpawnMethod { token: String },

    #[error("unrecognized app type '{token}'")]
    UnknownAppType { token: String },

    #[error("could not lower privileges: {reason}")]
    PrivilegeDropFailed { reason: String },

    #[error("stage={stage}")]
    SpawnTimeout { stage: SpawnStage },

    #[error("failed to launch application: {reason}")]
    AppLaunchFailed { reason: String },

    #[error("failed to bind worker socket: {reason}")]
    SocketBindFailed { reason: String },
}

impl SpawnError {
    /// Stable token identifying the error kind on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedRequest { .. } => "MalformedRequest",
            Self::UnknownSpawnMethod { .. } => "UnknownSpawnMethod",
            Self::UnknownAppType { .. } => "UnknownAppType",
            Self::PrivilegeDropFailed { .. } => "PrivilegeDropFailed",
            Self::SpawnTimeout { .. } => "SpawnTimeout",
            Self::AppLaunchFailed { .. } => "AppLaunchFailed",
            Self::SocketBindFailed { .. } => "SocketBindFailed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_the_stage() {
        insta::assert_snapshot!(
            SpawnError::SpawnTimeout {
                stage: SpawnStage::Framework
            }
            .to_string(),
            @"stage=framework"
        );
        insta::assert_snapshot!(
            SpawnError::SpawnTimeout {
                stage: SpawnStage::App
            }
            .to_string(),
            @"stage=app"
        );
    }

    #[test]
    fn kind_tokens_are_stable() {
        let cases = [
            (
                SpawnError::MalformedRequest {
                    reason: "x".into(),
                },
                "MalformedRequest",
            ),
            (
                SpawnError::UnknownSpawnMethod {
                    token: "x".into(),
                },
                "UnknownSpawnMethod",
            ),
            (
                SpawnError::UnknownAppType {
                    token: "x".into(),
                },
                "UnknownAppType",
            ),
            (
                SpawnError::PrivilegeDropFailed {
                    reason: "x".into(),
                },
                "PrivilegeDropFailed",
            ),
            (
                SpawnError::SpawnTimeout {
                    stage: SpawnStage::App,
                },
                "SpawnTimeout",
            ),
            (
                SpawnError::AppLaunchFailed {
                    reason: "x".into(),
                },
                "AppLaunchFailed",
            ),
            (
                SpawnError::SocketBindFailed {
                    reason: "x".into(),
                },
                "SocketBindFailed",
            ),
        ];
        for (error, kind) in cases {
            assert_eq!(error.kind(), kind);
        }
    }

    #[test]
    fn unknown_method_message_names_the_token() {
        insta::assert_snapshot!(
            SpawnError::UnknownSpawnMethod {
                token: "aggressive".into()
            }
            .to_string(),
            @"unrecognized spawn method 'aggressive'"
        );
    }
}
