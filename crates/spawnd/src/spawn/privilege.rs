//! Effective-identity resolution for privilege lowering.
//!
//! The owner of the application root is preferred; when that owner is root
//! or cannot be resolved, the request's `lowest_user` is the fallback. A
//! fallback user that does not exist is a hard failure: the spawn must not
//! silently keep the manager's privileges.

use std::path::Path;

use crate::error::SpawnError;

/// Identity a worker process runs as after a privilege drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub uid: u32,
    pub gid: u32,
}

/// Maps a spawn request's privilege inputs to a concrete identity.
pub trait PrivilegeResolver: Send + Sync {
    fn resolve(&self, app_root: &Path, lowest_user: &str) -> Result<WorkerIdentity, SpawnError>;
}

/// Resolves identities through the system user database.
pub struct SystemPrivilegeResolver;

impl PrivilegeResolver for SystemPrivilegeResolver {
    fn resolve(&self, app_root: &Path, lowest_user: &str) -> Result<WorkerIdentity, SpawnError> {
        use std::os::unix::fs::MetadataExt;

        if let Ok(metadata) = std::fs::metadata(app_root) {
            let owner_uid = metadata.uid();
            if owner_uid != 0
                && let Ok(Some(owner)) =
                    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(owner_uid))
            {
                tracing::debug!(
                    user = %owner.name,
                    uid = owner_uid,
                    "Resolved worker identity from app root owner"
                );
                return Ok(WorkerIdentity {
                    uid: owner.uid.as_raw(),
                    gid: owner.gid.as_raw(),
                });
            }
        }

        match nix::unistd::User::from_name(lowest_user) {
            Ok(Some(user)) => {
                tracing::debug!(user = %user.name, "Resolved worker identity from fallback user");
                Ok(WorkerIdentity {
                    uid: user.uid.as_raw(),
                    gid: user.gid.as_raw(),
                })
            }
            Ok(None) => Err(SpawnError::PrivilegeDropFailed {
                reason: format!("fallback user '{lowest_user}' does not exist"),
            }),
            Err(e) => Err(SpawnError::PrivilegeDropFailed {
                reason: format!("lookup of fallback user '{lowest_user}' failed: {e}"),
            }),
        }
    }
}
