//! Framework preparation for application roots.
//!
//! Preparation is the stage bounded by the request's framework timeout: the
//! work a spawn method may cache (smart) or redo per worker (conservative).

use std::path::Path;

use async_trait::async_trait;

use crate::channel::protocol::AppType;

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("app root '{0}' is not a directory")]
    MissingAppRoot(String),

    #[error("app root '{app_root}' has no {entry}")]
    MissingEntryFile {
        app_root: String,
        entry: &'static str,
    },
}

/// Framework preparation step run before a worker launch.
#[async_trait]
pub trait AppLoader: Send + Sync {
    async fn prepare(&self, app_root: &Path, app_type: AppType) -> Result<(), PrepareError>;
}

/// Validates the app root layout on the local filesystem.
pub struct FilesystemAppLoader;

#[async_trait]
impl AppLoader for FilesystemAppLoader {
    async fn prepare(&self, app_root: &Path, app_type: AppType) -> Result<(), PrepareError> {
        if !app_root.is_dir() {
            return Err(PrepareError::MissingAppRoot(
                app_root.display().to_string(),
            ));
        }

        let entry = app_root.join(app_type.entry_file());
        if !entry.is_file() {
            return Err(PrepareError::MissingEntryFile {
                app_root: app_root.display().to_string(),
                entry: app_type.entry_file(),
            });
        }

        tracing::debug!(
            app_root = %app_root.display(),
            %app_type,
            "App root prepared"
        );
        Ok(())
    }
}
