//! Worker spawning: privilege resolution, framework preparation, and
//! process launch.

mod loader;
mod privilege;
mod spawner;

pub use loader::{AppLoader, FilesystemAppLoader, PrepareError};
pub use privilege::{PrivilegeResolver, SystemPrivilegeResolver, WorkerIdentity};
pub use spawner::{
    ProcessSpawner, SpawnedWorker, SpawnerConfig, WORKER_LISTENER_FD, WorkerSpawner,
};
