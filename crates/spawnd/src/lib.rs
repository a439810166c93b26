//! spawnd: spawn manager for application worker processes.

pub mod channel;
pub mod error;
pub mod manager;
pub mod reply;
pub mod spawn;

pub use channel::protocol::{AppType, SpawnMethod, SpawnRequest};
pub use channel::transport::{ChannelError, ChannelTransport};
pub use error::{SpawnError, SpawnStage};
pub use manager::{ManagerState, SpawnManager};
pub use spawn::{
    AppLoader, FilesystemAppLoader, PrivilegeResolver, ProcessSpawner, SpawnedWorker,
    SpawnerConfig, SystemPrivilegeResolver, WorkerIdentity, WorkerSpawner,
};
