//! Worker process launch: socket binding, privilege drop, readiness wait.
//!
//! The spawner binds the worker's listening socket itself (Unix-domain under
//! a per-manager directory, TCP loopback as fallback), maps it to a fixed
//! descriptor in the child, and waits for the worker to announce readiness
//! with one line on its stdout. The worker's stderr is kept as the
//! diagnostic stream handed back to the requester.

use std::collections::HashSet;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::channel::protocol::{AppType, SpawnMethod, SpawnRequest};
use crate::error::{SpawnError, SpawnStage};

use super::loader::AppLoader;
use super::privilege::{PrivilegeResolver, WorkerIdentity};

/// Fixed descriptor number the worker's listening socket is mapped to.
pub const WORKER_LISTENER_FD: i32 = 3;

/// A successfully launched worker, ready to accept connections.
#[derive(Debug)]
pub struct SpawnedWorker {
    pub pid: i32,
    pub socket_path: String,
    pub socket_is_unix: bool,
    /// Read end of the worker's stderr, forwarded to the requester.
    pub diagnostic_fd: OwnedFd,
}

/// Capability for launching one worker per request.
///
/// Tests substitute a fixed-response implementation instead of patching the
/// production spawner.
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedWorker, SpawnError>;
}

#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Directory the per-manager socket directory is created under.
    pub socket_dir: PathBuf,
    /// Override for the worker boot command; defaults to the app type's
    /// loader shim invoked with the app root.
    pub boot_command: Option<Vec<String>>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            socket_dir: std::env::temp_dir(),
            boot_command: None,
        }
    }
}

/// Production spawner: resolves privileges, prepares the framework, binds
/// the worker socket, and launches the app's entry point.
pub struct ProcessSpawner {
    privilege: Arc<dyn PrivilegeResolver>,
    loader: Arc<dyn AppLoader>,
    config: SpawnerConfig,
    /// App roots whose framework preparation already ran (smart reuse).
    prepared: StdMutex<HashSet<(PathBuf, AppType)>>,
    worker_seq: AtomicU64,
}

impl ProcessSpawner {
    pub fn new(
        privilege: Arc<dyn PrivilegeResolver>,
        loader: Arc<dyn AppLoader>,
        config: SpawnerConfig,
    ) -> Self {
        Self {
            privilege,
            loader,
            config,
            prepared: StdMutex::new(HashSet::new()),
            worker_seq: AtomicU64::new(0),
        }
    }

    async fn prepare_framework(&self, request: &SpawnRequest) -> Result<(), SpawnError> {
        let key = (request.app_root.clone(), request.app_type);

        match request.spawn_method {
            SpawnMethod::Direct => return Ok(()),
            SpawnMethod::Smart => {
                if self.prepared_cache().contains(&key) {
                    tracing::debug!(
                        app_root = %request.app_root.display(),
                        "Framework already prepared, reusing"
                    );
                    return Ok(());
                }
            }
            SpawnMethod::Conservative => {}
        }

        let prepared = tokio::time::timeout(
            request.framework_spawner_timeout,
            self.loader.prepare(&request.app_root, request.app_type),
        )
        .await;

        match prepared {
            Ok(Ok(())) => {
                if request.spawn_method == SpawnMethod::Smart {
                    self.prepared_cache().insert(key);
                }
                Ok(())
            }
            Ok(Err(e)) => Err(SpawnError::AppLaunchFailed {
                reason: e.to_string(),
            }),
            Err(_) => Err(SpawnError::SpawnTimeout {
                stage: SpawnStage::Framework,
            }),
        }
    }

    fn prepared_cache(&self) -> std::sync::MutexGuard<'_, HashSet<(PathBuf, AppType)>> {
        match self.prepared.lock() {
            Ok(guard) => guard,
            // A poisoned cache only loses reuse; treat it as empty.
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn bind_worker_socket(&self) -> Result<(OwnedFd, String, bool), SpawnError> {
        let seq = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let dir = self
            .config
            .socket_dir
            .join(format!("spawnd-{}", std::process::id()));

        match bind_unix(&dir, seq) {
            Ok((fd, path)) => Ok((fd, path.display().to_string(), true)),
            Err(unix_err) => {
                tracing::warn!(
                    error = %unix_err,
                    "Unix socket bind failed, falling back to TCP loopback"
                );
                match bind_tcp() {
                    Ok((fd, addr)) => Ok((fd, addr.to_string(), false)),
                    Err(tcp_err) => Err(SpawnError::SocketBindFailed {
                        reason: format!("unix: {unix_err}; tcp: {tcp_err}"),
                    }),
                }
            }
        }
    }

    fn boot_argv(&self, request: &SpawnRequest) -> Vec<String> {
        if let Some(command) = &self.config.boot_command {
            return command.clone();
        }
        vec![
            request.app_type.loader_program().to_string(),
            request.app_root.display().to_string(),
        ]
    }

    async fn launch(
        &self,
        request: &SpawnRequest,
        identity: Option<WorkerIdentity>,
        listener_fd: OwnedFd,
        socket_path: String,
        socket_is_unix: bool,
    ) -> Result<SpawnedWorker, SpawnError> {
        let argv = self.boot_argv(request);
        let lowering = identity.is_some();

        tracing::info!(
            program = %argv[0],
            app_root = %request.app_root.display(),
            socket = %socket_path,
            "Launching worker"
        );

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&request.app_root)
            .env(
                request.app_type.environment_variable(),
                &request.environment,
            )
            .env("SPAWND_LISTENER_FD", WORKER_LISTENER_FD.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(identity) = identity {
            command.uid(identity.uid).gid(identity.gid);
        }

        let raw_listener = listener_fd.as_raw_fd();
        unsafe {
            command.pre_exec(move || {
                // Own process group, so a stalled worker and everything it
                // forked can be torn down together.
                nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                    .map_err(io::Error::from)?;

                if raw_listener == WORKER_LISTENER_FD {
                    // Already at the target; just clear close-on-exec.
                    let fd = BorrowedFd::borrow_raw(raw_listener);
                    nix::fcntl::fcntl(
                        fd,
                        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::empty()),
                    )
                    .map_err(io::Error::from)?;
                } else {
                    // dup2 clears close-on-exec on the duplicate.
                    let src = BorrowedFd::borrow_raw(raw_listener);
                    let mut target = OwnedFd::from_raw_fd(WORKER_LISTENER_FD);
                    nix::unistd::dup2(&src, &mut target).map_err(io::Error::from)?;
                    std::mem::forget(target);
                }
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| map_launch_error(e, lowering))?;
        // The child holds its own duplicate of the listener now.
        drop(listener_fd);

        let pid = child
            .id()
            .map(|p| p as i32)
            .ok_or_else(|| SpawnError::AppLaunchFailed {
                reason: "worker exited during startup".to_string(),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::AppLaunchFailed {
                reason: "worker stdout not captured".to_string(),
            })?;

        let readiness = async {
            let mut lines = BufReader::new(stdout).lines();
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(pid, ready = %line, "Worker signaled readiness");
                    Ok(())
                }
                Ok(None) => Err(SpawnError::AppLaunchFailed {
                    reason: "worker exited before signaling readiness".to_string(),
                }),
                Err(e) => Err(SpawnError::AppLaunchFailed {
                    reason: format!("error reading readiness signal: {e}"),
                }),
            }
        };

        match tokio::time::timeout(request.app_spawner_timeout, readiness).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                terminate_worker(&mut child, pid).await;
                return Err(e);
            }
            Err(_) => {
                tracing::warn!(pid, "Worker readiness timed out, terminating process group");
                terminate_worker(&mut child, pid).await;
                return Err(SpawnError::SpawnTimeout {
                    stage: SpawnStage::App,
                });
            }
        }

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SpawnError::AppLaunchFailed {
                reason: "worker stderr not captured".to_string(),
            })?;
        let diagnostic_fd = stderr
            .into_owned_fd()
            .map_err(|e| SpawnError::AppLaunchFailed {
                reason: format!("failed to detach worker stderr: {e}"),
            })?;

        tracing::info!(pid, socket = %socket_path, "Worker ready");

        Ok(SpawnedWorker {
            pid,
            socket_path,
            socket_is_unix,
            diagnostic_fd,
        })
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedWorker, SpawnError> {
        let identity = if request.lower_privilege {
            Some(
                self.privilege
                    .resolve(&request.app_root, &request.lowest_user)?,
            )
        } else {
            None
        };

        self.prepare_framework(request).await?;

        let (listener_fd, socket_path, socket_is_unix) = self.bind_worker_socket()?;

        self.launch(request, identity, listener_fd, socket_path, socket_is_unix)
            .await
    }
}

fn bind_unix(dir: &Path, seq: u64) -> io::Result<(OwnedFd, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("worker-{seq}.sock"));

    if path.exists() {
        std::fs::remove_file(&path)?;
    }

    let listener = std::os::unix::net::UnixListener::bind(&path)?;
    tracing::debug!(path = %path.display(), "Bound worker socket");
    Ok((OwnedFd::from(listener), path))
}

fn bind_tcp() -> io::Result<(OwnedFd, std::net::SocketAddr)> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    let addr = listener.local_addr()?;
    tracing::debug!(%addr, "Bound worker socket (TCP loopback)");
    Ok((OwnedFd::from(listener), addr))
}

/// Kill the worker's whole process group and reap the direct child.
async fn terminate_worker(child: &mut Child, pid: i32) {
    let pgid = nix::unistd::Pid::from_raw(pid);
    if let Err(e) = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "Worker process group already gone");
    }
    if let Err(e) = child.wait().await {
        tracing::warn!(pid, error = %e, "Failed to reap worker");
    }
}

fn map_launch_error(e: io::Error, lowering: bool) -> SpawnError {
    if lowering && e.kind() == io::ErrorKind::PermissionDenied {
        SpawnError::PrivilegeDropFailed {
            reason: e.to_string(),
        }
    } else {
        SpawnError::AppLaunchFailed {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crate::spawn::loader::PrepareError;

    struct StubResolver;

    impl PrivilegeResolver for StubResolver {
        fn resolve(&self, _: &Path, _: &str) -> Result<WorkerIdentity, SpawnError> {
            Ok(WorkerIdentity {
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
            })
        }
    }

    struct CountingLoader {
        calls: AtomicUsize,
    }

    impl CountingLoader {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AppLoader for CountingLoader {
        async fn prepare(&self, _: &Path, _: AppType) -> Result<(), PrepareError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SlowLoader {
        delay: Duration,
    }

    #[async_trait]
    impl AppLoader for SlowLoader {
        async fn prepare(&self, _: &Path, _: AppType) -> Result<(), PrepareError> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn request(app_root: &Path, spawn_method: SpawnMethod) -> SpawnRequest {
        SpawnRequest {
            app_root: app_root.to_path_buf(),
            lower_privilege: false,
            lowest_user: "nobody".to_string(),
            environment: "production".to_string(),
            spawn_method,
            app_type: AppType::Rack,
            framework_spawner_timeout: Duration::from_secs(5),
            app_spawner_timeout: Duration::from_secs(5),
        }
    }

    fn spawner(loader: Arc<dyn AppLoader>, config: SpawnerConfig) -> ProcessSpawner {
        ProcessSpawner::new(Arc::new(StubResolver), loader, config)
    }

    fn shell_boot(script: &str) -> Option<Vec<String>> {
        Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
    }

    #[tokio::test]
    async fn spawns_worker_and_reports_unix_socket() {
        let app_root = tempfile::tempdir().unwrap();
        let socket_dir = tempfile::tempdir().unwrap();

        let spawner = spawner(
            CountingLoader::new(),
            SpawnerConfig {
                socket_dir: socket_dir.path().to_path_buf(),
                boot_command: shell_boot("echo ready && exec sleep 30"),
            },
        );

        let worker = spawner
            .spawn(&request(app_root.path(), SpawnMethod::Direct))
            .await
            .unwrap();

        assert!(worker.pid > 0);
        assert!(worker.socket_is_unix);
        assert!(Path::new(&worker.socket_path).exists());
        assert!(worker.diagnostic_fd.as_raw_fd() >= 0);

        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(worker.pid),
            nix::sys::signal::Signal::SIGKILL,
        );
    }

    #[tokio::test]
    async fn readiness_timeout_leaves_no_running_child() {
        let app_root = tempfile::tempdir().unwrap();
        let pid_file = app_root.path().join("pid");

        let mut request = request(app_root.path(), SpawnMethod::Direct);
        request.app_spawner_timeout = Duration::from_millis(200);

        let spawner = spawner(
            CountingLoader::new(),
            SpawnerConfig {
                socket_dir: app_root.path().to_path_buf(),
                boot_command: shell_boot(&format!(
                    "echo $$ > {}; sleep 30",
                    pid_file.display()
                )),
            },
        );

        let err = spawner.spawn(&request).await.unwrap_err();
        assert!(matches!(
            err,
            SpawnError::SpawnTimeout {
                stage: SpawnStage::App
            }
        ));

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let probe = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None);
        assert!(probe.is_err(), "worker still running after timeout");
    }

    #[tokio::test]
    async fn worker_exit_before_readiness_is_launch_failure() {
        let app_root = tempfile::tempdir().unwrap();

        let spawner = spawner(
            CountingLoader::new(),
            SpawnerConfig {
                socket_dir: app_root.path().to_path_buf(),
                boot_command: shell_boot("exit 7"),
            },
        );

        let err = spawner
            .spawn(&request(app_root.path(), SpawnMethod::Direct))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "AppLaunchFailed");
    }

    #[tokio::test]
    async fn falls_back_to_tcp_loopback() {
        let app_root = tempfile::tempdir().unwrap();
        // A file where the socket directory should go forces the fallback.
        let blocker = app_root.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();

        let spawner = spawner(
            CountingLoader::new(),
            SpawnerConfig {
                socket_dir: blocker,
                boot_command: shell_boot("echo ready && exec sleep 30"),
            },
        );

        let worker = spawner
            .spawn(&request(app_root.path(), SpawnMethod::Direct))
            .await
            .unwrap();

        assert!(!worker.socket_is_unix);
        let addr: std::net::SocketAddr = worker.socket_path.parse().unwrap();
        assert!(addr.ip().is_loopback());

        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(worker.pid),
            nix::sys::signal::Signal::SIGKILL,
        );
    }

    #[tokio::test]
    async fn smart_method_prepares_once() {
        let app_root = tempfile::tempdir().unwrap();
        let loader = CountingLoader::new();

        let spawner = spawner(
            Arc::clone(&loader) as Arc<dyn AppLoader>,
            SpawnerConfig {
                socket_dir: app_root.path().to_path_buf(),
                boot_command: shell_boot("echo ready"),
            },
        );

        for _ in 0..2 {
            spawner
                .spawn(&request(app_root.path(), SpawnMethod::Smart))
                .await
                .unwrap();
        }
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        for _ in 0..2 {
            spawner
                .spawn(&request(app_root.path(), SpawnMethod::Conservative))
                .await
                .unwrap();
        }
        assert_eq!(loader.calls.load(Ordering::SeqCst), 3);

        spawner
            .spawn(&request(app_root.path(), SpawnMethod::Direct))
            .await
            .unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn framework_preparation_timeout() {
        let app_root = tempfile::tempdir().unwrap();

        let mut request = request(app_root.path(), SpawnMethod::Conservative);
        request.framework_spawner_timeout = Duration::from_secs(5);

        let spawner = spawner(
            Arc::new(SlowLoader {
                delay: Duration::from_secs(6),
            }),
            SpawnerConfig::default(),
        );

        let err = spawner.spawn(&request).await.unwrap_err();
        assert!(matches!(
            err,
            SpawnError::SpawnTimeout {
                stage: SpawnStage::Framework
            }
        ));
    }

    #[tokio::test]
    async fn unknown_fallback_user_short_circuits() {
        let app_root = tempfile::tempdir().unwrap();

        let spawner = ProcessSpawner::new(
            Arc::new(crate::spawn::SystemPrivilegeResolver),
            CountingLoader::new(),
            SpawnerConfig::default(),
        );

        let mut request = request(app_root.path(), SpawnMethod::Direct);
        request.lower_privilege = true;
        request.lowest_user = "no-such-user-5f2a".to_string();

        // Only observable when the app root owner lookup cannot satisfy the
        // request (root-owned roots fall through to the fallback user).
        if nix::unistd::getuid().is_root() {
            let err = spawner.spawn(&request).await.unwrap_err();
            assert_eq!(err.kind(), "PrivilegeDropFailed");
        }
    }
}
