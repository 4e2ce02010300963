//! Process Supervisor
//!
//! Owns the proxy-engine child process.
//!
//! # Lifecycle
//!
//! 1. The engine config is written to a scoped temp file in the runtime dir
//! 2. The engine binary is launched with that file as its last argument
//! 3. The process must survive [`STARTUP_GRACE`] to count as started
//! 4. An observer task owns the process and the config file from then on;
//!    an exit nobody asked for is reported as [`SupervisorEvent::UnexpectedExit`]
//! 5. `stop` asks the observer to terminate the engine (SIGTERM, then kill
//!    after the stop timeout); the config file goes away with the observer
//!
//! The config file and the "engine active" slot are dropped on every exit
//! path, including early returns from `start` and dropped handles.

use crate::translator::ProxyConfig;
use async_trait::async_trait;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long a freshly launched engine must stay alive
pub const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// Log target for engine output
pub const ENGINE_LOG_TARGET: &str = "xtun::engine";

/// Process errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("Engine binary not found: {}", .0.display())]
    BinaryNotFound(PathBuf),

    #[error("Engine failed to start: {0}")]
    StartupFailed(String),

    #[error("Engine exited unexpectedly (code {0:?})")]
    UnexpectedExit(Option<i32>),

    #[error("Engine already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for ProcessError {
    fn from(e: io::Error) -> Self {
        ProcessError::Io(e.to_string())
    }
}

/// How the engine exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineExit {
    pub code: Option<i32>,
}

/// A launched engine process.
#[async_trait]
pub trait EngineProcess: Send {
    /// OS process id, if any
    fn id(&self) -> Option<u32>;

    /// Wait for exit. Cancel-safe.
    async fn wait(&mut self) -> io::Result<EngineExit>;

    /// Ask the process to exit.
    async fn terminate(&mut self) -> io::Result<()>;

    /// Force the process down.
    async fn kill(&mut self) -> io::Result<()>;
}

/// Starts engine processes.
#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, config_path: &Path) -> Result<Box<dyn EngineProcess>, ProcessError>;
}

/// Launches the real engine binary.
#[derive(Debug, Clone)]
pub struct BinaryLauncher {
    binary: PathBuf,
    args: Vec<String>,
}

impl BinaryLauncher {
    /// `binary args... <config path>`
    pub fn new(binary: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

async fn forward_output<R: AsyncRead + Unpin>(reader: R, stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if stderr {
            warn!(target: ENGINE_LOG_TARGET, "{}", line);
        } else {
            info!(target: ENGINE_LOG_TARGET, "{}", line);
        }
    }
}

#[async_trait]
impl EngineLauncher for BinaryLauncher {
    async fn launch(&self, config_path: &Path) -> Result<Box<dyn EngineProcess>, ProcessError> {
        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => ProcessError::BinaryNotFound(self.binary.clone()),
                _ => ProcessError::StartupFailed(format!("{}: {}", self.binary.display(), e)),
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, true));
        }

        debug!("Launched {} (pid {:?})", self.binary.display(), child.id());
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl EngineProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<EngineExit> {
        let status = self.child.wait().await?;
        Ok(EngineExit {
            code: status.code(),
        })
    }

    #[cfg(unix)]
    async fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped
        if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

/// Events reported by the supervisor outside of any call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The engine behind `handle` exited without being asked to
    UnexpectedExit { handle: u64, error: ProcessError },
}

/// Marks the single engine slot as taken until dropped.
struct ActiveSlot(Arc<AtomicBool>);

impl ActiveSlot {
    fn claim(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ActiveSlot(Arc::clone(flag)))
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A started engine.
///
/// Dropping the handle without calling `stop` still brings the engine down.
#[derive(Debug)]
pub struct EngineHandle {
    id: u64,
    pid: Option<u32>,
    config_path: PathBuf,
    running: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Where the engine config lives while the handle is running.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

/// Owns the process, its config file and the active slot.
struct Observer {
    id: u64,
    process: Box<dyn EngineProcess>,
    _config_file: NamedTempFile,
    _slot: ActiveSlot,
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    stop_timeout: Duration,
}

impl Observer {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        let requested = tokio::select! {
            exit = self.process.wait() => {
                self.running.store(false, Ordering::Release);
                let code = exit.ok().and_then(|e| e.code);
                error!("Engine {} exited unexpectedly (code {:?})", self.id, code);
                let _ = self.events.send(SupervisorEvent::UnexpectedExit {
                    handle: self.id,
                    error: ProcessError::UnexpectedExit(code),
                });
                false
            }
            // A dropped handle counts as a stop request
            _ = &mut stop_rx => true,
        };

        if requested {
            self.shutdown().await;
        }
        self.running.store(false, Ordering::Release);
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.process.terminate().await {
            warn!("Engine {} terminate failed: {}", self.id, e);
        }

        match tokio::time::timeout(self.stop_timeout, self.process.wait()).await {
            Ok(exit) => {
                info!("Engine {} stopped ({:?})", self.id, exit.ok().and_then(|e| e.code));
            }
            Err(_) => {
                warn!(
                    "Engine {} ignored termination for {:?}, killing",
                    self.id, self.stop_timeout
                );
                if let Err(e) = self.process.kill().await {
                    warn!("Engine {} kill failed: {}", self.id, e);
                }
            }
        }
    }
}

/// Supervises at most one engine process at a time.
pub struct ProcessSupervisor {
    launcher: Arc<dyn EngineLauncher>,
    runtime_dir: PathBuf,
    stop_timeout: Duration,
    active: Arc<AtomicBool>,
    next_id: AtomicU64,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl ProcessSupervisor {
    /// Create a supervisor and the stream its unexpected-exit events go to.
    pub fn new(
        launcher: Arc<dyn EngineLauncher>,
        runtime_dir: impl Into<PathBuf>,
        stop_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            launcher,
            runtime_dir: runtime_dir.into(),
            stop_timeout,
            active: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            events,
        };
        (supervisor, events_rx)
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    /// Whether an engine currently holds the slot.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn write_config(&self, config: &ProxyConfig) -> Result<NamedTempFile, ProcessError> {
        let json = config
            .to_json()
            .map_err(|e| ProcessError::Io(format!("serialize engine config: {}", e)))?;

        let mut file = tempfile::Builder::new()
            .prefix("xtun-engine-")
            .suffix(".json")
            .tempfile_in(&self.runtime_dir)?;
        file.write_all(json.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    /// Write the config, launch the engine and wait out the startup grace.
    pub async fn start(&self, config: &ProxyConfig) -> Result<EngineHandle, ProcessError> {
        let slot = ActiveSlot::claim(&self.active).ok_or(ProcessError::AlreadyRunning)?;
        let config_file = self.write_config(config)?;
        let config_path = config_file.path().to_path_buf();

        let mut process = self.launcher.launch(&config_path).await?;
        let pid = process.id();

        tokio::select! {
            exit = process.wait() => {
                let detail = match exit {
                    Ok(exit) => format!("exited during startup (code {:?})", exit.code),
                    Err(e) => format!("lost during startup: {}", e),
                };
                return Err(ProcessError::StartupFailed(detail));
            }
            _ = tokio::time::sleep(STARTUP_GRACE) => {}
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = oneshot::channel();

        let observer = Observer {
            id,
            process,
            _config_file: config_file,
            _slot: slot,
            running: Arc::clone(&running),
            events: self.events.clone(),
            stop_timeout: self.stop_timeout,
        };
        let task = tokio::spawn(observer.run(stop_rx));

        info!("Engine {} running (pid {:?})", id, pid);
        Ok(EngineHandle {
            id,
            pid,
            config_path,
            running,
            stop_tx: Some(stop_tx),
            task: Some(task),
        })
    }

    /// Stop the engine behind `handle`. Safe to call more than once.
    pub async fn stop(&self, handle: &mut EngineHandle) {
        if let Some(stop_tx) = handle.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        let Some(mut task) = handle.task.take() else {
            return;
        };

        // Terminate, wait, kill: leave room for all three
        let budget = self.stop_timeout + STARTUP_GRACE;
        match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Engine {} observer failed: {}", handle.id, e),
            Err(_) => {
                warn!("Engine {} did not stop within {:?}, aborting", handle.id, budget);
                task.abort();
                let _ = task.await;
            }
        }
        handle.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self, handle: &EngineHandle) -> bool {
        handle.running.load(Ordering::Acquire)
    }
}
