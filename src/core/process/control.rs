use super::ProcessError;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const DAEMON_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What `terminate` observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub pid: Option<u32>,
    /// Exit status of the directly spawned child, when it could be collected
    pub status: Option<ExitStatus>,
}

/// Lifecycle operations shared by foreground and daemonized processes
#[async_trait]
pub trait ProcessControl: Send {
    /// Pid that signals are delivered to
    fn pid(&self) -> Option<u32>;

    /// Stop the process (SIGSTOP)
    fn pause(&mut self) -> Result<(), ProcessError>;

    /// Continue a stopped process (SIGCONT)
    fn resume(&mut self) -> Result<(), ProcessError>;

    /// Non-blocking liveness check
    fn is_alive(&mut self) -> bool;

    /// Ask the process to exit and wait until it has. `None` when already terminated.
    async fn terminate(&mut self) -> Result<Option<Termination>, ProcessError>;

    /// Best-effort SIGTERM from a destructor, without waiting
    fn signal_on_drop(&mut self);
}

/// Deliver `signal` to `pid`. A process that no longer exists is not an error.
pub fn send_signal(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(ProcessError::Signal {
            pid,
            signal,
            source: errno.into(),
        }),
    }
}

fn signal_best_effort(pid: u32, signal: Signal) {
    if let Err(e) = send_signal(pid, signal) {
        warn!("{}", e);
    }
}

/// SIGTERM, followed by SIGCONT for a stopped process so the SIGTERM gets handled
fn request_exit(pid: u32, paused: bool) {
    signal_best_effort(pid, Signal::SIGTERM);
    if paused {
        signal_best_effort(pid, Signal::SIGCONT);
    }
}

/// Liveness of a pid we are not the parent of. Zombies count as dead since nobody
/// may ever reap them.
pub fn pid_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .map_or(false, |state| state != 'Z' && state != 'X'),
        Err(_) => kill(Pid::from_raw(pid as i32), None).is_ok(),
    }
}

/// Poll until `pid` is gone, escalating to SIGKILL after `limit`
async fn wait_for_exit(pid: u32, limit: Duration) {
    let deadline = Instant::now() + limit;
    while pid_alive(pid) {
        if Instant::now() >= deadline {
            warn!(
                "Daemon {} still running after {:?}, sending SIGKILL",
                pid, limit
            );
            signal_best_effort(pid, Signal::SIGKILL);
            return;
        }
        sleep(DAEMON_POLL_INTERVAL).await;
    }
}

/// A process spawned directly and owned as a child
#[derive(Debug)]
pub struct ForegroundProcess {
    child: Option<Child>,
    pid: Option<u32>,
    paused: bool,
}

impl ForegroundProcess {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child: Some(child),
            pid,
            paused: false,
        }
    }

    /// Pid while the child has not been reaped
    fn live_pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }
}

#[async_trait]
impl ProcessControl for ForegroundProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn pause(&mut self) -> Result<(), ProcessError> {
        if let Some(pid) = self.live_pid() {
            send_signal(pid, Signal::SIGSTOP)?;
            self.paused = true;
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<(), ProcessError> {
        if let Some(pid) = self.live_pid() {
            send_signal(pid, Signal::SIGCONT)?;
            self.paused = false;
        }
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn terminate(&mut self) -> Result<Option<Termination>, ProcessError> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };

        if matches!(child.try_wait(), Ok(None)) {
            if let Some(pid) = child.id() {
                request_exit(pid, self.paused);
            }
        }
        let status = child.wait().await?;
        self.paused = false;
        info!("Process {:?} exited with {}", self.pid, status);

        Ok(Some(Termination {
            pid: self.pid,
            status: Some(status),
        }))
    }

    fn signal_on_drop(&mut self) {
        if !self.is_alive() {
            return;
        }
        if let Some(pid) = self.live_pid() {
            request_exit(pid, self.paused);
        }
    }
}

/// A process that forks into the background and records its pid in a file.
/// The launcher we spawned is only used until the pid file appears.
#[derive(Debug)]
pub struct DaemonizedProcess {
    launcher: Option<Child>,
    pid_file: PathBuf,
    paused: bool,
    terminated: bool,
    terminate_timeout: Duration,
}

impl DaemonizedProcess {
    pub fn new(launcher: Child, pid_file: PathBuf, terminate_timeout: Duration) -> Self {
        Self {
            launcher: Some(launcher),
            pid_file,
            paused: false,
            terminated: false,
            terminate_timeout,
        }
    }

    /// Pid recorded by the daemon, if it has written one yet
    pub fn daemon_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    fn require_pid(&self) -> Result<u32, ProcessError> {
        self.daemon_pid()
            .ok_or_else(|| ProcessError::PidUnavailable(self.pid_file.clone()))
    }

    fn launcher_running(&mut self) -> bool {
        match self.launcher.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn reap_launcher(&mut self) -> Option<ExitStatus> {
        let mut launcher = self.launcher.take()?;
        match timeout(self.terminate_timeout, launcher.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("Failed to wait for daemon launcher: {}", e);
                None
            }
            Err(_) => {
                warn!("Daemon launcher did not exit, killing it");
                if let Err(e) = launcher.start_kill() {
                    warn!("Failed to kill daemon launcher: {}", e);
                }
                launcher.wait().await.ok()
            }
        }
    }
}

#[async_trait]
impl ProcessControl for DaemonizedProcess {
    fn pid(&self) -> Option<u32> {
        self.daemon_pid()
            .or_else(|| self.launcher.as_ref().and_then(|c| c.id()))
    }

    fn pause(&mut self) -> Result<(), ProcessError> {
        let pid = self.require_pid()?;
        send_signal(pid, Signal::SIGSTOP)?;
        self.paused = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), ProcessError> {
        let pid = self.require_pid()?;
        send_signal(pid, Signal::SIGCONT)?;
        self.paused = false;
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        match self.daemon_pid() {
            Some(pid) => pid_alive(pid),
            // Still starting up
            None => self.launcher_running(),
        }
    }

    async fn terminate(&mut self) -> Result<Option<Termination>, ProcessError> {
        if self.terminated {
            return Ok(None);
        }
        self.terminated = true;

        let pid = self.daemon_pid();
        match pid {
            Some(pid) => {
                request_exit(pid, self.paused);
                wait_for_exit(pid, self.terminate_timeout).await;
                info!("Daemon {} terminated", pid);
            }
            None => {
                debug!(
                    "No pid in {}, stopping the launcher instead",
                    self.pid_file.display()
                );
                if let Some(launcher) = self.launcher.as_ref().and_then(|c| c.id()) {
                    request_exit(launcher, false);
                }
            }
        }
        self.paused = false;

        let status = self.reap_launcher().await;
        Ok(Some(Termination { pid, status }))
    }

    fn signal_on_drop(&mut self) {
        if self.terminated {
            return;
        }
        if let Some(pid) = self.daemon_pid() {
            request_exit(pid, self.paused);
        }
        if self.launcher_running() {
            if let Some(pid) = self.launcher.as_ref().and_then(|c| c.id()) {
                request_exit(pid, false);
            }
        }
    }
}

/// The two ways a launched process is controlled, chosen at launch time
#[derive(Debug)]
pub enum ProcessKind {
    Foreground(ForegroundProcess),
    Daemonized(DaemonizedProcess),
}

impl ProcessKind {
    fn inner(&self) -> &dyn ProcessControl {
        match self {
            ProcessKind::Foreground(p) => p,
            ProcessKind::Daemonized(p) => p,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ProcessControl {
        match self {
            ProcessKind::Foreground(p) => p,
            ProcessKind::Daemonized(p) => p,
        }
    }

    pub fn is_daemonized(&self) -> bool {
        matches!(self, ProcessKind::Daemonized(_))
    }
}

#[async_trait]
impl ProcessControl for ProcessKind {
    fn pid(&self) -> Option<u32> {
        self.inner().pid()
    }

    fn pause(&mut self) -> Result<(), ProcessError> {
        self.inner_mut().pause()
    }

    fn resume(&mut self) -> Result<(), ProcessError> {
        self.inner_mut().resume()
    }

    fn is_alive(&mut self) -> bool {
        self.inner_mut().is_alive()
    }

    async fn terminate(&mut self) -> Result<Option<Termination>, ProcessError> {
        self.inner_mut().terminate().await
    }

    fn signal_on_drop(&mut self) {
        self.inner_mut().signal_on_drop()
    }
}
