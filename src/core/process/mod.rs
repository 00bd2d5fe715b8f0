//! Supervision of processes under test: spawn with captured output in a private
//! directory, pause/resume, liveness, termination and log dumps.

pub mod control;
pub mod workdir;

pub use control::{
    pid_alive, DaemonizedProcess, ForegroundProcess, ProcessControl, ProcessKind, Termination,
};
pub use workdir::WorkDir;

use crate::config::TimeoutConfig;
use crate::core::client::{ClientError, McClient};
use crate::core::endpoint::Endpoint;
use crate::core::port_rewrite::RewriteError;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::Signal;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Could not run \"{command}\": {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to send {signal:?} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: Signal,
        #[source]
        source: io::Error,
    },
    #[error("No pid recorded in {}", .0.display())]
    PidUnavailable(PathBuf),
    #[error("{label} exited before accepting connections")]
    ExitedEarly { label: String },
    #[error("Process was launched without a config file")]
    NoConfig,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Config rewrite failed: {0}")]
    Rewrite(#[from] RewriteError),
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Everything needed to start one process
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Program followed by its arguments
    pub argv: Vec<String>,
    /// Added on top of the inherited environment
    pub env: Vec<(String, String)>,
    /// Port the process will accept connections on
    pub port: u16,
    /// Descriptor to keep open across exec (a pre-bound listening socket)
    pub inherit_fd: Option<RawFd>,
    pub log_file: Option<PathBuf>,
    pub spool_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    /// When set, the process daemonizes and writes its pid here
    pub pid_file: Option<PathBuf>,
    pub timeouts: TimeoutConfig,
}

impl LaunchOptions {
    pub fn new(argv: Vec<String>, port: u16) -> Self {
        Self {
            argv,
            env: Vec::new(),
            port,
            inherit_fd: None,
            log_file: None,
            spool_dir: None,
            config_file: None,
            pid_file: None,
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn inherit_fd(mut self, fd: RawFd) -> Self {
        self.inherit_fd = Some(fd);
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// Short name for a command line: the first argument that is neither an interpreter
/// nor a flag, without its directory.
pub fn derive_label(argv: &[String]) -> String {
    argv.iter()
        .find(|arg| arg.as_str() != "python" && !arg.starts_with('-'))
        .and_then(|arg| Path::new(arg).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "process".to_string())
}

/// Captured output of a process, rendered with one labeled section per source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessDump {
    pub label: String,
    pub work_dir: PathBuf,
    pub log: String,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessDump {
    pub fn is_empty(&self) -> bool {
        self.log.is_empty() && self.stdout.is_empty() && self.stderr.is_empty()
    }
}

impl fmt::Display for ProcessDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({})", self.label, self.work_dir.display())?;
        for (section, content) in [
            ("log", &self.log),
            ("stdout", &self.stdout),
            ("stderr", &self.stderr),
        ] {
            if !content.is_empty() {
                writeln!(f, "{} {}:\n{}", self.label, section, content)?;
            }
        }
        Ok(())
    }
}

/// Read a capture file in full; anything unreadable is empty
async fn read_capture(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            debug!("Could not read {}: {}", path.display(), e);
            String::new()
        }
    }
}

/// A launched process together with a client for its port.
///
/// Dropping it sends SIGTERM to a still running process and removes the private
/// directory with all captured output.
pub struct ManagedProcess {
    label: String,
    port: u16,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    log_file: Option<PathBuf>,
    spool_dir: Option<PathBuf>,
    config_file: Option<PathBuf>,
    control: ProcessKind,
    client: McClient,
    terminated: bool,
    work_dir: WorkDir,
}

impl ManagedProcess {
    /// Launch in a fresh private directory
    pub fn launch(options: LaunchOptions) -> Result<Self, ProcessError> {
        let work_dir = WorkDir::create("mcprocess")?;
        Self::launch_in(work_dir, options)
    }

    /// Launch with `stdout` and `stderr` captured into `work_dir`.
    ///
    /// Spawning never blocks on the child, so a listening socket bound by the caller
    /// can be closed right after this returns.
    pub fn launch_in(work_dir: WorkDir, options: LaunchOptions) -> Result<Self, ProcessError> {
        let command_line = options.argv.join(" ");
        let label = derive_label(&options.argv);

        let Some((program, args)) = options.argv.split_first() else {
            return Err(ProcessError::Spawn {
                command: command_line,
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
            });
        };

        let stdout_path = work_dir.join("stdout");
        let stderr_path = work_dir.join("stderr");
        let stdout = File::create(&stdout_path)?;
        let stderr = File::create(&stderr_path)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        if let Some(fd) = options.inherit_fd {
            // SAFETY: only async-signal-safe fcntl calls run between fork and exec
            unsafe {
                command.pre_exec(move || {
                    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
                    fcntl(fd, FcntlArg::F_SETFD(flags.difference(FdFlag::FD_CLOEXEC)))?;
                    Ok(())
                });
            }
        }

        let child = command.spawn().map_err(|source| {
            error!("Fatal: could not run \"{}\": {}", command_line, source);
            ProcessError::Spawn {
                command: command_line.clone(),
                source,
            }
        })?;
        info!(
            "Launched {} (pid {:?}) on port {}: {}",
            label,
            child.id(),
            options.port,
            command_line
        );

        let control = match options.pid_file {
            Some(pid_file) => ProcessKind::Daemonized(DaemonizedProcess::new(
                child,
                pid_file,
                options.timeouts.terminate_timeout(),
            )),
            None => ProcessKind::Foreground(ForegroundProcess::new(child)),
        };

        Ok(Self {
            label,
            port: options.port,
            stdout_path,
            stderr_path,
            log_file: options.log_file,
            spool_dir: options.spool_dir,
            config_file: options.config_file,
            control,
            client: McClient::with_timeouts(Endpoint::localhost(options.port), options.timeouts),
            terminated: false,
            work_dir,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.client.endpoint()
    }

    pub fn pid(&self) -> Option<u32> {
        self.control.pid()
    }

    pub fn is_daemonized(&self) -> bool {
        self.control.is_daemonized()
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn spool_dir(&self) -> Option<&Path> {
        self.spool_dir.as_deref()
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    pub fn client(&self) -> &McClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut McClient {
        &mut self.client
    }

    /// Connect the client, retrying while the process is still starting up
    pub async fn ensure_connected(&mut self) -> Result<(), ProcessError> {
        let control = &mut self.control;
        let result = self
            .client
            .ensure_connected_while(|| control.is_alive())
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(ClientError::ConnectAborted { .. }) => Err(ProcessError::ExitedEarly {
                label: self.label.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn pause(&mut self) -> Result<(), ProcessError> {
        self.control.pause()
    }

    pub fn resume(&mut self) -> Result<(), ProcessError> {
        self.control.resume()
    }

    pub fn is_alive(&mut self) -> bool {
        self.control.is_alive()
    }

    /// Disconnect, log the captured output and stop the process.
    /// Returns `None` if it was already terminated.
    pub async fn terminate(&mut self) -> Result<Option<Termination>, ProcessError> {
        if self.terminated {
            return Ok(None);
        }
        self.terminated = true;
        self.client.disconnect();

        let dump = self.dump().await;
        if !dump.is_empty() {
            info!("{}", dump);
        }

        self.control.terminate().await
    }

    /// Current contents of the log file, stdout and stderr
    pub async fn dump(&self) -> ProcessDump {
        let log = match &self.log_file {
            Some(path) => read_capture(path).await,
            None => String::new(),
        };
        ProcessDump {
            label: self.label.clone(),
            work_dir: self.work_dir.path().to_path_buf(),
            log,
            stdout: read_capture(&self.stdout_path).await,
            stderr: read_capture(&self.stderr_path).await,
        }
    }

    /// Whether the log file contains `needle`. False for a process without a log file.
    pub async fn check_in_log(&self, needle: &str) -> Result<bool, ProcessError> {
        let Some(path) = &self.log_file else {
            return Ok(false);
        };
        let bytes = tokio::fs::read(path).await?;
        Ok(String::from_utf8_lossy(&bytes).contains(needle))
    }

    /// Overwrite the active config file with the contents of `new_config`
    pub async fn change_config(&self, new_config: impl AsRef<Path>) -> Result<(), ProcessError> {
        let target = self.config_file.as_ref().ok_or(ProcessError::NoConfig)?;
        tokio::fs::copy(new_config.as_ref(), target).await?;
        debug!(
            "Replaced {} with {}",
            target.display(),
            new_config.as_ref().display()
        );
        Ok(())
    }
}

impl fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("label", &self.label)
            .field("port", &self.port)
            .field("pid", &self.control.pid())
            .field("work_dir", &self.work_dir.path())
            .finish()
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if !self.terminated {
            self.control.signal_on_drop();
        }
    }
}
