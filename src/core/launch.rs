//! Builders for the two kinds of servers tests start: the routing proxy and the mock
//! memcache server.

use crate::config::{ConfigError, HarnessConfig, TimeoutConfig};
use crate::core::listener::ListenSocket;
use crate::core::port_rewrite::{replace_strings, rewrite, PortTargets};
use crate::core::process::{LaunchOptions, ManagedProcess, ProcessError, WorkDir};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Flag that makes the proxy daemonize
const DAEMONIZE_FLAG: &str = "-b";

/// Where the server gets its listening socket from
enum Listen {
    /// Server binds this port itself
    Port(u16),
    /// Server inherits an already bound socket
    Inherited(ListenSocket),
}

impl Listen {
    fn new(port: Option<u16>) -> Result<Self, ProcessError> {
        Ok(match port {
            Some(port) => Listen::Port(port),
            None => Listen::Inherited(ListenSocket::bind_ephemeral()?),
        })
    }

    fn port(&self) -> u16 {
        match self {
            Listen::Port(port) => *port,
            Listen::Inherited(socket) => socket.port(),
        }
    }

    /// `fd_flag <fd>` or `port_flag <port>`
    fn args(&self, fd_flag: &str, port_flag: &str) -> [String; 2] {
        match self {
            Listen::Port(port) => [port_flag.to_string(), port.to_string()],
            Listen::Inherited(socket) => [fd_flag.to_string(), socket.raw_fd().to_string()],
        }
    }

    /// Spawn with the socket handed over, then drop our copy of it
    fn launch(self, work_dir: WorkDir, mut options: LaunchOptions) -> Result<ManagedProcess, ProcessError> {
        if let Listen::Inherited(socket) = &self {
            options.inherit_fd = Some(socket.raw_fd());
        }
        let result = ManagedProcess::launch_in(work_dir, options);
        if let Listen::Inherited(socket) = self {
            socket.close();
        }
        result
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Starts the routing proxy with a private log file, spool directory and, optionally,
/// a config rewritten to point at this test's servers.
#[derive(Debug, Clone)]
pub struct ProxyBuilder {
    binary: String,
    config: PathBuf,
    port: Option<u16>,
    default_route: Option<String>,
    extra_args: Vec<String>,
    substitute_ports: Option<PortTargets>,
    replace_map: Vec<(String, String)>,
    env: Vec<(String, String)>,
    junk_fill: bool,
    timeouts: TimeoutConfig,
}

impl ProxyBuilder {
    pub fn new(binary: impl Into<String>, config: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            config: config.into(),
            port: None,
            default_route: None,
            extra_args: Vec::new(),
            substitute_ports: None,
            replace_map: Vec::new(),
            env: Vec::new(),
            junk_fill: true,
            timeouts: TimeoutConfig::default(),
        }
    }

    /// Use the configured proxy binary, timeouts and junk fill setting
    pub fn from_config(harness: &HarnessConfig, config: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Ok(Self::new(harness.proxy_binary()?, config)
            .junk_fill(harness.junk_fill)
            .timeouts(harness.timeouts.clone()))
    }

    /// Listen on a fixed port instead of an inherited ephemeral socket
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn default_route(mut self, route: impl Into<String>) -> Self {
        self.default_route = Some(route.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Rewrite ports in the config before launching
    pub fn substitute_ports(mut self, targets: impl Into<PortTargets>) -> Self {
        self.substitute_ports = Some(targets.into());
        self
    }

    /// Replace a literal string in the config before launching. Applied before
    /// port substitution, in the order added.
    pub fn replace(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.replace_map.push((from.into(), to.into()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn junk_fill(mut self, enabled: bool) -> Self {
        self.junk_fill = enabled;
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Prepare the private directory and config, then spawn the proxy
    pub async fn launch(self) -> Result<ManagedProcess, ProcessError> {
        let work_dir = WorkDir::create("mcrouter")?;
        let log_file = work_dir.join("mcrouter.log");
        let spool_dir = work_dir.join("spool");
        tokio::fs::create_dir(&spool_dir).await?;

        let mut config = self.config.clone();
        if !self.replace_map.is_empty() {
            let text = tokio::fs::read_to_string(&config).await?;
            config = work_dir.join("config.replaced");
            tokio::fs::write(&config, replace_strings(&text, &self.replace_map)).await?;
        }
        if let Some(targets) = &self.substitute_ports {
            let text = tokio::fs::read_to_string(&config).await?;
            let rewritten = rewrite(&text, targets)?;
            debug!("Config ports rewritten: {:?}", rewritten.port_map);
            config = work_dir.join("config.ports");
            tokio::fs::write(&config, rewritten.text).await?;
        }

        let mut argv = vec![
            self.binary.clone(),
            "-f".to_string(),
            path_arg(&config),
            "-L".to_string(),
            path_arg(&log_file),
            "-a".to_string(),
            path_arg(&spool_dir),
        ];

        // No await from here until the inherited socket is closed
        let listen = Listen::new(self.port)?;
        argv.extend(listen.args("--listen-sock-fd", "-p"));
        if let Some(route) = &self.default_route {
            argv.push("-R".to_string());
            argv.push(route.clone());
        }
        argv.extend(self.extra_args.iter().cloned());

        let pid_file = if argv.iter().any(|arg| arg == DAEMONIZE_FLAG) {
            let pid_file = work_dir.join("mcrouter.pid");
            argv.push("-P".to_string());
            argv.push(path_arg(&pid_file));
            Some(pid_file)
        } else {
            None
        };

        let mut env = self.env.clone();
        if self.junk_fill {
            env.push(("MALLOC_CONF".to_string(), "junk:true".to_string()));
        }

        let options = LaunchOptions {
            argv,
            env,
            port: listen.port(),
            inherit_fd: None,
            log_file: Some(log_file),
            spool_dir: Some(spool_dir),
            config_file: Some(config),
            pid_file,
            timeouts: self.timeouts.clone(),
        };
        listen.launch(work_dir, options)
    }
}

/// Starts the mock memcache server
#[derive(Debug, Clone)]
pub struct MockServerBuilder {
    binary: String,
    port: Option<u16>,
    extra_args: Vec<String>,
    timeouts: TimeoutConfig,
}

impl MockServerBuilder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            port: None,
            extra_args: Vec::new(),
            timeouts: TimeoutConfig::default(),
        }
    }

    pub fn from_config(harness: &HarnessConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(harness.mock_server_binary()?).timeouts(harness.timeouts.clone()))
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn launch(self) -> Result<ManagedProcess, ProcessError> {
        let work_dir = WorkDir::create("mcprocess")?;
        let listen = Listen::new(self.port)?;

        let mut argv = vec![self.binary];
        argv.extend(self.extra_args);
        argv.extend(listen.args("-t", "-P"));

        let options = LaunchOptions::new(argv, listen.port()).timeouts(self.timeouts);
        listen.launch(work_dir, options)
    }
}
