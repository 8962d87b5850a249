//! Launching interpreter processes against a running server.
//!
//! The server's address and secret reach the interpreter out of band, through
//! the `AP_HOST`, `AP_PORT` and `AP_HANDSHAKE` environment variables.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::ExitStatus;

use tokio::process::Command;
use tracing::{debug, info};

pub const HOST_VAR: &str = "AP_HOST";
pub const PORT_VAR: &str = "AP_PORT";
pub const HANDSHAKE_VAR: &str = "AP_HANDSHAKE";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Environment variable {0} is not set")]
    MissingVar(&'static str),

    #[error("Invalid AP_PORT value: {0}")]
    InvalidPort(String),

    #[error("Cannot resolve {host}:{port}")]
    Unresolvable { host: String, port: u16 },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Connection details handed to an interpreter process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEnv {
    pub host: String,
    pub port: u16,
    pub secret: String,
}

impl ProxyEnv {
    pub fn new(host: impl Into<String>, port: u16, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            secret: secret.into(),
        }
    }

    pub fn vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (HOST_VAR, self.host.clone()),
            (PORT_VAR, self.port.to_string()),
            (HANDSHAKE_VAR, self.secret.clone()),
        ]
    }

    /// Read the variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LaunchError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup(HOST_VAR).ok_or(LaunchError::MissingVar(HOST_VAR))?;
        let port = lookup(PORT_VAR).ok_or(LaunchError::MissingVar(PORT_VAR))?;
        let port = port
            .trim()
            .parse()
            .map_err(|_| LaunchError::InvalidPort(port.clone()))?;
        let secret = lookup(HANDSHAKE_VAR).ok_or(LaunchError::MissingVar(HANDSHAKE_VAR))?;
        Ok(Self { host, port, secret })
    }

    pub fn from_env() -> Result<Self, LaunchError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, LaunchError> {
        let unresolvable = || LaunchError::Unresolvable {
            host: self.host.clone(),
            port: self.port,
        };
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| unresolvable())?
            .next()
            .ok_or_else(unresolvable)
    }
}

/// Spawns an interpreter program wired to a server.
#[derive(Debug, Clone)]
pub struct InterpreterLauncher {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    working_dir: Option<PathBuf>,
}

impl InterpreterLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Extra interpreter-specific variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command(&self, proxy: &ProxyEnv) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in proxy.vars() {
            command.env(key, value);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command.kill_on_drop(true);
        command
    }

    /// Start the program and wait for it to exit.
    pub async fn run(&self, proxy: &ProxyEnv) -> Result<ExitStatus, LaunchError> {
        let mut child = self
            .command(proxy)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        info!(program = %self.program, pid = ?child.id(), "Interpreter started");

        let status = child.wait().await.map_err(|source| LaunchError::Wait {
            program: self.program.clone(),
            source,
        })?;
        debug!(program = %self.program, status = %status, "Interpreter exited");
        Ok(status)
    }
}
