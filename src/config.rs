//! Runtime configuration for the server and client

use anyhow::{bail, Context, Result};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::protocol::DEFAULT_PORT;

pub const DEFAULT_BACKLOG: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Directory exposed to clients
    pub root: PathBuf,
    /// Requested bind address; `None` selects one automatically
    pub bind_ip: Option<Ipv4Addr>,
    pub port: u16,
    pub backlog: u32,
    /// Upper bound on concurrently served connections
    pub max_connections: usize,
    pub access_log: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bind_ip: None,
            port: DEFAULT_PORT,
            backlog: DEFAULT_BACKLOG,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            access_log: None,
        }
    }

    pub fn bind_ip(mut self, ip: Option<Ipv4Addr>) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn access_log(mut self, path: Option<PathBuf>) -> Self {
        self.access_log = path;
        self
    }

    /// Check the root and bounds, returning the canonical root directory
    pub fn validate(&self) -> Result<PathBuf> {
        if !self.root.exists() {
            bail!("Root directory does not exist: {}", self.root.display());
        }
        if !self.root.is_dir() {
            bail!("Root path is not a directory: {}", self.root.display());
        }
        if self.max_connections == 0 {
            bail!("max connections must be at least 1");
        }
        if self.backlog == 0 {
            bail!("listen backlog must be at least 1");
        }
        std::fs::canonicalize(&self.root)
            .with_context(|| format!("Failed to canonicalize root path: {}", self.root.display()))
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub port: u16,
    /// Where downloaded files are written
    pub download_dir: PathBuf,
    pub show_progress: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            download_dir: PathBuf::from("."),
            show_progress: false,
        }
    }
}

impl ClientConfig {
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn download_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.download_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }
}
