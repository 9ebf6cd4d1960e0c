//! Accept loop for the file server.
//!
//! Picks a bind address once at startup, then hands every accepted connection
//! to its own tokio task. A semaphore bounds how many are served at once.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::config::ServerConfig;
use crate::handlers::{Handler, SharedRoot};
use crate::logger::{AccessLog, NoopAccessLog, TextAccessLog};
use crate::netinfo::{self, LocalAddress};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Choose the address to listen on.
///
/// A requested address wins when it belongs to this host. Otherwise prefer
/// private ranges in the order 10/8, 172.16/12, 192.168/16, then any other
/// non-loopback address, then all interfaces.
pub fn select_bind_address(requested: Option<Ipv4Addr>, locals: &[LocalAddress]) -> Ipv4Addr {
    if let Some(ip) = requested {
        if ip.is_unspecified() || ip.is_loopback() || locals.iter().any(|l| l.ip == ip) {
            return ip;
        }
        warn!(
            "IP address {} not found on any local interface, selecting one automatically",
            ip
        );
    }

    let candidates: Vec<Ipv4Addr> = locals
        .iter()
        .map(|l| l.ip)
        .filter(|ip| !ip.is_loopback())
        .collect();
    let ranked: [fn(&Ipv4Addr) -> bool; 4] = [
        |ip| ip.octets()[0] == 10,
        |ip| ip.octets()[0] == 172 && (16..=31).contains(&ip.octets()[1]),
        |ip| ip.octets()[0] == 192 && ip.octets()[1] == 168,
        |_| true,
    ];
    for matches in ranked {
        if let Some(ip) = candidates.iter().find(|ip| matches(ip)) {
            return *ip;
        }
    }
    Ipv4Addr::UNSPECIFIED
}

/// Listening socket with `SO_REUSEADDR` and an explicit backlog.
///
/// Must be called from within a tokio runtime.
pub fn bind_listener(addr: SocketAddrV4, backlog: u32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

pub struct FileServer {
    listener: TcpListener,
    root: Arc<SharedRoot>,
    limiter: Arc<Semaphore>,
    access_log: Arc<dyn AccessLog>,
}

impl FileServer {
    /// Validate the config and bind. Must be called from within a tokio runtime.
    pub fn bind(config: &ServerConfig) -> Result<Self> {
        let root = config.validate()?;

        let locals = netinfo::local_ipv4_addresses().unwrap_or_else(|e| {
            warn!("could not enumerate network interfaces: {}", e);
            Vec::new()
        });
        let ip = select_bind_address(config.bind_ip, &locals);
        let addr = SocketAddrV4::new(ip, config.port);
        let listener = bind_listener(addr, config.backlog)
            .with_context(|| format!("bind {}", addr))?;

        let access_log: Arc<dyn AccessLog> = match &config.access_log {
            Some(path) => Arc::new(
                TextAccessLog::new(path)
                    .with_context(|| format!("open access log {}", path.display()))?,
            ),
            None => Arc::new(NoopAccessLog),
        };

        Ok(Self {
            listener,
            root: Arc::new(SharedRoot::new(root)),
            limiter: Arc::new(Semaphore::new(config.max_connections)),
            access_log,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn root(&self) -> &SharedRoot {
        &self.root
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        loop {
            // Wait for a free slot first; excess clients queue in the backlog
            let permit = self
                .limiter
                .clone()
                .acquire_owned()
                .await
                .context("connection limiter closed")?;

            match self.listener.accept().await {
                Ok((mut stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    info!("New connection from {}", peer);
                    let handler =
                        Handler::new(Arc::clone(&self.root), Arc::clone(&self.access_log), peer);
                    tokio::spawn(async move {
                        if let Err(e) = handler.serve(&mut stream).await {
                            warn!("connection {} failed: {}", peer, e);
                        }
                        debug!("closed connection from {}", peer);
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    drop(permit);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Bind according to `config` and serve forever
pub async fn serve(config: ServerConfig) -> Result<()> {
    let server = FileServer::bind(&config)?;
    let addr = server.local_addr()?;
    println!("Starting lanshare server:");
    println!("  Sharing: {}", server.root().path().display());
    println!("  Listening on: {}", addr);
    if addr.ip().is_unspecified() {
        warn!("listening on all interfaces; only use on trusted networks");
    }
    server.run().await
}
