use anyhow::Result;
use chrono::Utc;
use log::LevelFilter;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;

/// Set up `env_logger` once for the process.
///
/// `verbosity` is -1 for quiet, 0 for the default info level and 1+ for more
/// detail. `RUST_LOG` still overrides.
pub fn init(verbosity: i8) {
    let level = match verbosity {
        i8::MIN..=-1 => LevelFilter::Warn,
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        .parse_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        });
    let _ = builder.try_init();
}

/// Per-connection events recorded by the server
pub trait AccessLog: Send + Sync {
    fn connected(&self, _peer: &SocketAddr) {}
    fn listed(&self, _peer: &SocketAddr, _entries: usize) {}
    fn served(&self, _peer: &SocketAddr, _name: &str, _bytes: u64) {}
    fn rejected(&self, _peer: &SocketAddr, _reason: &str) {}
    fn disconnected(&self, _peer: &SocketAddr) {}
}

pub struct NoopAccessLog;
impl AccessLog for NoopAccessLog {}

/// Appends one timestamped line per event
pub struct TextAccessLog {
    file: Mutex<File>,
}

impl TextAccessLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl AccessLog for TextAccessLog {
    fn connected(&self, peer: &SocketAddr) {
        self.line(&format!("CONNECT peer={}", peer));
    }
    fn listed(&self, peer: &SocketAddr, entries: usize) {
        self.line(&format!("LIST peer={} entries={}", peer, entries));
    }
    fn served(&self, peer: &SocketAddr, name: &str, bytes: u64) {
        self.line(&format!("GET peer={} file={} bytes={}", peer, name, bytes));
    }
    fn rejected(&self, peer: &SocketAddr, reason: &str) {
        self.line(&format!("REJECT peer={} reason={}", peer, reason));
    }
    fn disconnected(&self, peer: &SocketAddr) {
        self.line(&format!("DISCONNECT peer={}", peer));
    }
}
