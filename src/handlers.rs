//! Per-connection request handling for the file server.
//!
//! A connection carries exactly one command. The handler reads it, answers
//! with a listing, a stream of file chunks, or an `Error` message, then closes
//! its write half.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use walkdir::WalkDir;

use crate::error::ProtocolError;
use crate::logger::AccessLog;
use crate::protocol::{
    Command, Message, EMPTY_LISTING, FILE_CHUNK_SIZE, MAX_FILENAME_LEN, MAX_PAYLOAD_SIZE,
};
use crate::protocol_core::{read_message_async, resolve_under_root, write_frame_async, write_message_async};

pub const ERR_INVALID_FILENAME: &str = "Invalid filename";
pub const ERR_FILE_UNAVAILABLE: &str = "File not found or cannot be accessed";
pub const ERR_OPEN_DIRECTORY: &str = "Error opening directory";
pub const ERR_UNKNOWN_COMMAND: &str = "Unknown command";
pub const ERR_TOO_LARGE: &str = "Message too large";

/// The directory being served. Immutable once the server starts.
#[derive(Clone, Debug)]
pub struct SharedRoot {
    path: PathBuf,
}

impl SharedRoot {
    /// `path` must already be canonical
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct Handler {
    root: Arc<SharedRoot>,
    access_log: Arc<dyn AccessLog>,
    peer: SocketAddr,
}

impl Handler {
    pub fn new(root: Arc<SharedRoot>, access_log: Arc<dyn AccessLog>, peer: SocketAddr) -> Self {
        Self {
            root,
            access_log,
            peer,
        }
    }

    /// Serve one request on `stream`. Protocol-level problems are answered
    /// with an `Error` message; only transport failures come back as `Err`.
    pub async fn serve<S>(&self, stream: &mut S) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.access_log.connected(&self.peer);
        let result = self.dispatch(stream).await;
        let _ = stream.shutdown().await;
        self.access_log.disconnected(&self.peer);
        result
    }

    async fn dispatch<S>(&self, stream: &mut S) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = match read_message_async(stream).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!("{} closed without sending a command", self.peer);
                return Ok(());
            }
            Err(ProtocolError::UnknownCommand(tag)) => {
                warn!("{} sent unknown command tag {}", self.peer, tag);
                return self.reject(stream, ERR_UNKNOWN_COMMAND).await;
            }
            Err(ProtocolError::PayloadTooLarge(size)) => {
                warn!("{} sent an oversized message ({} bytes)", self.peer, size);
                return self.reject(stream, ERR_TOO_LARGE).await;
            }
            Err(ProtocolError::Truncated { expected, actual }) => {
                warn!(
                    "{} sent a cut-off message ({} of {} bytes)",
                    self.peer, actual, expected
                );
                return self.reject(stream, ERR_UNKNOWN_COMMAND).await;
            }
            Err(e) => return Err(e),
        };

        match request.command {
            Command::ListFiles => self.list_files(stream).await,
            Command::GetFile => self.get_file(stream, &request.payload).await,
            // Reply-only tags are not valid requests
            Command::FileData | Command::Error => {
                warn!("{} sent {:?} as a request", self.peer, request.command);
                self.reject(stream, ERR_UNKNOWN_COMMAND).await
            }
        }
    }

    async fn list_files<S>(&self, stream: &mut S) -> Result<(), ProtocolError>
    where
        S: AsyncWrite + Unpin,
    {
        info!("{} requested file list", self.peer);
        let names = match collect_listing(self.root.path()) {
            Ok(names) => names,
            Err(e) => {
                warn!("cannot read {}: {}", self.root.path().display(), e);
                return self.reject(stream, ERR_OPEN_DIRECTORY).await;
            }
        };
        let (payload, entries) = build_listing_payload(&names, MAX_PAYLOAD_SIZE);
        if entries < names.len() {
            debug!(
                "listing truncated to {} of {} entries",
                entries,
                names.len()
            );
        }
        write_frame_async(stream, Command::ListFiles, &payload).await?;
        self.access_log.listed(&self.peer, entries);
        Ok(())
    }

    async fn get_file<S>(&self, stream: &mut S, payload: &[u8]) -> Result<(), ProtocolError>
    where
        S: AsyncWrite + Unpin,
    {
        let name = match validate_filename(payload) {
            Ok(name) => name,
            Err(reason) => {
                warn!("{} requested an invalid filename: {}", self.peer, reason);
                return self.reject(stream, ERR_INVALID_FILENAME).await;
            }
        };
        info!("{} requested file: {}", self.peer, name);

        let mut file = match self.open_shared(name).await {
            Ok(file) => file,
            Err(e) => {
                debug!("cannot open {:?}: {}", name, e);
                return self.reject(stream, ERR_FILE_UNAVAILABLE).await;
            }
        };

        let mut buf = vec![0u8; FILE_CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            write_frame_async(stream, Command::FileData, &buf[..n]).await?;
            sent += n as u64;
        }
        stream.shutdown().await?;

        info!("sent {} ({} bytes) to {}", name, sent, self.peer);
        self.access_log.served(&self.peer, name, sent);
        Ok(())
    }

    async fn open_shared(&self, name: &str) -> io::Result<File> {
        let path = resolve_under_root(self.root.path(), Path::new(name))?;
        let file = File::open(&path).await?;
        if !file.metadata().await?.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        }
        Ok(file)
    }

    async fn reject<S>(&self, stream: &mut S, text: &str) -> Result<(), ProtocolError>
    where
        S: AsyncWrite + Unpin,
    {
        self.access_log.rejected(&self.peer, text);
        write_message_async(stream, &Message::error(text)).await
    }
}

/// Regular, non-hidden entries directly under `root`, sorted by name
pub fn collect_listing(root: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // Depth 0 is the root itself; anything deeper is one bad entry
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                debug!("skipping unreadable entry: {}", e);
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        names.push(name.into_owned());
    }
    Ok(names)
}

/// Join names with `\n`, stopping before the payload would exceed `limit`.
/// Returns the payload and how many names it holds.
pub fn build_listing_payload(names: &[String], limit: usize) -> (Vec<u8>, usize) {
    let mut payload = Vec::new();
    let mut entries = 0;
    for name in names {
        let needed = name.len() + usize::from(!payload.is_empty());
        if payload.len() + needed > limit {
            break;
        }
        if !payload.is_empty() {
            payload.push(b'\n');
        }
        payload.extend_from_slice(name.as_bytes());
        entries += 1;
    }
    if entries == 0 {
        payload = EMPTY_LISTING.as_bytes().to_vec();
    }
    (payload, entries)
}

/// Check a requested name before anything touches the filesystem
pub fn validate_filename(payload: &[u8]) -> Result<&str, &'static str> {
    // Older clients terminate the name with NUL
    let mut end = payload.len();
    while end > 0 && payload[end - 1] == 0 {
        end -= 1;
    }
    let raw = &payload[..end];

    if raw.is_empty() {
        return Err("empty filename");
    }
    if raw.len() > MAX_FILENAME_LEN {
        return Err("filename too long");
    }
    let name = std::str::from_utf8(raw).map_err(|_| "filename is not UTF-8")?;
    if name.contains('\0') {
        return Err("filename contains NUL");
    }
    if name.contains("..") {
        return Err("filename contains '..'");
    }
    if name.starts_with('/') || name.starts_with('\\') || Path::new(name).is_absolute() {
        return Err("absolute path");
    }
    Ok(name)
}
