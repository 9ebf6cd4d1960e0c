//! `list` and `get` on top of a connected socket.
//!
//! Both operations are one request per connection and fully blocking.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::config::ClientConfig;
use crate::connector::Connector;
use crate::error::ClientError;
use crate::progress::TransferProgress;
use crate::protocol::{Command, Message};
use crate::protocol_core::{read_message, write_message};

/// A completed download
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Download {
    pub path: PathBuf,
    pub bytes: u64,
}

pub struct Client {
    connector: Connector,
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            connector: Connector::new(config.port),
            config,
        }
    }

    /// Use a custom connector (its port wins over the config's)
    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = connector;
        self
    }

    /// Fetch the server's listing text, one file name per line
    pub fn list(&self, server: &str) -> Result<String, ClientError> {
        let mut stream = self.connector.connect(server)?;
        write_message(&mut stream, &Message::list_request())?;

        match read_message(&mut stream)? {
            Some(msg) if msg.command == Command::ListFiles => Ok(msg.text().into_owned()),
            Some(msg) if msg.command == Command::Error => {
                Err(ClientError::Server(msg.text().into_owned()))
            }
            Some(msg) => Err(ClientError::UnexpectedReply(msg.command)),
            None => Err(ClientError::NoReply),
        }
    }

    /// Download `filename` into the configured directory.
    ///
    /// The local file is truncated up front and removed again if the server
    /// reports an error or the transfer fails part way.
    pub fn get(&self, server: &str, filename: &str) -> Result<Download, ClientError> {
        let local_name = local_file_name(filename)?;
        let mut stream = self.connector.connect(server)?;
        write_message(&mut stream, &Message::get_file(filename))?;

        let path = self.config.download_dir.join(local_name);
        let mut partial = PartialFile::create(&path)?;
        info!("Downloading {} from {}...", filename, server);

        let progress = TransferProgress::new(self.config.show_progress, filename);
        match receive_file(&mut stream, &mut partial, &progress) {
            Ok(bytes) => {
                progress.finish(bytes);
                partial.commit()?;
                info!("Downloaded {} ({} bytes)", filename, bytes);
                Ok(Download { path, bytes })
            }
            Err(e) => {
                progress.fail(&e.to_string());
                debug!("removing partial download {}", path.display());
                Err(e)
            }
        }
    }
}

fn receive_file(
    stream: &mut TcpStream,
    partial: &mut PartialFile,
    progress: &TransferProgress,
) -> Result<u64, ClientError> {
    let mut total = 0u64;
    // End-of-stream is the only end-of-transfer signal
    while let Some(msg) = read_message(stream)? {
        match msg.command {
            Command::FileData => {
                partial.write(&msg.payload)?;
                total += msg.payload.len() as u64;
                progress.advance(msg.payload.len() as u64);
            }
            Command::Error => return Err(ClientError::Server(msg.text().into_owned())),
            other => return Err(ClientError::UnexpectedReply(other)),
        }
    }
    Ok(total)
}

// Downloads land in the download directory under the requested name's last component
fn local_file_name(filename: &str) -> Result<&std::ffi::OsStr, ClientError> {
    if filename.is_empty() {
        return Err(ClientError::InvalidFilename(filename.to_string()));
    }
    Path::new(filename)
        .file_name()
        .ok_or_else(|| ClientError::InvalidFilename(filename.to_string()))
}

/// Output file that deletes itself unless committed
struct PartialFile {
    path: PathBuf,
    file: Option<File>,
}

impl PartialFile {
    fn create(path: &Path) -> Result<Self, ClientError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| ClientError::local(format!("Error creating local file {}", path.display()), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    fn write(&mut self, buf: &[u8]) -> Result<(), ClientError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ClientError::local("Error writing to file", std::io::ErrorKind::NotConnected.into()))?;
        file.write_all(buf)
            .map_err(|e| ClientError::local("Error writing to file", e))
    }

    fn commit(mut self) -> Result<(), ClientError> {
        if let Some(file) = self.file.as_ref() {
            file.sync_all()
                .map_err(|e| ClientError::local("Error writing to file", e))?;
        }
        self.file = None;
        Ok(())
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        // Still holding the handle means the download never committed
        if self.file.take().is_some() {
            let _ = fs::remove_file(&self.path);
        }
    }
}
