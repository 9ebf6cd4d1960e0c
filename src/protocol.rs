//! Shared protocol constants and message types for the lanshare wire format

use std::borrow::Cow;

use crate::error::ProtocolError;

/// Default TCP port for the file sharing service
pub const DEFAULT_PORT: u16 = 9876;

// Frame header: TAG (1) | LENGTH (4, little-endian)
pub const FRAME_HEADER_LEN: usize = 5;

// Maximum payload carried by a single message. Listing replies are truncated
// to fit; file data is split into chunks of at most this size.
pub const MAX_PAYLOAD_SIZE: usize = 8192;

pub const FILE_CHUNK_SIZE: usize = MAX_PAYLOAD_SIZE;

// Longest file name a GetFile request may carry
pub const MAX_FILENAME_LEN: usize = 255;

/// Reply text for an empty shared directory
pub const EMPTY_LISTING: &str = "No files available";

/// One-byte command tags. The tag space is fixed and not versioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    ListFiles = 1,
    GetFile = 2,
    FileData = 3,
    Error = 4,
}

impl Command {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            1 => Ok(Command::ListFiles),
            2 => Ok(Command::GetFile),
            3 => Ok(Command::FileData),
            4 => Ok(Command::Error),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(command: Command, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    pub fn list_request() -> Self {
        Self::new(Command::ListFiles, Vec::new())
    }

    pub fn get_file(filename: &str) -> Self {
        Self::new(Command::GetFile, filename.as_bytes())
    }

    pub fn file_data(chunk: &[u8]) -> Self {
        Self::new(Command::FileData, chunk)
    }

    pub fn error(text: &str) -> Self {
        Self::new(Command::Error, text.as_bytes())
    }

    /// Payload as text; invalid UTF-8 is replaced and trailing NULs dropped
    pub fn text(&self) -> Cow<'_, str> {
        let end = self
            .payload
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| i + 1);
        String::from_utf8_lossy(&self.payload[..end])
    }

    /// Serialize as header + payload
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        crate::protocol_core::validate_payload_size(self.payload.len())?;
        let header = crate::protocol_core::build_frame_header(self.command, self.payload.len() as u32);
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse one complete message from a buffer
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }
        // Tag is checked before length so a bad first byte always reports as such
        let command = Command::try_from(buf[0])?;
        if buf.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                expected: FRAME_HEADER_LEN,
                actual: buf.len(),
            });
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
        let (_, len) = crate::protocol_core::parse_frame_header(&header)?;
        let body = &buf[FRAME_HEADER_LEN..];
        if body.len() != len {
            return Err(ProtocolError::Truncated {
                expected: len,
                actual: body.len(),
            });
        }
        Ok(Self::new(command, body))
    }
}
