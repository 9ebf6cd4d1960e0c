//! Framing logic shared by the blocking client and the async server
//!
//! Both sides speak the same frame layout, so the header helpers and the
//! read/write loops live here once, in a `std::io` flavour for the client and
//! a tokio flavour for the server handlers.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::protocol::{Command, Message, FRAME_HEADER_LEN, MAX_PAYLOAD_SIZE};

/// Validate payload size against protocol::MAX_PAYLOAD_SIZE
pub fn validate_payload_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::PayloadTooLarge(size));
    }
    Ok(())
}

/// Build frame header (5 bytes)
/// Format: TAG (1) | LENGTH (4)
pub fn build_frame_header(command: Command, payload_len: u32) -> [u8; FRAME_HEADER_LEN] {
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0] = command.tag();
    header[1..5].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (command, payload_length)
pub fn parse_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> Result<(Command, usize), ProtocolError> {
    let command = Command::try_from(header[0])?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    validate_payload_size(len)?;
    Ok((command, len))
}

// Fill the header, distinguishing a clean close (nothing read) from a cut-off one
fn read_header<R: Read>(reader: &mut R) -> Result<Option<[u8; FRAME_HEADER_LEN]>, ProtocolError> {
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        match reader.read(&mut hdr[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(ProtocolError::Truncated {
                    expected: FRAME_HEADER_LEN,
                    actual: filled,
                })
            }
            Ok(n) => {
                // Reject a bad tag as soon as it arrives, even if the rest never does
                if filled == 0 {
                    Command::try_from(hdr[0])?;
                }
                filled += n;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(hdr))
}

/// Write one frame from a borrowed payload
pub fn write_frame<W: Write>(writer: &mut W, command: Command, payload: &[u8]) -> Result<(), ProtocolError> {
    validate_payload_size(payload.len())?;
    let hdr = build_frame_header(command, payload.len() as u32);
    writer.write_all(&hdr)?;
    if !payload.is_empty() {
        writer.write_all(payload)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError> {
    write_frame(writer, msg.command, &msg.payload)
}

/// Read one framed message; `Ok(None)` on end-of-stream before a header
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>, ProtocolError> {
    let Some(hdr) = read_header(reader)? else {
        return Ok(None);
    };
    let (command, len) = parse_frame_header(&hdr)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        reader.read_exact(&mut payload).map_err(|e| truncated_or_io(e, len))?;
    }
    Ok(Some(Message { command, payload }))
}

pub async fn write_frame_async<W>(
    writer: &mut W,
    command: Command,
    payload: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    validate_payload_size(payload.len())?;
    let hdr = build_frame_header(command, payload.len() as u32);
    writer.write_all(&hdr).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub async fn write_message_async<W>(writer: &mut W, msg: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    write_frame_async(writer, msg.command, &msg.payload).await
}

pub async fn read_message_async<R>(reader: &mut R) -> Result<Option<Message>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut hdr[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated {
                expected: FRAME_HEADER_LEN,
                actual: filled,
            });
        }
        if filled == 0 {
            Command::try_from(hdr[0])?;
        }
        filled += n;
    }
    let (command, len) = parse_frame_header(&hdr)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| truncated_or_io(e, len))?;
    }
    Ok(Some(Message { command, payload }))
}

fn truncated_or_io(e: std::io::Error, expected: usize) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated {
            expected,
            actual: 0,
        }
    } else {
        ProtocolError::Io(e)
    }
}

/// Resolve a requested name to a path safely under `root`.
///
/// Rejects NUL bytes, absolute/rooted/prefixed paths and parent components,
/// then canonicalizes so a symlink cannot lead outside the root. `root` must
/// already be canonical. Only existing paths resolve.
pub fn resolve_under_root(root: &Path, name: &Path) -> std::io::Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};
    use std::io::{Error, ErrorKind};

    if name.to_string_lossy().contains('\0') {
        return Err(Error::new(ErrorKind::InvalidInput, "path contains NUL byte"));
    }

    let mut safe = PathBuf::new();
    for component in name.components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("path contains disallowed component: {:?}", component),
                ));
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(Error::new(ErrorKind::InvalidInput, "empty path"));
    }

    let resolved = root.join(&safe).canonicalize()?;
    if !resolved.starts_with(root) {
        return Err(Error::new(
            ErrorKind::PermissionDenied,
            format!("path {:?} escapes root", name),
        ));
    }
    Ok(resolved)
}
