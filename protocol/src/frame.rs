//! Wire framing for one file transfer over a TCP connection.
//!
//! ```text
//! u8   protocol_tag  = 0x01 (legacy) | 0x02 (with destination)
//! u32  name_len      (big-endian, bounded)
//! u8[] name
//! u32  dest_len      (with-destination only)
//! u8[] dest          (with-destination only)
//! u64  payload_len
//! u8[] payload
//! ```
//!
//! All integers are big-endian. This is a fixed byte contract, not a serde
//! envelope, so it's read and written with raw `AsyncReadExt`/`AsyncWriteExt`
//! calls rather than a derive-based codec.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted length of a name or destination field.
pub const MAX_NAME_LEN: u32 = 4096;

/// Maximum accepted payload length (guards against a corrupt/hostile
/// length field asking for an absurd allocation before any byte is read).
pub const MAX_PAYLOAD_LEN: u64 = 16 * 1024 * 1024 * 1024; // 16 GiB

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolTag {
    Legacy,
    WithDest,
}

impl ProtocolTag {
    pub fn to_byte(self) -> u8 {
        match self {
            ProtocolTag::Legacy => 0x01,
            ProtocolTag::WithDest => 0x02,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(ProtocolTag::Legacy),
            0x02 => Some(ProtocolTag::WithDest),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed before a new frame started")]
    Eof,
    #[error("unknown protocol tag {0:#x}")]
    UnknownTag(u8),
    #[error("name field length {0} exceeds limit {MAX_NAME_LEN}")]
    NameTooLong(u32),
    #[error("destination field length {0} exceeds limit {MAX_NAME_LEN}")]
    DestTooLong(u32),
    #[error("payload length {0} exceeds limit {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge(u64),
    #[error("field is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Header fields read off the wire before the payload starts.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub tag: ProtocolTag,
    pub name: String,
    pub dest: Option<String>,
    pub payload_len: u64,
}

/// Read one frame header. Returns `Err(FrameError::Eof)` if the peer closed
/// the connection cleanly before sending a tag byte (the expected end of a
/// session), distinguishing that from a genuine parse error mid-frame.
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<FrameHeader, FrameError> {
    let mut tag_byte = [0u8; 1];
    match reader.read_exact(&mut tag_byte).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::Eof);
        }
        Err(err) => return Err(err.into()),
    }
    let tag = ProtocolTag::from_byte(tag_byte[0]).ok_or(FrameError::UnknownTag(tag_byte[0]))?;
    let name = read_length_prefixed_string(reader, FrameError::NameTooLong).await?;
    let dest = if tag == ProtocolTag::WithDest {
        Some(read_length_prefixed_string(reader, FrameError::DestTooLong).await?)
    } else {
        None
    };
    let payload_len = read_u64(reader).await?;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }
    Ok(FrameHeader {
        tag,
        name,
        dest,
        payload_len,
    })
}

async fn read_length_prefixed_string<R: AsyncRead + Unpin>(
    reader: &mut R,
    too_long: impl Fn(u32) -> FrameError,
) -> Result<String, FrameError> {
    let len = read_u32(reader).await?;
    if len > MAX_NAME_LEN {
        return Err(too_long(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(String::from_utf8(buf)?)
}

async fn read_u32<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32, FrameError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

/// Read the count-first variant's leading `u32 file_count`. Returns
/// `Ok(None)` if the peer closed the connection cleanly before sending it
/// (an empty session), distinguishing that from a genuine parse error.
pub async fn read_frame_count<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<u32>, FrameError> {
    let mut buf = [0u8; 4];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(Some(u32::from_be_bytes(buf))),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Write the count-first variant's leading `u32 file_count`.
pub async fn write_frame_count<W: AsyncWrite + Unpin>(
    writer: &mut W,
    file_count: u32,
) -> Result<(), FrameError> {
    writer.write_all(&file_count.to_be_bytes()).await?;
    Ok(())
}

async fn read_u64<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, FrameError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).await?;
    Ok(u64::from_be_bytes(buf))
}

/// Write a frame header (tag, name, optional destination, payload length).
/// The caller streams the payload bytes separately.
pub async fn write_header<W: AsyncWrite + Unpin>(
    writer: &mut W,
    tag: ProtocolTag,
    name: &str,
    dest: Option<&str>,
    payload_len: u64,
) -> Result<(), FrameError> {
    writer.write_all(&[tag.to_byte()]).await?;
    write_length_prefixed(writer, name.as_bytes()).await?;
    if tag == ProtocolTag::WithDest {
        let dest = dest.expect("with-destination frame must carry a destination");
        write_length_prefixed(writer, dest.as_bytes()).await?;
    }
    writer.write_all(&payload_len.to_be_bytes()).await?;
    Ok(())
}

async fn write_length_prefixed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), FrameError> {
    let len = u32::try_from(bytes.len()).map_err(|_| FrameError::NameTooLong(u32::MAX))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    Ok(())
}
