//! Frame codec for the file transfer stream.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 8 bytes: ASCII flag token, only the last byte is significant
//!   (`t` = encrypted, `f` = plain, `h` = halt)
//! - 8 bytes: name length (u64, little-endian)
//! - N bytes: UTF-8 name (relative path)
//! - 8 bytes: payload length (u64, little-endian)
//! - M bytes: payload, streamed in chunks
//!
//! A halt frame is the token alone; nothing follows it.
//!
//! The codec wraps any tokio stream so the same code drives a TCP
//! connection or an in-memory duplex pipe.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};

/// Length of the flag token in bytes.
pub const FLAG_TOKEN_LEN: usize = 8;

/// Length of every size field in bytes.
pub const LENGTH_FIELD_LEN: usize = 8;

/// Upper bound for a frame name. Larger values indicate a corrupt stream.
pub const MAX_NAME_LENGTH: u64 = 64 * 1024;

/// Default chunk size for streaming payloads (4KB).
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Name of the pseudo-file carrying folder metadata.
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Per-frame flag carried in the 8-byte token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionFlag {
    /// Payload is the file content as-is.
    Plain,
    /// Payload is an encrypted blob (`salt ++ iv ++ ciphertext`).
    Encrypted,
    /// End of the session. No fields follow.
    Halt,
}

impl EncryptionFlag {
    /// Returns the 8-byte token written on the wire.
    pub fn token(self) -> [u8; FLAG_TOKEN_LEN] {
        match self {
            EncryptionFlag::Plain => *b"encyp: f",
            EncryptionFlag::Encrypted => *b"encyp: t",
            EncryptionFlag::Halt => *b"encyp: h",
        }
    }

    /// Parses a token. Only the last byte matters; unknown values mean plain.
    pub fn from_token(token: &[u8; FLAG_TOKEN_LEN]) -> Self {
        match token[FLAG_TOKEN_LEN - 1] {
            b't' => EncryptionFlag::Encrypted,
            b'h' => EncryptionFlag::Halt,
            _ => EncryptionFlag::Plain,
        }
    }

    /// Returns true for encrypted frames.
    #[inline]
    pub fn is_encrypted(self) -> bool {
        self == EncryptionFlag::Encrypted
    }
}

/// Header of a single frame; the payload follows on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Frame flag.
    pub flag: EncryptionFlag,
    /// Relative name of the file, forward-slash separated.
    pub name: String,
    /// Number of payload bytes that follow the header.
    pub payload_len: u64,
}

impl FrameHeader {
    /// Create a header for a file frame.
    pub fn new(flag: EncryptionFlag, name: impl Into<String>, payload_len: u64) -> Self {
        Self {
            flag,
            name: name.into(),
            payload_len,
        }
    }

    /// Create the halt header.
    pub fn halt() -> Self {
        Self::new(EncryptionFlag::Halt, String::new(), 0)
    }

    /// Returns true if this header terminates the session.
    pub fn is_halt(&self) -> bool {
        self.flag == EncryptionFlag::Halt
    }

    /// Returns true if the frame carries folder metadata.
    pub fn is_metadata(&self) -> bool {
        self.name == METADATA_FILE_NAME
    }

    /// Encode the header into its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let token = self.flag.token();
        if self.is_halt() {
            return token.to_vec();
        }

        let name = self.name.as_bytes();
        let mut output = Vec::with_capacity(FLAG_TOKEN_LEN + 2 * LENGTH_FIELD_LEN + name.len());
        output.extend_from_slice(&token);
        output.extend_from_slice(&(name.len() as u64).to_le_bytes());
        output.extend_from_slice(name);
        output.extend_from_slice(&self.payload_len.to_le_bytes());
        output
    }
}

/// Converts Windows separators into forward slashes.
pub fn normalize_name(name: &str) -> String {
    name.replace('\\', "/")
}

/// Encoder and decoder for frames over an async byte stream.
#[derive(Debug)]
pub struct FrameCodec<S> {
    stream: S,
}

impl<S> FrameCodec<S> {
    /// Wrap a stream.
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Unwrap the codec, returning the stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncWrite + Unpin> FrameCodec<S> {
    /// Write a frame header. The payload is written afterwards with [`write_chunk`].
    ///
    /// [`write_chunk`]: FrameCodec::write_chunk
    pub async fn write_frame(
        &mut self,
        flag: EncryptionFlag,
        name: &str,
        payload_len: u64,
    ) -> Result<()> {
        let header = FrameHeader::new(flag, name, payload_len);
        self.stream.write_all(&header.encode()).await?;
        Ok(())
    }

    /// Write the halt token and flush.
    pub async fn write_halt(&mut self) -> Result<()> {
        self.stream.write_all(&EncryptionFlag::Halt.token()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Write a chunk of payload bytes.
    pub async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await?;
        Ok(())
    }

    /// Write a u64 length followed by the bytes it describes.
    pub async fn write_length_prefixed(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream
            .write_all(&(bytes.len() as u64).to_le_bytes())
            .await?;
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Flush buffered data.
    pub async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write half of the stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl<S: AsyncRead + Unpin> FrameCodec<S> {
    /// Read exactly `n` bytes.
    ///
    /// Fails with [`ProtocolError::ConnectionClosed`] if the stream ends first.
    pub async fn read_exactly(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; n];
        self.fill(&mut buffer).await?;
        Ok(buffer)
    }

    /// Read a little-endian u64 size field.
    pub async fn read_u64(&mut self) -> Result<u64> {
        let mut bytes = [0u8; LENGTH_FIELD_LEN];
        self.fill(&mut bytes).await?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Read the next frame header.
    ///
    /// Returns `None` if the stream ends cleanly between frames. A halt
    /// token is returned without reading any further fields.
    pub async fn read_header(&mut self) -> Result<Option<FrameHeader>> {
        let mut token = [0u8; FLAG_TOKEN_LEN];
        let first = self.stream.read(&mut token).await?;
        if first == 0 {
            return Ok(None);
        }
        if first < FLAG_TOKEN_LEN {
            self.fill(&mut token[first..]).await?;
        }

        let flag = EncryptionFlag::from_token(&token);
        if flag == EncryptionFlag::Halt {
            return Ok(Some(FrameHeader::halt()));
        }

        let name_len = self.read_u64().await?;
        if name_len == 0 {
            // An empty name is the older end-of-transfer signal.
            return Ok(Some(FrameHeader::halt()));
        }
        if name_len > MAX_NAME_LENGTH {
            return Err(ProtocolError::Deserialization(format!(
                "frame name length {} exceeds maximum of {}",
                name_len, MAX_NAME_LENGTH
            )));
        }

        let name_bytes = self.read_exactly(name_len as usize).await?;
        let name = String::from_utf8(name_bytes).map_err(|e| {
            ProtocolError::Deserialization(format!("frame name is not valid UTF-8: {}", e))
        })?;

        let payload_len = self.read_u64().await?;

        Ok(Some(FrameHeader::new(
            flag,
            normalize_name(&name),
            payload_len,
        )))
    }

    /// Read the next payload chunk: `min(remaining, chunk_size)` bytes exactly.
    pub async fn read_payload_chunk(
        &mut self,
        remaining: u64,
        chunk_size: usize,
    ) -> Result<Vec<u8>> {
        let len = remaining.min(chunk_size as u64) as usize;
        self.read_exactly(len).await
    }

    /// Read a u64 length followed by that many bytes, rejecting lengths over `max`.
    pub async fn read_length_prefixed(&mut self, max: u64) -> Result<Vec<u8>> {
        let len = self.read_u64().await?;
        if len > max {
            return Err(ProtocolError::Deserialization(format!(
                "length prefix {} exceeds maximum of {}",
                len, max
            )));
        }
        self.read_exactly(len as usize).await
    }

    async fn fill(&mut self, buffer: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buffer.len() {
            let n = self.stream.read(&mut buffer[filled..]).await?;
            if n == 0 {
                return Err(ProtocolError::ConnectionClosed(format!(
                    "stream ended after {} of {} bytes",
                    filled,
                    buffer.len()
                )));
            }
            filled += n;
        }
        Ok(())
    }
}
