//! Length-prefixed JSON envelope codec
//!
//! Every message on the wire is `[u32 big-endian length][UTF-8 JSON body]`.
//! Reads go through [`FrameReader`], which keeps partially received bytes in
//! its own buffer: a `read_envelope` future dropped half way (for example
//! inside `tokio::select!`) loses nothing, and raw file bytes that arrived
//! right behind a frame are handed out by [`FrameReader::recv_into`] before
//! the socket is touched again.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;
use crate::protocol::LENGTH_PREFIX;

// Minimum spare capacity before each socket read
const READ_RESERVE: usize = 8 * 1024;

/// One logical protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: u8,
    #[serde(rename = "sub-action")]
    pub sub_action: u8,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(action: u8, sub_action: u8, data: impl Into<Value>) -> Self {
        Self { action, sub_action, data: data.into() }
    }

    /// The `(action, sub_action)` routing key
    pub fn route(&self) -> (u8, u8) {
        (self.action, self.sub_action)
    }
}

/// Serialize an envelope with its 4-byte big-endian length prefix
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(envelope)
        .map_err(|e| FrameError::MalformedEnvelope(e.to_string()))?;
    let len = u32::try_from(body.len()).map_err(|_| FrameError::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse one frame body (without its length prefix)
pub fn decode_body(body: &[u8]) -> Result<Envelope, FrameError> {
    serde_json::from_slice(body).map_err(|e| FrameError::MalformedEnvelope(e.to_string()))
}

/// Encode and write one envelope, refusing bodies above `max_frame`
pub async fn write_envelope<W>(
    writer: &mut W,
    envelope: &Envelope,
    max_frame: usize,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = encode(envelope)?;
    let body_len = bytes.len() - LENGTH_PREFIX;
    if body_len > max_frame {
        return Err(FrameError::FrameTooLarge { len: body_len, max: max_frame });
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Buffered, cancel-safe reader for envelopes and raw chunk bytes
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_frame: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, max_frame: usize) -> Self {
        Self { inner, buf: BytesMut::with_capacity(READ_RESERVE), max_frame }
    }

    /// Read exactly one envelope. All-or-nothing: no partial envelope is ever returned.
    pub async fn read_envelope(&mut self) -> Result<Envelope, FrameError> {
        loop {
            if let Some(body) = self.take_frame()? {
                return decode_body(&body);
            }
            if self.buf.capacity() - self.buf.len() < READ_RESERVE {
                self.buf.reserve(READ_RESERVE);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(self.eof_error());
            }
        }
    }

    /// Raw read of up to `out.len()` bytes, buffered bytes first. `Ok(0)` means EOF.
    pub async fn recv_into(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if !self.buf.is_empty() {
            let n = out.len().min(self.buf.len());
            out[..n].copy_from_slice(&self.buf[..n]);
            self.buf.advance(n);
            return Ok(n);
        }
        self.inner.read(out).await
    }

    /// Raw read of up to `max_bytes`; an empty result signals orderly close
    pub async fn recv(&mut self, max_bytes: usize) -> std::io::Result<Bytes> {
        if !self.buf.is_empty() {
            let n = max_bytes.min(self.buf.len());
            return Ok(self.buf.split_to(n).freeze());
        }
        let mut out = vec![0u8; max_bytes];
        let n = self.inner.read(&mut out).await?;
        out.truncate(n);
        Ok(Bytes::from(out))
    }

    fn take_frame(&mut self) -> Result<Option<BytesMut>, FrameError> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame {
            return Err(FrameError::FrameTooLarge { len, max: self.max_frame });
        }
        let total = LENGTH_PREFIX + len;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(LENGTH_PREFIX);
        Ok(Some(self.buf.split_to(len)))
    }

    fn eof_error(&self) -> FrameError {
        if self.buf.len() < LENGTH_PREFIX {
            return FrameError::ShortRead;
        }
        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX]);
        FrameError::TruncatedFrame {
            expected: u32::from_be_bytes(prefix) as usize,
            received: self.buf.len() - LENGTH_PREFIX,
        }
    }
}
