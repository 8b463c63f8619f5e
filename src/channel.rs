//! Secure channel: one encrypted duplex stream per connected party
//!
//! The stream is split once. The read half lives in a [`ChannelReader`] that
//! exactly one task owns (the session unit on the relay, the caller on the
//! client). The write half sits behind an async mutex in a cloneable
//! [`ChannelWriter`], so the relay can address another party's socket for
//! replies and streamed chunks without ever reading from it.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::FrameError;
use crate::frame::{write_envelope, Envelope, FrameReader};

/// Anything that can carry the protocol: a TLS stream in production, an
/// in-memory duplex pipe in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

pub type ChannelReader = FrameReader<ReadHalf<BoxedTransport>>;

/// Shared handle to the write side of a channel
#[derive(Clone)]
pub struct ChannelWriter {
    inner: Arc<Mutex<WriteHalf<BoxedTransport>>>,
    live: Arc<AtomicBool>,
    max_frame: usize,
}

impl ChannelWriter {
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.live.store(false, Ordering::Release);
    }

    /// Write raw bytes
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.lock().await.write_chunk(bytes).await
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), FrameError> {
        self.lock().await.write_envelope(envelope).await
    }

    /// Exclusive access for a multi-write sequence such as a relayed file
    pub async fn lock(&self) -> WriterGuard<'_> {
        WriterGuard {
            half: self.inner.lock().await,
            live: &self.live,
            max_frame: self.max_frame,
        }
    }

    /// Orderly shutdown of the write side; the peer sees EOF
    pub async fn close(&self) {
        let mut half = self.inner.lock().await;
        let _ = half.shutdown().await;
        self.mark_dead();
    }
}

/// Held lock on a channel's write half
pub struct WriterGuard<'a> {
    half: MutexGuard<'a, WriteHalf<BoxedTransport>>,
    live: &'a AtomicBool,
    max_frame: usize,
}

impl WriterGuard<'_> {
    pub async fn write_chunk(&mut self, bytes: &[u8]) -> io::Result<()> {
        let res = async {
            self.half.write_all(bytes).await?;
            self.half.flush().await
        }
        .await;
        if res.is_err() {
            self.live.store(false, Ordering::Release);
        }
        res
    }

    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), FrameError> {
        let res = write_envelope(&mut *self.half, envelope, self.max_frame).await;
        if let Err(FrameError::Io(_)) = &res {
            self.live.store(false, Ordering::Release);
        }
        res
    }
}

/// A full channel as handed out after the TLS handshake
pub struct SecureChannel {
    reader: ChannelReader,
    writer: ChannelWriter,
    peer: SocketAddr,
}

impl SecureChannel {
    pub fn new<T: Transport>(transport: T, peer: SocketAddr, max_frame: usize) -> Self {
        let boxed: BoxedTransport = Box::new(transport);
        let (rd, wr) = split(boxed);
        Self {
            reader: FrameReader::new(rd, max_frame),
            writer: ChannelWriter {
                inner: Arc::new(Mutex::new(wr)),
                live: Arc::new(AtomicBool::new(true)),
                max_frame,
            },
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_live(&self) -> bool {
        self.writer.is_live()
    }

    pub fn writer(&self) -> &ChannelWriter {
        &self.writer
    }

    /// Borrow both halves at once, e.g. to stream a file in while
    /// marking the writer on failure
    pub fn parts_mut(&mut self) -> (&mut ChannelReader, &ChannelWriter) {
        (&mut self.reader, &self.writer)
    }

    pub fn into_parts(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }

    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.writer.send(bytes).await
    }

    /// Up to `max_bytes` raw bytes; an empty buffer means the peer closed
    pub async fn recv(&mut self, max_bytes: usize) -> io::Result<Bytes> {
        let res = self.reader.recv(max_bytes).await;
        match &res {
            Ok(b) if b.is_empty() && max_bytes > 0 => self.writer.mark_dead(),
            Err(_) => self.writer.mark_dead(),
            _ => {}
        }
        res
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), FrameError> {
        self.writer.send_envelope(envelope).await
    }

    pub async fn read_envelope(&mut self) -> Result<Envelope, FrameError> {
        let res = self.reader.read_envelope().await;
        if matches!(res, Err(FrameError::ShortRead) | Err(FrameError::Io(_))) {
            self.writer.mark_dead();
        }
        res
    }

    pub async fn close(&self) {
        self.writer.close().await;
    }
}
