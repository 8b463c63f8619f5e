//! Chunked byte streaming
//!
//! Endpoint side: [`send_file`] and [`receive_file`] move one file between a
//! local path and a channel. Relay side: [`relay`] pipes exactly `filesize`
//! bytes from the initiator's reader into the target's writer, holding at
//! most one chunk in memory. All three compute the chunk size from the
//! declared file size with [`chunk_size_for`], so nothing about chunking is
//! negotiated on the wire.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::ChannelWriter;
use crate::error::TransferError;
use crate::frame::FrameReader;
use crate::message::{FileMetadata, ServerMessage, TransferReport};
use crate::protocol::chunk_size_for;

fn chunk_buffer(filesize: u64) -> Vec<u8> {
    let chunk = chunk_size_for(filesize);
    let len = usize::try_from(filesize).map_or(chunk, |f| f.min(chunk));
    vec![0u8; len]
}

fn want(chunk: usize, done: u64, total: u64) -> usize {
    (chunk as u64).min(total - done) as usize
}

/// Stream exactly `filesize` bytes of `path` into `writer`
pub async fn send_file(
    writer: &ChannelWriter,
    path: &Path,
    filesize: u64,
    mut on_progress: impl FnMut(u64),
) -> Result<u64, TransferError> {
    let mut file = File::open(path).await?;
    let chunk = chunk_size_for(filesize);
    let mut buf = chunk_buffer(filesize);
    let mut guard = writer.lock().await;
    let mut sent = 0u64;

    while sent < filesize {
        let n = file.read(&mut buf[..want(chunk, sent, filesize)]).await?;
        if n == 0 {
            return Err(TransferError::InvalidMetadata(format!(
                "{} shrank to {} bytes while sending",
                path.display(),
                sent
            )));
        }
        if let Err(e) = guard.write_chunk(&buf[..n]).await {
            debug!(error = %e, sent, "relay stopped accepting bytes");
            return Err(TransferError::ConnectionLost { transferred: sent, expected: filesize });
        }
        sent += n as u64;
        on_progress(sent);
    }
    Ok(sent)
}

/// Read exactly `filesize` bytes from `source` into a new file at `dest`.
///
/// Short reads are accumulated. EOF or `idle` passing without a byte before
/// the full size arrives is `ConnectionLost`, and the partial file is removed.
pub async fn receive_file<R>(
    source: &mut FrameReader<R>,
    dest: &Path,
    filesize: u64,
    idle: Duration,
    mut on_progress: impl FnMut(u64),
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(dest).await?;
    let chunk = chunk_size_for(filesize);
    let mut buf = chunk_buffer(filesize);
    let mut received = 0u64;

    let res: Result<u64, TransferError> = async {
        while received < filesize {
            let n = match timeout(idle, source.recv_into(&mut buf[..want(chunk, received, filesize)])).await {
                Ok(Ok(n)) if n > 0 => n,
                Ok(Err(e)) => {
                    debug!(error = %e, received, "read failed mid-transfer");
                    0
                }
                _ => 0,
            };
            if n == 0 {
                return Err(TransferError::ConnectionLost { transferred: received, expected: filesize });
            }
            file.write_all(&buf[..n]).await?;
            received += n as u64;
            on_progress(received);
        }
        file.flush().await?;
        Ok(received)
    }
    .await;

    if res.is_err() {
        drop(file);
        if let Err(e) = tokio::fs::remove_file(dest).await {
            debug!(path = %dest.display(), error = %e, "could not remove partial file");
        }
    }
    res
}

/// Where an offered file lands: the last normal component of `filename`
/// under `dir`. Traversal, roots and drive prefixes are stripped.
pub fn destination_path(dir: &Path, filename: &str) -> Result<PathBuf, TransferError> {
    if filename.contains('\0') {
        return Err(TransferError::InvalidMetadata("filename contains NUL".into()));
    }
    let unified = filename.replace('\\', "/");
    let name = Path::new(&unified)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s),
            _ => None,
        })
        .last()
        .ok_or_else(|| TransferError::InvalidMetadata(format!("no usable file name in {filename:?}")))?;
    #[cfg(windows)]
    if name.to_string_lossy().contains(':') {
        return Err(TransferError::InvalidMetadata("file name contains a colon".into()));
    }
    Ok(dir.join(name))
}

/// What happened during one relayed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub filename: String,
    pub expected: u64,
    /// Bytes read from the initiator
    pub transferred: u64,
    /// Bytes written to the target
    pub delivered: u64,
    pub reads: u64,
    pub writes: u64,
    /// Initiator's stream ended or stalled before `expected` bytes
    pub source_lost: bool,
    /// Target's channel failed; remaining bytes were drained and dropped
    pub sink_lost: bool,
}

impl RelayOutcome {
    pub fn is_complete(&self) -> bool {
        !self.source_lost && !self.sink_lost && self.delivered == self.expected
    }

    /// Report for the initiator, counted in bytes that reached the target
    pub fn sender_report(&self) -> TransferReport {
        TransferReport::new(self.filename.clone(), self.delivered, self.expected)
    }

    pub fn receiver_report(&self) -> TransferReport {
        TransferReport::new(self.filename.clone(), self.delivered, self.expected)
    }
}

/// Forward `meta` to `sink`, then pipe `meta.filesize` raw bytes across.
///
/// The sink's write lock is held for the whole transfer so no other frame can
/// land in the middle of the byte stream. A failing sink does not stop the
/// reads: the initiator's bytes are drained up to `filesize` so its framing
/// stays intact. On success the target's completion report is written before
/// the lock is released.
pub async fn relay<R>(
    source: &mut FrameReader<R>,
    sink: &ChannelWriter,
    meta: &FileMetadata,
    idle: Duration,
) -> RelayOutcome
where
    R: AsyncRead + Unpin,
{
    let expected = meta.filesize;
    let chunk = chunk_size_for(expected);
    let mut buf = chunk_buffer(expected);
    let mut out = RelayOutcome {
        filename: meta.filename.clone(),
        expected,
        transferred: 0,
        delivered: 0,
        reads: 0,
        writes: 0,
        source_lost: false,
        sink_lost: false,
    };

    let mut guard = sink.lock().await;
    if let Err(e) = guard
        .write_envelope(&ServerMessage::Metadata(meta.clone()).into_envelope())
        .await
    {
        warn!(error = %e, file = %meta.filename, "could not forward metadata to recipient");
        out.sink_lost = true;
    }
    info!(file = %meta.filename, size = expected, chunk, "relaying");

    while out.transferred < expected {
        let slot = &mut buf[..want(chunk, out.transferred, expected)];
        let n = match timeout(idle, source.recv_into(slot)).await {
            Ok(Ok(n)) if n > 0 => n,
            Ok(Ok(_)) => {
                warn!(received = out.transferred, expected, "sender closed mid-transfer");
                out.source_lost = true;
                break;
            }
            Ok(Err(e)) => {
                warn!(error = %e, received = out.transferred, expected, "sender read failed mid-transfer");
                out.source_lost = true;
                break;
            }
            Err(_) => {
                warn!(received = out.transferred, expected, idle_secs = idle.as_secs(), "sender stalled mid-transfer");
                out.source_lost = true;
                break;
            }
        };
        out.reads += 1;
        out.transferred += n as u64;

        if out.sink_lost {
            continue;
        }
        match timeout(idle, guard.write_chunk(&buf[..n])).await {
            Ok(Ok(())) => {
                out.writes += 1;
                out.delivered += n as u64;
            }
            Ok(Err(e)) => {
                warn!(error = %e, delivered = out.delivered, "recipient write failed; draining sender");
                out.sink_lost = true;
            }
            Err(_) => {
                warn!(delivered = out.delivered, "recipient stalled; draining sender");
                sink.mark_dead();
                out.sink_lost = true;
            }
        }
    }

    if out.is_complete() {
        let report = ServerMessage::ReceiverReport(out.receiver_report()).into_envelope();
        if let Err(e) = guard.write_envelope(&report).await {
            warn!(error = %e, "could not deliver completion report to recipient");
            out.sink_lost = true;
        }
    }
    debug!(?out, "relay finished");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SecureChannel;
    use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
    use std::net::SocketAddr;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    const IDLE: Duration = Duration::from_secs(5);

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn meta(size: u64) -> FileMetadata {
        FileMetadata { filename: "report.pdf".into(), filesize: size }
    }

    // Drain the target end: one metadata frame, the raw bytes, and whatever follows
    async fn collect(target: DuplexStream, size: usize) -> (FileMetadata, Vec<u8>, Option<TransferReport>) {
        let mut chan = SecureChannel::new(target, addr(), DEFAULT_MAX_FRAME_SIZE);
        let m = match ServerMessage::parse(&chan.read_envelope().await.unwrap()).unwrap() {
            ServerMessage::Metadata(m) => m,
            other => panic!("expected metadata, got {other:?}"),
        };
        let mut bytes = Vec::with_capacity(size);
        while bytes.len() < size {
            let got = chan.recv((size - bytes.len()).min(64 * 1024)).await.unwrap();
            if got.is_empty() {
                return (m, bytes, None);
            }
            bytes.extend_from_slice(&got);
        }
        let report = match chan.read_envelope().await {
            Ok(env) => match ServerMessage::parse(&env).unwrap() {
                ServerMessage::ReceiverReport(r) => Some(r),
                other => panic!("expected a report, got {other:?}"),
            },
            Err(_) => None,
        };
        (m, bytes, report)
    }

    #[tokio::test]
    async fn relay_issues_ceil_reads_and_matching_writes() {
        let size = 300 * 1024 + 17;
        let data = pattern(size);
        let (mut sender, relay_in) = duplex(size + 1024);
        sender.write_all(&data).await.unwrap();

        let (relay_out, target) = duplex(64 * 1024);
        let sink = SecureChannel::new(relay_out, addr(), DEFAULT_MAX_FRAME_SIZE);
        let collector = tokio::spawn(collect(target, size));

        let mut source = FrameReader::new(relay_in, DEFAULT_MAX_FRAME_SIZE);
        let out = relay(&mut source, sink.writer(), &meta(size as u64), IDLE).await;

        let chunk = chunk_size_for(size as u64) as u64;
        assert_eq!(chunk, 16 * 1024);
        assert_eq!(out.reads, (size as u64).div_ceil(chunk));
        assert_eq!(out.writes, out.reads);
        assert!(out.is_complete());
        assert_eq!(out.delivered, size as u64);

        let (m, bytes, report) = collector.await.unwrap();
        assert_eq!(m, meta(size as u64));
        assert_eq!(bytes, data);
        assert_eq!(report.unwrap(), TransferReport::new("report.pdf", size as u64, size as u64));
    }

    #[tokio::test]
    async fn sender_drop_midway_is_incomplete() {
        let expected = 10 * 1024 * 1024u64;
        let sent = 4 * 1024 * 1024usize;
        let (mut sender, relay_in) = duplex(256 * 1024);
        tokio::spawn(async move {
            sender.write_all(&pattern(sent)).await.unwrap();
            drop(sender);
        });

        let (relay_out, target) = duplex(256 * 1024);
        let sink = SecureChannel::new(relay_out, addr(), DEFAULT_MAX_FRAME_SIZE);
        let collector = tokio::spawn(collect(target, expected as usize));

        let mut source = FrameReader::new(relay_in, DEFAULT_MAX_FRAME_SIZE);
        let out = relay(&mut source, sink.writer(), &meta(expected), IDLE).await;
        assert!(out.source_lost);
        assert!(!out.is_complete());
        assert_eq!(out.transferred, sent as u64);
        assert_eq!(out.delivered, sent as u64);
        assert_eq!(out.sender_report(), TransferReport::new("report.pdf", 4194304, 10485760));

        sink.close().await;
        let (_, bytes, report) = collector.await.unwrap();
        assert_eq!(bytes.len(), sent);
        assert!(report.is_none());
    }

    #[tokio::test]
    async fn lost_recipient_still_drains_sender() {
        let size = 200 * 1024;
        let data = pattern(size);
        let (mut sender, relay_in) = duplex(size + 1024);
        sender.write_all(&data).await.unwrap();
        sender.write_all(b"tail").await.unwrap();

        let (relay_out, target) = duplex(1024);
        drop(target);
        let sink = SecureChannel::new(relay_out, addr(), DEFAULT_MAX_FRAME_SIZE);

        let mut source = FrameReader::new(relay_in, DEFAULT_MAX_FRAME_SIZE);
        let out = relay(&mut source, sink.writer(), &meta(size as u64), IDLE).await;
        assert!(out.sink_lost);
        assert!(!out.source_lost);
        assert_eq!(out.transferred, size as u64);
        assert_eq!(out.delivered, 0);
        assert!(!out.sender_report().complete);
        assert!(!sink.is_live());

        // The byte right after the file is untouched
        let mut rest = [0u8; 4];
        let n = source.recv_into(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b"tail");
    }

    #[tokio::test]
    async fn empty_file_needs_no_reads() {
        let (_sender, relay_in) = duplex(64);
        let (relay_out, target) = duplex(1024);
        let sink = SecureChannel::new(relay_out, addr(), DEFAULT_MAX_FRAME_SIZE);
        let collector = tokio::spawn(collect(target, 0));
        let mut source = FrameReader::new(relay_in, DEFAULT_MAX_FRAME_SIZE);
        let out = relay(&mut source, sink.writer(), &meta(0), IDLE).await;
        assert_eq!(out.reads, 0);
        assert!(out.is_complete());
        let (_, _, report) = collector.await.unwrap();
        assert!(report.unwrap().complete);
    }

    #[tokio::test]
    async fn endpoints_move_a_file_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.bin");
        let dst = dir.path().join("out.bin");
        let data = pattern(150 * 1024 + 3);
        std::fs::write(&src, &data).unwrap();

        let (a, b) = duplex(8 * 1024);
        let left = SecureChannel::new(a, addr(), DEFAULT_MAX_FRAME_SIZE);
        let (mut reader, _w) = SecureChannel::new(b, addr(), DEFAULT_MAX_FRAME_SIZE).into_parts();

        let size = data.len() as u64;
        let send = tokio::spawn(async move { send_file(left.writer(), &src, size, |_| {}).await });
        let mut ticks = 0;
        let got = receive_file(&mut reader, &dst, size, IDLE, |_| ticks += 1).await.unwrap();
        assert_eq!(got, size);
        assert!(ticks >= 10);
        assert_eq!(send.await.unwrap().unwrap(), size);
        assert_eq!(std::fs::read(&dst).unwrap(), data);
    }

    #[tokio::test]
    async fn early_eof_is_connection_lost_and_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out.bin");
        let (mut a, b) = duplex(1024);
        a.write_all(&pattern(100)).await.unwrap();
        drop(a);
        let mut reader = FrameReader::new(b, DEFAULT_MAX_FRAME_SIZE);
        let err = receive_file(&mut reader, &dst, 1000, IDLE, |_| {}).await.unwrap_err();
        assert!(matches!(err, TransferError::ConnectionLost { transferred: 100, expected: 1000 }));
        assert!(!dst.exists());
    }

    #[tokio::test]
    async fn stalled_stream_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (_a, b) = duplex(1024);
        let mut reader = FrameReader::new(b, DEFAULT_MAX_FRAME_SIZE);
        let err = receive_file(&mut reader, &dir.path().join("x"), 10, Duration::from_millis(30), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::ConnectionLost { transferred: 0, expected: 10 }));
    }

    #[test]
    fn destination_is_a_single_component() {
        let root = Path::new("/srv/in");
        assert_eq!(destination_path(root, "report.pdf").unwrap(), root.join("report.pdf"));
        assert_eq!(destination_path(root, "../../etc/passwd").unwrap(), root.join("passwd"));
        assert_eq!(destination_path(root, "/abs/path/x.txt").unwrap(), root.join("x.txt"));
        assert_eq!(destination_path(root, "C:\\Users\\bob\\doc.txt").unwrap(), root.join("doc.txt"));
        assert!(destination_path(root, "..").is_err());
        assert!(destination_path(root, "/").is_err());
        assert!(destination_path(root, "a\0b").is_err());
    }
}
