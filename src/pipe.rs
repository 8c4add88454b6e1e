//! Bounded byte pipes between blocking archive workers and async HTTP bodies

use std::io::{self, Read, Write};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::limits;

pub type BodySender = mpsc::Sender<io::Result<Bytes>>;
pub type BodyReceiver = mpsc::Receiver<io::Result<Bytes>>;

/// Pipe with room for `PIPE_CHUNKS` chunks; a full pipe blocks the writer.
pub fn channel() -> (BodySender, BodyReceiver) {
    mpsc::channel(limits::PIPE_CHUNKS)
}

/// Blocking writer that sends fixed-size chunks into a pipe.
/// Must be used off the async runtime (archive pool threads).
pub struct ChannelWriter {
    tx: BodySender,
    buffer: Vec<u8>,
    chunk_size: usize,
    failed: bool,
}

impl ChannelWriter {
    pub fn new(tx: BodySender) -> Self {
        Self::with_chunk_size(tx, limits::CHUNK_SIZE)
    }

    pub fn with_chunk_size(tx: BodySender, chunk_size: usize) -> Self {
        Self {
            tx,
            buffer: Vec::with_capacity(chunk_size),
            chunk_size,
            failed: false,
        }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if !self.buffer.is_empty() {
            let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
            self.tx
                .blocking_send(Ok(Bytes::from(chunk)))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader went away"))?;
        }
        Ok(())
    }

    /// Poison the stream so the reading side fails instead of seeing a clean end.
    pub fn fail(mut self, err: io::Error) {
        self.failed = true;
        self.buffer.clear();
        let _ = self.tx.blocking_send(Err(err));
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        let mut remaining = buf;

        while !remaining.is_empty() {
            let available = self.chunk_size - self.buffer.len();
            let to_write = remaining.len().min(available);

            self.buffer.extend_from_slice(&remaining[..to_write]);
            written += to_write;
            remaining = &remaining[to_write..];

            if self.buffer.len() >= self.chunk_size {
                self.flush_buffer()?;
            }
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        if !self.failed {
            let _ = self.flush_buffer();
        }
    }
}

/// Blocking reader over a pipe. Cancelling `token` makes pending and later reads fail
/// with `ConnectionAborted`.
pub struct ChannelReader {
    rx: BodyReceiver,
    current: Bytes,
    token: CancellationToken,
}

impl ChannelReader {
    pub fn new(rx: BodyReceiver, token: CancellationToken) -> Self {
        Self { rx, current: Bytes::new(), token }
    }

    fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        let rx = &mut self.rx;
        let token = &self.token;
        futures::executor::block_on(async {
            tokio::select! {
                biased;
                _ = token.cancelled() => Some(Err(io::Error::new(io::ErrorKind::ConnectionAborted, "transfer cancelled"))),
                chunk = rx.recv() => chunk,
            }
        })
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.next_chunk() {
                Some(Ok(chunk)) => self.current = chunk,
                Some(Err(e)) => return Err(e),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current.split_to(n));
        Ok(n)
    }
}
