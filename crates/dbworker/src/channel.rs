//! Non-blocking I/O adapter between a connection and its worker channel.
//!
//! Reads accumulate into an input buffer that is drained frame by frame.
//! Writes go to an output buffer: an immediate write is attempted only while
//! no write interest is registered, and whatever the socket does not accept
//! stays queued until the socket reports writable again.

use std::io;

use serde_json::Value;
use tokio::net::UnixStream;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::bridge::codec::FrameCodec;

const READ_CHUNK: usize = 64 * 1024;

/// Result of one non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    Eof,
    /// Readiness was spurious; wait for the next notification.
    WouldBlock,
}

pub struct Channel {
    stream: UnixStream,
    codec: FrameCodec,
    inbuf: BytesMut,
    outbuf: BytesMut,
    write_interest: bool,
}

impl Channel {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            codec: FrameCodec::new(),
            inbuf: BytesMut::with_capacity(READ_CHUNK),
            outbuf: BytesMut::new(),
            write_interest: false,
        }
    }

    /// Register a blocking std socket with the runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(stream)?))
    }

    /// Frame a payload into the output buffer without writing it.
    ///
    /// On error nothing is appended.
    pub fn push_frame(&mut self, payload: &[Value]) -> io::Result<()> {
        self.codec.encode(payload, &mut self.outbuf)
    }

    /// Start writing buffered output.
    ///
    /// While write interest is registered the writable handler owns the
    /// buffer, so this does nothing; otherwise it writes what the socket
    /// accepts now and registers interest for the remainder.
    pub fn kick(&mut self) -> io::Result<()> {
        if self.write_interest {
            return Ok(());
        }
        self.flush()?;
        if !self.outbuf.is_empty() {
            tracing::trace!(pending = self.pending_output(), "Socket full, waiting for writability");
            self.write_interest = true;
        }
        Ok(())
    }

    pub fn wants_write(&self) -> bool {
        self.write_interest
    }

    pub fn pending_output(&self) -> usize {
        self.outbuf.len()
    }

    pub async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }

    /// Handler for write readiness: drain, and drop interest once empty.
    pub fn on_writable(&mut self) -> io::Result<()> {
        self.flush()?;
        if self.outbuf.is_empty() {
            self.write_interest = false;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        while !self.outbuf.is_empty() {
            match self.stream.try_write(&self.outbuf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.outbuf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    /// Handler for read readiness: one non-blocking read into the input buffer.
    pub fn on_readable(&mut self) -> io::Result<ReadOutcome> {
        self.inbuf.reserve(READ_CHUNK);
        match self.stream.try_read_buf(&mut self.inbuf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Next complete frame from the input buffer, if any.
    pub fn next_frame(&mut self) -> io::Result<Option<Vec<Value>>> {
        self.codec.decode(&mut self.inbuf)
    }
}
