//! Async frame reader and writer halves.
//!
//! These wrap any tokio `AsyncRead` / `AsyncWrite` so the transport can run
//! over TCP in production and over `tokio::io::duplex` in tests.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::frame::Frame;
use super::parser::{Decoded, FrameParser};

/// Reads raw chunks and runs them through a [`FrameParser`].
#[derive(Debug)]
pub struct FrameReader<R> {
    reader: R,
    parser: FrameParser,
    buffer: BytesMut,
    read_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader that pulls up to `read_size` bytes per read.
    pub fn new(reader: R, parser: FrameParser, read_size: usize) -> Self {
        FrameReader {
            reader,
            parser,
            buffer: BytesMut::with_capacity(read_size),
            read_size: read_size.max(1),
        }
    }

    /// Parse bytes obtained elsewhere, such as the tail of the handshake read.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        self.parser.decode(bytes)
    }

    /// Wait for one read and return everything it completed.
    ///
    /// Returns `Ok(None)` once the peer has closed its side. Cancel safe:
    /// dropping the future before it resolves loses no bytes.
    pub async fn read_chunk(&mut self) -> io::Result<Option<Vec<Decoded>>> {
        self.buffer.clear();
        self.buffer.reserve(self.read_size);
        let n = (&mut self.reader)
            .take(self.read_size as u64)
            .read_buf(&mut self.buffer)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.parser.decode(&self.buffer)))
    }
}

/// Masks and writes outbound frames.
#[derive(Debug)]
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a write half.
    pub fn new(writer: W) -> Self {
        FrameWriter { writer }
    }

    /// Encode `frame` with a fresh mask and write it out.
    pub async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        let encoded = frame.encode_masked();
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await
    }

    /// Shut down the write side of the stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
