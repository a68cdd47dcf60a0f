// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The TCP interleaved write path: RTSP responses and `InterleavedFrame`s
//! share one byte stream, so every write goes through a single mutex to
//! keep frames from tearing into each other (§4.6, §5 "shared resources").

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::message::InterleavedFrame;
use crate::Error;

/// Wraps a half of a TCP connection (or any `AsyncWrite`) so that
/// serialized RTSP responses and interleaved RTP/RTCP frames can be
/// produced concurrently by different tasks without corrupting the stream.
pub struct InterleavedWriter<W> {
    inner: Mutex<W>,
}

impl<W: tokio::io::AsyncWrite + Unpin> InterleavedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner: Mutex::new(inner) }
    }

    pub async fn write_frame(&self, frame: &InterleavedFrame) -> Result<(), Error> {
        let bytes = frame.serialize();
        let mut guard = self.inner.lock().await;
        guard.write_all(&bytes).await?;
        guard.flush().await?;
        Ok(())
    }

    pub async fn write_raw(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut guard = self.inner.lock().await;
        guard.write_all(bytes).await?;
        guard.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn frame_serializes_with_interleaved_header() {
        let (client, mut server) = tokio::io::duplex(64);
        let writer = InterleavedWriter::new(client);
        let frame = InterleavedFrame {
            channel: 0,
            payload: bytes::Bytes::from_static(&[1, 2, 3, 4]),
        };
        writer.write_frame(&frame).await.unwrap();
        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [b'$', 0, 0, 4, 1, 2, 3, 4]);
    }
}
