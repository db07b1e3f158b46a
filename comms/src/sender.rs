//! The sending end of the framing protocol.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, Serialize};

/// Writes length-prefixed frames to `W`.
pub struct OnoSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    /// Length prefix and serialized body of the frame being sent.
    frame: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> OnoSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            frame: Vec::new(),
        }
    }

    /// Sends `msg` as one frame: a big endian length, the serialized body and, for data
    /// messages, the payload written straight from the caller's slice.
    ///
    /// # Returns
    /// The writer's error. A frame that failed half way leaves the stream unusable.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let Self { frame, tx } = self;

        frame.clear();
        frame.resize(LEN_TYPE_SIZE, 0);
        let payload = msg.serialize(frame);

        let body_len = frame.len() - LEN_TYPE_SIZE + payload.map_or(0, <[u8]>::len);
        frame[..LEN_TYPE_SIZE].copy_from_slice(&(body_len as LenType).to_be_bytes());

        tx.write_all(frame).await?;
        if let Some(payload) = payload {
            tx.write_all(payload).await?;
        }
        tx.flush().await
    }

    /// Flushes and closes the writing direction. The peer reads end of stream once it has
    /// drained every frame sent before.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.shutdown().await
    }
}
