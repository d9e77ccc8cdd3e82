//! Newline-delimited JSON links.
//!
//! A [`Link`] is a pair of frame channels. In-process containers use
//! [`Link::pair`]; child processes use [`Link::spawn`] over their stdio, which
//! pumps frames through a `LinesCodec` in two background tasks.

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, trace, warn};

use crate::error::TransportResult;
use crate::frame::Frame;

/// Longest accepted line.
pub const MAX_LINE_LEN: usize = 8 * 1024 * 1024;

/// The codec used by every Cairn link.
pub fn line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LEN)
}

/// Encodes `value` as a single JSON line (without the terminator).
pub fn encode<T: Serialize>(value: &T) -> TransportResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decodes a JSON line.
pub fn decode<T: DeserializeOwned>(line: &str) -> TransportResult<T> {
    Ok(serde_json::from_str(line)?)
}

/// One end of a frame link.
#[derive(Debug)]
pub struct Link {
    /// Frames to the peer.
    pub tx: mpsc::UnboundedSender<Frame>,
    /// Frames from the peer. Yields `None` once the peer is gone.
    pub rx: mpsc::UnboundedReceiver<Frame>,
}

impl Link {
    /// Creates two connected in-memory ends.
    pub fn pair() -> (Link, Link) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Link { tx: a_tx, rx: a_rx }, Link { tx: b_tx, rx: b_rx })
    }

    /// Pumps frames over a byte stream pair.
    ///
    /// Lines that do not decode as frames are logged and skipped. The inbound
    /// channel closes when `reader` reaches EOF or fails; the writer task
    /// stops when every outbound sender is dropped.
    pub fn spawn<R, W>(name: &str, reader: R, writer: W) -> Link
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        let peer = name.to_string();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(reader, line_codec());
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Link read failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match decode::<Frame>(&line) {
                    Ok(frame) => {
                        trace!(peer = %peer, ?frame, "Frame received");
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "Skipping malformed line"),
                }
            }
            debug!(peer = %peer, "Link reader finished");
        });

        let peer = name.to_string();
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(writer, line_codec());
            while let Some(frame) = out_rx.recv().await {
                let line = match encode(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    warn!(peer = %peer, error = %e, "Link write failed");
                    break;
                }
            }
            debug!(peer = %peer, "Link writer finished");
        });

        Link {
            tx: out_tx,
            rx: in_rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BroadcastMessage;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (mut a, mut b) = Link::pair();
        a.tx.send(Frame::Start).unwrap();
        b.tx.send(Frame::Shutdown).unwrap();
        assert!(matches!(b.rx.recv().await, Some(Frame::Start)));
        assert!(matches!(a.rx.recv().await, Some(Frame::Shutdown)));
    }

    #[tokio::test]
    async fn test_spawned_link_over_stream() {
        let (left, right) = tokio::io::duplex(4096);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);

        let a = Link::spawn("a", left_read, left_write);
        let mut b = Link::spawn("b", right_read, right_write);

        a.tx.send(Frame::Broadcast(BroadcastMessage::ContainersDone))
            .unwrap();
        assert!(matches!(
            b.rx.recv().await,
            Some(Frame::Broadcast(BroadcastMessage::ContainersDone))
        ));
    }

    #[tokio::test]
    async fn test_malformed_lines_skipped() {
        let (left, right) = tokio::io::duplex(4096);
        let (right_read, right_write) = tokio::io::split(right);
        let mut link = Link::spawn("peer", right_read, right_write);

        let (left_read, mut left_write) = tokio::io::split(left);
        left_write
            .write_all(b"not json\n\n{\"frame\":\"start\"}\n")
            .await
            .unwrap();
        assert!(matches!(link.rx.recv().await, Some(Frame::Start)));

        drop(left_write);
        drop(left_read);
        assert!(link.rx.recv().await.is_none());
    }
}
