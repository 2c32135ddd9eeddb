//! Bidirectional, ordered, reliable envelope pipes.
//!
//! A [`Channel`] is one end of a point-to-point pipe. In-process ends are
//! plain unbounded queues; [`Channel::from_io`] carries the same envelopes over
//! any byte stream (a child process's stdio, a socket) using
//! [`EnvelopeCodec`] framing.

use crate::error::BusError;
use crate::protocol::{CodecError, Envelope, EnvelopeCodec};
use futures_util::{SinkExt, StreamExt};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

pub type EnvelopeSender = mpsc::UnboundedSender<Envelope>;
pub type EnvelopeReceiver = mpsc::UnboundedReceiver<Envelope>;

/// One end of an envelope pipe. Delivery is FIFO and exactly once.
#[derive(Debug)]
pub struct Channel {
    tx: EnvelopeSender,
    rx: EnvelopeReceiver,
}

impl Channel {
    /// Create both ends of an in-memory pipe.
    pub fn pair() -> (Channel, Channel) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        (
            Channel {
                tx: left_tx,
                rx: left_rx,
            },
            Channel {
                tx: right_tx,
                rx: right_rx,
            },
        )
    }

    /// Bridge a byte stream into a channel. Two background tasks pump frames;
    /// they stop when either side closes or the stream yields a malformed frame.
    pub fn from_io<R, W>(reader: R, writer: W) -> Channel
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut sink = FramedWrite::new(writer, EnvelopeCodec::new());
            while let Some(envelope) = outbound_rx.recv().await {
                if let Err(error) = sink.send(envelope).await {
                    tracing::warn!("Envelope transport write failed: {error}");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            let mut frames = FramedRead::new(reader, EnvelopeCodec::new());
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(CodecError::Malformed(error)) => {
                        tracing::error!(
                            "Closing envelope transport after malformed frame: {error}"
                        );
                        break;
                    }
                    Err(error) => {
                        tracing::warn!("Envelope transport read failed: {error}");
                        break;
                    }
                }
            }
            tracing::debug!("Envelope transport reader finished");
        });

        Channel {
            tx: outbound_tx,
            rx: inbound_rx,
        }
    }

    /// Post an envelope to the other end. Never suspends.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }

    /// Wait for the next envelope from the other end; `None` once it closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn into_parts(self) -> (EnvelopeSender, EnvelopeReceiver) {
        (self.tx, self.rx)
    }
}

/// Launch `program args..` as a plugin worker process speaking envelopes on
/// its stdio. The child is killed when the returned handle is dropped.
pub fn spawn_plugin_process(
    program: &str,
    args: &[String],
    envs: &[(&str, String)],
) -> Result<(Channel, Child), BusError> {
    let mut child = Command::new(program)
        .args(args)
        .envs(envs.iter().map(|(key, value)| (*key, value.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("plugin process stdin was not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("plugin process stdout was not captured"))?;

    tracing::info!(program, pid = child.id(), "Spawned shared worker process");
    Ok((Channel::from_io(stdout, stdin), child))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_pair_is_fifo_both_ways() {
        let (mut left, mut right) = Channel::pair();
        assert!(left.send(Envelope::Available));
        assert!(left.send(Envelope::DeregisterWorker { id: "w1".into() }));
        assert!(right.send(Envelope::DeregisteredWorker { id: "w1".into() }));

        assert_eq!(right.recv().await, Some(Envelope::Available));
        assert_eq!(
            right.recv().await,
            Some(Envelope::DeregisterWorker { id: "w1".into() })
        );
        assert_eq!(
            left.recv().await,
            Some(Envelope::DeregisteredWorker { id: "w1".into() })
        );
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (left, mut right) = Channel::pair();
        drop(left);
        assert_eq!(right.recv().await, None);
        assert!(!right.send(Envelope::Available));
    }

    #[tokio::test]
    async fn byte_stream_bridge_carries_envelopes() {
        let (a, b) = tokio::io::duplex(1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let left = Channel::from_io(a_read, a_write);
        let mut right = Channel::from_io(b_read, b_write);

        let message = Envelope::message("p/message/1", None, Some("w1".into()), json!({"n": 1}));
        assert!(left.send(message.clone()));
        assert!(left.send(Envelope::Available));

        assert_eq!(right.recv().await, Some(message));
        assert_eq!(right.recv().await, Some(Envelope::Available));

        drop(left);
        assert_eq!(right.recv().await, None);
    }
}
