//! Transport connection abstraction
//!
//! A connection is a reliable, full-duplex, message-oriented session split
//! into a write half ([`FrameSink`]) and a read half ([`FrameStream`]). The
//! relay only ever writes text frames or a close frame, and only ever reads
//! text payloads.
//!
//! Two implementations live here: the axum WebSocket halves used by the
//! server, and an in-memory pair ([`memory::pair`]) for embedding the relay
//! without a socket.

use async_trait::async_trait;
use axum::extract::ws::{self, CloseFrame, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_shared::{RelayError, RelayResult};

/// Outbound frame written by a client's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Serialized message envelope
    Text(String),
    /// Transport-level close
    Close,
}

/// Write half of a connection
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send_frame(&mut self, frame: Frame) -> RelayResult<()>;
}

/// Read half of a connection
#[async_trait]
pub trait FrameStream: Send + 'static {
    /// Next inbound text payload. `None` once the peer has closed.
    async fn recv_text(&mut self) -> Option<RelayResult<String>>;
}

// =============================================================================
// Axum WebSocket
// =============================================================================

#[async_trait]
impl FrameSink for SplitSink<WebSocket, ws::Message> {
    async fn send_frame(&mut self, frame: Frame) -> RelayResult<()> {
        let message = match frame {
            Frame::Text(text) => ws::Message::Text(text),
            Frame::Close => ws::Message::Close(Some(CloseFrame {
                code: ws::close_code::NORMAL,
                reason: "close".into(),
            })),
        };

        SinkExt::send(self, message)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }
}

#[async_trait]
impl FrameStream for SplitStream<WebSocket> {
    async fn recv_text(&mut self) -> Option<RelayResult<String>> {
        while let Some(msg) = self.next().await {
            match msg {
                Ok(ws::Message::Text(text)) => return Some(Ok(text)),
                Ok(ws::Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::debug!("Ignoring non UTF-8 binary frame"),
                },
                Ok(ws::Message::Close(_)) => return None,
                Ok(ws::Message::Ping(_)) | Ok(ws::Message::Pong(_)) => {
                    // Axum answers pings itself
                }
                Err(e) => return Some(Err(RelayError::Transport(e.to_string()))),
            }
        }
        None
    }
}

// =============================================================================
// In-memory transport
// =============================================================================

pub mod memory {
    //! Channel-backed connection. The [`MemoryPeer`] plays the remote end.

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use relay_shared::{Message, RelayError, RelayResult};
    use tokio::sync::mpsc;

    use super::{Frame, FrameSink, FrameStream};

    /// Create a connected sink/stream pair plus the remote peer
    pub fn pair() -> (MemorySink, MemoryStream, MemoryPeer) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let fail_writes = Arc::new(AtomicBool::new(false));
        let stall_writes = Arc::new(AtomicBool::new(false));

        (
            MemorySink {
                frames: frame_tx,
                fail_writes: Arc::clone(&fail_writes),
                stall_writes: Arc::clone(&stall_writes),
            },
            MemoryStream { inbound: inbound_rx },
            MemoryPeer {
                frames: frame_rx,
                inbound: Some(inbound_tx),
                fail_writes,
                stall_writes,
            },
        )
    }

    #[derive(Debug)]
    pub struct MemorySink {
        frames: mpsc::UnboundedSender<Frame>,
        fail_writes: Arc<AtomicBool>,
        stall_writes: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send_frame(&mut self, frame: Frame) -> RelayResult<()> {
            if self.fail_writes.load(Ordering::Acquire) {
                return Err(RelayError::Transport("simulated write failure".to_string()));
            }
            if self.stall_writes.load(Ordering::Acquire) && matches!(frame, Frame::Text(_)) {
                std::future::pending::<()>().await;
            }
            self.frames
                .send(frame)
                .map_err(|_| RelayError::ConnectionClosed("peer dropped".to_string()))
        }
    }

    #[derive(Debug)]
    pub struct MemoryStream {
        inbound: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl FrameStream for MemoryStream {
        async fn recv_text(&mut self) -> Option<RelayResult<String>> {
            self.inbound.recv().await.map(Ok)
        }
    }

    /// Remote end of an in-memory connection
    #[derive(Debug)]
    pub struct MemoryPeer {
        frames: mpsc::UnboundedReceiver<Frame>,
        inbound: Option<mpsc::UnboundedSender<String>>,
        fail_writes: Arc<AtomicBool>,
        stall_writes: Arc<AtomicBool>,
    }

    impl MemoryPeer {
        /// Push a raw payload to the relay side. Returns false once hung up.
        pub fn send_text(&self, text: impl Into<String>) -> bool {
            self.inbound
                .as_ref()
                .map(|tx| tx.send(text.into()).is_ok())
                .unwrap_or(false)
        }

        /// Encode and push a message to the relay side
        pub fn send_message(&self, message: &Message) -> bool {
            match message.encode() {
                Ok(text) => self.send_text(text),
                Err(_) => false,
            }
        }

        /// Close the inbound direction, ending the relay's read loop
        pub fn hang_up(&mut self) {
            self.inbound = None;
        }

        /// Make every later write from the relay side fail
        pub fn fail_writes(&self) {
            self.fail_writes.store(true, Ordering::Release);
        }

        /// Make every later text write hang, as a peer that stopped reading would
        pub fn stall_writes(&self) {
            self.stall_writes.store(true, Ordering::Release);
        }

        /// Wait for the next frame written by the relay
        pub async fn next_frame(&mut self) -> Option<Frame> {
            self.frames.recv().await
        }

        /// Take every frame written so far without waiting
        pub fn drain_frames(&mut self) -> Vec<Frame> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                frames.push(frame);
            }
            frames
        }

        /// Decoded envelopes among the frames written so far
        pub fn drain_messages(&mut self) -> Vec<Message> {
            self.drain_frames()
                .into_iter()
                .filter_map(|frame| match frame {
                    Frame::Text(text) => Message::decode(&text).ok(),
                    Frame::Close => None,
                })
                .collect()
        }
    }
}
