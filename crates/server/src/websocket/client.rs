//! Registered client connection
//!
//! A [`Client`] pairs one connection with an identity and a cancellation
//! signal. All writes to the connection go through a bounded outbound queue
//! drained by a single writer task, which is the only owner of the
//! [`FrameSink`]. Callers never block on the socket: a send either lands in
//! the queue or fails immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use relay_shared::{Message, MessageType, RelayError, RelayResult};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connection::{Frame, FrameSink, FrameStream};
use super::dispatcher::DispatcherHandle;
use super::heartbeat;

/// Upper bound for writing the close frame once the connection is torn down
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-client settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Period of the heartbeat monitor
    pub heartbeat_interval: Duration,
    /// Capacity of the outbound queue
    pub send_buffer: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: heartbeat::DEFAULT_HEARTBEAT_INTERVAL,
            send_buffer: 256,
        }
    }
}

/// Work item for the writer task
#[derive(Debug)]
enum Outbound {
    Envelope(Message),
    Close,
}

/// One registered, identified connection
pub struct Client {
    id: String,
    outbound: mpsc::Sender<Outbound>,
    stream: tokio::sync::Mutex<Box<dyn FrameStream>>,
    /// Stops the heartbeat monitor
    cancel: CancellationToken,
    /// Fired once the transport is closed, by Destroy or by the writer exiting
    connection_closed: CancellationToken,
    writer_done: CancellationToken,
    closing: AtomicBool,
    dispatcher: DispatcherHandle,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Wrap an established connection.
    ///
    /// Spawns the writer task and the heartbeat monitor. Registration is left
    /// to the caller (see [`super::handler::new_client`]).
    pub fn new(
        id: impl Into<String>,
        sink: impl FrameSink,
        stream: impl FrameStream,
        dispatcher: DispatcherHandle,
        options: &ClientOptions,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(options.send_buffer.max(1));

        let client = Arc::new(Self {
            id: id.into(),
            outbound: outbound_tx,
            stream: tokio::sync::Mutex::new(Box::new(stream)),
            cancel: CancellationToken::new(),
            connection_closed: CancellationToken::new(),
            writer_done: CancellationToken::new(),
            closing: AtomicBool::new(false),
            dispatcher,
            heartbeat: Mutex::new(None),
        });

        tokio::spawn(run_writer(
            Arc::downgrade(&client),
            client.id.clone(),
            Box::new(sink),
            outbound_rx,
            client.connection_closed.clone(),
            client.writer_done.clone(),
        ));

        let monitor = heartbeat::spawn_heartbeat(
            Arc::downgrade(&client),
            options.heartbeat_interval,
            client.cancel.clone(),
        );
        if let Ok(mut slot) = client.heartbeat.lock() {
            *slot = Some(monitor);
        }

        client
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Blocking receive of the next raw payload.
    ///
    /// Fails with `ConnectionClosed` when the peer hangs up or the connection
    /// has been torn down locally.
    pub async fn read_message(&self) -> RelayResult<String> {
        let mut stream = self.stream.lock().await;

        tokio::select! {
            biased;
            _ = self.connection_closed.cancelled() => {
                Err(RelayError::ConnectionClosed(self.id.clone()))
            }
            next = stream.recv_text() => match next {
                Some(result) => result,
                None => Err(RelayError::ConnectionClosed(self.id.clone())),
            },
        }
    }

    /// Send a message of the given type with this client's id.
    ///
    /// `Break` writes a close frame instead of an envelope. On failure the
    /// client closes itself before the error is returned.
    pub fn send_message(self: &Arc<Self>, kind: MessageType, content: &str) -> RelayResult<()> {
        if kind == MessageType::Break {
            return self.enqueue(Outbound::Close);
        }
        self.enqueue(Outbound::Envelope(Message::new(self.id.clone(), kind, content)))
    }

    /// Deliver a message as-is (broadcast fan-out path)
    pub fn deliver(self: &Arc<Self>, message: &Message) -> RelayResult<()> {
        if message.kind == MessageType::Break {
            return self.enqueue(Outbound::Close);
        }
        self.enqueue(Outbound::Envelope(message.clone()))
    }

    fn enqueue(self: &Arc<Self>, outbound: Outbound) -> RelayResult<()> {
        let result = if self.connection_closed.is_cancelled() {
            Err(RelayError::ConnectionClosed(self.id.clone()))
        } else {
            match self.outbound.try_send(outbound) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(RelayError::SendBufferFull(self.id.clone())),
                Err(TrySendError::Closed(_)) => Err(RelayError::ConnectionClosed(self.id.clone())),
            }
        };

        if let Err(ref e) = result {
            tracing::warn!(client_id = %self.id, error = %e, "Send failed, closing client");
            self.close();
        }
        result
    }

    /// Broadcast text to the group with this client as sender
    pub async fn broadcast(&self, text: &str) -> RelayResult<()> {
        self.dispatcher
            .broadcast(Message::new(self.id.clone(), MessageType::Broadcast, text))
            .await
    }

    /// Broadcast a system notice with this client as sender
    pub async fn sys_broadcast(&self, text: &str) -> RelayResult<()> {
        self.dispatcher
            .broadcast(Message::new(self.id.clone(), MessageType::System, text))
            .await
    }

    /// Fire the cancellation signal, stopping the heartbeat monitor
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Funnel for "this client is going away".
    ///
    /// Idempotent. The first call fires the cancellation signal and enqueues a
    /// `Disconnected` broadcast followed by `Destroy`; the enqueues run on a
    /// separate task so this is safe to call from the dispatcher loop itself.
    pub fn close(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel();

        let client = Arc::clone(self);
        tokio::spawn(async move {
            let notice = Message::new(client.id.clone(), MessageType::Disconnected, "");
            if let Err(e) = client.dispatcher.broadcast(notice).await {
                tracing::debug!(client_id = %client.id, error = %e, "Disconnect notice dropped");
            }
            if let Err(e) = client.dispatcher.destroy(Arc::clone(&client)).await {
                tracing::debug!(client_id = %client.id, error = %e, "Destroy request dropped");
            }
        });
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Tear down the transport. Called by the dispatcher on Destroy/Shutdown.
    ///
    /// Errors with `ConnectionClosed` if the transport was already closed.
    pub(crate) fn close_connection(&self) -> RelayResult<()> {
        if self.connection_closed.is_cancelled() {
            return Err(RelayError::ConnectionClosed(self.id.clone()));
        }
        self.cancel();
        self.connection_closed.cancel();
        Ok(())
    }

    pub fn is_connection_closed(&self) -> bool {
        self.connection_closed.is_cancelled()
    }

    /// Resolves once the writer task has finished
    pub async fn closed(&self) {
        self.writer_done.cancelled().await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("closing", &self.is_closing())
            .field("connection_closed", &self.is_connection_closed())
            .finish()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Ok(mut slot) = self.heartbeat.lock() {
            if let Some(monitor) = slot.take() {
                monitor.abort();
            }
        }
    }
}

/// Drains the outbound queue into the sink
async fn run_writer(
    client: Weak<Client>,
    client_id: String,
    mut sink: Box<dyn FrameSink>,
    mut outbound: mpsc::Receiver<Outbound>,
    connection_closed: CancellationToken,
    writer_done: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = connection_closed.cancelled() => {
                send_close(sink.as_mut(), &client_id).await;
                break;
            }
            next = outbound.recv() => next,
        };

        let frame = match next {
            Some(Outbound::Envelope(message)) => match message.encode() {
                Ok(text) => Frame::Text(text),
                Err(e) => {
                    tracing::error!(client_id = %client_id, error = %e, "Failed to serialize message");
                    continue;
                }
            },
            Some(Outbound::Close) => {
                if let Err(e) = sink.send_frame(Frame::Close).await {
                    tracing::debug!(client_id = %client_id, error = %e, "Close frame failed");
                }
                break;
            }
            None => break,
        };

        let result = tokio::select! {
            biased;
            _ = connection_closed.cancelled() => None,
            result = sink.send_frame(frame) => Some(result),
        };

        let Some(result) = result else {
            send_close(sink.as_mut(), &client_id).await;
            break;
        };

        if let Err(e) = result {
            tracing::warn!(client_id = %client_id, error = %e, "Write failed, closing client");
            connection_closed.cancel();
            if let Some(client) = client.upgrade() {
                client.close();
            }
            break;
        }
    }

    connection_closed.cancel();
    writer_done.cancel();
    tracing::debug!(client_id = %client_id, "Writer task exiting");
}

/// Best-effort close frame, bounded by [`CLOSE_FRAME_TIMEOUT`]
async fn send_close(sink: &mut dyn FrameSink, client_id: &str) {
    match tokio::time::timeout(CLOSE_FRAME_TIMEOUT, sink.send_frame(Frame::Close)).await {
        Ok(Ok(())) => tracing::debug!(client_id = %client_id, "Close frame sent"),
        Ok(Err(e)) => tracing::debug!(client_id = %client_id, error = %e, "Close frame failed"),
        Err(_) => tracing::debug!(client_id = %client_id, "Close frame timed out"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::websocket::connection::memory;
    use crate::websocket::dispatcher::{Dispatcher, DispatcherConfig};

    fn options() -> ClientOptions {
        ClientOptions {
            heartbeat_interval: Duration::from_secs(3600),
            send_buffer: 8,
        }
    }

    #[tokio::test]
    async fn test_send_message_writes_envelope() {
        let (_dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        let (sink, stream, mut peer) = memory::pair();
        let client = Client::new("alice", sink, stream, handle, &options());

        client.send_message(MessageType::System, "welcome").unwrap();

        let frame = peer.next_frame().await.unwrap();
        let Frame::Text(text) = frame else {
            panic!("expected a text frame");
        };
        let msg = Message::decode(&text).unwrap();
        assert_eq!(msg.id, "alice");
        assert_eq!(msg.content, "welcome");
        assert_eq!(msg.kind, MessageType::System);
    }

    #[tokio::test]
    async fn test_break_sends_only_close_frame() {
        let (_dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        let (sink, stream, mut peer) = memory::pair();
        let client = Client::new("alice", sink, stream, handle, &options());

        client.send_message(MessageType::Break, "ignored").unwrap();

        assert_eq!(peer.next_frame().await, Some(Frame::Close));
        client.closed().await;
        assert!(peer.drain_frames().is_empty());
        assert!(client.is_connection_closed());
    }

    #[tokio::test]
    async fn test_read_message_reports_hang_up() {
        let (_dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        let (sink, stream, mut peer) = memory::pair();
        let client = Client::new("alice", sink, stream, handle, &options());

        peer.send_text("payload");
        assert_eq!(client.read_message().await.unwrap(), "payload");

        peer.hang_up();
        assert!(matches!(
            client.read_message().await,
            Err(RelayError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_connection_unblocks_reader_and_sends_close() {
        let (_dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        let (sink, stream, mut peer) = memory::pair();
        let client = Client::new("alice", sink, stream, handle, &options());

        client.close_connection().unwrap();
        assert!(matches!(
            client.read_message().await,
            Err(RelayError::ConnectionClosed(_))
        ));
        assert_eq!(peer.next_frame().await, Some(Frame::Close));

        // Second close reports the connection as already gone
        assert!(matches!(
            client.close_connection(),
            Err(RelayError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_close_frame_sent_when_closed_mid_write() {
        let (_dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        let (sink, stream, mut peer) = memory::pair();
        let client = Client::new("alice", sink, stream, handle, &options());

        peer.stall_writes();
        client.send_message(MessageType::Broadcast, "stuck").unwrap();
        // Let the writer pick the envelope up and block on it
        tokio::time::sleep(Duration::from_millis(10)).await;

        client.close_connection().unwrap();
        tokio::time::timeout(Duration::from_secs(1), client.closed())
            .await
            .unwrap();
        assert_eq!(peer.drain_frames(), vec![Frame::Close]);
    }

    #[tokio::test]
    async fn test_send_after_close_fails_and_self_closes() {
        let (_dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        let (sink, stream, _peer) = memory::pair();
        let client = Client::new("alice", sink, stream, handle, &options());

        client.close_connection().unwrap();
        let result = client.send_message(MessageType::Broadcast, "late");
        assert!(matches!(result, Err(RelayError::ConnectionClosed(_))));
        assert!(client.is_closing());
    }

    #[tokio::test]
    async fn test_full_outbound_queue_counts_as_send_failure() {
        let (_dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        let (sink, stream, _peer) = memory::pair();
        let opts = ClientOptions {
            heartbeat_interval: Duration::from_secs(3600),
            send_buffer: 1,
        };
        let client = Client::new("alice", sink, stream, handle, &opts);

        // The writer may pick up one item; the queue holds one more
        let mut saw_full = false;
        for _ in 0..64 {
            match client.send_message(MessageType::Broadcast, "x") {
                Ok(()) => {}
                Err(RelayError::SendBufferFull(_)) => {
                    saw_full = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(saw_full);
        assert!(client.is_closing());
    }
}
