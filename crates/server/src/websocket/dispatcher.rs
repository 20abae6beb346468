//! Connection registry and event dispatcher
//!
//! The [`Dispatcher`] is a single actor that owns the registry of live
//! clients. Producers hold a cloneable [`DispatcherHandle`] and only ever
//! enqueue onto one of four bounded streams:
//!
//! - **register**: add a client and announce it with `Connected`
//! - **destroy**: close a client's connection and drop it from the registry
//! - **broadcast**: fan a message out to every client except the sender
//! - **shutdown**: stop the loop
//!
//! The loop handles exactly one event at a time and picks among ready
//! streams without priority, so the registry needs no lock: nothing outside
//! the loop ever touches it. Enqueueing waits when a stream is full; events
//! are never dropped.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_shared::{Message, MessageType, RelayError, RelayResult};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::client::Client;

/// What the dispatcher does with connected peers when it shuts down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Send `Break` to every peer and wait for the close to go out
    Drain,
    /// Stop at once without notifying peers
    Immediate,
}

impl FromStr for ShutdownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drain" => Ok(ShutdownPolicy::Drain),
            "immediate" => Ok(ShutdownPolicy::Immediate),
            other => Err(format!("unknown shutdown policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Capacity of each event stream
    pub queue_capacity: usize,
    pub shutdown_policy: ShutdownPolicy,
    /// Upper bound on waiting for peers during a draining shutdown
    pub drain_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            shutdown_policy: ShutdownPolicy::Drain,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters written by the dispatcher loop, readable from anywhere
#[derive(Debug, Default)]
pub struct DispatcherStats {
    live: AtomicUsize,
    registrations: AtomicU64,
    destroys: AtomicU64,
    broadcasts: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Point-in-time copy of [`DispatcherStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub live_clients: usize,
    pub registrations: u64,
    pub destroys: u64,
    pub broadcasts: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            live_clients: self.live.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            destroys: self.destroys.load(Ordering::Relaxed),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Mapping from client id to client, owned by the dispatcher loop.
///
/// `count` is kept incrementally and always equals the mapping's size.
#[derive(Debug, Default)]
struct Registry {
    clients: HashMap<String, Arc<Client>>,
    count: usize,
}

impl Registry {
    /// Insert, replacing any previous client under the same id
    fn insert(&mut self, client: Arc<Client>) -> Option<Arc<Client>> {
        let previous = self.clients.insert(client.id().to_string(), client);
        if previous.is_none() {
            self.count += 1;
        }
        previous
    }

    /// Remove the entry only if it is this exact client
    fn remove(&mut self, client: &Arc<Client>) -> bool {
        match self.clients.get(client.id()) {
            Some(existing) if Arc::ptr_eq(existing, client) => {
                self.clients.remove(client.id());
                self.count -= 1;
                true
            }
            _ => false,
        }
    }

    fn drain(&mut self) -> Vec<Arc<Client>> {
        self.count = 0;
        self.clients.drain().map(|(_, client)| client).collect()
    }

    fn len(&self) -> usize {
        self.count
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Producer side of the dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct DispatcherHandle {
    register_tx: mpsc::Sender<Arc<Client>>,
    destroy_tx: mpsc::Sender<Arc<Client>>,
    broadcast_tx: mpsc::Sender<Message>,
    shutdown_tx: mpsc::Sender<()>,
    stats: Arc<DispatcherStats>,
    stopped: CancellationToken,
}

impl DispatcherHandle {
    /// Enqueue a registration
    pub async fn register(&self, client: Arc<Client>) -> RelayResult<()> {
        self.register_tx
            .send(client)
            .await
            .map_err(|_| RelayError::DispatcherClosed)
    }

    /// Enqueue a destruction
    pub async fn destroy(&self, client: Arc<Client>) -> RelayResult<()> {
        self.destroy_tx
            .send(client)
            .await
            .map_err(|_| RelayError::DispatcherClosed)
    }

    /// Enqueue a message for every client whose id differs from `message.id`
    pub async fn broadcast(&self, message: Message) -> RelayResult<()> {
        self.broadcast_tx
            .send(message)
            .await
            .map_err(|_| RelayError::DispatcherClosed)
    }

    /// Broadcast with the message type overridden
    pub async fn sys_broadcast(&self, kind: MessageType, mut message: Message) -> RelayResult<()> {
        message.kind = kind;
        self.broadcast(message).await
    }

    /// Enqueue the terminal signal
    pub async fn shutdown(&self) -> RelayResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| RelayError::DispatcherClosed)
    }

    /// Resolves once the dispatcher loop has exited
    pub async fn stopped(&self) {
        self.stopped.cancelled().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    pub fn live_count(&self) -> usize {
        self.stats.live.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("stats", &self.stats.snapshot())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// The serialized actor owning the registry
pub struct Dispatcher {
    register_rx: mpsc::Receiver<Arc<Client>>,
    destroy_rx: mpsc::Receiver<Arc<Client>>,
    broadcast_rx: mpsc::Receiver<Message>,
    shutdown_rx: mpsc::Receiver<()>,
    registry: Registry,
    stats: Arc<DispatcherStats>,
    stopped: CancellationToken,
    config: DispatcherConfig,
}

/// Outcome of one broadcast fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

impl Dispatcher {
    /// Create the actor and its handle. Nothing runs until [`Dispatcher::run`].
    pub fn new(config: DispatcherConfig) -> (Self, DispatcherHandle) {
        let capacity = config.queue_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (destroy_tx, destroy_rx) = mpsc::channel(capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(capacity);
        let stats = Arc::new(DispatcherStats::default());
        let stopped = CancellationToken::new();

        let handle = DispatcherHandle {
            register_tx,
            destroy_tx,
            broadcast_tx,
            shutdown_tx,
            stats: Arc::clone(&stats),
            stopped: stopped.clone(),
        };

        let dispatcher = Self {
            register_rx,
            destroy_rx,
            broadcast_rx,
            shutdown_rx,
            registry: Registry::default(),
            stats,
            stopped,
            config,
        };

        (dispatcher, handle)
    }

    /// Create the actor and run it on its own task
    pub fn spawn(config: DispatcherConfig) -> (DispatcherHandle, tokio::task::JoinHandle<()>) {
        let (dispatcher, handle) = Self::new(config);
        let task = tokio::spawn(dispatcher.run());
        (handle, task)
    }

    /// Event loop. Returns after a shutdown signal, or once every handle is gone.
    pub async fn run(mut self) {
        tracing::info!("Dispatcher started");

        loop {
            tokio::select! {
                Some(client) = self.register_rx.recv() => self.handle_register(client),
                Some(client) = self.destroy_rx.recv() => self.handle_destroy(client),
                Some(message) = self.broadcast_rx.recv() => {
                    self.handle_broadcast(&message);
                }
                Some(()) = self.shutdown_rx.recv() => {
                    self.handle_shutdown().await;
                    break;
                }
                else => {
                    tracing::info!("All dispatcher handles dropped");
                    break;
                }
            }
        }

        self.register_rx.close();
        self.destroy_rx.close();
        self.broadcast_rx.close();
        self.shutdown_rx.close();
        self.stopped.cancel();
        tracing::info!("Dispatcher stopped");
    }

    fn handle_register(&mut self, client: Arc<Client>) {
        let client_id = client.id().to_string();

        // Its Destroy overtook the Register on the other stream
        if client.is_connection_closed() {
            tracing::debug!(client_id = %client_id, "Skipping registration of a closed client");
            return;
        }

        if let Some(previous) = self.registry.insert(Arc::clone(&client)) {
            tracing::warn!(
                client_id = %client_id,
                replaced_closing = previous.is_closing(),
                "Registration replaced an existing client with the same id"
            );
        }
        self.stats.registrations.fetch_add(1, Ordering::Relaxed);
        self.stats.live.store(self.registry.len(), Ordering::Relaxed);

        tracing::info!(
            client_id = %client_id,
            total_clients = self.registry.len(),
            "Client registered"
        );

        // Fanned out inline: enqueueing onto our own stream could wait on ourselves
        let notice = Message::new(client_id, MessageType::Connected, "connected");
        self.handle_broadcast(&notice);
    }

    fn handle_destroy(&mut self, client: Arc<Client>) {
        self.stats.destroys.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = client.close_connection() {
            tracing::debug!(client_id = %client.id(), error = %e, "Destroy on a closed connection");
        }

        let removed = self.registry.remove(&client);
        self.stats.live.store(self.registry.len(), Ordering::Relaxed);

        tracing::info!(
            client_id = %client.id(),
            removed,
            remaining_clients = self.registry.len(),
            "Client destroyed"
        );
    }

    fn handle_broadcast(&mut self, message: &Message) -> FanOut {
        let mut outcome = FanOut::default();

        for (id, client) in &self.registry.clients {
            if *id == message.id {
                continue;
            }
            match client.deliver(message) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::warn!(client_id = %id, error = %e, "Failed to deliver broadcast");
                }
            }
        }

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(outcome.delivered as u64, Ordering::Relaxed);
        self.stats
            .delivery_failures
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);

        tracing::debug!(
            sender = %message.id,
            kind = ?message.kind,
            recipients = outcome.delivered,
            failed = outcome.failed,
            "Broadcast event"
        );

        outcome
    }

    async fn handle_shutdown(&mut self) {
        let clients = self.registry.drain();
        self.stats.live.store(0, Ordering::Relaxed);

        tracing::info!(
            policy = ?self.config.shutdown_policy,
            clients = clients.len(),
            "Dispatcher shutting down"
        );

        if self.config.shutdown_policy == ShutdownPolicy::Immediate {
            return;
        }

        for client in &clients {
            if let Err(e) = client.close_connection() {
                tracing::debug!(client_id = %client.id(), error = %e, "Already closed at shutdown");
            }
        }

        let drained = futures::future::join_all(clients.iter().map(|client| client.closed()));
        if tokio::time::timeout(self.config.drain_timeout, drained)
            .await
            .is_err()
        {
            tracing::warn!(
                timeout = ?self.config.drain_timeout,
                "Timed out waiting for clients to close"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::websocket::client::ClientOptions;
    use crate::websocket::connection::{memory, Frame};

    fn options() -> ClientOptions {
        ClientOptions {
            heartbeat_interval: Duration::from_secs(3600),
            send_buffer: 32,
        }
    }

    fn client(handle: &DispatcherHandle, id: &str) -> (Arc<Client>, memory::MemoryPeer) {
        let (sink, stream, peer) = memory::pair();
        (Client::new(id, sink, stream, handle.clone(), &options()), peer)
    }

    async fn wait_for_live(handle: &DispatcherHandle, expected: usize) {
        for _ in 0..100 {
            if handle.live_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("live count never reached {expected}");
    }

    #[tokio::test]
    async fn test_registry_count_tracks_size() {
        let (_dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        let (a, _pa) = client(&handle, "a");
        let (b, _pb) = client(&handle, "b");
        let (a2, _pa2) = client(&handle, "a");

        let mut registry = Registry::default();
        assert!(registry.insert(Arc::clone(&a)).is_none());
        assert!(registry.insert(Arc::clone(&b)).is_none());
        assert_eq!(registry.len(), 2);

        // Same id overwrites without changing the count
        assert!(registry.insert(Arc::clone(&a2)).is_some());
        assert_eq!(registry.len(), 2);

        // The replaced client cannot evict its successor
        assert!(!registry.remove(&a));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove(&a2));
        assert!(!registry.remove(&a2));
        assert!(registry.remove(&b));
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.len(), registry.clients.len());
    }

    #[tokio::test]
    async fn test_fan_out_excludes_sender_id() {
        let (mut dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        let (a, mut pa) = client(&handle, "a");
        let (b, mut pb) = client(&handle, "b");
        let (c, mut pc) = client(&handle, "c");
        dispatcher.registry.insert(a);
        dispatcher.registry.insert(b);
        dispatcher.registry.insert(c);

        let outcome = dispatcher.handle_broadcast(&Message::new("a", MessageType::Broadcast, "hi"));
        assert_eq!(outcome, FanOut { delivered: 2, failed: 0 });

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pa.drain_messages().is_empty());
        assert_eq!(pb.drain_messages()[0].content, "hi");
        assert_eq!(pc.drain_messages()[0].content, "hi");
    }

    #[tokio::test]
    async fn test_fan_out_continues_past_failed_recipient() {
        let (mut dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        let mut peers = Vec::new();
        for id in ["r1", "r2", "bad", "r3"] {
            let (c, p) = client(&handle, id);
            if id == "bad" {
                c.close_connection().unwrap();
            }
            dispatcher.registry.insert(c);
            peers.push((id, p));
        }

        let outcome =
            dispatcher.handle_broadcast(&Message::new("sender", MessageType::Broadcast, "hello"));
        assert_eq!(outcome, FanOut { delivered: 3, failed: 1 });

        tokio::time::sleep(Duration::from_millis(10)).await;
        for (id, mut peer) in peers {
            let got: Vec<_> = peer
                .drain_frames()
                .into_iter()
                .filter(|f| matches!(f, Frame::Text(_)))
                .collect();
            if id == "bad" {
                assert!(got.is_empty());
            } else {
                assert_eq!(got.len(), 1, "recipient {id}");
            }
        }
        // The failed peer stays registered until its own close path runs
        assert_eq!(dispatcher.registry.len(), 4);
    }

    #[tokio::test]
    async fn test_destroy_of_closed_connection_is_swallowed() {
        let (mut dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        let (a, _pa) = client(&handle, "a");
        dispatcher.handle_register(Arc::clone(&a));

        a.close_connection().unwrap();
        dispatcher.handle_destroy(Arc::clone(&a));
        dispatcher.handle_destroy(a);

        assert_eq!(dispatcher.registry.len(), 0);
        assert_eq!(handle.stats().destroys, 2);
        assert_eq!(handle.live_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_before_register_leaves_no_entry() {
        let (mut dispatcher, handle) = Dispatcher::new(DispatcherConfig::default());
        let (a, mut pa) = client(&handle, "a");
        let (b, mut pb) = client(&handle, "b");
        dispatcher.handle_register(b);

        dispatcher.handle_destroy(Arc::clone(&a));
        dispatcher.handle_register(a);

        assert_eq!(dispatcher.registry.len(), 1);
        assert_eq!(handle.live_count(), 1);
        assert_eq!(handle.stats().registrations, 1);

        // No arrival notice went out for the closed client
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(pb.drain_messages().is_empty());
        assert_eq!(pa.drain_frames(), vec![Frame::Close]);
    }

    #[tokio::test]
    async fn test_events_after_shutdown_are_rejected() {
        let (handle, task) = Dispatcher::spawn(DispatcherConfig::default());
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(handle.is_stopped());
        assert!(matches!(
            handle.broadcast(Message::new("x", MessageType::Broadcast, "late")).await,
            Err(RelayError::DispatcherClosed)
        ));
    }

    #[tokio::test]
    async fn test_drain_shutdown_closes_every_peer() {
        let (handle, task) = Dispatcher::spawn(DispatcherConfig::default());
        let (a, mut pa) = client(&handle, "a");
        let (b, mut pb) = client(&handle, "b");
        handle.register(a).await.unwrap();
        handle.register(b).await.unwrap();
        wait_for_live(&handle, 2).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        for peer in [&mut pa, &mut pb] {
            let frames = peer.drain_frames();
            assert_eq!(frames.last(), Some(&Frame::Close));
        }
        assert_eq!(handle.live_count(), 0);
    }

    #[tokio::test]
    async fn test_immediate_shutdown_leaves_peers_alone() {
        let config = DispatcherConfig {
            shutdown_policy: ShutdownPolicy::Immediate,
            ..DispatcherConfig::default()
        };
        let (handle, task) = Dispatcher::spawn(config);
        let (a, mut pa) = client(&handle, "a");
        handle.register(Arc::clone(&a)).await.unwrap();
        wait_for_live(&handle, 1).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(!a.is_connection_closed());
        assert!(!pa.drain_frames().contains(&Frame::Close));
    }

    #[test]
    fn test_shutdown_policy_parse() {
        assert_eq!("drain".parse::<ShutdownPolicy>().unwrap(), ShutdownPolicy::Drain);
        assert_eq!("IMMEDIATE".parse::<ShutdownPolicy>().unwrap(), ShutdownPolicy::Immediate);
        assert!("later".parse::<ShutdownPolicy>().is_err());
    }
}
