//! Engine — top-level coordinator for the chat node.
//!
//! The [`Engine`] owns the listener, discovery, connection pool, message
//! bus and history store. It reacts to discovery by opening outbound
//! connections, drives accepted sockets through the acceptor handshake,
//! and bridges bus events to outbound sends. Consumer callbacks run on a
//! single drain-pump task, never on connection I/O tasks.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::bus::{EventKind, MessageBus, NetEvent, Subscription};
use crate::config::NetworkConfig;
use crate::connection::PeerConnection;
use crate::discovery::{Advertisement, DiscoveryConfig, DiscoveryService, Endpoint};
use crate::error::NetworkError;
use crate::history::{ChatHistory, StoredMessage};
use crate::identity::{NodeIdentity, PeerId};
use crate::pool::ConnectionPool;
use crate::protocol::{ChatMessage, MessagesReply};

/// The top-level chat engine. Create one per process and call
/// [`start()`](Engine::start).
pub struct Engine {
    identity: NodeIdentity,
    config: NetworkConfig,
    /// Injected execution context; every background task is spawned on it.
    runtime: tokio::runtime::Handle,
    bus: Arc<MessageBus>,
    pool: Arc<ConnectionPool>,
    history: Arc<Mutex<ChatHistory>>,
    discovery: Arc<DiscoveryService>,
    subscriptions: Vec<Subscription>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    local_port: Option<u16>,
    running: bool,
}

impl Engine {
    /// Create a new engine and wire up its bus subscriptions.
    pub fn new(
        identity: NodeIdentity,
        config: NetworkConfig,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let bus = Arc::new(MessageBus::new());
        let pool = Arc::new(ConnectionPool::new());
        let history = Arc::new(Mutex::new(ChatHistory::new()));
        let discovery = Arc::new(DiscoveryService::new(DiscoveryConfig {
            group: config.discovery_group,
            port: config.discovery_port,
            interval: config.advertise_interval,
            local_id: identity.peer_id.clone(),
        }));

        let mut engine = Self {
            identity,
            config,
            runtime,
            bus,
            pool,
            history,
            discovery,
            subscriptions: Vec::new(),
            shutdown_tx: None,
            local_port: None,
            running: false,
        };
        engine.register_subscribers();
        engine
    }

    fn register_subscribers(&mut self) {
        // Handshake complete: record the peer and greet it.
        let history = Arc::clone(&self.history);
        let pool = Arc::clone(&self.pool);
        let own_name = self.identity.display_name.clone();
        self.subscriptions.push(self.bus.subscribe(
            EventKind::PeerConnected,
            Box::new(move |event| {
                let NetEvent::PeerConnected { peer_id, display_name } = event else {
                    return;
                };
                let name = display_name.clone().unwrap_or_else(|| peer_id.to_string());
                history
                    .lock()
                    .expect("history lock poisoned")
                    .add_peer(peer_id.as_str(), &name);

                let greeting = MessagesReply {
                    text: format!("Well, hello {name}. My name is {own_name}"),
                };
                match pool.get_connection(peer_id) {
                    Some(conn) => {
                        if let Err(e) = conn.send(&ChatMessage::MessagesReply(greeting)) {
                            warn!("Failed to greet {peer_id}: {e}");
                        }
                    }
                    None => warn!("No pooled connection for freshly connected {peer_id}"),
                }
            }),
        ));

        // Connection gone: drop the stale pool entry.
        let pool = Arc::clone(&self.pool);
        self.subscriptions.push(self.bus.subscribe(
            EventKind::PeerDisconnected,
            Box::new(move |event| {
                if let NetEvent::PeerDisconnected { peer_id } = event {
                    if pool.remove_connection(peer_id).is_some() {
                        debug!("Removed closed connection for {peer_id}");
                    }
                }
            }),
        ));

        // A peer asked for stored messages: answer from history.
        let history = Arc::clone(&self.history);
        let pool = Arc::clone(&self.pool);
        self.subscriptions.push(self.bus.subscribe(
            EventKind::MessageRequest,
            Box::new(move |event| {
                let NetEvent::MessageRequest { request, .. } = event else {
                    return;
                };
                let messages = history
                    .lock()
                    .expect("history lock poisoned")
                    .last_n(request.target_id.as_str(), 1);
                // Nothing stored for that peer: recover as a no-op.
                let Some(last) = messages.last() else { return };

                match pool.get_connection(&request.from_id) {
                    Some(conn) => {
                        let reply = MessagesReply { text: last.text.clone() };
                        if let Err(e) = conn.send(&ChatMessage::MessagesReply(reply)) {
                            warn!("Failed to answer message request from {}: {e}", request.from_id);
                        }
                    }
                    None => warn!("Message request from unpooled peer {}", request.from_id),
                }
            }),
        ));

        // Inbound chat text: store it and surface it.
        let history = Arc::clone(&self.history);
        self.subscriptions.push(self.bus.subscribe(
            EventKind::MessagesReply,
            Box::new(move |event| {
                if let NetEvent::MessagesReply { from, reply } = event {
                    history
                        .lock()
                        .expect("history lock poisoned")
                        .append(from.as_str(), &reply.text);
                    info!(target: "chat", "[{from}] {}", reply.text);
                }
            }),
        ));
    }

    /// Start the node: bind the listener, start discovery, begin serving
    /// bus drains. Idempotent while running.
    pub async fn start(&mut self) -> Result<(), NetworkError> {
        if self.running {
            return Ok(());
        }

        let (shutdown_tx, _) = broadcast::channel(8);
        self.shutdown_tx = Some(shutdown_tx.clone());

        // Listener first, so the advertised port is the real one.
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.listen_port)).await?;
        let local_port = listener.local_addr()?.port();
        self.local_port = Some(local_port);
        info!(
            "Engine '{}' listening on port {local_port} (peer_id: {})",
            self.identity.display_name, self.identity.peer_id
        );

        // Drain pump: the single logical sequence all subscribers run on.
        let (drain_tx, mut drain_rx) = mpsc::unbounded_channel::<()>();
        self.bus.set_scheduler_hook(Box::new(move || {
            let _ = drain_tx.send(());
        }));
        let bus = Arc::clone(&self.bus);
        let mut drain_shutdown = shutdown_tx.subscribe();
        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = drain_rx.recv() => bus.drain(),
                    _ = drain_shutdown.recv() => {
                        debug!("Drain pump shutting down");
                        break;
                    }
                }
            }
        });

        // Accept loop.
        let identity = self.identity.clone();
        let bus = Arc::clone(&self.bus);
        let pool = Arc::clone(&self.pool);
        let timeout = self.config.connection_timeout;
        let runtime = self.runtime.clone();
        let mut accept_shutdown = shutdown_tx.subscribe();
        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                debug!("Accepted connection from {peer_addr}");
                                let identity = identity.clone();
                                let bus = Arc::clone(&bus);
                                let pool = Arc::clone(&pool);
                                runtime.spawn(async move {
                                    accept_inbound(stream, identity, bus, pool, timeout).await;
                                });
                            }
                            Err(e) => warn!("TCP accept failed: {e}"),
                        }
                    }
                    _ = accept_shutdown.recv() => {
                        debug!("Accept loop shutting down");
                        break;
                    }
                }
            }
        });

        // Discovery: advertise ourselves, chase new endpoints.
        if self.config.discovery_enabled {
            let advertisement = Advertisement {
                id: self.identity.peer_id.clone(),
                ip: local_ipv4(&self.config).to_string(),
                port: local_port,
            };
            self.discovery.set_broadcast_data(&advertisement)?;

            let identity = self.identity.clone();
            let bus = Arc::clone(&self.bus);
            let pool = Arc::clone(&self.pool);
            let runtime = self.runtime.clone();
            self.discovery.on_new_endpoint(Box::new(move |id, endpoint| {
                if pool.contains(&id) {
                    return;
                }
                let identity = identity.clone();
                let bus = Arc::clone(&bus);
                let pool = Arc::clone(&pool);
                runtime.spawn(async move {
                    open_outbound(&endpoint, identity, bus, pool, timeout).await;
                });
            }));

            if let Err(e) = self.discovery.start(shutdown_tx.subscribe()).await {
                warn!("Discovery start failed (non-fatal): {e}");
            }
        }

        self.running = true;
        Ok(())
    }

    /// Stop the node: shut background tasks down and close every
    /// connection. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.pool.close_all();
        self.running = false;
        info!("Engine '{}' stopped", self.identity.display_name);
    }

    /// Open a connection to a specific endpoint, bypassing discovery.
    pub async fn connect_to(&self, endpoint: &Endpoint) -> Result<PeerId, NetworkError> {
        if !self.running {
            return Err(NetworkError::NotRunning);
        }
        let connection = PeerConnection::connect(
            endpoint,
            &self.identity,
            Arc::clone(&self.bus),
            self.config.connection_timeout,
        )
        .await?;
        let peer_id = connection.peer_id().clone();
        let display_name = connection.remote_name().map(str::to_string);
        self.pool.add_connection(connection);
        self.bus.publish(NetEvent::PeerConnected {
            peer_id: peer_id.clone(),
            display_name,
        });
        Ok(peer_id)
    }

    /// Send chat text to a peer. Best-effort: the text is recorded
    /// locally, and an unknown id or a dead connection produces only a
    /// log line — no retry, no delivery confirmation.
    pub fn send_message(&self, text: impl Into<String>, to_id: &PeerId) {
        let text = text.into();
        self.history
            .lock()
            .expect("history lock poisoned")
            .append(to_id.as_str(), &text);

        match self.pool.get_connection(to_id) {
            Some(conn) => {
                debug!("Send message to {to_id}");
                if let Err(e) = conn.send(&ChatMessage::MessagesReply(MessagesReply { text })) {
                    warn!("Failed to send message to {to_id}: {e}");
                }
            }
            None => warn!("Trying to send message to {to_id}, but no connection is pooled"),
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn peer_id(&self) -> &PeerId {
        &self.identity.peer_id
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The bound TCP listener port, once started.
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// The bus, for application subscribers.
    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    /// Snapshot of every endpoint discovery has observed.
    pub fn known_endpoints(&self) -> std::collections::HashMap<PeerId, Endpoint> {
        self.discovery.known_endpoints()
    }

    /// Ids of peers with a pooled connection.
    pub fn connected_ids(&self) -> Vec<PeerId> {
        self.pool.connected_ids()
    }

    /// The last `n` history entries for a peer.
    pub fn last_messages(&self, peer_id: &PeerId, n: usize) -> Vec<StoredMessage> {
        self.history
            .lock()
            .expect("history lock poisoned")
            .last_n(peer_id.as_str(), n)
    }
}

// ---------------------------------------------------------------------------
// Connection setup flows
// ---------------------------------------------------------------------------

async fn open_outbound(
    endpoint: &Endpoint,
    identity: NodeIdentity,
    bus: Arc<MessageBus>,
    pool: Arc<ConnectionPool>,
    timeout: Duration,
) {
    match PeerConnection::connect(endpoint, &identity, Arc::clone(&bus), timeout).await {
        Ok(connection) => {
            let peer_id = connection.peer_id().clone();
            let display_name = connection.remote_name().map(str::to_string);
            info!("Connected to discovered peer {peer_id} at {}:{}", endpoint.ip, endpoint.port);
            pool.add_connection(connection);
            bus.publish(NetEvent::PeerConnected { peer_id, display_name });
        }
        Err(e) => {
            warn!("Failed to connect to {}:{}: {e}", endpoint.ip, endpoint.port);
        }
    }
}

async fn accept_inbound(
    stream: TcpStream,
    identity: NodeIdentity,
    bus: Arc<MessageBus>,
    pool: Arc<ConnectionPool>,
    timeout: Duration,
) {
    match PeerConnection::accept(stream, &identity, Arc::clone(&bus), timeout).await {
        Ok(connection) => {
            // Trust-on-first-use: the remote's self-reported id keys the
            // pool without verification.
            let peer_id = connection.peer_id().clone();
            let display_name = connection.remote_name().map(str::to_string);
            pool.add_connection(connection);
            bus.publish(NetEvent::PeerConnected { peer_id, display_name });
        }
        Err(e) => warn!("Inbound handshake failed: {e}"),
    }
}

/// Best-effort pick of the local IPv4 address to advertise: a route probe
/// towards the discovery group, falling back to loopback.
fn local_ipv4(config: &NetworkConfig) -> Ipv4Addr {
    let probe = || -> Option<Ipv4Addr> {
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        socket
            .connect((config.discovery_group, config.discovery_port))
            .ok()?;
        match socket.local_addr().ok()? {
            SocketAddr::V4(addr) => Some(*addr.ip()),
            SocketAddr::V6(_) => None,
        }
    };
    probe().unwrap_or(Ipv4Addr::LOCALHOST)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
