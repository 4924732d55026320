//! Per-peer connection — handshake plus duplex steady-state loops.
//!
//! A connection owns exactly one TCP socket. After the handshake succeeds
//! two tasks are spawned: a reader that decodes inbound packets and
//! publishes them on the message bus, and a writer that drains a strict
//! FIFO queue of outgoing packets. [`PeerConnection`] is the cloneable
//! handle used to enqueue sends and to close the socket.
//!
//! Handshake direction: the acceptor sends `UserMetaRequest` first and
//! waits for the initiator's `UserMetaReply`; the initiator waits for the
//! request and replies with its own identity. Any missing, malformed or
//! wrong-type message during the exchange aborts the connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::bus::{MessageBus, NetEvent};
use crate::discovery::Endpoint;
use crate::error::NetworkError;
use crate::identity::{NodeIdentity, PeerId};
use crate::protocol::{
    ChatMessage, Packet, UserMetaReply, UserMetaRequest, read_packet, write_packet,
};

/// Lifecycle of a peer connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// TCP connect in flight (outbound only).
    Connecting,
    /// Socket established, handshake exchange in progress.
    Handshaking,
    /// Handshake done, reader and writer loops running.
    Active,
    /// Socket closed; no further traffic.
    Closed,
}

/// Handle to an active peer connection.
///
/// Cheap to clone; all clones refer to the same socket, queue and state.
#[derive(Clone)]
pub struct PeerConnection {
    peer_id: PeerId,
    remote_name: Option<String>,
    outgoing: mpsc::UnboundedSender<Packet>,
    closed: Arc<watch::Sender<bool>>,
    state: Arc<Mutex<ConnectionState>>,
}

impl PeerConnection {
    /// Open an outbound connection to a discovered peer and run the
    /// initiator side of the handshake.
    pub async fn connect(
        endpoint: &Endpoint,
        identity: &NodeIdentity,
        bus: Arc<MessageBus>,
        timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));
        let addr = format!("{}:{}", endpoint.ip, endpoint.port);
        debug!("Connecting to {addr}");

        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| NetworkError::Timeout(timeout))??;

        set_state(&state, ConnectionState::Handshaking);
        let remote_id = initiator_handshake(&mut stream, identity, timeout).await?;
        debug!("Handshake complete with {remote_id} (outbound)");

        Ok(Self::spawn_io(stream, remote_id, None, bus, state))
    }

    /// Drive an accepted socket through the acceptor side of the handshake.
    pub async fn accept(
        mut stream: TcpStream,
        identity: &NodeIdentity,
        bus: Arc<MessageBus>,
        timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let state = Arc::new(Mutex::new(ConnectionState::Handshaking));

        let (remote_id, remote_name) = acceptor_handshake(&mut stream, identity, timeout).await?;
        debug!("Handshake complete with {remote_id} '{remote_name}' (inbound)");

        Ok(Self::spawn_io(stream, remote_id, Some(remote_name), bus, state))
    }

    /// Transition to `Active` and start the reader and writer loops.
    ///
    /// Only called after handshake success, so no chat packet can precede
    /// the handshake's own messages on the wire.
    fn spawn_io(
        stream: TcpStream,
        peer_id: PeerId,
        remote_name: Option<String>,
        bus: Arc<MessageBus>,
        state: Arc<Mutex<ConnectionState>>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let closed = Arc::new(closed_tx);

        set_state(&state, ConnectionState::Active);

        tokio::spawn(reader_loop(
            read_half,
            peer_id.clone(),
            Arc::clone(&bus),
            Arc::clone(&state),
            Arc::clone(&closed),
        ));
        tokio::spawn(writer_loop(
            write_half,
            outgoing_rx,
            peer_id.clone(),
            Arc::clone(&closed),
        ));

        Self {
            peer_id,
            remote_name,
            outgoing: outgoing_tx,
            closed,
            state,
        }
    }

    /// The remote peer's id (self-reported during the handshake for
    /// inbound connections, taken from discovery for outbound ones).
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Display name learned from the handshake reply, if this side saw one.
    pub fn remote_name(&self) -> Option<&str> {
        self.remote_name.as_deref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state lock poisoned")
    }

    /// Enqueue a message for delivery. Thread-safe; the writer preserves
    /// strict FIFO order per connection.
    pub fn send(&self, message: &ChatMessage) -> Result<(), NetworkError> {
        if self.state() == ConnectionState::Closed {
            return Err(NetworkError::Closed);
        }
        let packet = Packet::from_message(message)?;
        self.outgoing.send(packet).map_err(|_| NetworkError::Closed)
    }

    /// Close the connection. Idempotent; wakes both loops so they observe
    /// closure and exit promptly.
    pub fn close(&self) {
        let _ = self.closed.send(true);
    }
}

fn set_state(state: &Arc<Mutex<ConnectionState>>, next: ConnectionState) {
    *state.lock().expect("connection state lock poisoned") = next;
}

// ---------------------------------------------------------------------------
// Handshake sub-protocol
// ---------------------------------------------------------------------------

async fn read_handshake_message<S>(
    stream: &mut S,
    timeout: Duration,
) -> Result<ChatMessage, NetworkError>
where
    S: AsyncRead + Unpin,
{
    let packet = tokio::time::timeout(timeout, read_packet(stream))
        .await
        .map_err(|_| NetworkError::Timeout(timeout))??;
    // Decode failures are terminal during the handshake.
    packet.message()
}

/// Initiator side: wait for the acceptor's `UserMetaRequest`, answer with
/// our identity. Returns the acceptor's peer id.
async fn initiator_handshake<S>(
    stream: &mut S,
    identity: &NodeIdentity,
    timeout: Duration,
) -> Result<PeerId, NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let message = read_handshake_message(stream, timeout).await?;
    let ChatMessage::UserMetaRequest(request) = message else {
        return Err(NetworkError::Protocol(format!(
            "expected UserMetaRequest during handshake, got {:?}",
            message.tag()
        )));
    };

    let reply = ChatMessage::UserMetaReply(UserMetaReply {
        peer_id: identity.peer_id.clone(),
        display_name: identity.display_name.clone(),
        room_ids: identity.room_ids.clone(),
    });
    write_packet(stream, &Packet::from_message(&reply)?).await?;

    Ok(request.from_id)
}

/// Acceptor side: send `UserMetaRequest` first, await the initiator's
/// `UserMetaReply`. Returns the initiator's self-reported id and name.
async fn acceptor_handshake<S>(
    stream: &mut S,
    identity: &NodeIdentity,
    timeout: Duration,
) -> Result<(PeerId, String), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = ChatMessage::UserMetaRequest(UserMetaRequest {
        from_id: identity.peer_id.clone(),
    });
    write_packet(stream, &Packet::from_message(&request)?).await?;

    let message = read_handshake_message(stream, timeout).await?;
    let ChatMessage::UserMetaReply(reply) = message else {
        return Err(NetworkError::Protocol(format!(
            "expected UserMetaReply during handshake, got {:?}",
            message.tag()
        )));
    };

    Ok((reply.peer_id, reply.display_name))
}

// ---------------------------------------------------------------------------
// Steady-state loops
// ---------------------------------------------------------------------------

fn inbound_event(peer_id: &PeerId, message: ChatMessage) -> NetEvent {
    match message {
        ChatMessage::UserMetaRequest(request) => NetEvent::UserMetaRequest {
            from: peer_id.clone(),
            request,
        },
        ChatMessage::UserMetaReply(reply) => NetEvent::UserMetaReply {
            from: peer_id.clone(),
            reply,
        },
        ChatMessage::MessageRequest(request) => NetEvent::MessageRequest {
            from: peer_id.clone(),
            request,
        },
        ChatMessage::MessagesReply(reply) => NetEvent::MessagesReply {
            from: peer_id.clone(),
            reply,
        },
    }
}

/// Read packets until an I/O error, EOF or close signal; publish each
/// decoded message on the bus. Owns the `Closed` transition and the
/// `PeerDisconnected` announcement.
async fn reader_loop(
    mut reader: OwnedReadHalf,
    peer_id: PeerId,
    bus: Arc<MessageBus>,
    state: Arc<Mutex<ConnectionState>>,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut closed_rx = closed.subscribe();
    loop {
        tokio::select! {
            result = read_packet(&mut reader) => {
                match result {
                    Ok(packet) => match packet.message() {
                        Ok(message) => {
                            trace!("Read {:?} from {peer_id}", message.tag());
                            bus.publish(inbound_event(&peer_id, message));
                        }
                        // Codec errors are recoverable in steady state.
                        Err(e) => warn!("Dropping undecodable packet from {peer_id}: {e}"),
                    },
                    Err(e) => {
                        debug!("Reader for {peer_id} ended: {e}");
                        break;
                    }
                }
            }
            _ = closed_rx.changed() => {
                debug!("Reader for {peer_id} cancelled by close");
                break;
            }
        }
    }

    set_state(&state, ConnectionState::Closed);
    let _ = closed.send(true);
    bus.publish(NetEvent::PeerDisconnected { peer_id });
}

/// Pop the FIFO queue and write each packet fully, header then body.
/// Suspends on an empty queue until woken by a send or the close signal.
async fn writer_loop(
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Packet>,
    peer_id: PeerId,
    closed: Arc<watch::Sender<bool>>,
) {
    let mut closed_rx = closed.subscribe();
    loop {
        tokio::select! {
            maybe = outgoing.recv() => {
                match maybe {
                    Some(packet) => {
                        if let Err(e) = write_packet(&mut writer, &packet).await {
                            debug!("Writer for {peer_id} ended: {e}");
                            break;
                        }
                    }
                    // All handles dropped.
                    None => break,
                }
            }
            _ = closed_rx.changed() => {
                debug!("Writer for {peer_id} cancelled by close");
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    // Wake the reader so it observes closure even without wire traffic.
    let _ = closed.send(true);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventKind;
    use crate::protocol::MessagesReply;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    /// Route test log output through the capture writer; filtered by
    /// RUST_LOG as usual.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn local_endpoint(port: u16) -> Endpoint {
        Endpoint {
            ip: "127.0.0.1".to_string(),
            port,
        }
    }

    /// Handshake a real socket pair on localhost; returns
    /// (initiator conn + bus, acceptor conn + bus).
    async fn connected_pair() -> (
        (PeerConnection, Arc<MessageBus>),
        (PeerConnection, Arc<MessageBus>),
    ) {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let acceptor_identity = NodeIdentity::generate("acceptor");
        let acceptor_bus = Arc::new(MessageBus::new());
        let bus = Arc::clone(&acceptor_bus);
        let acceptor_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            PeerConnection::accept(stream, &acceptor_identity, bus, Duration::from_secs(2))
                .await
                .unwrap()
        });

        let initiator_identity = NodeIdentity::generate("initiator");
        let initiator_bus = Arc::new(MessageBus::new());
        let initiator_conn = PeerConnection::connect(
            &local_endpoint(port),
            &initiator_identity,
            Arc::clone(&initiator_bus),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let acceptor_conn = acceptor_task.await.unwrap();
        ((initiator_conn, initiator_bus), (acceptor_conn, acceptor_bus))
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn test_handshake_completes_both_sides_active() {
        let ((initiator, _), (acceptor, _)) = connected_pair().await;

        assert_eq!(initiator.state(), ConnectionState::Active);
        assert_eq!(acceptor.state(), ConnectionState::Active);
        // The acceptor learned the initiator's self-reported identity.
        assert_eq!(acceptor.remote_name(), Some("initiator"));
        assert!(!acceptor.peer_id().as_str().is_empty());
        // The initiator learned the acceptor's id from its request.
        assert!(!initiator.peer_id().as_str().is_empty());
        assert_ne!(initiator.peer_id(), acceptor.peer_id());
    }

    #[tokio::test]
    async fn test_send_reaches_remote_bus() {
        let ((initiator, _), (_acceptor, acceptor_bus)) = connected_pair().await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        acceptor_bus.subscribe(
            EventKind::MessagesReply,
            Box::new(move |event| {
                if let NetEvent::MessagesReply { reply, .. } = event {
                    s.lock().unwrap().push(reply.text.clone());
                }
            }),
        );

        initiator
            .send(&ChatMessage::MessagesReply(MessagesReply { text: "hi".into() }))
            .unwrap();

        // No scheduler hook installed: drain manually once the reader has
        // published the event.
        let bus = Arc::clone(&acceptor_bus);
        wait_for(move || bus.pending_len() > 0).await;
        acceptor_bus.drain();

        assert_eq!(*seen.lock().unwrap(), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_sends_preserve_fifo_order() {
        let ((initiator, _), (_acceptor, acceptor_bus)) = connected_pair().await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        acceptor_bus.subscribe(
            EventKind::MessagesReply,
            Box::new(move |event| {
                if let NetEvent::MessagesReply { reply, .. } = event {
                    s.lock().unwrap().push(reply.text.clone());
                }
            }),
        );

        for i in 0..10 {
            initiator
                .send(&ChatMessage::MessagesReply(MessagesReply {
                    text: format!("msg-{i}"),
                }))
                .unwrap();
        }

        let s = Arc::clone(&seen);
        let bus = Arc::clone(&acceptor_bus);
        wait_for(move || {
            bus.drain();
            s.lock().unwrap().len() == 10
        })
        .await;

        let expected: Vec<String> = (0..10).map(|i| format!("msg-{i}")).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_terminal() {
        let ((initiator, _), (acceptor, acceptor_bus)) = connected_pair().await;

        initiator.close();
        initiator.close();

        let conn = initiator.clone();
        wait_for(move || conn.state() == ConnectionState::Closed).await;

        // The remote side observes EOF and publishes its disconnect event.
        let bus = Arc::clone(&acceptor_bus);
        let conn = acceptor.clone();
        wait_for(move || {
            bus.drain();
            conn.state() == ConnectionState::Closed
        })
        .await;

        assert!(matches!(
            initiator.send(&ChatMessage::MessagesReply(MessagesReply { text: "x".into() })),
            Err(NetworkError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_event_published_on_close() {
        let ((initiator, initiator_bus), (_acceptor, _)) = connected_pair().await;

        let gone = Arc::new(StdMutex::new(Vec::new()));
        let g = Arc::clone(&gone);
        initiator_bus.subscribe(
            EventKind::PeerDisconnected,
            Box::new(move |event| {
                if let NetEvent::PeerDisconnected { peer_id } = event {
                    g.lock().unwrap().push(peer_id.clone());
                }
            }),
        );

        let expected = initiator.peer_id().clone();
        initiator.close();

        let bus = Arc::clone(&initiator_bus);
        let g = Arc::clone(&gone);
        wait_for(move || {
            bus.drain();
            !g.lock().unwrap().is_empty()
        })
        .await;

        assert_eq!(*gone.lock().unwrap(), vec![expected]);
    }

    #[tokio::test]
    async fn test_acceptor_rejects_wrong_handshake_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let identity = NodeIdentity::generate("acceptor");
        let bus = Arc::new(MessageBus::new());
        let acceptor_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            PeerConnection::accept(stream, &identity, bus, Duration::from_secs(2)).await
        });

        // Misbehaving initiator: answers the meta request with chat text.
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = read_packet(&mut stream).await.unwrap();
        assert!(matches!(
            request.message().unwrap(),
            ChatMessage::UserMetaRequest(_)
        ));
        let wrong = ChatMessage::MessagesReply(MessagesReply { text: "nope".into() });
        write_packet(&mut stream, &Packet::from_message(&wrong).unwrap())
            .await
            .unwrap();

        match acceptor_task.await.unwrap() {
            Err(NetworkError::Protocol(_)) => {}
            other => panic!("Expected Protocol error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_initiator_times_out_on_silent_acceptor() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Accept the socket but never speak.
        let silent = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let identity = NodeIdentity::generate("initiator");
        let bus = Arc::new(MessageBus::new());
        let result = PeerConnection::connect(
            &local_endpoint(port),
            &identity,
            bus,
            Duration::from_millis(200),
        )
        .await;

        assert!(matches!(result, Err(NetworkError::Timeout(_))));
        silent.abort();
    }

    #[tokio::test]
    async fn test_undecodable_steady_state_packet_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let identity = NodeIdentity::generate("acceptor");
        let acceptor_bus = Arc::new(MessageBus::new());
        let bus = Arc::clone(&acceptor_bus);
        let acceptor_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            PeerConnection::accept(stream, &identity, bus, Duration::from_secs(2))
                .await
                .unwrap()
        });

        // Handshake by hand, then send garbage under a known tag followed
        // by a valid packet.
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let initiator = NodeIdentity::generate("initiator");
        initiator_handshake(&mut stream, &initiator, Duration::from_secs(2))
            .await
            .unwrap();
        let acceptor_conn = acceptor_task.await.unwrap();

        let bad = Packet::from_parts(
            crate::protocol::Header { tag: 3, body_len: 7 },
            b"not-js!".to_vec(),
        );
        write_packet(&mut stream, &bad).await.unwrap();
        let good = ChatMessage::MessagesReply(MessagesReply { text: "still here".into() });
        write_packet(&mut stream, &Packet::from_message(&good).unwrap())
            .await
            .unwrap();

        let bus = Arc::clone(&acceptor_bus);
        wait_for(move || bus.pending_len() > 0).await;

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        acceptor_bus.subscribe(
            EventKind::MessagesReply,
            Box::new(move |event| {
                if let NetEvent::MessagesReply { reply, .. } = event {
                    s.lock().unwrap().push(reply.text.clone());
                }
            }),
        );
        acceptor_bus.drain();

        // Only the valid packet surfaced; the connection stayed up.
        assert_eq!(*seen.lock().unwrap(), vec!["still here".to_string()]);
        assert_eq!(acceptor_conn.state(), ConnectionState::Active);
    }
}
