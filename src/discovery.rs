//! LAN peer discovery via UDP multicast.
//!
//! A broadcaster periodically sends this node's advertisement to a
//! well-known multicast group, and a receiver listens on the same group
//! and reports each newly observed peer id exactly once through the
//! registered callback. Re-advertisements refresh the stored endpoint
//! silently.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::error::NetworkError;
use crate::identity::PeerId;

/// A reachable TCP listener address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

/// The advertisement payload sent each broadcast tick.
///
/// Serialized as a flat JSON object with exactly the fields `id`, `ip`
/// and `port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub id: PeerId,
    pub ip: String,
    pub port: u16,
}

impl Advertisement {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            ip: self.ip.clone(),
            port: self.port,
        }
    }
}

/// Configuration for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Multicast group to send to and join.
    pub group: Ipv4Addr,
    /// UDP port to broadcast on and listen on.
    pub port: u16,
    /// How often to broadcast an advertisement.
    pub interval: Duration,
    /// Our own peer id; advertisements carrying it are ignored.
    pub local_id: PeerId,
}

/// Callback invoked exactly once per newly observed peer id.
pub type NewEndpointCallback = Box<dyn Fn(PeerId, Endpoint) + Send + Sync>;

/// Append/update-only map of every peer id seen this process run.
///
/// The dedup key is the id alone: `observe` returns true only the first
/// time an id is seen; later observations overwrite the stored endpoint
/// and return false.
#[derive(Debug, Default)]
pub struct KnownPeers {
    peers: HashMap<PeerId, Endpoint>,
}

impl KnownPeers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an advertisement. Returns true if the id is new.
    pub fn observe(&mut self, id: PeerId, endpoint: Endpoint) -> bool {
        self.peers.insert(id, endpoint).is_none()
    }

    pub fn get(&self, id: &PeerId) -> Option<&Endpoint> {
        self.peers.get(id)
    }

    pub fn snapshot(&self) -> HashMap<PeerId, Endpoint> {
        self.peers.clone()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

struct DiscoveryInner {
    config: DiscoveryConfig,
    /// Serialized advertisement sent each tick; a tick with no payload
    /// armed is a no-op.
    payload: Mutex<Option<Vec<u8>>>,
    known: Mutex<KnownPeers>,
    callback: Mutex<Option<NewEndpointCallback>>,
}

impl DiscoveryInner {
    /// Parse one datagram and update the known-peer map. The new-peer
    /// callback fires only for ids never seen before.
    fn handle_datagram(&self, data: &[u8]) {
        let advertisement = match serde_json::from_slice::<Advertisement>(data) {
            Ok(ad) => ad,
            Err(e) => {
                warn!("Malformed advertisement: {e}");
                return;
            }
        };

        if advertisement.id == self.config.local_id {
            return;
        }

        let endpoint = advertisement.endpoint();
        let is_new = {
            let mut known = self.known.lock().expect("known peers lock poisoned");
            known.observe(advertisement.id.clone(), endpoint.clone())
        };

        if is_new {
            info!(
                "Found new endpoint: {}:{}, id: {}",
                endpoint.ip, endpoint.port, advertisement.id
            );
            let callback = self.callback.lock().expect("discovery callback lock poisoned");
            if let Some(cb) = callback.as_ref() {
                cb(advertisement.id, endpoint);
            }
        } else {
            trace!("Refreshed endpoint for known peer {}", advertisement.id);
        }
    }
}

/// LAN discovery service: multicast broadcaster plus receiver.
pub struct DiscoveryService {
    inner: Arc<DiscoveryInner>,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                config,
                payload: Mutex::new(None),
                known: Mutex::new(KnownPeers::new()),
                callback: Mutex::new(None),
            }),
        }
    }

    /// (Re)arm the advertisement sent each broadcast tick.
    pub fn set_broadcast_data(&self, advertisement: &Advertisement) -> Result<(), NetworkError> {
        let bytes = serde_json::to_vec(advertisement)?;
        *self.inner.payload.lock().expect("payload lock poisoned") = Some(bytes);
        Ok(())
    }

    /// Register the handler invoked exactly once per newly observed id.
    pub fn on_new_endpoint(&self, callback: NewEndpointCallback) {
        *self.inner.callback.lock().expect("discovery callback lock poisoned") = Some(callback);
    }

    /// Snapshot of every peer observed this run.
    pub fn known_endpoints(&self) -> HashMap<PeerId, Endpoint> {
        self.inner.known.lock().expect("known peers lock poisoned").snapshot()
    }

    /// Start the broadcaster and receiver in the background.
    ///
    /// Both tasks exit when the shutdown signal fires. Socket errors and
    /// malformed payloads are logged; neither ends the loops.
    pub async fn start(
        &self,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<(), NetworkError> {
        let config = &self.inner.config;
        let group = config.group;
        let port = config.port;
        let interval = config.interval;

        let recv_socket = multicast_receiver_socket(group, port)
            .map_err(|e| NetworkError::Discovery(format!("Receiver bind: {e}")))?;
        info!("Discovery listening on {group}:{port}");

        let send_socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| NetworkError::Discovery(format!("Sender bind: {e}")))?;
        send_socket
            .set_multicast_ttl_v4(1)
            .map_err(|e| NetworkError::Discovery(format!("Set multicast TTL: {e}")))?;

        // Broadcaster.
        let inner = Arc::clone(&self.inner);
        let mut shutdown_bcast = shutdown.resubscribe();
        tokio::spawn(async move {
            let target = (group, port);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let payload = inner.payload.lock().expect("payload lock poisoned").clone();
                        let Some(payload) = payload else { continue };
                        match send_socket.send_to(&payload, target).await {
                            Ok(_) => trace!("Advertisement sent"),
                            Err(e) => debug!("Advertisement send failed: {e}"),
                        }
                    }
                    _ = shutdown_bcast.recv() => {
                        debug!("Discovery broadcaster shutting down");
                        break;
                    }
                }
            }
        });

        // Receiver.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                tokio::select! {
                    result = recv_socket.recv_from(&mut buf) => {
                        match result {
                            Ok((len, _src)) => inner.handle_datagram(&buf[..len]),
                            Err(e) => warn!("Discovery recv error: {e}"),
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Discovery receiver shutting down");
                        break;
                    }
                }
            }
        });

        Ok(())
    }
}

/// Bind a UDP socket on the discovery port and join the multicast group.
///
/// Reuse-addr is set before the bind so several processes on one host can
/// all listen on the well-known port.
fn multicast_receiver_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            ip: "10.0.0.1".to_string(),
            port,
        }
    }

    #[test]
    fn test_advertisement_wire_fields() {
        let ad = Advertisement {
            id: PeerId::from_string("A"),
            ip: "10.0.0.1".to_string(),
            port: 5000,
        };
        let value: serde_json::Value = serde_json::from_str(&serde_json::to_string(&ad).unwrap()).unwrap();
        assert_eq!(value["id"], "A");
        assert_eq!(value["ip"], "10.0.0.1");
        assert_eq!(value["port"], 5000);
    }

    #[test]
    fn test_known_peers_distinct_ids() {
        let mut known = KnownPeers::new();
        for i in 0..5u16 {
            assert!(known.observe(PeerId::from_string(format!("peer-{i}")), endpoint(5000 + i)));
        }
        assert_eq!(known.len(), 5);
    }

    #[test]
    fn test_known_peers_readvertise_updates_silently() {
        let mut known = KnownPeers::new();
        assert!(known.observe(PeerId::from_string("A"), endpoint(100)));
        assert!(!known.observe(PeerId::from_string("A"), endpoint(200)));

        assert_eq!(known.len(), 1);
        assert_eq!(known.get(&PeerId::from_string("A")).unwrap().port, 200);
    }

    fn service_with_counter() -> (DiscoveryService, Arc<AtomicUsize>) {
        let service = DiscoveryService::new(DiscoveryConfig {
            group: crate::config::DISCOVERY_GROUP,
            port: 0,
            interval: Duration::from_secs(1),
            local_id: PeerId::from_string("self"),
        });
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        service.on_new_endpoint(Box::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        (service, count)
    }

    fn datagram(id: &str, port: u16) -> Vec<u8> {
        serde_json::to_vec(&Advertisement {
            id: PeerId::from_string(id),
            ip: "10.0.0.1".to_string(),
            port,
        })
        .unwrap()
    }

    #[test]
    fn test_callback_fires_once_per_id() {
        let (service, count) = service_with_counter();

        for i in 0..3 {
            service.inner.handle_datagram(&datagram(&format!("peer-{i}"), 5000));
        }
        // Re-advertise with changed endpoints: no additional callbacks.
        service.inner.handle_datagram(&datagram("peer-0", 6000));
        service.inner.handle_datagram(&datagram("peer-1", 6001));

        assert_eq!(count.load(Ordering::SeqCst), 3);
        let known = service.known_endpoints();
        assert_eq!(known.len(), 3);
        assert_eq!(known[&PeerId::from_string("peer-0")].port, 6000);
    }

    #[test]
    fn test_own_advertisement_ignored() {
        let (service, count) = service_with_counter();
        service.inner.handle_datagram(&datagram("self", 5000));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(service.known_endpoints().is_empty());
    }

    #[test]
    fn test_malformed_datagram_does_not_poison_state() {
        let (service, count) = service_with_counter();
        service.inner.handle_datagram(b"not json at all");
        service.inner.handle_datagram(b"{\"id\": 42}");
        service.inner.handle_datagram(&datagram("peer-0", 5000));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(service.known_endpoints().len(), 1);
    }

    #[tokio::test]
    async fn test_receiver_port_shared_across_sockets() {
        // Two listeners on the well-known port must coexist, one per
        // process on the same host.
        let first = match multicast_receiver_socket(crate::config::DISCOVERY_GROUP, 43317) {
            Ok(socket) => socket,
            // No multicast-capable interface here; nothing to assert.
            Err(_) => return,
        };
        let second = multicast_receiver_socket(crate::config::DISCOVERY_GROUP, 43317);
        assert!(second.is_ok());
        drop(first);
    }

    #[tokio::test]
    async fn test_advertisement_udp_loopback() {
        // The wire payload survives a real UDP hop.
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let ad = Advertisement {
            id: PeerId::from_string("loopback-peer"),
            ip: "127.0.0.1".to_string(),
            port: 4821,
        };
        socket.send_to(&serde_json::to_vec(&ad).unwrap(), addr).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, _) = socket.recv_from(&mut buf).await.unwrap();
        let received: Advertisement = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(received, ad);
    }
}
