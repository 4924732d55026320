//! LanChat — serverless LAN chat transport and messaging core.
//!
//! This crate provides everything a LAN chat client needs below the UI:
//! peers find each other automatically, connect directly, and exchange
//! chat text with no central server involved.
//!
//! # Architecture
//!
//! - **Transport**: length-prefixed JSON frames over direct TCP
//!   connections between peers.
//! - **Discovery**: UDP multicast advertisements on the LAN for
//!   automatic peer discovery.
//! - **Bus**: typed event queue with explicit drains, so consumer
//!   callbacks run as a single logical sequence.
//! - **Engine**: orchestrates listener, discovery, pool and history
//!   behind one handle.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use lanchat::{Engine, NetworkConfig};
//! use lanchat::identity::NodeIdentity;
//!
//! # async fn example() {
//! let identity = NodeIdentity::generate("my-node");
//! let config = NetworkConfig::default();
//! let mut engine = Engine::new(identity, config, tokio::runtime::Handle::current());
//!
//! engine.start().await.unwrap();
//! // ... peers on the LAN are discovered and connected automatically ...
//! engine.stop().await;
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod history;
pub mod identity;
pub mod pool;
pub mod protocol;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use bus::{EventKind, MessageBus, NetEvent, Subscription};
pub use config::NetworkConfig;
pub use connection::{ConnectionState, PeerConnection};
pub use discovery::{Advertisement, DiscoveryService, Endpoint};
pub use engine::Engine;
pub use error::NetworkError;
pub use history::{ChatHistory, StoredMessage};
pub use identity::{NodeIdentity, PeerId};
pub use pool::ConnectionPool;
pub use protocol::{ChatMessage, Header, MessageTag, Packet};
