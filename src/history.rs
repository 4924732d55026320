//! Per-peer chat history — process-lifetime append/query store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// One stored chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Known peer metadata recorded when a handshake completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: String,
    pub display_name: String,
}

/// In-memory chat history keyed by peer id. Not persisted across restarts.
#[derive(Debug, Default)]
pub struct ChatHistory {
    messages: HashMap<String, Vec<StoredMessage>>,
    peers: HashMap<String, PeerRecord>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to a peer's log.
    pub fn append(&mut self, peer_id: &str, text: impl Into<String>) {
        self.messages.entry(peer_id.to_string()).or_default().push(StoredMessage {
            text: text.into(),
            timestamp: Utc::now(),
        });
    }

    /// The last `n` messages for a peer, oldest first. Empty for an
    /// unknown peer.
    pub fn last_n(&self, peer_id: &str, n: usize) -> Vec<StoredMessage> {
        match self.messages.get(peer_id) {
            Some(log) => {
                let start = log.len().saturating_sub(n);
                log[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Record a peer we have spoken to.
    pub fn add_peer(&mut self, id: impl Into<String>, display_name: impl Into<String>) {
        let id = id.into();
        self.peers.insert(
            id.clone(),
            PeerRecord {
                id,
                display_name: display_name.into(),
            },
        );
    }

    /// Ids of every recorded peer.
    pub fn known_peers(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub fn peer(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.get(id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
