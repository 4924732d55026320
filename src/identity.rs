//! Process identity — unique peer identification and persistence.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// A unique identifier for a chat peer.
///
/// Chosen once at process start and used as the dedup/routing key in the
/// discovery map and the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID (UUID v4).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The full identity of a node on the LAN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique peer identifier.
    pub peer_id: PeerId,
    /// Human-readable display name (e.g. hostname or user-chosen).
    pub display_name: String,
    /// Chat rooms this node participates in. Advertised in the handshake
    /// reply; nothing interprets them yet.
    pub room_ids: Vec<String>,
}

impl NodeIdentity {
    /// Create a new identity with a fresh PeerId.
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self {
            peer_id: PeerId::generate(),
            display_name: display_name.into(),
            room_ids: Vec::new(),
        }
    }

    /// Save the identity to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize identity: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write identity file: {e}"))
    }

    /// Load an identity from a JSON file, or generate a new one if the file
    /// does not exist.
    pub fn load_or_generate(path: &Path, display_name: impl Into<String>) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NodeIdentity>(&data) {
                    Ok(identity) => return identity,
                    Err(e) => {
                        tracing::warn!("Corrupt identity file, generating new: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read identity file, generating new: {e}");
                }
            }
        }

        let identity = Self::generate(display_name);
        if let Err(e) = identity.save_to_file(path) {
            tracing::warn!("Failed to persist new identity: {e}");
        }
        identity
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
