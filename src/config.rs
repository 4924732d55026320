//! Network configuration for a lanchat node.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Well-known multicast group used for LAN discovery.
pub const DISCOVERY_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);

/// Well-known UDP port for discovery advertisements.
pub const DISCOVERY_PORT: u16 = 9078;

/// Configuration for the lanchat networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP port to listen on for incoming peer connections. 0 picks an
    /// ephemeral port; the bound port is what gets advertised.
    pub listen_port: u16,

    /// Whether LAN discovery (UDP multicast) is enabled.
    pub discovery_enabled: bool,

    /// Multicast group advertisements are sent to.
    pub discovery_group: Ipv4Addr,

    /// UDP port used for discovery advertisements.
    pub discovery_port: u16,

    /// Interval between advertisement broadcasts.
    #[serde(with = "duration_serde")]
    pub advertise_interval: Duration,

    /// Timeout for TCP connect and each handshake read.
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            discovery_enabled: true,
            discovery_group: DISCOVERY_GROUP,
            discovery_port: DISCOVERY_PORT,
            advertise_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl NetworkConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
