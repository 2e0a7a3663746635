//! Session-wide mutable configuration refined by relay pushes.
//!
//! Both the ICE server list and the adaptive transfer settings are seeded
//! with static defaults and patched by server pushes as they arrive. Invalid
//! entries and out-of-range values are dropped; a partial update never
//! resets the fields it does not mention.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Default STUN servers used before the relay pushes its own list.
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// One STUN/TURN endpoint description, as pushed by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceServerDescriptor {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerDescriptor {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }

    /// A descriptor is usable if it names at least one non-empty endpoint.
    pub fn is_valid(&self) -> bool {
        !self.urls.is_empty() && self.urls.iter().all(|u| !u.trim().is_empty())
    }

    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// The active, ordered ICE server list.
///
/// May be replaced wholesale (`turn-servers` push) or patched at one index
/// (`turn-server-switch` push). Malformed entries are dropped silently and
/// never shrink unrelated valid entries.
#[derive(Debug, Clone)]
pub struct IceServerSet {
    servers: Vec<IceServerDescriptor>,
}

impl Default for IceServerSet {
    fn default() -> Self {
        Self {
            servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|u| IceServerDescriptor::stun(u))
                .collect(),
        }
    }
}

impl IceServerSet {
    pub fn servers(&self) -> &[IceServerDescriptor] {
        &self.servers
    }

    pub fn to_rtc(&self) -> Vec<RTCIceServer> {
        self.servers.iter().map(IceServerDescriptor::to_rtc).collect()
    }

    /// Replace the whole list, keeping only valid entries. An all-invalid
    /// push leaves the previous list untouched.
    pub fn replace_all(&mut self, incoming: Vec<IceServerDescriptor>) {
        let valid: Vec<_> = incoming
            .into_iter()
            .filter(|s| {
                if s.is_valid() {
                    true
                } else {
                    warn!(?s, "dropping malformed ice server entry");
                    false
                }
            })
            .collect();
        if valid.is_empty() {
            warn!("turn-servers push contained no valid entries, keeping current list");
            return;
        }
        debug!(count = valid.len(), "replaced ice server list");
        self.servers = valid;
    }

    /// Patch one index with a new server. Out-of-bounds indexes append
    /// instead, so a switch push is never lost to a list-length race.
    pub fn patch(&mut self, index: usize, server: IceServerDescriptor) {
        if !server.is_valid() {
            warn!(index, "dropping malformed ice server patch");
            return;
        }
        if index < self.servers.len() {
            self.servers[index] = server;
        } else {
            self.servers.push(server);
        }
    }
}

/// Bounds for relay-pushed transfer tuning. Values outside these ranges are
/// discarded and the previous value retained.
pub const CHUNK_SIZE_MIN: usize = 16 * 1024;
pub const CHUNK_SIZE_MAX: usize = 512 * 1024;
pub const BUFFER_HIGH_WATER_MIN: usize = 64 * 1024;
pub const BUFFER_HIGH_WATER_MAX: usize = 8 * 1024 * 1024;
pub const INTER_CHUNK_DELAY_MAX_MS: u64 = 1000;

/// Chunking and flow-control tuning, adjustable mid-session by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveTransferSettings {
    /// Bytes per payload frame.
    pub chunk_size: usize,
    /// Pause sending while `buffered_amount` exceeds this.
    pub buffer_high_water: usize,
    /// Pacing delay between chunks, for relayed (TURN) paths.
    pub inter_chunk_delay: Duration,
}

impl Default for AdaptiveTransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            buffer_high_water: 1024 * 1024,
            inter_chunk_delay: Duration::from_millis(1),
        }
    }
}

/// Partial update pushed by the relay; any field may arrive independently.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveSettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl AdaptiveTransferSettings {
    /// Merge a partial update. Out-of-range fields are discarded one by one;
    /// unspecified fields keep their current value.
    pub fn apply(&mut self, update: &AdaptiveSettingsUpdate) {
        if let Some(v) = update.chunk_size {
            let v = v as usize;
            if (CHUNK_SIZE_MIN..=CHUNK_SIZE_MAX).contains(&v) {
                self.chunk_size = v;
            } else {
                warn!(chunk_size = v, "ignoring out-of-range chunk size update");
            }
        }
        if let Some(v) = update.buffer_size {
            let v = v as usize;
            if (BUFFER_HIGH_WATER_MIN..=BUFFER_HIGH_WATER_MAX).contains(&v) {
                self.buffer_high_water = v;
            } else {
                warn!(buffer_size = v, "ignoring out-of-range buffer size update");
            }
        }
        if let Some(v) = update.delay {
            if v <= INTER_CHUNK_DELAY_MAX_MS {
                self.inter_chunk_delay = Duration::from_millis(v);
            } else {
                warn!(delay_ms = v, "ignoring out-of-range inter-chunk delay update");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_update_keeps_unspecified_fields() {
        let mut settings = AdaptiveTransferSettings::default();
        settings.apply(&AdaptiveSettingsUpdate {
            buffer_size: Some(2_097_152),
            delay: Some(5),
            ..Default::default()
        });
        settings.apply(&AdaptiveSettingsUpdate {
            chunk_size: Some(32_768),
            ..Default::default()
        });

        assert_eq!(settings.chunk_size, 32_768);
        assert_eq!(settings.buffer_high_water, 2_097_152);
        assert_eq!(settings.inter_chunk_delay, Duration::from_millis(5));
    }

    #[test]
    fn out_of_range_update_is_discarded() {
        let mut settings = AdaptiveTransferSettings::default();
        let before = settings;
        settings.apply(&AdaptiveSettingsUpdate {
            chunk_size: Some(1), // below 16 KiB floor
            buffer_size: Some(u64::MAX),
            delay: Some(30_000),
        });
        assert_eq!(settings, before);
    }

    #[test]
    fn malformed_server_entries_are_dropped() {
        let mut set = IceServerSet::default();
        let valid = IceServerDescriptor::stun("stun:relay.example.org:3478");
        set.replace_all(vec![
            IceServerDescriptor {
                urls: vec![],
                username: None,
                credential: None,
            },
            valid.clone(),
        ]);
        assert_eq!(set.servers(), &[valid]);
    }

    #[test]
    fn all_invalid_replace_keeps_previous_list() {
        let mut set = IceServerSet::default();
        let before = set.servers().to_vec();
        set.replace_all(vec![IceServerDescriptor {
            urls: vec!["".into()],
            username: None,
            credential: None,
        }]);
        assert_eq!(set.servers(), &before[..]);
    }

    #[test]
    fn patch_at_index_and_out_of_bounds() {
        let mut set = IceServerSet::default();
        let len = set.servers().len();
        let turn = IceServerDescriptor {
            urls: vec!["turn:turn.example.org:3478".into()],
            username: Some("user".into()),
            credential: Some("pass".into()),
        };
        set.patch(0, turn.clone());
        assert_eq!(set.servers()[0], turn);

        set.patch(99, turn.clone());
        assert_eq!(set.servers().len(), len + 1);
        assert_eq!(set.servers().last(), Some(&turn));
    }
}
