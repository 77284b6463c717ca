//! Wire records consumed from the transport.
//!
//! These schemas are stable: the collectors publish them as JSON and the
//! pipeline decodes them with serde. Malformed records are dropped and
//! counted by the consuming component, never fatal.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// BGP message kinds carried by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BgpMessageKind {
    Update,
    Withdraw,
    Notification,
    Keepalive,
}

/// One decoded BGP update, as published by the BMP collector.
///
/// Timestamps are epoch milliseconds and non-decreasing per peer. The peer
/// id may carry the emitting fabric device as a `device:session` prefix;
/// [`BgpUpdate::device`] resolves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BgpUpdate {
    pub ts: i64,
    pub peer: String,
    #[serde(rename = "type")]
    pub kind: BgpMessageKind,
    #[serde(default)]
    pub announce: Vec<String>,
    #[serde(default)]
    pub withdraw: Vec<String>,
    #[serde(default)]
    pub as_path: Vec<u32>,
    #[serde(default)]
    pub next_hop: Option<String>,
}

impl BgpUpdate {
    /// Fabric device this update is attributed to.
    pub fn device(&self) -> &str {
        self.peer.split(':').next().unwrap_or(&self.peer)
    }

    /// Structural validity: positive timestamp, non-empty peer, and
    /// disjoint announce/withdraw prefix sets within the one update.
    pub fn is_well_formed(&self) -> bool {
        if self.ts <= 0 || self.peer.is_empty() {
            return false;
        }
        if self.announce.is_empty() || self.withdraw.is_empty() {
            return true;
        }
        let announced: HashSet<&str> = self.announce.iter().map(String::as_str).collect();
        !self.withdraw.iter().any(|p| announced.contains(p.as_str()))
    }
}

/// One SNMP poll result for a device: a bag of named metric readings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpSample {
    pub ts: i64,
    pub device: String,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl SnmpSample {
    pub fn is_well_formed(&self) -> bool {
        self.ts > 0 && !self.device.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_resolution() {
        let u = BgpUpdate {
            ts: 1,
            peer: "spine-01:10.0.0.7".to_string(),
            kind: BgpMessageKind::Update,
            announce: vec![],
            withdraw: vec![],
            as_path: vec![],
            next_hop: None,
        };
        assert_eq!(u.device(), "spine-01");

        let bare = BgpUpdate { peer: "tor-03".to_string(), ..u };
        assert_eq!(bare.device(), "tor-03");
    }

    #[test]
    fn test_overlapping_prefix_sets_rejected() {
        let u = BgpUpdate {
            ts: 1_700_000_000_000,
            peer: "spine-01".to_string(),
            kind: BgpMessageKind::Update,
            announce: vec!["10.1.0.0/24".to_string()],
            withdraw: vec!["10.1.0.0/24".to_string()],
            as_path: vec![65001, 65002],
            next_hop: None,
        };
        assert!(!u.is_well_formed());
    }

    #[test]
    fn test_record_json_decoding() {
        let raw = r#"{"ts": 1700000000000, "peer": "spine-01:p1", "type": "WITHDRAW",
                      "withdraw": ["10.2.0.0/24"], "as_path": [65001]}"#;
        let u: BgpUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(u.kind, BgpMessageKind::Withdraw);
        assert!(u.announce.is_empty());
        assert!(u.is_well_formed());

        let raw = r#"{"ts": 1700000000000, "device": "spine-01",
                      "metrics": {"cpu_util": 31.5, "temperature_c": 42.0}}"#;
        let s: SnmpSample = serde_json::from_str(raw).unwrap();
        assert_eq!(s.metrics.len(), 2);
        assert!(s.is_well_formed());
    }
}
