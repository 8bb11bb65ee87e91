//! Peer blacklist
//!
//! Two independent mechanisms decide whether a peer is blacklisted:
//!
//! - a static list of networks (Spamhaus DROP format), loaded once at startup
//! - a learned counter of spam verdicts per peer IP, fed by the filtering
//!   manager through [`BlacklistFilter::update`]
//!
//! Learned entries carry an expiry fixed at creation. Expired entries are
//! dropped when state is loaded; they are not re-checked per message.

use crate::envelope::Envelope;
use crate::filtering::state::StateMap;
use crate::filtering::{Filter, PersistedState};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ipnet::IpNet;
use lisb_common::{FilterName, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

/// Learned record for one peer IP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    /// Number of spam verdicts attributed to the peer
    pub detections: u32,
    /// When the entry is dropped at the next load
    pub expiry: DateTime<Utc>,
}

/// Blocks peers from listed networks or with too many spam verdicts
#[derive(Debug)]
pub struct BlacklistFilter {
    threshold: u32,
    ttl: Duration,
    ranges: Vec<IpNet>,
    entries: StateMap<BlacklistEntry>,
}

impl BlacklistFilter {
    /// Create a filter blocking peers with more than `threshold` detections
    pub fn new(threshold: u32, ttl_days: u32, ranges: Vec<IpNet>) -> Self {
        Self {
            threshold,
            ttl: Duration::days(i64::from(ttl_days)),
            ranges,
            entries: StateMap::new(),
        }
    }

    /// Record one spam verdict for `peer`.
    ///
    /// The expiry set when the entry is created is kept as is.
    pub fn update(&self, peer: IpAddr) {
        let detections = self.entries.with(|entries| {
            let entry = entries
                .entry(peer.to_string())
                .or_insert_with(|| BlacklistEntry {
                    detections: 0,
                    expiry: Utc::now() + self.ttl,
                });
            entry.detections = entry.detections.saturating_add(1);
            entry.detections
        });

        if detections == self.threshold.saturating_add(1) {
            info!(%peer, detections, "Peer is now black-listed");
        }
    }

    /// Learned record of `peer`, if any
    pub fn entry(&self, peer: IpAddr) -> Option<BlacklistEntry> {
        self.entries.get(&peer.to_string())
    }

    pub fn static_ranges(&self) -> &[IpNet] {
        &self.ranges
    }
}

#[async_trait]
impl Filter for BlacklistFilter {
    fn name(&self) -> FilterName {
        FilterName::BlackList
    }

    async fn check(&self, envelope: &Envelope) -> Result<bool> {
        let peer = envelope.peer();

        if let Some(range) = self.ranges.iter().find(|range| range.contains(&peer)) {
            info!("Sender IP {} belongs to a black-listed network {}", peer, range);
            return Ok(true);
        }

        match self.entry(peer) {
            Some(entry) if entry.detections > self.threshold => {
                info!("Sender IP {} has been previously black-listed", peer);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl PersistedState for BlacklistFilter {
    fn state_name(&self) -> FilterName {
        FilterName::BlackList
    }

    fn load(&self, state: Value) -> Result<()> {
        self.entries.load_value(state)?;

        let now = Utc::now();
        let purged = self.entries.with(|entries| {
            let before = entries.len();
            entries.retain(|_, entry| entry.expiry > now);
            before - entries.len()
        });
        if purged > 0 {
            info!("Purged {} expired blacklist entries", purged);
        }
        Ok(())
    }

    fn snapshot(&self) -> Value {
        self.entries.snapshot_value()
    }
}

/// Parse a Spamhaus DROP list (`<cidr> ; <sbl id>` per line)
pub fn parse_drop_list(content: &str) -> Vec<IpNet> {
    content
        .lines()
        .filter_map(|line| {
            let network = line.split(';').next().unwrap_or_default().trim();
            if network.is_empty() {
                return None;
            }
            match network.parse() {
                Ok(net) => Some(net),
                Err(e) => {
                    warn!("Skipping DROP list entry '{}': {}", network, e);
                    None
                }
            }
        })
        .collect()
}

/// Read a DROP list from disk; an unreadable file yields no ranges
pub fn load_drop_list(path: &Path) -> Vec<IpNet> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let ranges = parse_drop_list(&content);
            info!("Loaded {} black-listed networks from {}", ranges.len(), path.display());
            ranges
        }
        Err(e) => {
            warn!("Failed to read DROP list {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::tests::consistent_envelope;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_threshold_is_exclusive() {
        let filter = BlacklistFilter::new(2, 7, Vec::new());
        let envelope = consistent_envelope("198.51.100.9");
        let peer = envelope.peer();

        assert!(!filter.check(&envelope).await.unwrap());
        filter.update(peer);
        filter.update(peer);
        assert_eq!(filter.entry(peer).map(|e| e.detections), Some(2));
        assert!(!filter.check(&envelope).await.unwrap());

        filter.update(peer);
        assert_eq!(filter.entry(peer).map(|e| e.detections), Some(3));
        assert!(filter.check(&envelope).await.unwrap());
    }

    #[test]
    fn test_update_keeps_original_expiry() {
        let filter = BlacklistFilter::new(10, 7, Vec::new());
        let peer: IpAddr = "198.51.100.9".parse().unwrap();

        filter.update(peer);
        let first = filter.entry(peer).unwrap();
        filter.update(peer);
        let second = filter.entry(peer).unwrap();

        assert_eq!(first.expiry, second.expiry);
        assert!(first.expiry > Utc::now() + Duration::days(6));
    }

    #[tokio::test]
    async fn test_static_ranges_always_match() {
        let ranges = parse_drop_list("; Spamhaus DROP List\n192.0.2.0/24 ; SBL1\n\n");
        let filter = BlacklistFilter::new(10, 7, ranges);

        assert!(filter
            .check(&consistent_envelope("192.0.2.77"))
            .await
            .unwrap());
        assert!(!filter
            .check(&consistent_envelope("198.51.100.1"))
            .await
            .unwrap());
    }

    #[test]
    fn test_parse_drop_list() {
        let ranges = parse_drop_list(
            "; Last-Modified: Sat, 1 Jun 2024\n\
             1.10.16.0/20 ; SBL256894\n\
             2001:db8::/32 ; SBL1\n\
             not-a-network ; SBL2\n",
        );
        assert_eq!(
            ranges,
            vec![
                "1.10.16.0/20".parse::<IpNet>().unwrap(),
                "2001:db8::/32".parse::<IpNet>().unwrap()
            ]
        );
    }

    #[test]
    fn test_load_purges_expired_entries() {
        let filter = BlacklistFilter::new(2, 7, Vec::new());
        let past = Utc::now() - Duration::days(1);
        let future = Utc::now() + Duration::days(3);

        filter
            .load(json!({
                "10.0.0.1": {"detections": 9, "expiry": past},
                "10.0.0.2": {"detections": 4, "expiry": future},
            }))
            .unwrap();

        assert_eq!(filter.entry("10.0.0.1".parse().unwrap()), None);
        assert_eq!(
            filter.entry("10.0.0.2".parse().unwrap()),
            Some(BlacklistEntry {
                detections: 4,
                expiry: future,
            })
        );
    }

    #[test]
    fn test_missing_drop_list_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_drop_list(&dir.path().join("drop.txt")).is_empty());
    }
}
