//! DKIM stability

use crate::envelope::Envelope;
use crate::filtering::state::StateMap;
use crate::filtering::{Filter, PersistedState};
use async_trait::async_trait;
use lisb_common::{FilterName, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::btree_map::Entry;
use tracing::info;

/// Selector and signing domain first seen for a sender domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimRecord {
    /// Selector (`s=`)
    pub s: String,
    /// Signing domain (`d=`)
    pub d: String,
}

/// Flags sender domains whose DKIM selector or signing domain changes
#[derive(Debug, Default)]
pub struct DkimFilter {
    known: StateMap<DkimRecord>,
}

impl DkimFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Filter for DkimFilter {
    fn name(&self) -> FilterName {
        FilterName::Dkim
    }

    async fn check(&self, envelope: &Envelope) -> Result<bool> {
        let params = envelope.dkim_params();
        let (Some(s), Some(d)) = (params.get("s"), params.get("d")) else {
            return Ok(false);
        };
        let Some(domain) = envelope.sender_domain() else {
            return Ok(false);
        };

        let seen = DkimRecord {
            s: s.clone(),
            d: d.clone(),
        };

        Ok(self.known.with(|known| match known.entry(domain.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(seen);
                false
            }
            Entry::Occupied(slot) if *slot.get() == seen => false,
            Entry::Occupied(slot) => {
                let previous = slot.get();
                info!(
                    domain,
                    "DKIM params (s:{}; d:{}) changed from previous (s:{}; d:{})",
                    seen.s,
                    seen.d,
                    previous.s,
                    previous.d
                );
                true
            }
        }))
    }
}

impl PersistedState for DkimFilter {
    fn state_name(&self) -> FilterName {
        FilterName::Dkim
    }

    fn load(&self, state: Value) -> Result<()> {
        self.known.load_value(state)
    }

    fn snapshot(&self) -> Value {
        self.known.snapshot_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::tests::message;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn signed(from: &str, signature: Option<&str>) -> Envelope {
        let mut headers = vec![("From", from), ("To", "rcpt@dest.org")];
        if let Some(signature) = signature {
            headers.push(("DKIM-Signature", signature));
        }
        Envelope::new(
            "192.0.2.1".parse().unwrap(),
            from,
            vec!["rcpt@dest.org".to_string()],
            message(&headers, "body"),
        )
    }

    #[tokio::test]
    async fn test_first_sighting_is_recorded() {
        let filter = DkimFilter::new();
        let envelope = signed("a@shop.com", Some("v=1; d=shop.com; s=sel1; bh=x"));

        assert!(!filter.check(&envelope).await.unwrap());
        assert_eq!(
            filter.snapshot(),
            json!({"shop.com": {"s": "sel1", "d": "shop.com"}})
        );
    }

    #[tokio::test]
    async fn test_changed_selector_is_spam() {
        let filter = DkimFilter::new();
        filter
            .check(&signed("a@shop.com", Some("d=shop.com; s=sel1")))
            .await
            .unwrap();

        assert!(!filter
            .check(&signed("b@shop.com", Some("d=shop.com; s=sel1")))
            .await
            .unwrap());
        assert!(filter
            .check(&signed("a@shop.com", Some("d=shop.com; s=sel2")))
            .await
            .unwrap());
        assert!(filter
            .check(&signed("a@shop.com", Some("d=phish.com; s=sel1")))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unsigned_or_partial_signature_is_ignored() {
        let filter = DkimFilter::new();
        assert!(!filter.check(&signed("a@shop.com", None)).await.unwrap());
        assert!(!filter
            .check(&signed("a@shop.com", Some("d=shop.com")))
            .await
            .unwrap());
        assert_eq!(filter.snapshot(), json!({}));
    }

    #[tokio::test]
    async fn test_loaded_state_is_used() {
        let filter = DkimFilter::new();
        filter
            .load(json!({"shop.com": {"s": "old", "d": "shop.com"}}))
            .unwrap();

        assert!(filter
            .check(&signed("a@shop.com", Some("d=shop.com; s=new")))
            .await
            .unwrap());
    }
}
