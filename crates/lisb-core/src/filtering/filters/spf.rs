//! SPF membership

use crate::email_auth::SpfResolver;
use crate::envelope::Envelope;
use crate::filtering::state::StateMap;
use crate::filtering::{Filter, PersistedState};
use async_trait::async_trait;
use ipnet::IpNet;
use lisb_common::{FilterName, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Flags peers outside the networks the sender domain authorizes.
///
/// The authorized ranges of a domain are resolved on its first sighting and
/// cached from then on; the peer is checked against them on the same call.
pub struct SpfFilter {
    resolver: Arc<dyn SpfResolver>,
    known: StateMap<Vec<IpNet>>,
}

impl SpfFilter {
    pub fn new(resolver: Arc<dyn SpfResolver>) -> Self {
        Self {
            resolver,
            known: StateMap::new(),
        }
    }
}

#[async_trait]
impl Filter for SpfFilter {
    fn name(&self) -> FilterName {
        FilterName::Spf
    }

    async fn check(&self, envelope: &Envelope) -> Result<bool> {
        let Some(domain) = envelope.sender_domain() else {
            return Ok(false);
        };

        let ranges = match self.known.get(domain) {
            Some(ranges) => ranges,
            None => {
                let ranges = self.resolver.resolve_ranges(domain).await?;
                debug!(domain, "Cached {} authorized SPF ranges", ranges.len());
                self.known.insert(domain, ranges.clone());
                ranges
            }
        };

        let peer = envelope.peer();
        if ranges.iter().any(|range| range.contains(&peer)) {
            return Ok(false);
        }

        info!("Sender IP '{}' does not belong to the sender domain '{}'", peer, domain);
        Ok(true)
    }
}

impl PersistedState for SpfFilter {
    fn state_name(&self) -> FilterName {
        FilterName::Spf
    }

    fn load(&self, state: Value) -> Result<()> {
        self.known.load_value(state)
    }

    fn snapshot(&self) -> Value {
        self.known.snapshot_value()
    }
}
