//! X-header stability

use crate::envelope::Envelope;
use crate::filtering::state::StateMap;
use crate::filtering::{Filter, PersistedState};
use async_trait::async_trait;
use lisb_common::{FilterName, Result};
use serde_json::Value;
use std::collections::btree_map::Entry;
use std::collections::BTreeSet;
use tracing::info;

/// Flags sender domains whose set of `X-` header names changes
#[derive(Debug, Default)]
pub struct XHeaderFilter {
    known: StateMap<BTreeSet<String>>,
}

impl XHeaderFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Filter for XHeaderFilter {
    fn name(&self) -> FilterName {
        FilterName::XHeaders
    }

    async fn check(&self, envelope: &Envelope) -> Result<bool> {
        let seen = envelope.x_headers();
        if seen.is_empty() {
            return Ok(false);
        }
        let Some(domain) = envelope.sender_domain() else {
            return Ok(false);
        };

        Ok(self.known.with(|known| match known.entry(domain.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(seen.clone());
                false
            }
            Entry::Occupied(slot) if slot.get() == seen => false,
            Entry::Occupied(slot) => {
                info!(
                    domain,
                    "X-headers {:?} differ from previously seen {:?}",
                    seen,
                    slot.get()
                );
                true
            }
        }))
    }
}

impl PersistedState for XHeaderFilter {
    fn state_name(&self) -> FilterName {
        FilterName::XHeaders
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

    fn with_x_headers(names: &[&str]) -> Envelope {
        let mut headers = vec![("From", "news@list.org"), ("To", "me@home.net")];
        headers.extend(names.iter().map(|name| (*name, "1")));
        Envelope::new(
            "192.0.2.1".parse().unwrap(),
            "news@list.org",
            vec!["me@home.net".to_string()],
            message(&headers, "body"),
        )
    }

    #[tokio::test]
    async fn test_same_header_set_is_clean() {
        let filter = XHeaderFilter::new();
        assert!(!filter
            .check(&with_x_headers(&["X-Mailer", "X-List"]))
            .await
            .unwrap());
        assert!(!filter
            .check(&with_x_headers(&["X-List", "X-Mailer"]))
            .await
            .unwrap());
        assert_eq!(
            filter.snapshot(),
            json!({"list.org": ["X-List", "X-Mailer"]})
        );
    }

    #[tokio::test]
    async fn test_changed_header_set_is_spam() {
        let filter = XHeaderFilter::new();
        filter.check(&with_x_headers(&["X-Mailer"])).await.unwrap();
        assert!(filter
            .check(&with_x_headers(&["X-Mailer", "X-Bulk"]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_message_without_x_headers_is_ignored() {
        let filter = XHeaderFilter::new();
        filter.check(&with_x_headers(&["X-Mailer"])).await.unwrap();
        assert!(!filter.check(&with_x_headers(&[])).await.unwrap());
    }
}
