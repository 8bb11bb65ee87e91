//! Recipient consistency

use crate::filtering::Filter;
use crate::envelope::Envelope;
use async_trait::async_trait;
use lisb_common::{FilterName, Result};
use std::collections::BTreeSet;
use tracing::info;

/// Flags messages whose `To` header names other recipients than RCPT TO
#[derive(Debug, Default)]
pub struct ToFilter;

#[async_trait]
impl Filter for ToFilter {
    fn name(&self) -> FilterName {
        FilterName::To
    }

    async fn check(&self, envelope: &Envelope) -> Result<bool> {
        let envelope_tos: BTreeSet<&str> =
            envelope.rcpt_tos().iter().map(String::as_str).collect();
        let message_tos: BTreeSet<&str> = envelope
            .parsed_to()
            .unwrap_or_default()
            .iter()
            .map(String::as_str)
            .collect();

        if envelope_tos != message_tos {
            info!(
                "Recipients differ: {:?} in envelope vs. {:?} in message",
                envelope_tos, message_tos
            );
            return Ok(true);
        }
        Ok(false)
    }
}
