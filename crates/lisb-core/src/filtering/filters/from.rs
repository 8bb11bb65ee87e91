//! Originator consistency

use crate::filtering::Filter;
use crate::envelope::Envelope;
use async_trait::async_trait;
use lisb_common::{FilterName, Result};
use tracing::info;

/// Flags messages whose `From` header disagrees with MAIL FROM
#[derive(Debug, Default)]
pub struct FromFilter;

#[async_trait]
impl Filter for FromFilter {
    fn name(&self) -> FilterName {
        FilterName::From
    }

    async fn check(&self, envelope: &Envelope) -> Result<bool> {
        let parsed_from = envelope.parsed_from();
        if parsed_from != Some(envelope.mail_from()) {
            info!(
                "Senders differ: '{}' in envelope vs. '{}' in message",
                envelope.mail_from(),
                parsed_from.unwrap_or_default()
            );
            return Ok(true);
        }
        Ok(false)
    }
}
