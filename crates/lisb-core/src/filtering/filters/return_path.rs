//! Return-Path plausibility

use crate::filtering::Filter;
use crate::envelope::Envelope;
use async_trait::async_trait;
use lisb_common::{FilterName, Result};
use tracing::info;

/// Flags messages that bounce to someone who is neither sender nor recipient
#[derive(Debug, Default)]
pub struct ReturnPathFilter;

#[async_trait]
impl Filter for ReturnPathFilter {
    fn name(&self) -> FilterName {
        FilterName::ReturnPath
    }

    async fn check(&self, envelope: &Envelope) -> Result<bool> {
        let Some(return_path) = envelope.parsed_return_path() else {
            return Ok(false);
        };

        let is_spam = return_path != envelope.mail_from()
            && !envelope.rcpt_tos().iter().any(|rcpt| rcpt == return_path);
        if is_spam {
            info!(
                "Return-Path '{}' is neither sender '{}' nor a recipient {:?}",
                return_path,
                envelope.mail_from(),
                envelope.rcpt_tos()
            );
        }
        Ok(is_spam)
    }
}
