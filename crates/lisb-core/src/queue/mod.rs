//! Delivery of accepted messages to the upstream relay

mod forwarder;
mod relay;

pub use forwarder::{ForwardJob, ForwardQueue, ForwarderSettings, MailForwarder};
pub use relay::{Relay, SmtpRelay};
