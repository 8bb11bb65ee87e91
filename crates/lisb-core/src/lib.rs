//! LiSB Core - filtering gateway engine
//!
//! This crate receives mail over SMTP, decides ham or spam through the
//! filter chain, forwards ham to the upstream relay and persists what the
//! filters learn between restarts.

pub mod email_auth;
pub mod envelope;
pub mod filtering;
pub mod queue;
pub mod shutdown;
pub mod smtp;
pub mod storage;

pub use email_auth::{DnsSpfResolver, SpfResolver};
pub use envelope::Envelope;
pub use filtering::{Filter, FilterChain, FilteringManager, PersistedState};
pub use queue::{ForwardJob, ForwardQueue, ForwarderSettings, MailForwarder, Relay, SmtpRelay};
pub use shutdown::Shutdown;
pub use smtp::SmtpServer;
pub use storage::StorageManager;
