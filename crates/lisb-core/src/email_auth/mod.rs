//! Email authentication lookups
//!
//! Resolves the sender authorization data published in DNS.

pub mod spf;

pub use spf::{DnsSpfResolver, SpfDns, SpfResolver, TrustDns};
