//! SPF (Sender Policy Framework) range resolution
//!
//! Walks the SPF policy of a domain (RFC 7208) and collects every network it
//! authorizes, following `include:` and `redirect=` recursively. The result is
//! cached by the SPF filter, so evaluation against a peer happens locally.

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use lisb_common::{Error, Result};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// Source of the networks a domain authorizes to send mail
#[async_trait]
pub trait SpfResolver: Send + Sync {
    /// Every network authorized by `domain`'s SPF policy
    async fn resolve_ranges(&self, domain: &str) -> Result<Vec<IpNet>>;
}

/// SPF mechanism types
#[derive(Debug, Clone, PartialEq)]
enum SpfMechanism {
    All,
    Include(String),
    A(Option<String>),
    Mx(Option<String>),
    Ip4(Ipv4Net),
    Ip6(Ipv6Net),
    Other,
}

/// SPF qualifier (prefix)
#[derive(Debug, Clone, Copy, PartialEq)]
enum SpfQualifier {
    Pass,     // + (default)
    Fail,     // -
    SoftFail, // ~
    Neutral,  // ?
}

/// Parsed SPF directive (qualifier + mechanism)
#[derive(Debug, Clone, PartialEq)]
struct SpfDirective {
    qualifier: SpfQualifier,
    mechanism: SpfMechanism,
}

/// Parsed SPF record
#[derive(Debug, Default, PartialEq)]
struct SpfRecord {
    directives: Vec<SpfDirective>,
    redirect: Option<String>,
}

/// DNS queries an SPF walk needs
#[async_trait]
pub trait SpfDns: Send + Sync {
    /// The `v=spf1` TXT record of `domain`, if it publishes one
    async fn spf_record(&self, domain: &str) -> Result<Option<String>>;

    /// Host routes for every A/AAAA record of `host`
    async fn host_ranges(&self, host: &str) -> Vec<IpNet>;

    /// Exchange hosts of `domain`'s MX records
    async fn mx_hosts(&self, domain: &str) -> Vec<String>;
}

/// [`SpfDns`] over trust-dns, every lookup bounded by a timeout
pub struct TrustDns {
    resolver: TokioAsyncResolver,
    lookup_timeout: Duration,
}

impl TrustDns {
    pub fn new(resolver: TokioAsyncResolver, lookup_timeout: Duration) -> Self {
        Self {
            resolver,
            lookup_timeout,
        }
    }
}

#[async_trait]
impl SpfDns for TrustDns {
    async fn spf_record(&self, domain: &str) -> Result<Option<String>> {
        let lookup = match tokio::time::timeout(
            self.lookup_timeout,
            self.resolver.txt_lookup(domain),
        )
        .await
        {
            Ok(Ok(lookup)) => lookup,
            Ok(Err(e)) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                return Ok(None)
            }
            Ok(Err(e)) => return Err(Error::Dns(format!("TXT lookup for {}: {}", domain, e))),
            Err(_) => return Err(Error::Dns(format!("TXT lookup for {} timed out", domain))),
        };

        for record in lookup.iter() {
            let txt = record
                .txt_data()
                .iter()
                .map(|d| String::from_utf8_lossy(d))
                .collect::<String>();

            if txt.starts_with("v=spf1 ") || txt == "v=spf1" {
                return Ok(Some(txt));
            }
        }

        Ok(None)
    }

    async fn host_ranges(&self, host: &str) -> Vec<IpNet> {
        let mut ranges = Vec::new();

        if let Ok(Ok(lookup)) =
            tokio::time::timeout(self.lookup_timeout, self.resolver.ipv4_lookup(host)).await
        {
            for record in lookup.iter() {
                let ip: std::net::Ipv4Addr = (*record).into();
                ranges.push(IpNet::from(IpAddr::V4(ip)));
            }
        }

        if let Ok(Ok(lookup)) =
            tokio::time::timeout(self.lookup_timeout, self.resolver.ipv6_lookup(host)).await
        {
            for record in lookup.iter() {
                let ip: std::net::Ipv6Addr = (*record).into();
                ranges.push(IpNet::from(IpAddr::V6(ip)));
            }
        }

        ranges
    }

    async fn mx_hosts(&self, domain: &str) -> Vec<String> {
        match tokio::time::timeout(self.lookup_timeout, self.resolver.mx_lookup(domain)).await {
            Ok(Ok(lookup)) => lookup
                .iter()
                .map(|mx| mx.exchange().to_string())
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Resolver walking SPF policies over an [`SpfDns`] source.
///
/// Mechanisms that query DNS (`include`, `a`, `mx`, `redirect`) share one
/// budget per resolution; exceeding it fails the whole walk (RFC 7208 §4.6.4).
pub struct DnsSpfResolver {
    dns: Box<dyn SpfDns>,
    max_dns_lookups: usize,
}

impl DnsSpfResolver {
    /// Create a resolver from the system DNS configuration, every lookup
    /// bounded by `lookup_timeout`
    pub fn new(lookup_timeout: Duration) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = lookup_timeout;
        opts.attempts = 1;

        Self::with_resolver(
            TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
            lookup_timeout,
        )
    }

    /// Create a resolver with a custom DNS client
    pub fn with_resolver(resolver: TokioAsyncResolver, lookup_timeout: Duration) -> Self {
        Self::with_dns(TrustDns::new(resolver, lookup_timeout))
    }

    /// Create a resolver over any DNS source
    pub fn with_dns(dns: impl SpfDns + 'static) -> Self {
        Self {
            dns: Box::new(dns),
            max_dns_lookups: 10, // RFC 7208 limit
        }
    }

    /// Charge one DNS-querying mechanism against the walk's budget
    fn spend(&self, lookups: &mut usize, target: &str) -> Result<()> {
        *lookups += 1;
        if *lookups > self.max_dns_lookups {
            warn!("SPF lookup limit reached at {}", target);
            return Err(Error::Dns(format!(
                "SPF lookup limit of {} exceeded at {}",
                self.max_dns_lookups, target
            )));
        }
        Ok(())
    }

    /// Recursive range collection sharing one lookup budget
    fn collect_ranges<'a>(
        &'a self,
        domain: &'a str,
        depth: usize,
        lookups: &'a mut usize,
        ranges: &'a mut Vec<IpNet>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let record = match self.dns.spf_record(domain).await? {
                Some(record) => record,
                None if depth == 0 => {
                    return Err(Error::Dns(format!("No SPF record for {}", domain)));
                }
                None => {
                    debug!("Included domain {} has no SPF record", domain);
                    return Ok(());
                }
            };

            debug!("Found SPF record for {}: {}", domain, record);
            let record = parse_spf_record(&record)?;

            for directive in record.directives {
                if directive.qualifier != SpfQualifier::Pass {
                    continue;
                }

                match directive.mechanism {
                    SpfMechanism::Ip4(net) => ranges.push(IpNet::V4(net)),
                    SpfMechanism::Ip6(net) => ranges.push(IpNet::V6(net)),
                    SpfMechanism::Include(included) => {
                        self.spend(lookups, &included)?;
                        self.collect_ranges(&included, depth + 1, lookups, ranges)
                            .await?
                    }
                    SpfMechanism::A(target) => {
                        let target = target.as_deref().unwrap_or(domain);
                        self.spend(lookups, target)?;
                        ranges.extend(self.dns.host_ranges(target).await);
                    }
                    SpfMechanism::Mx(target) => {
                        let target = target.as_deref().unwrap_or(domain);
                        self.spend(lookups, target)?;
                        let exchanges = self.dns.mx_hosts(target).await;
                        for exchange in exchanges.iter().take(self.max_dns_lookups) {
                            ranges.extend(self.dns.host_ranges(exchange).await);
                        }
                    }
                    SpfMechanism::All | SpfMechanism::Other => {}
                }
            }

            if let Some(redirect) = record.redirect {
                self.spend(lookups, &redirect)?;
                self.collect_ranges(&redirect, depth + 1, lookups, ranges)
                    .await?;
            }

            Ok(())
        })
    }
}

#[async_trait]
impl SpfResolver for DnsSpfResolver {
    async fn resolve_ranges(&self, domain: &str) -> Result<Vec<IpNet>> {
        let mut ranges = Vec::new();
        let mut lookups = 0;
        self.collect_ranges(domain, 0, &mut lookups, &mut ranges)
            .await?;
        ranges.sort();
        ranges.dedup();
        Ok(ranges)
    }
}

/// Parse SPF record into directives
fn parse_spf_record(record: &str) -> Result<SpfRecord> {
    let terms = record
        .strip_prefix("v=spf1")
        .ok_or_else(|| Error::Dns("Invalid SPF record: missing v=spf1".to_string()))?
        .trim();

    let mut parsed = SpfRecord::default();

    for term in terms.split_whitespace() {
        if let Some((name, value)) = term.split_once('=') {
            if name.eq_ignore_ascii_case("redirect") {
                parsed.redirect = Some(value.to_string());
            }
            continue;
        }

        let (qualifier, mechanism) = match term.chars().next() {
            Some('+') => (SpfQualifier::Pass, &term[1..]),
            Some('-') => (SpfQualifier::Fail, &term[1..]),
            Some('~') => (SpfQualifier::SoftFail, &term[1..]),
            Some('?') => (SpfQualifier::Neutral, &term[1..]),
            _ => (SpfQualifier::Pass, term),
        };

        parsed.directives.push(SpfDirective {
            qualifier,
            mechanism: parse_mechanism(mechanism)?,
        });
    }

    Ok(parsed)
}

/// Parse a single SPF mechanism
fn parse_mechanism(s: &str) -> Result<SpfMechanism> {
    let invalid = |e: ipnet::AddrParseError| Error::Dns(format!("Invalid network {}: {}", s, e));

    if s == "all" {
        return Ok(SpfMechanism::All);
    }

    if s == "a" {
        return Ok(SpfMechanism::A(None));
    }

    if let Some(domain) = s.strip_prefix("a:") {
        return Ok(SpfMechanism::A(Some(domain.to_string())));
    }

    if s == "mx" {
        return Ok(SpfMechanism::Mx(None));
    }

    if let Some(domain) = s.strip_prefix("mx:") {
        return Ok(SpfMechanism::Mx(Some(domain.to_string())));
    }

    if let Some(network) = s.strip_prefix("ip4:") {
        let net = if network.contains('/') {
            network.parse().map_err(invalid)?
        } else {
            format!("{}/32", network).parse().map_err(invalid)?
        };
        return Ok(SpfMechanism::Ip4(net));
    }

    if let Some(network) = s.strip_prefix("ip6:") {
        let net = if network.contains('/') {
            network.parse().map_err(invalid)?
        } else {
            format!("{}/128", network).parse().map_err(invalid)?
        };
        return Ok(SpfMechanism::Ip6(net));
    }

    if let Some(domain) = s.strip_prefix("include:") {
        return Ok(SpfMechanism::Include(domain.to_string()));
    }

    // ptr and exists never widen the authorized ranges
    Ok(SpfMechanism::Other)
}
