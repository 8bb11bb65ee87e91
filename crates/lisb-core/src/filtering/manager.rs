//! Filtering manager
//!
//! The single decision authority. For each envelope it:
//!
//! 1. lets exempt traffic through without running any filter
//! 2. evaluates the chain, either in order (stopping at the first positive)
//!    or racing every filter concurrently under the time budget
//! 3. feeds every spam verdict back to the blacklist, exactly once
//!
//! A filter that fails or panics counts as clean, and racing evaluation
//! fails open when the budget runs out.

use super::{Filter, FilterChain};
use crate::envelope::Envelope;
use lisb_common::config::FilteringConfig;
use lisb_common::{FilterName, Verdict};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Traffic that bypasses filtering
#[derive(Debug, Default, Clone)]
struct Exemptions {
    ip_addresses: HashSet<IpAddr>,
    email_addresses: HashSet<String>,
    email_domains: HashSet<String>,
}

impl Exemptions {
    fn from_config(config: &FilteringConfig) -> Self {
        let exceptions = &config.exceptions;
        Self {
            ip_addresses: exceptions
                .ip_addresses
                .iter()
                .filter_map(|ip| match ip.parse() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!("Ignoring invalid exempt IP address {}", ip);
                        None
                    }
                })
                .collect(),
            email_addresses: exceptions
                .email_addresses
                .iter()
                .map(|address| address.to_lowercase())
                .collect(),
            email_domains: exceptions
                .email_domains
                .iter()
                .map(|domain| domain.to_lowercase())
                .collect(),
        }
    }

    fn covers(&self, envelope: &Envelope) -> bool {
        self.ip_addresses.contains(&envelope.peer())
            || envelope
                .parsed_from()
                .map_or(false, |from| self.email_addresses.contains(&from.to_lowercase()))
            || envelope
                .sender_domain()
                .map_or(false, |domain| self.email_domains.contains(domain))
    }
}

/// Decides ham or spam for each inbound message
pub struct FilteringManager {
    chain: FilterChain,
    exemptions: Exemptions,
    racing: bool,
    time_budget: Duration,
}

impl FilteringManager {
    pub fn new(config: &FilteringConfig, chain: FilterChain) -> Self {
        Self {
            chain,
            exemptions: Exemptions::from_config(config),
            racing: config.enable_threading,
            time_budget: config.time_budget(),
        }
    }

    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    /// Whether `envelope` bypasses filtering
    pub fn is_exempt(&self, envelope: &Envelope) -> bool {
        self.exemptions.covers(envelope)
    }

    /// Verdict for `envelope`
    pub async fn decide(&self, envelope: Arc<Envelope>) -> Verdict {
        if self.is_exempt(&envelope) {
            debug!(peer = %envelope.peer(), "Exempt from filtering");
            return Verdict::Ham;
        }

        let verdict = if self.racing {
            self.race(&envelope).await
        } else {
            self.run_in_order(&envelope).await
        };

        if verdict.is_spam() {
            if let Some(blacklist) = self.chain.blacklist() {
                blacklist.update(envelope.peer());
            }
        }

        verdict
    }

    /// Run the filters one after the other, stopping at the first positive
    async fn run_in_order(&self, envelope: &Arc<Envelope>) -> Verdict {
        for filter in self.chain.filters() {
            // Spawned so a panicking filter cannot take the session down
            let outcome = tokio::spawn(check(filter.clone(), envelope.clone())).await;

            if is_positive(outcome) {
                return Verdict::Spam;
            }
        }
        Verdict::Ham
    }

    /// Run all filters concurrently; the first positive wins, the budget
    /// running out means ham.
    async fn race(&self, envelope: &Arc<Envelope>) -> Verdict {
        let deadline = Instant::now() + self.time_budget;

        // Dropping the set aborts the filters still running
        let mut running = JoinSet::new();
        for filter in self.chain.filters() {
            running.spawn(check(filter.clone(), envelope.clone()));
        }

        loop {
            match tokio::time::timeout_at(deadline, running.join_next()).await {
                Err(_) => {
                    info!(
                        "Time limit of {:?} reached with {} filters pending, accepting",
                        self.time_budget,
                        running.len()
                    );
                    return Verdict::Ham;
                }
                Ok(None) => return Verdict::Ham,
                Ok(Some(outcome)) => {
                    if is_positive(outcome) {
                        return Verdict::Spam;
                    }
                }
            }
        }
    }
}

type CheckOutcome = (FilterName, lisb_common::Result<bool>);

async fn check(filter: Arc<dyn Filter>, envelope: Arc<Envelope>) -> CheckOutcome {
    let name = filter.name();
    (name, filter.check(&envelope).await)
}

/// Interpret one filter's outcome; anything but a clean positive is clean
fn is_positive(outcome: Result<CheckOutcome, JoinError>) -> bool {
    match outcome {
        Ok((name, Ok(true))) => {
            info!(filter = %name, "Message detected as spam");
            true
        }
        Ok((_, Ok(false))) => false,
        Ok((name, Err(e))) => {
            warn!(filter = %name, "Filter failed, treating as clean: {}", e);
            false
        }
        Err(e) => {
            error!("Filter task failed, treating as clean: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::tests::consistent_envelope;
    use crate::filtering::filters::BlacklistFilter;
    use crate::filtering::PersistedState;
    use async_trait::async_trait;
    use lisb_common::config::ExceptionsConfig;
    use lisb_common::{Error, Result};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Clean,
        Spam,
        Fail,
        Panic,
    }

    /// Filter with a scripted answer that counts its invocations
    struct Scripted {
        name: FilterName,
        behaviour: Behaviour,
        delay: Duration,
        calls: AtomicUsize,
        finished: AtomicBool,
    }

    impl Scripted {
        fn new(name: FilterName, behaviour: Behaviour) -> Arc<Self> {
            Self::slow(name, behaviour, Duration::ZERO)
        }

        fn slow(name: FilterName, behaviour: Behaviour, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                behaviour,
                delay,
                calls: AtomicUsize::new(0),
                finished: AtomicBool::new(false),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Filter for Scripted {
        fn name(&self) -> FilterName {
            self.name
        }

        async fn check(&self, _envelope: &Envelope) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.finished.store(true, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Clean => Ok(false),
                Behaviour::Spam => Ok(true),
                Behaviour::Fail => Err(Error::Filter("boom".into())),
                Behaviour::Panic => panic!("filter bug"),
            }
        }
    }

    fn config(racing: bool) -> FilteringConfig {
        FilteringConfig {
            enable_threading: racing,
            time_limit: 0.5,
            black_listing_threshold: 2,
            ..FilteringConfig::default()
        }
    }

    fn manager(
        config: &FilteringConfig,
        filters: &[Arc<Scripted>],
    ) -> (FilteringManager, Arc<BlacklistFilter>) {
        let blacklist = Arc::new(BlacklistFilter::new(
            config.black_listing_threshold,
            config.black_listed_days,
            Vec::new(),
        ));
        let mut chain = FilterChain::new();
        chain.set_blacklist(blacklist.clone());
        for filter in filters {
            chain.push(filter.clone());
        }
        (FilteringManager::new(config, chain), blacklist)
    }

    fn envelope(peer: &str) -> Arc<Envelope> {
        Arc::new(consistent_envelope(peer))
    }

    #[tokio::test]
    async fn test_exempt_traffic_skips_every_filter() {
        let exemptions = [
            ExceptionsConfig {
                ip_addresses: HashSet::from(["192.0.2.10".to_string()]),
                ..Default::default()
            },
            ExceptionsConfig {
                email_addresses: HashSet::from(["From@Example.com".to_string()]),
                ..Default::default()
            },
            ExceptionsConfig {
                email_domains: HashSet::from(["example.com".to_string()]),
                ..Default::default()
            },
        ];

        for exceptions in exemptions {
            let spam = Scripted::new(FilterName::From, Behaviour::Spam);
            let config = FilteringConfig {
                exceptions,
                ..config(true)
            };
            let (manager, blacklist) = manager(&config, &[spam.clone()]);
            let before = blacklist.snapshot();

            assert_eq!(manager.decide(envelope("192.0.2.10")).await, Verdict::Ham);
            assert_eq!(spam.calls(), 0);
            assert_eq!(blacklist.snapshot(), before);
        }
    }

    #[tokio::test]
    async fn test_spam_updates_blacklist_once() {
        for racing in [true, false] {
            let first = Scripted::new(FilterName::From, Behaviour::Spam);
            let second = Scripted::new(FilterName::To, Behaviour::Spam);
            let (manager, blacklist) = manager(&config(racing), &[first, second]);
            let envelope = envelope("198.51.100.7");

            assert_eq!(manager.decide(envelope.clone()).await, Verdict::Spam);
            assert_eq!(
                blacklist.entry(envelope.peer()).map(|e| e.detections),
                Some(1)
            );
        }
    }

    #[tokio::test]
    async fn test_all_clean_is_ham() {
        for racing in [true, false] {
            let filters = [
                Scripted::new(FilterName::From, Behaviour::Clean),
                Scripted::new(FilterName::To, Behaviour::Clean),
            ];
            let (manager, blacklist) = manager(&config(racing), &filters);
            let envelope = envelope("198.51.100.7");

            assert_eq!(manager.decide(envelope.clone()).await, Verdict::Ham);
            assert!(filters.iter().all(|f| f.calls() == 1));
            assert_eq!(blacklist.entry(envelope.peer()), None);
        }
    }

    #[tokio::test]
    async fn test_failing_filters_fail_open() {
        for racing in [true, false] {
            let filters = [
                Scripted::new(FilterName::Dkim, Behaviour::Fail),
                Scripted::new(FilterName::Spf, Behaviour::Panic),
                Scripted::new(FilterName::From, Behaviour::Clean),
            ];
            let (manager, _) = manager(&config(racing), &filters);

            assert_eq!(manager.decide(envelope("198.51.100.7")).await, Verdict::Ham);
            assert_eq!(filters[2].calls(), 1);
        }
    }

    #[tokio::test]
    async fn test_sequential_stops_at_first_positive() {
        let spam = Scripted::new(FilterName::From, Behaviour::Spam);
        let later = Scripted::new(FilterName::To, Behaviour::Clean);
        let (manager, _) = manager(&config(false), &[spam.clone(), later.clone()]);

        assert_eq!(manager.decide(envelope("198.51.100.7")).await, Verdict::Spam);
        assert_eq!(spam.calls(), 1);
        assert_eq!(later.calls(), 0);
    }

    #[tokio::test]
    async fn test_sequential_has_no_time_limit() {
        let slow = Scripted::slow(FilterName::Ai, Behaviour::Spam, Duration::from_millis(800));
        let (manager, _) = manager(&config(false), &[slow]);

        assert_eq!(manager.decide(envelope("198.51.100.7")).await, Verdict::Spam);
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_fails_open_on_timeout() {
        let slow = Scripted::slow(FilterName::Ai, Behaviour::Spam, Duration::from_secs(30));
        let clean = Scripted::new(FilterName::From, Behaviour::Clean);
        let (manager, blacklist) = manager(&config(true), &[slow.clone(), clean]);
        let envelope = envelope("198.51.100.7");

        let started = Instant::now();
        assert_eq!(manager.decide(envelope.clone()).await, Verdict::Ham);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(blacklist.entry(envelope.peer()), None);

        // The abandoned filter is aborted rather than left to finish
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!slow.finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_first_spam_wins() {
        let slow = Scripted::slow(FilterName::Ai, Behaviour::Clean, Duration::from_secs(30));
        let fast = Scripted::slow(FilterName::From, Behaviour::Spam, Duration::from_millis(10));
        let config = FilteringConfig {
            time_limit: 60.0,
            ..config(true)
        };
        let (manager, _) = manager(&config, &[slow, fast]);

        let started = Instant::now();
        assert_eq!(manager.decide(envelope("198.51.100.7")).await, Verdict::Spam);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_blacklist_blocks_after_threshold() {
        let toggle = Scripted::new(FilterName::From, Behaviour::Spam);
        let (manager, blacklist) = manager(&config(false), &[toggle]);
        let envelope = envelope("203.0.113.50");

        for expected in 1..=3 {
            assert!(!blacklist.check(&envelope).await.unwrap());
            assert_eq!(manager.decide(envelope.clone()).await, Verdict::Spam);
            assert_eq!(
                blacklist.entry(envelope.peer()).map(|e| e.detections),
                Some(expected)
            );
        }
        assert!(blacklist.check(&envelope).await.unwrap());
    }

    #[tokio::test]
    async fn test_spam_without_blacklist_has_no_feedback() {
        let spam = Scripted::new(FilterName::From, Behaviour::Spam);
        let mut chain = FilterChain::new();
        chain.push(spam);
        let manager = FilteringManager::new(&config(true), chain);

        assert_eq!(manager.decide(envelope("198.51.100.7")).await, Verdict::Spam);
        assert!(manager.chain().blacklist().is_none());
    }
}
