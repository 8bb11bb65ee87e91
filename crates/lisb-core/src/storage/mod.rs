//! Filter state persistence
//!
//! Each stateful filter owns one JSON file, `<FilterName>.json`, in the data
//! directory. Files are rewritten atomically and with sorted keys. A missing
//! or undecodable file loads as empty state.

use crate::filtering::PersistedState;
use lisb_common::{Error, FilterName, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Loads and flushes the state of stateful filters
#[derive(Debug)]
pub struct StorageManager {
    base_path: PathBuf,
    interval: Duration,
}

impl StorageManager {
    /// Create a storage manager, creating `path` if needed
    pub async fn new(path: impl AsRef<Path>, interval: Duration) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;

        info!(path = %path.display(), "Initialized filter state storage");

        Ok(Self {
            base_path: path.to_path_buf(),
            interval,
        })
    }

    /// File backing `name`
    pub fn path_of(&self, name: FilterName) -> PathBuf {
        self.base_path.join(format!("{}.json", name))
    }

    /// Persisted state of `name`; an empty object when there is none
    pub async fn load(&self, name: FilterName) -> Value {
        let path = self.path_of(name);
        debug!("Retrieving {} state from {}", name, path.display());

        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Value::Object(Default::default())
            }
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                return Value::Object(Default::default());
            }
        };

        match serde_json::from_slice(&content) {
            Ok(state) => state,
            Err(e) => {
                warn!("Discarding undecodable state file {}: {}", path.display(), e);
                Value::Object(Default::default())
            }
        }
    }

    /// Atomically replace the persisted state of `name`
    pub async fn store(&self, name: FilterName, state: &Value) -> Result<()> {
        let path = self.path_of(name);
        let tmp_path = path.with_extension("json.tmp");
        debug!("Storing {} state to {}", name, path.display());

        // serde_json maps are ordered, so keys come out sorted
        let data = serde_json::to_vec(state)
            .map_err(|e| Error::Storage(format!("Failed to encode {} state: {}", name, e)))?;

        fs::write(&tmp_path, &data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", tmp_path.display(), e)))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to replace {}: {}", path.display(), e)))?;

        Ok(())
    }

    /// Snapshot and persist every filter; failures are logged and skipped
    pub async fn store_all(&self, filters: &[Arc<dyn PersistedState>]) -> usize {
        let mut stored = 0;
        for filter in filters {
            let name = filter.state_name();
            match self.store(name, &filter.snapshot()).await {
                Ok(()) => stored += 1,
                Err(e) => error!("Failed to persist {} state: {}", name, e),
            }
        }
        stored
    }

    /// Flush `filters` every interval until `token` is cancelled, then once more
    pub fn spawn_daemon(
        self: Arc<Self>,
        filters: Vec<Arc<dyn PersistedState>>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(
                "Storage daemon started, flushing every {}s",
                self.interval.as_secs()
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let stored = self.store_all(&filters).await;
                        debug!("Flushed state of {} filters", stored);
                    }
                }
            }

            let stored = self.store_all(&filters).await;
            info!("Storage daemon stopped after final flush of {} filters", stored);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filtering::filters::{BlacklistFilter, DkimFilter, SpfFilter, XHeaderFilter};
    use crate::email_auth::SpfResolver;
    use crate::envelope::tests::consistent_envelope;
    use crate::envelope::Envelope;
    use crate::filtering::{Filter, FilterChain, FilteringManager};
    use crate::shutdown::Shutdown;
    use async_trait::async_trait;
    use lisb_common::config::FilteringConfig;
    use lisb_common::Verdict;
    use ipnet::IpNet;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct NoDns;

    #[async_trait]
    impl SpfResolver for NoDns {
        async fn resolve_ranges(&self, domain: &str) -> Result<Vec<IpNet>> {
            Err(Error::Dns(format!("offline: {}", domain)))
        }
    }

    /// Flags everything, after a delay
    struct SlowSpam;

    #[async_trait]
    impl Filter for SlowSpam {
        fn name(&self) -> FilterName {
            FilterName::From
        }

        async fn check(&self, _envelope: &Envelope) -> Result<bool> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(true)
        }
    }

    async fn storage(dir: &tempfile::TempDir) -> StorageManager {
        StorageManager::new(dir.path().join("data"), Duration::from_secs(60))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        assert_eq!(storage.load(FilterName::Dkim).await, json!({}));
    }

    #[tokio::test]
    async fn test_undecodable_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        fs::write(storage.path_of(FilterName::Spf), b"{not json")
            .await
            .unwrap();
        assert_eq!(storage.load(FilterName::Spf).await, json!({}));
    }

    #[tokio::test]
    async fn test_store_writes_sorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        let state = json!({"zeta.org": ["X-B"], "alpha.org": ["X-A"]});

        storage.store(FilterName::XHeaders, &state).await.unwrap();

        let written = fs::read_to_string(dir.path().join("data/XFilter.json"))
            .await
            .unwrap();
        assert_eq!(written, r#"{"alpha.org":["X-A"],"zeta.org":["X-B"]}"#);
        assert!(!dir.path().join("data/XFilter.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_round_trip_for_every_stateful_filter() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;

        let blacklist = BlacklistFilter::new(3, 7, Vec::new());
        blacklist.update("198.51.100.4".parse().unwrap());
        let dkim = DkimFilter::new();
        dkim.load(json!({"a.com": {"s": "sel", "d": "a.com"}})).unwrap();
        let spf = SpfFilter::new(Arc::new(NoDns));
        spf.load(json!({"a.com": ["192.0.2.0/24", "2001:db8::/32"]}))
            .unwrap();
        let xheaders = XHeaderFilter::new();
        xheaders.load(json!({"a.com": ["X-Mailer"]})).unwrap();

        let filters: Vec<Arc<dyn PersistedState>> = vec![
            Arc::new(blacklist),
            Arc::new(dkim),
            Arc::new(spf),
            Arc::new(xheaders),
        ];
        assert_eq!(storage.store_all(&filters).await, 4);

        for filter in &filters {
            let name = filter.state_name();
            assert_eq!(storage.load(name).await, filter.snapshot(), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_daemon_flushes_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(storage(&dir).await);
        let dkim = Arc::new(DkimFilter::new());
        let token = CancellationToken::new();

        let daemon = storage
            .clone()
            .spawn_daemon(vec![dkim.clone() as Arc<dyn PersistedState>], token.clone());
        dkim.load(json!({"late.org": {"s": "s1", "d": "late.org"}}))
            .unwrap();
        token.cancel();
        daemon.await.unwrap();

        assert_eq!(
            storage.load(FilterName::Dkim).await,
            json!({"late.org": {"s": "s1", "d": "late.org"}})
        );
    }

    #[tokio::test]
    async fn test_daemon_flushes_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            StorageManager::new(dir.path(), Duration::from_millis(50))
                .await
                .unwrap(),
        );
        let dkim = Arc::new(DkimFilter::new());
        let token = CancellationToken::new();

        let daemon = storage
            .clone()
            .spawn_daemon(vec![dkim.clone() as Arc<dyn PersistedState>], token.clone());
        dkim.load(json!({"a.org": {"s": "s", "d": "a.org"}})).unwrap();

        let mut flushed = false;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if storage.load(FilterName::Dkim).await != json!({}) {
                flushed = true;
                break;
            }
        }
        assert!(flushed);
        assert!(!daemon.is_finished());

        token.cancel();
        daemon.await.unwrap();
    }

    #[tokio::test]
    async fn test_final_flush_keeps_decision_finished_after_request() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(storage(&dir).await);

        let blacklist = Arc::new(BlacklistFilter::new(2, 7, vec![]));
        let mut chain = FilterChain::new();
        chain.set_blacklist(blacklist.clone());
        chain.push(Arc::new(SlowSpam));
        let persisted = chain.persisted();
        let config = FilteringConfig {
            enable_threading: false,
            ..FilteringConfig::default()
        };
        let manager = Arc::new(FilteringManager::new(&config, chain));

        let shutdown = Shutdown::new();
        let daemon = storage
            .clone()
            .spawn_daemon(persisted, shutdown.flush_token());

        let decision = {
            let manager = manager.clone();
            let envelope = Arc::new(consistent_envelope("203.0.113.9"));
            tokio::spawn(async move { manager.decide(envelope).await })
        };
        shutdown.request();
        assert_eq!(decision.await.unwrap(), Verdict::Spam);
        assert!(!daemon.is_finished());

        shutdown.complete();
        daemon.await.unwrap();

        let stored = storage.load(FilterName::BlackList).await;
        assert_eq!(stored["203.0.113.9"]["detections"], json!(1));
    }
}
