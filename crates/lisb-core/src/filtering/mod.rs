//! Filter chain
//!
//! Every check implements [`Filter`]. Checks that learn across messages also
//! implement [`PersistedState`] so the storage manager can load and snapshot
//! them. The [`FilterChain`] is built once at startup from the enabled set and
//! keeps a separate handle on the blacklist, which is also the feedback sink
//! of the [`FilteringManager`].

pub mod filters;
pub mod manager;
pub mod state;

pub use manager::FilteringManager;

use crate::email_auth::SpfResolver;
use crate::envelope::Envelope;
use crate::storage::StorageManager;
use async_trait::async_trait;
use filters::{
    load_drop_list, BlacklistFilter, ClassifierFilter, DkimFilter, FromFilter, Model,
    ReturnPathFilter, SpfFilter, ToFilter, XHeaderFilter,
};
use lisb_common::config::FilteringConfig;
use lisb_common::{FilterName, Result};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// A spam check
#[async_trait]
pub trait Filter: Send + Sync {
    /// Name used for enabling, logging and state files
    fn name(&self) -> FilterName;

    /// Whether `envelope` looks like spam.
    ///
    /// An error means the check could not decide; callers treat it as clean.
    async fn check(&self, envelope: &Envelope) -> Result<bool>;
}

/// State a filter remembers across messages
pub trait PersistedState: Send + Sync {
    /// Stem of the state file
    fn state_name(&self) -> FilterName;

    /// Replace the working state with a persisted one
    fn load(&self, state: Value) -> Result<()>;

    /// Detached copy of the working state
    fn snapshot(&self) -> Value;
}

/// The enabled filters, in evaluation order
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
    persisted: Vec<Arc<dyn PersistedState>>,
    blacklist: Option<Arc<BlacklistFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the chain for `config`.
    ///
    /// The classifier is only registered when a model is supplied.
    pub fn from_config(
        config: &FilteringConfig,
        resolver: Arc<dyn SpfResolver>,
        model: Option<Box<dyn Model>>,
    ) -> Result<Self> {
        let mut chain = Self::new();
        let mut model = model;

        for name in FilterName::ALL {
            if !config.is_enabled(name) {
                info!("Filter {} is disabled", name);
                continue;
            }

            match name {
                FilterName::BlackList => {
                    let ranges = config
                        .drop_list
                        .as_deref()
                        .map(load_drop_list)
                        .unwrap_or_default();
                    chain.set_blacklist(Arc::new(BlacklistFilter::new(
                        config.black_listing_threshold,
                        config.black_listed_days,
                        ranges,
                    )));
                }
                FilterName::From => chain.push(Arc::new(FromFilter)),
                FilterName::To => chain.push(Arc::new(ToFilter)),
                FilterName::ReturnPath => chain.push(Arc::new(ReturnPathFilter)),
                FilterName::Dkim => chain.push_stateful(Arc::new(DkimFilter::new())),
                FilterName::Spf => chain.push_stateful(Arc::new(SpfFilter::new(resolver.clone()))),
                FilterName::XHeaders => chain.push_stateful(Arc::new(XHeaderFilter::new())),
                FilterName::Ai => match model.take() {
                    Some(model) => chain.push(Arc::new(ClassifierFilter::new(model)?)),
                    None => info!("No classifier model configured, {} not registered", name),
                },
            }
        }

        info!("Filter chain: {:?}", chain.names());
        Ok(chain)
    }

    /// Append a stateless filter
    pub fn push(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    /// Append a filter whose state is persisted
    pub fn push_stateful<F>(&mut self, filter: Arc<F>)
    where
        F: Filter + PersistedState + 'static,
    {
        self.persisted.push(filter.clone());
        self.filters.push(filter);
    }

    /// Append the blacklist and keep it as the feedback sink
    pub fn set_blacklist(&mut self, blacklist: Arc<BlacklistFilter>) {
        self.push_stateful(blacklist.clone());
        self.blacklist = Some(blacklist);
    }

    pub fn filters(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }

    pub fn blacklist(&self) -> Option<&Arc<BlacklistFilter>> {
        self.blacklist.as_ref()
    }

    /// Handles on every stateful filter, for the storage daemon
    pub fn persisted(&self) -> Vec<Arc<dyn PersistedState>> {
        self.persisted.clone()
    }

    pub fn names(&self) -> Vec<FilterName> {
        self.filters.iter().map(|filter| filter.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Hand every stateful filter its persisted state
    pub async fn load_state(&self, storage: &StorageManager) {
        for filter in &self.persisted {
            let name = filter.state_name();
            let state = storage.load(name).await;

            if let Err(e) = filter.load(state) {
                warn!("Ignoring persisted state of {}: {}", name, e);
                if let Err(e) = filter.load(Value::Null) {
                    warn!("Failed to reset state of {}: {}", name, e);
                }
            }
        }
    }
}
