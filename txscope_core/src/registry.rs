//! Named connection providers shared by engines.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::ConnectionProvider;
use crate::error::{TxError, TxResult};
use crate::transactions::DEFAULT_DATA_SOURCE;

/// Process-scoped map from data source name to connection provider.
///
/// Registration is expected at startup and [`unregister_all`](Self::unregister_all)
/// at shutdown; lookups are safe to run concurrently with each other and with
/// registration.
#[derive(Default)]
pub struct DataSourceRegistry {
    sources: RwLock<BTreeMap<String, Arc<dyn ConnectionProvider>>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P>(&self, name: impl Into<String>, provider: P) -> TxResult<()>
    where
        P: ConnectionProvider + 'static,
    {
        self.register_arc(name, Arc::new(provider))
    }

    /// Register the unnamed primary data source.
    pub fn register_default<P>(&self, provider: P) -> TxResult<()>
    where
        P: ConnectionProvider + 'static,
    {
        self.register(DEFAULT_DATA_SOURCE, provider)
    }

    pub fn register_arc(
        &self,
        name: impl Into<String>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> TxResult<()> {
        let name = name.into();
        let mut sources = self.sources.write();
        if sources.contains_key(&name) {
            return Err(TxError::configuration(format!(
                "data source already registered: {:?}",
                name
            )));
        }
        tracing::debug!(data_source = %name, "data source registered");
        sources.insert(name, provider);
        Ok(())
    }

    pub fn get(&self, name: &str) -> TxResult<Arc<dyn ConnectionProvider>> {
        self.resolve(name).map(|(_, provider)| provider)
    }

    /// Canonical name and provider for `name`. The default sentinel resolves to the
    /// unnamed entry, or to the only registered entry when there is exactly one.
    pub fn resolve(&self, name: &str) -> TxResult<(String, Arc<dyn ConnectionProvider>)> {
        let sources = self.sources.read();
        if let Some(provider) = sources.get(name) {
            return Ok((name.to_string(), provider.clone()));
        }
        if name == DEFAULT_DATA_SOURCE && sources.len() == 1 {
            if let Some((only, provider)) = sources.iter().next() {
                return Ok((only.clone(), provider.clone()));
            }
        }
        Err(TxError::configuration(format!(
            "data source not found: {:?}",
            name
        )))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.read().contains_key(name)
    }

    /// Remove one entry. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.sources.write().remove(name).is_some()
    }

    pub fn unregister_all(&self) {
        let mut sources = self.sources.write();
        if !sources.is_empty() {
            tracing::debug!(count = sources.len(), "unregistering all data sources");
        }
        sources.clear();
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }
}

impl std::fmt::Debug for DataSourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceRegistry")
            .field("names", &self.names())
            .finish()
    }
}
