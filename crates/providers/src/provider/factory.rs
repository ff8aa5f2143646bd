//! Provider factories

use std::sync::Arc;

use super::Provider;
use crate::config::ProviderConfig;
use crate::error::Result;

/// Constructs providers of one or more types from configuration.
///
/// Any `Fn(&str, ProviderConfig) -> Result<Arc<dyn Provider>>` closure is a
/// factory, which is the usual way to plug in custom providers.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, name: &str, config: ProviderConfig) -> Result<Arc<dyn Provider>>;
}

impl<F> ProviderFactory for F
where
    F: Fn(&str, ProviderConfig) -> Result<Arc<dyn Provider>> + Send + Sync,
{
    fn create(&self, name: &str, config: ProviderConfig) -> Result<Arc<dyn Provider>> {
        self(name, config)
    }
}

#[cfg(feature = "local")]
pub use crate::providers::local::LocalModelRunnerFactory;

#[cfg(feature = "cloud")]
pub use crate::providers::cloud::CloudApiFactory;
