//! Named cluster provider lookup.
//!
//! The registry is an ordinary value owned by whoever needs it. Nothing is
//! registered globally:
//!
//! ```rust
//! use e2e_providers::registry::ProviderRegistry;
//!
//! let registry = ProviderRegistry::with_defaults();
//! let provider = registry.generator("kind").map(|make| make());
//! assert!(provider.is_ok());
//! ```

use crate::kind::{self, KindCluster};
use crate::provider::ClusterProvider;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("A provider named '{0}' is already registered")]
    Duplicate(String),

    #[error("No provider named '{0}' is registered")]
    NotFound(String),
}

/// Builds a fresh, unconfigured provider.
pub type ProviderGenerator = Arc<dyn Fn() -> Box<dyn ClusterProvider> + Send + Sync>;

/// Provider generators keyed by name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    generators: BTreeMap<String, ProviderGenerator>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in providers (`kind`).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .generators
            .insert(kind::PROVIDER_NAME.to_string(), Arc::new(KindCluster::generator));
        registry
    }

    /// Add a generator under `name`.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        generator: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn() -> Box<dyn ClusterProvider> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.generators.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        debug!(target: "e2e.providers", provider = %name, "Registering provider");
        self.generators.insert(name, Arc::new(generator));
        Ok(self)
    }

    /// Generator registered under `name`.
    pub fn generator(&self, name: &str) -> Result<ProviderGenerator, RegistryError> {
        self.generators
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.generators.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_include_kind() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["kind"]);

        let provider = registry.generator("kind").unwrap()();
        assert_eq!(provider.kube_context(), "kind-");
    }

    #[test]
    fn test_duplicate_is_error() {
        let mut registry = ProviderRegistry::with_defaults();
        let err = registry.register("kind", KindCluster::generator).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("kind".to_string()));
    }

    #[test]
    fn test_unknown_is_error() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.generator("gke"),
            Err(RegistryError::NotFound(name)) if name == "gke"
        ));
    }

    #[test]
    fn test_register_chains() {
        let mut registry = ProviderRegistry::new();
        registry
            .register("kind", KindCluster::generator)
            .unwrap()
            .register("kind-alt", KindCluster::generator)
            .unwrap();
        assert_eq!(registry.names(), vec!["kind", "kind-alt"]);
    }
}
