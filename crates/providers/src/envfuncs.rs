//! Ready-made environment hooks for provisioning clusters.
//!
//! ```rust,no_run
//! use e2e_framework::{random_name, Environment};
//! use e2e_providers::envfuncs::{create_cluster, destroy_cluster};
//! use e2e_providers::registry::ProviderRegistry;
//!
//! let registry = ProviderRegistry::with_defaults();
//! let name = random_name("e2e-cluster", 16);
//!
//! let mut env = Environment::new();
//! env.setup([create_cluster(&registry, "kind", &name).expect("kind is registered")])
//!     .finish([destroy_cluster(&name)]);
//! ```

use crate::provider::{with_name, ClusterProvider, CreateOption};
use crate::registry::{ProviderRegistry, RegistryError};
use anyhow::Context as _;
use e2e_framework::{ContextKey, Hook};
use std::sync::Arc;
use tracing::info;

/// Shared handle to a provisioned cluster.
pub type SharedProvider = Arc<dyn ClusterProvider>;

/// Context key the provider for cluster `name` is stored under.
pub fn cluster_key(name: &str) -> ContextKey<SharedProvider> {
    ContextKey::named(format!("cluster/{name}"))
}

/// `Setup` hook that creates cluster `name` with provider `provider`.
///
/// The hook points the configuration at the new kubeconfig and stores the
/// provider in the context under [`cluster_key`]. Fails right away if
/// `provider` is not registered.
pub fn create_cluster(
    registry: &ProviderRegistry,
    provider: &str,
    name: &str,
) -> Result<Hook, RegistryError> {
    create_cluster_with(registry, provider, name, Vec::new())
}

/// Like [`create_cluster`], with extra create options.
pub fn create_cluster_with(
    registry: &ProviderRegistry,
    provider: &str,
    name: &str,
    mut opts: Vec<CreateOption>,
) -> Result<Hook, RegistryError> {
    let generator = registry.generator(provider)?;
    let name = name.to_string();
    opts.insert(0, with_name(name.clone()));

    Ok(Hook::env(move |ctx, cfg| {
        let cluster: SharedProvider = Arc::from(generator());
        let kubeconfig = cluster
            .create(&opts)
            .with_context(|| format!("creating cluster {name}"))?;

        info!(
            target: "e2e.providers",
            cluster = %name,
            kubeconfig = %kubeconfig.display(),
            "Cluster ready"
        );
        cfg.with_kubeconfig_file(kubeconfig);
        Ok(ctx.with_value(&cluster_key(&name), cluster))
    }))
}

/// `Finish` hook that destroys the cluster stored by [`create_cluster`].
pub fn destroy_cluster(name: &str) -> Hook {
    let name = name.to_string();
    Hook::env(move |ctx, _cfg| {
        let cluster = ctx
            .value(&cluster_key(&name))
            .with_context(|| format!("looking up cluster {name}"))?;
        cluster
            .destroy()
            .with_context(|| format!("destroying cluster {name}"))?;
        Ok(ctx.without(&cluster_key(&name)))
    })
}
