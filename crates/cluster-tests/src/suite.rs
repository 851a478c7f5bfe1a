//! Environment and suite wiring for a live run.
//!
//! Where the cluster comes from is decided by the process environment:
//!
//! | Variables              | Cluster                                   |
//! |------------------------|-------------------------------------------|
//! | `SONOBUOY=true`        | the one the suite runs in                 |
//! | `KUBECONFIG=<path>`    | the existing cluster in that file         |
//! | neither                | a new cluster from `E2E_PROVIDER` (kind)  |

use anyhow::Context as _;
use e2e_framework::{random_name, Config, ConfigError, ConnectionSource, Environment, TestSuite};
use e2e_providers::envfuncs::{create_cluster, destroy_cluster};
use e2e_providers::{kind, ProviderRegistry};
use std::collections::HashMap;
use std::env;
use tracing::info;

/// Regex selecting top-level tests by name.
pub const ENV_RUN: &str = "E2E_RUN";

/// Provider used when the suite has to create its own cluster.
pub const ENV_PROVIDER: &str = "E2E_PROVIDER";

/// Prefix of generated cluster names.
pub const CLUSTER_PREFIX: &str = "e2e-cluster";

const CLUSTER_NAME_LENGTH: usize = 16;

/// Build the environment from the process environment.
pub fn build_environment(registry: &ProviderRegistry) -> anyhow::Result<Environment> {
    build_environment_from(registry, &env::vars().collect())
}

/// Build the environment from `vars` (for testing).
pub fn build_environment_from(
    registry: &ProviderRegistry,
    vars: &HashMap<String, String>,
) -> anyhow::Result<Environment> {
    let cfg = Config::from_vars(vars).context("loading configuration")?;
    let provision = match cfg.connection_source() {
        ConnectionSource::InCluster => {
            info!(target: "e2e.suite", "Running in cluster");
            false
        }
        ConnectionSource::Kubeconfig(path) => {
            info!(target: "e2e.suite", kubeconfig = %path.display(), "Using existing cluster");
            false
        }
        ConnectionSource::None => true,
    };

    let mut env = Environment::with_config(cfg);
    if provision {
        let provider = vars
            .get(ENV_PROVIDER)
            .filter(|p| !p.is_empty())
            .map_or(kind::PROVIDER_NAME, String::as_str);
        let name = random_name(CLUSTER_PREFIX, CLUSTER_NAME_LENGTH);
        info!(
            target: "e2e.suite",
            provider = %provider,
            cluster = %name,
            "Provisioning cluster for the run"
        );

        env.setup([create_cluster(registry, provider, &name)?])
            .finish([destroy_cluster(&name)]);
    }
    Ok(env)
}

/// Apply the `E2E_RUN` filter from `vars`, if any.
pub fn select_tests(
    suite: TestSuite,
    vars: &HashMap<String, String>,
) -> Result<TestSuite, ConfigError> {
    match vars.get(ENV_RUN).filter(|p| !p.is_empty()) {
        Some(pattern) => suite.with_filter(pattern),
        None => Ok(suite),
    }
}
