//! The cluster provider abstraction shared by all backends.

use crate::exec::CommandOutput;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' exited with {status:?}: {output}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        output: String,
    },

    #[error("{program} is not available even after installation")]
    NotInstalled { program: String },

    #[error("Cluster '{name}' not listed after creation: {clusters}")]
    ClusterMissing { name: String, clusters: String },

    #[error("Cluster name must be set before {operation}")]
    MissingName { operation: &'static str },

    #[error("No kubeconfig available for cluster '{name}'")]
    MissingKubeconfig { name: String },

    #[error("Kubeconfig file error: {0}")]
    Kubeconfig(#[source] io::Error),
}

impl ProviderError {
    /// Build the error for a process that ran but did not succeed.
    pub fn failed(command: String, output: &CommandOutput) -> Self {
        ProviderError::CommandFailed {
            command,
            status: output.status,
            output: output.combined(),
        }
    }
}

/// Settings a provider creates a cluster with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfig {
    pub name: String,
    /// Also used as the tool version when the provider installs its CLI.
    pub kubernetes_version: String,
    pub init_config: String,
    pub args: Vec<String>,
}

/// One adjustment to a [`ClusterConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOption {
    Name(String),
    KubernetesVersion(String),
    InitConfig(String),
    Args(Vec<String>),
}

pub fn with_name(name: impl Into<String>) -> CreateOption {
    CreateOption::Name(name.into())
}

pub fn with_kubernetes_version(version: impl Into<String>) -> CreateOption {
    CreateOption::KubernetesVersion(version.into())
}

pub fn with_init_config(init_config: impl Into<String>) -> CreateOption {
    CreateOption::InitConfig(init_config.into())
}

/// Extra CLI arguments, appended to any given earlier.
pub fn with_args<I, S>(args: I) -> CreateOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CreateOption::Args(args.into_iter().map(Into::into).collect())
}

impl ClusterConfig {
    /// Apply `opts` in order. Later options win, except `Args` which append.
    pub fn apply(&mut self, opts: &[CreateOption]) {
        for opt in opts {
            match opt {
                CreateOption::Name(name) => self.name = name.clone(),
                CreateOption::KubernetesVersion(v) => self.kubernetes_version = v.clone(),
                CreateOption::InitConfig(c) => self.init_config = c.clone(),
                CreateOption::Args(args) => self.args.extend(args.iter().cloned()),
            }
        }
    }
}

/// A backend that can provision and remove a cluster.
///
/// Methods take `&self` so a provider can be shared through the test
/// context and torn down from a `Finish` hook.
pub trait ClusterProvider: Send + Sync {
    /// Create (or reuse) the cluster and return its kubeconfig path.
    fn create(&self, opts: &[CreateOption]) -> Result<PathBuf, ProviderError>;

    /// Delete the cluster and any kubeconfig file written for it.
    fn destroy(&self) -> Result<(), ProviderError>;

    /// Kubeconfig path for the cluster, fetched on first use.
    fn kubeconfig(&self) -> Result<PathBuf, ProviderError>;

    /// Name of the kubeconfig context that selects this cluster.
    fn kube_context(&self) -> String;

    /// Make a local container image available inside the cluster.
    fn load_image(&self, image: &str) -> Result<(), ProviderError>;

    /// Load an image tarball into the cluster.
    fn load_image_archive(&self, archive: &Path) -> Result<(), ProviderError>;
}
