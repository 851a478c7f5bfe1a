//! Cluster providers and external tool wrappers for e2e-framework.
//!
//! - [`provider`] - the [`ClusterProvider`] trait and create options
//! - [`kind`] - local clusters with kind
//! - [`registry`] - providers looked up by name
//! - [`helm`] - the helm CLI
//! - [`envfuncs`] - environment hooks that create and destroy clusters
//! - [`exec`] - process execution, real and scripted

pub mod envfuncs;
pub mod exec;
pub mod helm;
pub mod kind;
pub mod provider;
pub mod registry;

pub use exec::{CommandExecutor, CommandOutput, ScriptedExecutor, SystemExecutor};
pub use helm::{HelmError, HelmManager};
pub use kind::KindCluster;
pub use provider::{ClusterConfig, ClusterProvider, CreateOption, ProviderError};
pub use registry::{ProviderGenerator, ProviderRegistry, RegistryError};
