//! Live-cluster suite for e2e-framework.
//!
//! The fixtures here are ordinary environment hooks built on the framework
//! and the provider crate. The suite itself lives in `tests/kind_suite.rs`
//! and only builds with `--features kind`:
//!
//! ```bash
//! cargo test -p cluster-tests --features kind --test kind_suite
//! ```
//!
//! Setting `SONOBUOY=true` runs against the cluster the suite is deployed
//! in, and `KUBECONFIG` points it at an existing cluster. Otherwise a kind
//! cluster is created for the run and destroyed afterwards.

pub mod fixtures;
pub mod suite;
