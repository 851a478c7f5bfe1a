//! Hooks and helpers shared by the suite.

pub mod kubectl;
pub mod namespace;

pub use kubectl::Kubectl;
pub use namespace::{namespace_key, NamespaceFixture};
