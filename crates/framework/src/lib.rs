//! End-to-end test framework for Kubernetes workloads.
//!
//! Tests are written as [`Feature`]s: named bundles of setup, assessment and
//! teardown steps. An [`Environment`] runs them, wrapping suites, tests and
//! features in registered hooks while threading an immutable [`Context`]
//! from one call to the next.
//!
//! ```rust
//! use e2e_framework::{ContextKey, Environment, FeatureBuilder, Hook, TestHandle};
//!
//! const GREETING: ContextKey<String> = ContextKey::new("greeting");
//!
//! let mut env = Environment::new();
//! env.before_each_test([Hook::env(|ctx, _cfg| {
//!     Ok(ctx.with_value(&GREETING, "hello".to_string()))
//! })]);
//!
//! let feature = FeatureBuilder::new("greeting")
//!     .assess("is set", |ctx, t, _cfg| {
//!         if ctx.value(&GREETING).is_err() {
//!             t.error("greeting missing");
//!         }
//!         ctx
//!     })
//!     .feature();
//!
//! let mut t = TestHandle::new("TestGreeting");
//! env.test(&mut t, &[feature]);
//! assert!(!t.failed());
//! ```
//!
//! # Modules
//!
//! - [`context`] - immutable typed key/value store
//! - [`envconf`] - configuration and the lazily built cluster client
//! - [`env`] - hook registration and the lifecycle engine
//! - [`features`] - features, steps and the builder
//! - [`klient`] - minimal Kubernetes API client
//! - [`testing`] - test handles, reports and the suite runner
//! - [`wait`] - polling for eventual conditions
//! - [`logging`] - tracing subscriber setup

pub mod context;
pub mod env;
pub mod envconf;
pub mod features;
pub mod klient;
pub mod logging;
pub mod testing;
pub mod wait;

pub use context::{Context, ContextError, ContextKey};
pub use env::{EnvError, Environment, Hook, Role};
pub use envconf::{random_name, Config, ConfigError, ConnectionSource, Labels};
pub use features::{Feature, FeatureBuilder, Level, Step};
pub use klient::{ClientError, KubeClient};
pub use testing::{Outcome, SuiteReport, TestHandle, TestReport, TestSuite};
pub use wait::{WaitError, WaitOptions};
