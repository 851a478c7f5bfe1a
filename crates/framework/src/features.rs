//! Features and their steps.
//!
//! A [`Feature`] is one test scenario: a named list of [`Step`]s, each tagged
//! with a [`Level`]. Features are assembled with a [`FeatureBuilder`]:
//!
//! ```rust
//! use e2e_framework::features::{FeatureBuilder, Level};
//!
//! let feature = FeatureBuilder::new("deployment rollout")
//!     .with_label("type", "smoke")
//!     .setup(|ctx, _t, _cfg| ctx)
//!     .assess("replicas become ready", |ctx, _t, _cfg| ctx)
//!     .teardown(|ctx, _t, _cfg| ctx)
//!     .feature();
//!
//! assert_eq!(feature.steps_by_level(Level::Assess).len(), 1);
//! ```
//!
//! Steps may be declared in any order. The environment always runs a
//! feature's setup steps first, then its assessments, then its teardowns,
//! keeping declaration order within each level.

use crate::context::Context;
use crate::envconf::{Config, Labels};
use crate::testing::TestHandle;
use std::fmt;
use std::sync::Arc;

/// Lifecycle phase of a step within a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Setup,
    Assess,
    Teardown,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Setup => "Setup",
            Level::Assess => "Assess",
            Level::Teardown => "Teardown",
        };
        f.write_str(name)
    }
}

/// Step body: takes the current context and returns the next one.
///
/// Steps report failure through the [`TestHandle`] rather than a return
/// value.
pub type StepFunc = Arc<dyn Fn(Context, &mut TestHandle, &Config) -> Context + Send + Sync>;

/// A single unit of work inside a feature.
#[derive(Clone)]
pub struct Step {
    name: String,
    level: Level,
    func: StepFunc,
}

impl Step {
    pub fn new<F>(name: impl Into<String>, level: Level, func: F) -> Self
    where
        F: Fn(Context, &mut TestHandle, &Config) -> Context + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            level,
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Invoke the step body.
    pub fn call(&self, ctx: Context, t: &mut TestHandle, cfg: &Config) -> Context {
        (self.func)(ctx, t, cfg)
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

/// An immutable, named bundle of steps.
#[derive(Debug, Clone)]
pub struct Feature {
    name: String,
    steps: Vec<Step>,
    labels: Labels,
}

impl Feature {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All steps in declaration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Steps of one level, in declaration order.
    pub fn steps_by_level(&self, level: Level) -> Vec<&Step> {
        steps_by_level(&self.steps, level)
    }
}

/// Filter `steps` down to one level, preserving relative order.
pub fn steps_by_level(steps: &[Step], level: Level) -> Vec<&Step> {
    steps.iter().filter(|s| s.level == level).collect()
}

/// Incremental builder for a [`Feature`].
#[derive(Debug, Clone)]
pub struct FeatureBuilder {
    name: String,
    steps: Vec<Step>,
    labels: Labels,
}

impl FeatureBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            labels: Labels::new(),
        }
    }

    /// Replace the feature labels.
    #[must_use]
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    /// Add or overwrite one label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Append a setup step.
    #[must_use]
    pub fn setup<F>(mut self, func: F) -> Self
    where
        F: Fn(Context, &mut TestHandle, &Config) -> Context + Send + Sync + 'static,
    {
        let name = format!("{}-setup", self.name);
        self.steps.push(Step::new(name, Level::Setup, func));
        self
    }

    /// Append a named assessment.
    #[must_use]
    pub fn assess<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Context, &mut TestHandle, &Config) -> Context + Send + Sync + 'static,
    {
        self.steps.push(Step::new(name, Level::Assess, func));
        self
    }

    /// Append a teardown step.
    #[must_use]
    pub fn teardown<F>(mut self, func: F) -> Self
    where
        F: Fn(Context, &mut TestHandle, &Config) -> Context + Send + Sync + 'static,
    {
        let name = format!("{}-teardown", self.name);
        self.steps.push(Step::new(name, Level::Teardown, func));
        self
    }

    /// Freeze the builder.
    pub fn feature(self) -> Feature {
        Feature {
            name: self.name,
            steps: self.steps,
            labels: self.labels,
        }
    }
}
