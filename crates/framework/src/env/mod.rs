//! The test environment: ordered hooks around features.
//!
//! An [`Environment`] owns the current [`Context`], the [`Config`] and an
//! append-only log of [`Action`]s. Hooks are registered per [`Role`]:
//!
//! | Role | Runs |
//! |---|---|
//! | `Setup` | once, before the runner, from [`Environment::run`] |
//! | `BeforeEachTest` / `AfterEachTest` | around every [`Environment::test`] call |
//! | `BeforeEachFeature` / `AfterEachFeature` | around every feature of a test |
//! | `Finish` | once, after the runner, from [`Environment::run`] |
//!
//! Every hook and step receives the newest context and hands back the next
//! one. Nothing runs concurrently.

mod action;

pub use action::{Action, EnvFunc, Hook, Role, TestEnvFunc};

use crate::context::Context;
use crate::envconf::Config;
use crate::features::{Feature, Level};
use crate::testing::TestHandle;
use thiserror::Error;
use tracing::{debug, error, info};

/// Suite-level failures returned by [`Environment::run`].
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{role} failure: {source}")]
    SetupFailure {
        role: Role,
        #[source]
        source: anyhow::Error,
    },
}

/// Lifecycle engine for a suite of feature tests.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    ctx: Context,
    cfg: Config,
    actions: Vec<Action>,
}

impl Environment {
    /// Environment with an empty context and an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(cfg: Config) -> Self {
        Self {
            cfg,
            ..Self::default()
        }
    }

    pub fn with_context(ctx: Context, cfg: Config) -> Self {
        Self {
            ctx,
            cfg,
            actions: Vec::new(),
        }
    }

    /// Environment that talks to the cluster it runs in.
    pub fn in_cluster() -> Self {
        Self::with_config(Config::in_cluster())
    }

    /// Copy of this environment, with the same hooks and config, starting
    /// from `ctx`.
    pub fn derive_with_context(&self, ctx: Context) -> Self {
        Self {
            ctx,
            cfg: self.cfg.clone(),
            actions: self.actions.clone(),
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.cfg
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Append `hooks` under `role`. An empty list changes nothing.
    pub fn register(&mut self, role: Role, hooks: impl IntoIterator<Item = Hook>) -> &mut Self {
        let hooks: Vec<Hook> = hooks.into_iter().collect();
        if hooks.is_empty() {
            return self;
        }
        debug!(target: "e2e.env", role = %role, hooks = hooks.len(), "Registering action");
        self.actions.push(Action::new(role, hooks));
        self
    }

    /// Hooks run once before any test.
    pub fn setup(&mut self, hooks: impl IntoIterator<Item = Hook>) -> &mut Self {
        self.register(Role::Setup, hooks)
    }

    pub fn before_each_test(&mut self, hooks: impl IntoIterator<Item = Hook>) -> &mut Self {
        self.register(Role::BeforeEachTest, hooks)
    }

    pub fn before_each_feature(&mut self, hooks: impl IntoIterator<Item = Hook>) -> &mut Self {
        self.register(Role::BeforeEachFeature, hooks)
    }

    pub fn after_each_feature(&mut self, hooks: impl IntoIterator<Item = Hook>) -> &mut Self {
        self.register(Role::AfterEachFeature, hooks)
    }

    pub fn after_each_test(&mut self, hooks: impl IntoIterator<Item = Hook>) -> &mut Self {
        self.register(Role::AfterEachTest, hooks)
    }

    /// Hooks run once after the runner returns.
    pub fn finish(&mut self, hooks: impl IntoIterator<Item = Hook>) -> &mut Self {
        self.register(Role::Finish, hooks)
    }

    /// Registered actions of `role`, in registration order.
    pub fn actions_by_role(&self, role: Role) -> Vec<&Action> {
        self.actions.iter().filter(|a| a.role() == role).collect()
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Run `features` as one test.
    ///
    /// A failing hook fails `t` with a message naming its role and stops the
    /// test. Steps report through `t`; a feature whose setup halts `t` skips
    /// its assessments but still tears down.
    pub fn test(&mut self, t: &mut TestHandle, features: &[Feature]) {
        if features.is_empty() {
            t.log("No test features provided, skipping test");
            return;
        }

        if !self.run_test_role(Role::BeforeEachTest, t) {
            return;
        }

        for feature in features {
            if !self.run_test_role(Role::BeforeEachFeature, t) {
                return;
            }
            self.exec_feature(t, feature);
            if !self.run_test_role(Role::AfterEachFeature, t) {
                return;
            }
        }

        self.run_test_role(Role::AfterEachTest, t);
    }

    /// Run every action of a test-scoped role.
    ///
    /// Returns false once a hook errors or halts `t` through `fatal`/`skip`.
    fn run_test_role(&mut self, role: Role, t: &mut TestHandle) -> bool {
        for action in self.actions.iter().filter(|a| a.role() == role) {
            if let Err(err) = action.run(&mut self.ctx, &mut self.cfg, Some(&mut *t)) {
                t.fatal(format!("{role} failure: {err:#}"));
                return false;
            }
            if t.halted() {
                debug!(target: "e2e.env", role = %role, test = %t.name(), "Test halted by hook");
                return false;
            }
        }
        true
    }

    fn exec_feature(&mut self, t: &mut TestHandle, feature: &Feature) {
        let name = feature.name();
        let cfg = &self.cfg;
        let ctx = &mut self.ctx;

        debug!(target: "e2e.env", feature = %name, "Feature started");
        t.run(name, |t| {
            if !cfg.matches_feature(name) {
                info!(target: "e2e.env", feature = %name, "Feature skipped by name filter");
                t.skip(format!("Skipping feature \"{name}\": name not matched"));
                return;
            }
            if !cfg.matches_labels(feature.labels()) {
                info!(target: "e2e.env", feature = %name, "Feature skipped by label filter");
                t.skip(format!("Skipping feature \"{name}\": labels not matched"));
                return;
            }

            for step in feature.steps_by_level(Level::Setup) {
                *ctx = step.call(ctx.clone(), t, cfg);
                if t.halted() {
                    debug!(target: "e2e.env", feature = %name, step = %step.name(), "Setup halted");
                    break;
                }
            }

            if !t.halted() {
                for assess in feature.steps_by_level(Level::Assess) {
                    let assess_name = assess.name();
                    t.run(assess_name, |t| {
                        if !cfg.matches_assessment(assess_name) {
                            info!(
                                target: "e2e.env",
                                feature = %name,
                                assessment = %assess_name,
                                "Assessment skipped by name filter"
                            );
                            t.skip(format!(
                                "Skipping assessment \"{assess_name}\": name not matched"
                            ));
                            return;
                        }
                        *ctx = assess.call(ctx.clone(), t, cfg);
                    });
                }
            }

            for teardown in feature.steps_by_level(Level::Teardown) {
                *ctx = teardown.call(ctx.clone(), t, cfg);
            }
        });
        debug!(target: "e2e.env", feature = %name, "Feature finished");
    }

    /// Run the suite: `Setup` actions, then `runner`, then `Finish` actions.
    ///
    /// A failing `Setup` action stops the run before `runner` is called.
    /// `Finish` actions all run whatever the runner returned; their failures
    /// are logged and do not change the returned exit code.
    pub fn run<F>(mut self, runner: F) -> Result<i32, EnvError>
    where
        F: FnOnce(&mut Environment) -> i32,
    {
        let setups = self.actions_by_role(Role::Setup).len();
        info!(target: "e2e.env", setups, "Running environment setup");

        for action in self.actions.iter().filter(|a| a.role() == Role::Setup) {
            action
                .run(&mut self.ctx, &mut self.cfg, None)
                .map_err(|source| {
                    error!(target: "e2e.env", error = %source, "Setup failed, tests not run");
                    EnvError::SetupFailure {
                        role: Role::Setup,
                        source,
                    }
                })?;
        }

        let exit_code = runner(&mut self);
        info!(target: "e2e.env", exit_code, "Test runner finished");

        for action in self.actions.iter().filter(|a| a.role() == Role::Finish) {
            if let Err(err) = action.run(&mut self.ctx, &mut self.cfg, None) {
                error!(target: "e2e.env", error = %err, "Finish action failed");
            }
        }

        Ok(exit_code)
    }

    /// [`Environment::run`], then exit the process with its status.
    ///
    /// A setup failure exits with status 1.
    pub fn run_and_exit<F>(self, runner: F) -> !
    where
        F: FnOnce(&mut Environment) -> i32,
    {
        let code = match self.run(runner) {
            Ok(code) => code,
            Err(err) => {
                error!(target: "e2e.env", error = %err, "Environment run aborted");
                1
            }
        };
        std::process::exit(code)
    }
}
