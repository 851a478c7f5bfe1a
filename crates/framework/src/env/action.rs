//! Environment hooks and the roles they are registered under.

use crate::context::Context;
use crate::envconf::Config;
use crate::testing::TestHandle;
use anyhow::anyhow;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Occasion at which an [`Action`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Setup,
    BeforeEachTest,
    BeforeEachFeature,
    AfterEachFeature,
    AfterEachTest,
    Finish,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Setup,
        Role::BeforeEachTest,
        Role::BeforeEachFeature,
        Role::AfterEachFeature,
        Role::AfterEachTest,
        Role::Finish,
    ];

    /// Whether hooks of this role run inside a test.
    pub fn is_test_scoped(self) -> bool {
        !matches!(self, Role::Setup | Role::Finish)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Setup => "Setup",
            Role::BeforeEachTest => "BeforeEachTest",
            Role::BeforeEachFeature => "BeforeEachFeature",
            Role::AfterEachFeature => "AfterEachFeature",
            Role::AfterEachTest => "AfterEachTest",
            Role::Finish => "Finish",
        };
        f.write_str(name)
    }
}

/// Hook that only needs the context and configuration.
pub type EnvFunc = Arc<dyn Fn(Context, &mut Config) -> anyhow::Result<Context> + Send + Sync>;

/// Hook that also reports through the handle of the test it runs in.
pub type TestEnvFunc =
    Arc<dyn Fn(Context, &mut Config, &mut TestHandle) -> anyhow::Result<Context> + Send + Sync>;

/// A registered hook.
#[derive(Clone)]
pub enum Hook {
    Env(EnvFunc),
    Test(TestEnvFunc),
}

impl Hook {
    pub fn env<F>(func: F) -> Self
    where
        F: Fn(Context, &mut Config) -> anyhow::Result<Context> + Send + Sync + 'static,
    {
        Hook::Env(Arc::new(func))
    }

    pub fn test<F>(func: F) -> Self
    where
        F: Fn(Context, &mut Config, &mut TestHandle) -> anyhow::Result<Context>
            + Send
            + Sync
            + 'static,
    {
        Hook::Test(Arc::new(func))
    }

    /// Invoke the hook.
    ///
    /// A test hook called outside of a test (from `Setup` or `Finish`) gets a
    /// handle of its own, named after `role`. Failing that handle counts as a
    /// hook error.
    fn call(
        &self,
        role: Role,
        ctx: Context,
        cfg: &mut Config,
        t: Option<&mut TestHandle>,
    ) -> anyhow::Result<Context> {
        match (self, t) {
            (Hook::Env(func), _) => func(ctx, cfg),
            (Hook::Test(func), Some(t)) => func(ctx, cfg, t),
            (Hook::Test(func), None) => {
                let mut own = TestHandle::new(role.to_string());
                let next = func(ctx, cfg, &mut own)?;
                let report = own.finish();
                if report.outcome == crate::testing::Outcome::Failed {
                    return Err(anyhow!("{}", report.messages.join("; ")));
                }
                Ok(next)
            }
        }
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hook::Env(_) => f.write_str("Hook::Env"),
            Hook::Test(_) => f.write_str("Hook::Test"),
        }
    }
}

/// One registration: a role and the hooks passed with it.
#[derive(Debug, Clone)]
pub struct Action {
    role: Role,
    hooks: Vec<Hook>,
}

impl Action {
    pub fn new(role: Role, hooks: Vec<Hook>) -> Self {
        Self { role, hooks }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    /// Run the hooks in order, replacing `ctx` after each success.
    ///
    /// Stops at the first failing hook. `ctx` then holds the context that
    /// hook was given. Also stops, without an error, once a hook halts `t`.
    pub fn run(
        &self,
        ctx: &mut Context,
        cfg: &mut Config,
        mut t: Option<&mut TestHandle>,
    ) -> anyhow::Result<()> {
        for (index, hook) in self.hooks.iter().enumerate() {
            debug!(target: "e2e.env", role = %self.role, hook = index, "Running hook");
            let next = hook.call(self.role, ctx.clone(), cfg, t.as_deref_mut())?;
            *ctx = next;
            if t.as_deref().is_some_and(TestHandle::halted) {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::ContextKey;

    const STEPS: ContextKey<u32> = ContextKey::new("steps");

    fn bump(ctx: Context, _cfg: &mut Config) -> anyhow::Result<Context> {
        let n = ctx.cloned(&STEPS).unwrap_or(0);
        Ok(ctx.with_value(&STEPS, n + 1))
    }

    #[test]
    fn test_role_display_and_scope() {
        assert_eq!(Role::BeforeEachFeature.to_string(), "BeforeEachFeature");
        assert!(!Role::Setup.is_test_scoped());
        assert!(!Role::Finish.is_test_scoped());
        assert!(Role::AfterEachTest.is_test_scoped());
    }

    #[test]
    fn test_action_threads_context() {
        let action = Action::new(Role::Setup, vec![Hook::env(bump), Hook::env(bump)]);
        let mut ctx = Context::new();
        let mut cfg = Config::new();

        action.run(&mut ctx, &mut cfg, None).unwrap();
        assert_eq!(ctx.cloned(&STEPS).unwrap(), 2);
    }

    #[test]
    fn test_failing_hook_keeps_previous_context() {
        let action = Action::new(
            Role::Setup,
            vec![
                Hook::env(bump),
                Hook::env(|_ctx, _cfg| Err(anyhow!("cluster unavailable"))),
                Hook::env(bump),
            ],
        );
        let mut ctx = Context::new();
        let mut cfg = Config::new();

        let err = action.run(&mut ctx, &mut cfg, None).unwrap_err();
        assert_eq!(err.to_string(), "cluster unavailable");
        assert_eq!(ctx.cloned(&STEPS).unwrap(), 1);
    }

    #[test]
    fn test_hooks_may_change_config() {
        let action = Action::new(
            Role::Setup,
            vec![Hook::env(|ctx, cfg| {
                cfg.with_namespace("from-hook");
                Ok(ctx)
            })],
        );
        let mut ctx = Context::new();
        let mut cfg = Config::new();

        action.run(&mut ctx, &mut cfg, None).unwrap();
        assert_eq!(cfg.namespace(), "from-hook");
    }

    #[test]
    fn test_test_hook_outside_test_gets_own_handle() {
        let failing = Action::new(
            Role::Finish,
            vec![Hook::test(|ctx, _cfg, t| {
                t.error("left resources behind");
                Ok(ctx)
            })],
        );
        let mut ctx = Context::new();
        let mut cfg = Config::new();

        let err = failing.run(&mut ctx, &mut cfg, None).unwrap_err();
        assert!(err.to_string().contains("left resources behind"));
    }

    #[test]
    fn test_test_hook_reports_on_given_handle() {
        let action = Action::new(
            Role::BeforeEachTest,
            vec![Hook::test(|ctx, _cfg, t| {
                t.log(format!("preparing {}", t.name()));
                Ok(ctx)
            })],
        );
        let mut ctx = Context::new();
        let mut cfg = Config::new();
        let mut t = TestHandle::new("TestHooks");

        action.run(&mut ctx, &mut cfg, Some(&mut t)).unwrap();
        assert_eq!(t.finish().messages, vec!["preparing TestHooks"]);
    }

    #[test]
    fn test_halting_hook_stops_later_hooks() {
        let action = Action::new(
            Role::BeforeEachTest,
            vec![
                Hook::env(bump),
                Hook::test(|ctx, _cfg, t| {
                    t.fatal("no capacity");
                    Ok(ctx)
                }),
                Hook::env(bump),
            ],
        );
        let mut ctx = Context::new();
        let mut cfg = Config::new();
        let mut t = TestHandle::new("TestHalt");

        action.run(&mut ctx, &mut cfg, Some(&mut t)).unwrap();
        assert_eq!(ctx.cloned(&STEPS).unwrap(), 1);
        assert!(t.halted());
    }
}
