//! A fresh namespace for every top-level test.
//!
//! `before_each_test` creates a randomly named namespace, points the
//! configuration at it and records it in the context under the test's name.
//! `after_each_test` deletes it again.

use super::kubectl::Kubectl;
use anyhow::Context as _;
use e2e_framework::{random_name, ContextKey, Hook};
use e2e_providers::{CommandExecutor, SystemExecutor};
use std::sync::Arc;

const NAMESPACE_NAME_LENGTH: usize = 10;

/// Context key holding the namespace created for `test`.
pub fn namespace_key(test: &str) -> ContextKey<String> {
    ContextKey::named(format!("NS-for-{test}"))
}

#[derive(Clone)]
pub struct NamespaceFixture {
    run_id: String,
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for NamespaceFixture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceFixture")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl NamespaceFixture {
    /// Namespaces are named `{run_id}-{random}`.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self::with_executor(run_id, Arc::new(SystemExecutor::new()))
    }

    pub fn with_executor(run_id: impl Into<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            run_id: run_id.into(),
            executor,
        }
    }

    pub fn before_each_test(&self) -> Hook {
        let fixture = self.clone();
        Hook::test(move |ctx, cfg, t| {
            let name = random_name(&fixture.run_id, NAMESPACE_NAME_LENGTH);
            t.log(format!("Creating namespace {name} for test {}", t.name()));

            Kubectl::new(fixture.executor.clone(), cfg)
                .create_namespace(&name)
                .with_context(|| format!("creating namespace for {}", t.name()))?;
            cfg.with_namespace(name.clone());
            Ok(ctx.with_value(&namespace_key(t.name()), name))
        })
    }

    pub fn after_each_test(&self) -> Hook {
        let fixture = self.clone();
        Hook::test(move |ctx, cfg, t| {
            let key = namespace_key(t.name());
            let name = ctx
                .cloned(&key)
                .with_context(|| format!("no namespace recorded for {}", t.name()))?;
            t.log(format!("Deleting namespace {name} for test {}", t.name()));

            Kubectl::new(fixture.executor.clone(), cfg).delete_namespace(&name)?;
            Ok(ctx.without(&key))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2e_framework::{Environment, FeatureBuilder, Outcome, TestHandle};
    use e2e_providers::{CommandOutput, ScriptedExecutor};

    fn environment(exec: &Arc<ScriptedExecutor>) -> Environment {
        let fixture = NamespaceFixture::with_executor("e2e", exec.clone());
        let mut env = Environment::new();
        env.before_each_test([fixture.before_each_test()])
            .after_each_test([fixture.after_each_test()]);
        env
    }

    #[test]
    fn test_namespace_created_and_deleted() {
        let exec = Arc::new(ScriptedExecutor::new());
        let mut env = environment(&exec);

        let feature = FeatureBuilder::new("uses namespace")
            .assess("namespace configured", |ctx, t, cfg| {
                if !cfg.namespace().starts_with("e2e-") {
                    t.error(format!("unexpected namespace {}", cfg.namespace()));
                }
                ctx
            })
            .feature();
        let mut t = TestHandle::new("TestNamespace");
        env.test(&mut t, &[feature]);
        let report = t.finish();

        assert_eq!(report.outcome, Outcome::Passed);
        let calls = exec.calls();
        assert_eq!(calls.len(), 2);
        let created = calls.first().unwrap().strip_prefix("kubectl create namespace ").unwrap();
        assert_eq!(created.len(), NAMESPACE_NAME_LENGTH);
        assert_eq!(
            calls.last().unwrap(),
            &format!("kubectl delete namespace {created} --ignore-not-found")
        );
        assert!(!env.context().contains("NS-for-TestNamespace"));
    }

    /// Refuses every `create`.
    struct ForbiddenCreate;

    impl CommandExecutor for ForbiddenCreate {
        fn run(&self, _program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
            if args.first().map(String::as_str) == Some("create") {
                Ok(CommandOutput::failed(1, "namespaces is forbidden"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        }

        fn which(&self, _program: &str) -> Option<std::path::PathBuf> {
            None
        }
    }

    #[test]
    fn test_create_failure_fails_test() {
        let fixture = NamespaceFixture::with_executor("e2e", Arc::new(ForbiddenCreate));
        let mut env = Environment::new();
        env.before_each_test([fixture.before_each_test()]);

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = ran.clone();
        let feature = FeatureBuilder::new("never runs")
            .assess("unreachable", move |ctx, _, _| {
                seen.store(true, std::sync::atomic::Ordering::SeqCst);
                ctx
            })
            .feature();

        let mut t = TestHandle::new("TestForbidden");
        env.test(&mut t, &[feature]);
        let report = t.finish();

        assert_eq!(report.outcome, Outcome::Failed);
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(report
            .messages
            .iter()
            .any(|m| m.contains("BeforeEachTest failure") && m.contains("forbidden")));
    }
}
