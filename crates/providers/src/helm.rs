//! Thin wrapper around the `helm` CLI.
//!
//! Every operation builds one command line of the form
//!
//! ```text
//! helm <op> [name] [release|chart] --namespace <ns> [--version v] [--wait]
//!      [--timeout t] [args..] --kubeconfig <path>
//! ```
//!
//! and runs it through a [`CommandExecutor`]. Failures come back as
//! [`HelmError`]; nothing is retried.

use crate::exec::{display_command, CommandExecutor, CommandOutput, SystemExecutor};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

const HELM: &str = "helm";

/// Helm errors.
#[derive(Debug, Error)]
pub enum HelmError {
    #[error("helm is not installed or not on the search path")]
    NotInstalled,

    #[error("Failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{command}' failed: {output}")]
    Failed { command: String, output: String },
}

/// Options for one helm invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelmOption {
    Name(String),
    Namespace(String),
    ReleaseName(String),
    Chart(String),
    Version(String),
    Args(Vec<String>),
    Wait,
    Timeout(String),
}

pub fn with_name(name: impl Into<String>) -> HelmOption {
    HelmOption::Name(name.into())
}

pub fn with_namespace(namespace: impl Into<String>) -> HelmOption {
    HelmOption::Namespace(namespace.into())
}

/// Chart reference in `repo/chart` form.
pub fn with_release_name(release: impl Into<String>) -> HelmOption {
    HelmOption::ReleaseName(release.into())
}

/// Local chart directory or archive.
pub fn with_chart(chart: impl Into<String>) -> HelmOption {
    HelmOption::Chart(chart.into())
}

pub fn with_version(version: impl Into<String>) -> HelmOption {
    HelmOption::Version(version.into())
}

pub fn with_args<I, S>(args: I) -> HelmOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    HelmOption::Args(args.into_iter().map(Into::into).collect())
}

pub fn with_wait() -> HelmOption {
    HelmOption::Wait
}

/// Duration string such as `10m`.
pub fn with_timeout(timeout: impl Into<String>) -> HelmOption {
    HelmOption::Timeout(timeout.into())
}

#[derive(Debug, Default)]
struct HelmOpts {
    name: String,
    namespace: String,
    release_name: String,
    chart: String,
    version: String,
    args: Vec<String>,
    wait: bool,
    timeout: String,
}

impl HelmOpts {
    fn from_options(opts: &[HelmOption]) -> Self {
        let mut resolved = Self::default();
        for opt in opts {
            match opt {
                HelmOption::Name(v) => resolved.name = v.clone(),
                HelmOption::Namespace(v) => resolved.namespace = v.clone(),
                HelmOption::ReleaseName(v) => resolved.release_name = v.clone(),
                HelmOption::Chart(v) => resolved.chart = v.clone(),
                HelmOption::Version(v) => resolved.version = v.clone(),
                HelmOption::Args(v) => resolved.args.extend(v.iter().cloned()),
                HelmOption::Wait => resolved.wait = true,
                HelmOption::Timeout(v) => resolved.timeout = v.clone(),
            }
        }
        resolved
    }
}

/// Runs helm against one cluster.
#[derive(Clone)]
pub struct HelmManager {
    kubeconfig: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl std::fmt::Debug for HelmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelmManager")
            .field("kubeconfig", &self.kubeconfig)
            .finish_non_exhaustive()
    }
}

impl HelmManager {
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self::with_executor(kubeconfig, Arc::new(SystemExecutor::new()))
    }

    pub fn with_executor(
        kubeconfig: impl Into<PathBuf>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            executor,
        }
    }

    /// `helm repo ...`; pass the subcommand through [`with_args`].
    pub fn run_repo(&self, opts: &[HelmOption]) -> Result<CommandOutput, HelmError> {
        self.run("repo", opts)
    }

    pub fn run_install(&self, opts: &[HelmOption]) -> Result<CommandOutput, HelmError> {
        self.run("install", opts)
    }

    pub fn run_upgrade(&self, opts: &[HelmOption]) -> Result<CommandOutput, HelmError> {
        self.run("upgrade", opts)
    }

    /// `helm test`, which runs the chart's test hooks.
    pub fn run_test(&self, opts: &[HelmOption]) -> Result<CommandOutput, HelmError> {
        self.run("test", opts)
    }

    pub fn run_uninstall(&self, opts: &[HelmOption]) -> Result<CommandOutput, HelmError> {
        self.run("uninstall", opts)
    }

    /// Arguments for `helm <operation>`.
    pub fn command_args(&self, operation: &str, opts: &[HelmOption]) -> Vec<String> {
        let opts = HelmOpts::from_options(opts);
        let mut args = vec![operation.to_string()];

        if !opts.name.is_empty() {
            args.push(opts.name);
        }
        if !opts.release_name.is_empty() {
            args.push(opts.release_name);
        } else if !opts.chart.is_empty() {
            args.push(opts.chart);
        }
        if !opts.namespace.is_empty() {
            args.push("--namespace".to_string());
            args.push(opts.namespace);
        }
        if !opts.version.is_empty() {
            args.push("--version".to_string());
            args.push(opts.version);
        }
        if opts.wait {
            args.push("--wait".to_string());
            if !opts.timeout.is_empty() {
                args.push("--timeout".to_string());
                args.push(opts.timeout);
            }
        }
        args.extend(opts.args);
        args.push("--kubeconfig".to_string());
        args.push(self.kubeconfig.display().to_string());
        args
    }

    fn run(&self, operation: &str, opts: &[HelmOption]) -> Result<CommandOutput, HelmError> {
        if self.executor.which(HELM).is_none() {
            return Err(HelmError::NotInstalled);
        }

        let args = self.command_args(operation, opts);
        let command = display_command(HELM, &args);
        info!(target: "e2e.helm", operation = %operation, "Running helm");

        let output = self
            .executor
            .run(HELM, &args)
            .map_err(|source| HelmError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.success() {
            return Err(HelmError::Failed {
                command,
                output: output.combined(),
            });
        }

        debug!(target: "e2e.helm", command = %command, "helm finished");
        Ok(output)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::exec::ScriptedExecutor;

    fn manager() -> (HelmManager, Arc<ScriptedExecutor>) {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.install("helm");
        (
            HelmManager::with_executor("/tmp/kubecfg", exec.clone()),
            exec,
        )
    }

    #[test]
    fn test_install_from_repo() {
        let (helm, exec) = manager();
        helm.run_install(&[
            with_name("nginx"),
            with_namespace("e2e"),
            with_release_name("nginx-stable/nginx-ingress"),
        ])
        .unwrap();

        assert_eq!(
            exec.calls(),
            vec![
                "helm install nginx nginx-stable/nginx-ingress --namespace e2e --kubeconfig /tmp/kubecfg"
            ]
        );
    }

    #[test]
    fn test_install_local_chart_with_wait() {
        let (helm, _) = manager();
        let args = helm.command_args(
            "install",
            &[
                with_name("example"),
                with_chart("testdata/example_chart"),
                with_namespace("e2e"),
                with_version("1.2.3"),
                with_wait(),
                with_timeout("10m"),
            ],
        );

        assert_eq!(
            args.join(" "),
            "install example testdata/example_chart --namespace e2e --version 1.2.3 \
             --wait --timeout 10m --kubeconfig /tmp/kubecfg"
        );
    }

    #[test]
    fn test_timeout_without_wait_is_ignored() {
        let (helm, _) = manager();
        let args = helm.command_args("upgrade", &[with_name("x"), with_timeout("5m")]);
        assert!(!args.contains(&"--timeout".to_string()));
    }

    #[test]
    fn test_repo_args() {
        let (helm, exec) = manager();
        helm.run_repo(&[with_args(["add", "nginx-stable", "https://helm.nginx.com/stable"])])
            .unwrap();
        helm.run_repo(&[with_args(["update"])]).unwrap();

        assert_eq!(
            exec.calls(),
            vec![
                "helm repo add nginx-stable https://helm.nginx.com/stable --kubeconfig /tmp/kubecfg",
                "helm repo update --kubeconfig /tmp/kubecfg",
            ]
        );
    }

    #[test]
    fn test_failure_is_error() {
        let (helm, exec) = manager();
        exec.respond(
            "helm test example --namespace e2e --kubeconfig /tmp/kubecfg",
            CommandOutput::failed(1, "test pod failed"),
        );

        let err = helm
            .run_test(&[with_name("example"), with_namespace("e2e")])
            .unwrap_err();
        assert!(matches!(err, HelmError::Failed { ref output, .. } if output == "test pod failed"));
    }

    #[test]
    fn test_missing_helm() {
        let helm = HelmManager::with_executor("/tmp/kubecfg", Arc::new(ScriptedExecutor::new()));
        assert!(matches!(
            helm.run_uninstall(&[with_name("x")]),
            Err(HelmError::NotInstalled)
        ));
    }
}
