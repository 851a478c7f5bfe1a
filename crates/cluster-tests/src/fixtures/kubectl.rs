//! Minimal `kubectl` wrapper.

use anyhow::{bail, Context as _};
use e2e_framework::Config;
use e2e_providers::exec::display_command;
use e2e_providers::CommandExecutor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const KUBECTL: &str = "kubectl";

/// Runs `kubectl` against the cluster a [`Config`] points at.
#[derive(Clone)]
pub struct Kubectl {
    executor: Arc<dyn CommandExecutor>,
    kubeconfig: Option<PathBuf>,
}

impl std::fmt::Debug for Kubectl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kubectl")
            .field("kubeconfig", &self.kubeconfig)
            .finish_non_exhaustive()
    }
}

impl Kubectl {
    /// Without a kubeconfig file (in-cluster runs) kubectl falls back to its
    /// own discovery.
    pub fn new(executor: Arc<dyn CommandExecutor>, cfg: &Config) -> Self {
        Self {
            executor,
            kubeconfig: cfg.kubeconfig_file().map(Path::to_path_buf),
        }
    }

    pub fn create_namespace(&self, name: &str) -> anyhow::Result<()> {
        self.run(["create", "namespace", name])
    }

    pub fn delete_namespace(&self, name: &str) -> anyhow::Result<()> {
        self.run(["delete", "namespace", name, "--ignore-not-found"])
    }

    pub fn apply(&self, manifest: &Path) -> anyhow::Result<()> {
        let manifest = manifest.display().to_string();
        self.run(["apply", "-f", manifest.as_str()])
    }

    fn run<const N: usize>(&self, args: [&str; N]) -> anyhow::Result<()> {
        let mut full: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
        if let Some(path) = &self.kubeconfig {
            full.push("--kubeconfig".to_string());
            full.push(path.display().to_string());
        }

        let command = display_command(KUBECTL, &full);
        debug!(target: "e2e.kubectl", command = %command, "Running kubectl");
        let output = self
            .executor
            .run(KUBECTL, &full)
            .with_context(|| format!("starting '{command}'"))?;
        if !output.success() {
            bail!("'{command}' failed: {}", output.combined());
        }
        Ok(())
    }
}
