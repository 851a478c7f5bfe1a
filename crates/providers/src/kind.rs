//! Local clusters with [kind](https://kind.sigs.k8s.io).

use crate::exec::{display_command, CommandExecutor, CommandOutput, SystemExecutor};
use crate::provider::{ClusterConfig, ClusterProvider, CreateOption, ProviderError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Name the provider is registered under.
pub const PROVIDER_NAME: &str = "kind";

const KIND: &str = "kind";
const KIND_PACKAGE: &str = "sigs.k8s.io/kind";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

/// A kind cluster driven through the `kind` CLI.
///
/// `kind` is installed with `go install` when it is not on the search path.
/// Creating a cluster that already exists reuses it.
pub struct KindCluster {
    executor: Arc<dyn CommandExecutor>,
    config: Mutex<ClusterConfig>,
    kubeconfig: Mutex<Option<NamedTempFile>>,
}

impl std::fmt::Debug for KindCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KindCluster")
            .field("config", &*lock(&self.config))
            .field(
                "kubeconfig",
                &lock(&self.kubeconfig).as_ref().map(NamedTempFile::path),
            )
            .finish_non_exhaustive()
    }
}

impl Default for KindCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl KindCluster {
    pub fn new() -> Self {
        Self::with_executor(Arc::new(SystemExecutor::new()))
    }

    pub fn with_executor(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            config: Mutex::new(ClusterConfig::default()),
            kubeconfig: Mutex::new(None),
        }
    }

    /// Boxed generator for a provider registry.
    pub fn generator() -> Box<dyn ClusterProvider> {
        Box::new(Self::new())
    }

    /// Snapshot of the current settings.
    pub fn config(&self) -> ClusterConfig {
        lock(&self.config).clone()
    }

    fn name(&self, operation: &'static str) -> Result<String, ProviderError> {
        let name = lock(&self.config).name.clone();
        if name.is_empty() {
            return Err(ProviderError::MissingName { operation });
        }
        Ok(name)
    }

    /// Run a command and require it to succeed.
    fn run(&self, program: &str, args: Vec<String>) -> Result<CommandOutput, ProviderError> {
        let command = display_command(program, &args);
        let output = self
            .executor
            .run(program, &args)
            .map_err(|source| ProviderError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.success() {
            return Err(ProviderError::failed(command, &output));
        }
        Ok(output)
    }

    fn install_if_required(&self) -> Result<(), ProviderError> {
        if self.executor.which(KIND).is_some() {
            return Ok(());
        }

        let version = match lock(&self.config).kubernetes_version.as_str() {
            "" => "latest".to_string(),
            v => v.to_string(),
        };
        info!(target: "e2e.kind", version = %version, "kind not found, installing with go install");
        let package = format!("{KIND_PACKAGE}@{version}");
        self.run("go", args(["install", package.as_str()]))?;

        match self.executor.which(KIND) {
            Some(path) => {
                debug!(target: "e2e.kind", path = %path.display(), "Installed kind");
                Ok(())
            }
            None => Err(ProviderError::NotInstalled {
                program: KIND.to_string(),
            }),
        }
    }

    /// Output of `kind get clusters` and whether `name` is listed in it.
    fn cluster_exists(&self, name: &str) -> Result<(String, bool), ProviderError> {
        let output = self.run(KIND, args(["get", "clusters"]))?;
        let exists = output.stdout.lines().any(|line| line.trim() == name);
        Ok((output.stdout, exists))
    }

    fn save_kubeconfig(&self, name: &str) -> Result<NamedTempFile, ProviderError> {
        let output = self.run(KIND, args(["get", "kubeconfig", "--name", name]))?;
        if output.stdout.trim().is_empty() {
            return Err(ProviderError::MissingKubeconfig {
                name: name.to_string(),
            });
        }

        let mut file = tempfile::Builder::new()
            .prefix(&format!("kind-cluster-{name}-kubecfg"))
            .tempfile()
            .map_err(ProviderError::Kubeconfig)?;
        file.write_all(output.stdout.as_bytes())
            .map_err(ProviderError::Kubeconfig)?;
        file.flush().map_err(ProviderError::Kubeconfig)?;

        debug!(
            target: "e2e.kind",
            cluster = %name,
            path = %file.path().display(),
            "Saved kubeconfig"
        );
        Ok(file)
    }
}

impl ClusterProvider for KindCluster {
    fn create(&self, opts: &[CreateOption]) -> Result<PathBuf, ProviderError> {
        lock(&self.config).apply(opts);
        let name = self.name("create")?;

        self.install_if_required()?;
        if self.cluster_exists(&name)?.1 {
            info!(target: "e2e.kind", cluster = %name, "Cluster already exists, reusing it");
            return self.kubeconfig();
        }

        let mut command = args(["create", "cluster", "--name", name.as_str()]);
        let config = self.config();
        if !config.init_config.is_empty() {
            command.push("--config".to_string());
            command.push(config.init_config);
        }
        command.extend(config.args);

        info!(target: "e2e.kind", cluster = %name, "Creating kind cluster");
        self.run(KIND, command)?;

        let (clusters, exists) = self.cluster_exists(&name)?;
        if !exists {
            return Err(ProviderError::ClusterMissing {
                name,
                clusters: clusters.trim().to_string(),
            });
        }
        self.kubeconfig()
    }

    fn destroy(&self) -> Result<(), ProviderError> {
        let name = self.name("destroy")?;
        info!(target: "e2e.kind", cluster = %name, "Destroying kind cluster");

        self.install_if_required()?;
        self.run(KIND, args(["delete", "cluster", "--name", name.as_str()]))?;

        if let Some(file) = lock(&self.kubeconfig).take() {
            debug!(target: "e2e.kind", path = %file.path().display(), "Removing kubeconfig file");
            file.close().map_err(ProviderError::Kubeconfig)?;
        }
        Ok(())
    }

    fn kubeconfig(&self) -> Result<PathBuf, ProviderError> {
        let name = self.name("fetching the kubeconfig")?;
        let mut cached = lock(&self.kubeconfig);
        if let Some(file) = cached.as_ref() {
            return Ok(file.path().to_path_buf());
        }

        let file = self.save_kubeconfig(&name)?;
        let path = file.path().to_path_buf();
        *cached = Some(file);
        Ok(path)
    }

    fn kube_context(&self) -> String {
        format!("kind-{}", lock(&self.config).name)
    }

    fn load_image(&self, image: &str) -> Result<(), ProviderError> {
        let name = self.name("loading an image")?;
        self.run(KIND, args(["load", "docker-image", "--name", name.as_str(), image]))?;
        Ok(())
    }

    fn load_image_archive(&self, archive: &Path) -> Result<(), ProviderError> {
        let name = self.name("loading an image archive")?;
        let archive = archive.display().to_string();
        self.run(KIND, args(["load", "image-archive", "--name", name.as_str(), archive.as_str()]))?;
        Ok(())
    }
}
