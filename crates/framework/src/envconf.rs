//! Environment configuration.
//!
//! A [`Config`] carries everything hooks and steps need to reach the cluster
//! under test: where the connection comes from (kubeconfig file, explicit
//! client or in-cluster service account), the target namespace, and the
//! feature/assessment/label filters applied while the environment runs.
//!
//! Setters take `&mut self` and return `&mut Self` so they chain:
//!
//! ```rust
//! use e2e_framework::envconf::Config;
//!
//! let mut cfg = Config::new();
//! cfg.with_namespace("e2e").with_feature_regex("^pods$").unwrap();
//! assert_eq!(cfg.namespace(), "e2e");
//! ```
//!
//! The API server client is built lazily on the first [`Config::client`]
//! call and cached for the lifetime of the configuration.

use crate::klient::{ClientError, KubeClient};
use rand::RngCore;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Length used by [`random_name`] when zero is requested.
pub const DEFAULT_NAME_LENGTH: usize = 32;

/// Prefix for namespaces created by [`Config::with_random_namespace`].
pub const RANDOM_NAMESPACE_PREFIX: &str = "testns-";

/// Variable selecting the kubeconfig file.
pub const ENV_KUBECONFIG: &str = "KUBECONFIG";

/// Variable selecting the namespace.
pub const ENV_NAMESPACE: &str = "E2E_NAMESPACE";

/// Variable holding the feature-name filter.
pub const ENV_FEATURE: &str = "E2E_FEATURE";

/// Variable holding the assessment-name filter.
pub const ENV_ASSESS: &str = "E2E_ASSESS";

/// Variable holding label filters (`key=value,key2=value2`).
pub const ENV_LABELS: &str = "E2E_LABELS";

/// Variable switching to the in-cluster connection when set to `true`.
pub const ENV_SONOBUOY: &str = "SONOBUOY";

/// Label filters and feature labels.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No cluster connection configured: set a client, a kubeconfig file or use in-cluster config")]
    MissingConnection,

    #[error("Cluster connection failed: {0}")]
    Connection(#[from] ClientError),

    #[error("Invalid {filter} filter '{pattern}': {source}")]
    InvalidRegex {
        filter: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid label filter '{0}': expected comma separated key=value pairs")]
    InvalidLabels(String),
}

/// Where the API server client comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSource {
    /// Only an explicitly supplied client can be used.
    None,
    /// Build the client from a kubeconfig file.
    Kubeconfig(PathBuf),
    /// Build the client from the pod service account.
    InCluster,
}

/// Environment configuration shared by hooks and steps.
pub struct Config {
    source: ConnectionSource,
    client: Mutex<Option<Arc<KubeClient>>>,
    namespace: String,
    assessment_regex: Option<Regex>,
    feature_regex: Option<Regex>,
    labels: Labels,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: ConnectionSource::None,
            client: Mutex::new(None),
            namespace: String::new(),
            assessment_regex: None,
            feature_regex: None,
            labels: Labels::new(),
        }
    }
}

impl Clone for Config {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            client: Mutex::new(self.cached_client()),
            namespace: self.namespace.clone(),
            assessment_regex: self.assessment_regex.clone(),
            feature_regex: self.feature_regex.clone(),
            labels: self.labels.clone(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("source", &self.source)
            .field("client_cached", &self.cached_client().is_some())
            .field("namespace", &self.namespace)
            .field("assessment_regex", &self.assessment_regex.as_ref().map(Regex::as_str))
            .field("feature_regex", &self.feature_regex.as_ref().map(Regex::as_str))
            .field("labels", &self.labels)
            .finish()
    }
}

impl Config {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration that connects through the pod service account.
    pub fn in_cluster() -> Self {
        Self {
            source: ConnectionSource::InCluster,
            ..Self::default()
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut cfg = if vars.get(ENV_SONOBUOY).is_some_and(|v| v == "true") {
            Self::in_cluster()
        } else {
            let mut cfg = Self::new();
            if let Some(path) = vars.get(ENV_KUBECONFIG).filter(|p| !p.is_empty()) {
                cfg.with_kubeconfig_file(path);
            }
            cfg
        };

        if let Some(ns) = vars.get(ENV_NAMESPACE) {
            cfg.with_namespace(ns.clone());
        }
        if let Some(pattern) = vars.get(ENV_FEATURE).filter(|p| !p.is_empty()) {
            cfg.with_feature_regex(pattern)?;
        }
        if let Some(pattern) = vars.get(ENV_ASSESS).filter(|p| !p.is_empty()) {
            cfg.with_assessment_regex(pattern)?;
        }
        if let Some(labels) = vars.get(ENV_LABELS) {
            cfg.with_labels(parse_labels(labels)?);
        }

        debug!(target: "e2e.envconf", config = ?cfg, "Configuration loaded");
        Ok(cfg)
    }

    // -------------------------------------------------------------------------
    // Connection
    // -------------------------------------------------------------------------

    /// Set the kubeconfig file used to build the client.
    ///
    /// Any previously cached client is dropped so the next [`Config::client`]
    /// call connects with the new file.
    pub fn with_kubeconfig_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.source = ConnectionSource::Kubeconfig(path.into());
        *self.client.get_mut().unwrap_or_else(PoisonError::into_inner) = None;
        self
    }

    /// The configured kubeconfig file, if any.
    pub fn kubeconfig_file(&self) -> Option<&Path> {
        match &self.source {
            ConnectionSource::Kubeconfig(path) => Some(path),
            _ => None,
        }
    }

    pub fn connection_source(&self) -> &ConnectionSource {
        &self.source
    }

    /// Use an already-built client.
    pub fn with_client(&mut self, client: KubeClient) -> &mut Self {
        *self.client.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(client));
        self
    }

    /// Return the cached client or build one from the connection source.
    ///
    /// Construction happens at most once; concurrent first calls are
    /// serialized on the cache lock.
    pub fn client(&self) -> Result<Arc<KubeClient>, ConfigError> {
        let mut cached = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = cached.as_ref() {
            return Ok(Arc::clone(client));
        }

        let client = match &self.source {
            ConnectionSource::None => return Err(ConfigError::MissingConnection),
            ConnectionSource::Kubeconfig(path) => KubeClient::from_kubeconfig_file(path)?,
            ConnectionSource::InCluster => KubeClient::in_cluster()?,
        };
        debug!(target: "e2e.envconf", server = %client.server(), "Cluster client created");

        let client = Arc::new(client);
        *cached = Some(Arc::clone(&client));
        Ok(client)
    }

    fn cached_client(&self) -> Option<Arc<KubeClient>> {
        self.client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // -------------------------------------------------------------------------
    // Namespace
    // -------------------------------------------------------------------------

    pub fn with_namespace(&mut self, namespace: impl Into<String>) -> &mut Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the namespace to a freshly generated random name.
    pub fn with_random_namespace(&mut self) -> &mut Self {
        self.namespace = random_name(RANDOM_NAMESPACE_PREFIX, DEFAULT_NAME_LENGTH);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    // -------------------------------------------------------------------------
    // Filters
    // -------------------------------------------------------------------------

    /// Only run assessments whose name matches `pattern`.
    pub fn with_assessment_regex(&mut self, pattern: &str) -> Result<&mut Self, ConfigError> {
        self.assessment_regex = Some(compile("assessment", pattern)?);
        Ok(self)
    }

    pub fn assessment_regex(&self) -> Option<&Regex> {
        self.assessment_regex.as_ref()
    }

    /// Only run features whose name matches `pattern`.
    pub fn with_feature_regex(&mut self, pattern: &str) -> Result<&mut Self, ConfigError> {
        self.feature_regex = Some(compile("feature", pattern)?);
        Ok(self)
    }

    pub fn feature_regex(&self) -> Option<&Regex> {
        self.feature_regex.as_ref()
    }

    /// Only run features carrying all of `labels`.
    pub fn with_labels(&mut self, labels: Labels) -> &mut Self {
        self.labels = labels;
        self
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Whether a feature with this name passes the feature filter.
    pub fn matches_feature(&self, name: &str) -> bool {
        self.feature_regex
            .as_ref()
            .map_or(true, |re| re.is_match(name))
    }

    /// Whether an assessment with this name passes the assessment filter.
    pub fn matches_assessment(&self, name: &str) -> bool {
        self.assessment_regex
            .as_ref()
            .map_or(true, |re| re.is_match(name))
    }

    /// Whether `labels` contain every configured label filter.
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    }
}

fn compile(filter: &'static str, pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
        filter,
        pattern: pattern.to_string(),
        source,
    })
}

/// Parse `key=value,key2=value2` into a label map.
///
/// Empty input yields an empty map; empty segments are ignored.
pub fn parse_labels(input: &str) -> Result<Labels, ConfigError> {
    let mut labels = Labels::new();
    for pair in input.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidLabels(input.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::InvalidLabels(input.to_string()));
        }
        labels.insert(key.to_string(), value.trim().to_string());
    }
    Ok(labels)
}

/// Generate a random name of exactly `n` characters starting with `prefix`.
///
/// The result is `prefix + "-" + hex(random bytes)` cut to `n` characters.
/// `n == 0` selects [`DEFAULT_NAME_LENGTH`]. A prefix that is already `n`
/// characters or longer is returned unchanged.
pub fn random_name(prefix: &str, n: usize) -> String {
    let n = if n == 0 { DEFAULT_NAME_LENGTH } else { n };
    if prefix.len() >= n {
        return prefix.to_string();
    }

    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);

    let mut name = format!("{prefix}-{}", hex::encode(bytes));
    name.truncate(n);
    name
}
