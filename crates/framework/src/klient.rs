//! API server connection handle.
//!
//! [`KubeClient`] is the object that `Config::client()` hands to hooks and
//! steps. It resolves a kubeconfig (or the in-cluster service account) into
//! a server URL, credentials and a configured HTTP client. Typed resource
//! operations are deliberately not part of this crate; steps build on top of
//! [`KubeClient::get_json`] or bring their own client.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secrecy::{ExposeSecret, SecretSlice, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default request timeout for API server calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Service account mount used when running inside a pod.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Maximum length for error body in error messages.
const MAX_ERROR_BODY_LEN: usize = 256;

/// Connection errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed kubeconfig: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Kubeconfig context '{0}' not found")]
    MissingContext(String),

    #[error("Kubeconfig has no current-context")]
    NoCurrentContext,

    #[error("Kubeconfig cluster '{0}' not found")]
    MissingCluster(String),

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Not running in a cluster: {0} is not set")]
    NotInCluster(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },
}

// =============================================================================
// Kubeconfig model
// =============================================================================

/// The subset of the kubeconfig format needed to reach an API server.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    #[serde(default)]
    pub current_context: Option<String>,
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    pub server: String,
    #[serde(default)]
    pub certificate_authority: Option<String>,
    #[serde(default)]
    pub certificate_authority_data: Option<String>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextEntry {
    pub cluster: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedUser {
    pub name: String,
    #[serde(default)]
    pub user: UserEntry,
}

#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    #[serde(default)]
    pub token: Option<SecretString>,
    #[serde(default)]
    pub client_certificate: Option<String>,
    #[serde(default)]
    pub client_certificate_data: Option<String>,
    #[serde(default)]
    pub client_key: Option<String>,
    #[serde(default)]
    pub client_key_data: Option<SecretString>,
}

impl fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserEntry")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("client_certificate", &self.client_certificate)
            .field(
                "client_certificate_data",
                &self.client_certificate_data.as_ref().map(|_| "[present]"),
            )
            .field("client_key", &self.client_key)
            .field(
                "client_key_data",
                &self.client_key_data.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl Kubeconfig {
    /// Parse a kubeconfig document.
    pub fn from_yaml(contents: &str) -> Result<Self, ClientError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Read and parse a kubeconfig file.
    pub fn from_file(path: &Path) -> Result<Self, ClientError> {
        let contents = fs::read_to_string(path).map_err(|source| ClientError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    fn context(&self, name: &str) -> Result<&ContextEntry, ClientError> {
        self.contexts
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.context)
            .ok_or_else(|| ClientError::MissingContext(name.to_string()))
    }

    fn cluster(&self, name: &str) -> Result<&ClusterEntry, ClientError> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.cluster)
            .ok_or_else(|| ClientError::MissingCluster(name.to_string()))
    }

    fn user(&self, name: &str) -> Option<&UserEntry> {
        self.users.iter().find(|u| u.name == name).map(|u| &u.user)
    }
}

// =============================================================================
// Client
// =============================================================================

/// TLS material, kept as PEM so both HTTP clients can be built from it.
#[derive(Default)]
struct TlsSettings {
    root_certificates: Vec<Vec<u8>>,
    identity: Option<SecretSlice<u8>>,
    accept_invalid_certs: bool,
}

impl TlsSettings {
    fn certificates(&self) -> Result<Vec<reqwest::Certificate>, ClientError> {
        self.root_certificates
            .iter()
            .map(|pem| {
                reqwest::Certificate::from_pem(pem).map_err(|e| {
                    ClientError::InvalidCredentials(format!("certificate authority: {e}"))
                })
            })
            .collect()
    }

    fn identity(&self) -> Result<Option<reqwest::Identity>, ClientError> {
        self.identity
            .as_ref()
            .map(|pem| {
                reqwest::Identity::from_pem(pem.expose_secret()).map_err(|e| {
                    ClientError::InvalidCredentials(format!("client certificate: {e}"))
                })
            })
            .transpose()
    }

    fn async_client(&self) -> Result<reqwest::Client, ClientError> {
        let mut builder = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(self.accept_invalid_certs);
        for cert in self.certificates()? {
            builder = builder.add_root_certificate(cert);
        }
        if let Some(identity) = self.identity()? {
            builder = builder.identity(identity);
        }
        Ok(builder.build()?)
    }

    fn blocking_client(&self) -> Result<reqwest::blocking::Client, ClientError> {
        let mut builder = reqwest::blocking::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(self.accept_invalid_certs);
        for cert in self.certificates()? {
            builder = builder.add_root_certificate(cert);
        }
        if let Some(identity) = self.identity()? {
            builder = builder.identity(identity);
        }
        Ok(builder.build()?)
    }
}

/// Connection to a cluster's API server.
///
/// Requests go through an async `reqwest` client. The blocking methods
/// ([`get_json`](Self::get_json), [`check_ready`](Self::check_ready)) run
/// on a second client that is only created on first use; they must not be
/// called from inside a tokio runtime. Async step code uses the `_async`
/// methods, or moves blocking calls onto `tokio::task::spawn_blocking`.
pub struct KubeClient {
    server: String,
    namespace: Option<String>,
    token: Option<SecretString>,
    tls: TlsSettings,
    http: reqwest::Client,
    blocking: Mutex<Option<reqwest::blocking::Client>>,
}

impl fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeClient")
            .field("server", &self.server)
            .field("namespace", &self.namespace)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl KubeClient {
    fn build(
        server: &str,
        namespace: Option<String>,
        token: Option<SecretString>,
        tls: TlsSettings,
    ) -> Result<Self, ClientError> {
        let http = tls.async_client()?;
        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            namespace,
            token,
            tls,
            http,
            blocking: Mutex::new(None),
        })
    }

    /// Create a client for `server` without TLS customization or credentials.
    pub fn new(server: impl Into<String>) -> Result<Self, ClientError> {
        let server: String = server.into();
        Self::build(&server, None, None, TlsSettings::default())
    }

    /// Build a client from the current context of a kubeconfig file.
    pub fn from_kubeconfig_file(path: &Path) -> Result<Self, ClientError> {
        let kubeconfig = Kubeconfig::from_file(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_kubeconfig(&kubeconfig, None, base_dir)
    }

    /// Build a client from a parsed kubeconfig.
    ///
    /// `context` overrides the kubeconfig's `current-context`. Relative
    /// certificate paths are resolved against `base_dir`.
    pub fn from_kubeconfig(
        kubeconfig: &Kubeconfig,
        context: Option<&str>,
        base_dir: &Path,
    ) -> Result<Self, ClientError> {
        let context_name = context
            .map(str::to_string)
            .or_else(|| kubeconfig.current_context.clone())
            .ok_or(ClientError::NoCurrentContext)?;
        let ctx = kubeconfig.context(&context_name)?;
        let cluster = kubeconfig.cluster(&ctx.cluster)?;
        let user = ctx
            .user
            .as_deref()
            .and_then(|name| kubeconfig.user(name))
            .cloned()
            .unwrap_or_default();

        let mut tls = TlsSettings {
            accept_invalid_certs: cluster.insecure_skip_tls_verify,
            ..TlsSettings::default()
        };

        if let Some(ca) = load_data(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            base_dir,
        )? {
            tls.root_certificates.push(ca);
        }

        let cert = load_data(
            user.client_certificate_data.as_deref(),
            user.client_certificate.as_deref(),
            base_dir,
        )?;
        let key = load_data(
            user.client_key_data.as_ref().map(|k| k.expose_secret()),
            user.client_key.as_deref(),
            base_dir,
        )?;
        match (cert, key) {
            (Some(mut pem), Some(key)) => {
                pem.push(b'\n');
                pem.extend_from_slice(&key);
                tls.identity = Some(SecretSlice::from(pem));
            }
            (None, None) => {}
            _ => {
                return Err(ClientError::InvalidCredentials(
                    "client certificate and key must be provided together".to_string(),
                ))
            }
        }

        let client = Self::build(&cluster.server, ctx.namespace.clone(), user.token, tls)?;

        debug!(
            target: "e2e.klient",
            context = %context_name,
            server = %client.server,
            "Built API server client from kubeconfig"
        );

        Ok(client)
    }

    /// Build a client from the pod's service account.
    pub fn in_cluster() -> Result<Self, ClientError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::in_cluster_from(&vars, Path::new(SERVICE_ACCOUNT_DIR))
    }

    /// Build an in-cluster client from explicit variables and a service
    /// account directory (for testing).
    pub fn in_cluster_from(
        vars: &HashMap<String, String>,
        service_account_dir: &Path,
    ) -> Result<Self, ClientError> {
        let host = vars
            .get("KUBERNETES_SERVICE_HOST")
            .ok_or(ClientError::NotInCluster("KUBERNETES_SERVICE_HOST"))?;
        let port = vars
            .get("KUBERNETES_SERVICE_PORT")
            .ok_or(ClientError::NotInCluster("KUBERNETES_SERVICE_PORT"))?;

        let token_path = service_account_dir.join("token");
        let token = fs::read_to_string(&token_path).map_err(|source| ClientError::Io {
            path: token_path,
            source,
        })?;

        let ca_path = service_account_dir.join("ca.crt");
        let mut tls = TlsSettings::default();
        if ca_path.exists() {
            let ca = fs::read(&ca_path).map_err(|source| ClientError::Io {
                path: ca_path.clone(),
                source,
            })?;
            tls.root_certificates.push(ca);
        }

        let namespace = fs::read_to_string(service_account_dir.join("namespace"))
            .ok()
            .map(|ns| ns.trim().to_string());

        // IPv6 hosts must be bracketed in URLs
        let server = if host.contains(':') {
            format!("https://[{host}]:{port}")
        } else {
            format!("https://{host}:{port}")
        };

        debug!(target: "e2e.klient", server = %server, "Built in-cluster API server client");

        let token = SecretString::from(token.trim().to_string());
        Self::build(&server, namespace, Some(token), tls)
    }

    /// Attach a bearer token.
    #[must_use]
    pub fn with_token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// API server base URL (no trailing slash).
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Namespace from the kubeconfig context or the service account, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Get the HTTP client for making requests.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.server, path.trim_start_matches('/'))
    }

    /// GET `path` on the API server and decode the JSON response.
    pub async fn get_json_async(&self, path: &str) -> Result<serde_json::Value, ClientError> {
        let response = self.get_async(path).await?;
        Ok(response.json().await?)
    }

    /// Check if the API server readiness endpoint is responding.
    pub async fn check_ready_async(&self) -> Result<(), ClientError> {
        self.get_async("/readyz").await.map(|_| ())
    }

    async fn get_async(&self, path: &str) -> Result<reqwest::Response, ClientError> {
        let mut request = self.http.get(self.url(path));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(request_failed(status, &body));
        }
        Ok(response)
    }

    /// Blocking [`get_json_async`](Self::get_json_async).
    pub fn get_json(&self, path: &str) -> Result<serde_json::Value, ClientError> {
        let response = self.get(path)?;
        Ok(response.json()?)
    }

    /// Blocking [`check_ready_async`](Self::check_ready_async).
    pub fn check_ready(&self) -> Result<(), ClientError> {
        self.get("/readyz").map(|_| ())
    }

    fn blocking_client(&self) -> Result<reqwest::blocking::Client, ClientError> {
        let mut slot = self.blocking.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = self.tls.blocking_client()?;
        *slot = Some(client.clone());
        Ok(client)
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response, ClientError> {
        let mut request = self.blocking_client()?.get(self.url(path));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(request_failed(status, &body));
        }
        Ok(response)
    }
}

fn request_failed(status: reqwest::StatusCode, body: &str) -> ClientError {
    ClientError::RequestFailed {
        status: status.as_u16(),
        body: truncate_body(body),
    }
}

/// Resolve inline base64 data or a file reference into raw bytes.
fn load_data(
    data: Option<&str>,
    file: Option<&str>,
    base_dir: &Path,
) -> Result<Option<Vec<u8>>, ClientError> {
    if let Some(data) = data {
        let bytes = BASE64
            .decode(data.trim())
            .map_err(|e| ClientError::InvalidCredentials(format!("base64 data: {e}")))?;
        return Ok(Some(bytes));
    }
    if let Some(file) = file {
        let path = base_dir.join(file);
        let bytes = fs::read(&path).map_err(|source| ClientError::Io { path, source })?;
        return Ok(Some(bytes));
    }
    Ok(None)
}

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LEN {
        let cut = (0..=MAX_ERROR_BODY_LEN)
            .rev()
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}...[truncated]", body.get(..cut).unwrap_or_default())
    } else {
        body.to_string()
    }
}
