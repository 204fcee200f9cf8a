//! [`LeaseLock`] backed by a Kubernetes `coordination.k8s.io/v1` Lease object.
//!
//! The object's `metadata.resourceVersion` is the compare-and-swap version:
//! the API server rejects a PUT carrying a stale resource version with 409.
//!
//! Credentials come either from a kubeconfig file (its current context) or,
//! when no file is given, from the in-cluster service account.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, LockError, LockResult};
use crate::lease::{LeaseLock, LeaseRecord};

/// Directory the kubelet mounts service account credentials into
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const API_VERSION: &str = "coordination.k8s.io/v1";

/// How requests authenticate to the API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    /// Fixed bearer token
    Token(String),
    /// Bearer token re-read from a file on every request
    TokenFile(PathBuf),
}

/// Connection settings for an API server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub ca_pem: Option<Vec<u8>>,
    /// Client certificate and key, PEM encoded, concatenated
    pub identity_pem: Option<Vec<u8>>,
    pub insecure_skip_tls_verify: bool,
    pub auth: Auth,
}

impl ClientConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into().trim_end_matches('/').to_string(),
            ca_pem: None,
            identity_pem: None,
            insecure_skip_tls_verify: false,
            auth: Auth::None,
        }
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    /// Load from `kubeconfig` if given, otherwise from the in-cluster environment.
    pub fn resolve(kubeconfig: Option<&Path>) -> Result<Self, ClientError> {
        match kubeconfig {
            Some(path) => Self::from_kubeconfig(path),
            None => Self::in_cluster(),
        }
    }

    /// Settings for the kubeconfig file's current context.
    pub fn from_kubeconfig(path: &Path) -> Result<Self, ClientError> {
        let text = read_to_string(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_kubeconfig_str(&text, base)
    }

    /// Parse kubeconfig text; relative file references resolve against `base`.
    pub fn from_kubeconfig_str(text: &str, base: &Path) -> Result<Self, ClientError> {
        let kubeconfig: Kubeconfig = serde_yaml_ng::from_str(text)?;

        let context_name = kubeconfig
            .current_context
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ClientError::MissingEntry("current-context".to_string()))?;
        let context = kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| ClientError::MissingEntry(format!("context {context_name}")))?;
        let cluster = kubeconfig
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| ClientError::MissingEntry(format!("cluster {}", context.cluster)))?;
        let user = match context.user.as_deref() {
            Some(name) => kubeconfig
                .users
                .iter()
                .find(|u| u.name == name)
                .map(|u| u.user.clone())
                .ok_or_else(|| ClientError::MissingEntry(format!("user {name}")))?,
            None => UserEntry::default(),
        };

        let mut config = ClientConfig::new(&cluster.server);
        config.insecure_skip_tls_verify = cluster.insecure_skip_tls_verify;
        config.ca_pem = load_pem(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            base,
        )?;

        let cert = load_pem(
            user.client_certificate_data.as_deref(),
            user.client_certificate.as_deref(),
            base,
        )?;
        let key = load_pem(
            user.client_key_data.as_deref(),
            user.client_key.as_deref(),
            base,
        )?;
        if let (Some(mut cert), Some(key)) = (cert, key) {
            cert.push(b'\n');
            cert.extend_from_slice(&key);
            config.identity_pem = Some(cert);
        }

        config.auth = match (user.token, user.token_file) {
            (Some(token), _) if !token.is_empty() => Auth::Token(token),
            (_, Some(file)) => Auth::TokenFile(base.join(file)),
            _ => Auth::None,
        };

        Ok(config)
    }

    /// Settings from the service account mounted into a pod.
    pub fn in_cluster() -> Result<Self, ClientError> {
        Self::in_cluster_at(
            std::env::var("KUBERNETES_SERVICE_HOST").ok(),
            std::env::var("KUBERNETES_SERVICE_PORT").ok(),
            Path::new(SERVICE_ACCOUNT_DIR),
        )
    }

    fn in_cluster_at(
        host: Option<String>,
        port: Option<String>,
        dir: &Path,
    ) -> Result<Self, ClientError> {
        let host = host
            .filter(|h| !h.is_empty())
            .ok_or(ClientError::NotInCluster("KUBERNETES_SERVICE_HOST"))?;
        let port = port
            .filter(|p| !p.is_empty())
            .ok_or(ClientError::NotInCluster("KUBERNETES_SERVICE_PORT"))?;

        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let token_path = dir.join("token");
        read_to_string(&token_path)?;
        let ca_pem = read(&dir.join("ca.crt"))?;

        let mut config = ClientConfig::new(format!("https://{host}:{port}"));
        config.ca_pem = Some(ca_pem);
        config.auth = Auth::TokenFile(token_path);
        Ok(config)
    }

    /// Build an HTTP client honoring the TLS settings.
    pub fn build_client(&self) -> Result<reqwest::Client, ClientError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(ca) = &self.ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(ca)?);
        }
        if let Some(identity) = &self.identity_pem {
            builder = builder.identity(reqwest::Identity::from_pem(identity)?);
        }
        if self.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(builder.build()?)
    }
}

fn read(path: &Path) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path).map_err(|source| ClientError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

fn read_to_string(path: &Path) -> Result<String, ClientError> {
    std::fs::read_to_string(path).map_err(|source| ClientError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Inline base64 data wins over a file reference.
fn load_pem(
    data: Option<&str>,
    file: Option<&Path>,
    base: &Path,
) -> Result<Option<Vec<u8>>, ClientError> {
    if let Some(data) = data.filter(|d| !d.is_empty()) {
        let decoded = base64::engine::general_purpose::STANDARD.decode(data.trim())?;
        return Ok(Some(decoded));
    }
    match file {
        Some(file) => Ok(Some(read(&base.join(file))?)),
        None => Ok(None),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    current_context: Option<String>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    certificate_authority: Option<PathBuf>,
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: UserEntry,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserEntry {
    token: Option<String>,
    token_file: Option<PathBuf>,
    client_certificate: Option<PathBuf>,
    client_certificate_data: Option<String>,
    client_key: Option<PathBuf>,
    client_key_data: Option<String>,
}

/// Wire shape of a Lease object.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseObject {
    api_version: String,
    kind: String,
    metadata: ObjectMeta,
    #[serde(default)]
    spec: LeaseSpec,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseSpec {
    #[serde(default)]
    holder_identity: Option<String>,
    #[serde(default)]
    lease_duration_seconds: Option<i32>,
    #[serde(default)]
    acquire_time: Option<String>,
    #[serde(default)]
    renew_time: Option<String>,
    #[serde(default)]
    lease_transitions: Option<i64>,
}

/// MicroTime: RFC 3339 with microsecond precision.
fn format_micro_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_micro_time(text: Option<&str>) -> DateTime<Utc> {
    text.and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Whole seconds for `leaseDurationSeconds`, rounded up so observers never
/// see a shorter lease than the holder relies on.
fn lease_duration_seconds(duration: Duration) -> i32 {
    let seconds = duration
        .as_secs()
        .saturating_add(u64::from(duration.subsec_nanos() > 0));
    i32::try_from(seconds.max(1)).unwrap_or(i32::MAX)
}

impl LeaseObject {
    fn from_record(record: &LeaseRecord, resource_version: Option<&str>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: "Lease".to_string(),
            metadata: ObjectMeta {
                name: record.name.clone(),
                namespace: Some(record.scope.clone()),
                resource_version: resource_version.map(str::to_string),
            },
            spec: LeaseSpec {
                holder_identity: Some(record.holder_identity.clone()),
                lease_duration_seconds: Some(lease_duration_seconds(record.duration)),
                acquire_time: Some(format_micro_time(&record.acquire_time)),
                renew_time: Some(format_micro_time(&record.renew_time)),
                lease_transitions: Some(i64::from(record.transitions)),
            },
        }
    }

    fn into_record(self, fallback_scope: &str) -> LeaseRecord {
        let duration = self
            .spec
            .lease_duration_seconds
            .and_then(|s| u64::try_from(s).ok())
            .unwrap_or(0);
        LeaseRecord {
            name: self.metadata.name,
            scope: self
                .metadata
                .namespace
                .unwrap_or_else(|| fallback_scope.to_string()),
            holder_identity: self.spec.holder_identity.unwrap_or_default(),
            acquire_time: parse_micro_time(self.spec.acquire_time.as_deref()),
            renew_time: parse_micro_time(self.spec.renew_time.as_deref()),
            duration: Duration::from_secs(duration),
            transitions: self
                .spec
                .lease_transitions
                .and_then(|t| u32::try_from(t).ok())
                .unwrap_or(0),
            version: self.metadata.resource_version.unwrap_or_default(),
        }
    }
}

/// A Lease object in one namespace, accessed over the Kubernetes REST API.
#[derive(Debug, Clone)]
pub struct KubernetesLeaseLock {
    client: reqwest::Client,
    server: String,
    auth: Auth,
    name: String,
    namespace: String,
}

impl KubernetesLeaseLock {
    pub fn new(
        config: &ClientConfig,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            client: config.build_client()?,
            server: config.server.clone(),
            auth: config.auth.clone(),
            name: name.into(),
            namespace: namespace.into(),
        })
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/apis/{}/namespaces/{}/leases",
            self.server, API_VERSION, self.namespace
        )
    }

    fn object_url(&self) -> String {
        format!("{}/{}", self.collection_url(), self.name)
    }

    async fn authorize(
        &self,
        request: reqwest::RequestBuilder,
    ) -> LockResult<reqwest::RequestBuilder> {
        match &self.auth {
            Auth::None => Ok(request),
            Auth::Token(token) => Ok(request.bearer_auth(token)),
            Auth::TokenFile(path) => {
                let token = tokio::fs::read_to_string(path).await.map_err(|e| {
                    LockError::StoreUnavailable(format!(
                        "failed to read token {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(request.bearer_auth(token.trim()))
            }
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> LockResult<reqwest::Response> {
        self.authorize(request)
            .await?
            .send()
            .await
            .map_err(unavailable)
    }

    async fn decode(&self, response: reqwest::Response) -> LockResult<LeaseRecord> {
        let status = response.status();
        if !status.is_success() {
            return Err(LockError::StoreUnavailable(format!(
                "unexpected status {status}"
            )));
        }
        let object: LeaseObject = response.json().await.map_err(unavailable)?;
        Ok(object.into_record(&self.namespace))
    }
}

fn unavailable(error: reqwest::Error) -> LockError {
    LockError::StoreUnavailable(error.to_string())
}

#[async_trait]
impl LeaseLock for KubernetesLeaseLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> &str {
        &self.namespace
    }

    async fn get(&self) -> LockResult<Option<LeaseRecord>> {
        let response = self.send(self.client.get(self.object_url())).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        self.decode(response).await.map(Some)
    }

    async fn create(&self, record: &LeaseRecord) -> LockResult<LeaseRecord> {
        let body = LeaseObject::from_record(record, None);
        let response = self
            .send(self.client.post(self.collection_url()).json(&body))
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(LockError::AlreadyExists);
        }
        self.decode(response).await
    }

    async fn update(
        &self,
        record: &LeaseRecord,
        expected_version: &str,
    ) -> LockResult<LeaseRecord> {
        let body = LeaseObject::from_record(record, Some(expected_version));
        let response = self
            .send(self.client.put(self.object_url()).json(&body))
            .await?;
        match response.status() {
            StatusCode::CONFLICT | StatusCode::NOT_FOUND => Err(LockError::Conflict),
            _ => self.decode(response).await,
        }
    }
}
