use std::sync::Arc;

use bytes::BytesMut;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::auth::TokenSource;
use crate::instance::InstanceName;

/// Control-plane failure, split by retryability. The certificate source maps
/// these onto resolver error kinds.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// Non-2xx response. `reason` is the first machine-readable reason token
    /// from the error body, empty when the body was not parseable.
    Status {
        code: u16,
        reason: String,
        message: String,
    },
    /// Connection-level failure (DNS, TCP, TLS, timeout).
    Network(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Status { code, .. } => *code >= 500,
            ApiError::Network(_) => true,
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Status {
                code,
                reason,
                message,
            } => {
                if reason.is_empty() {
                    write!(f, "api error {}: {}", code, message)
                } else {
                    write!(f, "api error {} ({}): {}", code, reason, message)
                }
            }
            ApiError::Network(msg) => write!(f, "api network error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

/// One entry of an instance's reported address list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpMapping {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub ip_address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SslCert {
    #[serde(default)]
    pub cert: String,
}

/// Connection metadata for one instance, as reported by the control plane.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub ip_addresses: Vec<IpMapping>,
    #[serde(default)]
    pub server_ca_cert: Option<SslCert>,
    #[serde(default)]
    pub database_version: String,
    #[serde(default)]
    pub backend_type: String,
}

/// Request body for minting an ephemeral client certificate.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralCertRequest {
    /// PEM `PUBLIC KEY` block the control plane signs.
    pub public_key: String,
    /// Access token for certificates bound to the caller identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// RFC 3339 read-consistency hint; lets the control plane serve a
    /// slightly stale snapshot during retries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralCertResponse {
    pub ephemeral_cert: SslCert,
}

/// Error body shape used by the control plane.
#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Deserialize, Default)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: String,
}

/// Database admin API client. Authenticated per-request through the token
/// source; cheaply cloneable (reqwest clients share their pool).
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl ApiClient {
    pub fn new(endpoint: &str, tokens: Arc<dyn TokenSource>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("failed to build admin API HTTP client");

        Self {
            http,
            base_url: endpoint.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn authed(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ApiError> {
        let token = self
            .tokens
            .token()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(req.bearer_auth(token.token))
    }

    /// Turn a non-2xx response into a typed error, draining the body for the
    /// machine-readable reason.
    async fn error_from_response(resp: reqwest::Response) -> ApiError {
        let code = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(|b| b.error)
            .unwrap_or_default();
        let reason = detail
            .errors
            .first()
            .map(|e| e.reason.clone())
            .unwrap_or_default();
        let message = if detail.message.is_empty() {
            body.chars().take(200).collect()
        } else {
            detail.message
        };
        ApiError::Status {
            code,
            reason,
            message,
        }
    }

    /// Read connection metadata for one instance.
    pub async fn get_instance(&self, instance: &InstanceName) -> Result<InstanceInfo, ApiError> {
        let url = format!(
            "{}/projects/{}/instances/{}",
            self.base_url, instance.project, instance.name
        );
        let resp = self
            .authed(self.http.get(&url))
            .await?
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }
        resp.json().await.map_err(|e| ApiError::Network(e.to_string()))
    }

    /// Submit a public key and receive a short-lived client certificate.
    pub async fn create_ephemeral_cert(
        &self,
        instance: &InstanceName,
        req: &EphemeralCertRequest,
    ) -> Result<EphemeralCertResponse, ApiError> {
        let url = format!(
            "{}/projects/{}/instances/{}/createEphemeral",
            self.base_url, instance.project, instance.name
        );
        let resp = self
            .authed(self.http.post(&url))
            .await?
            .json(req)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Self::error_from_response(resp).await);
        }
        resp.json().await.map_err(|e| ApiError::Network(e.to_string()))
    }
}

/// A streaming subscription to the discovery endpoint: each line of the
/// response body is a comma-separated instance list. The caller loops on
/// [`UpdateStream::next_message`] until it returns `None`, then resubscribes.
pub struct UpdateStream {
    stream: std::pin::Pin<
        Box<dyn futures_util::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
    >,
    buf: BytesMut,
}

impl UpdateStream {
    /// Open the subscription. Plain GET; the server holds the connection and
    /// writes a line whenever the instance list changes.
    pub async fn open(http: &reqwest::Client, url: &str) -> Result<UpdateStream, ApiError> {
        let resp = http
            .get(url)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ApiClient::error_from_response(resp).await);
        }
        Ok(UpdateStream {
            stream: Box::pin(resp.bytes_stream()),
            buf: BytesMut::with_capacity(4096),
        })
    }

    /// Next instance-list message. `None` when the stream ends.
    pub async fn next_message(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line_bytes = self.buf.split_to(pos + 1);
                let line = String::from_utf8_lossy(&line_bytes).trim_end().to_string();
                return Some(line);
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => {
                    self.buf.extend_from_slice(&chunk);
                }
                Some(Err(e)) => {
                    tracing::error!("discovery: update stream error: {}", e);
                    return None;
                }
                None => {
                    if !self.buf.is_empty() {
                        let line = String::from_utf8_lossy(&self.buf).trim_end().to_string();
                        self.buf.clear();
                        return Some(line);
                    }
                    return None;
                }
            }
        }
    }
}

/// Does this database version use the well-known PostgreSQL socket layout?
pub fn is_postgres(version: &str) -> bool {
    version.starts_with("POSTGRES")
}
