use std::fmt;

/// Control-plane resolution failures, split by how the caller should react.
///
/// `Transient` is the only retryable kind; everything else is surfaced to the
/// operator with an actionable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The authenticated principal lacks permission on the instance.
    PermissionDenied(String),
    /// The instance (or its project) does not exist, usually a typo.
    NotFound(String),
    /// The database admin API is not enabled for the project.
    ApiDisabled(String),
    /// The instance lives in a different region than the one requested.
    RegionMismatch { want: String, got: String },
    /// Server-side (5xx) or network failure; safe to retry.
    Transient(String),
    /// Any other client-side rejection (4xx). Not retryable.
    Rejected(String),
    /// The instance runs a backend generation this proxy cannot serve.
    UnsupportedBackend(String),
    /// No address of an acceptable type was reported for the instance.
    NoUsableAddress(String),
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::Transient(_))
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::PermissionDenied(msg) => write!(
                f,
                "access denied; ensure the account has the client role on the instance: {}",
                msg
            ),
            ResolveError::NotFound(msg) => write!(
                f,
                "instance not found; check the instance connection name for typos: {}",
                msg
            ),
            ResolveError::ApiDisabled(msg) => {
                write!(f, "the database admin API is not enabled: {}", msg)
            }
            ResolveError::RegionMismatch { want, got } => {
                if want.is_empty() {
                    write!(
                        f,
                        "connection name omits the region, required when region checking is enabled (instance reports {})",
                        got
                    )
                } else {
                    write!(
                        f,
                        "region mismatch: requested region {} but the instance reports {}",
                        want, got
                    )
                }
            }
            ResolveError::Transient(msg) => write!(f, "transient control-plane error: {}", msg),
            ResolveError::Rejected(msg) => write!(f, "control plane rejected the request: {}", msg),
            ResolveError::UnsupportedBackend(msg) => {
                write!(f, "unsupported backend generation: {}", msg)
            }
            ResolveError::NoUsableAddress(msg) => write!(f, "no usable address: {}", msg),
        }
    }
}

/// Top-level proxy error. Variants carry strings so resolver outcomes can be
/// cached and handed to every waiter of a shared refresh.
#[derive(Debug, Clone)]
pub enum ProxyError {
    Config(String),
    Auth(String),
    Resolve(ResolveError),
    /// Transport-level dial failure (TCP connect, timeout).
    Connect(String),
    /// TLS handshake failure against the remote instance.
    Handshake(String),
    /// The max-connections gate refused the connection.
    TooManyConnections { limit: u64 },
    /// Shutdown deadline elapsed with proxied connections still open.
    ShutdownTimeout { open: usize },
    Internal(String),
}

impl ProxyError {
    pub fn config(msg: impl Into<String>) -> Self {
        ProxyError::Config(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        ProxyError::Auth(msg.into())
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Config(msg) => write!(f, "config error: {}", msg),
            ProxyError::Auth(msg) => write!(f, "auth error: {}", msg),
            ProxyError::Resolve(e) => write!(f, "resolve error: {}", e),
            ProxyError::Connect(msg) => write!(f, "connect error: {}", msg),
            ProxyError::Handshake(msg) => write!(f, "tls handshake error: {}", msg),
            ProxyError::TooManyConnections { limit } => {
                write!(f, "too many open connections (max {})", limit)
            }
            ProxyError::ShutdownTimeout { open } => {
                write!(f, "shutdown timed out with {} connections open", open)
            }
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<ResolveError> for ProxyError {
    fn from(e: ResolveError) -> Self {
        ProxyError::Resolve(e)
    }
}
