use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Certificate duration bounds: requests outside [1 h, 24 h] are clamped.
const MIN_CERT_DURATION_SECS: u64 = 3_600;
const MAX_CERT_DURATION_SECS: u64 = 86_400;

/// Minimum interval between forced refreshes of the same cache entry.
const MIN_REFRESH_THROTTLE_SECS: u64 = 1;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Instance connection names, optionally with listener overrides
    /// (`project:region:name=tcp:5432`).
    #[serde(default)]
    pub instances: Vec<String>,

    /// Discovery endpoint streaming updated comma-separated instance lists.
    #[serde(default)]
    pub instances_metadata: Option<String>,

    /// Directory under which per-instance unix sockets are created.
    #[serde(default = "default_unix_socket_dir")]
    pub unix_socket_dir: String,

    /// Port the remote instances accept TLS connections on.
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,

    /// Upper bound on concurrently proxied connections. 0 means unlimited.
    #[serde(default)]
    pub max_connections: u64,

    /// How long shutdown waits for live connections before forcing them closed.
    /// 0 closes everything immediately.
    #[serde(default)]
    pub term_timeout_secs: u64,

    /// Log and drop instances whose listener cannot be configured instead of
    /// treating them as fatal at startup.
    #[serde(default)]
    pub skip_failed_instances: bool,

    /// Address for the admin server (health + metrics). Disabled when unset.
    #[serde(default)]
    pub admin_listen: Option<String>,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub certs: CertConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            instances_metadata: None,
            unix_socket_dir: default_unix_socket_dir(),
            remote_port: default_remote_port(),
            max_connections: 0,
            term_timeout_secs: 0,
            skip_failed_instances: false,
            admin_listen: None,
            api: ApiConfig::default(),
            certs: CertConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Control-plane API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the database admin API. Deployment-specific, required.
    #[serde(default)]
    pub endpoint: String,

    /// Static bearer token for the control plane. In production the token
    /// comes from the ambient credential source; this override is for
    /// development and tests.
    #[serde(default)]
    pub token: Option<String>,

    /// Bind ephemeral certificates to the access token identity (database-level
    /// IAM authentication).
    #[serde(default)]
    pub enable_iam_login: bool,

    /// Treat a region mismatch between the connection name and the API
    /// response as fatal instead of a warning. Also requires every
    /// connection name to carry its region.
    #[serde(default)]
    pub check_region: bool,

    /// Preference-ordered address types to dial. `PUBLIC` is an alias for
    /// the API's `PRIMARY` type.
    #[serde(default = "default_ip_address_types")]
    pub ip_address_types: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            token: None,
            enable_iam_login: false,
            check_region: false,
            ip_address_types: default_ip_address_types(),
        }
    }
}

fn default_ip_address_types() -> Vec<String> {
    vec!["PUBLIC".to_string(), "PRIVATE".to_string()]
}

fn default_unix_socket_dir() -> String {
    "/tmp/sqltunnel".to_string()
}

fn default_remote_port() -> u16 {
    3307
}

/// Ephemeral certificate lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertConfig {
    /// Requested ephemeral certificate lifetime (seconds).
    #[serde(default = "default_cert_duration")]
    pub cert_duration_secs: u64,

    /// Minimum interval between forced refreshes per instance (seconds).
    #[serde(default = "default_refresh_throttle")]
    pub refresh_throttle_secs: u64,

    /// Proactive refresh runs this long before certificate expiry (seconds).
    #[serde(default = "default_refresh_buffer")]
    pub refresh_buffer_secs: u64,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            cert_duration_secs: default_cert_duration(),
            refresh_throttle_secs: default_refresh_throttle(),
            refresh_buffer_secs: default_refresh_buffer(),
        }
    }
}

fn default_cert_duration() -> u64 {
    MIN_CERT_DURATION_SECS
}

fn default_refresh_throttle() -> u64 {
    30
}

fn default_refresh_buffer() -> u64 {
    300
}

/// Output verbosity. `quiet` discards everything; `verbose` enables
/// per-connection events; `debug_stdout` routes non-errors to stdout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub quiet: bool,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub structured: bool,

    #[serde(default)]
    pub debug_stdout: bool,
}

impl ProxyConfig {
    pub fn cert_duration(&self) -> Duration {
        Duration::from_secs(self.certs.cert_duration_secs)
    }

    pub fn refresh_throttle(&self) -> Duration {
        Duration::from_secs(self.certs.refresh_throttle_secs)
    }

    pub fn refresh_buffer(&self) -> Duration {
        Duration::from_secs(self.certs.refresh_buffer_secs)
    }

    pub fn term_timeout(&self) -> Duration {
        Duration::from_secs(self.term_timeout_secs)
    }

    /// Clamp out-of-range values instead of rejecting them.
    pub fn normalize(&mut self) {
        let d = self.certs.cert_duration_secs;
        let clamped = if d == 0 {
            MIN_CERT_DURATION_SECS
        } else {
            d.clamp(MIN_CERT_DURATION_SECS, MAX_CERT_DURATION_SECS)
        };
        if clamped != d {
            tracing::warn!(
                "config: cert_duration_secs {} out of range, clamped to {}",
                d,
                clamped
            );
            self.certs.cert_duration_secs = clamped;
        }

        if self.certs.refresh_throttle_secs < MIN_REFRESH_THROTTLE_SECS {
            tracing::warn!(
                "config: refresh_throttle_secs {} below floor, raised to {}",
                self.certs.refresh_throttle_secs,
                MIN_REFRESH_THROTTLE_SECS
            );
            self.certs.refresh_throttle_secs = MIN_REFRESH_THROTTLE_SECS;
        }
    }
}
