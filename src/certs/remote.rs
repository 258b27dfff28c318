use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::api::{ApiClient, ApiError, EphemeralCertRequest, InstanceInfo, IpMapping};
use crate::auth::TokenSource;
use crate::certs::{CertSource, ClientIdentity, InstanceEndpoint};
use crate::error::{ProxyError, ResolveError};
use crate::instance::InstanceName;

/// Total attempts against the control plane before a transient failure is
/// surfaced to the caller.
const MAX_ATTEMPTS: usize = 5;

/// First backoff step; subsequent steps grow by `BACKOFF_MULT`.
const BASE_BACKOFF: Duration = Duration::from_millis(200);
const BACKOFF_MULT: f64 = 1.618;

/// Retries ask the control plane for a snapshot this far in the past, letting
/// it serve a slightly stale but consistent read under contention.
const STALE_READ_WINDOW: Duration = Duration::from_secs(30);

/// Options for [`RemoteCertSource`], mirroring the `api` config section.
#[derive(Debug, Clone)]
pub struct RemoteCertOptions {
    /// Bind minted certificates to the access-token identity.
    pub enable_iam_login: bool,
    /// Treat region mismatches as fatal.
    pub check_region: bool,
    /// Preference-ordered address types (`PUBLIC` aliases `PRIMARY`).
    pub ip_address_types: Vec<String>,
    /// Upper bound on how long a minted certificate is trusted locally.
    pub cert_duration: Duration,
}

struct KeyMaterial {
    /// PKCS#8 DER private key, handed to rustls for client auth.
    private_pkcs8: Vec<u8>,
    /// SPKI PEM public key, submitted with certificate requests.
    public_pem: String,
}

/// [`CertSource`] backed by the database admin API.
///
/// One 2048-bit RSA key pair is generated per process, on first use, and
/// signs every ephemeral certificate request for the process lifetime.
pub struct RemoteCertSource {
    api: ApiClient,
    tokens: Arc<dyn TokenSource>,
    opts: RemoteCertOptions,
    key: OnceCell<Arc<KeyMaterial>>,
}

impl RemoteCertSource {
    pub fn new(api: ApiClient, tokens: Arc<dyn TokenSource>, opts: RemoteCertOptions) -> Self {
        Self {
            api,
            tokens,
            opts,
            key: OnceCell::new(),
        }
    }

    async fn key(&self) -> Result<Arc<KeyMaterial>, ProxyError> {
        self.key
            .get_or_try_init(|| async {
                // Key generation burns real CPU; keep it off the runtime.
                let material = tokio::task::spawn_blocking(generate_key)
                    .await
                    .map_err(|e| ProxyError::Internal(format!("keygen task failed: {}", e)))??;
                debug!("certs: generated process RSA key pair");
                Ok::<_, ProxyError>(Arc::new(material))
            })
            .await
            .cloned()
    }

    /// Metadata read with transient-failure retry.
    async fn fetch_metadata(&self, instance: &InstanceName) -> Result<InstanceInfo, ResolveError> {
        let mut attempt = 0;
        loop {
            match self.api.get_instance(instance).await {
                Ok(info) => return Ok(info),
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "certs: metadata read failed for {} (attempt {}/{}), retrying in {:?}: {}",
                        instance,
                        attempt + 1,
                        MAX_ATTEMPTS,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(map_api_error(e)),
            }
        }
    }

    /// Certificate mint with retry. After the first failure, requests carry a
    /// `readTime` hint in the past.
    async fn fetch_ephemeral(
        &self,
        instance: &InstanceName,
        mut req: EphemeralCertRequest,
    ) -> Result<String, ResolveError> {
        let mut attempt = 0;
        loop {
            match self.api.create_ephemeral_cert(instance, &req).await {
                Ok(resp) => return Ok(resp.ephemeral_cert.cert),
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "certs: ephemeral cert request failed for {} (attempt {}/{}), retrying in {:?}: {}",
                        instance,
                        attempt + 1,
                        MAX_ATTEMPTS,
                        delay,
                        e
                    );
                    req.read_time = Some(
                        humantime::format_rfc3339_seconds(SystemTime::now() - STALE_READ_WINDOW)
                            .to_string(),
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(map_api_error(e)),
            }
        }
    }
}

#[async_trait]
impl CertSource for RemoteCertSource {
    async fn local(&self, instance: &InstanceName) -> Result<ClientIdentity, ProxyError> {
        let key = self.key().await?;

        let mut req = EphemeralCertRequest {
            public_key: key.public_pem.clone(),
            access_token: None,
            read_time: None,
        };

        let mut token_expiry = None;
        if self.opts.enable_iam_login {
            // Force a refresh; the token expiry caps the certificate
            // lifetime, so it should be as distant as possible.
            let token = self.tokens.refresh().await?;
            token_expiry = token.expires_at;
            req.access_token = Some(token.token.trim_end_matches('.').to_string());
        }

        let cert_pem = self.fetch_ephemeral(instance, req).await?;
        let cert_der = parse_pem_certificate(&cert_pem)?;
        let mut not_after = certificate_not_after(&cert_der)?;

        if let Some(expiry) = token_expiry {
            if expiry < not_after {
                not_after = expiry;
            }
        }
        let local_cap = SystemTime::now() + self.opts.cert_duration;
        if local_cap < not_after {
            not_after = local_cap;
        }

        Ok(ClientIdentity {
            cert_der,
            key_der: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.private_pkcs8.clone())),
            not_after,
        })
    }

    async fn remote(&self, instance: &InstanceName) -> Result<InstanceEndpoint, ProxyError> {
        let info = self.fetch_metadata(instance).await?;

        enforce_region(&instance.region, &info.region, self.opts.check_region)?;

        if info.backend_type == "FIRST_GEN" {
            return Err(ResolveError::UnsupportedBackend(format!(
                "instance {} is a first-generation instance, which this proxy does not support",
                instance
            ))
            .into());
        }

        let ip_addr = select_address(&info.ip_addresses, &self.opts.ip_address_types)?;

        let ca_pem = info
            .server_ca_cert
            .as_ref()
            .map(|c| c.cert.as_str())
            .unwrap_or_default();
        if ca_pem.is_empty() {
            return Err(ProxyError::Resolve(ResolveError::Rejected(format!(
                "control plane returned no server CA for {}",
                instance
            ))));
        }
        let ca_der = parse_pem_certificate(ca_pem)?;

        Ok(InstanceEndpoint {
            ca_der,
            ip_addr,
            server_name: instance.server_name(),
            version: info.database_version,
        })
    }
}

fn generate_key() -> Result<KeyMaterial, ProxyError> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| ProxyError::Internal(format!("RSA key generation failed: {}", e)))?;
    let public_pem = private
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| ProxyError::Internal(format!("public key encoding failed: {}", e)))?;
    let private_pkcs8 = private
        .to_pkcs8_der()
        .map_err(|e| ProxyError::Internal(format!("private key encoding failed: {}", e)))?
        .as_bytes()
        .to_vec();
    Ok(KeyMaterial {
        private_pkcs8,
        public_pem,
    })
}

/// Delay before retry `attempt` (0-based): `base * mult^(attempt+1+jitter)`.
fn backoff_delay(attempt: usize) -> Duration {
    let jitter: f64 = rand::random();
    let exp = attempt as f64 + 1.0 + jitter;
    Duration::from_secs_f64(BASE_BACKOFF.as_secs_f64() * BACKOFF_MULT.powf(exp))
}

fn map_api_error(e: ApiError) -> ResolveError {
    match e {
        ApiError::Network(msg) => ResolveError::Transient(msg),
        ApiError::Status {
            code,
            reason,
            message,
        } => {
            if code >= 500 {
                ResolveError::Transient(format!("{} ({})", message, code))
            } else if code == 403 && reason == "insufficientPermissions" {
                ResolveError::PermissionDenied(message)
            } else if reason == "accessNotConfigured" {
                ResolveError::ApiDisabled(message)
            } else if code == 403 || code == 404 {
                ResolveError::NotFound(message)
            } else {
                ResolveError::Rejected(format!("{} ({})", message, code))
            }
        }
    }
}

/// The deprecated `us-central` region maps onto `us-central1`.
fn canonical_region(region: &str) -> &str {
    if region == "us-central" {
        "us-central1"
    } else {
        region
    }
}

fn enforce_region(requested: &str, reported: &str, strict: bool) -> Result<(), ResolveError> {
    if requested.is_empty() {
        // Legacy two-part name. A region may be omitted only when strict
        // checking is off; otherwise there is nothing to check against.
        if strict {
            return Err(ResolveError::RegionMismatch {
                want: String::new(),
                got: reported.to_string(),
            });
        }
        debug!("certs: no region in connection name, using {}", reported);
        return Ok(());
    }
    let want = canonical_region(requested);
    if want == reported {
        return Ok(());
    }
    if strict {
        return Err(ResolveError::RegionMismatch {
            want: want.to_string(),
            got: reported.to_string(),
        });
    }
    warn!(
        "certs: region mismatch (requested {}, instance reports {}), continuing with the reported region",
        want, reported
    );
    Ok(())
}

fn select_address(mappings: &[IpMapping], prefs: &[String]) -> Result<String, ResolveError> {
    for pref in prefs {
        let want = if pref == "PUBLIC" { "PRIMARY" } else { pref };
        if let Some(m) = mappings.iter().find(|m| m.kind == want) {
            return Ok(m.ip_address.clone());
        }
    }
    let have: Vec<&str> = mappings.iter().map(|m| m.kind.as_str()).collect();
    Err(ResolveError::NoUsableAddress(format!(
        "none of the preferred address types {:?} is assigned; instance has {:?}",
        prefs, have
    )))
}

fn parse_pem_certificate(pem: &str) -> Result<CertificateDer<'static>, ProxyError> {
    let mut reader = std::io::BufReader::new(Cursor::new(pem.as_bytes()));
    let result = rustls_pemfile::certs(&mut reader)
        .next()
        .transpose()
        .map_err(|e| ProxyError::Internal(format!("certificate parse failed: {}", e)))?
        .ok_or_else(|| ProxyError::Internal("no certificate in PEM block".to_string()));
    result
}

fn certificate_not_after(der: &CertificateDer<'_>) -> Result<SystemTime, ProxyError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| ProxyError::Internal(format!("certificate parse failed: {}", e)))?;
    let secs = cert
        .validity()
        .not_after
        .timestamp()
        .try_into()
        .unwrap_or_default();
    Ok(UNIX_EPOCH + Duration::from_secs(secs))
}
