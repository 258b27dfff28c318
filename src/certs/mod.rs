pub mod remote;

pub use remote::{RemoteCertOptions, RemoteCertSource};

use std::time::SystemTime;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::ProxyError;
use crate::instance::InstanceName;

/// An ephemeral client certificate plus the key that signed its request.
pub struct ClientIdentity {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub not_after: SystemTime,
}

/// Everything needed to dial one instance: its trust root, where it lives,
/// the identifier its server certificate carries, and the database version
/// (which decides the filesystem socket layout).
#[derive(Debug, Clone)]
pub struct InstanceEndpoint {
    pub ca_der: CertificateDer<'static>,
    pub ip_addr: String,
    pub server_name: String,
    pub version: String,
}

/// Capability seam for TLS material. The broker and listener manager depend
/// on this trait only, so tests inject deterministic implementations.
#[async_trait]
pub trait CertSource: Send + Sync {
    /// Mint (or fetch) an ephemeral client certificate for the instance.
    async fn local(&self, instance: &InstanceName) -> Result<ClientIdentity, ProxyError>;

    /// Fetch dialing metadata for the instance.
    async fn remote(&self, instance: &InstanceName) -> Result<InstanceEndpoint, ProxyError>;
}
