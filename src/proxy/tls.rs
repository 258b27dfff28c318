use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, OtherError, RootCertStore};

use crate::certs::{ClientIdentity, InstanceEndpoint};
use crate::error::ProxyError;

/// Build the client TLS configuration for one instance: mutual auth with the
/// ephemeral certificate, trust rooted at the instance's own CA.
pub fn client_config(
    identity: ClientIdentity,
    endpoint: &InstanceEndpoint,
) -> Result<rustls::ClientConfig, ProxyError> {
    let mut roots = RootCertStore::empty();
    roots
        .add(endpoint.ca_der.clone())
        .map_err(|e| ProxyError::Internal(format!("invalid server CA: {}", e)))?;

    let verifier = InstanceServerVerifier::new(roots, endpoint.server_name.clone());

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ProxyError::Internal(format!("tls protocol configuration: {}", e)))?
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(verifier))
    .with_client_auth_cert(vec![identity.cert_der], identity.key_der)
    .map_err(|e| ProxyError::Internal(format!("client certificate rejected: {}", e)))?;

    Ok(config)
}

/// Server certificate verifier for managed-SQL instances.
///
/// Instance server certificates carry the `project:name` identifier in their
/// subject CN rather than a DNS SAN, so the stock webpki name check cannot
/// apply. This verifier validates the chain against the instance CA and then
/// compares the leaf CN against the expected identifier; the SNI value passed
/// by the connector is ignored.
#[derive(Debug)]
pub struct InstanceServerVerifier {
    roots: RootCertStore,
    expected_name: String,
    provider: CryptoProvider,
}

impl InstanceServerVerifier {
    pub fn new(roots: RootCertStore, expected_name: String) -> Self {
        Self {
            roots,
            expected_name,
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

fn webpki_error(e: webpki::Error) -> rustls::Error {
    rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(e))))
}

/// Subject CN of a DER certificate, if present and printable.
fn leaf_common_name(der: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    name
}

impl ServerCertVerifier for InstanceServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = webpki::EndEntityCert::try_from(end_entity).map_err(webpki_error)?;
        cert.verify_for_usage(
            webpki::ALL_VERIFICATION_ALGS,
            &self.roots.roots,
            intermediates,
            now,
            webpki::KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(webpki_error)?;

        match leaf_common_name(end_entity) {
            Some(cn) if cn == self.expected_name => Ok(ServerCertVerified::assertion()),
            _ => Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName,
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestPki {
        ca_der: CertificateDer<'static>,
        server_der: CertificateDer<'static>,
    }

    fn make_pki(server_cn: &str) -> TestPki {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "Test Instance CA");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, server_cn);
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = params.signed_by(&server_key, &ca_cert, &ca_key).unwrap();

        TestPki {
            ca_der: ca_cert.der().clone(),
            server_der: server_cert.der().clone(),
        }
    }

    fn verifier_for(pki: &TestPki, expected: &str) -> InstanceServerVerifier {
        let mut roots = RootCertStore::empty();
        roots.add(pki.ca_der.clone()).unwrap();
        InstanceServerVerifier::new(roots, expected.to_string())
    }

    fn dummy_sni() -> ServerName<'static> {
        ServerName::try_from("unused.invalid").unwrap()
    }

    #[test]
    fn accepts_matching_instance_cn() {
        let pki = make_pki("myproj:mydb");
        let v = verifier_for(&pki, "myproj:mydb");
        let res = v.verify_server_cert(&pki.server_der, &[], &dummy_sni(), &[], UnixTime::now());
        assert!(res.is_ok(), "{:?}", res);
    }

    #[test]
    fn rejects_wrong_instance_cn() {
        let pki = make_pki("myproj:otherdb");
        let v = verifier_for(&pki, "myproj:mydb");
        let res = v.verify_server_cert(&pki.server_der, &[], &dummy_sni(), &[], UnixTime::now());
        assert!(matches!(
            res,
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName
            ))
        ));
    }

    #[test]
    fn rejects_certificate_from_foreign_ca() {
        let pki = make_pki("myproj:mydb");
        let other = make_pki("myproj:mydb");
        let mut roots = RootCertStore::empty();
        roots.add(other.ca_der.clone()).unwrap();
        let v = InstanceServerVerifier::new(roots, "myproj:mydb".to_string());
        let res = v.verify_server_cert(&pki.server_der, &[], &dummy_sni(), &[], UnixTime::now());
        assert!(res.is_err());
    }

    #[test]
    fn leaf_common_name_reads_subject() {
        let pki = make_pki("a:b");
        assert_eq!(leaf_common_name(&pki.server_der).as_deref(), Some("a:b"));
    }
}
