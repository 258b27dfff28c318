//! End-to-end scenarios against a real TLS echo server on loopback, with
//! deterministic fakes injected at the certificate-source and dialer seams.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UnixStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use sqltunnel::certs::{CertSource, ClientIdentity, InstanceEndpoint};
use sqltunnel::error::ProxyError;
use sqltunnel::instance::{InstanceName, NetProbe};
use sqltunnel::listener::{ListenerManager, ListenerOptions};
use sqltunnel::proxy::{self, BoxedStream, Client, ClientOptions, Conn, Dialer, TcpDialer};

// ---------------------------------------------------------------------------
// Test fixtures: a CA, a server certificate carrying the instance identifier
// in its CN, a TLS echo server, and fake cert-source/dialer implementations.
// ---------------------------------------------------------------------------

struct TestPki {
    ca_der: CertificateDer<'static>,
    server_config: Arc<rustls::ServerConfig>,
    client_cert: CertificateDer<'static>,
    client_key_pkcs8: Vec<u8>,
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
    let mut server_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    server_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, server_cn);
    server_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .unwrap();

    let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
        vec![server_cert.der().clone()],
        PrivateKeyDer::Pkcs8(server_key.serialize_der().into()),
    )
    .unwrap();

    let client_key = rcgen::KeyPair::generate().unwrap();
    let mut client_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    client_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "ephemeral-client");
    let client_cert = client_params.self_signed(&client_key).unwrap();

    TestPki {
        ca_der: ca_cert.der().clone(),
        server_config: Arc::new(server_config),
        client_cert: client_cert.der().clone(),
        client_key_pkcs8: client_key.serialize_der(),
    }
}

/// TLS echo server on an ephemeral loopback port. Returns the port.
async fn start_tls_echo(server_config: Arc<rustls::ServerConfig>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let acceptor = TlsAcceptor::from(server_config);
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut buf = [0u8; 4096];
                loop {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tls.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

/// Cert source handing out the fixture material. Counts resolves, can hold
/// them on a gate, and can serve a wrong identifier for the first resolve.
struct FakeCerts {
    pki: TestPki,
    resolves: AtomicUsize,
    gate: Option<Arc<tokio::sync::Semaphore>>,
    wrong_name_first: bool,
    version: String,
}

impl FakeCerts {
    fn new(pki: TestPki) -> Self {
        Self {
            pki,
            resolves: AtomicUsize::new(0),
            gate: None,
            wrong_name_first: false,
            version: "MYSQL_8_0".to_string(),
        }
    }

    fn resolves(&self) -> usize {
        self.resolves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertSource for FakeCerts {
    async fn local(&self, _instance: &InstanceName) -> Result<ClientIdentity, ProxyError> {
        Ok(ClientIdentity {
            cert_der: self.pki.client_cert.clone(),
            key_der: PrivateKeyDer::Pkcs8(self.pki.client_key_pkcs8.clone().into()),
            not_after: SystemTime::now() + Duration::from_secs(3600),
        })
    }

    async fn remote(&self, instance: &InstanceName) -> Result<InstanceEndpoint, ProxyError> {
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await.unwrap();
        }
        let n = self.resolves.fetch_add(1, Ordering::SeqCst);
        let server_name = if self.wrong_name_first && n == 0 {
            "someone:else".to_string()
        } else {
            instance.server_name()
        };
        Ok(InstanceEndpoint {
            ca_der: self.pki.ca_der.clone(),
            ip_addr: "127.0.0.1".to_string(),
            server_name,
            version: self.version.clone(),
        })
    }
}

struct CountingDialer {
    inner: TcpDialer,
    dials: AtomicUsize,
}

impl CountingDialer {
    fn new() -> Self {
        Self {
            inner: TcpDialer,
            dials: AtomicUsize::new(0),
        }
    }

    fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self, addr: &str) -> std::io::Result<BoxedStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(addr).await
    }
}

fn inst() -> InstanceName {
    InstanceName::parse("proj:reg:db").unwrap()
}

fn options(port: u16) -> ClientOptions {
    ClientOptions {
        port,
        dial_timeout: Duration::from_secs(5),
        refresh_throttle: Duration::from_secs(1),
        ..ClientOptions::default()
    }
}

async fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_dials_resolve_once() {
    let pki = make_pki("proj:db");
    let port = start_tls_echo(pki.server_config.clone()).await;
    let certs = Arc::new(FakeCerts::new(pki));
    let dialer = Arc::new(CountingDialer::new());
    let client = Client::new(certs.clone(), dialer.clone(), options(port));

    for i in 0..5 {
        let mut stream = client.dial(&inst()).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello", "round {} must echo", i);
    }

    assert_eq!(certs.resolves(), 1, "five dials share one resolve");
    assert_eq!(dialer.dials(), 5);
}

#[tokio::test]
async fn concurrent_dials_share_one_resolve() {
    let pki = make_pki("proj:db");
    let port = start_tls_echo(pki.server_config.clone()).await;
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let certs = Arc::new(FakeCerts {
        gate: Some(gate.clone()),
        ..FakeCerts::new(pki)
    });
    let client = Client::new(certs.clone(), Arc::new(TcpDialer), options(port));

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move { client.dial(&inst()).await }));
    }

    // Let every dialer queue up on the in-flight refresh, then release it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.add_permits(100);

    for t in tasks {
        assert!(t.await.unwrap().is_ok());
    }
    assert_eq!(certs.resolves(), 1, "twenty concurrent dials, one resolve");
}

#[tokio::test]
async fn max_connections_gate_refuses_the_eleventh() {
    let pki = make_pki("proj:db");
    let port = start_tls_echo(pki.server_config.clone()).await;
    let certs = Arc::new(FakeCerts::new(pki));
    let dialer = Arc::new(CountingDialer::new());
    let client = Client::new(
        certs,
        dialer.clone(),
        ClientOptions {
            max_connections: 10,
            ..options(port)
        },
    );

    let mut client_halves = Vec::new();
    let mut tasks = Vec::new();
    for _ in 0..11 {
        let (local, remote) = tokio::io::duplex(4096);
        client_halves.push(local);
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client
                .handle_conn(Conn {
                    instance: inst(),
                    stream: Box::new(remote),
                })
                .await;
        }));
    }

    assert!(
        wait_until(Duration::from_secs(2), || dialer.dials() == 10).await,
        "ten connections must dial"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(dialer.dials(), 10, "the gated connection must never dial");

    // Hang up the local sides; every handler finishes and unregisters.
    drop(client_halves);
    for t in tasks {
        tokio::time::timeout(Duration::from_secs(2), t)
            .await
            .unwrap()
            .unwrap();
    }
    assert!(client.conn_set().is_empty());
    assert_eq!(client.active_connections(), 0);
}

#[tokio::test]
async fn handshake_failure_invalidates_and_retries_once() {
    let pki = make_pki("proj:db");
    let port = start_tls_echo(pki.server_config.clone()).await;
    let certs = Arc::new(FakeCerts {
        wrong_name_first: true,
        ..FakeCerts::new(pki)
    });
    let client = Client::new(certs.clone(), Arc::new(TcpDialer), options(port));

    // First resolve yields a configuration expecting the wrong identifier, so
    // the handshake fails; the entry is invalidated and the dial retried
    // against a fresh resolve.
    let mut stream = client.dial(&inst()).await.unwrap();
    assert_eq!(certs.resolves(), 2);

    stream.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
}

#[tokio::test]
async fn shutdown_times_out_while_traffic_is_flowing() {
    let pki = make_pki("proj:db");
    let port = start_tls_echo(pki.server_config.clone()).await;
    let certs = Arc::new(FakeCerts::new(pki));
    let client = Client::new(certs, Arc::new(TcpDialer), options(port));

    let (mut local, remote) = tokio::io::duplex(4096);
    let handler = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .handle_conn(Conn {
                    instance: inst(),
                    stream: Box::new(remote),
                })
                .await;
        }
    });
    assert!(
        wait_until(Duration::from_secs(2), || !client.conn_set().is_empty()).await,
        "connection must register"
    );

    // Keep the connection visibly active while shutdown waits.
    let chatter = tokio::spawn(async move {
        let mut buf = [0u8; 4];
        loop {
            if local.write_all(b"ping").await.is_err() {
                break;
            }
            if local.read_exact(&mut buf).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let started = Instant::now();
    let res = client.shutdown(Duration::from_millis(100)).await;
    let elapsed = started.elapsed();

    assert!(matches!(res, Err(ProxyError::ShutdownTimeout { open: 1 })));
    assert!(
        elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(600),
        "shutdown took {:?}",
        elapsed
    );

    // The forced close unwinds the handler and empties the registry.
    tokio::time::timeout(Duration::from_secs(2), handler)
        .await
        .unwrap()
        .unwrap();
    assert!(client.conn_set().is_empty());
    chatter.abort();
}

#[tokio::test]
async fn bytes_flow_end_to_end_through_a_unix_listener() {
    let pki = make_pki("proj:db");
    let port = start_tls_echo(pki.server_config.clone()).await;
    let certs = Arc::new(FakeCerts::new(pki));
    let client = Client::new(certs.clone(), Arc::new(TcpDialer), options(port));

    let dir = std::env::temp_dir().join(format!("sqltunnel-e2e-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();

    let (conns_tx, conns_rx) = mpsc::channel(1);
    let mut listeners = ListenerManager::new(
        ListenerOptions {
            dir: dir.clone(),
            skip_failed: false,
            probe: NetProbe::probe(),
        },
        certs,
        conns_tx,
    );
    listeners
        .start_static(&["proj:reg:db".to_string()])
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let listener_task = tokio::spawn(listeners.run(None, shutdown.clone()));
    let broker_task = tokio::spawn({
        let client = client.clone();
        async move { client.run(conns_rx).await }
    });

    let socket = dir.join("proj:reg:db");
    let mut local = UnixStream::connect(&socket).await.unwrap();
    local.write_all(b"select 1;").await.unwrap();
    let mut buf = [0u8; 9];
    local.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"select 1;");
    drop(local);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), listener_task)
        .await
        .unwrap()
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), broker_task)
        .await
        .unwrap()
        .unwrap();
    assert!(!socket.exists(), "socket file must be removed at shutdown");

    client.shutdown(Duration::from_secs(1)).await.unwrap();
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn default_broker_serves_the_convenience_dial() {
    let pki = make_pki("proj:db");
    let port = start_tls_echo(pki.server_config.clone()).await;
    let certs = Arc::new(FakeCerts::new(pki));
    let client = Client::new(certs, Arc::new(TcpDialer), options(port));

    proxy::set_default_client(client);
    let mut stream = proxy::dial("proj:reg:db").await.unwrap();
    stream.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hi");

    assert!(proxy::dial("not-a-name").await.is_err());
}
