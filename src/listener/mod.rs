use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::is_postgres;
use crate::certs::CertSource;
use crate::error::ProxyError;
use crate::instance::{
    parse_instance_list, InstanceName, ListenAddr, ListenerSpec, NetProbe, POSTGRES_SOCKET_NAME,
};
use crate::proxy::Conn;

/// Pacing floor between accept attempts after a temporary error.
const ACCEPT_PACE: Duration = Duration::from_millis(10);

/// TCP keep-alive period on accepted client connections.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// Longest filesystem socket path the platform accepts (`sun_path`).
#[cfg(target_os = "macos")]
const MAX_SOCKET_PATH: usize = 103;
#[cfg(not(target_os = "macos"))]
const MAX_SOCKET_PATH: usize = 107;

pub struct ListenerOptions {
    pub dir: PathBuf,
    pub skip_failed: bool,
    pub probe: NetProbe,
}

/// One open listener and the means to tear it down.
struct ActiveListener {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
    socket_path: Option<PathBuf>,
    /// Bound address, for logs and tests.
    local_desc: String,
}

impl ActiveListener {
    async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        if let Some(path) = &self.socket_path {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("listener: socket file {} not removed: {}", path.display(), e);
            }
        }
    }
}

/// Owns the set of local listeners: opens the static set at startup, then
/// reconciles a dynamic set against the update stream. Accepted connections
/// are handed to the broker through a bounded channel.
///
/// The listener tables are private to this type; the broker sees only the
/// channel, which keeps the two lifecycles decoupled.
pub struct ListenerManager {
    opts: ListenerOptions,
    certs: Arc<dyn CertSource>,
    conns_tx: mpsc::Sender<Conn>,
    static_table: HashMap<String, ActiveListener>,
    dynamic_table: HashMap<String, ActiveListener>,
}

impl ListenerManager {
    pub fn new(
        opts: ListenerOptions,
        certs: Arc<dyn CertSource>,
        conns_tx: mpsc::Sender<Conn>,
    ) -> Self {
        Self {
            opts,
            certs,
            conns_tx,
            static_table: HashMap::new(),
            dynamic_table: HashMap::new(),
        }
    }

    /// Open one listener per configured instance. A failure is fatal unless
    /// `skip_failed` is set, in which case the entry is logged and dropped.
    pub async fn start_static(&mut self, raw_instances: &[String]) -> Result<(), ProxyError> {
        for raw in raw_instances {
            let spec = match ListenerSpec::parse(raw, &self.opts.probe) {
                Ok(s) => s,
                Err(e) => {
                    if self.opts.skip_failed {
                        error!("listener: skipping {:?}: {}", raw, e);
                        continue;
                    }
                    return Err(e);
                }
            };
            let key = spec.instance.to_string();
            if self.static_table.contains_key(&key) {
                debug!("listener: duplicate instance {} ignored", key);
                continue;
            }
            match self.open(&spec).await {
                Ok(l) => {
                    info!("listener: {} ready on {}", key, l.local_desc);
                    self.static_table.insert(key, l);
                }
                Err(e) => {
                    if self.opts.skip_failed {
                        error!("listener: skipping {}: {}", key, e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        self.update_listener_gauge();
        Ok(())
    }

    fn update_listener_gauge(&self) {
        metrics::gauge!("sqltunnel_listeners_active")
            .set((self.static_table.len() + self.dynamic_table.len()) as f64);
    }

    /// Bound addresses of all open listeners (static + dynamic).
    pub fn bound(&self) -> Vec<(String, String)> {
        self.static_table
            .iter()
            .chain(self.dynamic_table.iter())
            .map(|(k, l)| (k.clone(), l.local_desc.clone()))
            .collect()
    }

    /// Serve updates until shutdown, then close everything and remove socket
    /// files. With no update stream this just parks until shutdown.
    pub async fn run(mut self, updates: Option<mpsc::Receiver<String>>, shutdown: CancellationToken) {
        match updates {
            Some(mut rx) => loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(m) => self.reconcile(&m).await,
                        None => {
                            debug!("listener: update stream closed");
                            shutdown.cancelled().await;
                            break;
                        }
                    }
                }
            },
            None => shutdown.cancelled().await,
        }
        self.close_all().await;
    }

    /// Bring the dynamic listener set in line with one update message.
    /// Instances named statically are never touched; carried-forward dynamic
    /// listeners see no churn; dropped ones are closed without affecting
    /// in-flight proxied connections.
    pub async fn reconcile(&mut self, msg: &str) {
        let mut wanted: HashSet<String> = HashSet::new();

        for raw in parse_instance_list(msg) {
            let spec = match ListenerSpec::parse(&raw, &self.opts.probe) {
                Ok(s) => s,
                Err(e) => {
                    error!("listener: bad dynamic entry {:?}: {}", raw, e);
                    continue;
                }
            };
            let key = spec.instance.to_string();
            wanted.insert(key.clone());

            if self.static_table.contains_key(&key) || self.dynamic_table.contains_key(&key) {
                continue;
            }
            match self.open(&spec).await {
                Ok(l) => {
                    info!("listener: {} ready on {} (dynamic)", key, l.local_desc);
                    self.dynamic_table.insert(key, l);
                }
                Err(e) => error!("listener: couldn't open {}: {}", key, e),
            }
        }

        let dropped: Vec<String> = self
            .dynamic_table
            .keys()
            .filter(|k| !wanted.contains(*k))
            .cloned()
            .collect();
        for key in dropped {
            if let Some(l) = self.dynamic_table.remove(&key) {
                info!("listener: {} removed by update", key);
                l.close().await;
            }
        }

        metrics::counter!("sqltunnel_instance_updates_total").increment(1);
        self.update_listener_gauge();
    }

    async fn close_all(&mut self) {
        for (_, l) in self
            .static_table
            .drain()
            .chain(self.dynamic_table.drain())
        {
            l.close().await;
        }
        self.update_listener_gauge();
        info!("listener: all listeners closed");
    }

    async fn open(&self, spec: &ListenerSpec) -> Result<ActiveListener, ProxyError> {
        match &spec.addr {
            ListenAddr::Tcp(addr) => self.open_tcp(&spec.instance, addr).await,
            ListenAddr::UnixPath(path) => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    self.opts.dir.join(path)
                };
                self.open_unix(&spec.instance, path).await
            }
            ListenAddr::UnixDefault => {
                let path = self.default_socket_path(&spec.instance).await?;
                self.open_unix(&spec.instance, path).await
            }
        }
    }

    /// Default socket path for an instance. PostgreSQL clients expect a
    /// directory named after the instance containing the well-known socket
    /// file; everything else gets a socket named after the instance.
    async fn default_socket_path(&self, instance: &InstanceName) -> Result<PathBuf, ProxyError> {
        let endpoint = self.certs.remote(instance).await?;
        if is_postgres(&endpoint.version) {
            let parent = self.opts.dir.join(instance.to_string());
            std::fs::create_dir_all(&parent).map_err(|e| {
                ProxyError::config(format!(
                    "couldn't create socket directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
            set_mode(&parent, 0o755);
            Ok(parent.join(POSTGRES_SOCKET_NAME))
        } else {
            Ok(self.opts.dir.join(instance.to_string()))
        }
    }

    async fn open_tcp(
        &self,
        instance: &InstanceName,
        addr: &str,
    ) -> Result<ActiveListener, ProxyError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::config(format!("couldn't bind {}: {}", addr, e)))?;
        let local_desc = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop_tcp(
            listener,
            instance.clone(),
            self.conns_tx.clone(),
            cancel.clone(),
        ));
        Ok(ActiveListener {
            cancel,
            task,
            socket_path: None,
            local_desc,
        })
    }

    async fn open_unix(
        &self,
        instance: &InstanceName,
        path: PathBuf,
    ) -> Result<ActiveListener, ProxyError> {
        check_socket_path(&path)?;

        // A stale socket from a previous run would make bind fail.
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                ProxyError::config(format!(
                    "couldn't remove stale socket {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProxyError::config(format!(
                    "couldn't create socket directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let listener = UnixListener::bind(&path)
            .map_err(|e| ProxyError::config(format!("couldn't bind {}: {}", path.display(), e)))?;
        set_mode(&path, 0o777);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop_unix(
            listener,
            instance.clone(),
            self.conns_tx.clone(),
            cancel.clone(),
        ));
        Ok(ActiveListener {
            cancel,
            task,
            local_desc: path.display().to_string(),
            socket_path: Some(path),
        })
    }
}

/// Pre-check the `sun_path` limit: some platforms silently truncate long
/// paths at bind time, which surfaces later as an inscrutable EINVAL.
fn check_socket_path(path: &Path) -> Result<(), ProxyError> {
    let len = path.as_os_str().len();
    if len > MAX_SOCKET_PATH {
        return Err(ProxyError::config(format!(
            "socket path {} is {} bytes, over the platform limit of {}; use a shorter --dir",
            path.display(),
            len,
            MAX_SOCKET_PATH
        )));
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        warn!("listener: chmod {:o} {} failed: {}", mode, path.display(), e);
    }
}

/// Accept errors worth pacing and retrying rather than giving up on the
/// listener.
fn is_temporary(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}

async fn accept_loop_tcp(
    listener: TcpListener,
    instance: InstanceName,
    tx: mpsc::Sender<Conn>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    debug!("listener: {} accepted {}", instance, peer);
                    set_keepalive(&stream);
                    let conn = Conn { instance: instance.clone(), stream: Box::new(stream) };
                    if tx.send(conn).await.is_err() {
                        return;
                    }
                }
                Err(e) if is_temporary(&e) => {
                    warn!("listener: {} temporary accept error: {}", instance, e);
                    tokio::time::sleep(ACCEPT_PACE).await;
                }
                Err(e) => {
                    error!("listener: {} accept failed, closing: {}", instance, e);
                    return;
                }
            }
        }
    }
}

async fn accept_loop_unix(
    listener: UnixListener,
    instance: InstanceName,
    tx: mpsc::Sender<Conn>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            res = listener.accept() => match res {
                Ok((stream, _)) => {
                    debug!("listener: {} accepted local connection", instance);
                    let conn = Conn { instance: instance.clone(), stream: Box::new(stream) };
                    if tx.send(conn).await.is_err() {
                        return;
                    }
                }
                Err(e) if is_temporary(&e) => {
                    warn!("listener: {} temporary accept error: {}", instance, e);
                    tokio::time::sleep(ACCEPT_PACE).await;
                }
                Err(e) => {
                    error!("listener: {} accept failed, closing: {}", instance, e);
                    return;
                }
            }
        }
    }
}

fn set_keepalive(stream: &TcpStream) {
    let sock = socket2::SockRef::from(stream);
    let ka = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    if let Err(e) = sock.set_tcp_keepalive(&ka) {
        warn!("listener: couldn't enable keep-alive: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::{ClientIdentity, InstanceEndpoint};
    use crate::error::ProxyError;
    use async_trait::async_trait;

    struct VersionCerts {
        version: &'static str,
    }

    #[async_trait]
    impl CertSource for VersionCerts {
        async fn local(&self, _instance: &InstanceName) -> Result<ClientIdentity, ProxyError> {
            Err(ProxyError::Internal("not used in listener tests".into()))
        }

        async fn remote(&self, instance: &InstanceName) -> Result<InstanceEndpoint, ProxyError> {
            let key = rcgen::KeyPair::generate().unwrap();
            let params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
            let cert = params.self_signed(&key).unwrap();
            Ok(InstanceEndpoint {
                ca_der: cert.der().clone(),
                ip_addr: "127.0.0.1".into(),
                server_name: instance.server_name(),
                version: self.version.to_string(),
            })
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sqltunnel-lst-{}-{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf, version: &'static str) -> (ListenerManager, mpsc::Receiver<Conn>) {
        let (tx, rx) = mpsc::channel(1);
        let mgr = ListenerManager::new(
            ListenerOptions {
                dir,
                skip_failed: false,
                probe: NetProbe::probe(),
            },
            Arc::new(VersionCerts { version }),
            tx,
        );
        (mgr, rx)
    }

    #[tokio::test]
    async fn static_unix_listener_accepts_and_forwards() {
        let dir = temp_dir("fwd");
        let (mut mgr, mut rx) = manager(dir.clone(), "MYSQL_8_0");
        mgr.start_static(&["proj:reg:db".to_string()]).await.unwrap();

        let path = dir.join("proj:reg:db");
        assert!(path.exists());

        let mut client = tokio::net::UnixStream::connect(&path).await.unwrap();
        let conn = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.instance.to_string(), "proj:reg:db");

        // The stream is live end to end.
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client.write_all(b"hello").await.unwrap();
        let mut server_side = conn.stream;
        let mut buf = [0u8; 5];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        mgr.close_all().await;
        assert!(!path.exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn postgres_instances_get_the_well_known_socket_name() {
        let dir = temp_dir("pg");
        let (mut mgr, _rx) = manager(dir.clone(), "POSTGRES_15");
        mgr.start_static(&["proj:reg:pgdb".to_string()])
            .await
            .unwrap();

        let socket = dir.join("proj:reg:pgdb").join(POSTGRES_SOCKET_NAME);
        assert!(socket.exists());

        mgr.close_all().await;
        assert!(!socket.exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn overlong_socket_path_is_a_config_error() {
        let dir = PathBuf::from(format!("/tmp/{}", "x".repeat(120)));
        let (mut mgr, _rx) = manager(dir, "MYSQL_8_0");
        let err = mgr
            .start_static(&["proj:reg:db".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("platform limit"), "{}", err);
    }

    #[tokio::test]
    async fn skip_failed_drops_bad_entries_but_keeps_good_ones() {
        let dir = temp_dir("skip");
        let (tx, _rx) = mpsc::channel(1);
        let mut mgr = ListenerManager::new(
            ListenerOptions {
                dir: dir.clone(),
                skip_failed: true,
                probe: NetProbe::probe(),
            },
            Arc::new(VersionCerts { version: "MYSQL_8_0" }),
            tx,
        );
        mgr.start_static(&[
            "not-an-instance".to_string(),
            "proj:reg:ok".to_string(),
        ])
        .await
        .unwrap();

        assert_eq!(mgr.bound().len(), 1);
        mgr.close_all().await;
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn dynamic_updates_reconcile_listener_set() {
        let dir = temp_dir("dyn");
        let (mut mgr, _rx) = manager(dir.clone(), "MYSQL_8_0");

        let sock_a = dir.join("p:r:a");
        let sock_b = dir.join("p:r:b");

        mgr.reconcile("p:r:a").await;
        assert!(sock_a.exists());
        assert!(!sock_b.exists());

        mgr.reconcile("p:r:a,p:r:b").await;
        assert!(sock_a.exists());
        assert!(sock_b.exists());

        mgr.reconcile("p:r:a").await;
        assert!(sock_a.exists());
        assert!(!sock_b.exists(), "dropped listener's socket must be removed");

        // Reconciling the same set again is a no-op.
        mgr.reconcile("p:r:a").await;
        assert!(sock_a.exists());
        assert_eq!(mgr.bound().len(), 1);

        mgr.close_all().await;
        assert!(!sock_a.exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn static_instances_suppress_dynamic_duplicates() {
        let dir = temp_dir("supp");
        let (mut mgr, _rx) = manager(dir.clone(), "MYSQL_8_0");
        mgr.start_static(&["p:r:a".to_string()]).await.unwrap();

        mgr.reconcile("p:r:a,p:r:b").await;
        assert_eq!(mgr.dynamic_table.len(), 1);
        assert!(mgr.dynamic_table.contains_key("p:r:b"));

        // An update dropping the static instance must not close it.
        mgr.reconcile("p:r:b").await;
        assert!(mgr.static_table.contains_key("p:r:a"));
        assert!(dir.join("p:r:a").exists());

        mgr.close_all().await;
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn empty_update_closes_all_dynamic_listeners() {
        let dir = temp_dir("empty");
        let (mut mgr, _rx) = manager(dir.clone(), "MYSQL_8_0");

        mgr.reconcile("p:r:a,p:r:b").await;
        assert_eq!(mgr.dynamic_table.len(), 2);

        mgr.reconcile("").await;
        assert!(mgr.dynamic_table.is_empty());

        mgr.close_all().await;
        std::fs::remove_dir_all(&dir).ok();
    }
}
