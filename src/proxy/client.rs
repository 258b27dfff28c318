use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use rustls::pki_types::ServerName;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::certs::CertSource;
use crate::error::ProxyError;
use crate::instance::InstanceName;
use crate::proxy::{pump, tls, Conn, ConnSet, Dialer, RemoteStream};

/// Shutdown sweep cadence.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Broker tunables, fed from the resolved configuration.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Remote port instances accept TLS connections on.
    pub port: u16,
    /// 0 disables the gate.
    pub max_connections: u64,
    /// Minimum interval between forced refreshes per instance.
    pub refresh_throttle: Duration,
    /// Proactive refresh runs this long before certificate expiry.
    pub refresh_buffer: Duration,
    /// Budget for TCP connect plus TLS handshake on each dial.
    pub dial_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            port: 3307,
            max_connections: 0,
            refresh_throttle: Duration::from_secs(30),
            refresh_buffer: Duration::from_secs(300),
            dial_timeout: Duration::from_secs(30),
        }
    }
}

/// TLS material prepared for dialing one instance.
#[derive(Clone)]
pub struct ReadyConfig {
    pub addr: String,
    pub tls: Arc<rustls::ClientConfig>,
    pub version: String,
}

/// Result of one resolver run. Immutable; a refresh replaces the whole value.
/// Error outcomes are cached too; they short-circuit dials until the entry
/// is invalidated or the refresh throttle window elapses.
pub struct ResolveOutcome {
    pub result: Result<ReadyConfig, ProxyError>,
    pub refreshed_at: Instant,
    pub not_after: Option<SystemTime>,
}

/// One cache slot. A slot whose watch still holds `None` is an in-flight
/// refresh: readers block on the watch instead of launching duplicate work.
struct CacheSlot {
    started_at: Instant,
    rx: watch::Receiver<Option<Arc<ResolveOutcome>>>,
}

struct Shared {
    certs: Arc<dyn CertSource>,
    dialer: Arc<dyn Dialer>,
    opts: ClientOptions,
    conns: ConnSet,
    cfg_cache: Mutex<HashMap<String, CacheSlot>>,
    conn_count: AtomicU64,
    next_conn_id: AtomicU64,
    shutdown: CancellationToken,
}

/// The connection broker: keeps per-instance TLS configurations fresh, dials
/// instances through them, and pumps accepted local connections.
///
/// Cheaply cloneable; all clones share one cache and connection registry.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    pub fn new(certs: Arc<dyn CertSource>, dialer: Arc<dyn Dialer>, opts: ClientOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                certs,
                dialer,
                opts,
                conns: ConnSet::new(),
                cfg_cache: Mutex::new(HashMap::new()),
                conn_count: AtomicU64::new(0),
                next_conn_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn conn_set(&self) -> &ConnSet {
        &self.shared.conns
    }

    pub fn active_connections(&self) -> u64 {
        self.shared.conn_count.load(Ordering::SeqCst)
    }

    pub fn max_connections(&self) -> u64 {
        self.shared.opts.max_connections
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Dial the instance through the cached TLS configuration.
    ///
    /// A TLS handshake failure invalidates the cache entry and is retried
    /// exactly once against a freshly resolved configuration.
    pub async fn dial(&self, instance: &InstanceName) -> Result<RemoteStream, ProxyError> {
        match self.try_dial(instance).await {
            Err(ProxyError::Handshake(first)) => {
                debug!(
                    "dial {}: handshake failed ({}), retrying with fresh configuration",
                    instance, first
                );
                self.try_dial(instance).await
            }
            other => other,
        }
    }

    async fn try_dial(&self, instance: &InstanceName) -> Result<RemoteStream, ProxyError> {
        let outcome = self.cached_config(instance, false).await?;
        let cfg = match &outcome.result {
            Ok(c) => c.clone(),
            Err(e) => return Err(e.clone()),
        };

        let dial = async {
            let stream = self
                .shared
                .dialer
                .dial(&cfg.addr)
                .await
                .map_err(|e| ProxyError::Connect(format!("{}: {}", cfg.addr, e)))?;
            let connector = TlsConnector::from(cfg.tls.clone());
            connector
                .connect(server_name_for(&cfg.addr), stream)
                .await
                .map_err(|e| ProxyError::Handshake(e.to_string()))
        };

        match tokio::time::timeout(self.shared.opts.dial_timeout, dial).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => {
                if matches!(e, ProxyError::Handshake(_)) {
                    self.invalidate(instance, &outcome);
                }
                Err(e)
            }
            Err(_) => Err(ProxyError::Connect(format!(
                "dial {} timed out after {:?}",
                cfg.addr, self.shared.opts.dial_timeout
            ))),
        }
    }

    /// Current cached configuration for the instance, blocking on an
    /// in-flight refresh or starting one as needed. Within the refresh
    /// throttle window the current entry is served even when stale or
    /// `force` is set, since the throttle protects control-plane quota.
    pub async fn cached_config(
        &self,
        instance: &InstanceName,
        force: bool,
    ) -> Result<Arc<ResolveOutcome>, ProxyError> {
        let key = instance.to_string();

        let (mut rx, tx) = {
            let mut cache = self.shared.cfg_cache.lock().unwrap();
            let now = Instant::now();

            let start_refresh = match cache.get(&key) {
                None => true,
                Some(slot) => {
                    let current = slot.rx.borrow().clone();
                    match current {
                        // In-flight refresh: join it.
                        None => false,
                        Some(outcome) => {
                            let stale = match (&outcome.result, outcome.not_after) {
                                (Err(_), _) => true,
                                (Ok(_), Some(t)) => SystemTime::now() >= t,
                                (Ok(_), None) => false,
                            };
                            (force || stale)
                                && now.duration_since(slot.started_at)
                                    >= self.shared.opts.refresh_throttle
                        }
                    }
                }
            };

            if start_refresh {
                let (tx, rx) = watch::channel(None);
                cache.insert(
                    key.clone(),
                    CacheSlot {
                        started_at: now,
                        rx: rx.clone(),
                    },
                );
                (rx, Some(tx))
            } else {
                (cache.get(&key).expect("slot just observed").rx.clone(), None)
            }
        };

        if let Some(tx) = tx {
            // Run the refresh in its own task: a dialer that gives up on
            // waiting must not abort the work other dialers are joined on.
            let client = self.clone();
            let inst = instance.clone();
            tokio::spawn(async move { client.refresh(inst, tx).await });
        }

        let outcome = {
            let guard = rx
                .wait_for(|v| v.is_some())
                .await
                .map_err(|_| ProxyError::Internal("configuration refresh aborted".to_string()))?;
            guard.clone().expect("watch value just checked")
        };
        Ok(outcome)
    }

    async fn refresh(&self, instance: InstanceName, tx: watch::Sender<Option<Arc<ResolveOutcome>>>) {
        let resolved = self.resolve(&instance).await;
        let (result, not_after) = match resolved {
            Ok((cfg, na)) => {
                info!(
                    "certs: refreshed configuration for {} (addr {}, valid until {})",
                    instance,
                    cfg.addr,
                    humantime::format_rfc3339_seconds(na)
                );
                metrics::counter!("sqltunnel_cert_refreshes_total", "result" => "success")
                    .increment(1);
                (Ok(cfg), Some(na))
            }
            Err(e) => {
                warn!("certs: refresh failed for {}: {}", instance, e);
                metrics::counter!("sqltunnel_cert_refreshes_total", "result" => "error")
                    .increment(1);
                (Err(e), None)
            }
        };

        let outcome = Arc::new(ResolveOutcome {
            result,
            refreshed_at: Instant::now(),
            not_after,
        });
        let _ = tx.send(Some(outcome));

        if let Some(t) = not_after {
            self.schedule_refresh(instance, t);
        }
    }

    async fn resolve(
        &self,
        instance: &InstanceName,
    ) -> Result<(ReadyConfig, SystemTime), ProxyError> {
        let endpoint = self.shared.certs.remote(instance).await?;
        let identity = self.shared.certs.local(instance).await?;
        let not_after = identity.not_after;
        let tls_config = tls::client_config(identity, &endpoint)?;
        Ok((
            ReadyConfig {
                addr: format!("{}:{}", endpoint.ip_addr, self.shared.opts.port),
                tls: Arc::new(tls_config),
                version: endpoint.version,
            },
            not_after,
        ))
    }

    /// Replace the entry shortly before the certificate expires. The refresh
    /// throttle takes precedence over the expiry buffer.
    fn schedule_refresh(&self, instance: InstanceName, not_after: SystemTime) {
        let until_expiry = not_after
            .duration_since(SystemTime::now())
            .unwrap_or_default();
        let delay = until_expiry
            .saturating_sub(self.shared.opts.refresh_buffer)
            .max(self.shared.opts.refresh_throttle);

        let client = self.clone();
        let token = self.shared.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    debug!("certs: proactive refresh for {}", instance);
                    match client.cached_config(&instance, true).await {
                        Ok(outcome) => {
                            if let Err(e) = &outcome.result {
                                warn!("certs: proactive refresh for {} failed: {}", instance, e);
                            }
                        }
                        Err(e) => warn!("certs: proactive refresh for {} failed: {}", instance, e),
                    }
                }
                _ = token.cancelled() => {}
            }
        });
    }

    /// Drop the cache entry, but only while it still holds `outcome`: a
    /// newer refresh must not be clobbered by a dialer failing against the
    /// entry it replaced.
    fn invalidate(&self, instance: &InstanceName, outcome: &Arc<ResolveOutcome>) {
        let key = instance.to_string();
        let mut cache = self.shared.cfg_cache.lock().unwrap();
        if let Some(slot) = cache.get(&key) {
            let current = slot.rx.borrow().clone();
            if let Some(cur) = current {
                if Arc::ptr_eq(&cur, outcome) {
                    cache.remove(&key);
                    debug!("certs: invalidated configuration for {}", instance);
                }
            }
        }
    }

    /// Proxy one accepted connection to its instance.
    pub async fn handle_conn(&self, conn: Conn) {
        let key = conn.instance.to_string();

        let count = self.shared.conn_count.fetch_add(1, Ordering::SeqCst) + 1;
        let _count_guard = ConnCountGuard(self.clone());

        let limit = self.shared.opts.max_connections;
        if limit > 0 && count > limit {
            error!(
                "conn refused for {}: {}",
                key,
                ProxyError::TooManyConnections { limit }
            );
            metrics::counter!("sqltunnel_connections_total", "status" => "refused").increment(1);
            return;
        }
        metrics::counter!("sqltunnel_connections_total", "status" => "accepted").increment(1);

        let remote = match self.dial(&conn.instance).await {
            Ok(s) => s,
            Err(e) => {
                error!("couldn't connect to {}: {}", key, e);
                metrics::counter!("sqltunnel_connections_total", "status" => "dial_error")
                    .increment(1);
                return;
            }
        };

        let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let handle = self.shared.conns.make_handle(&key, conn_id);
        self.shared.conns.add(handle.clone());
        metrics::gauge!("sqltunnel_connections_active").increment(1.0);
        debug!("conn {}: proxying to {}", conn_id, key);

        pump::run(conn.stream, remote, &handle).await;

        self.shared.conns.remove(&key, conn_id);
        metrics::gauge!("sqltunnel_connections_active").decrement(1.0);
        debug!("conn {}: closed", conn_id);
    }

    /// Consume accepted connections until the channel closes (the listener
    /// manager dropping its senders is the shutdown signal on this path).
    pub async fn run(&self, mut conns: mpsc::Receiver<Conn>) {
        while let Some(conn) = conns.recv().await {
            let client = self.clone();
            tokio::spawn(async move { client.handle_conn(conn).await });
        }
        debug!("broker: connection channel closed");
    }

    /// Stop background refreshes and wind down live connections.
    ///
    /// With a zero timeout everything is closed immediately. Otherwise
    /// connections are closed as they become idle (the idle threshold is
    /// the time remaining, so it shrinks toward zero) and hitting the
    /// deadline force-closes the rest and reports an error.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ProxyError> {
        self.shared.shutdown.cancel();

        if self.shared.conns.is_empty() {
            return Ok(());
        }
        if timeout.is_zero() {
            let n = self.shared.conns.close();
            info!("shutdown: forced {} connections closed", n);
            return Ok(());
        }

        info!(
            "shutdown: waiting up to {} for {} open connections",
            humantime::format_duration(timeout),
            self.shared.conns.len()
        );
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.conns.is_empty() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                let open = self.shared.conns.len();
                self.shared.conns.close();
                return Err(ProxyError::ShutdownTimeout { open });
            }
            let remaining = deadline - now;
            self.shared.conns.close_idle(remaining);
            tokio::time::sleep(SHUTDOWN_POLL.min(remaining)).await;
        }
    }
}

struct ConnCountGuard(Client);

impl Drop for ConnCountGuard {
    fn drop(&mut self) {
        self.0.shared.conn_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// SNI value for the connector. Validation does not use it (the verifier
/// checks the certificate CN against the instance identifier), but rustls
/// requires one.
fn server_name_for(addr: &str) -> ServerName<'static> {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return ServerName::IpAddress(ip.into());
    }
    ServerName::try_from(host.to_string())
        .unwrap_or_else(|_| ServerName::try_from("instance.invalid").expect("static name"))
}
