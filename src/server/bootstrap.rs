use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::api::{ApiClient, UpdateStream};
use crate::auth::{StaticTokenSource, TokenSource};
use crate::certs::{RemoteCertOptions, RemoteCertSource};
use crate::config::{LogConfig, ProxyConfig};
use crate::error::ProxyError;
use crate::instance::NetProbe;
use crate::listener::{ListenerManager, ListenerOptions};
use crate::metrics::Metrics;
use crate::proxy::{self, Client, ClientOptions, TcpDialer};
use crate::server::{self, AdminState};

/// Base pause before the update subscription reconnects; a ±1 s jitter is
/// applied so a fleet doesn't resubscribe in lockstep.
const RESUBSCRIBE_PAUSE: Duration = Duration::from_secs(5);

/// Proxy lifecycle: init → listen → serve → shutdown.
pub async fn run(mut config: ProxyConfig) -> Result<()> {
    init_tracing(&config.log);
    config.normalize();
    config.validate()?;
    server::runtime::raise_nofile_limit();
    let metrics = Metrics::install();

    // Credential and control-plane wiring.
    let token = config
        .api
        .token
        .clone()
        .context("no credentials configured (set --token or SQLTUNNEL_API_TOKEN)")?;
    let tokens: Arc<dyn TokenSource> = Arc::new(StaticTokenSource::new(token));
    let api = ApiClient::new(&config.api.endpoint, tokens.clone());
    let certs = Arc::new(RemoteCertSource::new(
        api,
        tokens,
        RemoteCertOptions {
            enable_iam_login: config.api.enable_iam_login,
            check_region: config.api.check_region,
            ip_address_types: config.api.ip_address_types.clone(),
            cert_duration: config.cert_duration(),
        },
    ));

    let client = Client::new(
        certs.clone(),
        Arc::new(TcpDialer),
        ClientOptions {
            port: config.remote_port,
            max_connections: config.max_connections,
            refresh_throttle: config.refresh_throttle(),
            refresh_buffer: config.refresh_buffer(),
            ..ClientOptions::default()
        },
    );
    proxy::set_default_client(client.clone());

    // Listener manager feeds the broker through a bounded channel; dropping
    // the manager's senders is what ends the broker loop.
    let (conns_tx, conns_rx) = mpsc::channel(1);
    let mut listeners = ListenerManager::new(
        ListenerOptions {
            dir: config.unix_socket_dir.clone().into(),
            skip_failed: config.skip_failed_instances,
            probe: NetProbe::probe(),
        },
        certs,
        conns_tx,
    );
    listeners
        .start_static(&config.instances)
        .await
        .map_err(anyhow::Error::new)?;
    for (instance, addr) in listeners.bound() {
        info!("ready for connections to {} on {}", instance, addr);
    }

    let shutdown = CancellationToken::new();

    let updates_rx = config
        .instances_metadata
        .as_deref()
        .map(|url| start_update_stream(url, &shutdown));
    let listener_task = tokio::spawn(listeners.run(updates_rx, shutdown.clone()));

    if let Some(admin_listen) = config.admin_listen.clone() {
        let state = AdminState {
            client: client.clone(),
            metrics,
        };
        tokio::spawn(async move {
            if let Err(e) = server::run_admin_server(&admin_listen, state).await {
                error!("server: admin failed, error={}", e);
            }
        });
    }

    let broker_task = tokio::spawn({
        let client = client.clone();
        async move { client.run(conns_rx).await }
    });

    wait_for_shutdown().await;
    shutdown.cancel();

    // Close listeners first (removes socket files, stops new connections),
    // then wind down live connections.
    if let Err(e) = listener_task.await {
        error!("server: listener task error: {}", e);
    }
    if let Err(e) = broker_task.await {
        error!("server: broker task error: {}", e);
    }

    let result = client.shutdown(config.term_timeout()).await;
    match result {
        Ok(()) => {
            info!("server: shutdown complete");
            Ok(())
        }
        Err(e @ ProxyError::ShutdownTimeout { .. }) => {
            error!("server: {}", e);
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn init_tracing(log: &LogConfig) {
    if log.quiet {
        return;
    }

    let default_level = if log.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let writer: Box<dyn std::io::Write + Send> = if log.debug_stdout {
        Box::new(std::io::stdout())
    } else {
        Box::new(std::io::stderr())
    };
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .lossy(true)
        .finish(writer);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false);

    if log.structured {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    }

    // The guard flushes the writer on drop; the subscriber lives for the
    // whole process, so leak it.
    std::mem::forget(guard);
}

/// Subscribe to the discovery endpoint and forward instance-list messages to
/// the reconciler. The subscription is restarted after a jittered pause when
/// it ends or errors out.
fn start_update_stream(url: &str, shutdown: &CancellationToken) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(1);
    let url = url.to_string();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        let http = reqwest::Client::new();
        loop {
            match UpdateStream::open(&http, &url).await {
                Ok(mut stream) => {
                    info!("discovery: subscribed to {}", url);
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            msg = stream.next_message() => match msg {
                                Some(m) => {
                                    if tx.send(m).await.is_err() {
                                        return;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                    warn!("discovery: update stream ended, resubscribing");
                }
                Err(e) => {
                    warn!("discovery: subscription to {} failed: {}", url, e);
                }
            }

            let jitter = rand::thread_rng().gen_range(-1.0f64..1.0);
            let pause = Duration::from_secs_f64((RESUBSCRIBE_PAUSE.as_secs_f64() + jitter).max(0.5));
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    });

    rx
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("server: received SIGINT, shutting down"),
        _ = terminate => info!("server: received SIGTERM, shutting down"),
    }
}
