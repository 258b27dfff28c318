#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use sqltunnel::config::ProxyConfig;
use sqltunnel::error::ProxyError;
use sqltunnel::server;

#[derive(Parser)]
#[command(
    name = "sqltunnel",
    about = "Local authentication proxy for managed SQL instances"
)]
struct Cli {
    /// Path to the config file (.toml or .json); optional.
    #[arg(short, long, default_value = "sqltunnel.toml")]
    config: PathBuf,

    /// Instance connection names, optionally with listener overrides
    /// (project:region:name=tcp:5432). Repeatable or comma-separated.
    #[arg(long, value_delimiter = ',')]
    instances: Vec<String>,

    /// Discovery endpoint streaming updated instance lists.
    #[arg(long)]
    instances_metadata: Option<String>,

    /// Directory for per-instance unix sockets.
    #[arg(long)]
    dir: Option<String>,

    /// Base URL of the database admin API.
    #[arg(long)]
    api_endpoint: Option<String>,

    /// Bearer token for the control plane.
    #[arg(long)]
    token: Option<String>,

    /// Refuse connections beyond this many concurrently proxied sessions.
    #[arg(long)]
    max_connections: Option<u64>,

    /// Admin server address for health probes and metrics.
    #[arg(long)]
    admin_listen: Option<String>,

    /// How long shutdown waits for live connections (e.g. "30s").
    #[arg(long, value_parser = humantime::parse_duration)]
    term_timeout: Option<Duration>,

    /// Minimum interval between certificate refreshes per instance.
    #[arg(long, value_parser = humantime::parse_duration)]
    refresh_throttle: Option<Duration>,

    /// Bind ephemeral certificates to the token identity (IAM login).
    #[arg(long)]
    enable_iam_login: bool,

    /// Treat a region mismatch as fatal.
    #[arg(long)]
    check_region: bool,

    /// Drop instances with invalid listener configuration instead of exiting.
    #[arg(long)]
    skip_failed_instances: bool,

    /// Preference-ordered address types, comma-separated (PUBLIC,PRIVATE).
    #[arg(long)]
    ip_address_types: Option<String>,

    /// Per-connection debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Discard all output.
    #[arg(short, long)]
    quiet: bool,

    /// Route non-error logs to stdout instead of stderr.
    #[arg(long)]
    log_debug_stdout: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    structured_logs: bool,
}

impl Cli {
    fn apply_to(self, config: &mut ProxyConfig) {
        if !self.instances.is_empty() {
            config.instances = self.instances;
        }
        if let Some(v) = self.instances_metadata {
            config.instances_metadata = Some(v);
        }
        if let Some(v) = self.dir {
            config.unix_socket_dir = v;
        }
        if let Some(v) = self.api_endpoint {
            config.api.endpoint = v;
        }
        if let Some(v) = self.token {
            config.api.token = Some(v);
        }
        if let Some(v) = self.max_connections {
            config.max_connections = v;
        }
        if let Some(v) = self.admin_listen {
            config.admin_listen = Some(v);
        }
        if let Some(v) = self.term_timeout {
            config.term_timeout_secs = v.as_secs();
        }
        if let Some(v) = self.refresh_throttle {
            config.certs.refresh_throttle_secs = v.as_secs();
        }
        if self.enable_iam_login {
            config.api.enable_iam_login = true;
        }
        if self.check_region {
            config.api.check_region = true;
        }
        if self.skip_failed_instances {
            config.skip_failed_instances = true;
        }
        if let Some(v) = self.ip_address_types {
            config.api.ip_address_types = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if self.verbose {
            config.log.verbose = true;
        }
        if self.quiet {
            config.log.quiet = true;
        }
        if self.log_debug_stdout {
            config.log.debug_stdout = true;
        }
        if self.structured_logs {
            config.log.structured = true;
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match ProxyConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("sqltunnel: {e:#}");
            return ExitCode::from(1);
        }
    };
    cli.apply_to(&mut config);

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(server::runtime::worker_threads())
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("sqltunnel: couldn't build runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match rt.block_on(server::bootstrap::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let timed_out = e
                .downcast_ref::<ProxyError>()
                .is_some_and(|p| matches!(p, ProxyError::ShutdownTimeout { .. }));
            eprintln!("sqltunnel: {e:#}");
            ExitCode::from(if timed_out { 2 } else { 1 })
        }
    }
}
