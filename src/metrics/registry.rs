use metrics::{describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`) can be used anywhere in the codebase. The `PrometheusHandle` is
/// retained solely for rendering the admin `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once, at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install metrics recorder");

        // connections
        describe_counter!(
            "sqltunnel_connections_total",
            Unit::Count,
            "Local connections by outcome (accepted, refused, dial_error)"
        );
        describe_gauge!(
            "sqltunnel_connections_active",
            Unit::Count,
            "Connections currently being proxied"
        );

        // certificates
        describe_counter!(
            "sqltunnel_cert_refreshes_total",
            Unit::Count,
            "Per-instance TLS configuration refreshes by result"
        );

        // listeners
        describe_gauge!(
            "sqltunnel_listeners_active",
            Unit::Count,
            "Open local listeners (static + dynamic)"
        );
        describe_counter!(
            "sqltunnel_instance_updates_total",
            Unit::Count,
            "Instance-list update messages applied"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
