//! Prometheus metrics endpoint.

use crate::server::SyncServer;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Gauges describe current state; counters are monotonic since startup.
pub async fn metrics_handler(Extension(server): Extension<Arc<SyncServer>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&server).await,
    )
}

async fn render(server: &SyncServer) -> String {
    let m = server.metrics();

    let connections = m.active_connections.load(Ordering::Relaxed);
    let online = server.online_clients();

    let transactions = m.transactions_total.load(Ordering::Relaxed);
    let pushes = m.pushes_total.load(Ordering::Relaxed);
    let conflicts = m.conflicts_total.load(Ordering::Relaxed);
    let resolutions = m.resolutions_total.load(Ordering::Relaxed);
    let fanout_sent = m.fanout_sent.load(Ordering::Relaxed);
    let fanout_failed = m.fanout_failed.load(Ordering::Relaxed);
    let rescans = m.rescans_total.load(Ordering::Relaxed);
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let bytes_rx = m.bytes_received.load(Ordering::Relaxed);
    let bytes_tx = m.bytes_sent.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    // Store counts are best effort; a failing store still yields the counters.
    let clients = server
        .store()
        .list_clients()
        .await
        .map(|c| c.len())
        .unwrap_or(0);
    let root_dirs = server
        .store()
        .list_root_dirs()
        .await
        .map(|r| r.len())
        .unwrap_or(0);

    format!(
        r#"# HELP rootsync_connections_active Number of open connections
# TYPE rootsync_connections_active gauge
rootsync_connections_active {connections}

# HELP rootsync_clients_online Number of clients bound to a live connection
# TYPE rootsync_clients_online gauge
rootsync_clients_online {online}

# HELP rootsync_info Server information
# TYPE rootsync_info gauge
rootsync_info{{version="{version}"}} 1

# HELP rootsync_transactions_total Total transactions answered
# TYPE rootsync_transactions_total counter
rootsync_transactions_total {transactions}

# HELP rootsync_pushes_total Total PLEASESYNC pushes committed
# TYPE rootsync_pushes_total counter
rootsync_pushes_total {pushes}

# HELP rootsync_conflicts_total Total conflicts recorded
# TYPE rootsync_conflicts_total counter
rootsync_conflicts_total {conflicts}

# HELP rootsync_resolutions_total Total conflicts resolved by CHOOSEONE
# TYPE rootsync_resolutions_total counter
rootsync_resolutions_total {resolutions}

# HELP rootsync_fanout_sent_total Server pushes acknowledged by clients
# TYPE rootsync_fanout_sent_total counter
rootsync_fanout_sent_total {fanout_sent}

# HELP rootsync_fanout_failed_total Server pushes that failed or timed out
# TYPE rootsync_fanout_failed_total counter
rootsync_fanout_failed_total {fanout_failed}

# HELP rootsync_rescans_total Background rescans completed
# TYPE rootsync_rescans_total counter
rootsync_rescans_total {rescans}

# HELP rootsync_connections_total Total connections accepted
# TYPE rootsync_connections_total counter
rootsync_connections_total {conns_total}

# HELP rootsync_bytes_received_total Total bytes received (pushed file contents)
# TYPE rootsync_bytes_received_total counter
rootsync_bytes_received_total {bytes_rx}

# HELP rootsync_bytes_sent_total Total frame bytes sent in replies
# TYPE rootsync_bytes_sent_total counter
rootsync_bytes_sent_total {bytes_tx}

# HELP rootsync_rate_limit_hits_total Total rate limit rejections
# TYPE rootsync_rate_limit_hits_total counter
rootsync_rate_limit_hits_total {rate_limits}

# HELP rootsync_errors_total Total transactions answered with Failed
# TYPE rootsync_errors_total counter
rootsync_errors_total {errors}

# HELP rootsync_clients_registered Number of client records
# TYPE rootsync_clients_registered gauge
rootsync_clients_registered {clients}

# HELP rootsync_root_dirs Number of registered root directories
# TYPE rootsync_root_dirs gauge
rootsync_root_dirs {root_dirs}
"#,
        version = env!("CARGO_PKG_VERSION"),
    )
}
