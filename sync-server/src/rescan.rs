//! Background reconciliation task.
//!
//! Periodically asks every online client for a full listing of each root it
//! is bound to and pushes back the classification. The same tick prunes idle
//! path locks and rate-limiter keys.

use crate::error::{ProtocolError, SyncError, SyncResult};
use crate::peer::PeerHandle;
use crate::server::SyncServer;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use sync_types::{ClientUuid, Message, Rescan};
use tokio::time::interval;

/// Spawn the periodic rescan task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_rescan_task(server: Arc<SyncServer>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = server.config().rescan.clone();
        if !config.enabled {
            tracing::info!("Rescan task disabled");
            return;
        }

        tracing::info!("Rescan task started (interval: {}s)", config.interval_secs);
        let mut timer = interval(Duration::from_secs(config.interval_secs));
        // The first tick fires immediately; clients have not registered yet.
        timer.tick().await;

        loop {
            timer.tick().await;
            let rescanned = rescan_round(&server).await;
            if rescanned > 0 {
                tracing::info!("Rescan: reconciled {} roots", rescanned);
            } else {
                tracing::debug!("Rescan: nothing online");
            }
        }
    })
}

/// Run one reconciliation pass over every online client.
///
/// Returns the number of roots that produced a report.
pub async fn rescan_round(server: &SyncServer) -> usize {
    let mut rescanned = 0;
    for (uuid, peer) in server.registry().bound() {
        match rescan_client(server, &uuid, &peer).await {
            Ok(count) => rescanned += count,
            Err(e) => tracing::warn!("Rescan of {} failed: {}", uuid, e),
        }
    }

    let pruned = server.locks().prune();
    server.rate_limits().shrink();
    if pruned > 0 {
        tracing::debug!("Pruned {} idle locks", pruned);
    }
    rescanned
}

async fn rescan_client(server: &SyncServer, uuid: &ClientUuid, peer: &PeerHandle) -> SyncResult<usize> {
    let timeout = Duration::from_secs(server.config().limits.fanout_timeout_secs);
    let mut rescanned = 0;

    for root in server.registrar().root_dirs(uuid).await? {
        let request = Message::Rescan(Rescan {
            root_dir: root.clone(),
        });
        let reply = tokio::time::timeout(timeout, peer.request(&request))
            .await
            .map_err(|_| ProtocolError::Timeout {
                waiting_for: "FullScan",
                secs: timeout.as_secs(),
            })??;

        let scan = match reply {
            Message::FullScan(scan) if scan.root_dir == root => scan,
            Message::FullScan(scan) => {
                return Err(SyncError::Validation(format!(
                    "asked to rescan {root}, got a listing of {}",
                    scan.root_dir
                )))
            }
            other => {
                return Err(SyncError::ProtocolDecode(format!(
                    "expected FullScan, got {}",
                    other.transaction_name()
                )))
            }
        };

        let report = server.engine().scan_report(&root, &scan.entries).await?;
        peer.notify(&Message::ScanReport(report)).await?;
        server.metrics().rescans_total.fetch_add(1, Ordering::Relaxed);
        rescanned += 1;
    }
    Ok(rescanned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::peer::mock::MockPeer;
    use crate::server::tests::test_server;
    use sync_types::{RegisterRootDir, ScanAction, ScanEntry};

    async fn online(server: &SyncServer, uuid: &str) -> Arc<MockPeer> {
        let peer = MockPeer::new(uuid);
        let password = server.config().server.password.clone();
        server
            .registrar()
            .register_client(&ClientUuid::from(uuid), &password, peer.clone())
            .await
            .unwrap();
        server
            .registrar()
            .register_root_dir(&RegisterRootDir {
                uuid: ClientUuid::from(uuid),
                root_dir_password: "root-pw".into(),
                before_path: "/home/a/r".into(),
                after_path: "/r".into(),
            })
            .await
            .unwrap();
        peer
    }

    #[tokio::test]
    async fn round_reports_to_online_clients() {
        let (_dir, server) = test_server(Config::default()).await;
        let peer = online(&server, "a").await;
        peer.set_listing(vec![ScanEntry {
            after_path: "/r/new".into(),
            hash: "abc".into(),
            mod_time: 1_705_000_000,
        }]);

        assert_eq!(rescan_round(&server).await, 1);

        assert!(matches!(peer.requests().as_slice(), [Message::Rescan(r)] if r.root_dir == "/r"));
        match peer.notifications().as_slice() {
            [Message::ScanReport(report)] => {
                assert_eq!(report.root_dir, "/r");
                assert_eq!(report.results.len(), 1);
                assert_eq!(report.results[0].action, ScanAction::PleaseSync);
            }
            other => panic!("unexpected notifications: {other:?}"),
        }
        assert_eq!(server.metrics().rescans_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unreachable_client_is_skipped() {
        let (_dir, server) = test_server(Config::default()).await;
        let peer = online(&server, "a").await;
        peer.fail();

        assert_eq!(rescan_round(&server).await, 0);
        assert_eq!(server.metrics().rescans_total.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn rescan_task_disabled() {
        let mut config = Config::default();
        config.rescan.enabled = false;
        let (_dir, server) = test_server(config).await;

        let handle = spawn_rescan_task(server);
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("Task should complete when disabled")
            .expect("Task should not panic");
    }
}
