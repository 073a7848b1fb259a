use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use log::{debug, info};
use crate::tracker::{TorrentTracker, TrackerStatus};

/// Periodic driver: updates the rate counters, pushes the record buffers
/// into the flush queues, kicks the reaper on its own cadence, and ends the
/// process once a closing tracker has drained every queue.
pub fn start(tracker: Arc<TorrentTracker>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let schedule_interval = tracker.config.tracker.schedule_interval.max(1);
        let reap_peers_interval = tracker.config.tracker.reap_peers_interval;
        let mut counter: u64 = 0;
        let mut last_opened_connections: i64 = 0;
        let mut last_request_count: i64 = 0;
        let mut next_reap_peers = reap_peers_interval;
        loop {
            tokio::time::sleep(Duration::from_secs(schedule_interval)).await;

            let opened_connections = tracker.stats.opened_connections.load(Ordering::Relaxed);
            let requests = tracker.stats.requests.load(Ordering::Relaxed);
            tracker.stats.connection_rate.store(
                (opened_connections - last_opened_connections) / schedule_interval as i64,
                Ordering::Relaxed,
            );
            tracker.stats.request_rate.store(
                (requests - last_request_count) / schedule_interval as i64,
                Ordering::Relaxed,
            );
            if counter % 20 == 0 {
                debug!(
                    "{} open, {} connections ({}/s), {} requests ({}/s)",
                    tracker.stats.open_connections.load(Ordering::Relaxed),
                    opened_connections,
                    tracker.stats.connection_rate.load(Ordering::Relaxed),
                    requests,
                    tracker.stats.request_rate.load(Ordering::Relaxed)
                );
            }

            if tracker.status() == TrackerStatus::Closing && tracker.database.all_clear() && tracker.site_comm.all_clear() {
                tracker.database.shutdown().await;
                info!("all clear, shutting down");
                std::process::exit(0);
            }

            last_opened_connections = opened_connections;
            last_request_count = requests;

            tracker.database.flush();
            tracker.site_comm.flush_tokens();

            next_reap_peers -= schedule_interval as i64;
            if next_reap_peers <= 0 {
                tracker.start_reaper();
                next_reap_peers = reap_peers_interval;
            }

            counter += 1;
        }
    })
}
