mod common;

use std::sync::atomic::Ordering;
use common::{add_torrent, add_user, announce, build_tracker, v4};
use radiance::config::Configuration;
use radiance::tracker::{get_del_reason, InfoHash, TrackerStatus};

const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaa";
const PASSKEY_1: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const PEER_1: &str = "-TR2940-aaaaaaaaaaa1";

#[tokio::test]
async fn test_graceful_shutdown_sequence() {
    let tracker = build_tracker();
    add_user(&tracker, PASSKEY_1, 1);
    add_torrent(&tracker, &InfoHash(*b"aaaaaaaaaaaaaaaaaaaa"), 100);
    let query = format!("info_hash={}&peer_id={}&port=6881&uploaded=0&downloaded=0&left=1024&compact=1", HASH_A, PEER_1);
    announce(&tracker, PASSKEY_1, query.as_str(), v4("93.184.216.1")).unwrap();

    assert_eq!(tracker.status(), TrackerStatus::Open);
    assert!(!tracker.shutdown().await);
    assert_eq!(tracker.status(), TrackerStatus::Closing);
    assert!(tracker.torrents.lock().is_empty());
    assert!(tracker.users.lock().is_empty());

    // With nothing pending the scheduler's exit condition holds.
    assert!(tracker.database.all_clear());
    assert!(tracker.site_comm.all_clear());

    // A second signal forces the exit.
    assert!(tracker.shutdown().await);
}

#[tokio::test]
async fn test_reload_config_updates_live_knobs() {
    let tracker = build_tracker();
    let mut reloaded = Configuration::default();
    reloaded.tracker.announce_interval = 900;
    reloaded.tracker.numwant_limit = 25;
    reloaded.tracker.peers_timeout = 3600;
    reloaded.tracker.del_reason_lifetime = 600;

    tracker.reload_config(&reloaded);
    assert_eq!(tracker.announce_interval.load(Ordering::Relaxed), 900);
    assert_eq!(tracker.numwant_limit.load(Ordering::Relaxed), 25);
    assert_eq!(tracker.peers_timeout.load(Ordering::Relaxed), 3600);
    assert_eq!(tracker.del_reason_lifetime.load(Ordering::Relaxed), 600);
}

#[tokio::test]
async fn test_domains_are_shared_and_reaped() {
    let tracker = build_tracker();
    let first = tracker.find_or_create_domain("tracker.example.org");
    let second = tracker.find_or_create_domain("tracker.example.org");
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(tracker.domains.lock().len(), 1);

    drop(first);
    drop(second);
    tracker.reap_domains();
    assert!(tracker.domains.lock().is_empty());
}

#[test]
fn test_del_reason_catalogue() {
    assert_eq!(get_del_reason(0), "Dupe");
    assert_eq!(get_del_reason(1), "Trump");
    assert_eq!(get_del_reason(22), "Audience Recording");
    assert_eq!(get_del_reason(99), "");
    assert_eq!(get_del_reason(-1), "");
}

#[tokio::test]
async fn test_site_options_defaults() {
    let tracker = build_tracker();
    assert_eq!(tracker.options.get_str("SitewideFreeleechMode"), "off");
    assert_eq!(tracker.options.get_time("SitewideFreeleechStartTime"), 0);
    assert!(!tracker.options.get_bool("EnableIPv6Tracker"));

    tracker.options.set("EnableIPv6Tracker", "1");
    assert!(tracker.options.get_bool("EnableIPv6Tracker"));

    // Unknown names are ignored rather than created.
    tracker.options.set("NotAnOption", "1");
    assert_eq!(tracker.options.get_str("NotAnOption"), "");
}

#[tokio::test]
async fn test_site_comm_buffers_token_batches() {
    let tracker = build_tracker();
    let site_comm = tracker.site_comm.clone();

    site_comm.expire_token(100, 1);
    assert_eq!(site_comm.expire_token_buffer.lock().as_str(), "1:100");
    assert!(site_comm.all_clear());

    // An overlong buffer is promoted to the queue without waiting for the
    // scheduler.
    for torrent_id in 0..60 {
        site_comm.expire_token(100000 + torrent_id, 424242);
    }
    assert!(!site_comm.all_clear());
}
