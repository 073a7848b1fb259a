#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;
use radiance::common::{parse_query, CustomError, QueryMap};
use radiance::config::Configuration;
use radiance::database::Database;
use radiance::handlers::{handle_announce, param_first, RequestMeta};
use radiance::site_comm::SiteComm;
use radiance::tracker::{InfoHash, Stats, Torrent, TorrentTracker, User};

pub fn build_tracker() -> Arc<TorrentTracker> {
    build_tracker_with(Configuration::default())
}

pub fn build_tracker_with(config: Configuration) -> Arc<TorrentTracker> {
    let config = Arc::new(config);
    let stats = Arc::new(Stats::new());
    let database = Arc::new(Database::new(&config, stats.clone()));
    let site_comm = Arc::new(SiteComm::new(&config));
    Arc::new(TorrentTracker::new(config, database, site_comm, stats))
}

pub fn add_user(tracker: &Arc<TorrentTracker>, passkey: &str, id: u32) -> Arc<User> {
    let user = Arc::new(User::new(id, true, false, false, 0, 0));
    tracker.users.lock().insert(passkey.to_string(), user.clone());
    user
}

pub fn add_torrent(tracker: &Arc<TorrentTracker>, info_hash: &InfoHash, id: u32) {
    tracker.torrents.lock().insert(*info_hash, Torrent::new(id));
}

pub fn info_hash(seed: u8) -> InfoHash {
    InfoHash([seed; 20])
}

pub fn query_map(query: &str) -> QueryMap {
    parse_query(Some(query.to_string())).unwrap()
}

/// Runs the announce state machine the way the HTTP front does: user and
/// domain resolved first, then the engine under the torrent list lock.
pub fn announce(tracker: &Arc<TorrentTracker>, passkey: &str, query: &str, ip: IpAddr) -> Result<Vec<u8>, CustomError> {
    announce_forwarded(tracker, passkey, query, ip, None)
}

pub fn announce_forwarded(
    tracker: &Arc<TorrentTracker>,
    passkey: &str,
    query: &str,
    ip: IpAddr,
    forwarded_for: Option<&str>,
) -> Result<Vec<u8>, CustomError> {
    let params = query_map(query);
    let user = tracker.find_user(passkey).expect("unknown passkey in test");
    let domain = tracker.find_or_create_domain("tracker.example.org");
    let info_hash = InfoHash::from_slice(param_first(&params, "info_hash").expect("missing info_hash in test"))
        .expect("bad info_hash in test");
    let meta = RequestMeta {
        remote_ip: ip,
        forwarded_for: forwarded_for.map(|value| value.to_string()),
        user_agent: String::from("radiance-test/1.0"),
    };
    let mut torrents = tracker.torrents.lock();
    let torrent = torrents.get_mut(&info_hash).expect("unknown torrent in test");
    handle_announce(tracker, torrent, &user, &domain, &params, &meta)
}

pub fn v4(text: &str) -> IpAddr {
    text.parse().unwrap()
}

pub fn v6(text: &str) -> IpAddr {
    text.parse().unwrap()
}
