use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use chrono::Utc;
use log::{debug, info, trace};
use parking_lot::Mutex;
use crate::config::{Configuration, SiteOptions};
use crate::database::Database;
use crate::site_comm::SiteComm;

/// A 20-byte BitTorrent info hash, the in-memory key of a swarm.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_slice(data: &[u8]) -> Option<InfoHash> {
        <[u8; 20]>::try_from(data).ok().map(InfoHash)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A 20-byte client-chosen peer id.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn from_slice(data: &[u8]) -> Option<PeerId> {
        <[u8; 20]>::try_from(data).ok().map(PeerId)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum FreeTorrent {
    Normal,
    Free,
    Neutral,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum DoubleTorrent {
    Normal,
    Double,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TrackerStatus {
    Open,
    Paused,
    Closing,
}

pub struct User {
    id: u32,
    deleted: AtomicBool,
    can_leech: AtomicBool,
    protect_ip: AtomicBool,
    track_ipv6: AtomicBool,
    personal_freeleech: AtomicI64,
    personal_doubleseed: AtomicI64,
    leeching: AtomicI64,
    seeding: AtomicI64,
}

impl User {
    pub fn new(id: u32, can_leech: bool, protect_ip: bool, track_ipv6: bool, pfl: i64, pds: i64) -> User {
        User {
            id,
            deleted: AtomicBool::new(false),
            can_leech: AtomicBool::new(can_leech),
            protect_ip: AtomicBool::new(protect_ip),
            track_ipv6: AtomicBool::new(track_ipv6),
            personal_freeleech: AtomicI64::new(pfl),
            personal_doubleseed: AtomicI64::new(pds),
            leeching: AtomicI64::new(0),
            seeding: AtomicI64::new(0),
        }
    }

    pub fn get_id(&self) -> u32 { self.id }
    pub fn is_deleted(&self) -> bool { self.deleted.load(Ordering::Relaxed) }
    pub fn set_deleted(&self, status: bool) { self.deleted.store(status, Ordering::Relaxed); }
    pub fn can_leech(&self) -> bool { self.can_leech.load(Ordering::Relaxed) }
    pub fn set_leech_status(&self, status: bool) { self.can_leech.store(status, Ordering::Relaxed); }
    pub fn is_protected(&self) -> bool { self.protect_ip.load(Ordering::Relaxed) }
    pub fn set_protected(&self, status: bool) { self.protect_ip.store(status, Ordering::Relaxed); }
    pub fn track_ipv6(&self) -> bool { self.track_ipv6.load(Ordering::Relaxed) }
    pub fn set_track_ipv6(&self, status: bool) { self.track_ipv6.store(status, Ordering::Relaxed); }
    pub fn pfl(&self) -> i64 { self.personal_freeleech.load(Ordering::Relaxed) }
    pub fn set_personal_freeleech(&self, pfl: i64) { self.personal_freeleech.store(pfl, Ordering::Relaxed); }
    pub fn pds(&self) -> i64 { self.personal_doubleseed.load(Ordering::Relaxed) }
    pub fn set_personal_doubleseed(&self, pds: i64) { self.personal_doubleseed.store(pds, Ordering::Relaxed); }
    pub fn incr_leeching(&self) { self.leeching.fetch_add(1, Ordering::Relaxed); }
    pub fn decr_leeching(&self) { self.leeching.fetch_sub(1, Ordering::Relaxed); }
    pub fn incr_seeding(&self) { self.seeding.fetch_add(1, Ordering::Relaxed); }
    pub fn decr_seeding(&self) { self.seeding.fetch_sub(1, Ordering::Relaxed); }
    pub fn get_leeching(&self) -> i64 { self.leeching.load(Ordering::Relaxed) }
    pub fn get_seeding(&self) -> i64 { self.seeding.load(Ordering::Relaxed) }
    pub fn reset_stats(&self) {
        self.leeching.store(0, Ordering::Relaxed);
        self.seeding.store(0, Ordering::Relaxed);
    }
}

/// One entry per distinct Host header. Peers keep a shared handle, so the
/// reference count doubles as a per-domain peer gauge for the report
/// endpoint.
pub struct Domain {
    pub name: String,
}

#[derive(Clone)]
pub struct Peer {
    pub user: Arc<User>,
    pub domain: Arc<Domain>,
    pub uploaded: i64,
    pub downloaded: i64,
    pub corrupt: i64,
    pub left: i64,
    pub announces: u32,
    pub first_announced: i64,
    pub last_announced: i64,
    pub port: u16,
    pub visible: bool,
    pub paused: bool,
    pub ipv4: Vec<u8>,
    pub ipv4_port: Vec<u8>,
    pub ipv6: Vec<u8>,
    pub ipv6_port: Vec<u8>,
}

impl Peer {
    pub fn new(user: Arc<User>, domain: Arc<Domain>) -> Peer {
        Peer {
            user,
            domain,
            uploaded: 0,
            downloaded: 0,
            corrupt: 0,
            left: 0,
            announces: 0,
            first_announced: 0,
            last_announced: 0,
            port: 0,
            visible: true,
            paused: false,
            ipv4: Vec::new(),
            ipv4_port: Vec::new(),
            ipv6: Vec::new(),
            ipv6_port: Vec::new(),
        }
    }
}

/// Peers should be invisible if they are a leecher without download privs.
pub fn peer_is_visible(user: &Arc<User>, peer: &Peer) -> bool {
    peer.left == 0 || user.can_leech()
}

pub type PeerKey = Vec<u8>;
pub type PeerList = BTreeMap<PeerKey, Peer>;

/// Key of a peer inside a torrent's peer maps: one byte of the raw peer id
/// (offset picked per torrent to spread map order), the user id as decimal
/// text, then the full peer id. Collisions across users are practically
/// impossible and the key is stable across process restarts.
pub fn peer_key(torrent_id: u32, user_id: u32, peer_id: &PeerId) -> PeerKey {
    let mut key = Vec::with_capacity(32);
    key.push(peer_id.0[(12 + (torrent_id & 7)) as usize]);
    key.extend_from_slice(user_id.to_string().as_bytes());
    key.extend_from_slice(&peer_id.0);
    key
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Slots {
    pub free_leech: i64,
    pub double_seed: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct DelMessage {
    pub reason: i32,
    pub time: i64,
}

pub struct Torrent {
    pub id: u32,
    pub completed: u32,
    pub paused: u32,
    pub balance: i64,
    pub free_torrent: FreeTorrent,
    pub double_torrent: DoubleTorrent,
    pub last_flushed: i64,
    pub seeders: PeerList,
    pub leechers: PeerList,
    pub last_selected_seeder: PeerKey,
    pub last_selected_leecher: PeerKey,
    pub tokened_users: BTreeMap<u32, Slots>,
}

impl Torrent {
    pub fn new(id: u32) -> Torrent {
        Torrent {
            id,
            completed: 0,
            paused: 0,
            balance: 0,
            free_torrent: FreeTorrent::Normal,
            double_torrent: DoubleTorrent::Normal,
            last_flushed: 0,
            seeders: BTreeMap::new(),
            leechers: BTreeMap::new(),
            last_selected_seeder: Vec::new(),
            last_selected_leecher: Vec::new(),
            tokened_users: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
pub struct Stats {
    pub open_connections: AtomicI64,
    pub opened_connections: AtomicI64,
    pub connection_rate: AtomicI64,
    pub leechers: AtomicI64,
    pub seeders: AtomicI64,
    pub requests: AtomicI64,
    pub request_rate: AtomicI64,
    pub announcements: AtomicI64,
    pub succ_announcements: AtomicI64,
    pub scrapes: AtomicI64,
    pub bytes_read: AtomicI64,
    pub bytes_written: AtomicI64,
    pub ipv4_peers: AtomicI64,
    pub ipv6_peers: AtomicI64,
    pub torrent_queue: AtomicI64,
    pub user_queue: AtomicI64,
    pub peer_queue: AtomicI64,
    pub peer_hist_queue: AtomicI64,
    pub snatch_queue: AtomicI64,
    pub token_queue: AtomicI64,
    pub start_time: AtomicI64,
}

impl Stats {
    pub fn new() -> Stats {
        let stats = Stats::default();
        stats.start_time.store(Utc::now().timestamp(), Ordering::Relaxed);
        stats
    }
}

/// The swarm store. Each top-level collection has its own mutex; the
/// canonical acquisition order is users, torrents, domains, blacklist,
/// deletion reasons. Handlers take the shortest prefix they need and
/// release early.
pub struct TorrentTracker {
    pub config: Arc<Configuration>,
    pub options: SiteOptions,
    pub users: Mutex<HashMap<String, Arc<User>>>,
    pub torrents: Mutex<HashMap<InfoHash, Torrent>>,
    pub domains: Mutex<HashMap<String, Arc<Domain>>>,
    pub blacklist: Mutex<Vec<Vec<u8>>>,
    pub del_reasons: Mutex<HashMap<InfoHash, DelMessage>>,
    pub stats: Arc<Stats>,
    pub database: Arc<Database>,
    pub site_comm: Arc<SiteComm>,
    pub announce_interval: AtomicU32,
    pub numwant_limit: AtomicU32,
    pub peers_timeout: AtomicI64,
    pub del_reason_lifetime: AtomicI64,
    status: AtomicU8,
    reaper_active: AtomicBool,
}

impl TorrentTracker {
    pub fn new(config: Arc<Configuration>, database: Arc<Database>, site_comm: Arc<SiteComm>, stats: Arc<Stats>) -> TorrentTracker {
        let announce_interval = config.tracker.announce_interval;
        let numwant_limit = config.tracker.numwant_limit;
        let peers_timeout = config.tracker.peers_timeout;
        let del_reason_lifetime = config.tracker.del_reason_lifetime;
        TorrentTracker {
            config,
            options: SiteOptions::new(),
            users: Mutex::new(HashMap::new()),
            torrents: Mutex::new(HashMap::new()),
            domains: Mutex::new(HashMap::new()),
            blacklist: Mutex::new(Vec::new()),
            del_reasons: Mutex::new(HashMap::new()),
            stats,
            database,
            site_comm,
            announce_interval: AtomicU32::new(announce_interval),
            numwant_limit: AtomicU32::new(numwant_limit),
            peers_timeout: AtomicI64::new(peers_timeout),
            del_reason_lifetime: AtomicI64::new(del_reason_lifetime),
            status: AtomicU8::new(TrackerStatus::Open as u8),
            reaper_active: AtomicBool::new(false),
        }
    }

    /// Applies the runtime-adjustable knobs from a re-read config file, as
    /// triggered by SIGHUP. Listener and database settings need a restart.
    pub fn reload_config(&self, config: &Configuration) {
        self.announce_interval.store(config.tracker.announce_interval, Ordering::Relaxed);
        self.numwant_limit.store(config.tracker.numwant_limit, Ordering::Relaxed);
        self.peers_timeout.store(config.tracker.peers_timeout, Ordering::Relaxed);
        self.del_reason_lifetime.store(config.tracker.del_reason_lifetime, Ordering::Relaxed);
    }

    pub fn status(&self) -> TrackerStatus {
        match self.status.load(Ordering::Relaxed) {
            x if x == TrackerStatus::Paused as u8 => TrackerStatus::Paused,
            x if x == TrackerStatus::Closing as u8 => TrackerStatus::Closing,
            _ => TrackerStatus::Open,
        }
    }

    pub fn set_status(&self, status: TrackerStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    pub fn find_user(&self, passkey: &str) -> Option<Arc<User>> {
        self.users.lock().get(passkey).cloned()
    }

    pub fn find_or_create_domain(&self, host: &str) -> Arc<Domain> {
        let mut domains = self.domains.lock();
        match domains.get(host) {
            Some(domain) => domain.clone(),
            None => {
                let domain = Arc::new(Domain { name: host.to_string() });
                domains.insert(host.to_string(), domain.clone());
                domain
            }
        }
    }

    pub fn check_blacklist(&self, peer_id: &PeerId) -> bool {
        let blacklist = self.blacklist.lock();
        blacklist.iter().any(|prefix| peer_id.0.starts_with(prefix.as_slice()))
    }

    pub fn del_reason_for(&self, info_hash: &InfoHash) -> Option<DelMessage> {
        self.del_reasons.lock().get(info_hash).copied()
    }

    /// Reloads everything from the database, as triggered by SIGUSR1. The
    /// engine answers "temporarily unavailable" for the duration.
    pub async fn reload_lists(self: &Arc<Self>) {
        self.set_status(TrackerStatus::Paused);
        self.database.load_site_options(self).await;
        self.database.load_users(self).await;
        self.database.load_torrents(self).await;
        self.database.load_tokens(self).await;
        for user in self.users.lock().values() {
            user.reset_stats();
        }
        self.stats.seeders.store(0, Ordering::Relaxed);
        self.stats.leechers.store(0, Ordering::Relaxed);
        self.database.load_peers(self).await;
        self.database.load_blacklist(self).await;
        self.set_status(TrackerStatus::Open);
    }

    /// First signal flips the engine to CLOSING and lets the scheduler
    /// drain the persistence queues; a second signal forces the exit.
    pub async fn shutdown(&self) -> bool {
        match self.status() {
            TrackerStatus::Open => {
                self.set_status(TrackerStatus::Closing);
                while self.reaper_active.load(Ordering::Acquire) {
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
                self.clear_lists();
                info!("flushing DB buffers... press Ctrl-C again to terminate immediately");
                false
            }
            TrackerStatus::Closing => {
                info!("shutting down uncleanly");
                true
            }
            TrackerStatus::Paused => false,
        }
    }

    pub fn clear_lists(&self) {
        self.users.lock().clear();
        self.torrents.lock().clear();
        self.domains.lock().clear();
    }

    pub fn start_reaper(self: &Arc<Self>) {
        if self.reaper_active.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let tracker = self.clone();
            tokio::task::spawn_blocking(move || {
                tracker.reap_peers();
                tracker.reap_del_reasons();
                tracker.reap_domains();
                tracker.reaper_active.store(false, Ordering::Release);
            });
        }
    }

    /// Sweeps every torrent for peers that have not announced within
    /// `peers_timeout` and for tokens expired on both axes. A torrent
    /// emptied by the sweep gets a zeroed row queued so the site sees it go
    /// quiet.
    pub fn reap_peers(&self) {
        debug!("Starting peer reaper");
        let cur_time = Utc::now().timestamp();
        let peers_timeout = self.peers_timeout.load(Ordering::Relaxed);
        let mut reaped_l: i64 = 0;
        let mut reaped_v4l: i64 = 0;
        let mut reaped_v6l: i64 = 0;
        let mut reaped_s: i64 = 0;
        let mut reaped_v4s: i64 = 0;
        let mut reaped_v6s: i64 = 0;
        let mut reaped_fl: i64 = 0;
        let mut cleared_torrents: u64 = 0;
        let mut torrents = self.torrents.lock();
        for torrent in torrents.values_mut() {
            let mut reaped_this = false;
            torrent.leechers.retain(|_key, peer| {
                if peer.last_announced + peers_timeout < cur_time {
                    if !peer.ipv6.is_empty() { reaped_v6l += 1; }
                    if !peer.ipv4.is_empty() { reaped_v4l += 1; }
                    reaped_l += 1;
                    reaped_this = true;
                    peer.user.decr_leeching();
                    false
                } else {
                    true
                }
            });
            torrent.seeders.retain(|_key, peer| {
                if peer.last_announced + peers_timeout < cur_time {
                    if !peer.ipv6.is_empty() { reaped_v6s += 1; }
                    if !peer.ipv4.is_empty() { reaped_v4s += 1; }
                    reaped_s += 1;
                    reaped_this = true;
                    peer.user.decr_seeding();
                    false
                } else {
                    true
                }
            });
            torrent.tokened_users.retain(|_user_id, slots| {
                if slots.free_leech < cur_time && slots.double_seed < cur_time {
                    reaped_this = true;
                    reaped_fl += 1;
                    false
                } else {
                    true
                }
            });
            if reaped_this {
                trace!("Reaped peers for torrent: {}", torrent.id);
            } else {
                trace!("Skipped torrent: {}", torrent.id);
            }
            if reaped_this && torrent.seeders.is_empty() && torrent.leechers.is_empty() {
                let record = format!("({},0,0,0,{})", torrent.id, torrent.balance);
                self.database.record_torrent(&record);
                cleared_torrents += 1;
            }
        }
        drop(torrents);

        if reaped_l + reaped_v4l + reaped_v6l + reaped_s + reaped_v4s + reaped_v6s > 0 {
            self.stats.leechers.fetch_sub(reaped_l, Ordering::Relaxed);
            self.stats.seeders.fetch_sub(reaped_s, Ordering::Relaxed);
            self.stats.ipv4_peers.fetch_sub(reaped_v4l + reaped_v4s, Ordering::Relaxed);
            self.stats.ipv6_peers.fetch_sub(reaped_v6l + reaped_v6s, Ordering::Relaxed);
        }

        debug!("Reaped {} leechers, {} seeders and {} tokens. Reset {} torrents", reaped_l, reaped_s, reaped_fl, cleared_torrents);
    }

    pub fn reap_del_reasons(&self) {
        debug!("Starting del reason reaper");
        let max_time = Utc::now().timestamp() - self.del_reason_lifetime.load(Ordering::Relaxed);
        let mut reasons = self.del_reasons.lock();
        let before = reasons.len();
        reasons.retain(|_info_hash, message| message.time > max_time);
        let reaped = before - reasons.len();
        drop(reasons);
        debug!("Reaped {} del reasons", reaped);
    }

    /// Domains only live while at least one peer still points at them.
    pub fn reap_domains(&self) {
        let mut domains = self.domains.lock();
        domains.retain(|_host, domain| Arc::strong_count(domain) > 1);
    }
}

pub fn get_del_reason(code: i32) -> String {
    match code {
        0 => String::from("Dupe"),
        1 => String::from("Trump"),
        2 => String::from("Bad File Names"),
        3 => String::from("Bad Folder Names"),
        4 => String::from("Bad Tags"),
        5 => String::from("Disallowed Format"),
        6 => String::from("Discs Missing"),
        7 => String::from("Discography"),
        8 => String::from("Edited Log"),
        9 => String::from("Inaccurate Bitrate"),
        10 => String::from("Low Bitrate"),
        11 => String::from("Mutt Rip"),
        12 => String::from("Disallowed Source"),
        13 => String::from("Encode Errors"),
        14 => String::from("Specifically Banned"),
        15 => String::from("Tracks Missing"),
        16 => String::from("Transcode"),
        17 => String::from("Unapproved Cassette"),
        18 => String::from("Unsplit Album"),
        19 => String::from("User Compilation"),
        20 => String::from("Wrong Format"),
        21 => String::from("Wrong Media"),
        22 => String::from("Audience Recording"),
        _ => String::from(""),
    }
}
