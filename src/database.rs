use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use chrono::Utc;
use log::{error, info, trace, LevelFilter};
use parking_lot::Mutex;
use sqlx::{ConnectOptions, MySqlPool, Row};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions};
use crate::common::{quote_bin, quote_str};
use crate::config::Configuration;
use crate::tracker::{peer_is_visible, peer_key, DoubleTorrent, FreeTorrent, InfoHash, Peer, PeerId, Slots, Stats, Torrent, TorrentTracker, User};

/// Heavy peer inserts are slow and RAM is not infinite, so the peer queue is
/// capped; the oldest statement is dropped on overflow. Heartbeat data is
/// the only thing that can be lost this way.
const PEER_QUEUE_LIMIT: usize = 1000;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlushQueue {
    Users,
    Torrents,
    Peers,
    PeerHist,
    Snatches,
    Tokens,
}

impl FlushQueue {
    pub fn name(&self) -> &'static str {
        match self {
            FlushQueue::Users => "user",
            FlushQueue::Torrents => "torrent",
            FlushQueue::Peers => "peer",
            FlushQueue::PeerHist => "peer history",
            FlushQueue::Snatches => "snatch",
            FlushQueue::Tokens => "token",
        }
    }
}

/// Write-behind persistence pipeline. Announce handlers append pre-quoted
/// VALUES tuples to per-entity buffers; the scheduler wraps each non-empty
/// buffer into a full statement and queues it; one drain worker per queue
/// executes statements in order, at-least-once.
pub struct Database {
    pub pool: MySqlPool,
    pub stats: Arc<Stats>,
    pub readonly: bool,
    pub clear_peerlists: bool,
    pub load_peerlists: bool,

    pub update_user_buffer: Mutex<String>,
    pub update_torrent_buffer: Mutex<String>,
    pub update_peer_heavy_buffer: Mutex<String>,
    pub update_peer_light_buffer: Mutex<String>,
    pub update_peer_hist_buffer: Mutex<String>,
    pub update_snatch_buffer: Mutex<String>,
    pub update_token_buffer: Mutex<String>,

    pub user_queue: Mutex<VecDeque<String>>,
    pub torrent_queue: Mutex<VecDeque<String>>,
    pub peer_queue: Mutex<VecDeque<String>>,
    pub peer_hist_queue: Mutex<VecDeque<String>>,
    pub snatch_queue: Mutex<VecDeque<String>>,
    pub token_queue: Mutex<VecDeque<String>>,

    pub u_active: AtomicBool,
    pub t_active: AtomicBool,
    pub p_active: AtomicBool,
    pub h_active: AtomicBool,
    pub s_active: AtomicBool,
    pub tok_active: AtomicBool,
}

impl Database {
    pub fn new(config: &Arc<Configuration>, stats: Arc<Stats>) -> Database {
        let tracker = &config.tracker;
        if tracker.mysql_db.is_empty() {
            info!("No database selected");
        }
        let options = MySqlConnectOptions::new()
            .host(tracker.mysql_host.as_str())
            .port(tracker.mysql_port)
            .username(tracker.mysql_username.as_str())
            .password(tracker.mysql_password.as_str())
            .database(tracker.mysql_db.as_str())
            .log_statements(LevelFilter::Debug)
            .log_slow_statements(LevelFilter::Debug, Duration::from_secs(1));
        let pool = MySqlPoolOptions::new()
            .max_connections(tracker.mysql_connections)
            .acquire_timeout(Duration::from_secs(tracker.mysql_timeout))
            .connect_lazy_with(options);
        Database {
            pool,
            stats,
            readonly: tracker.readonly,
            clear_peerlists: tracker.clear_peerlists,
            load_peerlists: tracker.load_peerlists,
            update_user_buffer: Mutex::new(String::new()),
            update_torrent_buffer: Mutex::new(String::new()),
            update_peer_heavy_buffer: Mutex::new(String::new()),
            update_peer_light_buffer: Mutex::new(String::new()),
            update_peer_hist_buffer: Mutex::new(String::new()),
            update_snatch_buffer: Mutex::new(String::new()),
            update_token_buffer: Mutex::new(String::new()),
            user_queue: Mutex::new(VecDeque::new()),
            torrent_queue: Mutex::new(VecDeque::new()),
            peer_queue: Mutex::new(VecDeque::new()),
            peer_hist_queue: Mutex::new(VecDeque::new()),
            snatch_queue: Mutex::new(VecDeque::new()),
            token_queue: Mutex::new(VecDeque::new()),
            u_active: AtomicBool::new(false),
            t_active: AtomicBool::new(false),
            p_active: AtomicBool::new(false),
            h_active: AtomicBool::new(false),
            s_active: AtomicBool::new(false),
            tok_active: AtomicBool::new(false),
        }
    }

    fn queue(&self, kind: FlushQueue) -> &Mutex<VecDeque<String>> {
        match kind {
            FlushQueue::Users => &self.user_queue,
            FlushQueue::Torrents => &self.torrent_queue,
            FlushQueue::Peers => &self.peer_queue,
            FlushQueue::PeerHist => &self.peer_hist_queue,
            FlushQueue::Snatches => &self.snatch_queue,
            FlushQueue::Tokens => &self.token_queue,
        }
    }

    fn queue_gauge(&self, kind: FlushQueue) -> &AtomicI64 {
        match kind {
            FlushQueue::Users => &self.stats.user_queue,
            FlushQueue::Torrents => &self.stats.torrent_queue,
            FlushQueue::Peers => &self.stats.peer_queue,
            FlushQueue::PeerHist => &self.stats.peer_hist_queue,
            FlushQueue::Snatches => &self.stats.snatch_queue,
            FlushQueue::Tokens => &self.stats.token_queue,
        }
    }

    fn active_flag(&self, kind: FlushQueue) -> &AtomicBool {
        match kind {
            FlushQueue::Users => &self.u_active,
            FlushQueue::Torrents => &self.t_active,
            FlushQueue::Peers => &self.p_active,
            FlushQueue::PeerHist => &self.h_active,
            FlushQueue::Snatches => &self.s_active,
            FlushQueue::Tokens => &self.tok_active,
        }
    }

    pub async fn shutdown(&self) {
        self.pool.close().await;
    }

    pub async fn clear_peer_data(&self) {
        if let Err(error) = sqlx::query("TRUNCATE xbt_files_users;").execute(&self.pool).await {
            error!("Unable to truncate xbt_files_users! ({})", error);
        }
        if let Err(error) = sqlx::query("UPDATE torrents SET Seeders = 0, Leechers = 0;").execute(&self.pool).await {
            error!("Unable to reset seeder and leecher count! ({})", error);
        }
    }

    //---------- Record buffers

    pub fn record_user(&self, record: &str) {
        let mut buffer = self.update_user_buffer.lock();
        if !buffer.is_empty() {
            buffer.push(',');
        }
        buffer.push_str(record);
    }

    pub fn record_torrent(&self, record: &str) {
        let mut buffer = self.update_torrent_buffer.lock();
        if !buffer.is_empty() {
            buffer.push(',');
        }
        buffer.push_str(record);
    }

    pub fn record_token(&self, record: &str) {
        let mut buffer = self.update_token_buffer.lock();
        if !buffer.is_empty() {
            buffer.push(',');
        }
        buffer.push_str(record);
    }

    pub fn record_peer_heavy(&self, record: &str, ipv4: &[u8], ipv6: &[u8], port: u16, peer_id: &PeerId, useragent: &str) {
        let mut buffer = self.update_peer_heavy_buffer.lock();
        if !buffer.is_empty() {
            buffer.push(',');
        }
        buffer.push_str(record);
        buffer.push_str(quote_bin(ipv4).as_str());
        buffer.push(',');
        buffer.push_str(quote_bin(ipv6).as_str());
        buffer.push(',');
        buffer.push_str(port.to_string().as_str());
        buffer.push(',');
        buffer.push_str(quote_bin(&peer_id.0).as_str());
        buffer.push(',');
        buffer.push_str(quote_str(useragent).as_str());
        buffer.push(')');
    }

    pub fn record_peer_light(&self, record: &str, peer_id: &PeerId) {
        let mut buffer = self.update_peer_light_buffer.lock();
        if !buffer.is_empty() {
            buffer.push(',');
        }
        buffer.push_str(record);
        buffer.push_str(quote_bin(&peer_id.0).as_str());
        buffer.push(')');
    }

    pub fn record_peer_hist(&self, record: &str, peer_id: &PeerId, ipv4: &[u8], ipv6: &[u8], torrent_id: u32) {
        let mut buffer = self.update_peer_hist_buffer.lock();
        if !buffer.is_empty() {
            buffer.push(',');
        }
        buffer.push_str(record);
        buffer.push(',');
        buffer.push_str(quote_bin(&peer_id.0).as_str());
        buffer.push(',');
        buffer.push_str(quote_bin(ipv4).as_str());
        buffer.push(',');
        buffer.push_str(quote_bin(ipv6).as_str());
        buffer.push(',');
        buffer.push_str(torrent_id.to_string().as_str());
        buffer.push(',');
        buffer.push_str(Utc::now().timestamp().to_string().as_str());
        buffer.push(')');
    }

    pub fn record_snatch(&self, record: &str, ipv4: &[u8], ipv6: &[u8]) {
        let mut buffer = self.update_snatch_buffer.lock();
        if !buffer.is_empty() {
            buffer.push(',');
        }
        buffer.push_str(record);
        buffer.push(',');
        buffer.push_str(quote_bin(ipv4).as_str());
        buffer.push(',');
        buffer.push_str(quote_bin(ipv6).as_str());
        buffer.push(')');
    }

    pub fn all_clear(&self) -> bool {
        self.user_queue.lock().is_empty()
            && self.torrent_queue.lock().is_empty()
            && self.peer_queue.lock().is_empty()
            && self.peer_hist_queue.lock().is_empty()
            && self.snatch_queue.lock().is_empty()
            && self.token_queue.lock().is_empty()
    }

    //---------- Flushes: buffer -> full SQL statement -> queue

    pub fn flush(self: &Arc<Self>) {
        self.flush_users();
        self.flush_torrents();
        self.flush_snatches();
        self.flush_peers();
        self.flush_peer_hist();
        self.flush_tokens();
    }

    pub fn flush_users(self: &Arc<Self>) {
        if self.readonly {
            self.update_user_buffer.lock().clear();
            return;
        }
        let mut queue = self.user_queue.lock();
        if let Some(front) = queue.front() {
            trace!("User flush queue size: {}, next query length: {}", queue.len(), front.len());
        }
        let mut buffer = self.update_user_buffer.lock();
        if buffer.is_empty() {
            return;
        }
        let sql = format!(
            "INSERT INTO users_main (ID, Uploaded, Downloaded, UploadedDaily, DownloadedDaily) VALUES {} \
            ON DUPLICATE KEY UPDATE Uploaded = Uploaded + VALUES(Uploaded), \
            Downloaded = Downloaded + VALUES(Downloaded), \
            UploadedDaily = UploadedDaily + VALUES(UploadedDaily), \
            DownloadedDaily = DownloadedDaily + VALUES(DownloadedDaily)",
            buffer
        );
        queue.push_back(sql);
        self.stats.user_queue.fetch_add(1, Ordering::Relaxed);
        buffer.clear();
        drop(buffer);
        drop(queue);
        self.spawn_flush(FlushQueue::Users);
    }

    pub fn flush_torrents(self: &Arc<Self>) {
        if self.readonly {
            self.update_torrent_buffer.lock().clear();
            return;
        }
        let mut queue = self.torrent_queue.lock();
        if let Some(front) = queue.front() {
            trace!("Torrent flush queue size: {}, next query length: {}", queue.len(), front.len());
        }
        let mut buffer = self.update_torrent_buffer.lock();
        if buffer.is_empty() {
            return;
        }
        let sql = format!(
            "INSERT INTO torrents (ID,Seeders,Leechers,Snatched,Balance) VALUES {} \
            ON DUPLICATE KEY UPDATE Seeders=VALUES(Seeders), Leechers=VALUES(Leechers), \
            Snatched=Snatched+VALUES(Snatched), Balance=VALUES(Balance), \
            last_action = IF(VALUES(Seeders) > 0, NOW(), last_action)",
            buffer
        );
        queue.push_back(sql);
        self.stats.torrent_queue.fetch_add(1, Ordering::Relaxed);
        buffer.clear();
        // Reinserted rows of deleted torrents are swept up by the site side
        // keying on the emptied info_hash.
        queue.push_back(String::from("DELETE FROM torrents WHERE info_hash = ''"));
        self.stats.torrent_queue.fetch_add(1, Ordering::Relaxed);
        drop(buffer);
        drop(queue);
        self.spawn_flush(FlushQueue::Torrents);
    }

    pub fn flush_snatches(self: &Arc<Self>) {
        if self.readonly {
            self.update_snatch_buffer.lock().clear();
            return;
        }
        let mut queue = self.snatch_queue.lock();
        if let Some(front) = queue.front() {
            trace!("Snatch flush queue size: {}, next query length: {}", queue.len(), front.len());
        }
        let mut buffer = self.update_snatch_buffer.lock();
        if buffer.is_empty() {
            return;
        }
        let sql = format!("INSERT INTO xbt_snatched (uid, fid, tstamp, ipv4, ipv6) VALUES {}", buffer);
        queue.push_back(sql);
        self.stats.snatch_queue.fetch_add(1, Ordering::Relaxed);
        buffer.clear();
        drop(buffer);
        drop(queue);
        self.spawn_flush(FlushQueue::Snatches);
    }

    pub fn flush_peers(self: &Arc<Self>) {
        if self.readonly {
            self.update_peer_light_buffer.lock().clear();
            self.update_peer_heavy_buffer.lock().clear();
            return;
        }
        let mut queue = self.peer_queue.lock();
        let qsize = queue.len();
        if let Some(front) = queue.front() {
            trace!("Peer flush queue size: {}, next query length: {}", qsize, front.len());
        }

        let mut heavy_buffer = self.update_peer_heavy_buffer.lock();
        let mut light_buffer = self.update_peer_light_buffer.lock();
        if heavy_buffer.is_empty() && light_buffer.is_empty() {
            return;
        }

        if !heavy_buffer.is_empty() {
            if qsize >= PEER_QUEUE_LIMIT {
                queue.pop_front();
                self.stats.peer_queue.fetch_sub(1, Ordering::Relaxed);
            }
            let sql = format!(
                "INSERT INTO xbt_files_users (uid,fid,active,uploaded,downloaded,upspeed,downspeed,remaining,corrupt,\
                timespent,ctime,mtime,announced,ipv4,ipv6,port,peer_id,useragent) VALUES {} \
                ON DUPLICATE KEY UPDATE active=VALUES(active), uploaded=VALUES(uploaded), \
                downloaded=VALUES(downloaded), upspeed=VALUES(upspeed), \
                downspeed=VALUES(downspeed), remaining=VALUES(remaining), \
                corrupt=VALUES(corrupt), timespent=VALUES(timespent), \
                announced=VALUES(announced), mtime=VALUES(mtime), port=VALUES(port)",
                heavy_buffer
            );
            queue.push_back(sql);
            self.stats.peer_queue.fetch_add(1, Ordering::Relaxed);
            heavy_buffer.clear();
        }
        if !light_buffer.is_empty() {
            if qsize >= PEER_QUEUE_LIMIT {
                queue.pop_front();
                self.stats.peer_queue.fetch_sub(1, Ordering::Relaxed);
            }
            let sql = format!(
                "INSERT INTO xbt_files_users (uid,fid,timespent,mtime,announced,peer_id) VALUES {} \
                ON DUPLICATE KEY UPDATE upspeed=0, downspeed=0, timespent=VALUES(timespent), \
                announced=VALUES(announced), mtime=VALUES(mtime)",
                light_buffer
            );
            queue.push_back(sql);
            self.stats.peer_queue.fetch_add(1, Ordering::Relaxed);
            light_buffer.clear();
        }
        drop(light_buffer);
        drop(heavy_buffer);
        drop(queue);
        self.spawn_flush(FlushQueue::Peers);
    }

    pub fn flush_peer_hist(self: &Arc<Self>) {
        if self.readonly {
            self.update_peer_hist_buffer.lock().clear();
            return;
        }
        let mut queue = self.peer_hist_queue.lock();
        let mut buffer = self.update_peer_hist_buffer.lock();
        if buffer.is_empty() {
            return;
        }
        let sql = format!(
            "INSERT IGNORE INTO xbt_peers_history (uid, downloaded, remaining, uploaded, upspeed, downspeed, timespent, peer_id, ipv4, ipv6, fid, mtime) VALUES {}",
            buffer
        );
        queue.push_back(sql);
        self.stats.peer_hist_queue.fetch_add(1, Ordering::Relaxed);
        buffer.clear();
        drop(buffer);
        drop(queue);
        self.spawn_flush(FlushQueue::PeerHist);
    }

    pub fn flush_tokens(self: &Arc<Self>) {
        if self.readonly {
            self.update_token_buffer.lock().clear();
            return;
        }
        let mut queue = self.token_queue.lock();
        if let Some(front) = queue.front() {
            trace!("Token flush queue size: {}, next query length: {}", queue.len(), front.len());
        }
        let mut buffer = self.update_token_buffer.lock();
        if buffer.is_empty() {
            return;
        }
        let sql = format!(
            "INSERT INTO users_freeleeches (UserID, TorrentID, Downloaded, Uploaded) VALUES {} \
            ON DUPLICATE KEY UPDATE Downloaded = Downloaded + VALUES(Downloaded), \
            Uploaded = Uploaded + VALUES(Uploaded)",
            buffer
        );
        queue.push_back(sql);
        self.stats.token_queue.fetch_add(1, Ordering::Relaxed);
        buffer.clear();
        drop(buffer);
        drop(queue);
        self.spawn_flush(FlushQueue::Tokens);
    }

    //---------- Drain workers

    fn spawn_flush(self: &Arc<Self>, kind: FlushQueue) {
        if self.active_flag(kind).compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            let database = self.clone();
            tokio::spawn(async move {
                database.do_flush(kind).await;
            });
        }
    }

    /// Drains one queue in order. A statement is only popped after the
    /// server accepted it; transient errors put the worker to sleep for
    /// three seconds and the statement is retried.
    async fn do_flush(self: Arc<Self>, kind: FlushQueue) {
        loop {
            let sql = match self.queue(kind).lock().front() {
                Some(front) => front.clone(),
                None => break,
            };
            if sql.is_empty() {
                self.pop_front(kind);
                continue;
            }
            let mut conn = loop {
                match self.pool.acquire().await {
                    Ok(conn) => break conn,
                    Err(error) => {
                        error!("MySQL connection pool exhausted ({})", error);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            };
            let start_time = Instant::now();
            match sqlx::query(sql.as_str()).execute(&mut *conn).await {
                Ok(_) => {
                    self.pop_front(kind);
                    trace!("{}s flushed in {} microseconds.", kind.name(), start_time.elapsed().as_micros());
                }
                Err(error) => {
                    let remaining = self.queue(kind).lock().len();
                    error!("Query error: {} in flush {}s with a qlength: {} queue size: {}", error, kind.name(), sql.len(), remaining);
                    drop(conn);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        }
        self.active_flag(kind).store(false, Ordering::Release);
    }

    fn pop_front(&self, kind: FlushQueue) {
        let mut queue = self.queue(kind).lock();
        if queue.pop_front().is_some() {
            self.queue_gauge(kind).fetch_sub(1, Ordering::Relaxed);
        }
    }

    //---------- Bulk loaders

    pub async fn load_site_options(&self, tracker: &Arc<TorrentTracker>) {
        for name in tracker.options.keys() {
            match sqlx::query("SELECT Value FROM options WHERE Name=?")
                .bind(name.as_str())
                .fetch_all(&self.pool)
                .await
            {
                Ok(rows) => {
                    for row in rows.iter() {
                        let value: String = match row.try_get(0) {
                            Ok(value) => value,
                            Err(_) => continue,
                        };
                        tracker.options.set(name.as_str(), value.as_str());
                    }
                }
                Err(error) => {
                    error!("Query error in load_site_options: {}", error);
                }
            }
        }
    }

    /// Merges `users_main` into the user map. Users missing from the result
    /// set are flagged deleted and dropped.
    pub async fn load_users(&self, tracker: &Arc<TorrentTracker>) {
        let rows = match sqlx::query(
            "SELECT ID, can_leech, torrent_pass, (Visible='0' OR IP='127.0.0.1') AS Protected, track_ipv6, personal_freeleech, personal_doubleseed FROM users_main WHERE Enabled='1'"
        ).fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(error) => {
                error!("Query error in load_users: {}", error);
                return;
            }
        };
        let mut users = tracker.users.lock();
        let mut cur_keys: std::collections::HashSet<String> = users.keys().cloned().collect();
        for row in rows.iter() {
            let id: i64 = row.try_get(0).unwrap_or(0);
            let can_leech: i64 = row.try_get(1).unwrap_or(0);
            let passkey: String = row.try_get(2).unwrap_or_default();
            let protect_ip: i64 = row.try_get(3).unwrap_or(0);
            let track_ipv6: i64 = row.try_get(4).unwrap_or(0);
            let pfl: Option<chrono::NaiveDateTime> = row.try_get(5).unwrap_or(None);
            let pds: Option<chrono::NaiveDateTime> = row.try_get(6).unwrap_or(None);
            let pfl = pfl.map(|stamp| stamp.and_utc().timestamp()).unwrap_or(0);
            let pds = pds.map(|stamp| stamp.and_utc().timestamp()).unwrap_or(0);
            match users.get(&passkey) {
                Some(user) => {
                    user.set_personal_freeleech(pfl);
                    user.set_personal_doubleseed(pds);
                    user.set_leech_status(can_leech != 0);
                    user.set_protected(protect_ip != 0);
                    user.set_track_ipv6(track_ipv6 != 0);
                    user.set_deleted(false);
                    cur_keys.remove(&passkey);
                }
                None => {
                    let user = Arc::new(User::new(id as u32, can_leech != 0, protect_ip != 0, track_ipv6 != 0, pfl, pds));
                    users.insert(passkey, user);
                }
            }
        }
        for passkey in cur_keys {
            if let Some(user) = users.remove(&passkey) {
                user.set_deleted(true);
            }
        }
        trace!("Loaded {} users", users.len());
    }

    /// Merges `torrents` into the torrent map. Tracked torrents missing
    /// from the result set are dropped with their swarm counters unwound.
    pub async fn load_torrents(&self, tracker: &Arc<TorrentTracker>) {
        let rows = match sqlx::query("SELECT ID, info_hash, freetorrent, doubletorrent, Snatched FROM torrents ORDER BY ID;")
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(error) => {
                error!("Query error in load_torrents: {}", error);
                return;
            }
        };
        let mut torrents = tracker.torrents.lock();
        let mut cur_keys: std::collections::HashSet<InfoHash> = torrents.keys().copied().collect();
        for row in rows.iter() {
            let id: i64 = row.try_get(0).unwrap_or(0);
            let info_hash: Vec<u8> = row.try_get(1).unwrap_or_default();
            let free_torrent: String = row.try_get(2).unwrap_or_default();
            let double_torrent: String = row.try_get(3).unwrap_or_default();
            let snatched: i64 = row.try_get(4).unwrap_or(0);
            let info_hash = match InfoHash::from_slice(info_hash.as_slice()) {
                Some(info_hash) => info_hash,
                None => continue,
            };
            let torrent = match torrents.entry(info_hash) {
                std::collections::hash_map::Entry::Occupied(entry) => {
                    let torrent = entry.into_mut();
                    torrent.tokened_users.clear();
                    cur_keys.remove(&info_hash);
                    torrent
                }
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let mut torrent = Torrent::new(id as u32);
                    torrent.completed = snatched as u32;
                    entry.insert(torrent)
                }
            };
            torrent.free_torrent = match free_torrent.as_str() {
                "1" => FreeTorrent::Free,
                "2" => FreeTorrent::Neutral,
                _ => FreeTorrent::Normal,
            };
            torrent.double_torrent = match double_torrent.as_str() {
                "1" => DoubleTorrent::Double,
                _ => DoubleTorrent::Normal,
            };
        }
        for info_hash in cur_keys {
            if let Some(torrent) = torrents.remove(&info_hash) {
                tracker.stats.leechers.fetch_sub(torrent.leechers.len() as i64, Ordering::Relaxed);
                tracker.stats.seeders.fetch_sub(torrent.seeders.len() as i64, Ordering::Relaxed);
                for peer in torrent.leechers.values() {
                    peer.user.decr_leeching();
                }
                for peer in torrent.seeders.values() {
                    peer.user.decr_seeding();
                }
            }
        }
        trace!("Loaded {} torrents", torrents.len());
    }

    pub async fn load_tokens(&self, tracker: &Arc<TorrentTracker>) {
        let rows = match sqlx::query(
            "SELECT us.UserID, us.FreeLeech, us.DoubleSeed, t.info_hash FROM users_slots AS us JOIN torrents AS t ON t.ID = us.TorrentID WHERE FreeLeech >= NOW() OR DoubleSeed >= NOW();"
        ).fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(error) => {
                error!("Query error in load_tokens: {}", error);
                return;
            }
        };
        let mut token_count = 0u64;
        let mut torrents = tracker.torrents.lock();
        for row in rows.iter() {
            let user_id: i64 = row.try_get(0).unwrap_or(0);
            let free_leech: Option<chrono::NaiveDateTime> = row.try_get(1).unwrap_or(None);
            let double_seed: Option<chrono::NaiveDateTime> = row.try_get(2).unwrap_or(None);
            let info_hash: Vec<u8> = row.try_get(3).unwrap_or_default();
            let info_hash = match InfoHash::from_slice(info_hash.as_slice()) {
                Some(info_hash) => info_hash,
                None => continue,
            };
            if let Some(torrent) = torrents.get_mut(&info_hash) {
                let slots = Slots {
                    free_leech: free_leech.map(|stamp| stamp.and_utc().timestamp()).unwrap_or(0),
                    double_seed: double_seed.map(|stamp| stamp.and_utc().timestamp()).unwrap_or(0),
                };
                torrent.tokened_users.insert(user_id as u32, slots);
                token_count += 1;
            }
        }
        drop(torrents);
        trace!("Loaded {} tokens", token_count);
    }

    pub async fn load_peers(&self, tracker: &Arc<TorrentTracker>) {
        if !self.load_peerlists {
            return;
        }
        self.load_peer_side(tracker, true).await;
        self.load_peer_side(tracker, false).await;
    }

    /// Rebuilds one side of every swarm from `xbt_files_users`. Runs one
    /// query per torrent, the way the peer tables are indexed.
    async fn load_peer_side(&self, tracker: &Arc<TorrentTracker>, seeders: bool) {
        let targets: Vec<(InfoHash, u32)> = tracker
            .torrents
            .lock()
            .iter()
            .map(|(info_hash, torrent)| (*info_hash, torrent.id))
            .collect();
        let mut num_loaded = 0u64;
        for (info_hash, torrent_id) in targets {
            let sql = if seeders {
                format!(
                    "SELECT um.torrent_pass, xfu.peer_id, xfu.port, xfu.ipv4, xfu.ipv6, xfu.uploaded, \
                    xfu.downloaded, xfu.remaining, xfu.corrupt, xfu.announced, xfu.ctime, xfu.mtime \
                    FROM xbt_files_users AS xfu INNER JOIN users_main AS um ON xfu.uid=um.ID \
                    WHERE xfu.active='1' AND um.Enabled='1' AND xfu.remaining=0 AND xfu.fid={}",
                    torrent_id
                )
            } else {
                format!(
                    "SELECT um.torrent_pass, xfu.peer_id, xfu.port, xfu.ipv4, xfu.ipv6, xfu.uploaded, \
                    xfu.downloaded, xfu.remaining, xfu.corrupt, xfu.announced, xfu.ctime, xfu.mtime \
                    FROM xbt_files_users AS xfu INNER JOIN users_main AS um ON xfu.uid=um.ID \
                    WHERE xfu.active='1' AND um.Enabled='1' AND um.can_leech='1' AND xfu.remaining!=0 AND xfu.fid={}",
                    torrent_id
                )
            };
            let rows = match sqlx::query(sql.as_str()).fetch_all(&self.pool).await {
                Ok(rows) => rows,
                Err(error) => {
                    if seeders {
                        error!("Query error in load_seeders: {}", error);
                    } else {
                        error!("Query error in load_leechers: {}", error);
                    }
                    return;
                }
            };
            let users = tracker.users.lock();
            let mut torrents = tracker.torrents.lock();
            let torrent = match torrents.get_mut(&info_hash) {
                Some(torrent) => torrent,
                None => continue,
            };
            for row in rows.iter() {
                let passkey: String = row.try_get(0).unwrap_or_default();
                let peer_id_bytes: Vec<u8> = row.try_get(1).unwrap_or_default();
                let user = match users.get(&passkey) {
                    Some(user) => user.clone(),
                    None => continue,
                };
                let peer_id = match PeerId::from_slice(peer_id_bytes.as_slice()) {
                    Some(peer_id) => peer_id,
                    None => continue,
                };
                let key = peer_key(torrent_id, user.get_id(), &peer_id);
                let side = if seeders { &mut torrent.seeders } else { &mut torrent.leechers };
                let domain = tracker.find_or_create_domain("unknown");
                let peer = side.entry(key).or_insert_with(|| Peer::new(user.clone(), domain));
                peer.user = user.clone();
                if seeders {
                    peer.user.incr_seeding();
                    tracker.stats.seeders.fetch_add(1, Ordering::Relaxed);
                } else {
                    peer.user.incr_leeching();
                    tracker.stats.leechers.fetch_add(1, Ordering::Relaxed);
                }
                let port: i64 = row.try_get(2).unwrap_or(0);
                peer.port = port as u16;
                peer.ipv4 = row.try_get(3).unwrap_or_default();
                peer.ipv6 = row.try_get(4).unwrap_or_default();
                peer.uploaded = row.try_get(5).unwrap_or(0);
                peer.downloaded = row.try_get(6).unwrap_or(0);
                peer.left = row.try_get(7).unwrap_or(0);
                peer.corrupt = row.try_get(8).unwrap_or(0);
                let announces: i64 = row.try_get(9).unwrap_or(0);
                peer.announces = announces as u32;
                peer.first_announced = row.try_get(10).unwrap_or(0);
                peer.last_announced = row.try_get(11).unwrap_or(0);
                peer.ipv4_port = Vec::new();
                peer.ipv6_port = Vec::new();
                if !peer.ipv4.is_empty() {
                    peer.ipv4_port = peer.ipv4.clone();
                    peer.ipv4_port.push((peer.port >> 8) as u8);
                    peer.ipv4_port.push((peer.port & 0xff) as u8);
                }
                if !peer.ipv6.is_empty() {
                    peer.ipv6_port = peer.ipv6.clone();
                    peer.ipv6_port.push((peer.port >> 8) as u8);
                    peer.ipv6_port.push((peer.port & 0xff) as u8);
                }
                peer.visible = peer_is_visible(&peer.user.clone(), peer);
                num_loaded += 1;
            }
        }
        if seeders {
            trace!("Loaded {} seeders", num_loaded);
        } else {
            trace!("Loaded {} leechers", num_loaded);
        }
    }

    pub async fn load_blacklist(&self, tracker: &Arc<TorrentTracker>) {
        let rows = match sqlx::query("SELECT peer_id FROM xbt_client_blacklist;").fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(error) => {
                error!("Query error in load_blacklist: {}", error);
                return;
            }
        };
        let mut blacklist = tracker.blacklist.lock();
        blacklist.clear();
        for row in rows.iter() {
            let peer_id: String = row.try_get(0).unwrap_or_default();
            blacklist.push(peer_id.into_bytes());
        }
        if blacklist.is_empty() {
            info!("Assuming no blacklist desired, disabling");
        } else {
            trace!("Loaded {} clients into the blacklist", blacklist.len());
        }
    }
}
