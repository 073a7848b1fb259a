use std::ops::Bound;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use chrono::Utc;
use log::{debug, error, trace};
use crate::common::{bencode_bytes, bencode_int, bencode_str, ipv4_is_public, ipv6_is_public, CustomError, QueryMap};
use crate::tracker::{get_del_reason, peer_is_visible, peer_key, DelMessage, Domain, DoubleTorrent, FreeTorrent, InfoHash, Peer, PeerId, PeerKey, PeerList, Slots, Torrent, TorrentTracker, User};

const MAX_ALLOWED_BYTES_TRANSFERRED: i64 = 999_999_999_999_999;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum AnnounceEvent {
    None,
    Started,
    Completed,
    Stopped,
    Paused,
}

impl AnnounceEvent {
    pub fn from_params(params: &QueryMap) -> AnnounceEvent {
        match param_string(params, "event").as_deref() {
            Some("started") => AnnounceEvent::Started,
            Some("completed") => AnnounceEvent::Completed,
            Some("stopped") => AnnounceEvent::Stopped,
            Some("paused") => AnnounceEvent::Paused,
            _ => AnnounceEvent::None,
        }
    }
}

/// Connection-level facts the engine needs besides the query string.
pub struct RequestMeta {
    pub remote_ip: IpAddr,
    pub forwarded_for: Option<String>,
    pub user_agent: String,
}

pub fn param_first<'a>(params: &'a QueryMap, key: &str) -> Option<&'a [u8]> {
    params.get(key).and_then(|values| values.first()).map(|value| value.as_slice())
}

pub fn param_string(params: &QueryMap, key: &str) -> Option<String> {
    param_first(params, key).map(|value| String::from_utf8_lossy(value).to_string())
}

pub fn param_i64(params: &QueryMap, key: &str) -> i64 {
    param_string(params, key)
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(0)
}

fn ipv4_binary(text: &str) -> Vec<u8> {
    match text.parse::<Ipv4Addr>() {
        Ok(addr) => {
            if ipv4_is_public(addr) {
                addr.octets().to_vec()
            } else {
                trace!("Rejecting IP: {}", text);
                Vec::new()
            }
        }
        Err(_) => Vec::new(),
    }
}

fn ipv6_binary(text: &str) -> Vec<u8> {
    match text.parse::<Ipv6Addr>() {
        Ok(addr) => {
            if ipv6_is_public(addr) {
                addr.octets().to_vec()
            } else {
                trace!("Rejecting IP: {}", text);
                Vec::new()
            }
        }
        Err(_) => Vec::new(),
    }
}

struct SelfView {
    user_id: u32,
    ipv4_port: Vec<u8>,
    ipv6_port: Vec<u8>,
    has_ipv6: bool,
}

/// Walks one peer map round-robin, starting after the stored cursor and
/// wrapping once, appending compact endpoints until `numwant` is reached.
/// Returns the new cursor position.
fn select_from(
    list: &PeerList,
    cursor: &[u8],
    numwant: usize,
    found: &mut usize,
    own: &SelfView,
    skip_deleted: bool,
    ipv6_enabled: bool,
    peers: &mut Vec<u8>,
    peers6: &mut Vec<u8>,
) -> PeerKey {
    let mut new_cursor = cursor.to_vec();
    let head = list.range::<[u8], _>((Bound::Excluded(cursor), Bound::Unbounded));
    let tail = list.range::<[u8], _>((Bound::Unbounded, Bound::Included(cursor)));
    for (key, candidate) in head.chain(tail) {
        if *found >= numwant {
            break;
        }
        if skip_deleted && candidate.user.is_deleted() {
            continue;
        }
        // Never hand peers their own endpoints, other sessions of the same
        // user, or peers that are not visible.
        if (!own.ipv4_port.is_empty() && candidate.ipv4_port == own.ipv4_port)
            || (!own.ipv6_port.is_empty() && candidate.ipv6_port == own.ipv6_port)
            || candidate.user.get_id() == own.user_id
            || !candidate.visible
        {
            continue;
        }
        // IPv6 endpoints only go to peers that presented one themselves.
        if own.has_ipv6 && !candidate.ipv6_port.is_empty() && ipv6_enabled && candidate.user.track_ipv6() {
            peers6.extend_from_slice(candidate.ipv6_port.as_slice());
            *found += 1;
        } else if !candidate.ipv4_port.is_empty() {
            peers.extend_from_slice(candidate.ipv4_port.as_slice());
            *found += 1;
        }
        new_cursor = key.clone();
    }
    new_cursor
}

/// The announce state machine over (user, torrent, peer-key). Runs with the
/// torrent list lock held; everything it touches besides the swarm maps is
/// atomic or separately locked.
pub fn handle_announce(
    tracker: &Arc<TorrentTracker>,
    torrent: &mut Torrent,
    user: &Arc<User>,
    domain: &Arc<Domain>,
    params: &QueryMap,
    meta: &RequestMeta,
) -> Result<Vec<u8>, CustomError> {
    let cur_time = Utc::now().timestamp();

    match param_first(params, "compact") {
        Some(value) if value == b"1" => {}
        _ => return Err(CustomError::new("Your client does not support compact announces")),
    }

    let left = param_i64(params, "left").max(0);
    let mut uploaded = param_i64(params, "uploaded").max(0);
    let mut downloaded = param_i64(params, "downloaded").max(0);
    let corrupt = param_i64(params, "corrupt").max(0);
    let event = AnnounceEvent::from_params(params);

    let mut snatched = 0i64;
    let mut active = 1i64;
    let mut inserted = false;
    let mut update_torrent = false;
    let mut completed_torrent = false;
    let mut stopped_torrent = false;
    let mut paused_torrent = false;
    let expire_token = false;
    let mut peer_changed = false;
    let (mut inc_l, mut inc_s, mut dec_l, mut dec_s) = (false, false, false, false);
    let userid = user.get_id();

    let mut ipv4_text = String::new();
    let mut ipv6_text = String::new();
    let mut public_ipv4_text = String::new();
    let mut public_ipv6_text = String::new();
    match meta.remote_ip {
        IpAddr::V4(ip) => {
            ipv4_text = ip.to_string();
            public_ipv4_text = ip.to_string();
        }
        IpAddr::V6(ip) => {
            ipv6_text = ip.to_string();
            public_ipv6_text = ip.to_string();
        }
    }

    let now = cur_time;
    let sitewide_freeleech = ((tracker.options.get_time("SitewideFreeleechStartTime") <= now)
        && (tracker.options.get_time("SitewideFreeleechEndTime") >= now)
        && (tracker.options.get_str("SitewideFreeleechMode") == "timed"))
        || (tracker.options.get_str("SitewideFreeleechMode") == "perma");
    let sitewide_doubleseed = ((tracker.options.get_time("SitewideDoubleseedStartTime") <= now)
        && (tracker.options.get_time("SitewideDoubleseedEndTime") >= now)
        && (tracker.options.get_str("SitewideDoubleseedMode") == "timed"))
        || (tracker.options.get_str("SitewideDoubleseedMode") == "perma");

    let peer_id = match param_first(params, "peer_id") {
        None => return Err(CustomError::new("No peer ID")),
        Some(value) => match PeerId::from_slice(value) {
            Some(peer_id) => peer_id,
            None => return Err(CustomError::new("Invalid peer ID")),
        },
    };

    if tracker.check_blacklist(&peer_id) {
        return Err(CustomError::new("Your client is blacklisted!"));
    }

    let key = peer_key(torrent.id, userid, &peer_id);

    if event == AnnounceEvent::Completed {
        // Sanity check just to be extra safe
        completed_torrent = left == 0;
    } else if event == AnnounceEvent::Stopped {
        stopped_torrent = true;
        peer_changed = true;
        update_torrent = true;
        active = 0;
    }

    // Insert/find the peer in the torrent list
    use std::collections::btree_map::Entry;
    let mut in_seeders;
    let peer: &mut Peer = if left > 0 {
        in_seeders = false;
        match torrent.leechers.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                // The seed list is not searched here; the peer reaper sorts
                // out any abandoned twin eventually.
                inserted = true;
                inc_l = true;
                entry.insert(Peer::new(user.clone(), domain.clone()))
            }
        }
    } else if completed_torrent {
        let duplicate_seeder = torrent.seeders.contains_key(&key);
        match torrent.leechers.entry(key.clone()) {
            Entry::Occupied(entry) => {
                if duplicate_seeder {
                    // The peer exists in both lists; just fix the seed count.
                    dec_s = true;
                }
                in_seeders = false;
                entry.into_mut()
            }
            Entry::Vacant(_) => {
                in_seeders = true;
                match torrent.seeders.entry(key.clone()) {
                    Entry::Occupied(entry) => {
                        completed_torrent = false;
                        entry.into_mut()
                    }
                    Entry::Vacant(entry) => {
                        inserted = true;
                        inc_s = true;
                        entry.insert(Peer::new(user.clone(), domain.clone()))
                    }
                }
            }
        }
    } else {
        in_seeders = true;
        match torrent.seeders.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                inc_s = true;
                match torrent.leechers.remove(&key) {
                    Some(existing) => {
                        peer_changed = true;
                        dec_l = true;
                        entry.insert(existing)
                    }
                    None => {
                        inserted = true;
                        entry.insert(Peer::new(user.clone(), domain.clone()))
                    }
                }
            }
        }
    };

    let mut upspeed = 0i64;
    let mut downspeed = 0i64;
    let mut real_uploaded_change = 0i64;
    let mut real_downloaded_change = 0i64;
    if event == AnnounceEvent::Paused {
        paused_torrent = true;
    }

    if paused_torrent != peer.paused {
        // Account for paused peers
        peer.paused = paused_torrent;
        if paused_torrent {
            torrent.paused += 1;
        } else {
            torrent.paused = torrent.paused.saturating_sub(1);
        }
    }

    if inserted || event == AnnounceEvent::Started {
        // New peer on this torrent (maybe)
        update_torrent = true;

        uploaded = uploaded.min(MAX_ALLOWED_BYTES_TRANSFERRED);
        downloaded = downloaded.min(MAX_ALLOWED_BYTES_TRANSFERRED);

        peer.first_announced = cur_time;
        peer.last_announced = 0;
        peer.uploaded = uploaded;
        peer.downloaded = downloaded;
        peer.corrupt = corrupt;
        peer.announces = 1;
        peer_changed = true;
    } else if uploaded < peer.uploaded || downloaded < peer.downloaded {
        // Transfer totals went backwards: the client restarted. Accept the
        // new totals, credit nothing.
        peer.announces += 1;
        peer.uploaded = uploaded;
        peer.downloaded = downloaded;
        peer_changed = true;
    } else {
        let mut uploaded_change = 0i64;
        let mut downloaded_change = 0i64;
        let mut corrupt_change = 0i64;
        peer.announces += 1;

        if uploaded != peer.uploaded {
            uploaded_change = (uploaded - peer.uploaded).min(MAX_ALLOWED_BYTES_TRANSFERRED);
            real_uploaded_change = uploaded_change;
            peer.uploaded = uploaded;
        }
        if downloaded != peer.downloaded {
            downloaded_change = (downloaded - peer.downloaded).min(MAX_ALLOWED_BYTES_TRANSFERRED);
            real_downloaded_change = downloaded_change;
            peer.downloaded = downloaded;
        }
        if corrupt != peer.corrupt {
            corrupt_change = corrupt - peer.corrupt;
            peer.corrupt = corrupt;
            torrent.balance -= corrupt_change;
            update_torrent = true;
        }
        peer_changed = peer_changed || uploaded_change != 0 || downloaded_change != 0 || corrupt_change != 0;

        if uploaded_change != 0 || downloaded_change != 0 {
            torrent.balance += uploaded_change;
            torrent.balance -= downloaded_change;
            torrent.balance -= corrupt;
            update_torrent = true;

            if cur_time > peer.last_announced {
                upspeed = uploaded_change / (cur_time - peer.last_announced);
                downspeed = downloaded_change / (cur_time - peer.last_announced);
            }
            let slot = torrent.tokened_users.get(&userid).copied();

            if slot.is_some() {
                let record = format!("({},{},{},{})", userid, torrent.id, downloaded_change, uploaded_change);
                tracker.database.record_token(record.as_str());
            }

            if torrent.free_torrent == FreeTorrent::Neutral {
                downloaded_change = 0;
                uploaded_change = 0;
            } else if torrent.free_torrent == FreeTorrent::Free
                || sitewide_freeleech
                || slot.map(|s| s.free_leech >= now).unwrap_or(false)
                || user.pfl() >= now
            {
                downloaded_change = 0;
            }

            if torrent.double_torrent == DoubleTorrent::Double
                || sitewide_doubleseed
                || slot.map(|s| s.double_seed >= now).unwrap_or(false)
                || user.pds() >= now
            {
                uploaded_change = uploaded_change.min(MAX_ALLOWED_BYTES_TRANSFERRED) * 2;
            }

            if uploaded_change != 0 || downloaded_change != 0 || real_uploaded_change != 0 || real_downloaded_change != 0 {
                let record = format!(
                    "({},{},{},{},{})",
                    userid, uploaded_change, downloaded_change, real_uploaded_change, real_downloaded_change
                );
                tracker.database.record_user(record.as_str());
            }
        }
    }
    peer.left = left;

    // Reject leech forbidden peers early
    if !user.can_leech() && left > 0 {
        return Err(CustomError::new("Access denied, leeching forbidden"));
    }

    if let Some(ip) = param_string(params, "ip") {
        match ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => ipv4_text = ip,
            Ok(IpAddr::V6(_)) => ipv6_text = ip,
            Err(_) => {}
        }
    }

    if let Some(forwarded) = meta.forwarded_for.as_ref() {
        match forwarded.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => {
                ipv4_text = forwarded.clone();
                public_ipv4_text = forwarded.clone();
            }
            Ok(IpAddr::V6(_)) => {
                ipv6_text = forwarded.clone();
                public_ipv6_text = forwarded.clone();
            }
            Err(_) => {}
        }
    }

    if let Some(ip) = param_string(params, "ipv4") {
        ipv4_text = ip;
    }
    if let Some(ip) = param_string(params, "ipv6") {
        ipv6_text = ip;
    }

    // Convert IPs to binary representations, dropping anything that does
    // not pass the public-address filter.
    let ipv4 = if ipv4_text.is_empty() { Vec::new() } else { ipv4_binary(ipv4_text.as_str()) };
    let ipv6 = if ipv6_text.is_empty() { Vec::new() } else { ipv6_binary(ipv6_text.as_str()) };
    let public_ipv4 = if public_ipv4_text.is_empty() { Vec::new() } else { ipv4_binary(public_ipv4_text.as_str()) };
    let public_ipv6 = if public_ipv6_text.is_empty() { Vec::new() } else { ipv6_binary(public_ipv6_text.as_str()) };

    if ipv4.is_empty() && ipv6.is_empty() {
        return Err(CustomError::new("Invalid IP detected"));
    }

    let port = (param_i64(params, "port") & 0xffff) as u16;
    // Generate compact ip/port endpoints
    if inserted || port != peer.port || ipv4 != peer.ipv4 || ipv6 != peer.ipv6 {
        peer.port = port;
        peer.ipv4 = Vec::new();
        peer.ipv6 = Vec::new();
        peer.ipv4_port = Vec::new();
        peer.ipv6_port = Vec::new();

        if !ipv4.is_empty() {
            peer.ipv4 = ipv4.clone();
            // IP+Port is 6 bytes for IPv4
            peer.ipv4_port = ipv4.clone();
            peer.ipv4_port.push((port >> 8) as u8);
            peer.ipv4_port.push((port & 0xff) as u8);
        }

        if !ipv6.is_empty() {
            peer.ipv6 = ipv6.clone();
            // IP+Port is 18 bytes for IPv6
            peer.ipv6_port = ipv6.clone();
            peer.ipv6_port.push((port >> 8) as u8);
            peer.ipv6_port.push((port & 0xff) as u8);
        }
    }

    // Update the peer
    peer.last_announced = cur_time;
    peer.visible = peer_is_visible(user, peer);

    // Add peer data to the database
    if peer_changed {
        let record = format!(
            "({},{},{},{},{},{},{},{},{},{},{},{},{},",
            userid,
            torrent.id,
            active,
            uploaded,
            downloaded,
            upspeed,
            downspeed,
            left,
            corrupt,
            cur_time - peer.first_announced,
            peer.first_announced,
            peer.last_announced,
            peer.announces
        );
        let (record_ipv4, record_ipv6): (&[u8], &[u8]) = if user.is_protected() {
            (&[], &[])
        } else {
            (ipv4.as_slice(), ipv6.as_slice())
        };
        tracker.database.record_peer_heavy(record.as_str(), record_ipv4, record_ipv6, port, &peer_id, meta.user_agent.as_str());
    } else {
        let record = format!(
            "({},{},{},{},{},",
            userid,
            torrent.id,
            cur_time - peer.first_announced,
            peer.last_announced,
            peer.announces
        );
        tracker.database.record_peer_light(record.as_str(), &peer_id);
    }

    if real_uploaded_change > 0 || real_downloaded_change > 0 {
        let record = format!(
            "({},{},{},{},{},{},{}",
            userid,
            real_downloaded_change,
            left,
            real_uploaded_change,
            upspeed,
            downspeed,
            cur_time - peer.first_announced
        );
        tracker.database.record_peer_hist(record.as_str(), &peer_id, ipv4.as_slice(), ipv6.as_slice(), torrent.id);
    }

    // Snapshot of the peer for the selection and stats phases, taken before
    // any completed-event migration moves it between the maps.
    let own = SelfView {
        user_id: userid,
        ipv4_port: peer.ipv4_port.clone(),
        ipv6_port: peer.ipv6_port.clone(),
        has_ipv6: !peer.ipv6.is_empty(),
    };
    let self_ipv4 = peer.ipv4.clone();
    let self_ipv6 = peer.ipv6.clone();
    let old_user = peer.user.clone();

    // Select peers!
    let numwant_limit = tracker.numwant_limit.load(Ordering::Relaxed) as i64;
    let mut numwant = match param_first(params, "numwant") {
        None => numwant_limit,
        Some(_) => param_i64(params, "numwant").clamp(0, numwant_limit),
    } as usize;

    if stopped_torrent {
        numwant = 0;
        if left > 0 {
            dec_l = true;
        } else {
            dec_s = true;
        }
    } else if completed_torrent {
        snatched = 1;
        update_torrent = true;
        torrent.completed += 1;

        let (record_ipv4, record_ipv6): (&[u8], &[u8]) = if user.is_protected() {
            (&[], &[])
        } else {
            (ipv4.as_slice(), ipv6.as_slice())
        };
        let record = format!("({},{},{}", userid, torrent.id, cur_time);
        tracker.database.record_snatch(record.as_str(), record_ipv4, record_ipv6);

        // User is a seeder now!
        if !inserted {
            if let Some(existing) = torrent.leechers.remove(&key) {
                torrent.seeders.insert(key.clone(), existing);
            }
            in_seeders = true;
            dec_l = true;
            inc_s = true;
        }
        if expire_token {
            tracker.site_comm.expire_token(torrent.id, userid);
            torrent.tokened_users.remove(&userid);
        }
    } else if !user.can_leech() && left > 0 {
        numwant = 0;
    }

    let mut peers: Vec<u8> = Vec::new();
    let mut peers6: Vec<u8> = Vec::new();
    if numwant > 0 {
        peers.reserve(numwant * 6);
        peers6.reserve(numwant * 18);
        let ipv6_enabled = tracker.options.get_bool("EnableIPv6Tracker");
        let mut found_peers = 0usize;
        if left > 0 && !torrent.seeders.is_empty() {
            // Show seeders to leechers first
            torrent.last_selected_seeder = select_from(
                &torrent.seeders,
                torrent.last_selected_seeder.as_slice(),
                numwant,
                &mut found_peers,
                &own,
                false,
                ipv6_enabled,
                &mut peers,
                &mut peers6,
            );
        }
        // Seeder or leecher with not enough peers
        if found_peers < numwant && !torrent.leechers.is_empty() {
            torrent.last_selected_leecher = select_from(
                &torrent.leechers,
                torrent.last_selected_leecher.as_slice(),
                numwant,
                &mut found_peers,
                &own,
                true,
                ipv6_enabled,
                &mut peers,
                &mut peers6,
            );
        }
    }

    // Update the stats
    tracker.stats.succ_announcements.fetch_add(1, Ordering::Relaxed);

    if dec_l || dec_s || inc_l || inc_s {
        if inc_l {
            user.incr_leeching();
            tracker.stats.leechers.fetch_add(1, Ordering::Relaxed);
        }
        if inc_s {
            user.incr_seeding();
            tracker.stats.seeders.fetch_add(1, Ordering::Relaxed);
        }
        if dec_l {
            user.decr_leeching();
            tracker.stats.leechers.fetch_sub(1, Ordering::Relaxed);
        }
        if dec_s {
            user.decr_seeding();
            tracker.stats.seeders.fetch_sub(1, Ordering::Relaxed);
        }
        if inc_l || inc_s {
            if let Ok(bytes) = <[u8; 16]>::try_from(self_ipv6.as_slice()) {
                let addr = Ipv6Addr::from(bytes);
                if ipv6_is_public(addr) {
                    tracker.stats.ipv6_peers.fetch_add(1, Ordering::Relaxed);
                    trace!("Peer with IPv6 address {} added.", addr);
                }
            }
            if let Ok(bytes) = <[u8; 4]>::try_from(self_ipv4.as_slice()) {
                let addr = Ipv4Addr::from(bytes);
                if ipv4_is_public(addr) {
                    tracker.stats.ipv4_peers.fetch_add(1, Ordering::Relaxed);
                    trace!("Peer with IPv4 address {} added.", addr);
                }
            }
        }
        if dec_l || dec_s {
            if let Ok(bytes) = <[u8; 16]>::try_from(self_ipv6.as_slice()) {
                let addr = Ipv6Addr::from(bytes);
                if ipv6_is_public(addr) {
                    tracker.stats.ipv6_peers.fetch_sub(1, Ordering::Relaxed);
                    trace!("Peer with IPv6 address {} removed.", addr);
                }
            }
            if let Ok(bytes) = <[u8; 4]>::try_from(self_ipv4.as_slice()) {
                let addr = Ipv4Addr::from(bytes);
                if ipv4_is_public(addr) {
                    tracker.stats.ipv4_peers.fetch_sub(1, Ordering::Relaxed);
                    trace!("Peer with IPv4 address {} removed.", addr);
                }
            }
        }
    }

    // Correct the stats for the old user if the peer's user link has changed
    if !Arc::ptr_eq(&old_user, user) {
        if !stopped_torrent {
            if left > 0 {
                user.incr_leeching();
                old_user.decr_leeching();
            } else {
                user.incr_seeding();
                old_user.decr_seeding();
            }
        }
        let side = if in_seeders { &mut torrent.seeders } else { &mut torrent.leechers };
        if let Some(peer) = side.get_mut(&key) {
            peer.user = user.clone();
        }
    }

    // Delete stopped peers as late as possible to keep the swarm sizes in
    // the response accurate.
    if stopped_torrent {
        if left > 0 {
            torrent.leechers.remove(&key);
        } else {
            torrent.seeders.remove(&key);
        }
    }

    if update_torrent || torrent.last_flushed + 3600 < cur_time {
        torrent.last_flushed = cur_time;
        let record = format!(
            "({},{},{},{},{})",
            torrent.id,
            torrent.seeders.len(),
            torrent.leechers.len(),
            snatched,
            torrent.balance
        );
        tracker.database.record_torrent(record.as_str());
    }

    // The BitTorrent spec mandates sorted keys.
    let announce_interval = tracker.announce_interval.load(Ordering::Relaxed) as i64;
    let mut output: Vec<u8> = Vec::with_capacity(350);
    output.push(b'd');
    output.extend_from_slice(bencode_str("complete").as_bytes());
    output.extend_from_slice(bencode_int(torrent.seeders.len() as i64).as_bytes());
    output.extend_from_slice(bencode_str("downloaded").as_bytes());
    output.extend_from_slice(bencode_int(torrent.completed as i64).as_bytes());
    if !public_ipv6.is_empty() {
        output.extend_from_slice(bencode_str("external ip").as_bytes());
        output.extend_from_slice(bencode_bytes(public_ipv6.as_slice()).as_slice());
    } else if !public_ipv4.is_empty() {
        output.extend_from_slice(bencode_str("external ip").as_bytes());
        output.extend_from_slice(bencode_bytes(public_ipv4.as_slice()).as_slice());
    }
    output.extend_from_slice(bencode_str("incomplete").as_bytes());
    output.extend_from_slice(bencode_int(torrent.leechers.len() as i64).as_bytes());
    // Spread announces more evenly on big swarms.
    output.extend_from_slice(bencode_str("interval").as_bytes());
    output.extend_from_slice(bencode_int(announce_interval + (torrent.seeders.len() as i64).min(600)).as_bytes());
    output.extend_from_slice(bencode_str("min interval").as_bytes());
    output.extend_from_slice(bencode_int(announce_interval).as_bytes());
    output.extend_from_slice(bencode_str("peers").as_bytes());
    output.extend_from_slice(bencode_bytes(peers.as_slice()).as_slice());
    if !peers6.is_empty() {
        output.extend_from_slice(bencode_str("peers6").as_bytes());
        output.extend_from_slice(bencode_bytes(peers6.as_slice()).as_slice());
    }
    output.push(b'e');

    Ok(output)
}

/// Scrape over any number of `info_hash` parameters; unknown hashes are
/// silently omitted.
pub fn handle_scrape(tracker: &Arc<TorrentTracker>, info_hashes: &[Vec<u8>]) -> Vec<u8> {
    let mut output: Vec<u8> = Vec::new();
    output.push(b'd');
    output.extend_from_slice(bencode_str("files").as_bytes());
    output.push(b'd');
    for hash in info_hashes.iter() {
        let info_hash = match InfoHash::from_slice(hash.as_slice()) {
            Some(info_hash) => info_hash,
            None => continue,
        };
        let torrents = tracker.torrents.lock();
        let torrent = match torrents.get(&info_hash) {
            Some(torrent) => torrent,
            None => continue,
        };
        output.extend_from_slice(bencode_bytes(&info_hash.0).as_slice());
        output.push(b'd');
        output.extend_from_slice(bencode_str("complete").as_bytes());
        output.extend_from_slice(bencode_int(torrent.seeders.len() as i64).as_bytes());
        output.extend_from_slice(bencode_str("downloaded").as_bytes());
        output.extend_from_slice(bencode_int(torrent.completed as i64).as_bytes());
        output.extend_from_slice(bencode_str("incomplete").as_bytes());
        output.extend_from_slice(bencode_int(torrent.leechers.len() as i64).as_bytes());
        output.extend_from_slice(bencode_str("downloaders").as_bytes());
        output.extend_from_slice(bencode_int(torrent.leechers.len() as i64 - torrent.paused as i64).as_bytes());
        output.push(b'e');
    }
    output.extend_from_slice(b"ee");
    output
}

/// The admin control plane. Dispatches on `action` and mutates the swarm
/// store; every branch answers 204 on success or 500 on misuse.
pub fn handle_update(tracker: &Arc<TorrentTracker>, params: &QueryMap) -> u16 {
    let mut response_code = 204u16;
    let action = param_string(params, "action").unwrap_or_default();
    if action.is_empty() {
        error!("Update called without action!");
        return 500;
    }
    debug!("Update called: {}", action);

    match action.as_str() {
        "options" => {
            let name = param_string(params, "set").unwrap_or_default();
            let value = param_string(params, "value").unwrap_or_default();
            tracker.options.set(name.as_str(), value.as_str());
            debug!("Set option: {} -> {}", name, value);
        }
        "change_passkey" => {
            let oldpasskey = param_string(params, "oldpasskey").unwrap_or_default();
            let newpasskey = param_string(params, "newpasskey").unwrap_or_default();
            let mut users = tracker.users.lock();
            match users.remove(&oldpasskey) {
                Some(user) => {
                    let userid = user.get_id();
                    users.insert(newpasskey.clone(), user);
                    debug!("Changed passkey from {} to {} for user {}", oldpasskey, newpasskey, userid);
                }
                None => {
                    error!("No user with passkey {} exists when attempting to change passkey to {}", oldpasskey, newpasskey);
                    response_code = 500;
                }
            }
        }
        "add_torrent" => {
            let info_hash = param_first(params, "info_hash").and_then(InfoHash::from_slice);
            match info_hash {
                Some(info_hash) => {
                    let mut torrents = tracker.torrents.lock();
                    let torrent = torrents
                        .entry(info_hash)
                        .or_insert_with(|| Torrent::new(param_i64(params, "id") as u32));
                    torrent.free_torrent = parse_free(params);
                    torrent.double_torrent = parse_double(params);
                    debug!(
                        "Added torrent {}. FL: {:?} {}. DS: {:?} {}",
                        torrent.id,
                        torrent.free_torrent,
                        param_string(params, "freetorrent").unwrap_or_default(),
                        torrent.double_torrent,
                        param_string(params, "doubletorrent").unwrap_or_default()
                    );
                }
                None => {
                    error!("Add torrent called with an invalid info hash");
                    response_code = 500;
                }
            }
        }
        "update_torrent" => {
            let fl = parse_free(params);
            let ds = parse_double(params);
            let info_hash = param_first(params, "info_hash").and_then(InfoHash::from_slice);
            let mut found = false;
            if let Some(info_hash) = info_hash {
                let mut torrents = tracker.torrents.lock();
                if let Some(torrent) = torrents.get_mut(&info_hash) {
                    torrent.free_torrent = fl;
                    torrent.double_torrent = ds;
                    debug!("Updated torrent {} to FL {:?}, DS {:?}", torrent.id, fl, ds);
                    found = true;
                }
            }
            if !found {
                error!("Failed to find torrent to update to FL {:?}, DS {:?}", fl, ds);
                response_code = 500;
            }
        }
        "update_torrents" => {
            // Each info hash is exactly 20 bytes long.
            let fl = parse_free(params);
            let ds = parse_double(params);
            let info_hashes = param_first(params, "info_hashes").unwrap_or(&[]).to_vec();
            let mut torrents = tracker.torrents.lock();
            for chunk in info_hashes.chunks(20) {
                let info_hash = match InfoHash::from_slice(chunk) {
                    Some(info_hash) => info_hash,
                    None => continue,
                };
                match torrents.get_mut(&info_hash) {
                    Some(torrent) => {
                        torrent.free_torrent = fl;
                        torrent.double_torrent = ds;
                        debug!("Updated torrent {} to FL {:?}, DS {:?}", torrent.id, fl, ds);
                    }
                    None => {
                        error!("Failed to find torrent {} to update to FL {:?}, DS {:?}", info_hash, fl, ds);
                        response_code = 500;
                    }
                }
            }
        }
        "add_token_fl" | "add_token_ds" => {
            let info_hash = param_first(params, "info_hash").and_then(InfoHash::from_slice);
            let userid = param_i64(params, "userid") as u32;
            let time = param_i64(params, "time");
            let mut found = false;
            if let Some(info_hash) = info_hash {
                let mut torrents = tracker.torrents.lock();
                if let Some(torrent) = torrents.get_mut(&info_hash) {
                    let slots = torrent.tokened_users.entry(userid).or_insert_with(Slots::default);
                    if action == "add_token_fl" {
                        slots.free_leech = time;
                    } else {
                        slots.double_seed = time;
                    }
                    found = true;
                }
            }
            if !found {
                error!("Failed to find torrent to add a token for user {}", userid);
                response_code = 500;
            }
        }
        "remove_tokens" => {
            let info_hash = param_first(params, "info_hash").and_then(InfoHash::from_slice);
            let userid = param_i64(params, "userid") as u32;
            let mut found = false;
            if let Some(info_hash) = info_hash {
                let mut torrents = tracker.torrents.lock();
                if let Some(torrent) = torrents.get_mut(&info_hash) {
                    torrent.tokened_users.remove(&userid);
                    found = true;
                }
            }
            if !found {
                error!("Failed to find torrent to remove tokens for user {}", userid);
                response_code = 500;
            }
        }
        "delete_torrent" => {
            let info_hash_bytes = param_first(params, "info_hash").unwrap_or(&[]).to_vec();
            let info_hash = InfoHash::from_slice(info_hash_bytes.as_slice());
            let reason = param_string(params, "reason")
                .and_then(|value| value.parse::<i32>().ok())
                .unwrap_or(-1);
            let mut removed = None;
            if let Some(info_hash) = info_hash {
                let mut torrents = tracker.torrents.lock();
                removed = torrents.remove(&info_hash).map(|torrent| (info_hash, torrent));
            }
            match removed {
                Some((info_hash, torrent)) => {
                    debug!("Deleting torrent {} for the reason '{}'", torrent.id, get_del_reason(reason));
                    tracker.stats.leechers.fetch_sub(torrent.leechers.len() as i64, Ordering::Relaxed);
                    tracker.stats.seeders.fetch_sub(torrent.seeders.len() as i64, Ordering::Relaxed);
                    for peer in torrent.leechers.values() {
                        peer.user.decr_leeching();
                    }
                    for peer in torrent.seeders.values() {
                        peer.user.decr_seeding();
                    }
                    let mut del_reasons = tracker.del_reasons.lock();
                    del_reasons.insert(info_hash, DelMessage { reason, time: Utc::now().timestamp() });
                }
                None => {
                    error!("Failed to find torrent {} to delete", hex::encode(info_hash_bytes));
                    response_code = 500;
                }
            }
        }
        "add_user" => {
            let passkey = param_string(params, "passkey").unwrap_or_default();
            let userid = param_i64(params, "id") as u32;
            let mut users = tracker.users.lock();
            match users.get(&passkey) {
                None => {
                    let protect_ip = param_string(params, "visible").as_deref() == Some("0");
                    let user = Arc::new(User::new(userid, true, protect_ip, false, 0, 0));
                    users.insert(passkey.clone(), user);
                    debug!("Added user {} with id {}", passkey, userid);
                }
                Some(user) => {
                    error!("Tried to add already known user {} with id {}", passkey, userid);
                    user.set_deleted(false);
                    response_code = 500;
                }
            }
        }
        "remove_user" => {
            let passkey = param_string(params, "passkey").unwrap_or_default();
            let mut users = tracker.users.lock();
            if let Some(user) = users.remove(&passkey) {
                debug!("Removed user {} with id {}", passkey, user.get_id());
                user.set_deleted(true);
            }
        }
        "remove_users" => {
            // Each passkey is exactly 32 characters long.
            let passkeys = param_string(params, "passkeys").unwrap_or_default();
            let mut users = tracker.users.lock();
            let mut pos = 0;
            while pos + 32 <= passkeys.len() {
                let passkey = &passkeys[pos..pos + 32];
                if let Some(user) = users.remove(passkey) {
                    debug!("Removed user {}", passkey);
                    user.set_deleted(true);
                }
                pos += 32;
            }
        }
        "update_user" => {
            let passkey = param_string(params, "passkey").unwrap_or_default();
            let users = tracker.users.lock();
            match users.get(&passkey) {
                None => {
                    error!("No user with passkey {} found when attempting to change leeching status!", passkey);
                    response_code = 500;
                }
                Some(user) => {
                    if let Some(can_leech) = param_string(params, "can_leech") {
                        user.set_leech_status(can_leech != "0");
                    }
                    if let Some(visible) = param_string(params, "visible") {
                        user.set_protected(visible == "0");
                    }
                    if let Some(track_ipv6) = param_string(params, "track_ipv6") {
                        user.set_track_ipv6(track_ipv6 != "0");
                    }
                    debug!(
                        "Updated user {} leech: {} | protect: {} | ipv6: {}",
                        passkey,
                        user.can_leech(),
                        user.is_protected(),
                        user.track_ipv6()
                    );
                }
            }
        }
        "set_personal_freeleech" => {
            let passkey = param_string(params, "passkey").unwrap_or_default();
            let pfl = param_i64(params, "time");
            let users = tracker.users.lock();
            match users.get(&passkey) {
                None => {
                    error!("No user with passkey {} found when attempting set personal freeleech!", passkey);
                    response_code = 500;
                }
                Some(user) => {
                    user.set_personal_freeleech(pfl);
                    debug!("Personal freeleech set to user {} until time: {}", passkey, pfl);
                }
            }
        }
        "set_personal_doubleseed" => {
            let passkey = param_string(params, "passkey").unwrap_or_default();
            let pds = param_i64(params, "time");
            let users = tracker.users.lock();
            match users.get(&passkey) {
                None => {
                    error!("No user with passkey {} found when attempting set personal doubleseed!", passkey);
                    response_code = 500;
                }
                Some(user) => {
                    user.set_personal_doubleseed(pds);
                    debug!("Personal doubleseed set to user {} until time: {}", passkey, pds);
                }
            }
        }
        "add_blacklist" => {
            let peer_id = param_first(params, "peer_id").unwrap_or(&[]).to_vec();
            let mut blacklist = tracker.blacklist.lock();
            debug!("Blacklisted {}", String::from_utf8_lossy(peer_id.as_slice()));
            blacklist.push(peer_id);
        }
        "remove_blacklist" => {
            let peer_id = param_first(params, "peer_id").unwrap_or(&[]).to_vec();
            let mut blacklist = tracker.blacklist.lock();
            if let Some(pos) = blacklist.iter().position(|entry| *entry == peer_id) {
                blacklist.remove(pos);
            }
            debug!("De-blacklisted {}", String::from_utf8_lossy(peer_id.as_slice()));
        }
        "edit_blacklist" => {
            let new_peer_id = param_first(params, "new_peer_id").unwrap_or(&[]).to_vec();
            let old_peer_id = param_first(params, "old_peer_id").unwrap_or(&[]).to_vec();
            let mut blacklist = tracker.blacklist.lock();
            if let Some(pos) = blacklist.iter().position(|entry| *entry == old_peer_id) {
                blacklist.remove(pos);
            }
            debug!(
                "Edited blacklist item from {} to {}",
                String::from_utf8_lossy(old_peer_id.as_slice()),
                String::from_utf8_lossy(new_peer_id.as_slice())
            );
            blacklist.push(new_peer_id);
        }
        "update_announce_interval" => {
            let interval = param_i64(params, "new_announce_interval");
            if interval > 0 {
                tracker.announce_interval.store(interval as u32, Ordering::Relaxed);
            }
            debug!("Edited announce interval to {}", tracker.announce_interval.load(Ordering::Relaxed));
        }
        "info_torrent" => {
            let info_hash = param_first(params, "info_hash").and_then(InfoHash::from_slice);
            match info_hash {
                Some(info_hash) => {
                    debug!("Info for torrent '{}'", info_hash);
                    let torrents = tracker.torrents.lock();
                    match torrents.get(&info_hash) {
                        Some(torrent) => {
                            debug!("Torrent {}, freetorrent = {:?}", torrent.id, torrent.free_torrent);
                        }
                        None => {
                            error!("Failed to find torrent {}", info_hash);
                        }
                    }
                }
                None => {
                    error!("Info torrent called with an invalid info hash");
                }
            }
        }
        _ => {
            error!("Unknown command: {}", action);
            response_code = 500;
        }
    }

    response_code
}

fn parse_free(params: &QueryMap) -> FreeTorrent {
    match param_string(params, "freetorrent").as_deref() {
        Some("0") => FreeTorrent::Normal,
        Some("1") => FreeTorrent::Free,
        _ => FreeTorrent::Neutral,
    }
}

fn parse_double(params: &QueryMap) -> DoubleTorrent {
    match param_string(params, "doubletorrent").as_deref() {
        Some("1") => DoubleTorrent::Double,
        _ => DoubleTorrent::Normal,
    }
}

/// JSON status documents for the companion site's monitoring.
pub fn handle_report(tracker: &Arc<TorrentTracker>, params: &QueryMap) -> String {
    let action = param_string(params, "get").unwrap_or_default();
    let stats = &tracker.stats;
    match action.as_str() {
        "stats" => {
            let mut uptime = Utc::now().timestamp() - stats.start_time.load(Ordering::Relaxed);
            let up_d = uptime / 86400;
            uptime -= up_d * 86400;
            let up_h = uptime / 3600;
            uptime -= up_h * 3600;
            let up_m = uptime / 60;
            let up_s = uptime - up_m * 60;
            let document = serde_json::json!({
                "uptime": format!("{} days, {:02}:{:02}:{:02}", up_d, up_h, up_m, up_s),
                "connections opened": stats.opened_connections.load(Ordering::Relaxed),
                "open connections": stats.open_connections.load(Ordering::Relaxed),
                "connections/s": stats.connection_rate.load(Ordering::Relaxed),
                "requests handled": stats.requests.load(Ordering::Relaxed),
                "requests/s": stats.request_rate.load(Ordering::Relaxed),
                "successful announcements": stats.succ_announcements.load(Ordering::Relaxed),
                "failed announcements": stats.announcements.load(Ordering::Relaxed) - stats.succ_announcements.load(Ordering::Relaxed),
                "scrapes": stats.scrapes.load(Ordering::Relaxed),
                "leechers tracked": stats.leechers.load(Ordering::Relaxed),
                "seeders tracked": stats.seeders.load(Ordering::Relaxed),
                "bytes read": stats.bytes_read.load(Ordering::Relaxed),
                "bytes written": stats.bytes_written.load(Ordering::Relaxed),
                "IPv4 peers": stats.ipv4_peers.load(Ordering::Relaxed),
                "IPv6 peers": stats.ipv6_peers.load(Ordering::Relaxed),
            });
            serde_json::to_string_pretty(&document).unwrap_or_default()
        }
        "db" => {
            let document = serde_json::json!({
                "torrent_queue": stats.torrent_queue.load(Ordering::Relaxed),
                "user_queue": stats.user_queue.load(Ordering::Relaxed),
                "peer_queue": stats.peer_queue.load(Ordering::Relaxed),
                "peer_hist_queue": stats.peer_hist_queue.load(Ordering::Relaxed),
                "snatch_queue": stats.snatch_queue.load(Ordering::Relaxed),
                "token_queue": stats.token_queue.load(Ordering::Relaxed),
            });
            serde_json::to_string_pretty(&document).unwrap_or_default()
        }
        "domain" => {
            let domains = tracker.domains.lock();
            let mut document = serde_json::Map::new();
            for (name, domain) in domains.iter() {
                document.insert(name.clone(), serde_json::json!(Arc::strong_count(domain)));
            }
            serde_json::to_string_pretty(&serde_json::Value::Object(document)).unwrap_or_default()
        }
        "user" => {
            let key = param_string(params, "key").unwrap_or_default();
            if key.is_empty() {
                return String::from("Invalid action\n");
            }
            let users = tracker.users.lock();
            match users.get(&key) {
                Some(user) => {
                    let document = serde_json::json!({
                        "forbidden": !user.can_leech(),
                        "protected": user.is_protected(),
                        "track ipv6": user.track_ipv6(),
                        "personal freeleech": user.pfl(),
                        "personal doubleseed": user.pds(),
                        "leeching": user.get_leeching(),
                        "seeding": user.get_seeding(),
                    });
                    serde_json::to_string_pretty(&document).unwrap_or_default()
                }
                None => String::new(),
            }
        }
        _ => String::from("Invalid action\n"),
    }
}
