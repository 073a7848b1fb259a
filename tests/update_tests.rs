mod common;

use std::sync::atomic::Ordering;
use common::{add_torrent, add_user, announce, build_tracker, query_map, v4};
use radiance::handlers::{handle_report, handle_update};
use radiance::tracker::{get_del_reason, DoubleTorrent, FreeTorrent, InfoHash};

const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaa";
const PASSKEY_1: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const PASSKEY_2: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const PEER_1: &str = "-TR2940-aaaaaaaaaaa1";

fn hash_a() -> InfoHash {
    InfoHash(*b"aaaaaaaaaaaaaaaaaaaa")
}

#[tokio::test]
async fn test_missing_action_fails() {
    let tracker = build_tracker();
    assert_eq!(handle_update(&tracker, &query_map("")), 500);
    assert_eq!(handle_update(&tracker, &query_map("action=frobnicate")), 500);
}

#[tokio::test]
async fn test_add_and_update_torrent() {
    let tracker = build_tracker();
    let code = handle_update(
        &tracker,
        &query_map(format!("action=add_torrent&info_hash={}&id=123&freetorrent=1&doubletorrent=0", HASH_A).as_str()),
    );
    assert_eq!(code, 204);
    {
        let torrents = tracker.torrents.lock();
        let torrent = torrents.get(&hash_a()).unwrap();
        assert_eq!(torrent.id, 123);
        assert_eq!(torrent.free_torrent, FreeTorrent::Free);
        assert_eq!(torrent.double_torrent, DoubleTorrent::Normal);
    }

    let code = handle_update(
        &tracker,
        &query_map(format!("action=update_torrent&info_hash={}&freetorrent=0&doubletorrent=1", HASH_A).as_str()),
    );
    assert_eq!(code, 204);
    {
        let torrents = tracker.torrents.lock();
        let torrent = torrents.get(&hash_a()).unwrap();
        assert_eq!(torrent.free_torrent, FreeTorrent::Normal);
        assert_eq!(torrent.double_torrent, DoubleTorrent::Double);
    }

    let code = handle_update(
        &tracker,
        &query_map("action=update_torrent&info_hash=bbbbbbbbbbbbbbbbbbbb&freetorrent=0&doubletorrent=0"),
    );
    assert_eq!(code, 500);
}

#[tokio::test]
async fn test_update_torrents_bulk() {
    let tracker = build_tracker();
    add_torrent(&tracker, &hash_a(), 1);
    add_torrent(&tracker, &InfoHash(*b"bbbbbbbbbbbbbbbbbbbb"), 2);

    let code = handle_update(
        &tracker,
        &query_map("action=update_torrents&info_hashes=aaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbbbbbb&freetorrent=2&doubletorrent=1"),
    );
    assert_eq!(code, 204);
    let torrents = tracker.torrents.lock();
    for torrent in torrents.values() {
        assert_eq!(torrent.free_torrent, FreeTorrent::Neutral);
        assert_eq!(torrent.double_torrent, DoubleTorrent::Double);
    }
}

#[tokio::test]
async fn test_tokens_lifecycle() {
    let tracker = build_tracker();
    add_torrent(&tracker, &hash_a(), 55);
    let future = chrono::Utc::now().timestamp() + 3600;

    let code = handle_update(
        &tracker,
        &query_map(format!("action=add_token_fl&info_hash={}&userid=42&time={}", HASH_A, future).as_str()),
    );
    assert_eq!(code, 204);
    let code = handle_update(
        &tracker,
        &query_map(format!("action=add_token_ds&info_hash={}&userid=42&time={}", HASH_A, future).as_str()),
    );
    assert_eq!(code, 204);
    {
        let torrents = tracker.torrents.lock();
        let slots = torrents.get(&hash_a()).unwrap().tokened_users.get(&42).copied().unwrap();
        assert_eq!(slots.free_leech, future);
        assert_eq!(slots.double_seed, future);
    }

    let code = handle_update(
        &tracker,
        &query_map(format!("action=remove_tokens&info_hash={}&userid=42", HASH_A).as_str()),
    );
    assert_eq!(code, 204);
    assert!(tracker.torrents.lock().get(&hash_a()).unwrap().tokened_users.is_empty());

    let code = handle_update(&tracker, &query_map("action=add_token_fl&info_hash=cccccccccccccccccccc&userid=1&time=1"));
    assert_eq!(code, 500);
}

#[tokio::test]
async fn test_delete_torrent_records_reason() {
    let tracker = build_tracker();
    let user = add_user(&tracker, PASSKEY_1, 1);
    add_torrent(&tracker, &hash_a(), 100);
    let query = format!("info_hash={}&peer_id={}&port=6881&uploaded=0&downloaded=0&left=1024&compact=1", HASH_A, PEER_1);
    announce(&tracker, PASSKEY_1, query.as_str(), v4("93.184.216.34")).unwrap();

    let code = handle_update(
        &tracker,
        &query_map(format!("action=delete_torrent&info_hash={}&reason=1", HASH_A).as_str()),
    );
    assert_eq!(code, 204);

    assert!(tracker.torrents.lock().get(&hash_a()).is_none());
    assert_eq!(tracker.stats.leechers.load(Ordering::Relaxed), 0);
    assert_eq!(user.get_leeching(), 0);

    // The next announce for this hash is answered with the reason.
    let message = tracker.del_reason_for(&hash_a()).unwrap();
    assert_eq!(message.reason, 1);
    assert_eq!(get_del_reason(message.reason), "Trump");

    let code = handle_update(
        &tracker,
        &query_map(format!("action=delete_torrent&info_hash={}&reason=1", HASH_A).as_str()),
    );
    assert_eq!(code, 500);
}

#[tokio::test]
async fn test_user_lifecycle() {
    let tracker = build_tracker();

    let code = handle_update(&tracker, &query_map(format!("action=add_user&passkey={}&id=9&visible=1", PASSKEY_1).as_str()));
    assert_eq!(code, 204);
    let user = tracker.find_user(PASSKEY_1).unwrap();
    assert_eq!(user.get_id(), 9);
    assert!(user.can_leech());
    assert!(!user.is_protected());

    // Adding the same passkey again resurrects the user but signals misuse.
    let code = handle_update(&tracker, &query_map(format!("action=add_user&passkey={}&id=9", PASSKEY_1).as_str()));
    assert_eq!(code, 500);

    let code = handle_update(
        &tracker,
        &query_map(format!("action=update_user&passkey={}&can_leech=0&visible=0&track_ipv6=1", PASSKEY_1).as_str()),
    );
    assert_eq!(code, 204);
    assert!(!user.can_leech());
    assert!(user.is_protected());
    assert!(user.track_ipv6());

    let code = handle_update(&tracker, &query_map(format!("action=set_personal_freeleech&passkey={}&time=12345", PASSKEY_1).as_str()));
    assert_eq!(code, 204);
    assert_eq!(user.pfl(), 12345);
    let code = handle_update(&tracker, &query_map(format!("action=set_personal_doubleseed&passkey={}&time=54321", PASSKEY_1).as_str()));
    assert_eq!(code, 204);
    assert_eq!(user.pds(), 54321);

    let code = handle_update(
        &tracker,
        &query_map(format!("action=change_passkey&oldpasskey={}&newpasskey={}", PASSKEY_1, PASSKEY_2).as_str()),
    );
    assert_eq!(code, 204);
    assert!(tracker.find_user(PASSKEY_1).is_none());
    assert_eq!(tracker.find_user(PASSKEY_2).unwrap().get_id(), 9);

    let code = handle_update(&tracker, &query_map(format!("action=remove_user&passkey={}", PASSKEY_2).as_str()));
    assert_eq!(code, 204);
    assert!(tracker.find_user(PASSKEY_2).is_none());
    assert!(user.is_deleted());
}

#[tokio::test]
async fn test_remove_users_bulk() {
    let tracker = build_tracker();
    add_user(&tracker, PASSKEY_1, 1);
    add_user(&tracker, PASSKEY_2, 2);

    let code = handle_update(
        &tracker,
        &query_map(format!("action=remove_users&passkeys={}{}", PASSKEY_1, PASSKEY_2).as_str()),
    );
    assert_eq!(code, 204);
    assert!(tracker.users.lock().is_empty());
}

#[tokio::test]
async fn test_blacklist_edits() {
    let tracker = build_tracker();
    assert_eq!(handle_update(&tracker, &query_map("action=add_blacklist&peer_id=-TR")), 204);
    assert_eq!(tracker.blacklist.lock().len(), 1);

    assert_eq!(
        handle_update(&tracker, &query_map("action=edit_blacklist&old_peer_id=-TR&new_peer_id=-DE")),
        204
    );
    {
        let blacklist = tracker.blacklist.lock();
        assert_eq!(blacklist.len(), 1);
        assert_eq!(blacklist[0], b"-DE".to_vec());
    }

    assert_eq!(handle_update(&tracker, &query_map("action=remove_blacklist&peer_id=-DE")), 204);
    assert!(tracker.blacklist.lock().is_empty());
}

#[tokio::test]
async fn test_update_announce_interval_and_options() {
    let tracker = build_tracker();
    assert_eq!(
        handle_update(&tracker, &query_map("action=update_announce_interval&new_announce_interval=900")),
        204
    );
    assert_eq!(tracker.announce_interval.load(Ordering::Relaxed), 900);

    assert_eq!(
        handle_update(&tracker, &query_map("action=options&set=SitewideFreeleechMode&value=perma")),
        204
    );
    assert_eq!(tracker.options.get_str("SitewideFreeleechMode"), "perma");
}

#[tokio::test]
async fn test_report_documents() {
    let tracker = build_tracker();
    add_user(&tracker, PASSKEY_1, 1);

    let body = handle_report(&tracker, &query_map("get=stats"));
    let document: serde_json::Value = serde_json::from_str(body.as_str()).unwrap();
    assert!(document.get("uptime").is_some());
    assert_eq!(document.get("seeders tracked").unwrap(), 0);

    let body = handle_report(&tracker, &query_map("get=db"));
    let document: serde_json::Value = serde_json::from_str(body.as_str()).unwrap();
    assert_eq!(document.get("peer_queue").unwrap(), 0);

    let body = handle_report(&tracker, &query_map(format!("get=user&key={}", PASSKEY_1).as_str()));
    let document: serde_json::Value = serde_json::from_str(body.as_str()).unwrap();
    assert_eq!(document.get("forbidden").unwrap(), false);

    assert_eq!(handle_report(&tracker, &query_map("get=bogus")), "Invalid action\n");
}
