mod common;

use std::sync::Arc;
use common::{add_torrent, build_tracker};
use radiance::handlers::handle_scrape;
use radiance::tracker::{Domain, InfoHash, Peer, User};

fn hash_a() -> InfoHash {
    InfoHash(*b"aaaaaaaaaaaaaaaaaaaa")
}

fn dummy_peer(left: i64) -> Peer {
    let user = Arc::new(User::new(1, true, false, false, 0, 0));
    let domain = Arc::new(Domain { name: String::from("tracker.example.org") });
    let mut peer = Peer::new(user, domain);
    peer.left = left;
    peer
}

#[tokio::test]
async fn test_scrape_layout() {
    let tracker = build_tracker();
    add_torrent(&tracker, &hash_a(), 100);
    {
        let mut torrents = tracker.torrents.lock();
        let torrent = torrents.get_mut(&hash_a()).unwrap();
        torrent.completed = 3;
        torrent.paused = 1;
        torrent.seeders.insert(b"s1".to_vec(), dummy_peer(0));
        torrent.leechers.insert(b"l1".to_vec(), dummy_peer(512));
        torrent.leechers.insert(b"l2".to_vec(), dummy_peer(512));
    }

    let body = handle_scrape(&tracker, &[b"aaaaaaaaaaaaaaaaaaaa".to_vec()]);
    assert_eq!(
        body,
        b"d5:filesd20:aaaaaaaaaaaaaaaaaaaad8:completei1e10:downloadedi3e10:incompletei2e11:downloadersi1eeee".to_vec()
    );
}

#[tokio::test]
async fn test_scrape_omits_unknown_hashes() {
    let tracker = build_tracker();
    add_torrent(&tracker, &hash_a(), 100);

    let body = handle_scrape(
        &tracker,
        &[b"cccccccccccccccccccc".to_vec(), b"aaaaaaaaaaaaaaaaaaaa".to_vec(), b"bad".to_vec()],
    );
    let text = String::from_utf8_lossy(body.as_slice()).to_string();
    assert!(text.contains("aaaaaaaaaaaaaaaaaaaa"));
    assert!(!text.contains("cccccccccccccccccccc"));
}

#[tokio::test]
async fn test_scrape_with_no_hashes_is_empty() {
    let tracker = build_tracker();
    let body = handle_scrape(&tracker, &[]);
    assert_eq!(body, b"d5:filesdee".to_vec());
}
