mod common;

use common::{build_tracker, build_tracker_with};
use radiance::config::Configuration;
use radiance::tracker::PeerId;

#[tokio::test]
async fn test_user_flush_builds_upsert() {
    let tracker = build_tracker();
    let database = tracker.database.clone();
    database.record_user("(1,100,200,100,200)");
    database.record_user("(2,10,20,10,20)");
    database.flush_users();

    let queue = database.user_queue.lock();
    assert_eq!(queue.len(), 1);
    assert_eq!(
        queue.front().unwrap(),
        "INSERT INTO users_main (ID, Uploaded, Downloaded, UploadedDaily, DownloadedDaily) \
        VALUES (1,100,200,100,200),(2,10,20,10,20) \
        ON DUPLICATE KEY UPDATE Uploaded = Uploaded + VALUES(Uploaded), \
        Downloaded = Downloaded + VALUES(Downloaded), \
        UploadedDaily = UploadedDaily + VALUES(UploadedDaily), \
        DownloadedDaily = DownloadedDaily + VALUES(DownloadedDaily)"
    );
    drop(queue);
    assert!(database.update_user_buffer.lock().is_empty());
}

#[tokio::test]
async fn test_torrent_flush_appends_cleanup_delete() {
    let tracker = build_tracker();
    let database = tracker.database.clone();
    database.record_torrent("(100,1,2,0,800)");
    database.flush_torrents();

    let queue = database.torrent_queue.lock();
    assert_eq!(queue.len(), 2);
    assert_eq!(
        queue.front().unwrap(),
        "INSERT INTO torrents (ID,Seeders,Leechers,Snatched,Balance) VALUES (100,1,2,0,800) \
        ON DUPLICATE KEY UPDATE Seeders=VALUES(Seeders), Leechers=VALUES(Leechers), \
        Snatched=Snatched+VALUES(Snatched), Balance=VALUES(Balance), \
        last_action = IF(VALUES(Seeders) > 0, NOW(), last_action)"
    );
    assert_eq!(queue.get(1).unwrap(), "DELETE FROM torrents WHERE info_hash = ''");
}

#[tokio::test]
async fn test_snatch_and_token_flush_templates() {
    let tracker = build_tracker();
    let database = tracker.database.clone();
    database.record_snatch("(1,100,1700000000", &[93, 184, 216, 34], &[]);
    database.flush_snatches();
    assert_eq!(
        tracker.database.snatch_queue.lock().front().unwrap(),
        "INSERT INTO xbt_snatched (uid, fid, tstamp, ipv4, ipv6) VALUES (1,100,1700000000,X'5db8d822','')"
    );

    database.record_token("(42,55,10485760,0)");
    database.flush_tokens();
    assert_eq!(
        tracker.database.token_queue.lock().front().unwrap(),
        "INSERT INTO users_freeleeches (UserID, TorrentID, Downloaded, Uploaded) VALUES (42,55,10485760,0) \
        ON DUPLICATE KEY UPDATE Downloaded = Downloaded + VALUES(Downloaded), \
        Uploaded = Uploaded + VALUES(Uploaded)"
    );
}

#[tokio::test]
async fn test_peer_record_quoting() {
    let tracker = build_tracker();
    let database = tracker.database.clone();
    let peer_id = PeerId([0x41; 20]);
    database.record_peer_heavy(
        "(1,100,1,1024,2048,0,0,512,0,30,1700000000,1700000030,3,",
        &[93, 184, 216, 34],
        &[],
        6881,
        &peer_id,
        "deluge 2.1.1",
    );
    let expected = format!(
        "(1,100,1,1024,2048,0,0,512,0,30,1700000000,1700000030,3,X'5db8d822','',6881,X'{}','deluge 2.1.1')",
        "41".repeat(20)
    );
    assert_eq!(database.update_peer_heavy_buffer.lock().as_str(), expected);

    database.record_peer_light("(1,100,30,1700000030,3,", &peer_id);
    let expected = format!("(1,100,30,1700000030,3,X'{}')", "41".repeat(20));
    assert_eq!(database.update_peer_light_buffer.lock().as_str(), expected);
}

#[tokio::test]
async fn test_peer_queue_backpressure_drops_oldest() {
    let tracker = build_tracker();
    let database = tracker.database.clone();
    {
        let mut queue = database.peer_queue.lock();
        for i in 0..1000 {
            queue.push_back(format!("statement-{}", i));
        }
    }
    database.record_peer_heavy("(1,100,1,0,0,0,0,0,0,0,0,0,1,", &[1, 2, 3, 4], &[], 6881, &PeerId([0x41; 20]), "ua");
    database.record_peer_light("(1,100,0,0,1,", &PeerId([0x42; 20]));
    database.flush_peers();

    let queue = database.peer_queue.lock();
    assert_eq!(queue.len(), 1000);
    assert_eq!(queue.front().unwrap(), "statement-2");
}

#[tokio::test]
async fn test_other_queues_never_drop() {
    let tracker = build_tracker();
    let database = tracker.database.clone();
    {
        let mut queue = database.snatch_queue.lock();
        for i in 0..1500 {
            queue.push_back(format!("statement-{}", i));
        }
    }
    database.record_snatch("(1,100,1700000000", &[], &[]);
    database.flush_snatches();
    let queue = database.snatch_queue.lock();
    assert_eq!(queue.len(), 1501);
    assert_eq!(queue.front().unwrap(), "statement-0");
}

#[tokio::test]
async fn test_readonly_discards_buffers() {
    let mut config = Configuration::default();
    config.tracker.readonly = true;
    let tracker = build_tracker_with(config);
    let database = tracker.database.clone();

    database.record_user("(1,100,200,100,200)");
    database.record_torrent("(100,1,2,0,800)");
    database.record_snatch("(1,100,1700000000", &[], &[]);
    database.flush();

    assert!(database.all_clear());
    assert!(database.update_user_buffer.lock().is_empty());
    assert!(database.update_torrent_buffer.lock().is_empty());
    assert!(database.update_snatch_buffer.lock().is_empty());
}

#[tokio::test]
async fn test_all_clear_tracks_every_queue() {
    let tracker = build_tracker();
    let database = tracker.database.clone();
    assert!(database.all_clear());
    database.peer_hist_queue.lock().push_back(String::from("statement"));
    assert!(!database.all_clear());
    database.peer_hist_queue.lock().pop_front();
    assert!(database.all_clear());
}

#[tokio::test]
async fn test_empty_buffers_queue_nothing() {
    let tracker = build_tracker();
    let database = tracker.database.clone();
    database.flush();
    assert!(database.all_clear());
}
