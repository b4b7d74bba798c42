//! Two-peer sync scenarios: newest-wins convergence, authentication,
//! idempotence, and discovery dedup, all over loopback.

use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::time::{Duration, Instant};

use localpdub_core::sync::{
    AuthMethod, DiscoveryConfig, DiscoverySession, SyncEngine, SyncStrategy,
};
use localpdub_core::types::{Peer, Record, VaultDocument};
use localpdub_core::vault::RecordStore;
use localpdub_core::Session;

fn record(id: &str, title: &str, modified: i64) -> Record {
    let mut record = Record::new(title);
    record.id = id.to_string();
    record.created_at = modified;
    record.modified = modified;
    record
}

fn store_with(records: Vec<Record>) -> Arc<RecordStore> {
    let store = Arc::new(RecordStore::new());
    store.load(VaultDocument::empty());
    store.replace_all(records).unwrap();
    store
}

fn loopback_peer(name: &str, port: u16) -> Peer {
    Peer {
        id: format!("{name}-id"),
        name: name.to_string(),
        ip: "127.0.0.1".to_string(),
        port,
        vault_id: "test-vault".to_string(),
        last_modified: String::new(),
        public_key: None,
    }
}

fn titles(store: &RecordStore) -> Vec<String> {
    store
        .list()
        .unwrap()
        .into_iter()
        .map(|r| r.title)
        .collect()
}

/// Polls `predicate` until it holds or the deadline passes.
fn wait_for(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    predicate()
}

#[test]
fn test_newest_wins_convergence_and_idempotence() {
    let store_a = store_with(vec![record("r1", "a1", 100)]);
    let store_b = store_with(vec![record("r1", "b1", 200), record("r2", "b2", 50)]);

    let engine_a = SyncEngine::new("dev-a", "test-vault", Arc::clone(&store_a));
    let engine_b = SyncEngine::new("dev-b", "test-vault", Arc::clone(&store_b));
    let port = engine_b.start_responder(0).unwrap();

    let result = engine_a.sync_with_peers(
        &[loopback_peer("b", port)],
        SyncStrategy::NewestWins,
        AuthMethod::None,
        None,
    );

    // A's only record is strictly older than B's copy, so nothing
    // leaves A; B's newer r1 and missing r2 both arrive.
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.entries_sent, 0);
    assert_eq!(result.entries_received, 2);
    assert_eq!(result.conflicts_resolved, 1);

    assert_eq!(titles(&store_a), ["b1", "b2"]);
    assert_eq!(titles(&store_b), ["b1", "b2"]);

    // Scenario 5: an immediate second run transfers nothing.
    let again = engine_a.sync_with_peers(
        &[loopback_peer("b", port)],
        SyncStrategy::NewestWins,
        AuthMethod::None,
        None,
    );
    assert!(again.success);
    assert_eq!(again.entries_sent, 0);
    assert_eq!(again.entries_received, 0);
    assert_eq!(again.conflicts_resolved, 0);

    engine_b.stop_responder();
}

#[test]
fn test_bidirectional_transfer() {
    let store_a = store_with(vec![record("ra", "only-on-a", 100)]);
    let store_b = store_with(vec![record("rb", "only-on-b", 100)]);

    let engine_a = SyncEngine::new("dev-a", "test-vault", Arc::clone(&store_a));
    let engine_b = SyncEngine::new("dev-b", "test-vault", Arc::clone(&store_b));
    let port = engine_b.start_responder(0).unwrap();

    let result = engine_a.sync_with_peers(
        &[loopback_peer("b", port)],
        SyncStrategy::NewestWins,
        AuthMethod::None,
        None,
    );
    assert!(result.success);
    assert_eq!(result.entries_sent, 1);
    assert_eq!(result.entries_received, 1);
    assert_eq!(result.conflicts_resolved, 0);

    assert_eq!(store_a.entry_count().unwrap(), 2);
    // The responder applies the initiator's entries as its last step;
    // give it a moment to finish after the initiator returns.
    assert!(wait_for(Duration::from_secs(5), || {
        store_b.entry_count().unwrap() == 2
    }));

    engine_b.stop_responder();
}

#[test]
fn test_wrong_passphrase_transfers_nothing() {
    let store_a = store_with(vec![record("ra", "secret-a", 100)]);
    let store_b = store_with(vec![record("rb", "secret-b", 100)]);

    let engine_a = SyncEngine::new("dev-a", "test-vault", Arc::clone(&store_a));
    let engine_b = SyncEngine::new("dev-b", "test-vault", Arc::clone(&store_b));
    engine_b
        .configure(SyncStrategy::NewestWins, AuthMethod::Passphrase, Some("open-sesame"))
        .unwrap();
    let port = engine_b.start_responder(0).unwrap();

    let result = engine_a.sync_with_peers(
        &[loopback_peer("b", port)],
        SyncStrategy::NewestWins,
        AuthMethod::Passphrase,
        Some("oops"),
    );

    assert!(!result.success);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("authentication"), "{:?}", result.errors);
    assert_eq!(result.entries_sent, 0);
    assert_eq!(result.entries_received, 0);

    // Neither store changed.
    assert_eq!(titles(&store_a), ["secret-a"]);
    assert_eq!(titles(&store_b), ["secret-b"]);

    engine_b.stop_responder();
}

#[test]
fn test_matching_passphrase_syncs() {
    let store_a = store_with(vec![record("ra", "from-a", 100)]);
    let store_b = store_with(Vec::new());

    let engine_a = SyncEngine::new("dev-a", "test-vault", Arc::clone(&store_a));
    let engine_b = SyncEngine::new("dev-b", "test-vault", Arc::clone(&store_b));
    engine_b
        .configure(SyncStrategy::NewestWins, AuthMethod::Passphrase, Some("open-sesame"))
        .unwrap();
    let port = engine_b.start_responder(0).unwrap();

    let result = engine_a.sync_with_peers(
        &[loopback_peer("b", port)],
        SyncStrategy::NewestWins,
        AuthMethod::Passphrase,
        Some("open-sesame"),
    );

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.entries_sent, 1);
    assert!(wait_for(Duration::from_secs(5), || {
        store_b.entry_count().unwrap() == 1
    }));

    engine_b.stop_responder();
}

#[test]
fn test_failed_peer_does_not_abort_remaining_peers() {
    let store_a = store_with(vec![record("ra", "from-a", 100)]);
    let store_b = store_with(Vec::new());

    let engine_a = SyncEngine::new("dev-a", "test-vault", Arc::clone(&store_a));
    let engine_b = SyncEngine::new("dev-b", "test-vault", Arc::clone(&store_b));
    let port = engine_b.start_responder(0).unwrap();

    // First peer is not listening; second is fine.
    let dead_port = {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    };
    let result = engine_a.sync_with_peers(
        &[loopback_peer("dead", dead_port), loopback_peer("b", port)],
        SyncStrategy::NewestWins,
        AuthMethod::None,
        None,
    );

    assert!(!result.success);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("dead"));
    assert_eq!(result.entries_sent, 1);
    assert!(wait_for(Duration::from_secs(5), || {
        store_b.entry_count().unwrap() == 1
    }));

    engine_b.stop_responder();
}

#[test]
fn test_session_sync_persists_received_records() {
    let dir = tempfile::tempdir().unwrap();
    let path_a = dir.path().join("a.lpd");
    let path_b = dir.path().join("b.lpd");

    let mut session_a = Session::create(&path_a, "pw-a").unwrap();
    let mut session_b = Session::create(&path_b, "pw-b").unwrap();
    session_a.store().add(Record::new("from-a")).unwrap();
    session_b.store().add(Record::new("from-b")).unwrap();

    // Reserve a port for B's responder.
    let port = {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    };
    session_b.set_sync_port(port);
    // Syncing with no peers just brings the responder up.
    let idle = session_b
        .sync(&[], SyncStrategy::NewestWins, AuthMethod::None, None)
        .unwrap();
    assert!(idle.success);

    session_a.set_sync_port(0);
    let result = session_a
        .sync(
            &[loopback_peer("b", port)],
            SyncStrategy::NewestWins,
            AuthMethod::None,
            None,
        )
        .unwrap();
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.entries_received, 1);

    // A persisted the merged state: a fresh open sees both records.
    session_a.close();
    let reopened = Session::open(&path_a, "pw-a").unwrap();
    let mut reopened_titles = titles(reopened.store());
    reopened_titles.sort();
    assert_eq!(reopened_titles, ["from-a", "from-b"]);

    // B's responder merged A's record into B's live store.
    assert!(wait_for(Duration::from_secs(5), || {
        session_b.store().entry_count().unwrap() == 2
    }));
}

#[test]
fn test_discovery_finds_and_dedups_peers() {
    let make_config = |name: &str| {
        let mut config = DiscoveryConfig::new(name, "test-vault");
        // Loopback unicast stands in for LAN broadcast so the test
        // does not depend on the host's broadcast permissions.
        config.broadcast_addr = Ipv4Addr::LOCALHOST;
        config.primary_port = 47731;
        config.fallback_end = 47739;
        config.timeout = Duration::from_secs(30);
        config
    };

    let mut session_a = DiscoverySession::start(make_config("device-a")).unwrap();
    let mut session_b = DiscoverySession::start(make_config("device-b")).unwrap();
    assert_ne!(session_a.bound_port(), session_b.bound_port());

    // A hears B's announce directly; B learns A from the response.
    assert!(wait_for(Duration::from_secs(10), || {
        session_a.peers().len() == 1 && session_b.peers().len() == 1
    }));

    let seen_by_a = &session_a.peers()[0];
    assert_eq!(seen_by_a.id, session_b.device_id());
    assert_eq!(seen_by_a.name, "device-b");

    // Further announces refresh in place, never duplicate.
    std::thread::sleep(Duration::from_millis(2500));
    assert_eq!(session_a.peers().len(), 1);
    assert_eq!(session_b.peers().len(), 1);

    session_a.stop();
    session_b.stop();
    assert!(session_a.peers().is_empty());
}
