use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use meeting_pool::config::AccountConfig;
use meeting_pool::db::{create_test_db, Db};
use meeting_pool::pool::{AccountPool, PoolError};
use meeting_pool::queries::{accounts, lessons};

/// Build a pool over a fresh database with the given accounts and lessons
fn setup(
    account_caps: &[(&str, i64)],
    lesson_ids: &[&str],
) -> (Arc<Db>, Arc<AccountPool>, tempfile::TempDir) {
    let (db, guard) = create_test_db().unwrap();
    let db = Arc::new(db);
    let pool = Arc::new(AccountPool::new(db.clone()));

    let configs: Vec<AccountConfig> = account_caps
        .iter()
        .map(|(id, cap)| AccountConfig {
            id: id.to_string(),
            max_concurrent: *cap,
            active: None,
        })
        .collect();
    pool.import_accounts(&configs).unwrap();

    let now = chrono::Utc::now().timestamp_millis();
    for lesson_id in lesson_ids {
        let sql = lessons::insert_or_ignore(lesson_id, now, now + 3_600_000);
        db.execute(&sql).unwrap();
    }

    (db, pool, guard)
}

fn load_of(db: &Db, account_id: &str) -> i64 {
    db.query_one_optional(&accounts::select_load(account_id))
        .unwrap()
        .unwrap()
}

#[test]
fn test_capacity_is_hard_limit() {
    let (db, pool, _guard) = setup(&[("acc-a", 1), ("acc-b", 1)], &["l1", "l2", "l3"]);

    let first = pool.acquire("l1").unwrap();
    let second = pool.acquire("l2").unwrap();
    assert_ne!(first, second, "each cap-1 account can hold one lesson");

    // Third concurrent lesson has nowhere to go
    match pool.acquire("l3") {
        Err(PoolError::AllBusy) => {}
        other => panic!("expected AllBusy, got {:?}", other.map(|_| ())),
    }

    assert_eq!(load_of(&db, "acc-a"), 1);
    assert_eq!(load_of(&db, "acc-b"), 1);

    // Capacity freed by a release becomes available immediately
    pool.release(&first, "l1").unwrap();
    let third = pool.acquire("l3").unwrap();
    assert_eq!(third, first);
}

#[test]
fn test_acquire_is_idempotent_per_lesson() {
    let (db, pool, _guard) = setup(&[("acc-a", 5)], &["l1"]);

    let first = pool.acquire("l1").unwrap();
    let again = pool.acquire("l1").unwrap();
    assert_eq!(first, again);
    assert_eq!(load_of(&db, "acc-a"), 1, "duplicate acquire must not double-count");
}

#[test]
fn test_release_is_idempotent() {
    let (db, pool, _guard) = setup(&[("acc-a", 2)], &["l1"]);

    let account = pool.acquire("l1").unwrap();
    assert!(pool.release(&account, "l1").unwrap());
    assert_eq!(load_of(&db, "acc-a"), 0);

    // Second release of the same allocation is a no-op, not a double decrement
    assert!(!pool.release(&account, "l1").unwrap());
    assert_eq!(load_of(&db, "acc-a"), 0);
}

#[test]
fn test_release_for_unbound_lesson_is_noop() {
    let (db, pool, _guard) = setup(&[("acc-a", 2)], &["l1", "l2"]);

    pool.acquire("l1").unwrap();
    // l2 never acquired; releasing it must not touch the load
    assert!(!pool.release("acc-a", "l2").unwrap());
    assert_eq!(load_of(&db, "acc-a"), 1);
}

#[test]
fn test_least_loaded_account_preferred() {
    let (_db, pool, _guard) = setup(&[("acc-a", 2), ("acc-b", 2)], &["l1", "l2", "l3"]);

    let first = pool.acquire("l1").unwrap();
    let second = pool.acquire("l2").unwrap();
    // Second acquisition must land on the idle account, not stack onto the first
    assert_ne!(first, second);

    // Third goes to whichever is now least loaded; both are at 1 so either is
    // valid, but total distribution must be 2/1
    let third = pool.acquire("l3").unwrap();
    assert!(third == first || third == second);
}

#[test]
fn test_inactive_account_not_allocated() {
    let (_db, pool, _guard) = setup(&[("acc-a", 1)], &["l1", "l2"]);
    let inactive = AccountConfig {
        id: "acc-off".to_string(),
        max_concurrent: 10,
        active: Some(false),
    };
    pool.import_accounts(&[inactive]).unwrap();

    let first = pool.acquire("l1").unwrap();
    assert_eq!(first, "acc-a");
    match pool.acquire("l2") {
        Err(PoolError::AllBusy) => {}
        other => panic!("inactive account must not absorb load, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_reimport_preserves_live_load() {
    let (db, pool, _guard) = setup(&[("acc-a", 2)], &["l1"]);
    pool.acquire("l1").unwrap();

    // Config reload with a new capacity must not reset the live load
    pool.import_accounts(&[AccountConfig {
        id: "acc-a".to_string(),
        max_concurrent: 4,
        active: None,
    }])
    .unwrap();

    assert_eq!(load_of(&db, "acc-a"), 1);
    let status = pool
        .list_accounts()
        .unwrap()
        .into_iter()
        .find(|a| a.id == "acc-a")
        .unwrap();
    assert_eq!(status.max_concurrent, 4);
}

#[test]
fn test_concurrent_acquires_never_exceed_capacity() {
    let lesson_ids: Vec<String> = (0..12).map(|n| format!("l{}", n)).collect();
    let lesson_refs: Vec<&str> = lesson_ids.iter().map(|s| s.as_str()).collect();
    let (db, pool, _guard) = setup(&[("acc-a", 2), ("acc-b", 2)], &lesson_refs);

    let mut handles = Vec::new();
    for lesson_id in lesson_ids.clone() {
        let pool = pool.clone();
        handles.push(thread::spawn(move || pool.acquire(&lesson_id)));
    }

    let mut granted = Vec::new();
    let mut busy = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(account) => granted.push(account),
            Err(PoolError::AllBusy) => busy += 1,
            Err(e) => panic!("unexpected pool error: {}", e),
        }
    }

    // Total capacity is 4: exactly 4 winners, everyone else told to retry later
    assert_eq!(granted.len(), 4, "grants must match total capacity");
    assert_eq!(busy, 8);
    for account in ["acc-a", "acc-b"] {
        assert_eq!(load_of(&db, account), 2);
        assert!(granted.iter().filter(|a| a.as_str() == account).count() <= 2);
    }

    let distinct: HashSet<_> = granted.iter().collect();
    assert_eq!(distinct.len(), 2);
}
