use std::sync::Arc;
use std::time::Duration;

use meeting_pool::config::AccountConfig;
use meeting_pool::db::{create_test_db, Db};
use meeting_pool::pool::AccountPool;
use meeting_pool::queries::{accounts, lessons};
use meeting_pool::sweeper::Sweeper;

fn setup(grace: Duration) -> (Arc<Db>, Arc<AccountPool>, Sweeper, tempfile::TempDir) {
    let (db, guard) = create_test_db().unwrap();
    let db = Arc::new(db);
    let pool = Arc::new(AccountPool::new(db.clone()));
    pool.import_accounts(&[AccountConfig {
        id: "acc-a".to_string(),
        max_concurrent: 3,
        active: None,
    }])
    .unwrap();
    let sweeper = Sweeper::new(db.clone(), pool.clone(), grace);
    (db, pool, sweeper, guard)
}

fn insert_lesson(db: &Db, lesson_id: &str, end_offset_ms: i64) {
    let now = chrono::Utc::now().timestamp_millis();
    let sql = lessons::insert_or_ignore(lesson_id, now - 3_600_000, now + end_offset_ms);
    db.execute(&sql).unwrap();
}

fn load_of(db: &Db, account_id: &str) -> i64 {
    db.query_one_optional(&accounts::select_load(account_id))
        .unwrap()
        .unwrap()
}

fn lesson_status(db: &Db, lesson_id: &str) -> String {
    db.query_one_optional(&format!(
        "SELECT status FROM lessons WHERE id = '{}'",
        lesson_id
    ))
    .unwrap()
    .unwrap()
}

#[test]
fn test_stuck_lesson_released_after_grace() {
    let (db, pool, sweeper, _guard) = setup(Duration::from_secs(0));

    // Lesson whose scheduled end passed a minute ago and never got an end signal
    insert_lesson(&db, "l-stuck", -60_000);
    pool.acquire("l-stuck").unwrap();
    assert_eq!(load_of(&db, "acc-a"), 1);

    let report = sweeper.sweep().unwrap();
    assert_eq!(report.stuck_released, 1);
    assert_eq!(load_of(&db, "acc-a"), 0);
    assert_eq!(lesson_status(&db, "l-stuck"), "ended");
}

#[test]
fn test_lesson_within_grace_untouched() {
    let (db, pool, sweeper, _guard) = setup(Duration::from_secs(3600));

    // Ended a minute ago but the grace period is an hour
    insert_lesson(&db, "l-recent", -60_000);
    pool.acquire("l-recent").unwrap();

    let report = sweeper.sweep().unwrap();
    assert_eq!(report.stuck_released, 0);
    assert_eq!(load_of(&db, "acc-a"), 1);
    assert_ne!(lesson_status(&db, "l-recent"), "ended");
}

#[test]
fn test_running_lesson_untouched() {
    let (db, pool, sweeper, _guard) = setup(Duration::from_secs(0));

    // Scheduled end is an hour away
    insert_lesson(&db, "l-live", 3_600_000);
    pool.acquire("l-live").unwrap();

    let report = sweeper.sweep().unwrap();
    assert_eq!(report.stuck_released, 0);
    assert_eq!(load_of(&db, "acc-a"), 1);
}

#[test]
fn test_orphaned_load_forced_down() {
    let (db, _pool, sweeper, _guard) = setup(Duration::from_secs(0));

    // Simulate a crash between increment and bind: load says 2, nothing bound
    db.execute(&accounts::set_load_guarded("acc-a", 0, 2)).unwrap();
    assert_eq!(load_of(&db, "acc-a"), 2);

    let report = sweeper.sweep().unwrap();
    assert_eq!(report.loads_reconciled, 1);
    assert_eq!(load_of(&db, "acc-a"), 0);
}

#[test]
fn test_reconcile_counts_live_bindings() {
    let (db, pool, sweeper, _guard) = setup(Duration::from_secs(0));

    insert_lesson(&db, "l-live", 3_600_000);
    pool.acquire("l-live").unwrap();
    // Drift the load above the real binding count
    db.execute(&accounts::set_load_guarded("acc-a", 1, 3)).unwrap();

    let report = sweeper.sweep().unwrap();
    assert_eq!(report.loads_reconciled, 1);
    assert_eq!(load_of(&db, "acc-a"), 1, "load must match the one live binding");
}

#[test]
fn test_explicit_release_then_sweep_decrements_once() {
    let (db, pool, sweeper, _guard) = setup(Duration::from_secs(0));

    insert_lesson(&db, "l-done", -60_000);
    let account = pool.acquire("l-done").unwrap();

    // Explicit end signal arrives first
    pool.release(&account, "l-done").unwrap();
    db.execute(&lessons::mark_ended("l-done")).unwrap();
    assert_eq!(load_of(&db, "acc-a"), 0);

    // The sweep racing in afterwards must not decrement again
    let report = sweeper.sweep().unwrap();
    assert_eq!(report.stuck_released, 0);
    assert_eq!(report.loads_reconciled, 0);
    assert_eq!(load_of(&db, "acc-a"), 0);
}

#[test]
fn test_unbound_lesson_past_grace_marked_ended() {
    let (db, pool, sweeper, _guard) = setup(Duration::from_secs(0));

    // Simulate a crash between the release and the ended marker: the
    // account is already given back but the lesson still reads as open
    insert_lesson(&db, "l-half-ended", -60_000);
    let account = pool.acquire("l-half-ended").unwrap();
    pool.release(&account, "l-half-ended").unwrap();
    assert_eq!(load_of(&db, "acc-a"), 0);
    assert_ne!(lesson_status(&db, "l-half-ended"), "ended");

    let report = sweeper.sweep().unwrap();
    assert_eq!(report.stuck_released, 1);
    assert_eq!(lesson_status(&db, "l-half-ended"), "ended");
    // No binding existed, so no load was touched
    assert_eq!(load_of(&db, "acc-a"), 0);

    let second = sweeper.sweep().unwrap();
    assert_eq!(second.stuck_released, 0);
}

#[test]
fn test_sweep_is_idempotent() {
    let (db, pool, sweeper, _guard) = setup(Duration::from_secs(0));

    insert_lesson(&db, "l-stuck", -60_000);
    pool.acquire("l-stuck").unwrap();

    let first = sweeper.sweep().unwrap();
    assert_eq!(first.stuck_released, 1);

    let second = sweeper.sweep().unwrap();
    assert_eq!(second.stuck_released, 0);
    assert_eq!(second.loads_reconciled, 0);
    assert_eq!(load_of(&db, "acc-a"), 0);
}
