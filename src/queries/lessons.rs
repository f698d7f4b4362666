use sea_query::{Expr, Func, Order, Query, SqliteQueryBuilder};

use crate::schema::Lessons;

/// INSERT INTO lessons (id, scheduled_start_ms, scheduled_end_ms, status) VALUES (?, ?, ?, ?)
/// ON CONFLICT (id) DO NOTHING
pub fn insert_or_ignore(id: &str, scheduled_start_ms: i64, scheduled_end_ms: i64) -> String {
    Query::insert()
        .into_table(Lessons::Table)
        .columns([
            Lessons::Id,
            Lessons::ScheduledStartMs,
            Lessons::ScheduledEndMs,
            Lessons::Status,
        ])
        .values_panic([
            id.into(),
            scheduled_start_ms.into(),
            scheduled_end_ms.into(),
            "unscheduled".into(),
        ])
        .on_conflict(
            sea_query::OnConflict::column(Lessons::Id)
                .do_nothing()
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, scheduled_start_ms, scheduled_end_ms, status, account_id, meeting_id, access_secret
/// FROM lessons WHERE id = ?
pub fn select_by_id(id: &str) -> String {
    Query::select()
        .columns([
            Lessons::Id,
            Lessons::ScheduledStartMs,
            Lessons::ScheduledEndMs,
            Lessons::Status,
            Lessons::AccountId,
            Lessons::MeetingId,
            Lessons::AccessSecret,
        ])
        .from(Lessons::Table)
        .and_where(Expr::col(Lessons::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT ... FROM lessons WHERE meeting_id = ?
pub fn select_by_meeting_id(meeting_id: &str) -> String {
    Query::select()
        .columns([
            Lessons::Id,
            Lessons::ScheduledStartMs,
            Lessons::ScheduledEndMs,
            Lessons::Status,
            Lessons::AccountId,
            Lessons::MeetingId,
            Lessons::AccessSecret,
        ])
        .from(Lessons::Table)
        .and_where(Expr::col(Lessons::MeetingId).eq(meeting_id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT join_url, host_url FROM lessons WHERE id = ?
pub fn select_urls(id: &str) -> String {
    Query::select()
        .columns([Lessons::JoinUrl, Lessons::HostUrl])
        .from(Lessons::Table)
        .and_where(Expr::col(Lessons::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE lessons SET status = 'starting' WHERE id = ? AND status IN ('unscheduled', 'starting')
///
/// The starting marker is written before the acquire so a crash between
/// acquire and meeting creation is visible to the sweeper.
pub fn mark_starting(id: &str) -> String {
    Query::update()
        .table(Lessons::Table)
        .value(Lessons::Status, "starting")
        .and_where(Expr::col(Lessons::Id).eq(id))
        .and_where(Expr::col(Lessons::Status).is_in(["unscheduled", "starting"]))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE lessons SET account_id = ? WHERE id = ? AND account_id IS NULL
pub fn bind_account(id: &str, account_id: &str) -> String {
    Query::update()
        .table(Lessons::Table)
        .value(Lessons::AccountId, account_id)
        .and_where(Expr::col(Lessons::Id).eq(id))
        .and_where(Expr::col(Lessons::AccountId).is_null())
        .to_string(SqliteQueryBuilder)
}

/// UPDATE lessons SET status = 'live', meeting_id = ?, join_url = ?, host_url = ?, access_secret = ?
/// WHERE id = ?
pub fn mark_live(
    id: &str,
    meeting_id: &str,
    join_url: &str,
    host_url: &str,
    access_secret: Option<&str>,
) -> String {
    Query::update()
        .table(Lessons::Table)
        .value(Lessons::Status, "live")
        .value(Lessons::MeetingId, meeting_id)
        .value(Lessons::JoinUrl, join_url)
        .value(Lessons::HostUrl, host_url)
        .value(Lessons::AccessSecret, access_secret)
        .and_where(Expr::col(Lessons::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE lessons SET account_id = NULL WHERE id = ? AND account_id = ?
///
/// The binding row is the allocation unit: this statement reporting one
/// affected row is what authorizes exactly one load decrement.
pub fn clear_binding(id: &str, account_id: &str) -> String {
    Query::update()
        .table(Lessons::Table)
        .value(Lessons::AccountId, Option::<String>::None)
        .and_where(Expr::col(Lessons::Id).eq(id))
        .and_where(Expr::col(Lessons::AccountId).eq(account_id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE lessons SET status = 'ended' WHERE id = ?
pub fn mark_ended(id: &str) -> String {
    Query::update()
        .table(Lessons::Table)
        .value(Lessons::Status, "ended")
        .and_where(Expr::col(Lessons::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, account_id FROM lessons
/// WHERE status != 'ended' AND scheduled_end_ms < ?
/// ORDER BY scheduled_end_ms
///
/// Stuck-lesson pass: the caller supplies now - grace as the cutoff. A null
/// account_id is still stuck (a crash between release and the ended marker
/// leaves exactly that shape) so the binding is not filtered on here.
pub fn select_stuck(cutoff_ms: i64) -> String {
    Query::select()
        .columns([Lessons::Id, Lessons::AccountId])
        .from(Lessons::Table)
        .and_where(Expr::col(Lessons::Status).ne("ended"))
        .and_where(Expr::col(Lessons::ScheduledEndMs).lt(cutoff_ms))
        .order_by(Lessons::ScheduledEndMs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT COUNT(*) FROM lessons WHERE account_id = ? AND status != 'ended'
pub fn count_live_bindings(account_id: &str) -> String {
    Query::select()
        .expr(Func::count(Expr::col(Lessons::Id)))
        .from(Lessons::Table)
        .and_where(Expr::col(Lessons::AccountId).eq(account_id))
        .and_where(Expr::col(Lessons::Status).ne("ended"))
        .to_string(SqliteQueryBuilder)
}
