use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::Accounts;

/// INSERT INTO accounts (id, max_concurrent, active) VALUES (?, ?, ?)
/// ON CONFLICT (id) DO UPDATE SET max_concurrent, active
///
/// Load and last-used are deliberately left alone on conflict: re-importing
/// configuration must never clobber live allocation state.
pub fn upsert(id: &str, max_concurrent: i64, active: bool) -> String {
    Query::insert()
        .into_table(Accounts::Table)
        .columns([Accounts::Id, Accounts::MaxConcurrent, Accounts::Active])
        .values_panic([id.into(), max_concurrent.into(), (active as i32).into()])
        .on_conflict(
            sea_query::OnConflict::column(Accounts::Id)
                .update_columns([Accounts::MaxConcurrent, Accounts::Active])
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, max_concurrent, current_load FROM accounts
/// WHERE active = 1 AND current_load < max_concurrent
/// ORDER BY current_load ASC, last_used_at_ms ASC LIMIT 1
///
/// Lowest load first, oldest use as tie-break (wear-leveling).
pub fn select_candidate() -> String {
    Query::select()
        .columns([Accounts::Id, Accounts::MaxConcurrent, Accounts::CurrentLoad])
        .from(Accounts::Table)
        .and_where(Expr::col(Accounts::Active).eq(1))
        .and_where(Expr::col(Accounts::CurrentLoad).lt(Expr::col(Accounts::MaxConcurrent)))
        .order_by(Accounts::CurrentLoad, Order::Asc)
        .order_by(Accounts::LastUsedAtMs, Order::Asc)
        .limit(1)
        .to_string(SqliteQueryBuilder)
}

/// UPDATE accounts SET current_load = current_load + 1, last_used_at_ms = ?
/// WHERE id = ? AND active = 1 AND current_load = ? AND current_load < max_concurrent
///
/// Compare-and-update guard: the WHERE re-checks the load observed at
/// selection time, so two concurrent acquisitions can never both win the
/// same pre-increment state.
pub fn increment_load_guarded(id: &str, observed_load: i64, now_ms: i64) -> String {
    Query::update()
        .table(Accounts::Table)
        .value(
            Accounts::CurrentLoad,
            Expr::col(Accounts::CurrentLoad).add(1),
        )
        .value(Accounts::LastUsedAtMs, now_ms)
        .and_where(Expr::col(Accounts::Id).eq(id))
        .and_where(Expr::col(Accounts::Active).eq(1))
        .and_where(Expr::col(Accounts::CurrentLoad).eq(observed_load))
        .and_where(Expr::col(Accounts::CurrentLoad).lt(Expr::col(Accounts::MaxConcurrent)))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE accounts SET current_load = current_load - 1 WHERE id = ? AND current_load > 0
pub fn decrement_load(id: &str) -> String {
    Query::update()
        .table(Accounts::Table)
        .value(
            Accounts::CurrentLoad,
            Expr::col(Accounts::CurrentLoad).sub(1),
        )
        .and_where(Expr::col(Accounts::Id).eq(id))
        .and_where(Expr::col(Accounts::CurrentLoad).gt(0))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE accounts SET current_load = ? WHERE id = ? AND current_load = ?
///
/// Used by the sweeper to force load down to the real binding count; guarded
/// on the observed value so a concurrent acquire/release is never clobbered.
pub fn set_load_guarded(id: &str, observed_load: i64, new_load: i64) -> String {
    Query::update()
        .table(Accounts::Table)
        .value(Accounts::CurrentLoad, new_load)
        .and_where(Expr::col(Accounts::Id).eq(id))
        .and_where(Expr::col(Accounts::CurrentLoad).eq(observed_load))
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, max_concurrent, current_load, active, last_used_at_ms FROM accounts ORDER BY id
pub fn select_all() -> String {
    Query::select()
        .columns([
            Accounts::Id,
            Accounts::MaxConcurrent,
            Accounts::CurrentLoad,
            Accounts::Active,
            Accounts::LastUsedAtMs,
        ])
        .from(Accounts::Table)
        .order_by(Accounts::Id, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT current_load FROM accounts WHERE id = ?
pub fn select_load(id: &str) -> String {
    Query::select()
        .column(Accounts::CurrentLoad)
        .from(Accounts::Table)
        .and_where(Expr::col(Accounts::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}
