use sea_query::{Expr, Order, Query, SqliteQueryBuilder};

use crate::schema::{RecordingParts, Recordings};

/// INSERT INTO recordings (id, lesson_id, meeting_id, status, updated_at_ms) VALUES (?, ?, ?, 'pending', ?)
/// ON CONFLICT (id) DO NOTHING
///
/// The recording id is derived from the meeting id, so duplicate webhook
/// deliveries collapse onto the same row.
pub fn insert_or_ignore(id: &str, lesson_id: &str, meeting_id: &str, now_ms: i64) -> String {
    Query::insert()
        .into_table(Recordings::Table)
        .columns([
            Recordings::Id,
            Recordings::LessonId,
            Recordings::MeetingId,
            Recordings::Status,
            Recordings::UpdatedAtMs,
        ])
        .values_panic([
            id.into(),
            lesson_id.into(),
            meeting_id.into(),
            "pending".into(),
            now_ms.into(),
        ])
        .on_conflict(
            sea_query::OnConflict::column(Recordings::Id)
                .do_nothing()
                .to_owned(),
        )
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, lesson_id, meeting_id, status, attempts, storage_ref, total_bytes, crc32, next_attempt_at_ms
/// FROM recordings WHERE id = ?
pub fn select_by_id(id: &str) -> String {
    Query::select()
        .columns([
            Recordings::Id,
            Recordings::LessonId,
            Recordings::MeetingId,
            Recordings::Status,
            Recordings::Attempts,
            Recordings::StorageRef,
            Recordings::TotalBytes,
            Recordings::Crc32,
            Recordings::NextAttemptAtMs,
        ])
        .from(Recordings::Table)
        .and_where(Expr::col(Recordings::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT id FROM recordings
/// WHERE status NOT IN ('ready', 'failed') AND next_attempt_at_ms <= ?
/// ORDER BY next_attempt_at_ms LIMIT ?
///
/// Pump query: due, non-terminal recordings. Also the restart-recovery path.
pub fn select_due(now_ms: i64, limit: u64) -> String {
    Query::select()
        .column(Recordings::Id)
        .from(Recordings::Table)
        .and_where(Expr::col(Recordings::Status).is_not_in(["ready", "failed"]))
        .and_where(Expr::col(Recordings::NextAttemptAtMs).lte(now_ms))
        .order_by(Recordings::NextAttemptAtMs, Order::Asc)
        .limit(limit)
        .to_string(SqliteQueryBuilder)
}

/// UPDATE recordings SET status = ?, updated_at_ms = ? WHERE id = ? AND status = ?
///
/// Guarded transition: a duplicate step observing a stale status affects
/// zero rows instead of rewinding the pipeline.
pub fn advance_status(id: &str, from: &str, to: &str, now_ms: i64) -> String {
    Query::update()
        .table(Recordings::Table)
        .value(Recordings::Status, to)
        .value(Recordings::UpdatedAtMs, now_ms)
        .and_where(Expr::col(Recordings::Id).eq(id))
        .and_where(Expr::col(Recordings::Status).eq(from))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE recordings SET total_bytes = ?, crc32 = ? WHERE id = ?
pub fn set_artifact_info(id: &str, total_bytes: i64, crc32: i64) -> String {
    Query::update()
        .table(Recordings::Table)
        .value(Recordings::TotalBytes, total_bytes)
        .value(Recordings::Crc32, crc32)
        .and_where(Expr::col(Recordings::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE recordings SET storage_ref = ? WHERE id = ?
pub fn set_storage_ref(id: &str, storage_ref: &str) -> String {
    Query::update()
        .table(Recordings::Table)
        .value(Recordings::StorageRef, storage_ref)
        .and_where(Expr::col(Recordings::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE recordings SET attempts = attempts + 1, next_attempt_at_ms = ?, last_error = ?, updated_at_ms = ?
/// WHERE id = ?
pub fn record_transient_failure(
    id: &str,
    next_attempt_at_ms: i64,
    last_error: &str,
    now_ms: i64,
) -> String {
    Query::update()
        .table(Recordings::Table)
        .value(Recordings::Attempts, Expr::col(Recordings::Attempts).add(1))
        .value(Recordings::NextAttemptAtMs, next_attempt_at_ms)
        .value(Recordings::LastError, last_error)
        .value(Recordings::UpdatedAtMs, now_ms)
        .and_where(Expr::col(Recordings::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE recordings SET status = 'failed', last_error = ?, updated_at_ms = ? WHERE id = ?
pub fn mark_failed(id: &str, last_error: &str, now_ms: i64) -> String {
    Query::update()
        .table(Recordings::Table)
        .value(Recordings::Status, "failed")
        .value(Recordings::LastError, last_error)
        .value(Recordings::UpdatedAtMs, now_ms)
        .and_where(Expr::col(Recordings::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE recordings SET status = ?, attempts = 0, next_attempt_at_ms = 0, last_error = NULL, updated_at_ms = ?
/// WHERE id = ? AND status = 'failed'
///
/// Manual reprocess: only valid from the failed state.
pub fn reset_for_reprocess(id: &str, resume_status: &str, now_ms: i64) -> String {
    Query::update()
        .table(Recordings::Table)
        .value(Recordings::Status, resume_status)
        .value(Recordings::Attempts, 0)
        .value(Recordings::NextAttemptAtMs, 0)
        .value(Recordings::LastError, Option::<String>::None)
        .value(Recordings::UpdatedAtMs, now_ms)
        .and_where(Expr::col(Recordings::Id).eq(id))
        .and_where(Expr::col(Recordings::Status).eq("failed"))
        .to_string(SqliteQueryBuilder)
}

// ============================================================================
// Recording parts
// ============================================================================

/// INSERT INTO recording_parts (recording_id, provider_part_id, start_timestamp_ms,
/// end_timestamp_ms, byte_size, download_url) VALUES (?, ?, ?, ?, ?, ?)
pub fn insert_part(
    recording_id: &str,
    provider_part_id: &str,
    start_timestamp_ms: i64,
    end_timestamp_ms: i64,
    byte_size: i64,
    download_url: &str,
) -> String {
    Query::insert()
        .into_table(RecordingParts::Table)
        .columns([
            RecordingParts::RecordingId,
            RecordingParts::ProviderPartId,
            RecordingParts::StartTimestampMs,
            RecordingParts::EndTimestampMs,
            RecordingParts::ByteSize,
            RecordingParts::DownloadUrl,
        ])
        .values_panic([
            recording_id.into(),
            provider_part_id.into(),
            start_timestamp_ms.into(),
            end_timestamp_ms.into(),
            byte_size.into(),
            download_url.into(),
        ])
        .to_string(SqliteQueryBuilder)
}

/// SELECT id, provider_part_id, start_timestamp_ms, byte_size, download_url, data IS NOT NULL
/// FROM recording_parts WHERE recording_id = ? ORDER BY start_timestamp_ms
///
/// Merge order is start-timestamp order regardless of insertion order.
pub fn select_parts(recording_id: &str) -> String {
    Query::select()
        .columns([
            RecordingParts::Id,
            RecordingParts::ProviderPartId,
            RecordingParts::StartTimestampMs,
            RecordingParts::ByteSize,
            RecordingParts::DownloadUrl,
        ])
        .expr(Expr::col(RecordingParts::Data).is_not_null())
        .from(RecordingParts::Table)
        .and_where(Expr::col(RecordingParts::RecordingId).eq(recording_id))
        .order_by(RecordingParts::StartTimestampMs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// SELECT 1 FROM recording_parts WHERE recording_id = ? AND provider_part_id = ?
pub fn part_exists(recording_id: &str, provider_part_id: &str) -> String {
    Query::select()
        .expr(Expr::val(1))
        .from(RecordingParts::Table)
        .and_where(Expr::col(RecordingParts::RecordingId).eq(recording_id))
        .and_where(Expr::col(RecordingParts::ProviderPartId).eq(provider_part_id))
        .to_string(SqliteQueryBuilder)
}

/// UPDATE recording_parts SET data = ?, byte_size = ? WHERE id = ?
pub fn set_part_data(id: i64, data: &[u8], byte_size: i64) -> String {
    Query::update()
        .table(RecordingParts::Table)
        .value(RecordingParts::Data, data.to_vec())
        .value(RecordingParts::ByteSize, byte_size)
        .and_where(Expr::col(RecordingParts::Id).eq(id))
        .to_string(SqliteQueryBuilder)
}

/// SELECT data FROM recording_parts WHERE recording_id = ? ORDER BY start_timestamp_ms
pub fn select_part_data(recording_id: &str) -> String {
    Query::select()
        .column(RecordingParts::Data)
        .from(RecordingParts::Table)
        .and_where(Expr::col(RecordingParts::RecordingId).eq(recording_id))
        .order_by(RecordingParts::StartTimestampMs, Order::Asc)
        .to_string(SqliteQueryBuilder)
}

/// UPDATE recording_parts SET data = NULL WHERE recording_id = ?
///
/// Downloaded blobs are scratch data; they are dropped once the merged
/// artifact is confirmed durable.
pub fn clear_part_data(recording_id: &str) -> String {
    Query::update()
        .table(RecordingParts::Table)
        .value(RecordingParts::Data, Option::<Vec<u8>>::None)
        .and_where(Expr::col(RecordingParts::RecordingId).eq(recording_id))
        .to_string(SqliteQueryBuilder)
}
