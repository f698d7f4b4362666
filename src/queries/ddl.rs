use sea_query::{ColumnDef, ForeignKey, ForeignKeyAction, Index, SqliteQueryBuilder, Table};

use crate::schema::{Accounts, Lessons, Metadata, RecordingParts, Recordings};

/// CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)
pub fn create_metadata_table() -> String {
    Table::create()
        .table(Metadata::Table)
        .if_not_exists()
        .col(ColumnDef::new(Metadata::Key).string().primary_key())
        .col(ColumnDef::new(Metadata::Value).string().not_null())
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS accounts (
///     id TEXT PRIMARY KEY,
///     max_concurrent INTEGER NOT NULL,
///     current_load INTEGER NOT NULL DEFAULT 0,
///     active INTEGER NOT NULL DEFAULT 1,
///     last_used_at_ms INTEGER NOT NULL DEFAULT 0
/// )
pub fn create_accounts_table() -> String {
    Table::create()
        .table(Accounts::Table)
        .if_not_exists()
        .col(ColumnDef::new(Accounts::Id).string().primary_key())
        .col(ColumnDef::new(Accounts::MaxConcurrent).integer().not_null())
        .col(
            ColumnDef::new(Accounts::CurrentLoad)
                .integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(Accounts::Active).integer().not_null().default(1))
        .col(
            ColumnDef::new(Accounts::LastUsedAtMs)
                .big_integer()
                .not_null()
                .default(0),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS lessons (
///     id TEXT PRIMARY KEY,
///     scheduled_start_ms INTEGER NOT NULL,
///     scheduled_end_ms INTEGER NOT NULL,
///     status TEXT NOT NULL DEFAULT 'unscheduled',
///     account_id TEXT NULL REFERENCES accounts(id),
///     meeting_id TEXT NULL,
///     join_url TEXT NULL,
///     host_url TEXT NULL,
///     access_secret TEXT NULL
/// )
pub fn create_lessons_table() -> String {
    Table::create()
        .table(Lessons::Table)
        .if_not_exists()
        .col(ColumnDef::new(Lessons::Id).string().primary_key())
        .col(
            ColumnDef::new(Lessons::ScheduledStartMs)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(Lessons::ScheduledEndMs)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(Lessons::Status)
                .string()
                .not_null()
                .default("unscheduled"),
        )
        .col(ColumnDef::new(Lessons::AccountId).string().null())
        .col(ColumnDef::new(Lessons::MeetingId).string().null())
        .col(ColumnDef::new(Lessons::JoinUrl).string().null())
        .col(ColumnDef::new(Lessons::HostUrl).string().null())
        .col(ColumnDef::new(Lessons::AccessSecret).string().null())
        .foreign_key(
            ForeignKey::create()
                .from(Lessons::Table, Lessons::AccountId)
                .to(Accounts::Table, Accounts::Id),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS recordings (
///     id TEXT PRIMARY KEY,
///     lesson_id TEXT NOT NULL,
///     meeting_id TEXT NOT NULL,
///     status TEXT NOT NULL DEFAULT 'pending',
///     attempts INTEGER NOT NULL DEFAULT 0,
///     next_attempt_at_ms INTEGER NOT NULL DEFAULT 0,
///     storage_ref TEXT NULL,
///     total_bytes INTEGER NOT NULL DEFAULT 0,
///     crc32 INTEGER NULL,
///     last_error TEXT NULL,
///     updated_at_ms INTEGER NOT NULL
/// )
pub fn create_recordings_table() -> String {
    Table::create()
        .table(Recordings::Table)
        .if_not_exists()
        .col(ColumnDef::new(Recordings::Id).string().primary_key())
        .col(ColumnDef::new(Recordings::LessonId).string().not_null())
        .col(ColumnDef::new(Recordings::MeetingId).string().not_null())
        .col(
            ColumnDef::new(Recordings::Status)
                .string()
                .not_null()
                .default("pending"),
        )
        .col(
            ColumnDef::new(Recordings::Attempts)
                .integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(Recordings::NextAttemptAtMs)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(Recordings::StorageRef).string().null())
        .col(
            ColumnDef::new(Recordings::TotalBytes)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(ColumnDef::new(Recordings::Crc32).big_integer().null())
        .col(ColumnDef::new(Recordings::LastError).string().null())
        .col(
            ColumnDef::new(Recordings::UpdatedAtMs)
                .big_integer()
                .not_null(),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE TABLE IF NOT EXISTS recording_parts (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     recording_id TEXT NOT NULL REFERENCES recordings(id) ON DELETE CASCADE,
///     provider_part_id TEXT NOT NULL,
///     start_timestamp_ms INTEGER NOT NULL,
///     end_timestamp_ms INTEGER NOT NULL,
///     byte_size INTEGER NOT NULL,
///     download_url TEXT NOT NULL,
///     data BLOB NULL
/// )
pub fn create_recording_parts_table() -> String {
    Table::create()
        .table(RecordingParts::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(RecordingParts::Id)
                .integer()
                .primary_key()
                .auto_increment(),
        )
        .col(
            ColumnDef::new(RecordingParts::RecordingId)
                .string()
                .not_null(),
        )
        .col(
            ColumnDef::new(RecordingParts::ProviderPartId)
                .string()
                .not_null(),
        )
        .col(
            ColumnDef::new(RecordingParts::StartTimestampMs)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(RecordingParts::EndTimestampMs)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(RecordingParts::ByteSize)
                .big_integer()
                .not_null(),
        )
        .col(
            ColumnDef::new(RecordingParts::DownloadUrl)
                .string()
                .not_null(),
        )
        .col(ColumnDef::new(RecordingParts::Data).blob().null())
        .foreign_key(
            ForeignKey::create()
                .from(RecordingParts::Table, RecordingParts::RecordingId)
                .to(Recordings::Table, Recordings::Id)
                .on_delete(ForeignKeyAction::Cascade),
        )
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_lessons_account_id ON lessons(account_id)
pub fn create_lessons_account_id_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_lessons_account_id")
        .table(Lessons::Table)
        .col(Lessons::AccountId)
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_lessons_status_end ON lessons(status, scheduled_end_ms)
pub fn create_lessons_status_end_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_lessons_status_end")
        .table(Lessons::Table)
        .col(Lessons::Status)
        .col(Lessons::ScheduledEndMs)
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_recordings_status_due ON recordings(status, next_attempt_at_ms)
pub fn create_recordings_status_due_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_recordings_status_due")
        .table(Recordings::Table)
        .col(Recordings::Status)
        .col(Recordings::NextAttemptAtMs)
        .to_string(SqliteQueryBuilder)
}

/// CREATE INDEX IF NOT EXISTS idx_recording_parts_recording_id ON recording_parts(recording_id)
pub fn create_recording_parts_recording_id_index() -> String {
    Index::create()
        .if_not_exists()
        .name("idx_recording_parts_recording_id")
        .table(RecordingParts::Table)
        .col(RecordingParts::RecordingId)
        .to_string(SqliteQueryBuilder)
}
