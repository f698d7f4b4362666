use sea_query::Iden;

/// Metadata table - key-value store for database configuration
#[derive(Iden)]
pub enum Metadata {
    Table,
    Key,
    Value,
}

/// Accounts table - provider credentials/seats shared across lessons
#[derive(Iden)]
pub enum Accounts {
    Table,
    Id,
    MaxConcurrent,
    CurrentLoad,
    Active,
    LastUsedAtMs,
}

/// Lessons table - scheduled sessions and their account bindings
#[derive(Iden)]
pub enum Lessons {
    Table,
    Id,
    ScheduledStartMs,
    ScheduledEndMs,
    Status,
    AccountId,
    MeetingId,
    JoinUrl,
    HostUrl,
    AccessSecret,
}

/// Recordings table - one durable artifact per captured lesson
#[derive(Iden)]
pub enum Recordings {
    Table,
    Id,
    LessonId,
    MeetingId,
    Status,
    Attempts,
    NextAttemptAtMs,
    StorageRef,
    TotalBytes,
    Crc32,
    LastError,
    UpdatedAtMs,
}

/// Recording parts table - raw provider-side segments awaiting merge
#[derive(Iden)]
pub enum RecordingParts {
    Table,
    Id,
    RecordingId,
    ProviderPartId,
    StartTimestampMs,
    EndTimestampMs,
    ByteSize,
    DownloadUrl,
    Data,
}
