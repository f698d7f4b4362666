/// Expected database schema version
/// All databases must use this version for compatibility
pub const EXPECTED_DB_VERSION: &str = "1";

/// Minimum plausible size for a finished recording part, in bytes.
/// Anything smaller is treated as a truncated download (transient failure).
pub const MIN_PART_BYTES: u64 = 1024;

/// Generate a unique recording id for a meeting.
/// Derived from the meeting id so duplicate webhook deliveries collapse.
pub fn recording_id_for_meeting(meeting_id: &str) -> String {
    format!("rec_{}", meeting_id)
}