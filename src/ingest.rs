//! Recording ingestion pipeline
//!
//! Turns the provider-side recording parts of one meeting into a single
//! durable artifact, then removes the provider copy. States:
//! `pending -> downloading -> merging -> uploading -> ready`, with `failed`
//! reachable from any step after the attempt budget is spent.
//!
//! The hard rule lives in the uploading step: the provider-side delete is
//! issued only after the storage client reported upload success AND an
//! independent existence check confirmed the object. No other code path
//! deletes provider data.

use crc32fast::Hasher;
use log::{info, warn};
use sqlx::Row;
use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::constants::{recording_id_for_meeting, MIN_PART_BYTES};
use crate::db::{Db, DynError};
use crate::lifecycle;
use crate::provider::{MeetingProvider, ProviderError, RecordingPart};
use crate::queries::recordings;
use crate::storage::{StorageClient, StorageError, StorageRef};

/// Pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingStatus {
    Pending,
    Downloading,
    Merging,
    Uploading,
    Ready,
    Failed,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingStatus::Pending => "pending",
            RecordingStatus::Downloading => "downloading",
            RecordingStatus::Merging => "merging",
            RecordingStatus::Uploading => "uploading",
            RecordingStatus::Ready => "ready",
            RecordingStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RecordingStatus::Pending),
            "downloading" => Some(RecordingStatus::Downloading),
            "merging" => Some(RecordingStatus::Merging),
            "uploading" => Some(RecordingStatus::Uploading),
            "ready" => Some(RecordingStatus::Ready),
            "failed" => Some(RecordingStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordingStatus::Ready | RecordingStatus::Failed)
    }
}

/// One recording row
#[derive(Debug, Clone)]
pub struct Recording {
    pub id: String,
    pub lesson_id: String,
    pub meeting_id: String,
    pub status: RecordingStatus,
    pub attempts: i64,
    pub storage_ref: Option<String>,
    pub total_bytes: i64,
    pub crc32: Option<i64>,
    pub next_attempt_at_ms: i64,
}

/// Load a recording row by id
pub fn load_recording(db: &Db, recording_id: &str) -> Result<Option<Recording>, DynError> {
    db.block_on(async {
        let sql = recordings::select_by_id(recording_id);
        let row = sqlx::query(&sql).fetch_optional(db.pool()).await?;
        Ok(row.map(|r| {
            let status_raw: String = r.get(3);
            Recording {
                id: r.get(0),
                lesson_id: r.get(1),
                meeting_id: r.get(2),
                status: RecordingStatus::parse(&status_raw).unwrap_or(RecordingStatus::Failed),
                attempts: r.get(4),
                storage_ref: r.get(5),
                total_bytes: r.get(6),
                crc32: r.get(7),
                next_attempt_at_ms: r.get(8),
            }
        }))
    })
}

struct PartRow {
    id: i64,
    provider_part_id: String,
    start_timestamp_ms: i64,
    byte_size: i64,
    download_url: String,
    has_data: bool,
}

/// State machine over recordings. Each `step` call performs at most one
/// stage of work; the worker pump re-queues the recording until it reaches
/// a terminal state.
pub struct IngestPipeline {
    db: Arc<Db>,
    provider: Arc<dyn MeetingProvider>,
    storage: Arc<dyn StorageClient>,
    max_attempts: u32,
}

impl IngestPipeline {
    pub fn new(
        db: Arc<Db>,
        provider: Arc<dyn MeetingProvider>,
        storage: Arc<dyn StorageClient>,
        max_attempts: u32,
    ) -> Self {
        Self {
            db,
            provider,
            storage,
            max_attempts,
        }
    }

    /// Register a finished recording reported by the provider webhook.
    /// Duplicate deliveries collapse onto the same recording row and part
    /// set. Returns the recording id, or None when the meeting is unknown.
    pub fn register_finished_recording(
        &self,
        meeting_id: &str,
        parts: &[RecordingPart],
    ) -> Result<Option<String>, DynError> {
        let lesson = match lifecycle::load_lesson_by_meeting(&self.db, meeting_id)? {
            Some(lesson) => lesson,
            None => {
                warn!(
                    "[ingest] Recording webhook for unknown meeting '{}', ignoring",
                    meeting_id
                );
                return Ok(None);
            }
        };

        let recording_id = recording_id_for_meeting(meeting_id);
        let now_ms = chrono::Utc::now().timestamp_millis();

        let sql = recordings::insert_or_ignore(&recording_id, &lesson.id, meeting_id, now_ms);
        self.db.execute(&sql)?;

        for part in parts {
            self.insert_part_if_new(&recording_id, part)?;
        }

        info!(
            "[ingest] Registered recording {} for lesson {} ({} part(s) reported)",
            recording_id,
            lesson.id,
            parts.len()
        );
        Ok(Some(recording_id))
    }

    fn insert_part_if_new(&self, recording_id: &str, part: &RecordingPart) -> Result<(), DynError> {
        let exists: Option<i64> = self
            .db
            .query_one_optional(&recordings::part_exists(recording_id, &part.id))?;
        if exists.is_some() {
            return Ok(());
        }
        let sql = recordings::insert_part(
            recording_id,
            &part.id,
            part.start_timestamp_ms,
            part.end_timestamp_ms,
            part.byte_size as i64,
            &part.download_url,
        );
        self.db.execute(&sql)?;
        Ok(())
    }

    /// Advance one recording by one pipeline stage.
    /// Returns the status after the step, for logging and tests.
    pub fn step(&self, recording_id: &str) -> Result<RecordingStatus, DynError> {
        let recording = match load_recording(&self.db, recording_id)? {
            Some(recording) => recording,
            None => {
                warn!("[ingest] Step for unknown recording '{}', ignoring", recording_id);
                return Ok(RecordingStatus::Failed);
            }
        };

        if recording.status.is_terminal() {
            return Ok(recording.status);
        }

        // A recording parked by a transient failure stays parked until its
        // scheduled retry time; stepping it early performs no work and no
        // provider I/O, so the persisted backoff cannot be bypassed
        let now_ms = chrono::Utc::now().timestamp_millis();
        if recording.next_attempt_at_ms > now_ms {
            return Ok(recording.status);
        }

        let result = match recording.status {
            RecordingStatus::Pending => self.step_pending(&recording),
            RecordingStatus::Downloading => self.step_download(&recording),
            RecordingStatus::Merging => self.step_merge(&recording),
            RecordingStatus::Uploading => self.step_upload(&recording),
            RecordingStatus::Ready | RecordingStatus::Failed => unreachable!(),
        };

        match result {
            Ok(status) => Ok(status),
            Err(failure) => self.handle_failure(&recording, failure),
        }
    }

    /// Re-queue a recording parked in `failed` (manual intervention path).
    /// Resets the attempt budget and resumes from the last safe stage.
    pub fn reprocess(&self, recording_id: &str) -> Result<bool, DynError> {
        let recording = match load_recording(&self.db, recording_id)? {
            Some(recording) => recording,
            None => return Ok(false),
        };

        // A recording that already has a verified upload resumes at the
        // uploading stage (which re-verifies and finishes); everything else
        // starts over from pending with whatever parts were kept.
        let resume = if recording.storage_ref.is_some() {
            RecordingStatus::Uploading
        } else {
            RecordingStatus::Pending
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let sql = recordings::reset_for_reprocess(recording_id, resume.as_str(), now_ms);
        let updated = self.db.execute(&sql)?;
        if updated == 1 {
            info!(
                "[ingest] Recording {} queued for reprocessing from '{}'",
                recording_id,
                resume.as_str()
            );
        }
        Ok(updated == 1)
    }

    /// Recordings due for work: non-terminal status with next_attempt_at in
    /// the past. Also the restart-recovery query.
    pub fn due_recordings(&self, limit: u64) -> Result<Vec<String>, DynError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.db.block_on(async {
            let sql = recordings::select_due(now_ms, limit);
            let rows = sqlx::query(&sql).fetch_all(self.db.pool()).await?;
            Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
        })
    }

    // ------------------------------------------------------------------
    // Pipeline stages
    // ------------------------------------------------------------------

    fn step_pending(&self, recording: &Recording) -> Result<RecordingStatus, StepFailure> {
        // The webhook may have reported no part list; ask the provider
        if self.load_parts(&recording.id)?.is_empty() {
            let lesson = self
                .load_lesson(recording)
                .map_err(StepFailure::Internal)?;
            let parts = self
                .provider
                .list_recording_parts(
                    &recording.meeting_id,
                    lesson.scheduled_start_ms,
                    lesson.scheduled_end_ms,
                )
                .map_err(StepFailure::from)?;
            if parts.is_empty() {
                // Provider has not finished producing parts yet
                return Err(StepFailure::Transient(
                    "provider reports no finished parts yet".to_string(),
                ));
            }
            for part in &parts {
                self.insert_part_if_new(&recording.id, part)
                    .map_err(StepFailure::Internal)?;
            }
        }

        self.advance(recording, RecordingStatus::Pending, RecordingStatus::Downloading)
            .map_err(StepFailure::Internal)?;
        Ok(RecordingStatus::Downloading)
    }

    fn step_download(&self, recording: &Recording) -> Result<RecordingStatus, StepFailure> {
        let lesson = self.load_lesson(recording).map_err(StepFailure::Internal)?;
        let parts = self.load_parts(&recording.id)?;

        for part in parts.iter().filter(|p| !p.has_data) {
            let provider_part = RecordingPart {
                id: part.provider_part_id.clone(),
                start_timestamp_ms: part.start_timestamp_ms,
                end_timestamp_ms: 0,
                byte_size: part.byte_size as u64,
                download_url: part.download_url.clone(),
            };
            let body = self
                .provider
                .download_part(&provider_part, lesson.access_secret.as_deref())
                .map_err(StepFailure::from)?;

            // A short body means a truncated or not-yet-final part; retry later
            if (body.len() as u64) < MIN_PART_BYTES
                || (part.byte_size > 0 && (body.len() as i64) < part.byte_size)
            {
                return Err(StepFailure::Transient(format!(
                    "part {} returned {} bytes (expected at least {})",
                    part.provider_part_id,
                    body.len(),
                    part.byte_size.max(MIN_PART_BYTES as i64)
                )));
            }

            let sql = recordings::set_part_data(part.id, &body, body.len() as i64);
            self.db.execute(&sql).map_err(StepFailure::Internal)?;
            info!(
                "[ingest] Downloaded part {} for recording {} ({} bytes)",
                part.provider_part_id,
                recording.id,
                body.len()
            );
        }

        self.advance(recording, RecordingStatus::Downloading, RecordingStatus::Merging)
            .map_err(StepFailure::Internal)?;
        Ok(RecordingStatus::Merging)
    }

    fn step_merge(&self, recording: &Recording) -> Result<RecordingStatus, StepFailure> {
        let blobs = self.load_part_data(&recording.id)?;
        if blobs.is_empty() {
            return Err(StepFailure::Transient(
                "no downloaded parts present at merge".to_string(),
            ));
        }

        let mut hasher = Hasher::new();
        let mut total_bytes: i64 = 0;
        for blob in &blobs {
            hasher.update(blob);
            total_bytes += blob.len() as i64;
        }
        let checksum = hasher.finalize();

        let sql = recordings::set_artifact_info(&recording.id, total_bytes, checksum as i64);
        self.db.execute(&sql).map_err(StepFailure::Internal)?;

        self.advance(recording, RecordingStatus::Merging, RecordingStatus::Uploading)
            .map_err(StepFailure::Internal)?;
        info!(
            "[ingest] Merged {} part(s) for recording {} ({} bytes, crc32 {:08x})",
            blobs.len(),
            recording.id,
            total_bytes,
            checksum
        );
        Ok(RecordingStatus::Uploading)
    }

    fn step_upload(&self, recording: &Recording) -> Result<RecordingStatus, StepFailure> {
        let expected_bytes = recording.total_bytes;

        // A retried upload step first checks whether a previous attempt
        // already landed the object; the atomic rename on the storage side
        // guarantees a visible object is complete.
        let confirmed_ref = match &recording.storage_ref {
            Some(existing) => {
                let existing = StorageRef(existing.clone());
                match self.storage.exists(&existing).map_err(StepFailure::from)? {
                    Some(size) if size as i64 == expected_bytes => Some(existing),
                    _ => None,
                }
            }
            None => None,
        };

        let storage_ref = match confirmed_ref {
            Some(r) => r,
            None => {
                let uploaded = self.upload_artifact(recording)?;

                let sql = recordings::set_storage_ref(&recording.id, &uploaded.0);
                self.db.execute(&sql).map_err(StepFailure::Internal)?;

                // Independent confirmation: upload-call success alone never
                // authorizes anything
                match self.storage.exists(&uploaded).map_err(StepFailure::from)? {
                    Some(size) if size as i64 == expected_bytes => uploaded,
                    Some(size) => {
                        return Err(StepFailure::Transient(format!(
                            "durable copy size mismatch: stored {} bytes, expected {}",
                            size, expected_bytes
                        )));
                    }
                    None => {
                        return Err(StepFailure::Transient(
                            "durable copy not found after upload".to_string(),
                        ));
                    }
                }
            }
        };

        // Double confirmation holds: the provider copy may now be removed.
        // Failure here leaves the recording in uploading; the retry skips
        // straight back to this point via the confirmed_ref fast path.
        self.provider
            .delete_recording(&recording.meeting_id)
            .map_err(StepFailure::from)?;

        self.advance(recording, RecordingStatus::Uploading, RecordingStatus::Ready)
            .map_err(StepFailure::Internal)?;

        // Downloaded blobs are scratch data once the artifact is durable
        self.db
            .execute(&recordings::clear_part_data(&recording.id))
            .map_err(StepFailure::Internal)?;

        info!(
            "[ingest] Recording {} ready at {} ({} bytes), provider copy removed",
            recording.id, storage_ref, expected_bytes
        );
        Ok(RecordingStatus::Ready)
    }

    fn upload_artifact(&self, recording: &Recording) -> Result<StorageRef, StepFailure> {
        let blobs = self.load_part_data(&recording.id)?;
        if blobs.is_empty() {
            return Err(StepFailure::Transient(
                "no downloaded parts present at upload".to_string(),
            ));
        }

        // Spool the merged artifact through a scratch file so large
        // recordings are not concatenated in memory
        let mut scratch = tempfile::tempfile()
            .map_err(|e| StepFailure::Internal(format!("Failed to create scratch file: {}", e).into()))?;
        let mut total: u64 = 0;
        for blob in &blobs {
            scratch
                .write_all(blob)
                .map_err(|e| StepFailure::Internal(format!("Failed to spool artifact: {}", e).into()))?;
            total += blob.len() as u64;
        }
        scratch
            .seek(SeekFrom::Start(0))
            .map_err(|e| StepFailure::Internal(format!("Failed to rewind scratch file: {}", e).into()))?;

        let name = format!("{}.mp4", recording.id);
        let folder = recording.lesson_id.clone();
        let storage_ref = self
            .storage
            .upload(&mut scratch, &name, &folder, total)
            .map_err(StepFailure::from)?;
        Ok(storage_ref)
    }

    // ------------------------------------------------------------------
    // Failure and bookkeeping
    // ------------------------------------------------------------------

    fn handle_failure(
        &self,
        recording: &Recording,
        failure: StepFailure,
    ) -> Result<RecordingStatus, DynError> {
        let now_ms = chrono::Utc::now().timestamp_millis();

        match failure {
            StepFailure::Internal(e) => Err(e),
            StepFailure::Permanent(msg) => {
                warn!(
                    "[ingest] Recording {} hit permanent error in '{}': {}",
                    recording.id,
                    recording.status.as_str(),
                    msg
                );
                self.db
                    .execute(&recordings::mark_failed(&recording.id, &msg, now_ms))?;
                Ok(RecordingStatus::Failed)
            }
            StepFailure::Transient(msg) => {
                let attempt = recording.attempts as u32;
                if attempt + 1 >= self.max_attempts {
                    warn!(
                        "[ingest] Recording {} failed after {} attempts: {}",
                        recording.id,
                        attempt + 1,
                        msg
                    );
                    self.db
                        .execute(&recordings::mark_failed(&recording.id, &msg, now_ms))?;
                    return Ok(RecordingStatus::Failed);
                }

                let backoff_ms = crate::provider::retry_backoff_ms(attempt);
                let next_ms = now_ms + backoff_ms as i64;
                info!(
                    "[ingest] Recording {} step '{}' failed transiently ({}), retry {} in {}ms",
                    recording.id,
                    recording.status.as_str(),
                    msg,
                    attempt + 1,
                    backoff_ms
                );
                self.db.execute(&recordings::record_transient_failure(
                    &recording.id,
                    next_ms,
                    &msg,
                    now_ms,
                ))?;
                Ok(recording.status)
            }
        }
    }

    fn advance(
        &self,
        recording: &Recording,
        from: RecordingStatus,
        to: RecordingStatus,
    ) -> Result<(), DynError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let sql = recordings::advance_status(&recording.id, from.as_str(), to.as_str(), now_ms);
        let updated = self.db.execute(&sql)?;
        if updated == 0 {
            // Duplicate delivery raced us; the other worker already advanced
            warn!(
                "[ingest] Recording {} already moved past '{}', skipping transition",
                recording.id,
                from.as_str()
            );
        }
        Ok(())
    }

    fn load_lesson(&self, recording: &Recording) -> Result<crate::lifecycle::Lesson, DynError> {
        lifecycle::load_lesson(&self.db, &recording.lesson_id)?
            .ok_or_else(|| format!("Recording {} references unknown lesson", recording.id).into())
    }

    fn load_parts(&self, recording_id: &str) -> Result<Vec<PartRow>, StepFailure> {
        self.db
            .block_on(async {
                let sql = recordings::select_parts(recording_id);
                let rows = sqlx::query(&sql).fetch_all(self.db.pool()).await?;
                Ok::<_, DynError>(
                    rows.into_iter()
                        .map(|r| PartRow {
                            id: r.get(0),
                            provider_part_id: r.get(1),
                            start_timestamp_ms: r.get(2),
                            byte_size: r.get(3),
                            download_url: r.get(4),
                            has_data: r.get::<bool, _>(5),
                        })
                        .collect(),
                )
            })
            .map_err(StepFailure::Internal)
    }

    fn load_part_data(&self, recording_id: &str) -> Result<Vec<Vec<u8>>, StepFailure> {
        self.db
            .block_on(async {
                let sql = recordings::select_part_data(recording_id);
                let rows = sqlx::query(&sql).fetch_all(self.db.pool()).await?;
                Ok::<_, DynError>(
                    rows.into_iter()
                        .filter_map(|r| r.get::<Option<Vec<u8>>, _>(0))
                        .collect(),
                )
            })
            .map_err(StepFailure::Internal)
    }
}

/// Step-level failure classification
enum StepFailure {
    /// Retried with backoff up to the attempt budget
    Transient(String),
    /// Parked as failed immediately
    Permanent(String),
    /// Database-level failure, propagated to the worker loop
    Internal(DynError),
}

impl From<ProviderError> for StepFailure {
    fn from(e: ProviderError) -> Self {
        if e.is_transient() {
            StepFailure::Transient(e.to_string())
        } else {
            StepFailure::Permanent(e.to_string())
        }
    }
}

impl From<StorageError> for StepFailure {
    fn from(e: StorageError) -> Self {
        if e.is_transient() {
            StepFailure::Transient(e.to_string())
        } else {
            StepFailure::Permanent(e.to_string())
        }
    }
}
