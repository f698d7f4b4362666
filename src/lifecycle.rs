//! Lesson lifecycle coordinator
//!
//! Drives one lesson through `unscheduled -> starting -> live -> ended`.
//! The coordinator is the only caller that binds accounts to lessons; both
//! the explicit end signal and the sweeper funnel through the same
//! idempotent release path.

use log::{info, warn};
use sqlx::Row;
use std::sync::Arc;

use crate::db::{Db, DynError};
use crate::pool::{AccountPool, PoolError};
use crate::provider::{MeetingInfo, MeetingProvider, ProviderError};
use crate::queries::lessons;

/// Lesson state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LessonStatus {
    Unscheduled,
    Starting,
    Live,
    Ended,
}

impl LessonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LessonStatus::Unscheduled => "unscheduled",
            LessonStatus::Starting => "starting",
            LessonStatus::Live => "live",
            LessonStatus::Ended => "ended",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unscheduled" => Some(LessonStatus::Unscheduled),
            "starting" => Some(LessonStatus::Starting),
            "live" => Some(LessonStatus::Live),
            "ended" => Some(LessonStatus::Ended),
            _ => None,
        }
    }
}

/// One scheduled session and its current bindings
#[derive(Debug, Clone)]
pub struct Lesson {
    pub id: String,
    pub scheduled_start_ms: i64,
    pub scheduled_end_ms: i64,
    pub status: LessonStatus,
    pub account_id: Option<String>,
    pub meeting_id: Option<String>,
    pub access_secret: Option<String>,
}

/// Errors surfaced by start_lesson
#[derive(Debug)]
pub enum StartError {
    /// Pool exhausted - reported upward as "try again shortly"
    AllBusy,
    /// Meeting creation failed (the acquired account was already released)
    Provider(ProviderError),
    /// Unknown lesson, bad state, or database failure
    Internal(DynError),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::AllBusy => write!(f, "No meeting account available, try again shortly"),
            StartError::Provider(e) => write!(f, "Meeting creation failed: {}", e),
            StartError::Internal(e) => write!(f, "Lesson start failed: {}", e),
        }
    }
}

impl std::error::Error for StartError {}

/// Load a lesson row by id
pub fn load_lesson(db: &Db, lesson_id: &str) -> Result<Option<Lesson>, DynError> {
    db.block_on(async {
        let sql = lessons::select_by_id(lesson_id);
        let row = sqlx::query(&sql).fetch_optional(db.pool()).await?;
        Ok(row.map(lesson_from_row))
    })
}

/// Load a lesson row by provider meeting id
pub fn load_lesson_by_meeting(db: &Db, meeting_id: &str) -> Result<Option<Lesson>, DynError> {
    db.block_on(async {
        let sql = lessons::select_by_meeting_id(meeting_id);
        let row = sqlx::query(&sql).fetch_optional(db.pool()).await?;
        Ok(row.map(lesson_from_row))
    })
}

fn lesson_from_row(row: sqlx::sqlite::SqliteRow) -> Lesson {
    let status_raw: String = row.get(3);
    Lesson {
        id: row.get(0),
        scheduled_start_ms: row.get(1),
        scheduled_end_ms: row.get(2),
        status: LessonStatus::parse(&status_raw).unwrap_or(LessonStatus::Unscheduled),
        account_id: row.get(4),
        meeting_id: row.get(5),
        access_secret: row.get(6),
    }
}

/// Orchestrates acquire -> create-meeting -> release for each lesson
pub struct Coordinator {
    db: Arc<Db>,
    pool: Arc<AccountPool>,
    provider: Arc<dyn MeetingProvider>,
}

impl Coordinator {
    pub fn new(db: Arc<Db>, pool: Arc<AccountPool>, provider: Arc<dyn MeetingProvider>) -> Self {
        Self { db, pool, provider }
    }

    /// Register a lesson the scheduling subsystem told us about.
    /// Idempotent: re-registering an existing lesson changes nothing.
    pub fn register_lesson(
        &self,
        lesson_id: &str,
        scheduled_start_ms: i64,
        scheduled_end_ms: i64,
    ) -> Result<(), DynError> {
        let sql = lessons::insert_or_ignore(lesson_id, scheduled_start_ms, scheduled_end_ms);
        self.db.execute(&sql)?;
        Ok(())
    }

    /// Start a lesson: acquire an account, create the provider meeting,
    /// persist the binding. If meeting creation fails after a successful
    /// acquire the account is released before the error surfaces, so a
    /// partial failure never leaks an allocation.
    pub fn start_lesson(&self, lesson_id: &str) -> Result<MeetingInfo, StartError> {
        let lesson = load_lesson(&self.db, lesson_id)
            .map_err(StartError::Internal)?
            .ok_or_else(|| {
                StartError::Internal(format!("Unknown lesson '{}'", lesson_id).into())
            })?;

        match lesson.status {
            LessonStatus::Ended => {
                return Err(StartError::Internal(
                    format!("Lesson '{}' has already ended", lesson_id).into(),
                ));
            }
            LessonStatus::Live => {
                // Duplicate start signal: report the existing meeting
                if let Some(meeting_id) = &lesson.meeting_id {
                    info!("[lifecycle] Lesson {} already live, reusing meeting", lesson_id);
                    return self
                        .existing_meeting_info(&lesson, meeting_id)
                        .map_err(StartError::Internal);
                }
            }
            LessonStatus::Unscheduled | LessonStatus::Starting => {}
        }

        // Persist the starting marker first so a crash between acquire and
        // meeting creation is visible to the sweeper after restart
        self.db
            .execute(&lessons::mark_starting(lesson_id))
            .map_err(StartError::Internal)?;

        let account_id = match self.pool.acquire(lesson_id) {
            Ok(id) => id,
            Err(PoolError::AllBusy) => return Err(StartError::AllBusy),
            Err(PoolError::Internal(e)) => return Err(StartError::Internal(e)),
        };

        let duration_mins =
            ((lesson.scheduled_end_ms - lesson.scheduled_start_ms) / 60_000).max(1);
        let meeting = match self.provider.create_meeting(
            &format!("Lesson {}", lesson_id),
            lesson.scheduled_start_ms,
            duration_mins,
        ) {
            Ok(meeting) => meeting,
            Err(e) => {
                // Undo the acquire before surfacing the error
                if let Err(release_err) = self.pool.release(&account_id, lesson_id) {
                    warn!(
                        "[lifecycle] Failed to release account {} after create failure: {}",
                        account_id, release_err
                    );
                }
                return Err(StartError::Provider(e));
            }
        };

        let sql = lessons::mark_live(
            lesson_id,
            &meeting.meeting_id,
            &meeting.join_url,
            &meeting.host_url,
            meeting.access_secret.as_deref(),
        );
        if let Err(e) = self.db.execute(&sql) {
            if let Err(release_err) = self.pool.release(&account_id, lesson_id) {
                warn!(
                    "[lifecycle] Failed to release account {} after persist failure: {}",
                    account_id, release_err
                );
            }
            return Err(StartError::Internal(e));
        }

        info!(
            "[lifecycle] Lesson {} live on account {} (meeting {})",
            lesson_id, account_id, meeting.meeting_id
        );
        Ok(meeting)
    }

    /// End a lesson: best-effort provider meeting deletion, then the
    /// idempotent pool release. Safe to call any number of times and safe
    /// to race against the sweeper's forced release.
    pub fn end_lesson(&self, lesson_id: &str) -> Result<(), DynError> {
        let lesson = match load_lesson(&self.db, lesson_id)? {
            Some(lesson) => lesson,
            None => {
                warn!("[lifecycle] End signal for unknown lesson '{}', ignoring", lesson_id);
                return Ok(());
            }
        };

        if let Some(meeting_id) = &lesson.meeting_id {
            // Meeting deletion must not block account reclamation
            if let Err(e) = self.provider.delete_meeting(meeting_id) {
                warn!(
                    "[lifecycle] Failed to delete meeting {} for lesson {}: {}",
                    meeting_id, lesson_id, e
                );
            }
        }

        if let Some(account_id) = &lesson.account_id {
            self.pool.release(account_id, lesson_id)?;
        }

        self.db.execute(&lessons::mark_ended(lesson_id))?;
        info!("[lifecycle] Lesson {} ended", lesson_id);
        Ok(())
    }

    fn existing_meeting_info(
        &self,
        lesson: &Lesson,
        meeting_id: &str,
    ) -> Result<MeetingInfo, DynError> {
        let (join_url, host_url) = self.db.block_on(async {
            let sql = lessons::select_urls(&lesson.id);
            let row = sqlx::query(&sql).fetch_one(self.db.pool()).await?;
            Ok::<_, DynError>((
                row.get::<Option<String>, _>(0).unwrap_or_default(),
                row.get::<Option<String>, _>(1).unwrap_or_default(),
            ))
        })?;

        Ok(MeetingInfo {
            meeting_id: meeting_id.to_string(),
            join_url,
            host_url,
            access_secret: lesson.access_secret.clone(),
        })
    }
}
