//! Reconciliation sweeper
//!
//! Periodic background pass that repairs pool state when end signals are
//! lost: lessons whose scheduled end plus grace has passed but still hold
//! an account are force-released, and account loads that drifted from the
//! real binding count are forced back down. Every repair goes through the
//! same idempotent release/reconcile primitives as normal traffic, so
//! racing a sweep against live acquire/release is safe.

use log::{error, info, warn};
use sqlx::Row;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use crate::db::{Db, DynError};
use crate::pool::AccountPool;
use crate::queries::lessons;

/// Outcome of one sweep pass
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Stuck lessons marked ended (force-releasing the account if still bound)
    pub stuck_released: usize,
    /// Accounts whose load was forced down to the real binding count
    pub loads_reconciled: usize,
}

pub struct Sweeper {
    db: Arc<Db>,
    pool: Arc<AccountPool>,
    grace_period: Duration,
}

impl Sweeper {
    pub fn new(db: Arc<Db>, pool: Arc<AccountPool>, grace_period: Duration) -> Self {
        Self {
            db,
            pool,
            grace_period,
        }
    }

    /// Run both repair passes once. Idempotent: a second pass over a healthy
    /// database changes nothing.
    pub fn sweep(&self) -> Result<SweepReport, DynError> {
        let mut report = SweepReport::default();
        report.stuck_released = self.release_stuck_lessons()?;
        report.loads_reconciled = self.reconcile_account_loads()?;

        if report.stuck_released > 0 || report.loads_reconciled > 0 {
            info!(
                "[sweep] Repaired {} stuck lesson(s), {} account load(s)",
                report.stuck_released, report.loads_reconciled
            );
        }
        Ok(report)
    }

    /// Pass 1: lessons past scheduled end + grace that still hold an account
    fn release_stuck_lessons(&self) -> Result<usize, DynError> {
        let cutoff_ms =
            chrono::Utc::now().timestamp_millis() - self.grace_period.as_millis() as i64;

        let stuck = self.db.block_on(async {
            let sql = lessons::select_stuck(cutoff_ms);
            let rows = sqlx::query(&sql).fetch_all(self.db.pool()).await?;
            Ok::<_, DynError>(
                rows.into_iter()
                    .map(|r| (r.get::<String, _>(0), r.get::<Option<String>, _>(1)))
                    .collect::<Vec<_>>(),
            )
        })?;

        let mut released = 0;
        for (lesson_id, account_id) in stuck {
            match account_id {
                Some(account_id) => {
                    warn!(
                        "[sweep] Lesson {} past end+grace still bound to {}, forcing release",
                        lesson_id, account_id
                    );
                    self.pool.release(&account_id, &lesson_id)?;
                }
                // Unbound but never marked ended: the account was already
                // given back, only the status marker is missing
                None => {
                    warn!(
                        "[sweep] Lesson {} past end+grace with no binding, marking ended",
                        lesson_id
                    );
                }
            }
            self.db.execute(&lessons::mark_ended(&lesson_id))?;
            released += 1;
        }
        Ok(released)
    }

    /// Pass 2: account loads that no longer match their live bindings
    fn reconcile_account_loads(&self) -> Result<usize, DynError> {
        let mut reconciled = 0;
        for account in self.pool.list_accounts()? {
            if self.pool.reconcile_load(&account.id)?.is_some() {
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }

    /// Run sweeps on a fixed interval until the stop channel fires or
    /// disconnects. Intended for a dedicated thread.
    pub fn run(&self, interval: Duration, stop_rx: Receiver<()>) {
        info!(
            "[sweep] Sweeper running every {}s (grace period {}s)",
            interval.as_secs(),
            self.grace_period.as_secs()
        );
        loop {
            match stop_rx.recv_timeout(interval) {
                Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = self.sweep() {
                        error!("[sweep] Sweep pass failed: {}", e);
                    }
                }
            }
        }
        info!("[sweep] Sweeper stopped");
    }
}
