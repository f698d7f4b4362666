//! Account pool
//!
//! Hands out and takes back meeting accounts with an exclusivity guarantee:
//! no two concurrent callers can push the same account over its capacity,
//! and a released allocation can never be released again. The lesson row's
//! account binding is the allocation unit; every load mutation is paired
//! with a guarded binding update inside one transaction.

use log::{info, warn};
use sqlx::Row;
use std::sync::Arc;

use crate::config::AccountConfig;
use crate::db::{Db, DynError};
use crate::queries::{accounts, lessons};

/// How many times acquire re-selects after losing the compare-and-update
/// race before reporting the pool as busy
const ACQUIRE_RACE_RETRIES: u32 = 8;

/// Pool errors
#[derive(Debug)]
pub enum PoolError {
    /// Every active account is at capacity. Recoverable: the caller should
    /// report "try again shortly" upward, never retry synchronously.
    AllBusy,
    /// Database failure underneath the pool
    Internal(DynError),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::AllBusy => write!(f, "No meeting account available, try again shortly"),
            PoolError::Internal(e) => write!(f, "Pool error: {}", e),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<DynError> for PoolError {
    fn from(e: DynError) -> Self {
        PoolError::Internal(e)
    }
}

/// Snapshot of one account's allocation state
#[derive(Debug, Clone)]
pub struct AccountStatus {
    pub id: String,
    pub max_concurrent: i64,
    pub current_load: i64,
    pub active: bool,
    pub last_used_at_ms: i64,
}

/// Exclusive, transactional allocator over the accounts table
pub struct AccountPool {
    db: Arc<Db>,
}

impl AccountPool {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Acquire an account for a lesson.
    ///
    /// Selects the available account with the lowest load, ties broken by
    /// longest time since last use. Selection and increment run as one
    /// atomic unit: the increment re-checks the observed load in its WHERE
    /// clause, so a concurrent acquisition that got there first simply makes
    /// this one re-select. Acquiring for a lesson that already holds an
    /// account returns that account (duplicate start signals are safe).
    pub fn acquire(&self, lesson_id: &str) -> Result<String, PoolError> {
        if let Some(existing) = self.bound_account(lesson_id)? {
            info!(
                "[pool] Lesson {} already bound to account {}, reusing",
                lesson_id, existing
            );
            return Ok(existing);
        }

        let now_ms = chrono::Utc::now().timestamp_millis();

        for _ in 0..ACQUIRE_RACE_RETRIES {
            let candidate = self.db.block_on(async {
                let sql = accounts::select_candidate();
                let row = sqlx::query(&sql).fetch_optional(self.db.pool()).await?;
                Ok::<_, DynError>(row.map(|r| {
                    (
                        r.get::<String, _>(0),
                        r.get::<i64, _>(2), // observed current_load
                    )
                }))
            })?;

            let (account_id, observed_load) = match candidate {
                Some(c) => c,
                None => return Err(PoolError::AllBusy),
            };

            let won = self.db.block_on(async {
                let mut tx = self.db.pool().begin().await?;

                let sql = accounts::increment_load_guarded(&account_id, observed_load, now_ms);
                let incremented = sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();
                if incremented == 0 {
                    // Lost the race; nothing to roll back
                    tx.rollback().await?;
                    return Ok::<bool, DynError>(false);
                }

                let sql = lessons::bind_account(lesson_id, &account_id);
                let bound = sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();
                if bound == 0 {
                    // Another worker bound this lesson first; undo our increment
                    tx.rollback().await?;
                    return Ok(false);
                }

                tx.commit().await?;
                Ok(true)
            })?;

            if won {
                info!(
                    "[pool] Acquired account {} for lesson {} (load was {})",
                    account_id, lesson_id, observed_load
                );
                return Ok(account_id);
            }

            // Either the account state moved or the lesson got bound elsewhere
            if let Some(existing) = self.bound_account(lesson_id)? {
                return Ok(existing);
            }
        }

        // Persistent contention across every retry reads as a full pool
        Err(PoolError::AllBusy)
    }

    /// Release a lesson's account. Idempotent: releasing an allocation that
    /// is already released is a no-op, not an error. The load is decremented
    /// only when the binding row actually existed, which makes duplicate end
    /// signals (explicit trigger plus sweeper) change the load by exactly 1.
    pub fn release(&self, account_id: &str, lesson_id: &str) -> Result<bool, DynError> {
        let released = self.db.block_on(async {
            let mut tx = self.db.pool().begin().await?;

            let sql = lessons::clear_binding(lesson_id, account_id);
            let cleared = sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();

            if cleared == 0 {
                tx.rollback().await?;
                return Ok::<bool, DynError>(false);
            }

            let sql = accounts::decrement_load(account_id);
            let decremented = sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();
            if decremented == 0 {
                // Binding existed but load was already 0: bookkeeping drift.
                // Keep the binding cleared; the sweeper reconciles the count.
                warn!(
                    "[pool] Released binding {}->{} but load was already 0",
                    lesson_id, account_id
                );
            }

            tx.commit().await?;
            Ok(true)
        })?;

        if released {
            info!(
                "[pool] Released account {} from lesson {}",
                account_id, lesson_id
            );
        } else {
            info!(
                "[pool] Release for lesson {} on account {} had no matching binding, ignoring",
                lesson_id, account_id
            );
        }
        Ok(released)
    }

    /// Force an account's load to the number of live bindings that actually
    /// reference it. Used by the sweeper's orphan pass. Guarded the same way
    /// as acquire so it cannot clobber a concurrent acquire/release.
    pub fn reconcile_load(&self, account_id: &str) -> Result<Option<(i64, i64)>, DynError> {
        for _ in 0..ACQUIRE_RACE_RETRIES {
            let observed: Option<i64> =
                self.db.query_one_optional(&accounts::select_load(account_id))?;
            let observed = match observed {
                Some(load) => load,
                None => return Ok(None),
            };

            let real: i64 = self
                .db
                .query_one_optional(&lessons::count_live_bindings(account_id))?
                .unwrap_or(0);

            if observed == real {
                return Ok(None);
            }

            let sql = accounts::set_load_guarded(account_id, observed, real);
            if self.db.execute(&sql)? == 1 {
                warn!(
                    "[pool] Reconciled account {} load {} -> {} (live bindings)",
                    account_id, observed, real
                );
                return Ok(Some((observed, real)));
            }
            // Load moved underneath us; re-read and re-check
        }
        Ok(None)
    }

    /// Create or update accounts from configuration. Never deletes, and a
    /// re-import never touches live load state.
    pub fn import_accounts(&self, configs: &[AccountConfig]) -> Result<usize, DynError> {
        for account in configs {
            let sql = accounts::upsert(
                &account.id,
                account.max_concurrent,
                account.active.unwrap_or(true),
            );
            self.db.execute(&sql)?;
        }
        info!("[pool] Imported {} account(s)", configs.len());
        Ok(configs.len())
    }

    /// List all accounts with their allocation state
    pub fn list_accounts(&self) -> Result<Vec<AccountStatus>, DynError> {
        self.db.block_on(async {
            let sql = accounts::select_all();
            let rows = sqlx::query(&sql).fetch_all(self.db.pool()).await?;
            Ok(rows
                .into_iter()
                .map(|r| AccountStatus {
                    id: r.get(0),
                    max_concurrent: r.get(1),
                    current_load: r.get(2),
                    active: r.get::<i64, _>(3) != 0,
                    last_used_at_ms: r.get(4),
                })
                .collect())
        })
    }

    fn bound_account(&self, lesson_id: &str) -> Result<Option<String>, DynError> {
        self.db.block_on(async {
            let sql = lessons::select_by_id(lesson_id);
            let row = sqlx::query(&sql).fetch_optional(self.db.pool()).await?;
            Ok(row.and_then(|r| r.get::<Option<String>, _>(4)))
        })
    }
}
