//! Durable storage for deferred jobs.
//!
//! Every multi-step check-then-write sequence runs inside an immediate SQLite
//! transaction, which takes the database write lock up front. This is what makes
//! [`JobStore::run_next`] hand a given pending job to at most one caller, whether
//! the callers share a connection or are separate processes pointed at the same file.

use super::models::{Job, JobStatus};
use super::schema::FUTURE_JOBS_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::open_versioned;
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Claim on a job handed out by [`JobStore::run_next`].
///
/// Both terminal transitions only apply while the job is still `running`, so calling
/// either of them twice, or after the job was forcibly re-armed, leaves the row alone.
pub trait JobTransaction: Send + Sync {
    fn complete(&self) -> Result<()>;
    fn fail(&self, message: &str) -> Result<()>;
}

/// A job that was flipped to `running`, plus the handle used to settle it.
pub struct ClaimedJob {
    pub job: Job,
    pub transaction: Option<Box<dyn JobTransaction>>,
}

pub trait JobStore: Send + Sync {
    /// Inserts a pending job due `trigger_after` from now. A random dedup key is used
    /// when none is given.
    fn create(
        &self,
        action_type: &str,
        params: &str,
        trigger_after: Duration,
        dedup_key: Option<&str>,
    ) -> Result<Job>;

    /// Latest job carrying `dedup_key`, in any status.
    fn find_by(&self, dedup_key: &str) -> Result<Option<Job>>;

    /// Rewrites action type and params, and the due time when `trigger_after` is given.
    fn update(
        &self,
        id: i64,
        action_type: &str,
        params: &str,
        trigger_after: Option<Duration>,
    ) -> Result<()>;

    /// Moves the due time to `trigger_after` from now.
    ///
    /// With `only_if_pending` the call is a no-op unless the job is pending. Without it the
    /// job is forced back to pending whatever its status was.
    fn reschedule(&self, id: i64, trigger_after: Duration, only_if_pending: bool) -> Result<()>;

    /// Find-or-create keyed by `dedup_key`, in one write transaction.
    ///
    /// - no job: a pending one is inserted
    /// - pending: due time and params are refreshed
    /// - running: left untouched
    /// - completed, failed or canceled: forced back to pending with the new due time
    fn upsert_schedule(
        &self,
        action_type: &str,
        params: &str,
        trigger_after: Duration,
        dedup_key: &str,
    ) -> Result<Job>;

    fn cancel(&self, id: i64) -> Result<()>;

    /// Claims the earliest due pending job, if any.
    fn run_next(&self, ignore_trigger_after: bool) -> Result<Option<ClaimedJob>>;

    fn delete_permanently(&self, id: i64) -> Result<()>;

    fn inspect(&self, id: i64) -> Result<Job>;

    /// Puts jobs left `running` by a previous process back to pending.
    fn requeue_stale(&self) -> Result<usize>;
}

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, FUTURE_JOBS_VERSIONED_SCHEMAS, "future jobs")?;
        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = crate::sqlite_persistence::open_in_memory(FUTURE_JOBS_VERSIONED_SCHEMAS)?;
        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status: String = row.get("status")?;
        Ok(Job {
            id: row.get("id")?,
            dedup_key: row.get("dedup_key")?,
            action_type: row.get("action_type")?,
            action_params: row.get("action_params")?,
            triggered_at: row.get("triggered_at")?,
            status: JobStatus::from_str(&status).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    format!("unknown job status {}", status).into(),
                )
            })?,
            completed_at: row.get("completed_at")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn load(conn: &Connection, id: i64) -> Result<Option<Job>> {
        Ok(conn
            .query_row(
                "SELECT * FROM future_jobs WHERE id = ?1",
                params![id],
                Self::row_to_job,
            )
            .optional()?)
    }

    fn load_by_key(conn: &Connection, dedup_key: &str) -> Result<Option<Job>> {
        Ok(conn
            .query_row(
                "SELECT * FROM future_jobs WHERE dedup_key = ?1 ORDER BY id DESC LIMIT 1",
                params![dedup_key],
                Self::row_to_job,
            )
            .optional()?)
    }

    fn insert(
        conn: &Connection,
        action_type: &str,
        params: &str,
        trigger_after: Duration,
        dedup_key: &str,
    ) -> Result<Job> {
        let now = now();
        conn.execute(
            "INSERT INTO future_jobs
                (dedup_key, action_type, action_params, triggered_at, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                dedup_key,
                action_type,
                params,
                due_at(now, trigger_after),
                JobStatus::Pending.as_str(),
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        Self::load(conn, id)?.context("Inserted job vanished")
    }

    /// Turns a zero-row update into a not-found error, or into a no-op when the row exists.
    fn ensure_exists(conn: &Connection, id: i64) -> Result<()> {
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM future_jobs WHERE id = ?1",
                params![id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            bail!("Job {} not found", id);
        }
        Ok(())
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn due_at(now: i64, trigger_after: Duration) -> i64 {
    let after = i64::try_from(trigger_after.as_secs()).unwrap_or(i64::MAX);
    now.saturating_add(after)
}

impl JobStore for SqliteJobStore {
    fn create(
        &self,
        action_type: &str,
        params: &str,
        trigger_after: Duration,
        dedup_key: Option<&str>,
    ) -> Result<Job> {
        let generated;
        let dedup_key = match dedup_key {
            Some(key) => key,
            None => {
                generated = uuid::Uuid::new_v4().to_string();
                &generated
            }
        };
        let conn = self.conn.lock().unwrap();
        let job = Self::insert(&conn, action_type, params, trigger_after, dedup_key)?;
        debug!(
            "Created job {} ({}) due at {}",
            job.id, job.action_type, job.triggered_at
        );
        Ok(job)
    }

    fn find_by(&self, dedup_key: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap();
        Self::load_by_key(&conn, dedup_key)
    }

    fn update(
        &self,
        id: i64,
        action_type: &str,
        params: &str,
        trigger_after: Option<Duration>,
    ) -> Result<()> {
        let now = now();
        let conn = self.conn.lock().unwrap();
        let updated = match trigger_after {
            Some(after) => conn.execute(
                "UPDATE future_jobs
                 SET action_type = ?1, action_params = ?2, triggered_at = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![action_type, params, due_at(now, after), now, id],
            )?,
            None => conn.execute(
                "UPDATE future_jobs SET action_type = ?1, action_params = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![action_type, params, now, id],
            )?,
        };
        if updated == 0 {
            bail!("Job {} not found", id);
        }
        Ok(())
    }

    fn reschedule(&self, id: i64, trigger_after: Duration, only_if_pending: bool) -> Result<()> {
        let now = now();
        let conn = self.conn.lock().unwrap();
        let updated = if only_if_pending {
            conn.execute(
                "UPDATE future_jobs SET triggered_at = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = ?4",
                params![
                    due_at(now, trigger_after),
                    now,
                    id,
                    JobStatus::Pending.as_str()
                ],
            )?
        } else {
            conn.execute(
                "UPDATE future_jobs
                 SET triggered_at = ?1, status = ?2, completed_at = NULL, error = NULL, updated_at = ?3
                 WHERE id = ?4",
                params![
                    due_at(now, trigger_after),
                    JobStatus::Pending.as_str(),
                    now,
                    id
                ],
            )?
        };
        if updated == 0 {
            Self::ensure_exists(&conn, id)?;
            debug!("Job {} is not pending, reschedule skipped", id);
        }
        Ok(())
    }

    fn upsert_schedule(
        &self,
        action_type: &str,
        params: &str,
        trigger_after: Duration,
        dedup_key: &str,
    ) -> Result<Job> {
        let now = now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let job = match Self::load_by_key(&tx, dedup_key)? {
            None => Self::insert(&tx, action_type, params, trigger_after, dedup_key)?,
            Some(existing) if existing.status == JobStatus::Running => existing,
            Some(existing) => {
                tx.execute(
                    "UPDATE future_jobs
                     SET action_type = ?1, action_params = ?2, triggered_at = ?3, status = ?4,
                         completed_at = NULL, error = NULL, updated_at = ?5
                     WHERE id = ?6",
                    params![
                        action_type,
                        params,
                        due_at(now, trigger_after),
                        JobStatus::Pending.as_str(),
                        now,
                        existing.id
                    ],
                )?;
                if existing.status.is_terminal() {
                    debug!(
                        "Re-armed {} job {} for key {}",
                        existing.status, existing.id, dedup_key
                    );
                }
                Self::load(&tx, existing.id)?.context("Upserted job vanished")?
            }
        };

        tx.commit()?;
        Ok(job)
    }

    fn cancel(&self, id: i64) -> Result<()> {
        let now = now();
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE future_jobs SET status = ?1, completed_at = ?2, updated_at = ?2 WHERE id = ?3",
            params![JobStatus::Canceled.as_str(), now, id],
        )?;
        if updated == 0 {
            bail!("Job {} not found", id);
        }
        Ok(())
    }

    fn run_next(&self, ignore_trigger_after: bool) -> Result<Option<ClaimedJob>> {
        let now = now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate = if ignore_trigger_after {
            tx.query_row(
                "SELECT * FROM future_jobs WHERE status = ?1
                 ORDER BY triggered_at ASC, id ASC LIMIT 1",
                params![JobStatus::Pending.as_str()],
                Self::row_to_job,
            )
            .optional()?
        } else {
            tx.query_row(
                "SELECT * FROM future_jobs WHERE status = ?1 AND triggered_at <= ?2
                 ORDER BY triggered_at ASC, id ASC LIMIT 1",
                params![JobStatus::Pending.as_str(), now],
                Self::row_to_job,
            )
            .optional()?
        };

        let Some(mut job) = candidate else {
            return Ok(None);
        };

        let claimed = tx.execute(
            "UPDATE future_jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                JobStatus::Running.as_str(),
                now,
                job.id,
                JobStatus::Pending.as_str()
            ],
        )?;
        tx.commit()?;

        if claimed == 0 {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.updated_at = now;

        let transaction = SqliteJobTransaction {
            conn: Arc::clone(&self.conn),
            job_id: job.id,
        };
        Ok(Some(ClaimedJob {
            job,
            transaction: Some(Box::new(transaction)),
        }))
    }

    fn delete_permanently(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM future_jobs WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn inspect(&self, id: i64) -> Result<Job> {
        let conn = self.conn.lock().unwrap();
        Self::load(&conn, id)?.with_context(|| format!("Job {} not found", id))
    }

    fn requeue_stale(&self) -> Result<usize> {
        let now = now();
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE future_jobs SET status = ?1, updated_at = ?2 WHERE status = ?3",
            params![
                JobStatus::Pending.as_str(),
                now,
                JobStatus::Running.as_str()
            ],
        )?;
        if count > 0 {
            info!("Requeued {} jobs left running by a previous run", count);
        }
        Ok(count)
    }
}

struct SqliteJobTransaction {
    conn: Arc<Mutex<Connection>>,
    job_id: i64,
}

impl SqliteJobTransaction {
    fn settle(&self, status: JobStatus, error: Option<&str>) -> Result<()> {
        let now = now();
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE future_jobs SET status = ?1, error = ?2, completed_at = ?3, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                status.as_str(),
                error,
                now,
                self.job_id,
                JobStatus::Running.as_str()
            ],
        )?;
        if updated == 0 {
            debug!(
                "Job {} no longer running, {} transition skipped",
                self.job_id, status
            );
        }
        Ok(())
    }
}

impl JobTransaction for SqliteJobTransaction {
    fn complete(&self) -> Result<()> {
        self.settle(JobStatus::Completed, None)
    }

    fn fail(&self, message: &str) -> Result<()> {
        self.settle(JobStatus::Failed, Some(message))
    }
}
