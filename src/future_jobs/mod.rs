//! Persistent deferred jobs: a SQLite backed store and the polling scheduler that
//! dispatches due jobs to handlers registered per action type.

mod models;
mod scheduler;
mod schema;
mod store;

pub use models::{Job, JobStatus};
pub use scheduler::{
    FutureScheduler, JobHandler, SchedulerHandle, SchedulerSettings, NO_HANDLER_ERROR,
};
pub use store::{ClaimedJob, JobStore, JobTransaction, SqliteJobStore};
