//! Chat session server library.
//!
//! Exposes the chat protocol, its stores and the deferred job scheduler for the binary
//! and the end-to-end tests.

pub mod chat;
pub mod config;
pub mod conversation;
pub mod future_jobs;
pub mod server;
pub mod sqlite_persistence;
pub mod user;

// Re-export commonly used types for convenience
pub use chat::{ChatProtocol, ChatSettings, SessionFinalizer, SqliteChatStore, CHAT_JOB_TYPE};
pub use future_jobs::{FutureScheduler, JobStore, SchedulerSettings, SqliteJobStore};
pub use server::{make_app, run_server, RequestsLoggingLevel, ServerConfig, ServerState};
pub use user::{SqliteUserStore, UserStore};
