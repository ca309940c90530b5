use serde::Serialize;

use crate::user::UserId;

/// A chat session row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatSession {
    pub id: i64,
    pub user_id: UserId,
    pub session_id: String,
    /// UTC date the session was opened, `YYYY-MM-DD`.
    pub started_date: String,
    /// Offset of the server clock when the session was opened, `+HH:MM`.
    pub user_timezone: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub finished_at: Option<i64>,
    pub archived_at: Option<i64>,
    /// Seconds between creation and finish, filled in on archive.
    pub chat_duration: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Finished,
    Archived,
}

impl ChatSession {
    pub fn state(&self) -> SessionState {
        if self.archived_at.is_some() {
            SessionState::Archived
        } else if self.finished_at.is_some() {
            SessionState::Finished
        } else {
            SessionState::Active
        }
    }
}

/// Result of the check-and-reactivate step run before a message is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageGate {
    /// The session was already active.
    Active(ChatSession),
    /// The session was finished and has been made active again.
    Reactivated(ChatSession),
    Archived,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized,
    AlreadyFinished,
    AlreadyArchived,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived(ChatSession),
    AlreadyArchived(ChatSession),
    Missing,
}
