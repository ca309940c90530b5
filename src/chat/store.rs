//! Durable chat session state and message history.
//!
//! The message gate and the finalize step both read the row and write it back inside one
//! immediate transaction, so a reactivating message and a firing idle timer never lose each
//! other's update.

use super::models::{ArchiveOutcome, ChatSession, FinalizeOutcome, MessageGate, SessionState};
use super::schema::CHAT_VERSIONED_SCHEMAS;
use crate::conversation::{ChatMessage, MessageRole};
use crate::sqlite_persistence::open_versioned;
use crate::user::UserId;
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub trait ChatStateGateway: Send + Sync {
    /// Inserts an active session owned by `user_id`.
    fn create_session(&self, user_id: UserId, session_id: &str) -> Result<ChatSession>;

    /// Point read by session id, whoever owns it.
    fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>>;

    /// Point read scoped to `user_id`.
    fn get_user_session(&self, user_id: UserId, session_id: &str) -> Result<Option<ChatSession>>;

    /// Most recently created session of `user_id` that is not archived.
    fn latest_open_session(&self, user_id: UserId) -> Result<Option<ChatSession>>;

    /// Loads the session and clears `finished_at` unless it is archived.
    fn reactivate_for_message(&self, user_id: UserId, session_id: &str) -> Result<MessageGate>;

    /// Sets `finished_at` unless the session is already finished or archived.
    /// A missing session is an error.
    fn finalize_if_active(&self, user_id: UserId, session_id: &str) -> Result<FinalizeOutcome>;

    /// Archives the session, finishing it first when needed, and records its duration.
    fn archive(&self, user_id: UserId, session_id: &str) -> Result<ArchiveOutcome>;

    /// Stores `messages` under the session, all or nothing.
    fn append_history(&self, session_id: &str, messages: &[ChatMessage]) -> Result<()>;

    /// Messages of the session in insertion order.
    fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>>;
}

#[derive(Clone)]
pub struct SqliteChatStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteChatStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, CHAT_VERSIONED_SCHEMAS, "chat")?;
        Ok(SqliteChatStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = crate::sqlite_persistence::open_in_memory(CHAT_VERSIONED_SCHEMAS)?;
        Ok(SqliteChatStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Overwrites the timestamps of a session, for tests that need a past timeline.
    #[cfg(test)]
    pub fn set_timestamps(
        &self,
        session_id: &str,
        created_at: i64,
        finished_at: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE chats SET created_at = ?1, finished_at = ?2 WHERE session_id = ?3",
            params![created_at, finished_at, session_id],
        )?;
        Ok(())
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<ChatSession> {
        Ok(ChatSession {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            session_id: row.get("session_id")?,
            started_date: row.get("started_date")?,
            user_timezone: row.get("user_timezone")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            finished_at: row.get("finished_at")?,
            archived_at: row.get("archived_at")?,
            chat_duration: row.get("chat_duration")?,
        })
    }

    fn load(conn: &Connection, session_id: &str) -> Result<Option<ChatSession>> {
        Ok(conn
            .query_row(
                "SELECT * FROM chats WHERE session_id = ?1",
                params![session_id],
                Self::row_to_session,
            )
            .optional()?)
    }

    fn load_for_user(
        conn: &Connection,
        user_id: UserId,
        session_id: &str,
    ) -> Result<Option<ChatSession>> {
        Ok(conn
            .query_row(
                "SELECT * FROM chats WHERE session_id = ?1 AND user_id = ?2",
                params![session_id, user_id],
                Self::row_to_session,
            )
            .optional()?)
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl ChatStateGateway for SqliteChatStore {
    fn create_session(&self, user_id: UserId, session_id: &str) -> Result<ChatSession> {
        let now = now();
        let started_date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let user_timezone = chrono::Local::now().format("%:z").to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO chats (user_id, session_id, started_date, user_timezone, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![user_id, session_id, started_date, user_timezone, now],
        )
        .with_context(|| format!("Failed to create chat session {}", session_id))?;
        Self::load(&conn, session_id)?.context("Inserted chat session vanished")
    }

    fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        let conn = self.conn.lock().unwrap();
        Self::load(&conn, session_id)
    }

    fn get_user_session(&self, user_id: UserId, session_id: &str) -> Result<Option<ChatSession>> {
        let conn = self.conn.lock().unwrap();
        Self::load_for_user(&conn, user_id, session_id)
    }

    fn latest_open_session(&self, user_id: UserId) -> Result<Option<ChatSession>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT * FROM chats WHERE user_id = ?1 AND archived_at IS NULL
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![user_id],
                Self::row_to_session,
            )
            .optional()?)
    }

    fn reactivate_for_message(&self, user_id: UserId, session_id: &str) -> Result<MessageGate> {
        let now = now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut session) = Self::load_for_user(&tx, user_id, session_id)? else {
            return Ok(MessageGate::Missing);
        };

        let gate = match session.state() {
            SessionState::Archived => MessageGate::Archived,
            SessionState::Active => MessageGate::Active(session),
            SessionState::Finished => {
                tx.execute(
                    "UPDATE chats SET finished_at = NULL, updated_at = ?1 WHERE id = ?2",
                    params![now, session.id],
                )?;
                debug!("Reactivated finished chat {}", session_id);
                session.finished_at = None;
                session.updated_at = now;
                MessageGate::Reactivated(session)
            }
        };
        tx.commit()?;
        Ok(gate)
    }

    fn finalize_if_active(&self, user_id: UserId, session_id: &str) -> Result<FinalizeOutcome> {
        let now = now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(session) = Self::load_for_user(&tx, user_id, session_id)? else {
            bail!("Chat {} of user {} not found", session_id, user_id);
        };

        let outcome = match session.state() {
            SessionState::Archived => FinalizeOutcome::AlreadyArchived,
            SessionState::Finished => FinalizeOutcome::AlreadyFinished,
            SessionState::Active => {
                tx.execute(
                    "UPDATE chats SET finished_at = ?1, updated_at = ?1 WHERE id = ?2",
                    params![now, session.id],
                )?;
                FinalizeOutcome::Finalized
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn archive(&self, user_id: UserId, session_id: &str) -> Result<ArchiveOutcome> {
        let now = now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(session) = Self::load_for_user(&tx, user_id, session_id)? else {
            return Ok(ArchiveOutcome::Missing);
        };
        if session.state() == SessionState::Archived {
            return Ok(ArchiveOutcome::AlreadyArchived(session));
        }

        let finished_at = session.finished_at.unwrap_or(now);
        let chat_duration = (finished_at - session.created_at).max(0);
        tx.execute(
            "UPDATE chats SET finished_at = ?1, archived_at = ?2, chat_duration = ?3, updated_at = ?2
             WHERE id = ?4",
            params![finished_at, now, chat_duration, session.id],
        )?;
        let archived = Self::load(&tx, session_id)?.context("Archived chat session vanished")?;
        tx.commit()?;
        Ok(ArchiveOutcome::Archived(archived))
    }

    fn append_history(&self, session_id: &str, messages: &[ChatMessage]) -> Result<()> {
        let now = now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(session) = Self::load(&tx, session_id)? else {
            bail!("Chat {} not found", session_id);
        };

        {
            let mut stmt = tx.prepare(
                "INSERT INTO chat_histories (chat_id, message_id, role, content, metadata, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for message in messages {
                let metadata = serde_json::to_string(&message.metadata)?;
                stmt.execute(params![
                    session.id,
                    message.id,
                    message.role.as_str(),
                    message.content,
                    metadata,
                    now
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT h.message_id, h.role, h.content, h.metadata
             FROM chat_histories h JOIN chats c ON c.id = h.chat_id
             WHERE c.session_id = ?1
             ORDER BY h.inserted_at ASC, h.id ASC",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut messages = Vec::with_capacity(rows.len());
        for (id, role, content, metadata) in rows {
            let Some(role) = MessageRole::from_str(&role) else {
                warn!("Skipping history message {} with unknown role {}", id, role);
                continue;
            };
            let metadata: Map<String, Value> = serde_json::from_str(&metadata).unwrap_or_default();
            messages.push(ChatMessage {
                conversation_id: session_id.to_string(),
                id,
                role,
                content,
                metadata,
            });
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn create_then_read_back() {
        let store = SqliteChatStore::in_memory().unwrap();
        let created = store.create_session(1, "s1").unwrap();

        assert_eq!(created.session_id, "s1");
        assert_eq!(created.state(), SessionState::Active);
        assert_eq!(created.started_date.len(), 10);
        assert!(created.user_timezone.starts_with('+') || created.user_timezone.starts_with('-'));

        assert_eq!(store.get_session("s1").unwrap(), Some(created.clone()));
        assert_eq!(store.get_user_session(1, "s1").unwrap(), Some(created));
        assert!(store.get_user_session(2, "s1").unwrap().is_none());
        assert!(store.get_session("other").unwrap().is_none());
    }

    #[test]
    fn duplicate_session_id_is_rejected() {
        let store = SqliteChatStore::in_memory().unwrap();
        store.create_session(1, "s1").unwrap();
        assert!(store.create_session(2, "s1").is_err());
    }

    #[test]
    fn latest_open_session_skips_archived_and_other_users() {
        let store = SqliteChatStore::in_memory().unwrap();
        store.create_session(1, "old").unwrap();
        store.create_session(1, "new").unwrap();
        store.create_session(2, "foreign").unwrap();

        assert_eq!(
            store.latest_open_session(1).unwrap().unwrap().session_id,
            "new"
        );

        store.archive(1, "new").unwrap();
        assert_eq!(
            store.latest_open_session(1).unwrap().unwrap().session_id,
            "old"
        );

        store.archive(1, "old").unwrap();
        assert!(store.latest_open_session(1).unwrap().is_none());
    }

    #[test]
    fn gate_reactivates_finished_session() {
        let store = SqliteChatStore::in_memory().unwrap();
        store.create_session(1, "s1").unwrap();
        store.finalize_if_active(1, "s1").unwrap();

        match store.reactivate_for_message(1, "s1").unwrap() {
            MessageGate::Reactivated(session) => assert!(session.finished_at.is_none()),
            other => panic!("unexpected gate {:?}", other),
        }
        let stored = store.get_session("s1").unwrap().unwrap();
        assert_eq!(stored.state(), SessionState::Active);

        assert!(matches!(
            store.reactivate_for_message(1, "s1").unwrap(),
            MessageGate::Active(_)
        ));
    }

    #[test]
    fn gate_leaves_archived_session_untouched() {
        let store = SqliteChatStore::in_memory().unwrap();
        store.create_session(1, "s1").unwrap();
        store.archive(1, "s1").unwrap();
        let before = store.get_session("s1").unwrap().unwrap();

        assert_eq!(
            store.reactivate_for_message(1, "s1").unwrap(),
            MessageGate::Archived
        );
        assert_eq!(store.get_session("s1").unwrap().unwrap(), before);
    }

    #[test]
    fn gate_reports_missing_for_foreign_session() {
        let store = SqliteChatStore::in_memory().unwrap();
        store.create_session(1, "s1").unwrap();
        assert_eq!(
            store.reactivate_for_message(2, "s1").unwrap(),
            MessageGate::Missing
        );
    }

    #[test]
    fn finalize_is_idempotent() {
        let store = SqliteChatStore::in_memory().unwrap();
        store.create_session(1, "s1").unwrap();

        assert_eq!(
            store.finalize_if_active(1, "s1").unwrap(),
            FinalizeOutcome::Finalized
        );
        let finished_at = store.get_session("s1").unwrap().unwrap().finished_at;
        assert!(finished_at.is_some());

        assert_eq!(
            store.finalize_if_active(1, "s1").unwrap(),
            FinalizeOutcome::AlreadyFinished
        );
        assert_eq!(
            store.get_session("s1").unwrap().unwrap().finished_at,
            finished_at
        );

        store.archive(1, "s1").unwrap();
        assert_eq!(
            store.finalize_if_active(1, "s1").unwrap(),
            FinalizeOutcome::AlreadyArchived
        );
    }

    #[test]
    fn finalize_missing_session_is_error() {
        let store = SqliteChatStore::in_memory().unwrap();
        assert!(store.finalize_if_active(1, "nope").is_err());
    }

    #[test]
    fn archive_finishes_and_records_duration() {
        let store = SqliteChatStore::in_memory().unwrap();
        store.create_session(1, "s1").unwrap();
        store.set_timestamps("s1", 1_000, Some(1_600)).unwrap();

        let ArchiveOutcome::Archived(archived) = store.archive(1, "s1").unwrap() else {
            panic!("expected archive");
        };
        assert_eq!(archived.state(), SessionState::Archived);
        assert_eq!(archived.finished_at, Some(1_600));
        assert_eq!(archived.chat_duration, Some(600));

        assert!(matches!(
            store.archive(1, "s1").unwrap(),
            ArchiveOutcome::AlreadyArchived(_)
        ));
        assert_eq!(store.archive(1, "nope").unwrap(), ArchiveOutcome::Missing);
    }

    #[test]
    fn archive_of_active_session_sets_finished_at() {
        let store = SqliteChatStore::in_memory().unwrap();
        store.create_session(1, "s1").unwrap();

        let ArchiveOutcome::Archived(archived) = store.archive(1, "s1").unwrap() else {
            panic!("expected archive");
        };
        assert!(archived.finished_at.is_some());
        assert!(archived.archived_at.is_some());
        assert!(archived.chat_duration.unwrap() >= 0);
    }

    #[test]
    fn history_round_trips_in_order() {
        let store = SqliteChatStore::in_memory().unwrap();
        store.create_session(1, "s1").unwrap();

        let mut reply = ChatMessage::assistant("s1", "m2", "hello back");
        reply
            .metadata
            .insert("model".to_string(), Value::String("test".to_string()));
        store
            .append_history("s1", &[ChatMessage::user("s1", "m1", "hello"), reply.clone()])
            .unwrap();
        store
            .append_history("s1", &[ChatMessage::user("s1", "m3", "again")])
            .unwrap();

        let history = store.history("s1").unwrap();
        let ids: Vec<_> = history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(history[1], reply);
        assert!(store.history("other").unwrap().is_empty());
    }

    #[test]
    fn history_for_unknown_session_is_rejected() {
        let store = SqliteChatStore::in_memory().unwrap();
        assert!(store
            .append_history("nope", &[ChatMessage::user("nope", "m1", "hi")])
            .is_err());
    }

    #[test]
    fn message_and_finalizer_race_never_loses_an_update() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chat.db");
        let setup = SqliteChatStore::new(&path).unwrap();
        setup.create_session(1, "s1").unwrap();

        for _ in 0..20 {
            setup.set_timestamps("s1", 0, None).unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let message = {
                let barrier = barrier.clone();
                let store = SqliteChatStore::new(&path).unwrap();
                thread::spawn(move || {
                    barrier.wait();
                    store.reactivate_for_message(1, "s1").unwrap()
                })
            };
            let finalizer = {
                let barrier = barrier.clone();
                let store = SqliteChatStore::new(&path).unwrap();
                thread::spawn(move || {
                    barrier.wait();
                    store.finalize_if_active(1, "s1").unwrap()
                })
            };
            let gate = message.join().unwrap();
            assert_eq!(finalizer.join().unwrap(), FinalizeOutcome::Finalized);

            // Whichever ran last decides the final state.
            let state = setup.get_session("s1").unwrap().unwrap().state();
            match gate {
                MessageGate::Active(_) => assert_eq!(state, SessionState::Finished),
                MessageGate::Reactivated(_) => assert_eq!(state, SessionState::Active),
                other => panic!("unexpected gate {:?}", other),
            }
        }
    }
}
