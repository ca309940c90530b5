//! Shared constants for end-to-end tests
//!
//! When test data or timings change, update only this file.

// ============================================================================
// Test Users
// ============================================================================

/// Handle of the user every test client authenticates as
pub const TEST_USER: &str = "testuser";

/// Handle of a second user, for ownership checks
pub const OTHER_USER: &str = "otheruser";

// ============================================================================
// Protocol payloads
// ============================================================================

pub const NOTIFY_NEW_CONVERSATION: &str = "new_conversation";
pub const NOTIFY_EXISTING_CONVERSATION: &str = "existing_conversation";
pub const NOTIFY_CONVERSATION_FINISHED: &str = "conversation_finished";
pub const NOTIFY_CONVERSATION_ARCHIVED: &str = "conversation_archived";

pub const ESCALATE_CRISIS_PAYLOAD: &str = r#"{"type":"action","data":"escalate_crisis"}"#;

/// Messages with this text make the scripted engine block the prompt
pub const BLOCKED_PROMPT: &str = "trigger a blocked prompt";

/// Messages with this text make the scripted engine reply with nothing
pub const EMPTY_REPLY_PROMPT: &str = "trigger an empty reply";

/// Messages with this text make the scripted engine reply with an unknown action
pub const INVALID_REPLY_PROMPT: &str = "trigger an invalid reply";

// ============================================================================
// Timeouts
// ============================================================================

/// Maximum time to wait for server to become ready (milliseconds)
pub const SERVER_READY_TIMEOUT_MS: u64 = 5000;

/// Polling interval when waiting for server ready (milliseconds)
pub const SERVER_READY_POLL_INTERVAL_MS: u64 = 10;

/// Default timeout for HTTP requests in tests (seconds)
pub const REQUEST_TIMEOUT_SECS: u64 = 5;

/// Maximum time to wait for a websocket frame (milliseconds)
pub const FRAME_TIMEOUT_MS: u64 = 3000;

/// Idle timeout of chats on the test server (seconds)
pub const IDLE_TIMEOUT_SECS: u64 = 2;

/// Scheduler cycle on the test server (milliseconds)
pub const SCHEDULE_CYCLE_MS: u64 = 100;
