pub mod finalizer;
pub mod history;
pub mod models;
pub mod protocol;
pub mod reply;
mod schema;
pub mod store;

pub use finalizer::{FinalizeParams, SessionFinalizer, CHAT_JOB_TYPE};
pub use history::ChatHistoryManager;
pub use models::{ArchiveOutcome, ChatSession, FinalizeOutcome, MessageGate, SessionState};
pub use protocol::{
    ChatProtocol, ChatSettings, ConnectRequest, MessageRequest, PingRequest, ProtocolError,
    ProtocolResponse, ResponseAction,
};
pub use store::{ChatStateGateway, SqliteChatStore};
