//! Websocket transport for the chat protocol.
//!
//! One connection drives one chat session: Connect once after the upgrade, then a
//! Message, Ping or Close per inbound frame, strictly in order.

pub mod connection;
pub mod handler;
pub mod messages;

pub use connection::ConnectionRegistry;
pub use handler::chat_ws_handler;
