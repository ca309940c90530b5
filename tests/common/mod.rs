//! Common test infrastructure
//!
//! This module provides all the infrastructure needed for end-to-end tests.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{TestServer, ChatClient, NOTIFY_NEW_CONVERSATION};
//!
//! #[tokio::test]
//! async fn test_connect() {
//!     let server = TestServer::spawn().await;
//!     let mut chat = ChatClient::connect(&server, None).await;
//!
//!     let greeting = chat.next_frame().await.unwrap();
//!     assert_eq!(greeting["payload"], NOTIFY_NEW_CONVERSATION);
//! }
//! ```

mod client;
mod constants;
mod engine;
mod server;

// Public API - this is what tests import
pub use client::{ChatClient, ClientFrame, TestClient};
pub use constants::*;
#[allow(unused_imports)]
pub use engine::ScriptedEngine;
pub use server::TestServer;
