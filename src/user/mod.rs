pub mod auth;
mod sqlite_user_store;
mod user_store;

pub type UserId = i64;

pub use auth::{AuthToken, AuthTokenValue};
pub use sqlite_user_store::SqliteUserStore;
pub use user_store::UserStore;
