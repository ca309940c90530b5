use super::auth::{AuthToken, AuthTokenValue};
use super::UserId;
use anyhow::Result;

pub trait UserStore: Send + Sync {
    /// Creates a new user and returns the user id.
    fn create_user(&self, user_handle: &str) -> Result<UserId>;

    /// Returns Ok(None) if no user has this handle.
    fn get_user_id(&self, user_handle: &str) -> Result<Option<UserId>>;

    fn user_exists(&self, user_id: UserId) -> Result<bool>;

    /// Issues and stores a fresh token for `user_id`.
    fn create_auth_token(&self, user_id: UserId) -> Result<AuthToken>;

    /// Returns Ok(None) if the token does not exist.
    fn get_auth_token(&self, value: &AuthTokenValue) -> Result<Option<AuthToken>>;

    fn touch_auth_token(&self, value: &AuthTokenValue) -> Result<()>;
}
