use crate::domain_model::{OpContext, UserId};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenStoreError {
    #[error("token not found")]
    NotFound,
    #[error("token store unavailable: {0}")]
    Unavailable(String),
    #[error("access token already revoked")]
    AlreadyRevoked,
    #[error("pending sync queue is full ({0} keys)")]
    CapacityExceeded(usize),
    #[error("internal error: {0}")]
    Internal(String),
}

impl TokenStoreError {
    /// `CapacityExceeded` is a flavor of unavailability.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            TokenStoreError::Unavailable(_) | TokenStoreError::CapacityExceeded(_)
        )
    }
}

pub type TokenStoreResult<T> = Result<T, TokenStoreError>;

/// Whitelist for refresh tokens and blacklist for access tokens.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    async fn store_refresh_token(
        &self,
        cx: &OpContext,
        token_id: &str,
        family_id: &str,
        user_id: UserId,
        ttl: Duration,
    ) -> TokenStoreResult<()>;

    /// An empty `family_id` matches any family.
    async fn is_refresh_token_valid(
        &self,
        cx: &OpContext,
        token_id: &str,
        family_id: &str,
    ) -> TokenStoreResult<bool>;

    async fn invalidate_refresh_token(&self, cx: &OpContext, token_id: &str)
    -> TokenStoreResult<()>;

    async fn invalidate_refresh_token_by_family_id(
        &self,
        cx: &OpContext,
        family_id: &str,
    ) -> TokenStoreResult<()>;

    async fn invalidate_refresh_token_by_user_id(
        &self,
        cx: &OpContext,
        user_id: UserId,
    ) -> TokenStoreResult<()>;

    /// `AlreadyRevoked` when the token was revoked before.
    async fn revoke_access_token(
        &self,
        cx: &OpContext,
        token_id: &str,
        ttl: Duration,
    ) -> TokenStoreResult<()>;

    async fn is_access_token_revoked(&self, cx: &OpContext, token_id: &str)
    -> TokenStoreResult<bool>;

    async fn close(&self);
}
