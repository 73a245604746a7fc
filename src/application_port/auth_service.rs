use crate::domain_model::{FamilyId, OpContext, TokenId, UserId};
use crate::domain_port::TokenStoreError;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("token invalid")]
    TokenInvalid,
    #[error("token expired")]
    TokenExpired,
    #[error("token revoked")]
    TokenRevoked,
    #[error("token not found")]
    TokenNotFound,
    #[error("token store unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl AuthError {
    /// HTTP-equivalent status of the denial.
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::TokenInvalid
            | AuthError::TokenExpired
            | AuthError::TokenRevoked
            | AuthError::TokenNotFound => 401,
            AuthError::Unavailable(_) | AuthError::InternalError(_) => 503,
        }
    }
}

impl From<TokenStoreError> for AuthError {
    fn from(e: TokenStoreError) -> Self {
        match e {
            TokenStoreError::NotFound => AuthError::TokenNotFound,
            TokenStoreError::AlreadyRevoked => AuthError::TokenRevoked,
            TokenStoreError::Unavailable(_) | TokenStoreError::CapacityExceeded(_) => {
                AuthError::Unavailable(e.to_string())
            }
            TokenStoreError::Internal(reason) => AuthError::InternalError(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessToken(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshToken(pub String);

#[derive(Debug, Clone, Serialize)]
pub struct AuthTokens {
    pub access_token: AccessToken,
    pub refresh_token: RefreshToken,
    pub access_token_expires_at: DateTime<Utc>,
    pub refresh_token_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TokenVerifyResult {
    pub user_id: UserId,
    pub jti: TokenId,
    /// Present on refresh tokens only.
    pub family_id: Option<FamilyId>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait TokenCodec: Send + Sync {
    async fn issue_access_token(
        &self,
        user: UserId,
        jti: TokenId,
    ) -> Result<(AccessToken, DateTime<Utc>), AuthError>;
    async fn issue_refresh_token(
        &self,
        user: UserId,
        jti: TokenId,
        family_id: FamilyId,
    ) -> Result<(RefreshToken, DateTime<Utc>), AuthError>;
    async fn verify_access_token(
        &self,
        token: &AccessToken,
    ) -> Result<TokenVerifyResult, AuthError>;
    async fn verify_refresh_token(
        &self,
        token: &RefreshToken,
    ) -> Result<TokenVerifyResult, AuthError>;
}

/// Session lifecycle on top of the token store: issuing, rotating and
/// revoking token pairs, and gating requests on revocation state.
#[async_trait::async_trait]
pub trait AuthService: Send + Sync {
    async fn login(&self, cx: &OpContext, user_id: UserId) -> Result<AuthTokens, AuthError>;
    async fn refresh(&self, cx: &OpContext, refresh_token: &str) -> Result<AuthTokens, AuthError>;
    async fn authenticate(&self, cx: &OpContext, access_token: &str) -> Result<UserId, AuthError>;
    async fn logout(
        &self,
        cx: &OpContext,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<(), AuthError>;
    async fn logout_everywhere(&self, cx: &OpContext, user_id: UserId) -> Result<(), AuthError>;
}
