use crate::domain_model::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub type TokenId = String;

/// Groups the refresh tokens produced by successive rotations of one login.
/// The empty string means "ungrouped".
pub type FamilyId = String;

/// Value stored for a revoked access token; presence of the key is the signal.
pub const REVOCATION_MARKER: &[u8] = b"1";

/// Local placeholder left in the cache after a refresh token is invalidated.
pub const INVALIDATED_MARKER: &[u8] = b"0";

/// Whitelist entry for a refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub token_id: TokenId,
    pub family_id: FamilyId,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
    pub valid: bool,
}

impl RefreshTokenRecord {
    pub fn new(
        token_id: impl Into<TokenId>,
        family_id: impl Into<FamilyId>,
        user_id: UserId,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token_id: token_id.into(),
            family_id: family_id.into(),
            user_id,
            expires_at,
            valid: true,
        }
    }

    /// An empty `family_id` skips the family check.
    pub fn is_valid_for(&self, family_id: &str, now: DateTime<Utc>) -> bool {
        self.valid && (family_id.is_empty() || self.family_id == family_id) && now < self.expires_at
    }

    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        remaining_until(self.expires_at, now)
    }

    pub fn is_grouped(&self) -> bool {
        !self.family_id.is_empty()
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Blacklist entry for an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRevocation {
    pub token_id: TokenId,
    pub expires_at: DateTime<Utc>,
}

impl AccessRevocation {
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        remaining_until(self.expires_at, now)
    }
}

/// Time left until `until`, or `None` once it has passed.
pub fn remaining_until(until: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
    (until - now).to_std().ok().filter(|d| !d.is_zero())
}
