use crate::domain_model::*;
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct Tables {
    refresh: HashMap<String, RefreshTokenRecord>,
    families: HashMap<String, HashSet<String>>,
    user_families: HashMap<UserId, HashSet<String>>,
    revoked: HashMap<String, DateTime<Utc>>,
}

/// Single-tier store with the same contract as `TieredTokenStore`, for tests
/// of code that only consumes `TokenStore`.
pub struct InMemoryTokenStore {
    tables: Mutex<Tables>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTokenStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expires_at(&self, ttl: Duration) -> TokenStoreResult<DateTime<Utc>> {
        let ttl =
            chrono::Duration::from_std(ttl).map_err(|e| TokenStoreError::Internal(e.to_string()))?;
        Ok(self.clock.now() + ttl)
    }

    fn family_members(&self, family_id: &str) -> Vec<String> {
        self.lock()
            .families
            .get(family_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn store_refresh_token(
        &self,
        _cx: &OpContext,
        token_id: &str,
        family_id: &str,
        user_id: UserId,
        ttl: Duration,
    ) -> TokenStoreResult<()> {
        let record = RefreshTokenRecord::new(token_id, family_id, user_id, self.expires_at(ttl)?);
        let mut tables = self.lock();
        if record.is_grouped() {
            tables
                .families
                .entry(family_id.to_string())
                .or_default()
                .insert(token_id.to_string());
            tables
                .user_families
                .entry(user_id)
                .or_default()
                .insert(family_id.to_string());
        }
        tables.refresh.insert(token_id.to_string(), record);
        Ok(())
    }

    async fn is_refresh_token_valid(
        &self,
        _cx: &OpContext,
        token_id: &str,
        family_id: &str,
    ) -> TokenStoreResult<bool> {
        let now = self.clock.now();
        Ok(self
            .lock()
            .refresh
            .get(token_id)
            .is_some_and(|r| r.is_valid_for(family_id, now)))
    }

    async fn invalidate_refresh_token(
        &self,
        _cx: &OpContext,
        token_id: &str,
    ) -> TokenStoreResult<()> {
        if let Some(record) = self.lock().refresh.get_mut(token_id) {
            record.valid = false;
        }
        Ok(())
    }

    async fn invalidate_refresh_token_by_family_id(
        &self,
        cx: &OpContext,
        family_id: &str,
    ) -> TokenStoreResult<()> {
        for token_id in self.family_members(family_id) {
            self.invalidate_refresh_token(cx, &token_id).await?;
        }
        Ok(())
    }

    async fn invalidate_refresh_token_by_user_id(
        &self,
        cx: &OpContext,
        user_id: UserId,
    ) -> TokenStoreResult<()> {
        let families: Vec<String> = self
            .lock()
            .user_families
            .get(&user_id)
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default();
        for family_id in families {
            self.invalidate_refresh_token_by_family_id(cx, &family_id)
                .await?;
        }
        Ok(())
    }

    async fn revoke_access_token(
        &self,
        _cx: &OpContext,
        token_id: &str,
        ttl: Duration,
    ) -> TokenStoreResult<()> {
        let now = self.clock.now();
        let expires_at = self.expires_at(ttl)?;
        let mut tables = self.lock();
        if tables.revoked.get(token_id).is_some_and(|at| *at > now) {
            return Err(TokenStoreError::AlreadyRevoked);
        }
        tables.revoked.insert(token_id.to_string(), expires_at);
        Ok(())
    }

    async fn is_access_token_revoked(
        &self,
        _cx: &OpContext,
        token_id: &str,
    ) -> TokenStoreResult<bool> {
        let now = self.clock.now();
        Ok(self.lock().revoked.get(token_id).is_some_and(|at| *at > now))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn honors_the_token_store_contract() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryTokenStore::new(clock.clone());
        let cx = OpContext::background();
        let hour = Duration::from_secs(3600);

        store.store_refresh_token(&cx, "t1", "f1", UserId(1), hour).await.unwrap();
        store.store_refresh_token(&cx, "t2", "f2", UserId(1), hour).await.unwrap();
        assert!(store.is_refresh_token_valid(&cx, "t1", "f1").await.unwrap());
        assert!(!store.is_refresh_token_valid(&cx, "t1", "f2").await.unwrap());

        store.invalidate_refresh_token_by_user_id(&cx, UserId(1)).await.unwrap();
        assert!(!store.is_refresh_token_valid(&cx, "t1", "").await.unwrap());
        assert!(!store.is_refresh_token_valid(&cx, "t2", "").await.unwrap());

        store.revoke_access_token(&cx, "a", hour).await.unwrap();
        assert_eq!(
            store.revoke_access_token(&cx, "a", hour).await,
            Err(TokenStoreError::AlreadyRevoked)
        );
        clock.advance(hour);
        assert!(!store.is_access_token_revoked(&cx, "a").await.unwrap());
    }
}
