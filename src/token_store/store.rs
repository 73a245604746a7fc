use crate::domain_model::*;
use crate::domain_port::*;
use crate::token_store::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Extra lifetime of a family index over its newest member.
pub const FAMILY_GRACE: Duration = Duration::from_secs(15 * 60);
/// Extra lifetime of a user's family index over its newest refresh token.
pub const USER_FAMILIES_GRACE: Duration = Duration::from_secs(24 * 60 * 60);
/// Page size for index scans.
pub const SCAN_BATCH: usize = 100;

/// State shared between the public store and its health monitor.
pub(crate) struct StoreCore {
    pub(crate) keys: KeyLayout,
    pub(crate) cache: LocalCache,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) health: RemoteHealth,
    pub(crate) pending: PendingSync,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: TokenStoreConfig,
    pub(crate) drain_lock: tokio::sync::Mutex<()>,
}

/// Two-tier token store: a local cache in front of the shared remote store.
///
/// Writes land in the cache first and are pushed to the remote store when it
/// is reachable; otherwise the key is parked in the pending-sync queue and
/// pushed once the health monitor sees the remote store again. Reads that the
/// cache cannot answer while the remote store is down fail with
/// `Unavailable`.
///
/// Must be constructed inside a Tokio runtime; the health monitor is spawned
/// immediately.
pub struct TieredTokenStore {
    core: Arc<StoreCore>,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl TieredTokenStore {
    pub fn new(remote: Arc<dyn RemoteStore>, clock: Arc<dyn Clock>, config: TokenStoreConfig) -> Self {
        let config = config.normalized();
        let core = Arc::new(StoreCore {
            keys: KeyLayout::new(config.key_prefix.clone()),
            cache: LocalCache::new(config.cache_max_cost, clock.clone()),
            remote,
            health: RemoteHealth::default(),
            pending: PendingSync::new(config.pending_sync_max),
            clock,
            config,
            drain_lock: tokio::sync::Mutex::new(()),
        });

        let cancel = CancellationToken::new();
        let monitor = HealthMonitor::new(core.clone(), cancel.clone());
        let monitor_handle = tokio::spawn(async move {
            monitor.run().await;
        });

        info!(
            prefix = core.keys.prefix(),
            health_period = ?core.config.health_period,
            "token store started"
        );

        Self {
            core,
            monitor_handle: Mutex::new(Some(monitor_handle)),
            cancel,
        }
    }

    pub fn remote_state(&self) -> RemoteState {
        self.core.health.state()
    }

    pub fn pending_len(&self) -> usize {
        self.core.pending.len()
    }

    pub fn config(&self) -> &TokenStoreConfig {
        &self.core.config
    }

    /// Runs one health-monitor tick now.
    pub async fn check_health(&self) -> RemoteState {
        self.core.check_health(&self.cancel).await
    }

    /// Pushes pending keys to the remote store if it is up.
    pub async fn drain_pending(&self, cx: &OpContext) -> DrainReport {
        self.core.drain(cx).await
    }
}

impl StoreCore {
    /// Classifies a remote failure, flipping the remote state when the store
    /// itself failed.
    pub(crate) fn remote_failure(&self, e: RemoteError) -> TokenStoreError {
        if e.is_transient() {
            self.health.mark_down(&e.to_string());
        }
        TokenStoreError::Unavailable(e.to_string())
    }

    fn remote_down() -> TokenStoreError {
        TokenStoreError::Unavailable("remote store is down".to_string())
    }

    pub(crate) fn refresh_batch(
        &self,
        record: &RefreshTokenRecord,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Vec<RemoteOp> {
        let mut batch = vec![RemoteOp::SetEx {
            key: self.keys.refresh(&record.token_id),
            value,
            ttl,
        }];
        if record.is_grouped() {
            let family_key = self.keys.family(&record.family_id);
            let user_key = self.keys.user_families(record.user_id);
            batch.push(RemoteOp::SetAdd {
                key: family_key.clone(),
                member: record.token_id.clone(),
            });
            batch.push(RemoteOp::Expire {
                key: family_key,
                ttl: ttl + FAMILY_GRACE,
            });
            batch.push(RemoteOp::SetAdd {
                key: user_key.clone(),
                member: record.family_id.clone(),
            });
            batch.push(RemoteOp::Expire {
                key: user_key,
                ttl: ttl + USER_FAMILIES_GRACE,
            });
        }
        batch
    }

    /// Down path shared by both write operations.
    fn defer(&self, key: &str, cached: bool) -> TokenStoreResult<()> {
        if !cached {
            return Err(TokenStoreError::Internal(
                "local cache rejected the write and the remote store is down".to_string(),
            ));
        }
        if let Err(e) = self.pending.enqueue(key) {
            warn!(key, pending = self.pending.len(), "pending sync queue full, refusing write");
            self.cache.del(key);
            return Err(e);
        }
        debug!(key, "write parked for sync");
        Ok(())
    }

    fn ttl_or(&self, ttl: Duration, default: Duration) -> Duration {
        if ttl.is_zero() { default } else { ttl }
    }

    pub(crate) async fn store_refresh_token(
        &self,
        cx: &OpContext,
        token_id: &str,
        family_id: &str,
        user_id: UserId,
        ttl: Duration,
    ) -> TokenStoreResult<()> {
        let ttl = self.ttl_or(ttl, self.config.refresh_default_ttl);
        let lifetime =
            chrono::Duration::from_std(ttl).map_err(|e| TokenStoreError::Internal(e.to_string()))?;
        let record = RefreshTokenRecord::new(token_id, family_id, user_id, self.clock.now() + lifetime);
        let value = record
            .encode()
            .map_err(|e| TokenStoreError::Internal(e.to_string()))?;
        let key = self.keys.refresh(token_id);
        let cached = self.cache.set(&key, value.clone(), value.len() as u64, ttl);

        if self.health.is_up() {
            let batch = self.refresh_batch(&record, value, ttl);
            match self.remote.pipelined(cx, &batch).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    self.remote_failure(e);
                }
                Err(e) => {
                    // The caller gave up; leave no local trace of a token it
                    // will never hand out.
                    self.cache.del(&key);
                    return Err(self.remote_failure(e));
                }
            }
        }

        self.defer(&key, cached)
    }

    /// Reads a refresh record through the cache. `NotFound` when the remote
    /// store has no record or this node holds a local invalidation.
    async fn load_refresh(&self, cx: &OpContext, key: &str) -> TokenStoreResult<RefreshTokenRecord> {
        if let Some(bytes) = self.cache.get(key) {
            if bytes == INVALIDATED_MARKER {
                return Err(TokenStoreError::NotFound);
            }
            return RefreshTokenRecord::decode(&bytes)
                .map_err(|e| TokenStoreError::Internal(e.to_string()));
        }

        if !self.health.is_up() {
            return Err(Self::remote_down());
        }

        let bytes = self
            .remote
            .get_bytes(cx, key)
            .await
            .map_err(|e| self.remote_failure(e))?
            .ok_or(TokenStoreError::NotFound)?;
        let record =
            RefreshTokenRecord::decode(&bytes).map_err(|e| TokenStoreError::Internal(e.to_string()))?;
        if let Some(ttl) = record.remaining_ttl(self.clock.now()) {
            // Never replaces an entry written meanwhile, a local
            // invalidation included.
            let cost = bytes.len() as u64;
            self.cache.set_if_absent(key, bytes, cost, ttl);
        }
        Ok(record)
    }

    pub(crate) async fn is_refresh_token_valid(
        &self,
        cx: &OpContext,
        token_id: &str,
        family_id: &str,
    ) -> TokenStoreResult<bool> {
        let key = self.keys.refresh(token_id);
        match self.load_refresh(cx, &key).await {
            Ok(record) => Ok(record.is_valid_for(family_id, self.clock.now())),
            Err(TokenStoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn invalidate_refresh_token(
        &self,
        cx: &OpContext,
        token_id: &str,
    ) -> TokenStoreResult<()> {
        let key = self.keys.refresh(token_id);
        let ttl = self
            .cache
            .get_ttl(&key)
            .unwrap_or(self.config.refresh_default_ttl);
        self.cache.force_set(
            &key,
            INVALIDATED_MARKER.to_vec(),
            INVALIDATED_MARKER.len() as u64,
            ttl,
        );

        if !self.health.is_up() {
            return Err(Self::remote_down());
        }

        // A drain may be pushing the parked record right now; flip it only
        // after that write has landed. Whatever is still parked is never
        // replayed.
        let _drain_guard = if self.pending.contains(&key) {
            let guard = self.drain_lock.lock().await;
            self.pending.remove_all(std::slice::from_ref(&key));
            Some(guard)
        } else {
            None
        };

        let status = self
            .remote
            .eval(cx, StoreScript::InvalidateRefresh, &[key], &[])
            .await
            .map_err(|e| self.remote_failure(e))?;
        match status {
            INVALIDATE_MISSING => debug!(token_id, "refresh token already gone"),
            INVALIDATE_ALREADY => debug!(token_id, "refresh token already invalid"),
            _ => debug!(token_id, "refresh token invalidated"),
        }
        Ok(())
    }

    /// Pushes parked writes first so index scans see every member.
    async fn settle_pending(&self, cx: &OpContext) -> TokenStoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let report = self.drain(cx).await;
        if report.failed {
            return Err(Self::remote_down());
        }
        Ok(())
    }

    /// Visits every member of the set at `key`, page by page. Returns how
    /// many members were skipped because the remote store was unavailable.
    async fn sweep_index<'a, F, Fut>(
        &'a self,
        cx: &'a OpContext,
        key: &str,
        mut visit: F,
    ) -> TokenStoreResult<usize>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = TokenStoreResult<()>> + 'a,
    {
        let mut skipped = 0;
        let mut cursor = 0;
        loop {
            let (members, next) = self
                .remote
                .set_scan(cx, key, cursor, SCAN_BATCH)
                .await
                .map_err(|e| self.remote_failure(e))?;
            for member in members {
                match visit(member.clone()).await {
                    Ok(()) => {}
                    Err(TokenStoreError::Unavailable(reason)) => {
                        warn!(index = key, %member, %reason, "skipping member, store unavailable");
                        skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            if next == 0 {
                return Ok(skipped);
            }
            cursor = next;
        }
    }

    fn finish_sweep(&self, what: &str, skipped: usize) -> TokenStoreResult<()> {
        if skipped > 0 && !self.health.is_up() {
            return Err(TokenStoreError::Unavailable(format!(
                "{skipped} {what} could not be invalidated"
            )));
        }
        Ok(())
    }

    pub(crate) async fn invalidate_by_family(
        &self,
        cx: &OpContext,
        family_id: &str,
    ) -> TokenStoreResult<()> {
        if family_id.is_empty() {
            debug!("ungrouped tokens have no family index");
            return Ok(());
        }
        if !self.health.is_up() {
            return Err(Self::remote_down());
        }
        self.settle_pending(cx).await?;

        let key = self.keys.family(family_id);
        let skipped = self
            .sweep_index(cx, &key, |token_id| async move {
                self.invalidate_refresh_token(cx, &token_id).await
            })
            .await?;
        info!(family_id, skipped, "refresh token family invalidated");
        self.finish_sweep("tokens", skipped)
    }

    pub(crate) async fn invalidate_by_user(
        &self,
        cx: &OpContext,
        user_id: UserId,
    ) -> TokenStoreResult<()> {
        if !self.health.is_up() {
            return Err(Self::remote_down());
        }
        self.settle_pending(cx).await?;

        let key = self.keys.user_families(user_id);
        let skipped = self
            .sweep_index(cx, &key, |family_id| async move {
                self.invalidate_by_family(cx, &family_id).await
            })
            .await?;
        info!(%user_id, skipped, "refresh tokens of user invalidated");
        self.finish_sweep("families", skipped)
    }

    pub(crate) async fn revoke_access_token(
        &self,
        cx: &OpContext,
        token_id: &str,
        ttl: Duration,
    ) -> TokenStoreResult<()> {
        let ttl = self.ttl_or(ttl, self.config.access_default_ttl);
        let key = self.keys.access(token_id);

        if !self.health.is_up() && self.cache.get(&key).is_some() {
            return Err(TokenStoreError::AlreadyRevoked);
        }
        let cached = self
            .cache
            .set(&key, REVOCATION_MARKER.to_vec(), REVOCATION_MARKER.len() as u64, ttl);

        if self.health.is_up() {
            match self.remote.set_nx_ex(cx, &key, REVOCATION_MARKER, ttl).await {
                Ok(true) => return Ok(()),
                Ok(false) => return Err(TokenStoreError::AlreadyRevoked),
                Err(e) if e.is_transient() => {
                    self.remote_failure(e);
                }
                Err(e) => {
                    // A revocation is safe to keep locally; park it so it
                    // still reaches the remote store.
                    if cached {
                        if let Err(full) = self.pending.enqueue(&key) {
                            warn!(key, error = %e, "pending sync queue full, revocation kept locally only");
                            self.remote_failure(e);
                            return Err(full);
                        }
                    }
                    return Err(self.remote_failure(e));
                }
            }
        }

        self.defer(&key, cached)
    }

    pub(crate) async fn is_access_token_revoked(
        &self,
        cx: &OpContext,
        token_id: &str,
    ) -> TokenStoreResult<bool> {
        let key = self.keys.access(token_id);
        if self.cache.get(&key).is_some() {
            return Ok(true);
        }

        if !self.health.is_up() {
            return Err(Self::remote_down());
        }

        let present = self
            .remote
            .exists(cx, &key)
            .await
            .map_err(|e| self.remote_failure(e))?;
        if !present {
            return Ok(false);
        }

        match self.remote.ttl(cx, &key).await {
            Ok(Some(ttl)) => {
                self.cache.set_if_absent(
                    &key,
                    REVOCATION_MARKER.to_vec(),
                    REVOCATION_MARKER.len() as u64,
                    ttl,
                );
            }
            Ok(None) => {}
            Err(e) => {
                // Presence is already known; only the backfill is lost.
                let _ = self.remote_failure(e);
            }
        }
        Ok(true)
    }
}

#[async_trait::async_trait]
impl TokenStore for TieredTokenStore {
    async fn store_refresh_token(
        &self,
        cx: &OpContext,
        token_id: &str,
        family_id: &str,
        user_id: UserId,
        ttl: Duration,
    ) -> TokenStoreResult<()> {
        self.core
            .store_refresh_token(cx, token_id, family_id, user_id, ttl)
            .await
    }

    async fn is_refresh_token_valid(
        &self,
        cx: &OpContext,
        token_id: &str,
        family_id: &str,
    ) -> TokenStoreResult<bool> {
        self.core.is_refresh_token_valid(cx, token_id, family_id).await
    }

    async fn invalidate_refresh_token(
        &self,
        cx: &OpContext,
        token_id: &str,
    ) -> TokenStoreResult<()> {
        self.core.invalidate_refresh_token(cx, token_id).await
    }

    async fn invalidate_refresh_token_by_family_id(
        &self,
        cx: &OpContext,
        family_id: &str,
    ) -> TokenStoreResult<()> {
        self.core.invalidate_by_family(cx, family_id).await
    }

    async fn invalidate_refresh_token_by_user_id(
        &self,
        cx: &OpContext,
        user_id: UserId,
    ) -> TokenStoreResult<()> {
        self.core.invalidate_by_user(cx, user_id).await
    }

    async fn revoke_access_token(
        &self,
        cx: &OpContext,
        token_id: &str,
        ttl: Duration,
    ) -> TokenStoreResult<()> {
        self.core.revoke_access_token(cx, token_id, ttl).await
    }

    async fn is_access_token_revoked(
        &self,
        cx: &OpContext,
        token_id: &str,
    ) -> TokenStoreResult<bool> {
        self.core.is_access_token_revoked(cx, token_id).await
    }

    async fn close(&self) {
        self.cancel.cancel();
        let handle = match self.monitor_handle.lock() {
            Ok(mut lock) => lock.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let r = handle.await;
            info!("health monitor stopped: {:?}", r);
        }
    }
}

impl Drop for TieredTokenStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
