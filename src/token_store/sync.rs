use crate::domain_model::{
    INVALIDATED_MARKER, OpContext, REVOCATION_MARKER, RecordKey, RefreshTokenRecord,
};
use crate::domain_port::{RemoteError, RemoteOp};
use crate::token_store::StoreCore;

/// Keys pushed per pipelined round trip.
pub const DRAIN_BATCH: usize = 100;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub pushed: usize,
    pub dropped: usize,
    pub remaining: usize,
    pub failed: bool,
}

impl StoreCore {
    /// Replays parked writes from the local cache into the remote store.
    ///
    /// Stops at the first failed batch; its keys and everything after it
    /// stay parked for the next recovery.
    pub(crate) async fn drain(&self, cx: &OpContext) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        if !self.health.is_up() {
            report.remaining = self.pending.len();
            report.failed = true;
            return report;
        }

        let keys = self.pending.snapshot();
        for chunk in keys.chunks(DRAIN_BATCH) {
            let mut batch = Vec::new();
            let mut pushed = 0;
            for key in chunk {
                match self.reconstruct(key) {
                    Some(ops) => {
                        batch.extend(ops);
                        pushed += 1;
                    }
                    None => report.dropped += 1,
                }
            }

            if !batch.is_empty() {
                let batch_cx = cx.with_timeout(self.config.health_ping_timeout);
                if let Err(e) = self.remote.pipelined(&batch_cx, &batch).await {
                    tracing::warn!(error = %e, "pending sync drain interrupted");
                    if !matches!(e, RemoteError::Cancelled) {
                        self.health.mark_down(&e.to_string());
                    }
                    report.failed = true;
                    break;
                }
            }
            self.pending.remove_all(chunk);
            report.pushed += pushed;
        }

        report.remaining = self.pending.len();
        if report.pushed > 0 || report.dropped > 0 || report.failed {
            tracing::info!(
                pushed = report.pushed,
                dropped = report.dropped,
                remaining = report.remaining,
                failed = report.failed,
                "pending sync drained"
            );
        }
        report
    }

    /// Rebuilds the remote mutation for a parked key from the local cache.
    /// `None` when the entry is gone, expired or invalidated locally.
    fn reconstruct(&self, key: &str) -> Option<Vec<RemoteOp>> {
        match self.keys.parse(key)? {
            RecordKey::Refresh(_) => {
                let bytes = self.cache.get(key)?;
                if bytes == INVALIDATED_MARKER {
                    return None;
                }
                let ttl = self.cache.get_ttl(key)?;
                let record = match RefreshTokenRecord::decode(&bytes) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::error!(key, error = %e, "dropping undecodable parked record");
                        return None;
                    }
                };
                Some(self.refresh_batch(&record, bytes, ttl))
            }
            RecordKey::Access(_) => {
                let ttl = self.cache.get_ttl(key)?;
                Some(vec![RemoteOp::SetEx {
                    key: key.to_string(),
                    value: REVOCATION_MARKER.to_vec(),
                    ttl,
                }])
            }
        }
    }
}
