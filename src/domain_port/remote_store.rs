use crate::domain_model::OpContext;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl RemoteError {
    /// Whether the failure says something about the remote store itself
    /// rather than about the caller giving up.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// One mutation inside a pipelined batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    SetEx {
        key: String,
        value: Vec<u8>,
        ttl: Duration,
    },
    SetAdd {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    Del {
        key: String,
    },
}

/// Server-side scripts the core relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScript {
    /// KEYS[1] = refresh record key. Flips `valid` to false while keeping the
    /// remaining TTL. Returns one of the `INVALIDATE_*` statuses.
    InvalidateRefresh,
}

pub const INVALIDATE_MISSING: i64 = 0;
pub const INVALIDATE_FLIPPED: i64 = 1;
pub const INVALIDATE_ALREADY: i64 = 2;

/// Capability over the shared key-value store. Absence is reported as `None`
/// or `false`, never as an error.
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get_bytes(&self, cx: &OpContext, key: &str) -> RemoteResult<Option<Vec<u8>>>;

    async fn set_ex(&self, cx: &OpContext, key: &str, value: &[u8], ttl: Duration)
    -> RemoteResult<()>;

    /// Returns whether the value was written.
    async fn set_nx_ex(
        &self,
        cx: &OpContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> RemoteResult<bool>;

    async fn del(&self, cx: &OpContext, key: &str) -> RemoteResult<()>;

    async fn exists(&self, cx: &OpContext, key: &str) -> RemoteResult<bool>;

    /// Remaining lifetime; `None` when the key is absent or never expires.
    async fn ttl(&self, cx: &OpContext, key: &str) -> RemoteResult<Option<Duration>>;

    async fn set_add(&self, cx: &OpContext, key: &str, member: &str) -> RemoteResult<()>;

    /// One page of set members; a returned cursor of 0 ends the iteration.
    async fn set_scan(
        &self,
        cx: &OpContext,
        key: &str,
        cursor: u64,
        batch: usize,
    ) -> RemoteResult<(Vec<String>, u64)>;

    async fn set_expire(&self, cx: &OpContext, key: &str, ttl: Duration) -> RemoteResult<()>;

    async fn pipelined(&self, cx: &OpContext, batch: &[RemoteOp]) -> RemoteResult<()>;

    async fn eval(
        &self,
        cx: &OpContext,
        script: StoreScript,
        keys: &[String],
        args: &[String],
    ) -> RemoteResult<i64>;

    async fn ping(&self, cx: &OpContext) -> RemoteResult<()>;
}

/// Millisecond TTL for the wire; sub-millisecond values round up to 1.
pub fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
