use crate::domain_model::{Clock, OpContext, RefreshTokenRecord};
use crate::domain_port::*;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

enum Value {
    Bytes(Vec<u8>),
    Set(BTreeSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process `RemoteStore`. It can be switched off to simulate an outage and
/// slowed down to exercise deadlines.
pub struct MemoryRemoteStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    latency_ms: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryRemoteStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        MemoryRemoteStore {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            clock,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Raw value regardless of availability.
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now();
        let mut entries = self.lock();
        Self::live(&mut entries, key, now).and_then(|e| match &e.value {
            Value::Bytes(b) => Some(b.clone()),
            Value::Set(_) => None,
        })
    }

    /// Set members regardless of availability.
    pub fn peek_members(&self, key: &str) -> Vec<String> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match Self::live(&mut entries, key, now).map(|e| &e.value) {
            Some(Value::Set(members)) => members.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn peek_ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut entries = self.lock();
        Self::live(&mut entries, key, now)
            .and_then(|e| e.expires_at)
            .and_then(|at| (at - now).to_std().ok())
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        entries.retain(|_, e| !Self::expired(e, now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn expired(entry: &Entry, now: DateTime<Utc>) -> bool {
        entry.expires_at.is_some_and(|at| at <= now)
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Option<&'a mut Entry> {
        if entries.get(key).is_some_and(|e| Self::expired(e, now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn deadline(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::milliseconds(ttl_millis(ttl) as i64)
    }

    async fn enter(&self) -> RemoteResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.is_available() {
            Ok(())
        } else {
            Err(RemoteError::Unavailable("connection refused".to_string()))
        }
    }

    fn apply(&self, entries: &mut HashMap<String, Entry>, op: &RemoteOp, now: DateTime<Utc>) {
        match op {
            RemoteOp::SetEx { key, value, ttl } => {
                entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::Bytes(value.clone()),
                        expires_at: Some(self.deadline(*ttl)),
                    },
                );
            }
            RemoteOp::SetAdd { key, member } => match Self::live(entries, key, now) {
                Some(Entry {
                    value: Value::Set(members),
                    ..
                }) => {
                    members.insert(member.clone());
                }
                _ => {
                    entries.insert(
                        key.clone(),
                        Entry {
                            value: Value::Set(BTreeSet::from([member.clone()])),
                            expires_at: None,
                        },
                    );
                }
            },
            RemoteOp::Expire { key, ttl } => {
                let at = self.deadline(*ttl);
                if let Some(entry) = Self::live(entries, key, now) {
                    entry.expires_at = Some(at);
                }
            }
            RemoteOp::Del { key } => {
                entries.remove(key);
            }
        }
    }
}

#[async_trait::async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get_bytes(&self, cx: &OpContext, key: &str) -> RemoteResult<Option<Vec<u8>>> {
        cx.run(self.enter()).await?;
        Ok(self.peek(key))
    }

    async fn set_ex(
        &self,
        cx: &OpContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> RemoteResult<()> {
        cx.run(self.enter()).await?;
        let now = self.clock.now();
        let op = RemoteOp::SetEx {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        };
        self.apply(&mut self.lock(), &op, now);
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        cx: &OpContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> RemoteResult<bool> {
        cx.run(self.enter()).await?;
        let now = self.clock.now();
        let mut entries = self.lock();
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        let op = RemoteOp::SetEx {
            key: key.to_string(),
            value: value.to_vec(),
            ttl,
        };
        self.apply(&mut entries, &op, now);
        Ok(true)
    }

    async fn del(&self, cx: &OpContext, key: &str) -> RemoteResult<()> {
        cx.run(self.enter()).await?;
        self.lock().remove(key);
        Ok(())
    }

    async fn exists(&self, cx: &OpContext, key: &str) -> RemoteResult<bool> {
        cx.run(self.enter()).await?;
        let now = self.clock.now();
        Ok(Self::live(&mut self.lock(), key, now).is_some())
    }

    async fn ttl(&self, cx: &OpContext, key: &str) -> RemoteResult<Option<Duration>> {
        cx.run(self.enter()).await?;
        Ok(self.peek_ttl(key))
    }

    async fn set_add(&self, cx: &OpContext, key: &str, member: &str) -> RemoteResult<()> {
        cx.run(self.enter()).await?;
        let now = self.clock.now();
        let op = RemoteOp::SetAdd {
            key: key.to_string(),
            member: member.to_string(),
        };
        self.apply(&mut self.lock(), &op, now);
        Ok(())
    }

    async fn set_scan(
        &self,
        cx: &OpContext,
        key: &str,
        cursor: u64,
        batch: usize,
    ) -> RemoteResult<(Vec<String>, u64)> {
        cx.run(self.enter()).await?;
        let members = self.peek_members(key);
        let start = cursor as usize;
        let page: Vec<String> = members.iter().skip(start).take(batch.max(1)).cloned().collect();
        let next = start + page.len();
        let next = if next >= members.len() { 0 } else { next as u64 };
        Ok((page, next))
    }

    async fn set_expire(&self, cx: &OpContext, key: &str, ttl: Duration) -> RemoteResult<()> {
        cx.run(self.enter()).await?;
        let now = self.clock.now();
        let op = RemoteOp::Expire {
            key: key.to_string(),
            ttl,
        };
        self.apply(&mut self.lock(), &op, now);
        Ok(())
    }

    async fn pipelined(&self, cx: &OpContext, batch: &[RemoteOp]) -> RemoteResult<()> {
        cx.run(self.enter()).await?;
        let now = self.clock.now();
        let mut entries = self.lock();
        for op in batch {
            self.apply(&mut entries, op, now);
        }
        Ok(())
    }

    async fn eval(
        &self,
        cx: &OpContext,
        script: StoreScript,
        keys: &[String],
        _args: &[String],
    ) -> RemoteResult<i64> {
        cx.run(self.enter()).await?;
        let now = self.clock.now();
        match script {
            StoreScript::InvalidateRefresh => {
                let key = keys.first().ok_or_else(|| {
                    RemoteError::Unavailable("script expects one key".to_string())
                })?;
                let mut entries = self.lock();
                let Some(entry) = Self::live(&mut entries, key, now) else {
                    return Ok(INVALIDATE_MISSING);
                };
                let Value::Bytes(raw) = &mut entry.value else {
                    return Ok(INVALIDATE_MISSING);
                };
                let mut record = RefreshTokenRecord::decode(raw)
                    .map_err(|e| RemoteError::Unavailable(format!("corrupt record: {e}")))?;
                if !record.valid {
                    return Ok(INVALIDATE_ALREADY);
                }
                record.valid = false;
                *raw = record
                    .encode()
                    .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
                Ok(INVALIDATE_FLIPPED)
            }
        }
    }

    async fn ping(&self, cx: &OpContext) -> RemoteResult<()> {
        cx.run(self.enter()).await
    }
}
