use crate::domain_model::OpContext;
use crate::domain_port::*;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use std::time::Duration;

const INVALIDATE_REFRESH: &str = include_str!("invalidate_refresh.lua");

pub struct RedisRemoteStore {
    conn: ConnectionManager,
    invalidate_refresh: Script,
}

impl RedisRemoteStore {
    pub fn new(conn: ConnectionManager) -> Self {
        RedisRemoteStore {
            conn,
            invalidate_refresh: Script::new(INVALIDATE_REFRESH),
        }
    }

    /// Builds `redis://[:password@]host:port/db`. Only the first address is
    /// used.
    pub fn dsn(address: &str, password: Option<&str>, db: i64) -> String {
        let address = address
            .trim_start_matches("redis://")
            .trim_end_matches('/');
        match password {
            Some(password) if !password.is_empty() => {
                format!("redis://:{}@{}/{}", password, address, db)
            }
            _ => format!("redis://{}/{}", address, db),
        }
    }

    pub async fn connect(dsn: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(dsn)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self::new(conn))
    }
}

fn unavailable(e: RedisError) -> RemoteError {
    RemoteError::Unavailable(e.to_string())
}

#[async_trait::async_trait]
impl RemoteStore for RedisRemoteStore {
    async fn get_bytes(&self, cx: &OpContext, key: &str) -> RemoteResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        cx.run(async move { conn.get(key).await.map_err(unavailable) })
            .await
    }

    async fn set_ex(
        &self,
        cx: &OpContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> RemoteResult<()> {
        let mut conn = self.conn.clone();
        cx.run(async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async::<()>(&mut conn)
                .await
                .map_err(unavailable)
        })
        .await
    }

    async fn set_nx_ex(
        &self,
        cx: &OpContext,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> RemoteResult<bool> {
        let mut conn = self.conn.clone();
        cx.run(async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn del(&self, cx: &OpContext, key: &str) -> RemoteResult<()> {
        let mut conn = self.conn.clone();
        cx.run(async move {
            let _: () = conn.del(key).await.map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, cx: &OpContext, key: &str) -> RemoteResult<bool> {
        let mut conn = self.conn.clone();
        cx.run(async move { conn.exists(key).await.map_err(unavailable) })
            .await
    }

    async fn ttl(&self, cx: &OpContext, key: &str) -> RemoteResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        cx.run(async move {
            // -2 missing, -1 no expiry
            let millis: i64 = redis::cmd("PTTL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            Ok((millis > 0).then(|| Duration::from_millis(millis as u64)))
        })
        .await
    }

    async fn set_add(&self, cx: &OpContext, key: &str, member: &str) -> RemoteResult<()> {
        let mut conn = self.conn.clone();
        cx.run(async move {
            let _: () = conn.sadd(key, member).await.map_err(unavailable)?;
            Ok(())
        })
        .await
    }

    async fn set_scan(
        &self,
        cx: &OpContext,
        key: &str,
        cursor: u64,
        batch: usize,
    ) -> RemoteResult<(Vec<String>, u64)> {
        let mut conn = self.conn.clone();
        cx.run(async move {
            let (next, members): (u64, Vec<String>) = redis::cmd("SSCAN")
                .arg(key)
                .arg(cursor)
                .arg("COUNT")
                .arg(batch)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;
            Ok((members, next))
        })
        .await
    }

    async fn set_expire(&self, cx: &OpContext, key: &str, ttl: Duration) -> RemoteResult<()> {
        let mut conn = self.conn.clone();
        cx.run(async move {
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .query_async::<()>(&mut conn)
                .await
                .map_err(unavailable)
        })
        .await
    }

    async fn pipelined(&self, cx: &OpContext, batch: &[RemoteOp]) -> RemoteResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for op in batch {
            match op {
                RemoteOp::SetEx { key, value, ttl } => {
                    pipe.cmd("SET")
                        .arg(key)
                        .arg(value.as_slice())
                        .arg("PX")
                        .arg(ttl_millis(*ttl))
                        .ignore();
                }
                RemoteOp::SetAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                RemoteOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(*ttl)).ignore();
                }
                RemoteOp::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
            }
        }
        let mut conn = self.conn.clone();
        cx.run(async move {
            pipe.query_async::<()>(&mut conn)
                .await
                .map_err(unavailable)
        })
        .await
    }

    async fn eval(
        &self,
        cx: &OpContext,
        script: StoreScript,
        keys: &[String],
        args: &[String],
    ) -> RemoteResult<i64> {
        let script = match script {
            StoreScript::InvalidateRefresh => &self.invalidate_refresh,
        };
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        let mut conn = self.conn.clone();
        cx.run(async move {
            invocation
                .invoke_async::<i64>(&mut conn)
                .await
                .map_err(unavailable)
        })
        .await
    }

    async fn ping(&self, cx: &OpContext) -> RemoteResult<()> {
        let mut conn = self.conn.clone();
        cx.run(async move {
            redis::cmd("PING")
                .query_async::<()>(&mut conn)
                .await
                .map_err(unavailable)
        })
        .await
    }
}
