use std::sync::Arc;
use std::time::Duration;
use tokenstore::application_impl::*;
use tokenstore::application_port::AuthService;
use tokenstore::domain_model::*;
use tokenstore::domain_port::{RemoteStore, TokenStore};
use tokenstore::infra_memory::MemoryRemoteStore;
use tokenstore::infra_redis::RedisRemoteStore;
use tokenstore::logger::*;
use tokenstore::settings::*;
use tokenstore::token_store::*;
use tokio::signal;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const REVOKE_TIMEOUT: Duration = Duration::from_secs(30);

async fn build_remote(
    settings: &Settings,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Arc<dyn RemoteStore>> {
    match settings.remote.backend.as_str() {
        "memory" => {
            warn!("using the in-process remote store; state is not shared");
            Ok(Arc::new(MemoryRemoteStore::new(clock)))
        }
        "redis" => {
            let (first, rest) = settings
                .remote
                .addresses
                .split_first()
                .ok_or_else(|| anyhow::anyhow!("remote.addresses is empty"))?;
            if !rest.is_empty() {
                warn!(ignored = ?rest, "only single-node redis is supported");
            }
            let dsn = RedisRemoteStore::dsn(first, settings.remote.password.as_deref(), settings.remote.db);
            let remote = RedisRemoteStore::connect(&dsn).await?;
            info!(address = %first, db = settings.remote.db, "connected to redis");
            Ok(Arc::new(remote))
        }
        other => Err(anyhow::anyhow!("unknown remote backend: {other}")),
    }
}

async fn close_store(store: &TieredTokenStore) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, store.close()).await {
        Ok(_) => info!("token store closed"),
        Err(_) => error!("token store close timed out"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logger = Logger::new_bootstrap();

    let project_settings = parse_settings(cli.settings.as_deref())?;
    debug!(backend = %project_settings.remote.backend, ?project_settings.token);
    logger.reload_from_config(&LogConfig::from(&project_settings))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let remote = build_remote(&project_settings, clock.clone()).await?;
    let store = Arc::new(TieredTokenStore::new(
        remote,
        clock.clone(),
        TokenStoreConfig::from(&project_settings),
    ));

    match cli.command {
        Command::Serve => {
            if project_settings.jwt.signing_key.is_empty() {
                close_store(&store).await;
                return Err(anyhow::anyhow!("jwt.signing_key is empty"));
            }
            let codec = Arc::new(JwtHs256Codec::new(JwtConfig::from(&project_settings), clock.clone()));
            let _auth: Arc<dyn AuthService> = Arc::new(TokenAuthService::new(
                store.clone(),
                codec,
                Arc::new(NanoidGenerator),
                clock,
            ));
            info!(state = %store.remote_state(), "token store serving, Ctrl-C to stop");

            signal::ctrl_c().await?;
            info!(pending = store.pending_len(), "shutting down");
            close_store(&store).await;
            Ok(())
        }
        Command::RevokeUser { user_id } => {
            let user_id = UserId(user_id);
            let cx = OpContext::background().with_timeout(REVOKE_TIMEOUT);
            let result = store.invalidate_refresh_token_by_user_id(&cx, user_id).await;
            close_store(&store).await;
            match result {
                Ok(()) => {
                    info!(%user_id, "refresh tokens invalidated");
                    Ok(())
                }
                Err(e) => Err(anyhow::anyhow!("revoking tokens of user {user_id} failed: {e}")),
            }
        }
    }
}
