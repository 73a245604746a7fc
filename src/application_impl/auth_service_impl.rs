use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::{TokenStore, TokenStoreError};
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub signing_key: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String, // user id as string
    exp: i64,
    iat: i64,
    iss: String,
    aud: String,
    jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fid: Option<String>, // refresh tokens only
}

/// HS256 issuer/validator. Expiry is judged against the injected clock.
pub struct JwtHs256Codec {
    cfg: JwtConfig,
    clock: Arc<dyn Clock>,
}

impl JwtHs256Codec {
    pub fn new(cfg: JwtConfig, clock: Arc<dyn Clock>) -> Self {
        JwtHs256Codec { cfg, clock }
    }

    fn sign(
        &self,
        uid: UserId,
        jti: String,
        fid: Option<String>,
        ttl: Duration,
    ) -> Result<(String, DateTime<Utc>), AuthError> {
        let iat = self.clock.now().timestamp();
        let exp = iat.saturating_add(ttl.as_secs() as i64);
        let claims = Claims {
            sub: uid.to_string(),
            exp,
            iat,
            iss: self.cfg.issuer.clone(),
            aud: self.cfg.audience.clone(),
            jti,
            fid,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.cfg.signing_key),
        )
        .map_err(|e| AuthError::InternalError(e.to_string()))?;
        let exp_dt = DateTime::from_timestamp(exp, 0)
            .ok_or_else(|| AuthError::InternalError(format!("exp out of range: {exp}")))?;
        Ok((token, exp_dt))
    }

    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut v = Validation::new(Algorithm::HS256);
        v.validate_exp = false;
        v.set_audience(&[self.cfg.audience.clone()]);
        v.set_issuer(&[self.cfg.issuer.clone()]);
        let data = decode::<Claims>(token, &DecodingKey::from_secret(&self.cfg.signing_key), &v)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::TokenInvalid,
            })?;
        if data.claims.exp <= self.clock.now().timestamp() {
            return Err(AuthError::TokenExpired);
        }
        Ok(data.claims)
    }

    fn into_verify_result(claims: Claims) -> Result<TokenVerifyResult, AuthError> {
        let user_id = claims
            .sub
            .parse::<UserId>()
            .map_err(|_| AuthError::TokenInvalid)?;
        let expires_at = DateTime::from_timestamp(claims.exp, 0).ok_or(AuthError::TokenInvalid)?;
        Ok(TokenVerifyResult {
            user_id,
            jti: claims.jti,
            family_id: claims.fid,
            expires_at,
        })
    }
}

#[async_trait::async_trait]
impl TokenCodec for JwtHs256Codec {
    async fn issue_access_token(
        &self,
        user: UserId,
        jti: TokenId,
    ) -> Result<(AccessToken, DateTime<Utc>), AuthError> {
        let (token, exp_dt) = self.sign(user, jti, None, self.cfg.access_ttl)?;
        Ok((AccessToken(token), exp_dt))
    }

    async fn issue_refresh_token(
        &self,
        user: UserId,
        jti: TokenId,
        family_id: FamilyId,
    ) -> Result<(RefreshToken, DateTime<Utc>), AuthError> {
        let (token, exp_dt) = self.sign(user, jti, Some(family_id), self.cfg.refresh_ttl)?;
        Ok((RefreshToken(token), exp_dt))
    }

    async fn verify_access_token(
        &self,
        token: &AccessToken,
    ) -> Result<TokenVerifyResult, AuthError> {
        let claims = self.verify(&token.0)?;
        if claims.fid.is_some() {
            // A refresh token presented as an access token.
            return Err(AuthError::TokenInvalid);
        }
        Self::into_verify_result(claims)
    }

    async fn verify_refresh_token(
        &self,
        token: &RefreshToken,
    ) -> Result<TokenVerifyResult, AuthError> {
        let claims = self.verify(&token.0)?;
        if claims.fid.is_none() {
            return Err(AuthError::TokenInvalid);
        }
        Self::into_verify_result(claims)
    }
}

/// Authentication flow backed by a `TokenStore`: refresh tokens are
/// whitelisted per family, access tokens are blacklisted on logout.
pub struct TokenAuthService {
    store: Arc<dyn TokenStore>,
    token_codec: Arc<dyn TokenCodec>,
    ids: Arc<dyn TokenIdGenerator>,
    clock: Arc<dyn Clock>,
}

impl TokenAuthService {
    pub fn new(
        store: Arc<dyn TokenStore>,
        token_codec: Arc<dyn TokenCodec>,
        ids: Arc<dyn TokenIdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            token_codec,
            ids,
            clock,
        }
    }

    fn ttl_until(&self, until: DateTime<Utc>) -> Duration {
        remaining_until(until, self.clock.now()).unwrap_or(Duration::from_secs(1))
    }

    /// Issues a pair in `family_id` and whitelists its refresh half.
    async fn issue_pair(
        &self,
        cx: &OpContext,
        user_id: UserId,
        family_id: FamilyId,
    ) -> Result<AuthTokens, AuthError> {
        let (access_token, access_exp) = self
            .token_codec
            .issue_access_token(user_id, self.ids.next_id())
            .await?;

        let refresh_jti = self.ids.next_id();
        let (refresh_token, refresh_exp) = self
            .token_codec
            .issue_refresh_token(user_id, refresh_jti.clone(), family_id.clone())
            .await?;

        self.store
            .store_refresh_token(cx, &refresh_jti, &family_id, user_id, self.ttl_until(refresh_exp))
            .await?;

        Ok(AuthTokens {
            access_token,
            refresh_token,
            access_token_expires_at: access_exp,
            refresh_token_expires_at: refresh_exp,
        })
    }
}

#[async_trait::async_trait]
impl AuthService for TokenAuthService {
    async fn login(&self, cx: &OpContext, user_id: UserId) -> Result<AuthTokens, AuthError> {
        let family_id = self.ids.next_id();
        let tokens = self.issue_pair(cx, user_id, family_id.clone()).await?;
        info!(%user_id, family_id, "session started");
        Ok(tokens)
    }

    async fn refresh(&self, cx: &OpContext, refresh_token: &str) -> Result<AuthTokens, AuthError> {
        let verified = self
            .token_codec
            .verify_refresh_token(&RefreshToken(refresh_token.to_string()))
            .await?;
        let family_id = verified.family_id.ok_or(AuthError::TokenInvalid)?;

        let valid = self
            .store
            .is_refresh_token_valid(cx, &verified.jti, &family_id)
            .await?;
        if !valid {
            // Reuse of a rotated token: the family is compromised.
            warn!(user_id = %verified.user_id, family_id, "refresh token reuse detected");
            if let Err(e) = self
                .store
                .invalidate_refresh_token_by_family_id(cx, &family_id)
                .await
            {
                warn!(family_id, error = %e, "failed to invalidate reused family");
            }
            return Err(AuthError::TokenInvalid);
        }

        self.store
            .invalidate_refresh_token(cx, &verified.jti)
            .await?;
        self.issue_pair(cx, verified.user_id, family_id).await
    }

    async fn authenticate(&self, cx: &OpContext, access_token: &str) -> Result<UserId, AuthError> {
        let verified = self
            .token_codec
            .verify_access_token(&AccessToken(access_token.to_string()))
            .await?;
        if self.store.is_access_token_revoked(cx, &verified.jti).await? {
            return Err(AuthError::TokenRevoked);
        }
        Ok(verified.user_id)
    }

    async fn logout(
        &self,
        cx: &OpContext,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<(), AuthError> {
        let access = self
            .token_codec
            .verify_access_token(&AccessToken(access_token.to_string()))
            .await?;
        let refresh = self
            .token_codec
            .verify_refresh_token(&RefreshToken(refresh_token.to_string()))
            .await?;
        if access.user_id != refresh.user_id {
            return Err(AuthError::TokenInvalid);
        }

        let revocation = AccessRevocation {
            token_id: access.jti,
            expires_at: access.expires_at,
        };
        let ttl = self.ttl_until(revocation.expires_at);
        let revoke = self
            .store
            .revoke_access_token(cx, &revocation.token_id, ttl);
        let family_id = refresh.family_id.unwrap_or_default();
        let invalidate = self
            .store
            .invalidate_refresh_token_by_family_id(cx, &family_id);
        let (revoked, invalidated) = futures_util::join!(revoke, invalidate);

        match revoked {
            Ok(()) => {}
            Err(TokenStoreError::AlreadyRevoked) => {
                debug!(jti = revocation.token_id, "access token already revoked");
            }
            Err(e) => return Err(e.into()),
        }
        invalidated?;
        info!(user_id = %access.user_id, family_id, "session ended");
        Ok(())
    }

    async fn logout_everywhere(&self, cx: &OpContext, user_id: UserId) -> Result<(), AuthError> {
        self.store
            .invalidate_refresh_token_by_user_id(cx, user_id)
            .await?;
        info!(%user_id, "all sessions ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_store::InMemoryTokenStore;

    fn jwt_config() -> JwtConfig {
        JwtConfig {
            issuer: "tokenstore".to_string(),
            audience: "tokenstore-clients".to_string(),
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 3600),
            signing_key: b"test-signing-key".to_vec(),
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryTokenStore>,
        codec: Arc<JwtHs256Codec>,
        service: TokenAuthService,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryTokenStore::new(clock.clone()));
        let codec = Arc::new(JwtHs256Codec::new(jwt_config(), clock.clone()));
        let service = TokenAuthService::new(
            store.clone(),
            codec.clone(),
            Arc::new(NanoidGenerator),
            clock.clone(),
        );
        Fixture {
            clock,
            store,
            codec,
            service,
        }
    }

    #[tokio::test]
    async fn codec_round_trips_claims() {
        let f = fixture();
        let (token, exp) = f
            .codec
            .issue_refresh_token(UserId(7), "jti-1".into(), "fam-1".into())
            .await
            .unwrap();
        let verified = f.codec.verify_refresh_token(&token).await.unwrap();
        assert_eq!(verified.user_id, UserId(7));
        assert_eq!(verified.jti, "jti-1");
        assert_eq!(verified.family_id.as_deref(), Some("fam-1"));
        assert_eq!(verified.expires_at, exp);

        // Token kinds are not interchangeable.
        let as_access = AccessToken(token.0.clone());
        assert_eq!(
            f.codec.verify_access_token(&as_access).await.unwrap_err(),
            AuthError::TokenInvalid
        );
    }

    #[tokio::test]
    async fn codec_rejects_expired_and_foreign_tokens() {
        let f = fixture();
        let (token, _) = f
            .codec
            .issue_access_token(UserId(7), "jti-1".into())
            .await
            .unwrap();

        let other = JwtHs256Codec::new(
            JwtConfig {
                signing_key: b"another-key".to_vec(),
                ..jwt_config()
            },
            f.clock.clone(),
        );
        assert_eq!(
            other.verify_access_token(&token).await.unwrap_err(),
            AuthError::TokenInvalid
        );

        f.clock.advance(Duration::from_secs(16 * 60));
        assert_eq!(
            f.codec.verify_access_token(&token).await.unwrap_err(),
            AuthError::TokenExpired
        );
    }

    #[tokio::test]
    async fn login_then_authenticate() {
        let f = fixture();
        let cx = OpContext::background();
        let tokens = f.service.login(&cx, UserId(1)).await.unwrap();
        let user = f
            .service
            .authenticate(&cx, &tokens.access_token.0)
            .await
            .unwrap();
        assert_eq!(user, UserId(1));
    }

    #[tokio::test]
    async fn refresh_rotates_and_detects_reuse() {
        let f = fixture();
        let cx = OpContext::background();
        let first = f.service.login(&cx, UserId(1)).await.unwrap();
        let second = f
            .service
            .refresh(&cx, &first.refresh_token.0)
            .await
            .unwrap();

        // Replaying the rotated token burns the whole family.
        assert_eq!(
            f.service
                .refresh(&cx, &first.refresh_token.0)
                .await
                .unwrap_err(),
            AuthError::TokenInvalid
        );
        assert_eq!(
            f.service
                .refresh(&cx, &second.refresh_token.0)
                .await
                .unwrap_err(),
            AuthError::TokenInvalid
        );
    }

    #[tokio::test]
    async fn logout_revokes_access_and_refresh() {
        let f = fixture();
        let cx = OpContext::background();
        let tokens = f.service.login(&cx, UserId(1)).await.unwrap();

        f.service
            .logout(&cx, &tokens.access_token.0, &tokens.refresh_token.0)
            .await
            .unwrap();
        // A second logout is not an error.
        f.service
            .logout(&cx, &tokens.access_token.0, &tokens.refresh_token.0)
            .await
            .unwrap();

        let err = f
            .service
            .authenticate(&cx, &tokens.access_token.0)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::TokenRevoked);
        assert_eq!(err.status_code(), 401);
        assert!(
            f.service
                .refresh(&cx, &tokens.refresh_token.0)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn logout_everywhere_ends_every_family() {
        let f = fixture();
        let cx = OpContext::background();
        let laptop = f.service.login(&cx, UserId(1)).await.unwrap();
        let phone = f.service.login(&cx, UserId(1)).await.unwrap();
        let other_user = f.service.login(&cx, UserId(2)).await.unwrap();

        f.service.logout_everywhere(&cx, UserId(1)).await.unwrap();

        for tokens in [&laptop, &phone] {
            assert!(
                f.service
                    .refresh(&cx, &tokens.refresh_token.0)
                    .await
                    .is_err()
            );
        }
        assert!(
            f.service
                .refresh(&cx, &other_user.refresh_token.0)
                .await
                .is_ok()
        );
        f.store.close().await;
    }
}
