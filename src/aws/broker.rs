//! Identity token and federated credential cache.
//!
//! Every fetch happens while holding the cache's async mutex, so concurrent
//! callers queue behind a single in-flight exchange and then reuse its result.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AccessCredentials, IdentityPool, IdentityToken, identity_pool};
use crate::{clock::Clock, error::AuthError, idp::IdentityProvider};

/// Credentials are refreshed this long before the expiry reported by the pool
const CREDENTIAL_REFRESH_MARGIN_MS: i64 = 60_000;

/// Static inputs of the authentication exchanges
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub region: String,
    pub user_pool_id: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default)]
struct Federation {
    identity_id: Option<String>,
    credentials: Option<AccessCredentials>,
}

pub struct CredentialBroker {
    settings: BrokerSettings,
    provider_key: String,
    idp: Arc<dyn IdentityProvider>,
    pool: Arc<dyn IdentityPool>,
    clock: Arc<dyn Clock>,
    token: Mutex<Option<IdentityToken>>,
    federation: Mutex<Federation>,
}

impl CredentialBroker {
    pub fn new(
        settings: BrokerSettings,
        idp: Arc<dyn IdentityProvider>,
        pool: Arc<dyn IdentityPool>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let provider_key = identity_pool::provider_key(&settings.region, &settings.user_pool_id);
        Self {
            settings,
            provider_key,
            idp,
            pool,
            clock,
            token: Mutex::new(None),
            federation: Mutex::new(Federation::default()),
        }
    }

    /// Return the cached identity token while it is valid, otherwise authenticate again
    pub async fn get_identity_token(&self) -> Result<IdentityToken, AuthError> {
        let mut cached = self.token.lock().await;

        let now = self.clock.now_epoch_ms();
        if let Some(token) = cached.as_ref().filter(|t| t.is_valid_at(now)) {
            debug!("Reusing cached identity token");
            return Ok(token.clone());
        }

        info!(username = %self.settings.username, "Authenticating against the identity provider");
        let grant = self
            .idp
            .password_auth(&self.settings.username, &self.settings.password)
            .await?;

        // Expiry counts from when the grant arrived
        let now = self.clock.now_epoch_ms();
        let token = IdentityToken {
            token: grant.id_token,
            expires_at_epoch_ms: now + grant.expires_in_seconds * 1000,
        };
        *cached = Some(token.clone());
        Ok(token)
    }

    /// Return cached access credentials, or federate a fresh identity token into new ones
    pub async fn get_access_credentials(&self) -> Result<AccessCredentials, AuthError> {
        let mut federation = self.federation.lock().await;

        let now = self.clock.now_epoch_ms();
        if let Some(credentials) = federation
            .credentials
            .as_ref()
            .filter(|c| credentials_fresh(c, now))
        {
            debug!("Reusing cached access credentials");
            return Ok(credentials.clone());
        }

        let token = self.get_identity_token().await?;
        match self.federate(&mut federation, &token).await {
            Ok(credentials) => {
                federation.credentials = Some(credentials.clone());
                Ok(credentials)
            }
            Err(err @ AuthError::FederationRejected(_)) => {
                warn!(error = %err, "Federation rejected, discarding identity token");
                federation.identity_id = None;
                federation.credentials = None;
                self.token.lock().await.take();
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Federated identity id of the configured user, resolved through the identity pool
    pub async fn get_identity_id(&self) -> Result<String, AuthError> {
        let mut federation = self.federation.lock().await;
        if let Some(identity_id) = &federation.identity_id {
            return Ok(identity_id.clone());
        }

        let token = self.get_identity_token().await?;
        match self.resolve_identity_id(&mut federation, &token).await {
            Err(err @ AuthError::FederationRejected(_)) => {
                self.token.lock().await.take();
                Err(err)
            }
            other => other,
        }
    }

    /// Drop cached access credentials after the remote end refused them
    pub async fn invalidate_access_credentials(&self) {
        info!("Invalidating cached access credentials");
        self.federation.lock().await.credentials = None;
    }

    async fn federate(
        &self,
        federation: &mut Federation,
        token: &IdentityToken,
    ) -> Result<AccessCredentials, AuthError> {
        let identity_id = self.resolve_identity_id(federation, token).await?;
        self.pool
            .get_credentials(&identity_id, &self.provider_key, &token.token)
            .await
    }

    async fn resolve_identity_id(
        &self,
        federation: &mut Federation,
        token: &IdentityToken,
    ) -> Result<String, AuthError> {
        if let Some(identity_id) = &federation.identity_id {
            return Ok(identity_id.clone());
        }
        let identity_id = self.pool.get_id(&self.provider_key, &token.token).await?;
        federation.identity_id = Some(identity_id.clone());
        Ok(identity_id)
    }
}

fn credentials_fresh(credentials: &AccessCredentials, now_epoch_ms: i64) -> bool {
    credentials
        .expires_at_epoch_ms
        .is_none_or(|expires| now_epoch_ms + CREDENTIAL_REFRESH_MARGIN_MS < expires)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{clock::ManualClock, idp::TokenGrant};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct FakeIdp {
        pub calls: AtomicUsize,
        pub reject: bool,
    }

    #[async_trait]
    impl IdentityProvider for FakeIdp {
        async fn password_auth(&self, username: &str, _: &str) -> Result<TokenGrant, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.reject {
                return Err(AuthError::InvalidCredentials(format!("bad password for {username}")));
            }
            Ok(TokenGrant {
                id_token: format!("id-token-{n}"),
                expires_in_seconds: 3600,
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct FakePool {
        pub get_id_calls: AtomicUsize,
        pub credential_calls: AtomicUsize,
        /// Number of upcoming credential calls to reject
        pub rejections: AtomicUsize,
        pub expires_at_epoch_ms: Option<i64>,
    }

    #[async_trait]
    impl IdentityPool for FakePool {
        async fn get_id(&self, _: &str, _: &str) -> Result<String, AuthError> {
            self.get_id_calls.fetch_add(1, Ordering::SeqCst);
            Ok("us-east-1:identity".to_string())
        }

        async fn get_credentials(
            &self,
            _: &str,
            _: &str,
            id_token: &str,
        ) -> Result<AccessCredentials, AuthError> {
            self.credential_calls.fetch_add(1, Ordering::SeqCst);
            let pending = self.rejections.load(Ordering::SeqCst);
            if pending > 0 {
                self.rejections.store(pending - 1, Ordering::SeqCst);
                return Err(AuthError::FederationRejected("token is stale".into()));
            }
            Ok(AccessCredentials {
                access_key_id: format!("AKID-for-{id_token}"),
                secret_access_key: "secret".to_string(),
                session_token: Some("session".to_string()),
                expires_at_epoch_ms: self.expires_at_epoch_ms,
            })
        }
    }

    pub(crate) fn settings() -> BrokerSettings {
        BrokerSettings {
            region: "us-east-1".to_string(),
            user_pool_id: "us-east-1_Pool".to_string(),
            username: "dashboard".to_string(),
            password: "hunter2".to_string(),
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        ))
    }

    fn broker(idp: Arc<FakeIdp>, pool: Arc<FakePool>, clock: Arc<ManualClock>) -> CredentialBroker {
        CredentialBroker::new(settings(), idp, pool, clock)
    }

    #[tokio::test]
    async fn test_token_reused_within_ttl() {
        let idp = Arc::new(FakeIdp::default());
        let clock = clock();
        let broker = broker(idp.clone(), Arc::new(FakePool::default()), clock.clone());

        let first = broker.get_identity_token().await.unwrap();
        clock.advance(chrono::Duration::minutes(30));
        let second = broker.get_identity_token().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(idp.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            first.expires_at_epoch_ms,
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap().timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_token_refreshed_after_expiry() {
        let idp = Arc::new(FakeIdp::default());
        let clock = clock();
        let broker = broker(idp.clone(), Arc::new(FakePool::default()), clock.clone());

        let first = broker.get_identity_token().await.unwrap();
        clock.advance(chrono::Duration::seconds(3600));
        let second = broker.get_identity_token().await.unwrap();

        assert_ne!(first.token, second.token);
        assert_eq!(idp.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_credentials_propagate() {
        let idp = Arc::new(FakeIdp {
            reject: true,
            ..Default::default()
        });
        let broker = broker(idp, Arc::new(FakePool::default()), clock());

        let err = broker.get_access_credentials().await.unwrap_err();
        assert_eq!(err.reason(), "invalid_credentials");
    }

    #[tokio::test]
    async fn test_credentials_cached() {
        let idp = Arc::new(FakeIdp::default());
        let pool = Arc::new(FakePool::default());
        let broker = broker(idp.clone(), pool.clone(), clock());

        let first = broker.get_access_credentials().await.unwrap();
        let second = broker.get_access_credentials().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.access_key_id, "AKID-for-id-token-1");
        assert_eq!(pool.credential_calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.get_id_calls.load(Ordering::SeqCst), 1);
        assert_eq!(idp.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_federation_rejection_discards_token() {
        let idp = Arc::new(FakeIdp::default());
        let pool = Arc::new(FakePool {
            rejections: AtomicUsize::new(1),
            ..Default::default()
        });
        let broker = broker(idp.clone(), pool.clone(), clock());

        let err = broker.get_access_credentials().await.unwrap_err();
        assert_eq!(err.reason(), "federation_rejected");

        let credentials = broker.get_access_credentials().await.unwrap();
        assert_eq!(credentials.access_key_id, "AKID-for-id-token-2");
        assert_eq!(idp.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.get_id_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expiring_credentials_refreshed() {
        let clock = clock();
        let expires = clock.now_epoch_ms() + 15 * 60_000;
        let pool = Arc::new(FakePool {
            expires_at_epoch_ms: Some(expires),
            ..Default::default()
        });
        let broker = broker(Arc::new(FakeIdp::default()), pool.clone(), clock.clone());

        broker.get_access_credentials().await.unwrap();
        clock.advance(chrono::Duration::minutes(10));
        broker.get_access_credentials().await.unwrap();
        assert_eq!(pool.credential_calls.load(Ordering::SeqCst), 1);

        clock.advance(chrono::Duration::minutes(4));
        broker.get_access_credentials().await.unwrap();
        assert_eq!(pool.credential_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_access_credentials_keeps_token() {
        let idp = Arc::new(FakeIdp::default());
        let pool = Arc::new(FakePool::default());
        let broker = broker(idp.clone(), pool.clone(), clock());

        broker.get_access_credentials().await.unwrap();
        broker.invalidate_access_credentials().await;
        broker.get_access_credentials().await.unwrap();

        assert_eq!(pool.credential_calls.load(Ordering::SeqCst), 2);
        assert_eq!(idp.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_coalesce() {
        let idp = Arc::new(FakeIdp::default());
        let pool = Arc::new(FakePool::default());
        let broker = Arc::new(broker(idp.clone(), pool.clone(), clock()));

        let (a, b) = tokio::join!(broker.get_access_credentials(), broker.get_access_credentials());
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(idp.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.credential_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_identity_id_cached() {
        let pool = Arc::new(FakePool::default());
        let broker = broker(Arc::new(FakeIdp::default()), pool.clone(), clock());

        assert_eq!(broker.get_identity_id().await.unwrap(), "us-east-1:identity");
        broker.get_access_credentials().await.unwrap();
        assert_eq!(pool.get_id_calls.load(Ordering::SeqCst), 1);
    }
}
