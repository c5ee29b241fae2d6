use std::sync::Arc;

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_iot::{
    Client,
    config::{Builder as IotConfigBuilder, Credentials},
    error::DisplayErrorContext,
};
use tracing::{debug, info, warn};

use super::{AccessCredentials, CredentialBroker};
use crate::error::AuthorizationWarning;

/// Authorization service holding the policies attached to federated identities
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn list_attached_policies(
        &self,
        credentials: &AccessCredentials,
        target: &str,
    ) -> Result<Vec<String>, AuthorizationWarning>;

    async fn attach_policy(
        &self,
        credentials: &AccessCredentials,
        policy_name: &str,
        target: &str,
    ) -> Result<(), AuthorizationWarning>;
}

/// AWS IoT control plane, called with the federated credentials themselves
#[derive(Debug, Clone)]
pub struct IotPolicyStore {
    base: SdkConfig,
}

impl IotPolicyStore {
    pub fn new(base: SdkConfig) -> Self {
        Self { base }
    }

    fn client(&self, credentials: &AccessCredentials) -> Client {
        let config = IotConfigBuilder::from(&self.base)
            .credentials_provider(Credentials::new(
                &credentials.access_key_id,
                &credentials.secret_access_key,
                credentials.session_token.clone(),
                None,
                "cognito-identity",
            ))
            .build();
        Client::from_conf(config)
    }
}

#[async_trait]
impl PolicyStore for IotPolicyStore {
    async fn list_attached_policies(
        &self,
        credentials: &AccessCredentials,
        target: &str,
    ) -> Result<Vec<String>, AuthorizationWarning> {
        let client = self.client(credentials);
        let mut names = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let response = client
                .list_attached_policies()
                .target(target)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| AuthorizationWarning::ListPolicies(DisplayErrorContext(&e).to_string()))?;

            names.extend(
                response
                    .policies()
                    .iter()
                    .filter_map(|p| p.policy_name().map(str::to_string)),
            );

            match response.next_marker() {
                Some(next) if !next.is_empty() => marker = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(names)
    }

    async fn attach_policy(
        &self,
        credentials: &AccessCredentials,
        policy_name: &str,
        target: &str,
    ) -> Result<(), AuthorizationWarning> {
        self.client(credentials)
            .attach_policy()
            .policy_name(policy_name)
            .target(target)
            .send()
            .await
            .map_err(|e| AuthorizationWarning::AttachPolicy(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }
}

/// Makes sure the federated identity carries the policy that lets it subscribe.
///
/// Best-effort: callers log the returned warning and carry on.
pub struct AuthorizationBinder {
    store: Arc<dyn PolicyStore>,
    policy_name: String,
}

impl AuthorizationBinder {
    pub fn new(store: Arc<dyn PolicyStore>, policy_name: String) -> Self {
        Self { store, policy_name }
    }

    /// Resolve the caller's identity through the broker, then attach the policy if missing
    pub async fn ensure_policy_attached(
        &self,
        broker: &CredentialBroker,
    ) -> Result<(), AuthorizationWarning> {
        let identity_id = broker.get_identity_id().await?;
        let credentials = broker.get_access_credentials().await?;
        self.ensure_attached_to(&identity_id, &credentials).await
    }

    /// Read-check-then-attach for a known identity
    pub async fn ensure_attached_to(
        &self,
        identity_id: &str,
        credentials: &AccessCredentials,
    ) -> Result<(), AuthorizationWarning> {
        let attached = self
            .store
            .list_attached_policies(credentials, identity_id)
            .await?;

        if attached.iter().any(|name| name == &self.policy_name) {
            debug!(policy = %self.policy_name, "Policy already attached");
            return Ok(());
        }

        info!(policy = %self.policy_name, identity = %identity_id, "Attaching policy");
        self.store
            .attach_policy(credentials, &self.policy_name, identity_id)
            .await
            .inspect_err(|e| warn!(error = %e, "Policy attachment failed"))
    }
}
