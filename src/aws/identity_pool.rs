use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_cognitoidentity::{
    Client,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
};
use tracing::{debug, info};

use super::AccessCredentials;
use crate::error::AuthError;

/// Identity pool that federates identity tokens into identities and credentials
#[async_trait]
pub trait IdentityPool: Send + Sync {
    /// Resolve the federated identity id for a token
    async fn get_id(&self, provider_key: &str, id_token: &str) -> Result<String, AuthError>;

    /// Exchange a token for temporary credentials of the given identity
    async fn get_credentials(
        &self,
        identity_id: &str,
        provider_key: &str,
        id_token: &str,
    ) -> Result<AccessCredentials, AuthError>;
}

/// Login map key of a Cognito user pool, e.g. `cognito-idp.eu-west-1.amazonaws.com/eu-west-1_AbC`
pub fn provider_key(region: &str, user_pool_id: &str) -> String {
    format!("cognito-idp.{region}.amazonaws.com/{user_pool_id}")
}

#[derive(Debug, Clone)]
pub struct CognitoIdentityPool {
    client: Client,
    pool_id: String,
}

impl CognitoIdentityPool {
    pub fn new(config: &SdkConfig, pool_id: String) -> Self {
        Self {
            client: Client::new(config),
            pool_id,
        }
    }
}

#[async_trait]
impl IdentityPool for CognitoIdentityPool {
    async fn get_id(&self, provider_key: &str, id_token: &str) -> Result<String, AuthError> {
        debug!("Calling Cognito GetId for pool {}", self.pool_id);

        let response = self
            .client
            .get_id()
            .identity_pool_id(&self.pool_id)
            .logins(provider_key, id_token)
            .send()
            .await
            .map_err(classify)?;

        response
            .identity_id()
            .map(str::to_string)
            .ok_or_else(|| AuthError::FederationRejected("GetId returned no identity id".into()))
    }

    async fn get_credentials(
        &self,
        identity_id: &str,
        provider_key: &str,
        id_token: &str,
    ) -> Result<AccessCredentials, AuthError> {
        info!("Calling Cognito GetCredentialsForIdentity");
        debug!("Identity ID: {}", identity_id);

        let response = self
            .client
            .get_credentials_for_identity()
            .identity_id(identity_id)
            .logins(provider_key, id_token)
            .send()
            .await
            .map_err(classify)?;

        let creds = response.credentials().ok_or_else(|| {
            AuthError::FederationRejected("identity pool returned no credentials".into())
        })?;

        let access_key_id = creds
            .access_key_id()
            .ok_or_else(|| AuthError::FederationRejected("missing access key id".into()))?;
        let secret_access_key = creds
            .secret_key()
            .ok_or_else(|| AuthError::FederationRejected("missing secret key".into()))?;

        Ok(AccessCredentials {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            session_token: creds.session_token().map(str::to_string),
            expires_at_epoch_ms: creds.expiration().and_then(|at| at.to_millis().ok()),
        })
    }
}

/// Service errors mean the pool refused the token; anything else is a transport failure
fn classify<E, R>(err: SdkError<E, R>) -> AuthError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match err.as_service_error() {
        Some(service) if service.code() == Some("TooManyRequestsException") => {
            AuthError::Network(message)
        }
        Some(_) => AuthError::FederationRejected(message),
        None => AuthError::Network(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_key() {
        assert_eq!(
            provider_key("eu-west-1", "eu-west-1_AbCdEf"),
            "cognito-idp.eu-west-1.amazonaws.com/eu-west-1_AbCdEf"
        );
    }
}
