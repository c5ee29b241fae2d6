use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_cognitoidentityprovider::{
    Client,
    error::{DisplayErrorContext, SdkError},
    operation::initiate_auth::InitiateAuthError,
    types::AuthFlowType,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info};

use super::{IdentityProvider, TokenGrant};
use crate::error::AuthError;

/// Cognito user pool app client using the USER_PASSWORD_AUTH flow
#[derive(Debug, Clone)]
pub struct CognitoUserPool {
    client: Client,
    client_id: String,
    client_secret: Option<String>,
}

impl CognitoUserPool {
    pub fn new(config: &SdkConfig, client_id: String, client_secret: Option<String>) -> Self {
        Self {
            client: Client::new(config),
            client_id,
            client_secret,
        }
    }
}

#[async_trait]
impl IdentityProvider for CognitoUserPool {
    async fn password_auth(&self, username: &str, password: &str) -> Result<TokenGrant, AuthError> {
        info!("Calling Cognito InitiateAuth");
        debug!("Client ID: {}", self.client_id);

        let mut request = self
            .client
            .initiate_auth()
            .auth_flow(AuthFlowType::UserPasswordAuth)
            .client_id(&self.client_id)
            .auth_parameters("USERNAME", username)
            .auth_parameters("PASSWORD", password);

        if let Some(secret) = &self.client_secret {
            let hash = secret_hash(secret, username, &self.client_id)?;
            request = request.auth_parameters("SECRET_HASH", hash);
        }

        let response = request.send().await.map_err(classify)?;

        if let Some(challenge) = response.challenge_name() {
            return Err(AuthError::InvalidCredentials(format!(
                "unsupported challenge requested: {}",
                challenge.as_str()
            )));
        }

        let result = response.authentication_result().ok_or_else(|| {
            AuthError::InvalidCredentials("Cognito returned no authentication result".to_string())
        })?;

        let id_token = result.id_token().ok_or_else(|| {
            AuthError::InvalidCredentials("Cognito returned no ID token".to_string())
        })?;

        info!("Successfully obtained identity token");
        Ok(TokenGrant {
            id_token: id_token.to_string(),
            expires_in_seconds: i64::from(result.expires_in()),
        })
    }
}

/// Base64(HMAC-SHA256(client secret, username + client id)), required when the app client has a secret
fn secret_hash(secret: &str, username: &str, client_id: &str) -> Result<String, AuthError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| AuthError::InvalidCredentials(e.to_string()))?;
    mac.update(username.as_bytes());
    mac.update(client_id.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

fn classify(err: SdkError<InitiateAuthError>) -> AuthError {
    let message = DisplayErrorContext(&err).to_string();
    match err.as_service_error() {
        Some(service)
            if service.is_not_authorized_exception()
                || service.is_user_not_found_exception()
                || service.is_user_not_confirmed_exception()
                || service.is_password_reset_required_exception() =>
        {
            AuthError::InvalidCredentials(message)
        }
        _ => AuthError::Network(message),
    }
}
