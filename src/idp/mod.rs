pub mod cognito;

use async_trait::async_trait;

use crate::error::AuthError;

pub use self::cognito::CognitoUserPool;

/// Result of a successful password-grant exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub id_token: String,
    pub expires_in_seconds: i64,
}

/// Identity provider that trades a username/password for an identity token
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn password_auth(&self, username: &str, password: &str)
    -> Result<TokenGrant, AuthError>;
}
