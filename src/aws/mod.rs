use std::time::Duration;

use aws_config::{BehaviorVersion, Region, SdkConfig, timeout::TimeoutConfig};

pub mod broker;
pub mod identity_pool;
pub mod policy;
pub mod signer;

/// Short-lived bearer token proving a successful password authentication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityToken {
    pub token: String,
    pub expires_at_epoch_ms: i64,
}

impl IdentityToken {
    pub fn is_valid_at(&self, now_epoch_ms: i64) -> bool {
        now_epoch_ms < self.expires_at_epoch_ms
    }
}

/// Temporary credentials obtained by federating an identity token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// Expiry reported by the identity pool, if any
    pub expires_at_epoch_ms: Option<i64>,
}

// Re-export commonly used types (functions should be accessed via module path)
pub use broker::CredentialBroker;
pub use identity_pool::{CognitoIdentityPool, IdentityPool};
pub use policy::{AuthorizationBinder, IotPolicyStore, PolicyStore};
pub use signer::RequestSigner;

/// Per-operation timeout applied to every SDK call
const SDK_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Load an SDK config for unauthenticated Cognito calls in the given region
pub async fn load_sdk_config(region: &str) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region.to_string()))
        .no_credentials()
        .timeout_config(
            TimeoutConfig::builder()
                .operation_timeout(SDK_OPERATION_TIMEOUT)
                .build(),
        )
        .load()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_token_validity_is_exclusive() {
        let token = IdentityToken {
            token: "t".to_string(),
            expires_at_epoch_ms: 1_000,
        };
        assert!(token.is_valid_at(999));
        assert!(!token.is_valid_at(1_000));
        assert!(!token.is_valid_at(1_001));
    }
}
