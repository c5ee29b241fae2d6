use thiserror::Error;

/// Failure while obtaining an identity token or federated credentials
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("identity provider rejected the credentials: {0}")]
    InvalidCredentials(String),
    #[error("network failure during authentication: {0}")]
    Network(String),
    #[error("identity pool rejected the federation request: {0}")]
    FederationRejected(String),
}

impl AuthError {
    /// Stable machine-readable reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidCredentials(_) => "invalid_credentials",
            Self::Network(_) => "network",
            Self::FederationRejected(_) => "federation_rejected",
        }
    }
}

/// Unreachable with well-formed inputs; a contract violation rather than a runtime condition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("invalid HMAC key: {0}")]
    InvalidKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("upgrade rejected as unauthorized (HTTP {status})")]
    Unauthorized { status: u16 },
    #[error("upgrade rejected (HTTP {status})")]
    Handshake { status: u16 },
    #[error("socket error: {0}")]
    Socket(String),
    #[error("connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("broker refused the request: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether the remote end refused our credentials rather than the transport failing
    pub fn is_auth_related(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

/// Policy attachment failure; logged and never fatal to a connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationWarning {
    #[error("could not resolve federated identity: {0}")]
    Identity(#[from] AuthError),
    #[error("could not list attached policies: {0}")]
    ListPolicies(String),
    #[error("could not attach policy: {0}")]
    AttachPolicy(String),
}

/// Any failure that drives the reconnection state machine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
