//! SigV4 presigning of the MQTT-over-WebSocket upgrade URL.
//!
//! The remote verifier recomputes the signature from the same canonical
//! request, so every byte here matters: parameter order, percent-encoding,
//! and the trailing newline after the canonical headers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::AccessCredentials;
use crate::{clock::Clock, constants::MQTT_PATH, error::SigningError};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNED_HEADERS: &str = "host";

/// Endpoint being signed for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningContext {
    pub endpoint_host: String,
    pub region: String,
    pub service_name: String,
    pub date_stamp: String,
    pub amz_datetime: String,
}

impl SigningContext {
    pub fn new(endpoint_host: &str, region: &str, service_name: &str, at: DateTime<Utc>) -> Self {
        let amz_datetime = at.format("%Y%m%dT%H%M%SZ").to_string();
        Self {
            endpoint_host: endpoint_host.to_string(),
            region: region.to_string(),
            service_name: service_name.to_string(),
            date_stamp: amz_datetime[..8].to_string(),
            amz_datetime,
        }
    }

    fn credential_scope(&self) -> String {
        format!(
            "{}/{}/{}/aws4_request",
            self.date_stamp, self.region, self.service_name
        )
    }
}

pub struct RequestSigner {
    clock: Arc<dyn Clock>,
}

impl RequestSigner {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Produce a presigned `wss://` URL for the current time
    pub fn sign(
        &self,
        credentials: &AccessCredentials,
        endpoint_host: &str,
        region: &str,
        service_name: &str,
    ) -> Result<String, SigningError> {
        let context = SigningContext::new(endpoint_host, region, service_name, self.clock.now());
        presign(credentials, &context)
    }
}

/// Presign a `GET /mqtt` request in the given context
pub fn presign(
    credentials: &AccessCredentials,
    context: &SigningContext,
) -> Result<String, SigningError> {
    let scope = context.credential_scope();

    let mut params = vec![
        ("X-Amz-Algorithm", ALGORITHM.to_string()),
        (
            "X-Amz-Credential",
            format!("{}/{scope}", credentials.access_key_id),
        ),
        ("X-Amz-Date", context.amz_datetime.clone()),
        ("X-Amz-SignedHeaders", SIGNED_HEADERS.to_string()),
    ];
    if let Some(token) = &credentials.session_token {
        params.push(("X-Amz-Security-Token", token.clone()));
    }

    let query = canonical_query(&params);
    let request = canonical_request(&context.endpoint_host, &query);
    let request_hash = sha256_hex(request.as_bytes());
    let string_to_sign = [
        ALGORITHM,
        context.amz_datetime.as_str(),
        scope.as_str(),
        request_hash.as_str(),
    ]
    .join("\n");

    let key = signing_key(&credentials.secret_access_key, context)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    params.push(("X-Amz-Signature", signature));
    Ok(format!(
        "wss://{}{MQTT_PATH}?{}",
        context.endpoint_host,
        canonical_query(&params)
    ))
}

/// Sort by key and percent-encode both sides (everything but `A-Za-z0-9-._~`)
fn canonical_query(params: &[(&str, String)]) -> String {
    let mut sorted: Vec<_> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn canonical_request(host: &str, canonical_query: &str) -> String {
    let headers = format!("host:{host}\n");
    let payload_hash = sha256_hex(b"");
    [
        "GET",
        MQTT_PATH,
        canonical_query,
        headers.as_str(),
        SIGNED_HEADERS,
        payload_hash.as_str(),
    ]
    .join("\n")
}

fn signing_key(secret: &str, context: &SigningContext) -> Result<Vec<u8>, SigningError> {
    let k_date = hmac_sha256(
        format!("AWS4{secret}").as_bytes(),
        context.date_stamp.as_bytes(),
    )?;
    let k_region = hmac_sha256(&k_date, context.region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, context.service_name.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
