//! Credential validation.
//!
//! Customers and web-portal principals authenticate with a JWT issued by
//! the identity provider and verified against its public key. Devices
//! authenticate with an opaque session token resolved through the broker
//! (`session:<token>`), provisioned out-of-band with a 7-day TTL.

use std::time::Duration;

use picky::jose::jws::RawJws;
use picky::jose::jwt::{JwtDate, JwtSig, JwtValidator};
use picky::key::PublicKey;
use time::OffsetDateTime;

use crate::broker::{self, Broker, BrokerError};
use crate::connection::ConnectionKind;

const LEEWAY_SECS: u16 = 60;

pub const DEVICE_SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortalScope {
    #[default]
    Customer,
    Approval,
    WebPortal,
}

impl PortalScope {
    pub fn connection_kind(self) -> ConnectionKind {
        match self {
            PortalScope::Customer => ConnectionKind::Customer,
            PortalScope::Approval => ConnectionKind::Approval,
            PortalScope::WebPortal => ConnectionKind::WebPortal,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerClaims {
    /// Principal id.
    pub sub: String,
    /// Tenant id; the top-level isolation boundary.
    pub tid: String,
    #[serde(default)]
    pub scope: PortalScope,
    pub exp: i64,
    #[serde(default)]
    pub iat: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("issuer public key is not configured")]
    MissingIssuerKey,
    #[error("invalid JWS token")]
    Jws {
        #[from]
        source: picky::jose::jws::JwsError,
    },
    #[error("failed to verify token signature")]
    SignatureVerification { source: picky::jose::jws::JwsError },
    #[error("invalid JWT")]
    Jwt {
        #[from]
        source: picky::jose::jwt::JwtError,
    },
    #[error("invalid claims for customer token")]
    InvalidClaimScheme { source: serde_json::Error },
}

/// Validates a customer JWT: signature against the issuer key, then strict
/// `exp`/`nbf` checks with a small leeway.
pub fn validate_customer_token(token: &str, issuer_key: &PublicKey) -> Result<CustomerClaims, TokenError> {
    let raw_jws = RawJws::decode(token)?;

    let jwt: JwtSig = raw_jws
        .verify(issuer_key)
        .map(JwtSig::from)
        .map_err(|source| TokenError::SignatureVerification { source })?;

    let timestamp_now = OffsetDateTime::now_utc().unix_timestamp();
    let now = JwtDate::new_with_leeway(timestamp_now, LEEWAY_SECS);
    let validator = JwtValidator::strict(now);

    let claims = jwt.validate::<serde_json::Value>(&validator)?.state.claims;

    serde_json::from_value(claims).map_err(|source| TokenError::InvalidClaimScheme { source })
}

pub mod unsafe_debug {
    //! Token handling for test and debug configurations only.

    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    use super::{CustomerClaims, TokenError};

    /// Parses the claims of a JWS-shaped token WITHOUT verifying its
    /// signature or temporal claims. Gated behind the
    /// `disable_token_validation` debug option; never reachable otherwise.
    pub fn dangerous_validate_token(token: &str) -> Result<CustomerClaims, TokenError> {
        let payload = token
            .split('.')
            .nth(1)
            .ok_or(TokenError::MissingIssuerKey)
            .and_then(|part| {
                URL_SAFE_NO_PAD.decode(part).map_err(|_| TokenError::MissingIssuerKey)
            })?;

        serde_json::from_slice(&payload).map_err(|source| TokenError::InvalidClaimScheme { source })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSessionClaims {
    pub device_id: String,
    pub tenant_id: String,
}

/// Resolves a device session token through the broker. An unknown or
/// expired token yields `None`; a malformed stored value is logged and
/// treated the same.
pub async fn resolve_device_session(
    broker: &dyn Broker,
    token: &str,
) -> Result<Option<DeviceSessionClaims>, BrokerError> {
    let Some(value) = broker.get(&broker::device_session_key(token)).await? else {
        return Ok(None);
    };

    match serde_json::from_value(value) {
        Ok(claims) => Ok(Some(claims)),
        Err(error) => {
            warn!(%error, "Malformed device session record in broker");
            Ok(None)
        }
    }
}

/// Provisions a device session token; exposed for the provisioning surface
/// and test setup.
pub async fn store_device_session(
    broker: &dyn Broker,
    token: &str,
    claims: &DeviceSessionClaims,
) -> Result<(), BrokerError> {
    let value = serde_json::to_value(claims)?;
    broker
        .set(&broker::device_session_key(token), value, Some(DEVICE_SESSION_TTL))
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[tokio::test]
    async fn device_session_round_trip() {
        let broker = MemoryBroker::new();

        let claims = DeviceSessionClaims {
            device_id: "d1".to_owned(),
            tenant_id: "tenant-1".to_owned(),
        };

        store_device_session(&broker, "tok-D1", &claims).await.unwrap();

        let resolved = resolve_device_session(&broker, "tok-D1").await.unwrap().unwrap();
        assert_eq!(resolved.device_id, "d1");
        assert_eq!(resolved.tenant_id, "tenant-1");

        assert!(resolve_device_session(&broker, "tok-unknown").await.unwrap().is_none());
    }

    #[test]
    fn debug_token_parsing_reads_claims() {
        use base64::Engine as _;
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;

        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(
            br#"{"sub":"op-1","tid":"tenant-1","scope":"web-portal","exp":0,"iat":0}"#,
        );
        let token = format!("{header}.{payload}.sig");

        let claims = unsafe_debug::dangerous_validate_token(&token).unwrap();
        assert_eq!(claims.sub, "op-1");
        assert_eq!(claims.tid, "tenant-1");
        assert_eq!(claims.scope, PortalScope::WebPortal);
    }
}
