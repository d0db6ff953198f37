use axum::Extension;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::http::HttpError;
use crate::token::{CustomerClaims, DeviceSessionClaims, PortalScope};
use crate::trace::CorrelationId;

/// Authenticated customer or web-portal principal, inserted by the auth
/// middleware.
#[derive(Clone)]
pub struct CustomerToken(pub CustomerClaims);

impl<S> FromRequestParts<S> for CustomerToken
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let claims = Extension::<CustomerClaims>::from_request_parts(parts, state)
            .await
            .map_err(|_| HttpError::unauthorized().msg("customer token required"))?
            .0;
        Ok(Self(claims))
    }
}

/// Authenticated device principal, inserted by the auth middleware.
#[derive(Clone)]
pub struct DeviceSession(pub DeviceSessionClaims);

impl<S> FromRequestParts<S> for DeviceSession
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let claims = Extension::<DeviceSessionClaims>::from_request_parts(parts, state)
            .await
            .map_err(|_| HttpError::unauthorized().msg("device session required"))?
            .0;
        Ok(Self(claims))
    }
}

/// Guard for routes restricted to the approval console scope.
#[derive(Clone, Copy)]
pub struct ApprovalScope;

impl<S> FromRequestParts<S> for ApprovalScope
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match CustomerToken::from_request_parts(parts, state).await?.0.scope {
            PortalScope::Approval => Ok(Self),
            _ => Err(HttpError::forbidden().msg("invalid scope for route")),
        }
    }
}

/// Correlation id minted or extracted by the log middleware; always
/// present.
#[derive(Clone, Copy)]
pub struct RequestId(pub CorrelationId);

impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let correlation_id = Extension::<CorrelationId>::from_request_parts(parts, state)
            .await
            .map(|extension| extension.0)
            .unwrap_or_default();
        Ok(Self(correlation_id))
    }
}
