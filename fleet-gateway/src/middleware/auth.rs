use axum::RequestPartsExt as _;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;

use crate::FgwState;
use crate::http::HttpError;
use crate::token;

pub const DEVICE_SESSION_HEADER: &str = "x-device-session";

struct AuthException {
    method: Method,
    path: &'static str,
    exact_match: bool,
}

const AUTH_EXCEPTIONS: &[AuthException] = &[
    // -- Non sensitive information required for diagnostics -- //
    AuthException {
        method: Method::GET,
        path: "/healthz",
        exact_match: true,
    },
    AuthException {
        method: Method::GET,
        path: "/readyz",
        exact_match: true,
    },
    // -- WebSocket endpoints authenticate in the session router -- //
    AuthException {
        method: Method::GET,
        path: "/api/v1/device/ws",
        exact_match: true,
    },
    AuthException {
        method: Method::GET,
        path: "/api/v1/customer/ws",
        exact_match: true,
    },
    // -- Guarded by the internal auth token instead -- //
    AuthException {
        method: Method::GET,
        path: "/api/v1/internal/metrics",
        exact_match: true,
    },
];

pub async fn auth_middleware(
    State(state): State<FgwState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, HttpError> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct TokenQueryParam<'a> {
        token: &'a str,
    }

    let method = request.method();
    let uri_path = request.uri().path();

    let skip_authentication = AUTH_EXCEPTIONS.iter().any(|exception| {
        if method != exception.method {
            return false;
        }

        if exception.exact_match {
            uri_path == exception.path
        } else {
            uri_path.starts_with(exception.path)
        }
    });

    if skip_authentication {
        trace!("unauthenticated route");
        return Ok(next.run(request).await);
    }

    let (mut parts, body) = request.into_parts();

    // Devices present an opaque session token header.
    if let Some(device_token) = parts
        .headers
        .get(DEVICE_SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        let claims = token::resolve_device_session(state.broker.as_ref(), device_token)
            .await
            .map_err(HttpError::internal().err())?
            .ok_or_else(|| HttpError::unauthorized().msg("unknown or expired device session"))?;

        let mut request = Request::from_parts(parts, body);
        request.extensions_mut().insert(claims);

        return Ok(next.run(request).await);
    }

    // Customers present a bearer JWT, either as a header or (for browser
    // clients that cannot set headers) a query parameter.
    let extract_header = parts.extract::<TypedHeader<Authorization<Bearer>>>().await;

    let bearer = match &extract_header {
        Ok(auth) => auth.token().to_owned(),
        Err(_) => {
            let query = parts.uri.query().unwrap_or_default();

            let Ok(query) = serde_urlencoded::from_str::<TokenQueryParam<'_>>(query) else {
                return Err(HttpError::unauthorized()
                    .msg("both authorization header and token query param invalid or missing"));
            };

            query.token.to_owned()
        }
    };

    let conf = state.conf_handle.get_conf();

    let claims = if conf.debug.disable_token_validation {
        token::unsafe_debug::dangerous_validate_token(&bearer)
    } else {
        let issuer_key = conf
            .issuer_public_key
            .as_ref()
            .ok_or_else(|| HttpError::internal().msg("issuer public key is not configured"))?;
        token::validate_customer_token(&bearer, issuer_key)
    }
    .map_err(HttpError::unauthorized().err())?;

    let mut request = Request::from_parts(parts, body);
    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}
