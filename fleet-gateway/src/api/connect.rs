use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::http::header::SEC_WEBSOCKET_PROTOCOL;
use axum::response::Response;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::Bearer;

use crate::FgwState;
use crate::connection::CLOSE_POLICY_VIOLATION;
use crate::middleware::auth::DEVICE_SESSION_HEADER;
use crate::router::{CustomerSessionClient, DeviceSessionClient};
use crate::token::{self, CustomerClaims};

/// Message-oriented device endpoint; the session token travels in the
/// upgrade request headers.
pub(super) async fn device_ws(
    State(state): State<FgwState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = headers
        .get(DEVICE_SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    ws.on_upgrade(move |socket| handle_device_ws(socket, state, token))
}

async fn handle_device_ws(socket: WebSocket, state: FgwState, token: Option<String>) {
    let claims = match token {
        Some(token) => match token::resolve_device_session(state.broker.as_ref(), &token).await {
            Ok(claims) => claims,
            Err(error) => {
                warn!(%error, "Device session lookup failed");
                None
            }
        },
        None => None,
    };

    let Some(claims) = claims else {
        // The protocol contract is a close with 1008, not an HTTP error.
        close_unauthenticated(socket).await;
        return;
    };

    if let Err(error) = DeviceSessionClient::builder()
        .state(state)
        .ws(socket)
        .claims(claims)
        .build()
        .run()
        .await
    {
        error!(error = format!("{error:#}"), "Device session failure");
    }
}

/// Message-oriented customer endpoint. The JWT arrives as a bearer header,
/// as the `auth-<jwt>` subprotocol (browsers cannot set headers), or in a
/// late `auth` frame; the server accepts any of the three.
pub(super) async fn customer_ws(
    State(state): State<FgwState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let subprotocol = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .split(',')
                .map(str::trim)
                .find(|candidate| candidate.starts_with("auth-"))
                .map(str::to_owned)
        });

    let token = bearer
        .map(|TypedHeader(authorization)| authorization.token().to_owned())
        .or_else(|| subprotocol.as_deref().map(|proto| proto["auth-".len()..].to_owned()));

    // A browser offering the auth subprotocol requires the server to select
    // it back for the handshake to complete.
    let ws = match subprotocol.clone() {
        Some(proto) => ws.protocols([proto]),
        None => ws,
    };

    ws.on_upgrade(move |socket| handle_customer_ws(socket, state, token, subprotocol))
}

async fn handle_customer_ws(
    socket: WebSocket,
    state: FgwState,
    token: Option<String>,
    subprotocol: Option<String>,
) {
    let claims = match token {
        Some(token) => match validate_customer_ws_token(&state, &token) {
            Ok(claims) => Some(claims),
            Err(()) => {
                close_unauthenticated(socket).await;
                return;
            }
        },
        // No credential on the upgrade: admitted pending a late auth frame.
        None => None,
    };

    if let Err(error) = CustomerSessionClient::builder()
        .state(state)
        .ws(socket)
        .claims(claims)
        .subprotocol(subprotocol)
        .build()
        .run()
        .await
    {
        error!(error = format!("{error:#}"), "Customer session failure");
    }
}

fn validate_customer_ws_token(state: &FgwState, token: &str) -> Result<CustomerClaims, ()> {
    let conf = state.conf_handle.get_conf();

    let result = if conf.debug.disable_token_validation {
        token::unsafe_debug::dangerous_validate_token(token)
    } else {
        match conf.issuer_public_key.as_ref() {
            Some(issuer_key) => token::validate_customer_token(token, issuer_key),
            None => {
                error!("Issuer public key is not configured");
                return Err(());
            }
        }
    };

    result.map_err(|error| {
        debug!(%error, "Customer WebSocket authentication failed");
    })
}

async fn close_unauthenticated(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: CLOSE_POLICY_VIOLATION,
        reason: "authentication failed".to_owned().into(),
    };

    let _ = socket.send(Message::Close(Some(frame))).await;
}
