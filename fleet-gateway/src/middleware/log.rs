use std::time::Instant;

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument as _;

use crate::http::HttpError;
use crate::trace::{CorrelationId, REQUEST_ID_HEADER};

/// Stamps every request with a correlation id, wraps it in a request span
/// and reflects the id back on the `X-Request-ID` response header.
pub async fn log_middleware(mut request: Request<Body>, next: Next) -> Result<Response, HttpError> {
    let correlation_id = CorrelationId::from_headers(request.headers());
    request.extensions_mut().insert(correlation_id);

    let uri_path = request.uri().path();
    let method = request.method();

    let is_health_check = uri_path == "/healthz" || uri_path == "/readyz";

    let span = if uri_path.len() > 512 {
        // Truncate long URI to keep log readable and prevent fast growing log file
        info_span!("request", %method, path = %&uri_path[..512], request_id = %correlation_id)
    } else {
        info_span!("request", %method, path = %uri_path, request_id = %correlation_id)
    };

    async move {
        let start_time = Instant::now();

        debug!("Received request");

        let mut response = next.run(request).await;

        response
            .headers_mut()
            .insert(&REQUEST_ID_HEADER, correlation_id.header_value());

        let status = response.status();

        if is_health_check {
            debug!(duration = ?start_time.elapsed(), %status);
        } else {
            info!(duration = ?start_time.elapsed(), %status);
        }

        Ok(response)
    }
    .instrument(span)
    .await
}
