use core::fmt;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

pub static REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Identifier assigned to one logical operation and carried across the HTTP
/// surface, message frames and broker records it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Reads the correlation id off the `X-Request-ID` header, minting a
    /// fresh one when the header is absent or malformed.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get(&REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value).ok())
            .map(Self)
            .unwrap_or_else(Self::new)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    pub fn header_value(&self) -> HeaderValue {
        // A hyphenated UUID is always a valid header value.
        HeaderValue::from_str(&self.0.to_string()).expect("UUID string is a valid header value")
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let id = CorrelationId::new();

        let mut headers = HeaderMap::new();
        headers.insert(&REQUEST_ID_HEADER, id.header_value());

        assert_eq!(CorrelationId::from_headers(&headers), id);
    }

    #[test]
    fn malformed_header_yields_fresh_id() {
        let mut headers = HeaderMap::new();
        headers.insert(&REQUEST_ID_HEADER, HeaderValue::from_static("not-a-uuid"));

        let a = CorrelationId::from_headers(&headers);
        let b = CorrelationId::from_headers(&headers);

        assert_ne!(a, b);
    }
}
