//! Conversion of emulator responses to HTTP/1.1 wire responses.

use crate::backend::ServiceResponse;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::http::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Response, StatusCode};
use std::str::FromStr;
use tracing::warn;

/// Encode a response with its headers verbatim and `Content-Length` set to
/// the body's byte length.
pub fn encode_response(response: ServiceResponse) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(response.status).unwrap_or_else(|_| {
        warn!("Handler produced invalid status {}, sending 500", response.status);
        StatusCode::INTERNAL_SERVER_ERROR
    });

    let mut headers = response.headers.to_header_map();
    headers.remove(TRANSFER_ENCODING);
    headers.insert(CONTENT_LENGTH, HeaderValue::from(response.body.len()));

    let mut encoded = Response::new(Full::new(response.body));
    *encoded.status_mut() = status;
    *encoded.headers_mut() = headers;
    encoded
}

/// Responses the proxy synthesises itself (errors, the CA download).
pub struct ErrorResponseBuilder {
    status: StatusCode,
    body: Option<Bytes>,
    headers: HeaderMap,
}

impl ErrorResponseBuilder {
    pub fn new(status_code: StatusCode) -> Self {
        ErrorResponseBuilder {
            status: status_code,
            body: None,
            headers: Default::default(),
        }
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn build_full(self) -> Response<Full<Bytes>> {
        let payload = self.body.unwrap_or_default();
        let mut headers = self.headers;
        headers.insert(CONTENT_LENGTH, HeaderValue::from(payload.len()));

        let mut response = Response::new(Full::new(payload));
        *response.status_mut() = self.status;
        *response.headers_mut() = headers;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_encode_sets_content_length_and_keeps_headers() {
        let response = ServiceResponse::new(201, "created")
            .with_header("X-Amz-Request-Id", "abc")
            .with_header("Transfer-Encoding", "chunked")
            .with_header("Content-Length", "999");
        let encoded = encode_response(response);

        assert_eq!(encoded.status(), StatusCode::CREATED);
        assert_eq!(encoded.headers().get("x-amz-request-id").unwrap(), "abc");
        assert_eq!(encoded.headers().get(CONTENT_LENGTH).unwrap(), "7");
        assert!(encoded.headers().get(TRANSFER_ENCODING).is_none());

        let body = encoded.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"created"));
    }

    #[test]
    fn test_invalid_status_becomes_500() {
        let encoded = encode_response(ServiceResponse::new(42, ""));
        assert_eq!(encoded.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_builder() {
        let response = ErrorResponseBuilder::new(StatusCode::BAD_GATEWAY)
            .body("upstream failed")
            .header("Content-Type", "text/plain")
            .header("bad header", "ignored")
            .build_full();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("content-type").unwrap(), "text/plain");
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "15");
        assert_eq!(response.headers().len(), 2);
    }
}
