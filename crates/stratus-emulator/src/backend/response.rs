use super::Headers;
use bytes::Bytes;

pub const NOT_IMPLEMENTED_BODY: &str = "Not yet implemented";

/// Status, headers and body produced for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl ServiceResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, body)
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string()).with_header("Content-Type", "application/json")
    }

    /// The `(404, {}, "Not yet implemented")` answer for unrouted requests.
    pub fn not_implemented() -> Self {
        Self::new(404, NOT_IMPLEMENTED_BODY)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set `Content-Length` to the body's byte length.
    pub fn with_content_length(mut self) -> Self {
        let len = self.body.len();
        self.headers.insert("Content-Length", len.to_string());
        self
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}
