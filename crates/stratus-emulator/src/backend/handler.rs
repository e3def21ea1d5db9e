use super::{Headers, ServiceRequest, ServiceResponse};
use bytes::Bytes;
use thiserror::Error;

/// A provider-level error answer (e.g. `NoSuchBucket`), returned to the
/// caller verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("domain error with status {status}")]
pub struct DomainError {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl DomainError {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn into_response(self) -> ServiceResponse {
        ServiceResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
        }
    }
}

/// Failure modes of a handler invocation.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Mapped to the response as-is.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A bug or unexpected state; surfaces out of the dispatcher.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

pub type HandlerResult = Result<ServiceResponse, HandlerError>;

/// A request handler declared in a backend's route table.
///
/// Handlers run synchronously on the dispatching thread and must not block
/// on network I/O. Any closure `Fn(&ServiceRequest) -> HandlerResult` is a
/// handler.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &ServiceRequest) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(&ServiceRequest) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, request: &ServiceRequest) -> HandlerResult {
        self(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_into_response() {
        let err = DomainError::new(404, "<Error><Code>NoSuchBucket</Code></Error>")
            .with_header("Content-Type", "application/xml");
        let resp = err.into_response();
        assert_eq!(resp.status, 404);
        assert_eq!(resp.headers.get("content-type"), Some("application/xml"));
    }

    #[test]
    fn test_question_mark_lifts_into_handler_error() {
        fn failing() -> HandlerResult {
            Err(DomainError::new(400, "bad"))?
        }
        fn fatal() -> HandlerResult {
            Err(anyhow::anyhow!("boom"))?
        }
        assert!(matches!(failing(), Err(HandlerError::Domain(_))));
        assert!(matches!(fatal(), Err(HandlerError::Fatal(_))));
    }
}
