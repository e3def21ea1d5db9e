//! In-process interception of outbound HTTP calls.
//!
//! [`Interceptor`] answers requests whose URL belongs to a registered
//! service while the emulator is active; everything else passes through.
//! [`InterceptLayer`] wires it into any tower-based HTTP client.

mod layer;

pub use layer::{BoxError, InterceptLayer, InterceptService};

use crate::backend::{Headers, ServiceResponse};
use crate::dispatcher::{DispatchError, IncomingRequest};
use crate::emulator::Emulator;
use crate::wire::encode_response;
use bytes::Bytes;
use http_body_util::Full;
use hyper::Response;
use std::sync::Arc;
use tracing::debug;

/// A synthesised answer, as the client's response object would expose it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptedResponse {
    pub url: String,
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl InterceptedResponse {
    fn new(url: String, response: ServiceResponse) -> Self {
        Self {
            url,
            status: response.status,
            headers: response.headers,
            body: response.body,
        }
    }

    pub fn into_http(self) -> Response<Full<Bytes>> {
        encode_response(ServiceResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
        })
    }
}

#[derive(Clone)]
pub struct Interceptor {
    emulator: Arc<Emulator>,
}

impl Interceptor {
    pub fn new(emulator: Arc<Emulator>) -> Self {
        Self { emulator }
    }

    /// Interceptor over [`Emulator::global`].
    pub fn global() -> Self {
        Self::new(Emulator::global())
    }

    pub fn is_enabled(&self) -> bool {
        self.emulator.is_intercepting()
    }

    /// Whether a request to `url` would be answered in-process right now.
    pub fn matches(&self, url: &str) -> bool {
        self.is_enabled() && self.emulator.index().classify(url).is_some()
    }

    /// Answer `request` in-process, or return `None` to let it through.
    pub fn intercept(
        &self,
        request: IncomingRequest,
    ) -> Result<Option<InterceptedResponse>, DispatchError> {
        if !self.matches(&request.url) {
            debug!("Passing through {} {}", request.method, request.url);
            return Ok(None);
        }
        self.dispatch(request).map(Some)
    }

    /// Dispatch unconditionally, for callers that already checked
    /// [`matches`](Self::matches).
    pub fn dispatch(&self, request: IncomingRequest) -> Result<InterceptedResponse, DispatchError> {
        let url = request.url.clone();
        let response = self.emulator.dispatch(request)?;
        Ok(InterceptedResponse::new(url, response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, HandlerResult, RouteTable, ServiceRequest};
    use crate::config::EmulatorConfig;
    use crate::registry::{RegionScope, ServiceDescriptor};

    struct Ping {
        routes: RouteTable,
    }

    impl Backend for Ping {
        fn routes(&self) -> &RouteTable {
            &self.routes
        }

        fn reset(&self) {}
    }

    fn emulator() -> Arc<Emulator> {
        let emulator = Emulator::new(EmulatorConfig::default());
        emulator
            .register_service(
                ServiceDescriptor::new("svc1", RegionScope::Global, |_: &str, _: &str| {
                    Ok(Ping {
                        routes: RouteTable::new([r"^https?://svc1\.example\.com"]).route(
                            "/ping$",
                            "Ping",
                            |_: &ServiceRequest| -> HandlerResult {
                                Ok(ServiceResponse::ok("pong").with_header("X", "y"))
                            },
                        )?,
                    })
                })
                .url_base(r"^https?://svc1\.example\.com")
                .operation("Ping"),
            )
            .unwrap();
        emulator
    }

    #[test]
    fn test_disabled_passes_through() {
        let interceptor = Interceptor::new(emulator());
        let result = interceptor
            .intercept(IncomingRequest::new("GET", "https://svc1.example.com/ping"))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_unmatched_passes_through() {
        let emulator = emulator();
        emulator.set_intercepting(true);
        let interceptor = Interceptor::new(emulator);
        let result = interceptor
            .intercept(IncomingRequest::new("GET", "https://other.example.com/x"))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_matched_request_is_answered() {
        let emulator = emulator();
        emulator.set_intercepting(true);
        let interceptor = Interceptor::new(emulator);
        let response = interceptor
            .intercept(IncomingRequest::new("GET", "https://svc1.example.com/ping"))
            .unwrap()
            .unwrap();
        assert_eq!(response.url, "https://svc1.example.com/ping");
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"pong"));

        let http = response.into_http();
        assert_eq!(http.headers().get("x").unwrap(), "y");
        assert_eq!(http.headers().get("content-length").unwrap(), "4");
    }
}
