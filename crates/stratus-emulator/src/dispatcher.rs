//! Request dispatch shared by the in-process interceptor and the proxy.

use crate::backend::{parse_query, split_url, HandlerError, Headers, ServiceRequest, ServiceResponse};
use crate::extensions::ExtensionPipeline;
use crate::metrics;
use crate::registry::{BackendRegistry, RegistryError};
use crate::url_index::UrlPatternIndex;
use bytes::Bytes;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Header '{0}' is not valid UTF-8")]
    InvalidHeader(String),

    #[error(transparent)]
    Backend(#[from] RegistryError),

    #[error("Handler for {service}:{} failed: {source}", .operation.as_deref().unwrap_or("?"))]
    Handler {
        service: String,
        operation: Option<String>,
        #[source]
        source: anyhow::Error,
    },
}

/// A raw request before header normalisation.
#[derive(Debug, Clone, Default)]
pub struct IncomingRequest {
    pub method: String,
    /// Full URL including scheme and host.
    pub url: String,
    pub headers: Vec<(String, Bytes)>,
    pub body: Bytes,
}

impl IncomingRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Build from hyper request parts; `url` must already be absolute.
    pub fn from_parts(parts: &hyper::http::request::Parts, url: String, body: Bytes) -> Self {
        Self {
            method: parts.method.as_str().to_string(),
            url,
            headers: parts
                .headers
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), Bytes::copy_from_slice(v.as_bytes())))
                .collect(),
            body,
        }
    }
}

/// Routes one request through classification, extensions and handlers.
pub struct Dispatcher<'a> {
    index: &'a UrlPatternIndex,
    registry: &'a BackendRegistry,
    extensions: &'a ExtensionPipeline,
    account_id: &'a str,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        index: &'a UrlPatternIndex,
        registry: &'a BackendRegistry,
        extensions: &'a ExtensionPipeline,
        account_id: &'a str,
    ) -> Self {
        Self {
            index,
            registry,
            extensions,
            account_id,
        }
    }

    /// Produce exactly one response for `request`.
    ///
    /// Unclassified URLs and URLs without a handler yield
    /// `(404, {}, "Not yet implemented")`. Only header decoding failures,
    /// backend construction failures and fatal handler errors are returned
    /// as `Err`.
    pub fn dispatch(&self, request: IncomingRequest) -> Result<ServiceResponse, DispatchError> {
        let started = Instant::now();
        let headers = Headers::from_raw(request.headers).map_err(DispatchError::InvalidHeader)?;

        let Some(service) = self.index.classify(&request.url) else {
            debug!("{} {} matches no service", request.method, request.url);
            return Ok(ServiceResponse::not_implemented());
        };

        let backends = match self.registry.get(&service) {
            Ok(backends) => backends,
            Err(RegistryError::UnknownService(_)) => {
                warn!("URL classified to unregistered service {}", service);
                return Ok(ServiceResponse::not_implemented());
            }
            Err(e) => return Err(e.into()),
        };
        let region = backends.preferred_region().to_string();
        let backend = backends.instance(self.account_id, &region)?;

        let route = backend.routes().find(&request.method, &request.url);
        let operation = route
            .and_then(|r| r.operation().map(str::to_string))
            .or_else(|| derive_operation(&headers, &request.url, &request.body));

        let service_request = ServiceRequest {
            method: request.method,
            url: request.url,
            headers,
            body: request.body,
            service,
            operation,
            account_id: self.account_id.to_string(),
            region,
        };
        debug!(
            "Dispatching {} {} to {}:{}",
            service_request.method,
            service_request.url,
            service_request.service,
            service_request.operation.as_deref().unwrap_or("?")
        );

        if let Some((id, response)) = self.extensions.run_request_hooks(&service_request) {
            debug!("Extension {} answered {}", id, service_request.url);
            metrics::record_short_circuit(&id);
            self.record(&service_request.service, response.status, started);
            return Ok(response);
        }

        let response = match route {
            None => ServiceResponse::not_implemented(),
            Some(route) => match route.handler().handle(&service_request) {
                Ok(response) => response.with_content_length(),
                Err(HandlerError::Domain(failure)) => failure.into_response().with_content_length(),
                Err(HandlerError::Fatal(source)) => {
                    metrics::record_handler_failure(&service_request.service);
                    return Err(DispatchError::Handler {
                        service: service_request.service,
                        operation: service_request.operation,
                        source,
                    });
                }
            },
        };

        let mut response = self.extensions.run_response_hooks(&service_request, response);
        if route.is_some() {
            // hooks may have rewritten the body
            response = response.with_content_length();
        }
        self.record(&service_request.service, response.status, started);
        Ok(response)
    }

    fn record(&self, service: &str, status: u16, started: Instant) {
        metrics::record_request(service, status, started.elapsed().as_secs_f64() * 1000.0);
    }
}

/// Operation name carried by the request itself: the `X-Amz-Target` suffix,
/// else an `Action` parameter in the query string or a form-encoded body.
fn derive_operation(headers: &Headers, url: &str, body: &[u8]) -> Option<String> {
    if let Some(target) = headers.get("x-amz-target") {
        let op = target.rsplit('.').next().unwrap_or(target);
        if !op.is_empty() {
            return Some(op.to_string());
        }
    }

    let (_, query) = split_url(url);
    if let Some(action) = query.and_then(|q| parse_query(q).remove("Action")) {
        return Some(action);
    }

    let is_form = headers
        .get("content-type")
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if is_form {
        let body = std::str::from_utf8(body).ok()?;
        return parse_query(body).remove("Action");
    }
    None
}
