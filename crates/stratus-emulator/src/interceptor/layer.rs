use super::Interceptor;
use crate::dispatcher::IncomingRequest;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Either, Full};
use hyper::body::Body;
use hyper::header::HOST;
use hyper::{Request, Response};
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::debug;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Wraps a client service so emulated URLs never reach the network.
#[derive(Clone)]
pub struct InterceptLayer {
    interceptor: Interceptor,
}

impl InterceptLayer {
    pub fn new(interceptor: Interceptor) -> Self {
        Self { interceptor }
    }
}

impl<S> Layer<S> for InterceptLayer {
    type Service = InterceptService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptService {
            inner,
            interceptor: self.interceptor.clone(),
        }
    }
}

#[derive(Clone)]
pub struct InterceptService<S> {
    inner: S,
    interceptor: Interceptor,
}

/// Absolute URL of a client request; origin-form URIs are completed from
/// the `Host` header.
fn absolute_url<B>(request: &Request<B>) -> String {
    let uri = request.uri();
    if uri.scheme().is_some() {
        return uri.to_string();
    }
    let host = request
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    format!("http://{}{}", host, path)
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for InterceptService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    ReqBody: Body + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Into<BoxError>,
{
    type Response = Response<Either<Full<Bytes>, ResBody>>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let url = absolute_url(&request);

        if !self.interceptor.matches(&url) {
            // the clone is not guaranteed ready, keep the one that is
            let clone = self.inner.clone();
            let mut inner = std::mem::replace(&mut self.inner, clone);
            return Box::pin(async move {
                let response = inner.call(request).await.map_err(Into::<BoxError>::into)?;
                Ok(response.map(Either::Right))
            });
        }

        let interceptor = self.interceptor.clone();
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let body = body
                .collect()
                .await
                .map_err(Into::<BoxError>::into)?
                .to_bytes();
            debug!("Intercepted {} {}", parts.method, url);
            let incoming = IncomingRequest::from_parts(&parts, url, body);
            let response = interceptor.dispatch(incoming)?;
            Ok(response.into_http().map(Either::Left))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, HandlerResult, RouteTable, ServiceRequest, ServiceResponse};
    use crate::config::EmulatorConfig;
    use crate::emulator::Emulator;
    use crate::registry::{RegionScope, ServiceDescriptor};
    use std::convert::Infallible;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Echo {
        routes: RouteTable,
    }

    impl Backend for Echo {
        fn routes(&self) -> &RouteTable {
            &self.routes
        }

        fn reset(&self) {}
    }

    fn emulator() -> Arc<Emulator> {
        let emulator = Emulator::new(EmulatorConfig::default());
        emulator
            .register_service(
                ServiceDescriptor::new("echo", RegionScope::Global, |_: &str, _: &str| {
                    Ok(Echo {
                        routes: RouteTable::new([r"https?://echo\.example\.com"]).route(
                            "/echo$",
                            "Echo",
                            |req: &ServiceRequest| -> HandlerResult {
                                Ok(ServiceResponse::ok(req.body.clone()))
                            },
                        )?,
                    })
                })
                .url_base(r"https?://echo\.example\.com"),
            )
            .unwrap();
        emulator.set_intercepting(true);
        emulator
    }

    async fn network(_: Request<Full<Bytes>>) -> Result<Response<Full<Bytes>>, Infallible> {
        Ok(Response::new(Full::new(Bytes::from_static(b"from network"))))
    }

    #[tokio::test]
    async fn test_matching_request_is_answered_in_process() {
        let service = InterceptLayer::new(Interceptor::new(emulator())).layer(tower::service_fn(network));
        let request = Request::post("https://echo.example.com/echo")
            .body(Full::new(Bytes::from_static(b"hello")))
            .unwrap();

        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers().get("content-length").unwrap(), "5");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_other_hosts_reach_inner_service() {
        let service = InterceptLayer::new(Interceptor::new(emulator())).layer(tower::service_fn(network));
        let request = Request::get("https://elsewhere.example.org/")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = service.oneshot(request).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"from network"));
    }

    #[tokio::test]
    async fn test_origin_form_uses_host_header() {
        let service = InterceptLayer::new(Interceptor::new(emulator())).layer(tower::service_fn(network));
        let request = Request::post("/echo")
            .header("Host", "echo.example.com")
            .body(Full::new(Bytes::from_static(b"x")))
            .unwrap();

        let response = service.oneshot(request).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"x"));
    }
}
