//! Management endpoints served under `motoapi.amazonaws.com/moto-api/`.

use crate::backend::{Backend, HandlerResult, RouteTable, ServiceRequest, ServiceResponse};
use crate::emulator::Emulator;
use crate::metrics::collect_metrics;
use crate::registry::{RegionScope, ServiceDescriptor};
use anyhow::anyhow;
use serde_json::json;
use std::sync::{Arc, Weak};

pub const SERVICE_NAME: &str = "emulator-api";
pub const URL_BASE: &str = r"^https?://motoapi\.amazonaws\.com";

pub(crate) fn descriptor(emulator: Weak<Emulator>) -> ServiceDescriptor {
    ServiceDescriptor::new(SERVICE_NAME, RegionScope::Global, move |_: &str, _: &str| {
        ManagementBackend::new(emulator.clone())
    })
    .url_base(URL_BASE)
    .operations(["ResetBackends", "Health", "ListBackends", "Metrics"])
}

struct ManagementBackend {
    routes: RouteTable,
}

fn upgrade(emulator: &Weak<Emulator>) -> Result<Arc<Emulator>, anyhow::Error> {
    emulator
        .upgrade()
        .ok_or_else(|| anyhow!("emulator is no longer alive"))
}

fn ok_status() -> ServiceResponse {
    ServiceResponse::json(200, &json!({ "status": "ok" }))
}

impl ManagementBackend {
    fn new(emulator: Weak<Emulator>) -> anyhow::Result<Self> {
        let reset_ref = emulator.clone();
        let list_ref = emulator;

        let routes = RouteTable::new([URL_BASE])
            .route_method(
                "POST",
                "/moto-api/reset/?$",
                "ResetBackends",
                move |_: &ServiceRequest| -> HandlerResult {
                    upgrade(&reset_ref)?.reset();
                    Ok(ok_status())
                },
            )?
            .route_method(
                "GET",
                "/moto-api/health/?$",
                "Health",
                |_: &ServiceRequest| -> HandlerResult { Ok(ok_status()) },
            )?
            .route_method(
                "GET",
                "/moto-api/backends/?$",
                "ListBackends",
                move |_: &ServiceRequest| -> HandlerResult {
                    let backends = upgrade(&list_ref)?.registry().materialized();
                    Ok(ServiceResponse::json(200, &json!(backends)))
                },
            )?
            .route_method(
                "GET",
                "/moto-api/metrics/?$",
                "Metrics",
                |_: &ServiceRequest| -> HandlerResult {
                    Ok(ServiceResponse::ok(collect_metrics())
                        .with_header("Content-Type", "text/plain; version=0.0.4"))
                },
            )?;
        Ok(Self { routes })
    }
}

impl Backend for ManagementBackend {
    fn routes(&self) -> &RouteTable {
        &self.routes
    }

    fn reset(&self) {}
}

#[cfg(test)]
mod tests {
    use crate::config::EmulatorConfig;
    use crate::dispatcher::IncomingRequest;
    use crate::emulator::Emulator;

    #[test]
    fn test_health() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let response = emulator
            .dispatch(IncomingRequest::new(
                "GET",
                "https://motoapi.amazonaws.com/moto-api/health",
            ))
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body_text(), r#"{"status":"ok"}"#);
        assert_eq!(response.headers.get("content-length"), Some("15"));
    }

    #[test]
    fn test_backends_lists_management_instance() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let response = emulator
            .dispatch(IncomingRequest::new(
                "GET",
                "http://motoapi.amazonaws.com/moto-api/backends",
            ))
            .unwrap();
        let listed: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(
            listed,
            serde_json::json!([{
                "service": "emulator-api",
                "account": "123456789012",
                "region": "global"
            }])
        );
    }

    #[test]
    fn test_reset_requires_post() {
        let emulator = Emulator::new(EmulatorConfig::default());
        let get = emulator
            .dispatch(IncomingRequest::new(
                "GET",
                "http://motoapi.amazonaws.com/moto-api/reset",
            ))
            .unwrap();
        assert_eq!(get.status, 404);

        let post = emulator
            .dispatch(IncomingRequest::new(
                "POST",
                "http://motoapi.amazonaws.com/moto-api/reset",
            ))
            .unwrap();
        assert_eq!(post.status, 200);
    }
}
