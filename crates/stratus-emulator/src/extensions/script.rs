//! Rhai-backed extensions.

use super::Extension;
use crate::backend::{Headers, ServiceRequest, ServiceResponse};
use bytes::Bytes;
use parking_lot::Mutex;
use rhai::{CallFnOptions, Dynamic, Engine, FuncArgs, ImmutableString, Map, Scope, AST};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on operations a single hook call may perform.
pub const MAX_OPERATIONS: u64 = 200_000;

pub(crate) const REQUEST_HOOK: &str = "request_hook";
pub(crate) const RESPONSE_HOOK: &str = "response_hook";

/// Build the engine shared by all extensions loaded from one parser.
pub fn create_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_call_levels(64);
    engine.set_max_expr_depths(128, 64);

    engine.on_print(|text| info!(target: "stratus_emulator::extensions", "{}", text));
    engine.on_debug(|text, source, pos| {
        debug!(
            target: "stratus_emulator::extensions",
            "{} @ {:?} {}", text, source, pos
        )
    });

    // RFC 1123 timestamp for Date / Last-Modified headers
    engine.register_fn("timestamp_header", || -> String {
        chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string()
    });

    engine
}

/// Fully qualified script function names backing one extension.
#[derive(Debug, Clone, Default)]
pub(crate) struct HookFunctions {
    pub request_hook: Option<String>,
    pub response_hook: Option<String>,
}

/// One instantiated extension type from a script file.
#[derive(Debug)]
pub struct ScriptExtension {
    id: String,
    type_name: String,
    selector: BTreeSet<String>,
    hooks: HookFunctions,
    engine: Arc<Engine>,
    ast: Arc<AST>,
    state: Mutex<Dynamic>,
}

impl ScriptExtension {
    pub(crate) fn new(
        id: String,
        type_name: String,
        selector: BTreeSet<String>,
        hooks: HookFunctions,
        engine: Arc<Engine>,
        ast: Arc<AST>,
        state: Dynamic,
    ) -> Self {
        Self {
            id,
            type_name,
            selector,
            hooks,
            engine,
            ast,
            state: Mutex::new(state),
        }
    }

    /// Script-level type name (the `Type__` prefix, or the default type).
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Snapshot of the instance's `this` state.
    pub fn state(&self) -> Dynamic {
        self.state.lock().clone()
    }

    fn call_hook(&self, hook: &str, function: &str, args: impl FuncArgs) -> Option<ServiceResponse> {
        let mut this = self.state.lock();
        let options = CallFnOptions::new()
            .eval_ast(false)
            .rewind_scope(true)
            .bind_this_ptr(&mut *this);
        let result = self.engine.call_fn_with_options::<Dynamic>(
            options,
            &mut Scope::new(),
            &self.ast,
            function,
            args,
        );
        drop(this);

        match result {
            Ok(value) if value.is_unit() => None,
            Ok(value) => match dynamic_to_response(value) {
                Ok(response) => Some(response),
                Err(e) => {
                    warn!("Extension {} {} returned an invalid response: {}", self.id, hook, e);
                    None
                }
            },
            Err(e) => {
                warn!("Extension {} {} failed: {}", self.id, hook, e);
                None
            }
        }
    }
}

impl Extension for ScriptExtension {
    fn id(&self) -> &str {
        &self.id
    }

    fn selector(&self) -> &BTreeSet<String> {
        &self.selector
    }

    fn request_hook(&self, request: &ServiceRequest) -> Option<ServiceResponse> {
        let function = self.hooks.request_hook.as_deref()?;
        self.call_hook(REQUEST_HOOK, function, (request_to_dynamic(request),))
    }

    fn response_hook(&self, response: &ServiceResponse) -> Option<ServiceResponse> {
        let function = self.hooks.response_hook.as_deref()?;
        let args = (
            response.status as rhai::INT,
            Dynamic::from_map(headers_to_map(&response.headers)),
            Dynamic::from(response.body_text().into_owned()),
        );
        self.call_hook(RESPONSE_HOOK, function, args)
    }
}

fn headers_to_map(headers: &Headers) -> Map {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(
            name.to_ascii_lowercase().into(),
            Dynamic::from(value.to_string()),
        );
    }
    map
}

fn request_to_dynamic(request: &ServiceRequest) -> Dynamic {
    let mut map = Map::new();
    map.insert("method".into(), Dynamic::from(request.method.clone()));
    map.insert("url".into(), Dynamic::from(request.url.clone()));
    map.insert("path".into(), Dynamic::from(request.path().to_string()));
    map.insert(
        "headers".into(),
        Dynamic::from_map(headers_to_map(&request.headers)),
    );
    map.insert(
        "body".into(),
        Dynamic::from(request.body_text().into_owned()),
    );
    map.insert("service".into(), Dynamic::from(request.service.clone()));
    map.insert(
        "operation".into(),
        request
            .operation
            .clone()
            .map(Dynamic::from)
            .unwrap_or(Dynamic::UNIT),
    );

    let mut query = Map::new();
    for (k, v) in request.query_params() {
        query.insert(k.into(), Dynamic::from(v));
    }
    map.insert("query".into(), Dynamic::from_map(query));

    Dynamic::from_map(map)
}

/// Convert a hook's `#{status, headers, body}` map into a response.
pub(crate) fn dynamic_to_response(value: Dynamic) -> Result<ServiceResponse, String> {
    let type_name = value.type_name();
    let map = value
        .try_cast::<Map>()
        .ok_or_else(|| format!("expected a map or (), got {}", type_name))?;

    let status = match map.get("status") {
        Some(status) => status
            .as_int()
            .map_err(|t| format!("status must be an integer, got {}", t))?,
        None => 200,
    };
    let status = u16::try_from(status)
        .ok()
        .filter(|s| (100..=999).contains(s))
        .ok_or_else(|| format!("status {} is out of range", status))?;

    let mut headers = Headers::new();
    if let Some(raw) = map.get("headers") {
        let raw = raw
            .clone()
            .try_cast::<Map>()
            .ok_or_else(|| "headers must be a map".to_string())?;
        for (name, value) in raw {
            headers.insert(name.to_string(), value.to_string());
        }
    }

    let body = match map.get("body") {
        None => Bytes::new(),
        Some(body) if body.is_unit() => Bytes::new(),
        Some(body) if body.is_string() => {
            let text = body.clone().cast::<ImmutableString>();
            Bytes::from(text.to_string())
        }
        Some(body) if body.is_blob() => Bytes::from(body.clone().cast::<rhai::Blob>()),
        Some(body) if body.is_map() || body.is_array() => {
            let json: serde_json::Value = rhai::serde::from_dynamic(body)
                .map_err(|e| format!("body is not JSON-serialisable: {}", e))?;
            Bytes::from(json.to_string())
        }
        Some(body) => Bytes::from(body.to_string()),
    };

    Ok(ServiceResponse {
        status,
        headers,
        body,
    })
}
