//! Extension pipeline: observers that can answer a request before it reaches
//! its handler, or replace the response afterwards.
//!
//! Extensions are kept sorted by priority (lowest first); equal priorities
//! run in registration order. An extension only sees requests whose
//! `Service:Operation` key is in its selector.

mod parser;
mod script;

pub use parser::{ExtensionParseError, ExtensionParser};
pub use script::{create_engine, ScriptExtension, MAX_OPERATIONS};

use crate::backend::{ServiceRequest, ServiceResponse};
use crate::registry::OperationCatalog;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A request/response observer.
pub trait Extension: Send + Sync {
    fn id(&self) -> &str;

    /// `Service:Operation` keys this extension applies to.
    fn selector(&self) -> &BTreeSet<String>;

    /// Returning a response short-circuits dispatch.
    fn request_hook(&self, _request: &ServiceRequest) -> Option<ServiceResponse> {
        None
    }

    /// Returning a response replaces the current one.
    fn response_hook(&self, _response: &ServiceResponse) -> Option<ServiceResponse> {
        None
    }

    fn selects(&self, key: &str) -> bool {
        self.selector().contains(key)
    }
}

struct Registered {
    priority: i32,
    seq: u64,
    extension: Arc<dyn Extension>,
}

#[derive(Default)]
pub struct ExtensionPipeline {
    entries: RwLock<Vec<Registered>>,
    next_seq: AtomicU64,
}

impl ExtensionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an extension. An extension already registered under the same id
    /// is replaced.
    pub fn register(&self, priority: i32, extension: Arc<dyn Extension>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write();
        entries.retain(|e| e.extension.id() != extension.id());
        let pos = entries
            .iter()
            .position(|e| (e.priority, e.seq) > (priority, seq))
            .unwrap_or(entries.len());
        debug!(
            "Registered extension {} at priority {}",
            extension.id(),
            priority
        );
        entries.insert(
            pos,
            Registered {
                priority,
                seq,
                extension,
            },
        );
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| e.extension.id() != id);
        before != entries.len()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Ids in execution order.
    pub fn ids(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|e| e.extension.id().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Parse a script file and register every extension it defines.
    ///
    /// Extensions from one file share `priority` and are registered in id
    /// order. Returns the registered ids.
    pub fn load_file(
        &self,
        path: impl AsRef<Path>,
        priority: i32,
        catalog: &OperationCatalog,
    ) -> Result<Vec<String>, ExtensionParseError> {
        let path = path.as_ref();
        let parsed = ExtensionParser::new(catalog.clone()).parse_file(path)?;
        let ids: Vec<String> = parsed.keys().cloned().collect();
        for extension in parsed.into_values() {
            self.register(priority, extension);
        }
        info!("Loaded {} extension(s) from {}", ids.len(), path.display());
        Ok(ids)
    }

    /// Snapshot of the extensions selecting `key`, in execution order.
    ///
    /// Hooks run on the snapshot so the pipeline lock is never held while
    /// script code executes.
    fn selected(&self, key: &str) -> Vec<Arc<dyn Extension>> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.extension.selects(key))
            .map(|e| Arc::clone(&e.extension))
            .collect()
    }

    /// Run request hooks; the first answer wins and is returned with the id
    /// of the extension that produced it.
    pub fn run_request_hooks(&self, request: &ServiceRequest) -> Option<(String, ServiceResponse)> {
        let key = request.selector_key()?;
        self.selected(&key).into_iter().find_map(|extension| {
            extension
                .request_hook(request)
                .map(|response| (extension.id().to_string(), response))
        })
    }

    /// Run response hooks in order; each replacement is what later hooks see.
    pub fn run_response_hooks(
        &self,
        request: &ServiceRequest,
        mut response: ServiceResponse,
    ) -> ServiceResponse {
        let Some(key) = request.selector_key() else {
            return response;
        };
        for extension in self.selected(&key) {
            if let Some(replacement) = extension.response_hook(&response) {
                debug!("Extension {} replaced response", extension.id());
                response = replacement;
            }
        }
        response
    }
}
