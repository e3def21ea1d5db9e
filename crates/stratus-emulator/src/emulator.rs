//! The emulator bundle: URL index, backend registry, extension pipeline and
//! the interception switch.

use crate::backend::ServiceResponse;
use crate::builtin;
use crate::config::EmulatorConfig;
use crate::dispatcher::{DispatchError, Dispatcher, IncomingRequest};
use crate::extensions::{ExtensionParseError, ExtensionPipeline};
use crate::registry::{BackendRegistry, ServiceBackends, ServiceDescriptor};
use crate::url_index::{UrlIndexError, UrlPattern, UrlPatternIndex};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

type ResetHook = Arc<dyn Fn() + Send + Sync>;

static GLOBAL: Lazy<Arc<Emulator>> = Lazy::new(|| Emulator::new(EmulatorConfig::from_env()));

pub struct Emulator {
    config: EmulatorConfig,
    index: UrlPatternIndex,
    registry: BackendRegistry,
    extensions: ExtensionPipeline,
    reset_hooks: RwLock<Vec<ResetHook>>,
    intercepting: AtomicBool,
}

impl Emulator {
    /// A fresh emulator with only the built-in management service.
    pub fn new(config: EmulatorConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let emulator = Self {
                config,
                index: UrlPatternIndex::new(),
                registry: BackendRegistry::new(),
                extensions: ExtensionPipeline::new(),
                reset_hooks: RwLock::new(Vec::new()),
                intercepting: AtomicBool::new(false),
            };
            if let Err(e) = emulator.register_service(builtin::descriptor(weak.clone())) {
                error!("Failed to register management service: {}", e);
            }
            emulator
        })
    }

    /// The process-wide emulator used by the interceptor and the proxy.
    pub fn global() -> Arc<Emulator> {
        Arc::clone(&GLOBAL)
    }

    /// Register a service: its URL bases go into the index and its factory
    /// into the registry. Nothing is registered if any URL base is invalid.
    pub fn register_service(
        &self,
        descriptor: ServiceDescriptor,
    ) -> Result<Arc<ServiceBackends>, UrlIndexError> {
        let patterns = descriptor
            .url_bases()
            .iter()
            .map(|base| UrlPattern::compile(descriptor.name(), base))
            .collect::<Result<Vec<_>, _>>()?;
        let name = descriptor.name().to_string();
        // registry first, so a classified URL always has a backend
        let backends = self.registry.register(descriptor);
        self.index.extend(patterns);
        info!("Service {} registered", name);
        Ok(backends)
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn index(&self) -> &UrlPatternIndex {
        &self.index
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn extensions(&self) -> &ExtensionPipeline {
        &self.extensions
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(
            &self.index,
            &self.registry,
            &self.extensions,
            &self.config.account_id,
        )
    }

    pub fn dispatch(&self, request: IncomingRequest) -> Result<ServiceResponse, DispatchError> {
        self.dispatcher().dispatch(request)
    }

    /// Load an extension script, validating selectors against the services
    /// registered so far.
    pub fn load_extensions(
        &self,
        path: impl AsRef<Path>,
        priority: i32,
    ) -> Result<Vec<String>, ExtensionParseError> {
        let catalog = self.registry.operation_catalog();
        self.extensions.load_file(path, priority, &catalog)
    }

    /// Run `hook` whenever backends are reset.
    pub fn register_reset_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.reset_hooks.write().push(Arc::new(hook));
    }

    /// Reset every materialised backend and run the reset hooks.
    pub fn reset(&self) -> usize {
        let count = self.registry.reset_all();
        let hooks: Vec<ResetHook> = self.reset_hooks.read().clone();
        for hook in &hooks {
            hook();
        }
        info!("Reset {} backend(s), ran {} reset hook(s)", count, hooks.len());
        count
    }

    pub fn is_intercepting(&self) -> bool {
        self.intercepting.load(Ordering::SeqCst)
    }

    pub fn set_intercepting(&self, enabled: bool) {
        self.intercepting.store(enabled, Ordering::SeqCst);
    }
}
