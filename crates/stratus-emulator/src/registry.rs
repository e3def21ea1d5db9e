//! Process-wide directory of service backends.
//!
//! Each registered service owns a map of lazily constructed backend
//! instances keyed by `(account, region)`. Construction happens at most once
//! per key, even when several threads ask for the same instance at the same
//! time.

use crate::backend::Backend;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_ACCOUNT_ID: &str = "123456789012";
pub const GLOBAL_REGION: &str = "global";
pub const PREFERRED_REGION: &str = "us-east-1";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Service '{service}' is not available in region '{region}'")]
    UnknownRegion { service: String, region: String },

    #[error("Failed to construct {service} backend for account {account} in {region}: {source}")]
    Construction {
        service: String,
        account: String,
        region: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Where a service's instances live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionScope {
    Regional(Vec<String>),
    /// One partition-wide instance per account, under region `"global"`.
    Global,
}

impl RegionScope {
    pub fn regional<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RegionScope::Regional(regions.into_iter().map(Into::into).collect())
    }

    /// `"global"` is accepted by every scope, since it is the fallback
    /// region of services that do not list `us-east-1`.
    pub fn contains(&self, region: &str) -> bool {
        match self {
            RegionScope::Regional(regions) => {
                region == GLOBAL_REGION || regions.iter().any(|r| r == region)
            }
            RegionScope::Global => region == GLOBAL_REGION,
        }
    }

    /// Region the dispatcher uses for this service.
    pub fn preferred_region(&self) -> &str {
        if self.contains(PREFERRED_REGION) {
            PREFERRED_REGION
        } else {
            GLOBAL_REGION
        }
    }
}

pub type BackendFactory =
    Arc<dyn Fn(&str, &str) -> anyhow::Result<Arc<dyn Backend>> + Send + Sync>;

/// Everything the emulator needs to know to serve a service.
#[derive(Clone)]
pub struct ServiceDescriptor {
    name: String,
    scope: RegionScope,
    url_bases: Vec<String>,
    operations: Vec<String>,
    factory: BackendFactory,
}

impl ServiceDescriptor {
    /// `factory` is called as `factory(region, account)`.
    pub fn new<F, B>(name: impl Into<String>, scope: RegionScope, factory: F) -> Self
    where
        F: Fn(&str, &str) -> anyhow::Result<B> + Send + Sync + 'static,
        B: Backend,
    {
        let factory: BackendFactory = Arc::new(move |region: &str, account: &str| {
            let backend: Arc<dyn Backend> = Arc::new(factory(region, account)?);
            Ok(backend)
        });
        Self {
            name: name.into(),
            scope,
            url_bases: Vec::new(),
            operations: Vec::new(),
            factory,
        }
    }

    pub fn url_base(mut self, pattern: impl Into<String>) -> Self {
        self.url_bases.push(pattern.into());
        self
    }

    pub fn operation(mut self, name: impl Into<String>) -> Self {
        self.operations.push(name.into());
        self
    }

    pub fn operations<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operations.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> &RegionScope {
        &self.scope
    }

    pub fn url_bases(&self) -> &[String] {
        &self.url_bases
    }

    pub fn declared_operations(&self) -> &[String] {
        &self.operations
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("url_bases", &self.url_bases)
            .field("operations", &self.operations)
            .finish()
    }
}

type InstanceCell = Arc<OnceCell<Arc<dyn Backend>>>;

/// All instances of one service, keyed by `(account, region)`.
pub struct ServiceBackends {
    descriptor: ServiceDescriptor,
    instances: RwLock<HashMap<(String, String), InstanceCell>>,
}

impl ServiceBackends {
    fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn preferred_region(&self) -> &str {
        self.descriptor.scope.preferred_region()
    }

    /// Instance for `(account, region)`, constructing it on first access.
    pub fn instance(&self, account: &str, region: &str) -> Result<Arc<dyn Backend>, RegistryError> {
        if !self.descriptor.scope.contains(region) {
            return Err(RegistryError::UnknownRegion {
                service: self.descriptor.name.clone(),
                region: region.to_string(),
            });
        }

        let key = (account.to_string(), region.to_string());
        let cell = {
            let existing = self.instances.read().get(&key).cloned();
            match existing {
                Some(cell) => cell,
                None => Arc::clone(self.instances.write().entry(key).or_default()),
            }
        };

        // the map lock is released here; only this entry's cell serialises construction
        cell.get_or_try_init(|| {
            debug!(
                "Constructing {} backend for account {} in {}",
                self.descriptor.name, account, region
            );
            (self.descriptor.factory)(region, account)
        })
        .cloned()
        .map_err(|source| RegistryError::Construction {
            service: self.descriptor.name.clone(),
            account: account.to_string(),
            region: region.to_string(),
            source,
        })
    }

    /// `(account, region)` pairs with a constructed instance.
    pub fn materialized(&self) -> Vec<(String, String)> {
        let mut keys: Vec<_> = self
            .instances
            .read()
            .iter()
            .filter(|(_, cell)| cell.get().is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Reset every constructed instance; returns how many were reset.
    pub fn reset_all(&self) -> usize {
        let backends: Vec<Arc<dyn Backend>> = self
            .instances
            .read()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect();
        for backend in &backends {
            backend.reset();
        }
        backends.len()
    }
}

/// A `(service, account, region)` triple with a live instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BackendKey {
    pub service: String,
    pub account: String,
    pub region: String,
}

/// The set of `Service:Operation` names known to the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationCatalog {
    entries: BTreeSet<String>,
}

impl OperationCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: &str, operation: &str) {
        self.entries.insert(format!("{}:{}", service, operation));
    }

    /// Whether `selector` (a `Service:Operation` string) is known.
    pub fn contains(&self, selector: &str) -> bool {
        self.entries.contains(selector)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for OperationCatalog {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Service name to [`ServiceBackends`].
#[derive(Default)]
pub struct BackendRegistry {
    services: RwLock<HashMap<String, Arc<ServiceBackends>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing (and dropping the instances of) any
    /// previous registration under the same name.
    pub fn register(&self, descriptor: ServiceDescriptor) -> Arc<ServiceBackends> {
        let name = descriptor.name.clone();
        let backends = Arc::new(ServiceBackends::new(descriptor));
        let previous = self
            .services
            .write()
            .insert(name.clone(), Arc::clone(&backends));
        if previous.is_some() {
            info!("Replaced registration of service {}", name);
        } else {
            debug!("Registered service {}", name);
        }
        backends
    }

    pub fn get(&self, service: &str) -> Result<Arc<ServiceBackends>, RegistryError> {
        self.services
            .read()
            .get(service)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownService(service.to_string()))
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services.read().contains_key(service)
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn snapshot(&self) -> Vec<Arc<ServiceBackends>> {
        let mut services: Vec<_> = self.services.read().values().cloned().collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }

    /// Reset every materialised instance of every service.
    pub fn reset_all(&self) -> usize {
        self.snapshot().iter().map(|s| s.reset_all()).sum()
    }

    pub fn operation_catalog(&self) -> OperationCatalog {
        let mut catalog = OperationCatalog::new();
        for service in self.snapshot() {
            for operation in service.descriptor().declared_operations() {
                catalog.insert(service.name(), operation);
            }
        }
        catalog
    }

    pub fn materialized(&self) -> Vec<BackendKey> {
        self.snapshot()
            .iter()
            .flat_map(|service| {
                service
                    .materialized()
                    .into_iter()
                    .map(|(account, region)| BackendKey {
                        service: service.name().to_string(),
                        account,
                        region,
                    })
            })
            .collect()
    }
}
