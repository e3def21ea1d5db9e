//! Stratus: an emulator for cloud provider HTTP APIs.
//!
//! Services register a [`ServiceDescriptor`] with the [`Emulator`]. Outbound
//! requests are answered either in-process through the [`Interceptor`] (and
//! its tower [`InterceptLayer`]) or over the network by the MITM
//! [`ProxyServer`]. [`lifecycle::activate`] scopes interception and resets
//! backend state when the outermost scope ends.

pub mod backend;
pub mod builtin;
pub mod config;
pub mod dispatcher;
pub mod emulator;
pub mod extensions;
pub mod interceptor;
pub mod lifecycle;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod url_index;
pub mod wire;

pub use backend::{
    Backend, DomainError, Handler, HandlerError, HandlerResult, Headers, RouteTable,
    ServiceRequest, ServiceResponse,
};
pub use config::{EmulatorConfig, ProxyConfig, StubCredentials};
pub use dispatcher::{DispatchError, IncomingRequest};
pub use emulator::Emulator;
pub use extensions::{Extension, ExtensionParseError, ExtensionPipeline};
pub use interceptor::{InterceptLayer, InterceptedResponse, Interceptor};
pub use lifecycle::{activate, ActivationGuard, LifecycleController, LifecycleError};
pub use proxy::{CaMaterial, CertificateStore, ProxyServer};
pub use registry::{BackendRegistry, RegionScope, RegistryError, ServiceDescriptor};
pub use url_index::{UrlIndexError, UrlPatternIndex};
