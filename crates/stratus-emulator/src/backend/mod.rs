//! The contract every emulated service backend satisfies.
//!
//! A backend owns the mutable in-memory state for one
//! `(service, account, region)` triple. It exposes a [`RouteTable`] mapping
//! URL patterns to [`Handler`]s and a `reset` that returns the state to what
//! a freshly constructed instance would hold.

mod handler;
mod headers;
mod request;
mod response;
mod routes;

pub use handler::{DomainError, Handler, HandlerError, HandlerResult};
pub use headers::Headers;
pub use request::ServiceRequest;
pub use response::{ServiceResponse, NOT_IMPLEMENTED_BODY};
pub use routes::{Route, RouteTable};

pub(crate) use request::{parse_query, split_url};
pub(crate) use routes::compile_anchored;

/// Per-(account, region) state container of one service.
///
/// Handlers are expected to guard their own state (typically with a single
/// mutex per backend); the dispatcher holds no locks while calling them.
pub trait Backend: Send + Sync + 'static {
    /// Handler table for this instance.
    fn routes(&self) -> &RouteTable;

    /// Drop all state, keeping the instance usable.
    fn reset(&self);
}
