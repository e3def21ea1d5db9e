use super::Handler;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

/// One compiled handler entry.
pub struct Route {
    pattern: Regex,
    method: Option<String>,
    operation: Option<String>,
    handler: Arc<dyn Handler>,
}

impl Route {
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    pub fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }

    fn matches(&self, method: &str, url: &str) -> bool {
        let method_ok = self
            .method
            .as_deref()
            .map_or(true, |m| m.eq_ignore_ascii_case(method));
        method_ok && self.pattern.is_match(url)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern.as_str())
            .field("method", &self.method)
            .field("operation", &self.operation)
            .finish()
    }
}

/// A backend's handler table.
///
/// Path patterns are joined onto every URL base of the service, so a path
/// `/ping$` on base `^https?://svc1\.example\.com` compiles to
/// `^https?://svc1\.example\.com/ping$`. Entries are tried in the order they
/// were added and the first match wins. Matching runs against the URL with
/// its query string removed.
#[derive(Debug, Default)]
pub struct RouteTable {
    bases: Vec<String>,
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new<I, S>(bases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            bases: bases.into_iter().map(Into::into).collect(),
            routes: Vec::new(),
        }
    }

    /// Add a handler for `path` under every URL base, for any method.
    pub fn route(
        self,
        path: &str,
        operation: &str,
        handler: impl Handler,
    ) -> Result<Self, regex::Error> {
        self.add(None, path, Some(operation), Arc::new(handler))
    }

    /// Add a handler restricted to one HTTP method.
    pub fn route_method(
        self,
        method: &str,
        path: &str,
        operation: &str,
        handler: impl Handler,
    ) -> Result<Self, regex::Error> {
        self.add(Some(method), path, Some(operation), Arc::new(handler))
    }

    /// Add a handler whose operation is derived from the request itself
    /// (`X-Amz-Target` or `Action`), as query-protocol services need.
    pub fn route_any_operation(self, path: &str, handler: impl Handler) -> Result<Self, regex::Error> {
        self.add(None, path, None, Arc::new(handler))
    }

    fn add(
        mut self,
        method: Option<&str>,
        path: &str,
        operation: Option<&str>,
        handler: Arc<dyn Handler>,
    ) -> Result<Self, regex::Error> {
        let bases = if self.bases.is_empty() {
            vec![String::new()]
        } else {
            self.bases.clone()
        };
        for base in bases {
            let source = if base.is_empty() {
                path.to_string()
            } else {
                format!("(?:{}){}", base, path)
            };
            self.routes.push(Route {
                pattern: compile_anchored(&source)?,
                method: method.map(str::to_ascii_uppercase),
                operation: operation.map(str::to_string),
                handler: Arc::clone(&handler),
            });
        }
        Ok(self)
    }

    /// First entry matching `method` and `url`.
    pub fn find(&self, method: &str, url: &str) -> Option<&Route> {
        let url = url.split(['?', '#']).next().unwrap_or(url);
        self.routes.iter().find(|route| route.matches(method, url))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Distinct operation names, in declaration order.
    pub fn operations(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for op in self.routes.iter().filter_map(Route::operation) {
            if !seen.contains(&op) {
                seen.push(op);
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Compile a pattern so it only matches at the start of the input.
pub(crate) fn compile_anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})", pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ServiceRequest, ServiceResponse};

    fn pong(_: &ServiceRequest) -> crate::backend::HandlerResult {
        Ok(ServiceResponse::ok("pong"))
    }

    fn table() -> RouteTable {
        RouteTable::new([r"^https?://svc1\.example\.com"])
            .route("/ping$", "Ping", pong)
            .unwrap()
            .route_method("DELETE", "/items/[^/]+$", "DeleteItem", pong)
            .unwrap()
            .route("/items/.*", "GetItem", pong)
            .unwrap()
    }

    #[test]
    fn test_path_joined_to_base() {
        let table = table();
        let route = table.find("GET", "https://svc1.example.com/ping").unwrap();
        assert_eq!(route.operation(), Some("Ping"));
        assert!(table.find("GET", "https://svc1.example.com/pingx").is_none());
        assert!(table.find("GET", "https://evil.com/https://svc1.example.com/ping").is_none());
    }

    #[test]
    fn test_query_string_ignored_for_matching() {
        let table = table();
        let route = table.find("GET", "https://svc1.example.com/ping?x=1").unwrap();
        assert_eq!(route.operation(), Some("Ping"));
    }

    #[test]
    fn test_method_restriction_and_first_match_wins() {
        let table = table();
        let delete = table.find("delete", "http://svc1.example.com/items/a").unwrap();
        assert_eq!(delete.operation(), Some("DeleteItem"));
        let get = table.find("GET", "http://svc1.example.com/items/a").unwrap();
        assert_eq!(get.operation(), Some("GetItem"));
    }

    #[test]
    fn test_one_entry_per_base() {
        let table = RouteTable::new([r"https?://a\.example\.com", r"https?://b\.example\.com"])
            .route("/x$", "X", pong)
            .unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.find("GET", "https://b.example.com/x").is_some());
        assert_eq!(table.operations(), vec!["X"]);
    }

    #[test]
    fn test_alternation_base_keeps_path_on_every_branch() {
        let table = RouteTable::new([r"https?://a\.example\.com|https?://b\.example\.com"])
            .route("/ping$", "Ping", pong)
            .unwrap();
        assert!(table.find("GET", "https://a.example.com/ping").is_some());
        assert!(table.find("GET", "https://b.example.com/ping").is_some());
        assert!(table.find("GET", "https://a.example.com/anything/else").is_none());
        assert!(table.find("GET", "https://b.example.com/anything/else").is_none());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = RouteTable::new([r"https?://a\.example\.com"]).route("/(unclosed", "X", pong);
        assert!(result.is_err());
    }
}
