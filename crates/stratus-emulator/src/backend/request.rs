use super::Headers;
use bytes::Bytes;
use std::borrow::Cow;
use std::collections::HashMap;

/// A classified request as seen by extensions and handlers.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
    /// Service the URL was classified to.
    pub service: String,
    /// Provider operation name, when one could be derived.
    pub operation: Option<String>,
    pub account_id: String,
    pub region: String,
}

impl ServiceRequest {
    /// Path component of the URL, always starting with `/`.
    pub fn path(&self) -> &str {
        split_url(&self.url).0
    }

    /// Raw query string without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        split_url(&self.url).1
    }

    /// Decoded query parameters; later duplicates win.
    pub fn query_params(&self) -> HashMap<String, String> {
        parse_query(self.query().unwrap_or(""))
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_params().remove(name)
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get("host").or_else(|| url_host(&self.url))
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// `Service:Operation` key used by extension selectors.
    pub fn selector_key(&self) -> Option<String> {
        self.operation
            .as_ref()
            .map(|op| format!("{}:{}", self.service, op))
    }
}

fn after_scheme(url: &str) -> &str {
    match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    }
}

fn url_host(url: &str) -> Option<&str> {
    let rest = after_scheme(url);
    let end = rest.find(['/', '?']).unwrap_or(rest.len());
    let host = &rest[..end];
    (!host.is_empty()).then_some(host)
}

/// Split a full URL into `(path, query)`.
pub(crate) fn split_url(url: &str) -> (&str, Option<&str>) {
    let rest = after_scheme(url);
    let path_and_query = match rest.find(['/', '?']) {
        Some(idx) => &rest[idx..],
        None => "",
    };
    let path_and_query = path_and_query.split('#').next().unwrap_or("");
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    if path.is_empty() {
        ("/", query)
    } else {
        (path, query)
    }
}

pub(crate) fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}
