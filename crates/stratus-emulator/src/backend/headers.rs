//! Case-insensitive header list shared by requests and responses.
//!
//! Names keep the spelling they were inserted with (handlers often care about
//! `Content-Type` vs `content-type` in their fixtures), while lookups ignore
//! ASCII case the way HTTP does.

use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use std::fmt;
use tracing::warn;

/// An ordered, case-insensitive list of string-valued headers.
#[derive(Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode raw header values as UTF-8.
    ///
    /// Returns the name of the first header whose value is not valid UTF-8.
    pub fn from_raw<I, K, V>(raw: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<[u8]>,
    {
        let mut headers = Headers::new();
        for (name, value) in raw {
            let name = name.into();
            match std::str::from_utf8(value.as_ref()) {
                Ok(value) => headers.append(name, value),
                Err(_) => return Err(name),
            }
        }
        Ok(headers)
    }

    /// Convert a hyper header map, rejecting non UTF-8 values.
    pub fn from_header_map(map: &HeaderMap) -> Result<Self, String> {
        Self::from_raw(map.iter().map(|(k, v)| (k.as_str(), v.as_bytes())))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set a header, replacing every existing entry with the same name.
    ///
    /// The first replaced entry keeps its position; returns its old value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(&name))
        {
            Some(pos) => {
                let old = std::mem::replace(&mut self.entries[pos], (name, value));
                let mut idx = pos + 1;
                while idx < self.entries.len() {
                    if self.entries[idx].0.eq_ignore_ascii_case(&old.0) {
                        self.entries.remove(idx);
                    } else {
                        idx += 1;
                    }
                }
                Some(old.1)
            }
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    /// Add a header without touching existing entries of the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut removed = None;
        self.entries.retain(|(k, v)| {
            if k.eq_ignore_ascii_case(name) {
                if removed.is_none() {
                    removed = Some(v.clone());
                }
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a hyper header map; entries that are not valid HTTP are skipped.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => warn!("Dropping header that is not valid HTTP: {}", name),
            }
        }
        map
    }
}

impl PartialEq for Headers {
    /// Equality ignores ordering and name case, like comparing two dicts.
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self.entries.iter().all(|(k, v)| {
                other
                    .entries
                    .iter()
                    .any(|(ok, ov)| ok.eq_ignore_ascii_case(k) && ov == v)
            })
    }
}

impl Eq for Headers {}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
