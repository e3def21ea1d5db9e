//! Classification of request URLs to service names.

use crate::backend::compile_anchored;
use parking_lot::RwLock;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UrlIndexError {
    #[error("URL pattern for service '{service}' must start with the scheme: {pattern}")]
    Unanchored { service: String, pattern: String },

    #[error("Invalid URL pattern for service '{service}': {source}")]
    InvalidPattern {
        service: String,
        #[source]
        source: regex::Error,
    },
}

pub(crate) struct UrlPattern {
    service: String,
    regex: Regex,
}

impl UrlPattern {
    /// Validate and compile one pattern for `service`.
    pub(crate) fn compile(service: &str, pattern: &str) -> Result<Self, UrlIndexError> {
        let body = pattern.strip_prefix('^').unwrap_or(pattern);
        if !body.starts_with("http") {
            return Err(UrlIndexError::Unanchored {
                service: service.to_string(),
                pattern: pattern.to_string(),
            });
        }
        let regex = compile_anchored(pattern).map_err(|source| UrlIndexError::InvalidPattern {
            service: service.to_string(),
            source,
        })?;
        Ok(Self {
            service: service.to_string(),
            regex,
        })
    }
}

/// Ordered `(service, regex)` list; the first matching entry wins.
#[derive(Default)]
pub struct UrlPatternIndex {
    entries: RwLock<Vec<UrlPattern>>,
}

impl UrlPatternIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pattern. Duplicates are accepted and never shadow earlier
    /// entries.
    pub fn register(&self, service: &str, pattern: &str) -> Result<(), UrlIndexError> {
        let compiled = UrlPattern::compile(service, pattern)?;
        self.entries.write().push(compiled);
        Ok(())
    }

    /// Append already compiled patterns under a single write lock.
    pub(crate) fn extend(&self, patterns: Vec<UrlPattern>) {
        self.entries.write().extend(patterns);
    }

    pub fn classify(&self, url: &str) -> Option<String> {
        self.entries
            .read()
            .iter()
            .find(|entry| entry.regex.is_match(url))
            .map(|entry| entry.service.clone())
    }

    /// Registered services in first-registration order.
    pub fn services(&self) -> Vec<String> {
        let entries = self.entries.read();
        let mut services: Vec<String> = Vec::new();
        for entry in entries.iter() {
            if !services.contains(&entry.service) {
                services.push(entry.service.clone());
            }
        }
        services
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match_wins() {
        let index = UrlPatternIndex::new();
        index.register("s3", r"https?://.*\.s3\.amazonaws\.com").unwrap();
        index.register("catchall", r"https?://.*\.amazonaws\.com").unwrap();

        assert_eq!(
            index.classify("https://bucket.s3.amazonaws.com/key").as_deref(),
            Some("s3")
        );
        assert_eq!(
            index.classify("https://sqs.us-east-1.amazonaws.com/").as_deref(),
            Some("catchall")
        );
        assert_eq!(index.classify("https://other.example.com/x"), None);
    }

    #[test]
    fn test_matching_is_anchored_at_url_start() {
        let index = UrlPatternIndex::new();
        index.register("svc1", r"https?://svc1\.example\.com").unwrap();
        assert!(index
            .classify("https://evil.com/?next=https://svc1.example.com")
            .is_none());
    }

    #[test]
    fn test_duplicate_registration_keeps_classification() {
        let index = UrlPatternIndex::new();
        index.register("a", r"^https?://shared\.example\.com").unwrap();
        index.register("b", r"^https?://shared\.example\.com").unwrap();
        index.register("a", r"^https?://shared\.example\.com").unwrap();
        assert_eq!(
            index.classify("https://shared.example.com/").as_deref(),
            Some("a")
        );
        assert_eq!(index.services(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(index.len(), 3);
    }

    #[test]
    fn test_unanchored_pattern_rejected() {
        let index = UrlPatternIndex::new();
        let err = index.register("svc", r".*\.example\.com").unwrap_err();
        assert!(matches!(err, UrlIndexError::Unanchored { .. }));
        assert!(index.is_empty());
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let index = UrlPatternIndex::new();
        let err = index.register("svc", r"https?://(broken").unwrap_err();
        assert!(matches!(err, UrlIndexError::InvalidPattern { .. }));
    }
}
