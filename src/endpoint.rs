//! Endpoint normalization and URL assembly

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use url::Url;

use crate::{Error, Result};

/// Query parameter carrying the cache-busting timestamp
pub const CACHE_BUST_PARAM: &str = "_t";

/// Namespace used when no prefix is configured
pub const DEFAULT_API_PREFIX: &str = "api";

type Resolver = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// An endpoint as handed to `request`: a literal path or a deferred resolver
#[derive(Clone)]
pub enum Endpoint {
    /// Literal path or absolute URL
    Path(String),
    /// Resolved at call time
    Deferred(Resolver),
}

impl Endpoint {
    /// Endpoint resolved lazily on every call
    pub fn deferred<F>(f: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        Self::Deferred(Arc::new(f))
    }

    /// Raw endpoint string, `None` when absent or blank
    #[must_use]
    pub fn resolve(&self) -> Option<String> {
        let raw = match self {
            Self::Path(p) => Some(p.clone()),
            Self::Deferred(f) => f(),
        }?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Self::Path(s.to_string())
    }
}

impl From<String> for Endpoint {
    fn from(s: String) -> Self {
        Self::Path(s)
    }
}

impl From<&String> for Endpoint {
    fn from(s: &String) -> Self {
        Self::Path(s.clone())
    }
}

/// Whether `endpoint` is an absolute http(s) URL
#[must_use]
pub fn is_absolute(endpoint: &str) -> bool {
    let lower = endpoint.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Canonical form of a relative endpoint.
///
/// Leading and trailing slashes are stripped and `prefix` is prepended
/// unless the path already starts with that segment. Blank input yields
/// the bare prefix.
#[must_use]
pub fn normalize(raw: Option<&str>, prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let prefix = if prefix.is_empty() {
        DEFAULT_API_PREFIX
    } else {
        prefix
    };

    let path = raw.map(|r| r.trim().trim_matches('/')).unwrap_or_default();
    if path.is_empty() {
        return prefix.to_string();
    }

    let already_prefixed = path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/') || rest.starts_with('?'));

    if already_prefixed {
        path.to_string()
    } else {
        format!("{prefix}/{path}")
    }
}

/// Full URL for a dispatch.
///
/// Absolute URLs pass through untouched. Relative endpoints are normalized,
/// joined onto `base_url` and stamped with a cache-busting timestamp.
pub fn build_url(base_url: &str, endpoint: &str, prefix: &str) -> Result<String> {
    if is_absolute(endpoint) {
        return Ok(endpoint.trim().to_string());
    }

    let path = normalize(Some(endpoint), prefix);
    let base = base_url.trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/{path}"))
        .map_err(|e| Error::Config(format!("Invalid request URL for '{endpoint}': {e}")))?;

    url.query_pairs_mut()
        .append_pair(CACHE_BUST_PARAM, &Utc::now().timestamp_millis().to_string());

    Ok(url.into())
}

/// URL without the cache-busting stamp, for probes and the refresh call
pub fn plain_url(base_url: &str, endpoint: &str, prefix: &str) -> Result<String> {
    if is_absolute(endpoint) {
        return Ok(endpoint.trim().to_string());
    }
    let path = normalize(Some(endpoint), prefix);
    let base = base_url.trim_end_matches('/');
    let url = Url::parse(&format!("{base}/{path}"))
        .map_err(|e| Error::Config(format!("Invalid URL for '{endpoint}': {e}")))?;
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_slashes_and_prefixes() {
        assert_eq!(normalize(Some("/user/42/"), "api"), "api/user/42");
        assert_eq!(normalize(Some("raffles"), "api"), "api/raffles");
    }

    #[test]
    fn keeps_existing_prefix() {
        assert_eq!(normalize(Some("api/user/42"), "api"), "api/user/42");
        assert_eq!(normalize(Some("/api/"), "api"), "api");
        // same leading letters, different segment
        assert_eq!(normalize(Some("apiary/hives"), "api"), "api/apiary/hives");
    }

    #[test]
    fn blank_input_is_bare_prefix() {
        assert_eq!(normalize(None, "api"), "api");
        assert_eq!(normalize(Some(""), "api"), "api");
        assert_eq!(normalize(Some("  /  "), "api"), "api");
        assert_eq!(normalize(Some("x"), ""), "api/x");
    }

    #[test]
    fn deferred_endpoint_resolves_at_call_time() {
        let endpoint = Endpoint::deferred(|| Some(" tasks/daily ".to_string()));
        assert_eq!(endpoint.resolve().as_deref(), Some("tasks/daily"));
        assert!(Endpoint::deferred(|| None).resolve().is_none());
        assert!(Endpoint::from("   ").resolve().is_none());
    }

    #[test]
    fn absolute_urls_pass_through() {
        let url = build_url("http://localhost:8000", "https://cdn.example.com/x.json", "api").unwrap();
        assert_eq!(url, "https://cdn.example.com/x.json");
    }

    #[test]
    fn relative_urls_get_cache_bust() {
        let url = build_url("http://localhost:8000/", "user/42", "api").unwrap();
        assert!(url.starts_with("http://localhost:8000/api/user/42?_t="), "{url}");

        let url = build_url("http://localhost:8000", "tasks?page=2", "api").unwrap();
        assert!(url.contains("page=2&_t="), "{url}");
    }

    #[test]
    fn plain_url_has_no_stamp() {
        let url = plain_url("https://api.example.com", "health", "api").unwrap();
        assert_eq!(url, "https://api.example.com/api/health");
    }
}
