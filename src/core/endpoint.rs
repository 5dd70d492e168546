//! Endpoint definition and structural request matching.
//!
//! An endpoint matches on three axes combined with AND semantics:
//! * path: a literal prefix plus a glob-style suffix pattern where `**`
//!   matches any remaining segments (including none), `*` matches exactly one
//!   segment and `{name}` matches one segment and captures it as a path
//!   parameter
//! * method: exact case-insensitive match against the declared set, empty
//!   set matches any method
//! * content type: match on the media type essence (parameters such as
//!   charset are ignored), empty set matches anything
use std::collections::HashMap;

use http::{Method, StatusCode, request::Parts};
use thiserror::Error;

/// Errors raised while building an endpoint
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EndpointError {
    #[error("Endpoint prefix must start with '/', got: {0}")]
    InvalidPrefix(String),

    #[error("Invalid method in endpoint definition: {0}")]
    InvalidMethod(String),
}

/// Result type for endpoint construction
pub type EndpointResult<T> = Result<T, EndpointError>;

/// Path parameters extracted from `{name}` segments during a match.
pub type PathParams = HashMap<String, String>;

/// A pre-dispatch check run in declaration order after a structural match.
/// Returning `Err(status)` short-circuits dispatch with that status code.
pub type PreDispatchFilter =
    std::sync::Arc<dyn Fn(&Parts) -> Result<(), StatusCode> + Send + Sync>;

/// A single path/method/content-type matching rule with pre-dispatch filters.
///
/// Built once via [`EndpointBuilder`], immutable thereafter, owned by exactly
/// one resolver.
pub struct Endpoint {
    prefix: String,
    pattern_segments: Vec<PatternSegment>,
    methods: Vec<Method>,
    content_types: Vec<String>,
    filters: Vec<PreDispatchFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    /// `*` — exactly one segment
    AnyOne,
    /// `**` — any remaining segments, including none
    AnyRest,
    /// `{name}` — one segment, captured under `name`
    Param(String),
}

impl Endpoint {
    /// Start building an endpoint for the given path prefix.
    pub fn builder(prefix: &str) -> EndpointBuilder {
        EndpointBuilder::new(prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Structural match on path, method and content type.
    ///
    /// Returns the extracted path parameters on a match, `None` otherwise.
    /// No side effects; dispatch is the resolver's concern.
    pub fn matches(
        &self,
        path: &str,
        method: &Method,
        content_type: Option<&str>,
    ) -> Option<PathParams> {
        if !self.method_matches(method) || !self.content_type_matches(content_type) {
            return None;
        }
        self.path_matches(path)
    }

    /// Path-only match, used by tests and diagnostics.
    pub fn path_matches(&self, path: &str) -> Option<PathParams> {
        let rest = path.strip_prefix(&self.prefix)?;

        let mut params = PathParams::new();
        let rest_segments: Vec<&str> = rest
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();

        let mut position = 0usize;
        for pattern in &self.pattern_segments {
            match pattern {
                PatternSegment::AnyRest => return Some(params),
                PatternSegment::AnyOne => {
                    if position >= rest_segments.len() {
                        return None;
                    }
                    position += 1;
                }
                PatternSegment::Param(name) => {
                    let segment = rest_segments.get(position)?;
                    params.insert(name.clone(), (*segment).to_string());
                    position += 1;
                }
                PatternSegment::Literal(literal) => {
                    if rest_segments.get(position) != Some(&literal.as_str()) {
                        return None;
                    }
                    position += 1;
                }
            }
        }

        if position == rest_segments.len() {
            Some(params)
        } else {
            None
        }
    }

    fn method_matches(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }

    fn content_type_matches(&self, content_type: Option<&str>) -> bool {
        if self.content_types.is_empty() {
            return true;
        }
        let Some(value) = content_type else {
            return false;
        };
        // Compare on the media type essence, ignoring parameters.
        let essence = value
            .split(';')
            .next()
            .unwrap_or(value)
            .trim()
            .to_ascii_lowercase();
        self.content_types.iter().any(|allowed| *allowed == essence)
    }

    /// Run the pre-dispatch filters in declaration order.
    pub fn apply_filters(&self, head: &Parts) -> Result<(), StatusCode> {
        for filter in &self.filters {
            filter(head)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("prefix", &self.prefix)
            .field("pattern_segments", &self.pattern_segments)
            .field("methods", &self.methods)
            .field("content_types", &self.content_types)
            .field("filters", &self.filters.len())
            .finish()
    }
}

/// Staged builder for [`Endpoint`], validating at `build()`.
pub struct EndpointBuilder {
    prefix: String,
    pattern: String,
    methods: Vec<String>,
    content_types: Vec<String>,
    filters: Vec<PreDispatchFilter>,
}

impl EndpointBuilder {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            pattern: String::new(),
            methods: Vec::new(),
            content_types: Vec::new(),
            filters: Vec::new(),
        }
    }

    /// Glob-style suffix pattern applied after the prefix, e.g. `/**` or
    /// `/users/{id}`. An empty pattern matches the exact prefix only.
    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = pattern.to_string();
        self
    }

    /// Restrict the endpoint to a method. May be called repeatedly; no call
    /// means any method matches.
    pub fn method(mut self, method: &str) -> Self {
        self.methods.push(method.to_string());
        self
    }

    /// Restrict the endpoint to a content type (media type essence). May be
    /// called repeatedly; no call means any content type matches.
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_types.push(content_type.to_ascii_lowercase());
        self
    }

    /// Append a pre-dispatch filter. Filters run in declaration order.
    pub fn filter(
        mut self,
        filter: impl Fn(&Parts) -> Result<(), StatusCode> + Send + Sync + 'static,
    ) -> Self {
        self.filters.push(std::sync::Arc::new(filter));
        self
    }

    pub fn build(self) -> EndpointResult<Endpoint> {
        if !self.prefix.starts_with('/') {
            return Err(EndpointError::InvalidPrefix(self.prefix));
        }

        let mut methods = Vec::with_capacity(self.methods.len());
        for name in &self.methods {
            let method = Method::from_bytes(name.to_ascii_uppercase().as_bytes())
                .map_err(|_| EndpointError::InvalidMethod(name.clone()))?;
            methods.push(method);
        }

        let pattern_segments = self
            .pattern
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| match segment {
                "**" => PatternSegment::AnyRest,
                "*" => PatternSegment::AnyOne,
                _ if segment.starts_with('{') && segment.ends_with('}') => {
                    PatternSegment::Param(segment[1..segment.len() - 1].to_string())
                }
                _ => PatternSegment::Literal(segment.to_string()),
            })
            .collect();

        Ok(Endpoint {
            prefix: self.prefix,
            pattern_segments,
            methods,
            content_types: self.content_types,
            filters: self.filters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get() -> Method {
        Method::GET
    }

    #[test]
    fn test_prefix_and_rest_glob() {
        let endpoint = Endpoint::builder("/static").pattern("/**").build().unwrap();

        assert!(endpoint.matches("/static", &get(), None).is_some());
        assert!(endpoint.matches("/static/", &get(), None).is_some());
        assert!(endpoint.matches("/static/a/b/c.txt", &get(), None).is_some());
        assert!(endpoint.matches("/other/static", &get(), None).is_none());
    }

    #[test]
    fn test_single_segment_glob() {
        let endpoint = Endpoint::builder("/files").pattern("/*").build().unwrap();

        assert!(endpoint.matches("/files/a.txt", &get(), None).is_some());
        assert!(endpoint.matches("/files", &get(), None).is_none());
        assert!(endpoint.matches("/files/a/b", &get(), None).is_none());
    }

    #[test]
    fn test_named_parameter_extraction() {
        let endpoint = Endpoint::builder("/users")
            .pattern("/{id}/posts/{post}")
            .build()
            .unwrap();

        let params = endpoint.matches("/users/42/posts/7", &get(), None).unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
        assert_eq!(params.get("post").map(String::as_str), Some("7"));

        assert!(endpoint.matches("/users/42/posts", &get(), None).is_none());
    }

    #[test]
    fn test_empty_pattern_matches_exact_prefix() {
        let endpoint = Endpoint::builder("/health").build().unwrap();

        assert!(endpoint.matches("/health", &get(), None).is_some());
        assert!(endpoint.matches("/health/live", &get(), None).is_none());
    }

    #[test]
    fn test_method_set_empty_matches_any() {
        let endpoint = Endpoint::builder("/api").pattern("/**").build().unwrap();
        assert!(endpoint.matches("/api/x", &Method::DELETE, None).is_some());
    }

    #[test]
    fn test_method_match_is_case_insensitive_at_build() {
        let endpoint = Endpoint::builder("/api")
            .pattern("/**")
            .method("post")
            .build()
            .unwrap();

        assert!(endpoint.matches("/api/x", &Method::POST, None).is_some());
        assert!(endpoint.matches("/api/x", &Method::GET, None).is_none());
    }

    #[test]
    fn test_content_type_essence_match() {
        let endpoint = Endpoint::builder("/api")
            .pattern("/**")
            .content_type("application/json")
            .build()
            .unwrap();

        assert!(
            endpoint
                .matches("/api/x", &get(), Some("application/json; charset=utf-8"))
                .is_some()
        );
        assert!(endpoint.matches("/api/x", &get(), Some("text/plain")).is_none());
        // Declared set plus absent header: no match.
        assert!(endpoint.matches("/api/x", &get(), None).is_none());
    }

    #[test]
    fn test_filters_short_circuit_in_order() {
        let endpoint = Endpoint::builder("/admin")
            .pattern("/**")
            .filter(|head| {
                if head.headers.contains_key("authorization") {
                    Ok(())
                } else {
                    Err(StatusCode::UNAUTHORIZED)
                }
            })
            .filter(|_| Err(StatusCode::FORBIDDEN))
            .build()
            .unwrap();

        let (no_auth, _) = http::Request::builder()
            .uri("/admin/x")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(
            endpoint.apply_filters(&no_auth),
            Err(StatusCode::UNAUTHORIZED)
        );

        let (with_auth, _) = http::Request::builder()
            .uri("/admin/x")
            .header("authorization", "Bearer t")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(endpoint.apply_filters(&with_auth), Err(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        assert!(Endpoint::builder("static").pattern("/**").build().is_err());
    }
}
