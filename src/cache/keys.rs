//! Cache key definitions.
//!
//! Defines `CacheKey` for stored responses and `InvalidationPattern` for bulk
//! selection of the keys that belong to a resource path.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;

use axum::http::Method;
use thiserror::Error;
use url::form_urlencoded;

/// Namespace applied when configuration does not override it.
pub const DEFAULT_NAMESPACE: &str = "cache";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("request path must not be empty")]
    EmptyPath,
}

/// A single query parameter value, or every value of a repeated parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryValue {
    One(String),
    Many(Vec<String>),
}

impl QueryValue {
    fn push(&mut self, value: String) {
        match self {
            QueryValue::One(first) => {
                let first = std::mem::take(first);
                *self = QueryValue::Many(vec![first, value]);
            }
            QueryValue::Many(values) => values.push(value),
        }
    }
}

/// Query parameters grouped by name.
///
/// Names are kept sorted so two requests whose parameters arrive in a
/// different order serialize to the same canonical string. Values of a
/// repeated parameter keep their arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams(BTreeMap<String, QueryValue>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a raw `application/x-www-form-urlencoded` query string.
    pub fn parse(raw: &str) -> Self {
        let mut params = Self::new();
        for (name, value) in form_urlencoded::parse(raw.as_bytes()) {
            params.append(name.into_owned(), value.into_owned());
        }
        params
    }

    /// Append a value, turning the parameter into a list when it repeats.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        match self.0.entry(name.into()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().push(value.into()),
            Entry::Vacant(vacant) => {
                vacant.insert(QueryValue::One(value.into()));
            }
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: QueryValue) {
        self.0.insert(name.into(), value);
    }

    /// Deterministic form-urlencoded serialization.
    pub fn canonical(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (name, value) in &self.0 {
            match value {
                QueryValue::One(value) => {
                    serializer.append_pair(name, value);
                }
                QueryValue::Many(values) => {
                    for value in values {
                        serializer.append_pair(name, value);
                    }
                }
            }
        }
        serializer.finish()
    }
}

/// A derived cache key of the form `<namespace>:<METHOD>:<path>:<canonical-query>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive the key for a request.
    ///
    /// Pure: identical inputs always produce the identical key. When
    /// `include_query` is false the query segment is left empty.
    pub fn derive(
        namespace: &str,
        method: &Method,
        path: &str,
        query: &QueryParams,
        include_query: bool,
    ) -> Result<Self, KeyError> {
        if path.is_empty() {
            return Err(KeyError::EmptyPath);
        }

        let query = if include_query {
            query.canonical()
        } else {
            String::new()
        };

        Ok(Self(format!(
            "{namespace}:{}:{path}:{query}",
            method.as_str().to_ascii_uppercase()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Glob patterns selecting every cached `GET` entry under a resource path.
///
/// A resource path covers the collection itself with any query
/// (`<ns>:GET:/api/products:*`) and its member resources
/// (`<ns>:GET:/api/products/*`). Paths that merely share a prefix, such as
/// `/api/products-archive`, are not selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationPattern {
    globs: Vec<String>,
}

impl InvalidationPattern {
    pub fn for_resource(namespace: &str, path: &str) -> Self {
        let trimmed = path.trim();
        let trimmed = if trimmed.len() > 1 {
            trimmed.trim_end_matches('/')
        } else {
            trimmed
        };
        let escaped = escape_glob(trimmed);
        let method = Method::GET;

        let mut globs = vec![format!("{namespace}:{method}:{escaped}:*")];
        if trimmed != "/" {
            globs.push(format!("{namespace}:{method}:{escaped}/*"));
        }

        Self { globs }
    }

    /// Every key inside the namespace.
    pub fn namespace(namespace: &str) -> Self {
        Self {
            globs: vec![format!("{namespace}:*")],
        }
    }

    pub fn globs(&self) -> &[String] {
        &self.globs
    }
}

/// Escape glob metacharacters so a literal path never widens a pattern.
pub fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Match a key against a glob supporting `*`, `?` and backslash escapes.
pub fn glob_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();

    let (mut p, mut k) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while k < key.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, k));
                p += 1;
                continue;
            }
            Some('?') => {
                p += 1;
                k += 1;
                continue;
            }
            Some('\\') if pattern.get(p + 1) == Some(&key[k]) => {
                p += 2;
                k += 1;
                continue;
            }
            Some(&ch) if ch != '\\' && ch == key[k] => {
                p += 1;
                k += 1;
                continue;
            }
            _ => {}
        }

        match backtrack {
            Some((star, matched)) => {
                p = star + 1;
                k = matched + 1;
                backtrack = Some((star, matched + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|ch| *ch == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str, query: &QueryParams, include_query: bool) -> String {
        CacheKey::derive(DEFAULT_NAMESPACE, &Method::GET, path, query, include_query)
            .expect("key derives")
            .into_string()
    }

    #[test]
    fn derives_namespaced_key() {
        let query = QueryParams::parse("page=2");
        assert_eq!(
            key("/api/products", &query, true),
            "cache:GET:/api/products:page=2"
        );
    }

    #[test]
    fn parameter_order_does_not_change_key() {
        let first = QueryParams::parse("sort=title&page=2&filter=new");
        let second = QueryParams::parse("page=2&filter=new&sort=title");
        assert_eq!(
            key("/api/products", &first, true),
            key("/api/products", &second, true)
        );

        let mut built = QueryParams::new();
        built.append("sort", "title");
        built.append("page", "2");
        built.append("filter", "new");
        assert_eq!(key("/api/products", &first, true), key("/api/products", &built, true));
    }

    #[test]
    fn repeated_parameters_become_lists() {
        let query = QueryParams::parse("tag=a&tag=b&id=1");
        let mut expected = QueryParams::new();
        expected.insert("id", QueryValue::One("1".to_string()));
        expected.insert(
            "tag",
            QueryValue::Many(vec!["a".to_string(), "b".to_string()]),
        );
        assert_eq!(query, expected);
        assert_eq!(query.canonical(), "id=1&tag=a&tag=b");
    }

    #[test]
    fn excluded_query_uses_empty_segment() {
        let query = QueryParams::parse("page=2");
        assert_eq!(key("/api/products", &query, false), "cache:GET:/api/products:");
        assert_eq!(
            key("/api/products", &QueryParams::new(), true),
            key("/api/products", &query, false)
        );
    }

    #[test]
    fn method_is_uppercased() {
        let method = Method::from_bytes(b"get").expect("method parses");
        let derived =
            CacheKey::derive("ns", &method, "/a", &QueryParams::new(), true).expect("derives");
        assert_eq!(derived.as_str(), "ns:GET:/a:");
    }

    #[test]
    fn empty_path_is_rejected() {
        let result = CacheKey::derive("ns", &Method::GET, "", &QueryParams::new(), true);
        assert_eq!(result, Err(KeyError::EmptyPath));
    }

    #[test]
    fn resource_pattern_covers_collection_and_members() {
        let pattern = InvalidationPattern::for_resource("cache", "/api/products/");
        assert_eq!(
            pattern.globs(),
            ["cache:GET:/api/products:*", "cache:GET:/api/products/*"]
        );

        let matches = |key: &str| pattern.globs().iter().any(|glob| glob_matches(glob, key));
        assert!(matches("cache:GET:/api/products:"));
        assert!(matches("cache:GET:/api/products:page=2"));
        assert!(matches("cache:GET:/api/products/42:"));
        assert!(!matches("cache:GET:/api/products-archive:"));
        assert!(!matches("cache:GET:/api/orders:"));
    }

    #[test]
    fn glob_escapes_are_literal() {
        assert_eq!(escape_glob("/a*b?"), "/a\\*b\\?");
        assert!(glob_matches("x:/a\\*b:*", "x:/a*b:q=1"));
        assert!(!glob_matches("x:/a\\*b:*", "x:/aZZb:q=1"));
    }

    #[test]
    fn glob_wildcards() {
        assert!(glob_matches("cache:*", "cache:GET:/:"));
        assert!(glob_matches("*", ""));
        assert!(glob_matches("a?c", "abc"));
        assert!(glob_matches("a*c*e", "abcde"));
        assert!(!glob_matches("cache:*", "other:GET:/:"));
        assert!(!glob_matches("abc", "abcd"));
    }
}
