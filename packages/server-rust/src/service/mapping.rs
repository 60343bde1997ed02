//! Path matchers and the per-request values they are matched against.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;

use ctrlshift_core::{Error, Result};
use http::Method;

// ---------------------------------------------------------------------------
// PathMappingContext / PathMappingResult
// ---------------------------------------------------------------------------

/// The request attributes a [`PathMapping`] is matched against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMappingContext {
    hostname: String,
    method: Method,
    path: String,
    query: Option<String>,
}

impl PathMappingContext {
    #[must_use]
    pub fn new(
        hostname: impl Into<String>,
        method: Method,
        path: impl Into<String>,
        query: Option<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            method,
            path: path.into(),
            query,
        }
    }

    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// The same context with `path` replaced, for matching a sub-path.
    #[must_use]
    pub fn override_path(&self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..self.clone()
        }
    }
}

/// A successful match: the path as seen by the matched service, plus any
/// captured parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMappingResult {
    path: String,
    params: HashMap<String, String>,
}

impl PathMappingResult {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// The mapped path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }
}

// ---------------------------------------------------------------------------
// PathMapping
// ---------------------------------------------------------------------------

/// Route matcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathMapping {
    /// Matches one absolute path exactly.
    Exact(String),
    /// Matches every path under a prefix that ends with `/`.
    Prefix(String),
    /// Matches every path.
    CatchAll,
}

impl PathMapping {
    /// # Errors
    ///
    /// `InvalidArgument` if `path` is not absolute.
    pub fn exact(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        ensure_absolute(&path)?;
        Ok(Self::Exact(path))
    }

    /// A prefix mapping. A missing trailing `/` is added; `/` alone is [`CatchAll`](Self::CatchAll).
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `prefix` is not absolute.
    pub fn prefix(prefix: impl Into<String>) -> Result<Self> {
        let mut prefix = prefix.into();
        ensure_absolute(&prefix)?;
        if prefix == "/" {
            return Ok(Self::CatchAll);
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Ok(Self::Prefix(prefix))
    }

    /// Parses `/a/b` (exact), `/a/*` (prefix) or `/*` (catch-all).
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `pattern` is not absolute.
    pub fn of(pattern: &str) -> Result<Self> {
        match pattern.strip_suffix('*') {
            Some(prefix) if prefix.ends_with('/') => Self::prefix(prefix),
            _ => Self::exact(pattern),
        }
    }

    /// The matched prefix, for mappings that strip one. Catch-all reports `/`.
    #[must_use]
    pub fn prefix_str(&self) -> Option<&str> {
        match self {
            Self::Exact(_) => None,
            Self::Prefix(prefix) => Some(prefix),
            Self::CatchAll => Some("/"),
        }
    }

    /// Matches `ctx`, returning the path as the matched service sees it.
    #[must_use]
    pub fn apply(&self, ctx: &PathMappingContext) -> Option<PathMappingResult> {
        let path = ctx.path();
        match self {
            Self::Exact(exact) => (path == exact).then(|| PathMappingResult::new(path)),
            // The prefix ends with '/', which stays as the first byte of the mapped path.
            Self::Prefix(prefix) => path
                .starts_with(prefix.as_str())
                .then(|| PathMappingResult::new(&path[prefix.len() - 1..])),
            Self::CatchAll => Some(PathMappingResult::new(path)),
        }
    }

    /// Sort key: exact mappings first, then longer prefixes, catch-all last.
    #[must_use]
    pub fn specificity(&self) -> (u8, Reverse<usize>) {
        match self {
            Self::Exact(path) => (0, Reverse(path.len())),
            Self::Prefix(prefix) => (1, Reverse(prefix.len())),
            Self::CatchAll => (2, Reverse(0)),
        }
    }

    /// A dotted logger name derived from the path segments.
    #[must_use]
    pub fn logger_name(&self) -> String {
        let path = match self {
            Self::Exact(path) | Self::Prefix(path) => path.as_str(),
            Self::CatchAll => "/",
        };
        let segments: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|segment| {
                let mut name: String = segment
                    .chars()
                    .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
                    .collect();
                if name.starts_with(|c: char| c.is_numeric()) {
                    name.insert(0, '_');
                }
                name
            })
            .collect();
        if segments.is_empty() {
            "__ROOT__".to_string()
        } else {
            segments.join(".")
        }
    }
}

impl fmt::Display for PathMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(path) => write!(f, "exact:{path}"),
            Self::Prefix(prefix) => write!(f, "prefix:{prefix}"),
            Self::CatchAll => f.write_str("catch-all"),
        }
    }
}

fn ensure_absolute(path: &str) -> Result<()> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "path: {path} (expected: an absolute path starting with '/')"
        )))
    }
}
