//! Route table: finds the most specific mapping that matches a request.

use super::mapping::{PathMapping, PathMappingContext, PathMappingResult};

/// A matched route table entry.
#[derive(Debug)]
pub struct PathMapped<'a, V> {
    pub mapping: &'a PathMapping,
    pub result: PathMappingResult,
    pub value: &'a V,
}

/// Route table ordered by specificity.
///
/// Exact mappings are tried first, then prefixes from longest to shortest,
/// then catch-all. Entries of equal specificity keep their registration order,
/// and the first match wins.
#[derive(Debug)]
pub struct Router<V> {
    entries: Vec<(PathMapping, V)>,
}

impl<V> Router<V> {
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = (PathMapping, V)>) -> Self {
        let mut entries: Vec<_> = entries.into_iter().collect();
        // Stable sort keeps registration order among equals.
        entries.sort_by_key(|(mapping, _)| mapping.specificity());
        Self { entries }
    }

    #[must_use]
    pub fn find(&self, ctx: &PathMappingContext) -> Option<PathMapped<'_, V>> {
        self.entries.iter().find_map(|(mapping, value)| {
            mapping.apply(ctx).map(|result| PathMapped {
                mapping,
                result,
                value,
            })
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use http::Method;
    use proptest::prelude::*;

    use super::*;

    fn ctx(path: &str) -> PathMappingContext {
        PathMappingContext::new("localhost", Method::GET, path, None)
    }

    fn router() -> Router<&'static str> {
        Router::new([
            (PathMapping::CatchAll, "fallback"),
            (PathMapping::of("/api/*").unwrap(), "api"),
            (PathMapping::of("/api/v1/*").unwrap(), "api-v1"),
            (PathMapping::of("/api/v1/health").unwrap(), "health"),
        ])
    }

    #[test]
    fn most_specific_mapping_wins() {
        let router = router();
        let hit = |path| router.find(&ctx(path)).map(|m| *m.value);
        assert_eq!(hit("/api/v1/health"), Some("health"));
        assert_eq!(hit("/api/v1/users"), Some("api-v1"));
        assert_eq!(hit("/api/v2/users"), Some("api"));
        assert_eq!(hit("/other"), Some("fallback"));
    }

    #[test]
    fn reports_mapped_path() {
        let router = router();
        let mapped = router.find(&ctx("/api/v1/users/7")).unwrap();
        assert_eq!(mapped.result.path(), "/users/7");
        assert_eq!(mapped.mapping.prefix_str(), Some("/api/v1/"));
    }

    #[test]
    fn equal_specificity_keeps_registration_order() {
        let router = Router::new([
            (PathMapping::of("/a/*").unwrap(), 1),
            (PathMapping::of("/b/*").unwrap(), 2),
            (PathMapping::of("/a/*").unwrap(), 3),
        ]);
        assert_eq!(router.find(&ctx("/a/x")).map(|m| *m.value), Some(1));
    }

    #[test]
    fn no_match() {
        let router = Router::new([(PathMapping::of("/foo/*").unwrap(), ())]);
        assert!(router.find(&ctx("/baz")).is_none());
        assert_eq!(router.len(), 1);
    }

    proptest! {
        #[test]
        fn prefix_match_rebuilds_the_original_path(
            prefix in "/[a-z]{1,8}/",
            rest in "[a-z0-9/]{0,16}",
        ) {
            let router = Router::new([(PathMapping::prefix(prefix.clone()).unwrap(), ())]);
            let path = format!("{prefix}{rest}");
            let mapped = router.find(&ctx(&path)).unwrap();
            prop_assert_eq!(format!("{}{}", &prefix[..prefix.len() - 1], mapped.result.path()), path);
        }
    }
}
