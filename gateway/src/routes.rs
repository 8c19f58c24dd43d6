//! The gateway's prefix → service table.
//!
//! One declarative table drives both the axum routes the gateway mounts and
//! the path rewrite applied before forwarding:
//!
//! | prefix       | service        | rewritten to |
//! |--------------|----------------|--------------|
//! | `/api/auth`  | `user-service` | `/auth`      |
//! | `/api/users` | `user-service` | `/users`     |
//! | `/api/lists` | `list-service` | (empty)      |
//! | `/api/items` | `item-service` | (empty)      |
//!
//! A prefix only matches at a segment boundary, the longest matching prefix
//! wins, and an empty rewritten path becomes `/`.

use std::collections::BTreeSet;

use crate::config::{ITEM_SERVICE, LIST_SERVICE, USER_SERVICE};

/// One table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Public path prefix, no trailing slash
    pub prefix: String,
    /// Target service name
    pub service: String,
    /// Replacement for the prefix on the downstream side
    pub rewrite: String,
}

impl Route {
    /// Build a row.
    #[must_use]
    pub fn new(
        prefix: impl Into<String>,
        service: impl Into<String>,
        rewrite: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
            service: service.into(),
            rewrite: rewrite.into().trim_end_matches('/').to_string(),
        }
    }

    fn strip<'p>(&self, path: &'p str) -> Option<&'p str> {
        let rest = path.strip_prefix(self.prefix.as_str())?;
        (rest.is_empty() || rest.starts_with('/')).then_some(rest)
    }
}

/// Where a public path is forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target<'a> {
    /// Target service name
    pub service: &'a str,
    /// Downstream path (without query)
    pub path: String,
}

/// Prefix routing table.
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new([
            Route::new("/api/auth", USER_SERVICE, "/auth"),
            Route::new("/api/users", USER_SERVICE, "/users"),
            Route::new("/api/lists", LIST_SERVICE, ""),
            Route::new("/api/items", ITEM_SERVICE, ""),
        ])
    }
}

impl RouteTable {
    /// Table from rows; order does not matter.
    #[must_use]
    pub fn new(routes: impl IntoIterator<Item = Route>) -> Self {
        let mut routes: Vec<Route> = routes.into_iter().collect();
        routes.sort_by(|a, b| {
            b.prefix
                .len()
                .cmp(&a.prefix.len())
                .then_with(|| a.prefix.cmp(&b.prefix))
        });
        Self { routes }
    }

    /// Rows, longest prefix first.
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Every service the table targets.
    #[must_use]
    pub fn services(&self) -> BTreeSet<&str> {
        self.routes.iter().map(|r| r.service.as_str()).collect()
    }

    /// Resolve a public path.
    ///
    /// ```
    /// use shopmesh_gateway::routes::RouteTable;
    ///
    /// let table = RouteTable::default();
    /// let target = table.resolve("/api/items/42").unwrap();
    /// assert_eq!(target.service, "item-service");
    /// assert_eq!(target.path, "/42");
    ///
    /// assert!(table.resolve("/api/itemsX").is_none());
    /// ```
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<Target<'_>> {
        self.routes.iter().find_map(|route| {
            let rest = route.strip(path)?;
            let mut rewritten = format!("{}{rest}", route.rewrite);
            if rewritten.is_empty() {
                rewritten.push('/');
            }
            Some(Target {
                service: &route.service,
                path: rewritten,
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn standard_rewrites() {
        let table = RouteTable::default();
        let cases = [
            ("/api/auth/login", USER_SERVICE, "/auth/login"),
            ("/api/users/7", USER_SERVICE, "/users/7"),
            ("/api/users", USER_SERVICE, "/users"),
            ("/api/lists", LIST_SERVICE, "/"),
            ("/api/lists/", LIST_SERVICE, "/"),
            ("/api/lists/L1/items", LIST_SERVICE, "/L1/items"),
            ("/api/items/42", ITEM_SERVICE, "/42"),
            ("/api/items", ITEM_SERVICE, "/"),
        ];

        for (path, service, rewritten) in cases {
            let target = table.resolve(path).unwrap();
            assert_eq!(target.service, service, "{path}");
            assert_eq!(target.path, rewritten, "{path}");
        }
    }

    #[test]
    fn prefixes_match_only_at_segment_boundaries() {
        let table = RouteTable::default();
        assert!(table.resolve("/api/itemsearch").is_none());
        assert!(table.resolve("/api").is_none());
        assert!(table.resolve("/health").is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let table = RouteTable::new([
            Route::new("/api/lists", LIST_SERVICE, ""),
            Route::new("/api/lists/shared", "share-service", "/shared"),
        ]);

        assert_eq!(table.resolve("/api/lists/shared/9").unwrap().service, "share-service");
        assert_eq!(table.resolve("/api/lists/9").unwrap().service, LIST_SERVICE);
    }

    #[test]
    fn services_are_deduplicated() {
        let table = RouteTable::default();
        let services: Vec<&str> = table.services().into_iter().collect();
        assert_eq!(services, [ITEM_SERVICE, LIST_SERVICE, USER_SERVICE]);
    }

    proptest! {
        #[test]
        fn rewritten_paths_keep_the_suffix(
            segments in prop::collection::vec("[a-z0-9]{1,8}", 0..4),
        ) {
            let suffix: String = segments.iter().map(|s| format!("/{s}")).collect();
            let table = RouteTable::default();

            let target = table.resolve(&format!("/api/items{suffix}")).unwrap();
            let expected = if suffix.is_empty() { "/".to_string() } else { suffix.clone() };
            prop_assert_eq!(target.path, expected);

            let target = table.resolve(&format!("/api/users{suffix}")).unwrap();
            prop_assert_eq!(target.path, format!("/users{suffix}"));
        }

        #[test]
        fn rewritten_paths_always_start_with_slash(
            path in "/api/(auth|users|lists|items)(/[a-zA-Z0-9_-]{0,6}){0,3}",
        ) {
            let table = RouteTable::default();
            let target = table.resolve(&path).unwrap();
            prop_assert!(target.path.starts_with('/'));
        }
    }
}
