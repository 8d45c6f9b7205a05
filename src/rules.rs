//! Ordered routing rules for the intercepted Docker API surface.
//!
//! The table is compiled once at startup and read concurrently without
//! synchronization afterwards. Rules are evaluated top-down and the first
//! match wins, so more specific patterns (`/images/json`) must stay above
//! the broader catch-alls (`/images/(\w+)`). The order is part of the
//! protocol contract, not an implementation detail.

use axum::http::Method;
use regex::Regex;

/// What the router decided to do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Forward to the upstream socket unchanged.
    Passthrough,
    /// Forward to the upstream socket after re-encoding the query string.
    /// The re-encode is an identity transform and must stay one.
    PassthroughReencode,
    /// Translate to a model store listing.
    ImageList,
    /// Translate to a model store pull with streamed progress.
    ImagePull,
    /// Translate to a model store deletion.
    ImageDelete,
    /// Explicitly unsupported image operation.
    NotImplemented,
}

struct Rule {
    /// None matches any method.
    method: Option<Method>,
    pattern: Regex,
    route: Route,
}

impl Rule {
    fn new(method: Option<Method>, pattern: &str, route: Route) -> Self {
        Self {
            method,
            pattern: Regex::new(pattern).expect("rule pattern"),
            route,
        }
    }

    fn matches(&self, method: &Method, path: &str) -> bool {
        if let Some(expected) = &self.method {
            if expected != method {
                return false;
            }
        }
        self.pattern.is_match(path)
    }
}

pub struct RuleTable {
    version_prefix: Regex,
    rules: Vec<Rule>,
}

impl RuleTable {
    pub fn new() -> Self {
        use Route::*;

        let get = || Some(Method::GET);
        let post = || Some(Method::POST);
        let del = || Some(Method::DELETE);

        let rules = vec![
            Rule::new(get(), r"^/(_ping|version|info)$", Passthrough),
            Rule::new(get(), r"^/events$", Passthrough),
            // Container related endpoints
            Rule::new(post(), r"^/containers/create$", PassthroughReencode),
            Rule::new(post(), r"^/containers/prune$", Passthrough),
            Rule::new(get(), r"^/containers/json$", Passthrough),
            Rule::new(None, r"^/(containers|exec)/(\w+)\b", Passthrough),
            // Build related endpoints
            Rule::new(post(), r"^/build$", PassthroughReencode),
            // Image related endpoints
            Rule::new(get(), r"^/images/json$", ImageList),
            Rule::new(post(), r"^/images/create$", ImagePull),
            Rule::new(del(), r"^/images/(.+)$", ImageDelete),
            Rule::new(post(), r"^/images/(create|search|get|load)$", NotImplemented),
            Rule::new(post(), r"^/images/prune$", Passthrough),
            Rule::new(None, r"^/images/(\w+)\b", Passthrough),
            // Network related endpoints
            Rule::new(get(), r"^/networks$", Passthrough),
            Rule::new(post(), r"^/networks/create$", PassthroughReencode),
            Rule::new(post(), r"^/networks/prune$", Passthrough),
            Rule::new(del(), r"^/networks/(.+)$", PassthroughReencode),
            Rule::new(get(), r"^/networks/(.+)$", Passthrough),
            Rule::new(post(), r"^/networks/(.+)/(connect|disconnect)$", Passthrough),
            // Volumes related endpoints
            Rule::new(get(), r"^/volumes$", Passthrough),
            Rule::new(post(), r"^/volumes/create$", Passthrough),
            Rule::new(post(), r"^/volumes/prune$", Passthrough),
            Rule::new(get(), r"^/volumes/([-\w]+)$", Passthrough),
            Rule::new(del(), r"^/volumes/(-\w+)$", Passthrough),
        ];

        Self {
            version_prefix: Regex::new(r"^/v\d\.\d+\b").expect("version prefix pattern"),
            rules,
        }
    }

    /// Selects the route for a request. `None` means no rule matched and the
    /// caller must reject the request with the original method and path.
    pub fn direct(&self, method: &Method, path: &str) -> Option<Route> {
        let path = self.strip_version_prefix(path);
        self.rules
            .iter()
            .find(|rule| rule.matches(method, path))
            .map(|rule| rule.route)
    }

    /// Strips an API version prefix like `/v1.43` so versioned and bare
    /// paths route identically.
    fn strip_version_prefix<'a>(&self, path: &'a str) -> &'a str {
        match self.version_prefix.find(path) {
            Some(found) => &path[found.end()..],
            None => path,
        }
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RuleTable {
        RuleTable::new()
    }

    #[test]
    fn image_list_wins_over_image_catch_all() {
        assert_eq!(
            table().direct(&Method::GET, "/images/json"),
            Some(Route::ImageList)
        );
    }

    #[test]
    fn image_pull_and_delete_translate() {
        let t = table();
        assert_eq!(t.direct(&Method::POST, "/images/create"), Some(Route::ImagePull));
        assert_eq!(
            t.direct(&Method::DELETE, "/images/foo:latest"),
            Some(Route::ImageDelete)
        );
    }

    #[test]
    fn image_search_is_explicitly_unsupported() {
        let t = table();
        assert_eq!(t.direct(&Method::POST, "/images/search"), Some(Route::NotImplemented));
        assert_eq!(t.direct(&Method::POST, "/images/get"), Some(Route::NotImplemented));
        assert_eq!(t.direct(&Method::POST, "/images/load"), Some(Route::NotImplemented));
    }

    #[test]
    fn version_prefix_is_transparent() {
        let t = table();
        assert_eq!(
            t.direct(&Method::GET, "/v1.43/images/json"),
            t.direct(&Method::GET, "/images/json"),
        );
        assert_eq!(
            t.direct(&Method::GET, "/v1.24/_ping"),
            Some(Route::Passthrough)
        );
    }

    #[test]
    fn wildcard_method_matches_any() {
        let t = table();
        assert_eq!(
            t.direct(&Method::DELETE, "/containers/abc123"),
            Some(Route::Passthrough)
        );
        assert_eq!(
            t.direct(&Method::POST, "/exec/abc123/start"),
            Some(Route::Passthrough)
        );
    }

    #[test]
    fn create_endpoints_reencode() {
        let t = table();
        assert_eq!(
            t.direct(&Method::POST, "/containers/create"),
            Some(Route::PassthroughReencode)
        );
        assert_eq!(t.direct(&Method::POST, "/build"), Some(Route::PassthroughReencode));
        assert_eq!(
            t.direct(&Method::POST, "/networks/create"),
            Some(Route::PassthroughReencode)
        );
        assert_eq!(
            t.direct(&Method::DELETE, "/networks/mynet"),
            Some(Route::PassthroughReencode)
        );
    }

    #[test]
    fn unmatched_routes_are_rejected() {
        let t = table();
        assert_eq!(t.direct(&Method::PUT, "/flibber"), None);
        assert_eq!(t.direct(&Method::POST, "/swarm/init"), None);
        assert_eq!(t.direct(&Method::GET, "/v1.43"), None);
    }
}
