use std::collections::{HashMap, HashSet};

use http::{Method, StatusCode};
use time::Duration;

/// Per-request caching policy. Resolved once per request and treated as
/// immutable; different origins can be served with different configs through
/// a [`CacheConfigResolver`](super::controller::CacheConfigResolver).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Request methods whose responses may be stored. Uppercase; no case
    /// conversion happens at runtime.
    pub cacheable_methods: HashSet<String>,
    /// Safe methods (RFC 7231 §4.2.1). Unsafe methods are never cached and
    /// trigger invalidation on success.
    pub safe_methods: HashSet<String>,
    /// Default freshness per status code, used when the response itself
    /// carries no explicit lifetime. Status codes absent from this map are
    /// not understood and make such responses uncacheable.
    pub status_code_default_expiration: HashMap<u16, Duration>,
    /// File extensions (lowercase, without the dot) eligible for
    /// default-expiration caching.
    pub cacheable_file_extensions: HashSet<String>,
    /// Store 206 (Partial Content) responses.
    pub cache_incomplete_responses: bool,
    /// Reassemble partial responses into complete ones. Accepted but unused
    /// by the engine.
    pub combine_partial_responses: bool,
    /// Serve a stale stored response when revalidation fails or the origin
    /// answers with a server error.
    pub serve_stale_on_error: bool,
    /// Emit RFC 7234 §5.5 warnings. Accepted but unused by the engine.
    pub http_warnings: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cacheable_methods: to_set(&["GET"]),
            safe_methods: to_set(&["GET", "HEAD", "OPTIONS", "TRACE"]),
            status_code_default_expiration: default_expiration_times(),
            cacheable_file_extensions: to_set(&DEFAULT_CACHEABLE_EXTENSIONS),
            cache_incomplete_responses: false,
            combine_partial_responses: false,
            serve_stale_on_error: true,
            http_warnings: true,
        }
    }
}

impl CacheConfig {
    pub fn is_method_safe(&self, method: &Method) -> bool {
        self.safe_methods.contains(method.as_str())
    }

    pub fn is_method_cacheable(&self, method: &Method) -> bool {
        self.cacheable_methods.contains(method.as_str())
    }

    pub fn default_expiration(&self, status: StatusCode) -> Option<Duration> {
        self.status_code_default_expiration
            .get(&status.as_u16())
            .copied()
    }

    /// True when the path ends in one of the configured static-file
    /// extensions.
    pub fn has_cacheable_extension(&self, path: &str) -> bool {
        match path.rsplit_once('.') {
            Some((_, extension)) => self
                .cacheable_file_extensions
                .contains(&extension.to_ascii_lowercase()),
            None => false,
        }
    }
}

/// Where and how to reach the origin server.
#[derive(Debug, Clone)]
pub struct ForwardConfig {
    /// Hostname or IP address, optionally with a port. Without a port the
    /// scheme default applies.
    pub host: String,
    /// Forward over HTTPS.
    pub tls: bool,
}

fn to_set(values: &[&str]) -> HashSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}

// Static-asset extension list as shipped by large shared caches.
const DEFAULT_CACHEABLE_EXTENSIONS: [&str; 36] = [
    "bmp", "ejs", "jpeg", "pdf", "ps", "ttf", "class", "eot", "jpg", "pict", "svg", "webp", "css",
    "eps", "js", "pls", "svgz", "woff", "csv", "gif", "mid", "png", "swf", "woff2", "doc", "ico",
    "midi", "ppt", "tif", "xls", "docx", "jar", "otf", "pptx", "tiff", "xlsx",
];

fn default_expiration_times() -> HashMap<u16, Duration> {
    HashMap::from([
        (200, Duration::hours(2)),
        (206, Duration::hours(2)),
        (301, Duration::hours(2)),
        (302, Duration::minutes(20)),
        (303, Duration::minutes(20)),
        (403, Duration::minutes(1)),
        (404, Duration::minutes(3)),
        (410, Duration::minutes(3)),
    ])
}
