use http::{HeaderMap, StatusCode, header::HeaderName};
use time::{Duration, OffsetDateTime};

use super::cache_control::{
    directives, directive_seconds, has_directive, has_directive_or_value,
};
use super::config::CacheConfig;
use super::request::ClientRequest;
use super::response::HttpResponse;

/// RFC 7234 §3 storability check for a shared cache. The short-circuit
/// order matters: cheap request-side rejections first, then response
/// directives, then the explicit-freshness and default-expiration rules.
pub fn should_store_response(
    config: &CacheConfig,
    request: &ClientRequest,
    response: &HttpResponse,
) -> bool {
    if !config.is_method_safe(&request.method) {
        return false;
    }
    if !config.is_method_cacheable(&request.method) {
        return false;
    }

    if response.status == StatusCode::PARTIAL_CONTENT && !config.cache_incomplete_responses {
        return false;
    }

    let request_directives = directives(&request.headers);
    if has_directive(&request_directives, "no-store") {
        return false;
    }

    let response_directives = directives(&response.headers);
    if has_directive(&response_directives, "no-store")
        || has_directive(&response_directives, "private")
    {
        return false;
    }

    // A shared cache must not reuse a response to an authorized request
    // unless the origin explicitly allowed it (RFC 7234 §3.2).
    if request.headers.contains_key(http::header::AUTHORIZATION) {
        let allowed = has_directive(&response_directives, "must-revalidate")
            || has_directive(&response_directives, "public")
            || has_directive_or_value(&response_directives, "s-maxage");
        if !allowed {
            return false;
        }
    }

    if vary_is_wildcard(&response.headers) {
        return false;
    }

    if has_directive_or_value(&response_directives, "s-maxage")
        || has_directive_or_value(&response_directives, "max-age")
        || has_directive(&response_directives, "public")
    {
        return true;
    }

    if let Some(expires) = response.header_str(http::header::EXPIRES) {
        match httpdate::parse_http_date(expires) {
            // An unparseable Expires violates HTTP/1.1 and is treated as
            // already expired.
            Err(_) => return false,
            Ok(expires) => {
                if OffsetDateTime::from(expires) > OffsetDateTime::now_utc() {
                    return true;
                }
            }
        }
    }

    config.has_cacheable_extension(request.path())
        && config.default_expiration(response.status).is_some()
}

fn vary_is_wildcard(headers: &HeaderMap) -> bool {
    headers.get_all(http::header::VARY).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|name| name.trim() == "*"))
            .unwrap_or(false)
    })
}

/// Remaining freshness lifetime of a response (RFC 7234 §4.2.1), as a
/// signed duration. Negative means the response arrived stale.
///
/// Priority: `s-maxage` (shared cache), then `max-age`, then
/// `Expires − Date`, then the configured per-status default. Every branch
/// accounts for the response's current age.
pub fn response_ttl(config: &CacheConfig, response: &HttpResponse) -> Duration {
    let response_directives = directives(&response.headers);
    let age = response_age(response);

    if let Some(seconds) = directive_seconds(&response_directives, "s-maxage") {
        return Duration::seconds(seconds) - age;
    }
    if let Some(seconds) = directive_seconds(&response_directives, "max-age") {
        return Duration::seconds(seconds) - age;
    }

    if let Some(expires) = response.header_str(http::header::EXPIRES) {
        // An invalid Expires date must be treated as being in the past
        // (RFC 7234 §5.3).
        return match httpdate::parse_http_date(expires) {
            Err(_) => Duration::seconds(-1),
            Ok(expires) => {
                let date = parse_date_header(&response.headers, http::header::DATE)
                    .unwrap_or_else(OffsetDateTime::now_utc);
                (OffsetDateTime::from(expires) - date) - age
            }
        };
    }

    match config.default_expiration(response.status) {
        Some(ttl) => ttl,
        None => Duration::seconds(-1),
    }
}

/// Current age of a response via the apparent-age method of RFC 7234
/// §4.2.3: time since the origin's `Date`, clamped non-negative, plus any
/// upstream `Age` the response already carried.
pub fn response_age(response: &HttpResponse) -> Duration {
    let apparent = match parse_date_header(&response.headers, http::header::DATE) {
        Some(date) => (OffsetDateTime::now_utc() - date).max(Duration::ZERO),
        None => Duration::ZERO,
    };

    let upstream_age = response
        .header_str(http::header::AGE)
        .and_then(|value| value.trim().parse::<i64>().ok());
    match upstream_age {
        Some(seconds) => Duration::seconds(seconds) + apparent,
        None => apparent,
    }
}

pub fn parse_date_header(headers: &HeaderMap, name: HeaderName) -> Option<OffsetDateTime> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
        .map(OffsetDateTime::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method, Uri};
    use std::time::SystemTime;

    fn get_request(path: &str) -> ClientRequest {
        ClientRequest::new(Method::GET, path.parse::<Uri>().unwrap())
    }

    fn response_with(values: &[(&'static str, &str)]) -> HttpResponse {
        let mut headers = HeaderMap::new();
        for (name, value) in values {
            headers.append(
                HeaderName::from_static(name),
                http::HeaderValue::from_str(value).unwrap(),
            );
        }
        HttpResponse::new(StatusCode::OK, headers, Bytes::new())
    }

    fn http_date_in(seconds: i64) -> String {
        let instant = OffsetDateTime::now_utc() + Duration::seconds(seconds);
        httpdate::fmt_http_date(SystemTime::from(instant))
    }

    #[test]
    fn unsafe_and_uncacheable_methods_are_rejected() {
        let config = CacheConfig::default();
        let response = response_with(&[("cache-control", "public, max-age=60")]);

        let mut request = get_request("/x");
        request.method = Method::POST;
        assert!(!should_store_response(&config, &request, &response));

        request.method = Method::HEAD; // safe but not cacheable by default
        assert!(!should_store_response(&config, &request, &response));

        request.method = Method::GET;
        assert!(should_store_response(&config, &request, &response));
    }

    #[test]
    fn partial_content_requires_opt_in() {
        let mut config = CacheConfig::default();
        let request = get_request("/x");
        let mut response = response_with(&[("cache-control", "max-age=60")]);
        response.status = StatusCode::PARTIAL_CONTENT;

        assert!(!should_store_response(&config, &request, &response));
        config.cache_incomplete_responses = true;
        assert!(should_store_response(&config, &request, &response));
    }

    #[test]
    fn no_store_and_private_reject_storage() {
        let config = CacheConfig::default();
        let request = get_request("/x");

        let response = response_with(&[("cache-control", "no-store, max-age=60")]);
        assert!(!should_store_response(&config, &request, &response));

        let response = response_with(&[("cache-control", "private, max-age=60")]);
        assert!(!should_store_response(&config, &request, &response));

        let mut request = get_request("/x");
        request
            .headers
            .insert(http::header::CACHE_CONTROL, "no-store".parse().unwrap());
        let response = response_with(&[("cache-control", "max-age=60")]);
        assert!(!should_store_response(&config, &request, &response));
    }

    #[test]
    fn authorization_requires_explicit_permission() {
        let config = CacheConfig::default();
        let mut request = get_request("/x");
        request
            .headers
            .insert(http::header::AUTHORIZATION, "Bearer token".parse().unwrap());

        let response = response_with(&[("cache-control", "max-age=60")]);
        assert!(!should_store_response(&config, &request, &response));

        for allowed in ["public, max-age=60", "s-maxage=60", "must-revalidate, max-age=60"] {
            let response = response_with(&[("cache-control", allowed)]);
            assert!(
                should_store_response(&config, &request, &response),
                "expected '{allowed}' to permit storage"
            );
        }
    }

    #[test]
    fn vary_wildcard_is_never_stored() {
        let config = CacheConfig::default();
        let request = get_request("/x");
        let response = response_with(&[
            ("cache-control", "public, max-age=60"),
            ("vary", "Accept-Encoding, *"),
        ]);
        assert!(!should_store_response(&config, &request, &response));
    }

    #[test]
    fn future_expires_permits_storage_and_unparseable_rejects() {
        let config = CacheConfig::default();
        let request = get_request("/x");

        let response = response_with(&[("expires", &http_date_in(300))]);
        assert!(should_store_response(&config, &request, &response));

        let response = response_with(&[("expires", "not-a-date")]);
        assert!(!should_store_response(&config, &request, &response));
    }

    #[test]
    fn default_expiration_requires_extension_and_known_status() {
        let config = CacheConfig::default();

        // Known status, cacheable extension.
        let request = get_request("/assets/app.css");
        let response = response_with(&[]);
        assert!(should_store_response(&config, &request, &response));

        // Known status, no cacheable extension (plain HTML stays uncached).
        let request = get_request("/index.html");
        assert!(!should_store_response(&config, &request, &response));

        // Cacheable extension, status outside the default map.
        let request = get_request("/assets/app.css");
        let mut response = response_with(&[]);
        response.status = StatusCode::IM_A_TEAPOT;
        assert!(!should_store_response(&config, &request, &response));
    }

    #[test]
    fn s_maxage_takes_priority_over_max_age() {
        let config = CacheConfig::default();
        let response = response_with(&[("cache-control", "max-age=600, s-maxage=60")]);
        let ttl = response_ttl(&config, &response);
        assert!(ttl <= Duration::seconds(60) && ttl > Duration::seconds(55));
    }

    #[test]
    fn max_age_is_reduced_by_age() {
        let config = CacheConfig::default();
        let response = response_with(&[
            ("cache-control", "max-age=120"),
            ("age", "50"),
        ]);
        let ttl = response_ttl(&config, &response);
        assert!(ttl <= Duration::seconds(70) && ttl > Duration::seconds(65));
    }

    #[test]
    fn expires_minus_date_defines_the_lifetime() {
        let config = CacheConfig::default();
        let response = response_with(&[
            ("date", &http_date_in(0)),
            ("expires", &http_date_in(90)),
        ]);
        let ttl = response_ttl(&config, &response);
        assert!(ttl <= Duration::seconds(90) && ttl > Duration::seconds(85));
    }

    #[test]
    fn unparseable_expires_is_already_stale() {
        let config = CacheConfig::default();
        let response = response_with(&[("expires", "yesterday-ish")]);
        assert_eq!(response_ttl(&config, &response), Duration::seconds(-1));
    }

    #[test]
    fn status_defaults_apply_without_explicit_freshness() {
        let config = CacheConfig::default();
        let response = response_with(&[]);
        assert_eq!(response_ttl(&config, &response), Duration::hours(2));

        let mut response = response_with(&[]);
        response.status = StatusCode::IM_A_TEAPOT;
        assert_eq!(response_ttl(&config, &response), Duration::seconds(-1));
    }

    #[test]
    fn age_combines_header_and_apparent_age() {
        let response = response_with(&[
            ("date", &http_date_in(-10)),
            ("age", "30"),
        ]);
        let age = response_age(&response);
        assert!(age >= Duration::seconds(40) && age < Duration::seconds(42));
    }

    #[test]
    fn future_date_clamps_apparent_age_to_zero() {
        let response = response_with(&[("date", &http_date_in(60))]);
        assert_eq!(response_age(&response), Duration::ZERO);
    }
}
