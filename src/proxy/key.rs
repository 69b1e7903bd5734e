use http::HeaderMap;
use url::form_urlencoded;

use super::config::ForwardConfig;
use super::request::ClientRequest;

/// Key-space prefix under which the secondary-key field list of a primary
/// key is stored.
pub const SECONDARY_LIST_PREFIX: &str = "secondary-keys";

/// Primary cache key: request method concatenated with the effective URI.
/// Stable across query-parameter order and duplicate `Host`/`Date` headers.
pub fn primary_key(request: &ClientRequest, forward: &ForwardConfig) -> String {
    format!("{}{}", request.method.as_str(), effective_uri(request, forward))
}

/// Storage key of the secondary-key field list for a primary key.
pub fn secondary_list_key(primary: &str) -> String {
    format!("{SECONDARY_LIST_PREFIX}{primary}")
}

/// The absolute URI the request is really addressed to (RFC 7230 §5.5).
///
/// An absolute-form request target is used verbatim. Otherwise the URI is
/// reconstructed from the connection's TLS flag, the `Host` header (falling
/// back to the forward host), the path (`*` means empty), and the query
/// re-encoded in key-sorted order so equivalent requests produce equal keys.
pub fn effective_uri(request: &ClientRequest, forward: &ForwardConfig) -> String {
    if request.is_absolute_form() {
        return request.uri.to_string();
    }

    let scheme = if request.tls { "https" } else { "http" };
    let authority = request.host_header().unwrap_or(forward.host.as_str());

    let mut uri = format!("{scheme}://{authority}");
    if request.uri.path() != "*" {
        uri.push_str(request.uri.path());
        if let Some(query) = request.uri.query() {
            let sorted = sorted_query(query);
            if !sorted.is_empty() {
                uri.push('?');
                uri.push_str(&sorted);
            }
        }
    }
    uri
}

/// Re-encode an already-parsed absolute URL with its query sorted, matching
/// the canonical form produced by [`effective_uri`]. Used when deriving
/// invalidation targets from `Location` headers.
pub fn canonical_url(mut url: url::Url) -> String {
    if let Some(query) = url.query().map(str::to_string) {
        let sorted = sorted_query(&query);
        if sorted.is_empty() {
            url.set_query(None);
        } else {
            url.set_query(Some(&sorted));
        }
    }
    url.to_string()
}

fn sorted_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    // Stable sort: values of a repeated key keep their request order.
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, value) in &pairs {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

/// Field names of a stored response's `Vary` header, canonically cased and
/// sorted ascending. `Vary: *` never reaches this point; storability already
/// rejected it.
pub fn vary_fields(response_headers: &HeaderMap) -> Vec<String> {
    let mut fields = Vec::new();
    for value in response_headers.get_all(http::header::VARY) {
        if let Ok(value) = value.to_str() {
            for name in value.split(',') {
                let name = name.trim();
                if !name.is_empty() && name != "*" {
                    fields.push(canonical_field_name(name));
                }
            }
        }
    }
    fields.sort();
    fields.dedup();
    fields
}

/// Secondary cache key for a list of `Vary` field names: one
/// `|Name:value...` segment per field in lexicographic order, with the
/// request's values for that field sorted and concatenated. Empty when the
/// list is empty.
pub fn secondary_key(fields: &[String], request_headers: &HeaderMap) -> String {
    let mut sorted_fields: Vec<String> = fields.iter().map(|f| canonical_field_name(f)).collect();
    sorted_fields.sort();

    let mut key = String::new();
    for field in sorted_fields {
        key.push('|');
        key.push_str(&field);
        key.push(':');

        let mut values: Vec<&str> = request_headers
            .get_all(field.as_str())
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        values.sort_unstable();
        for value in values {
            key.push_str(value);
        }
    }
    key
}

/// Canonical MIME header casing: each dash-separated segment capitalized
/// (`accept-encoding` becomes `Accept-Encoding`).
fn canonical_field_name(name: &str) -> String {
    let mut canonical = String::with_capacity(name.len());
    let mut upper_next = true;
    for ch in name.chars() {
        if ch == '-' {
            canonical.push('-');
            upper_next = true;
        } else if upper_next {
            canonical.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            canonical.extend(ch.to_lowercase());
        }
    }
    canonical
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Uri};

    fn forward() -> ForwardConfig {
        ForwardConfig {
            host: "origin.internal:8080".to_string(),
            tls: false,
        }
    }

    fn request(uri: &str) -> ClientRequest {
        ClientRequest::new(Method::GET, uri.parse::<Uri>().unwrap())
    }

    #[test]
    fn query_order_does_not_change_the_key() {
        let a = request("/search?b=2&a=1&c=3");
        let b = request("/search?c=3&a=1&b=2");
        assert_eq!(primary_key(&a, &forward()), primary_key(&b, &forward()));
    }

    #[test]
    fn duplicate_host_and_date_headers_do_not_change_the_key() {
        let mut a = request("/resource");
        a.headers
            .insert(http::header::HOST, "example.com".parse().unwrap());
        a.headers
            .insert(http::header::DATE, "Tue, 01 Jan 2030 00:00:00 GMT".parse().unwrap());

        let mut b = a.clone();
        b.headers
            .append(http::header::HOST, "other.example.com".parse().unwrap());
        b.headers
            .append(http::header::DATE, "Wed, 02 Jan 2030 00:00:00 GMT".parse().unwrap());

        assert_eq!(primary_key(&a, &forward()), primary_key(&b, &forward()));
    }

    #[test]
    fn host_header_takes_precedence_over_forward_host() {
        let mut with_host = request("/x");
        with_host
            .headers
            .insert(http::header::HOST, "site.example.com".parse().unwrap());
        assert_eq!(
            effective_uri(&with_host, &forward()),
            "http://site.example.com/x"
        );

        let without_host = request("/x");
        assert_eq!(
            effective_uri(&without_host, &forward()),
            "http://origin.internal:8080/x"
        );
    }

    #[test]
    fn tls_flag_selects_the_scheme() {
        let mut request = request("/x");
        request.tls = true;
        assert_eq!(
            effective_uri(&request, &forward()),
            "https://origin.internal:8080/x"
        );
    }

    #[test]
    fn absolute_form_is_used_verbatim() {
        let request = request("http://absolute.example.com/path?z=1&a=2");
        assert_eq!(
            effective_uri(&request, &forward()),
            "http://absolute.example.com/path?z=1&a=2"
        );
    }

    #[test]
    fn asterisk_path_means_empty() {
        let request = ClientRequest::new(Method::OPTIONS, Uri::from_static("*"));
        assert_eq!(
            effective_uri(&request, &forward()),
            "http://origin.internal:8080"
        );
    }

    #[test]
    fn secondary_key_sorts_fields_and_values() {
        let mut headers = HeaderMap::new();
        headers.append("accept-encoding", "gzip".parse().unwrap());
        headers.append("accept-encoding", "br".parse().unwrap());
        headers.insert("user-agent", "test".parse().unwrap());

        let fields = vec!["User-Agent".to_string(), "accept-encoding".to_string()];
        assert_eq!(
            secondary_key(&fields, &headers),
            "|Accept-Encoding:brgzip|User-Agent:test"
        );
    }

    #[test]
    fn secondary_key_is_empty_without_fields() {
        let headers = HeaderMap::new();
        assert_eq!(secondary_key(&[], &headers), "");
    }

    #[test]
    fn vary_fields_are_canonical_sorted_and_deduplicated() {
        let mut headers = HeaderMap::new();
        headers.append(http::header::VARY, "user-agent, Accept-Encoding".parse().unwrap());
        headers.append(http::header::VARY, "ACCEPT-ENCODING".parse().unwrap());
        assert_eq!(
            vary_fields(&headers),
            vec!["Accept-Encoding".to_string(), "User-Agent".to_string()]
        );
    }

    #[test]
    fn requests_differing_in_a_vary_header_get_different_keys() {
        let fields = vec!["Accept-Language".to_string()];

        let mut nl = HeaderMap::new();
        nl.insert("accept-language", "nl".parse().unwrap());
        let mut en = HeaderMap::new();
        en.insert("accept-language", "en".parse().unwrap());

        assert_ne!(secondary_key(&fields, &nl), secondary_key(&fields, &en));
    }

    #[test]
    fn canonical_url_sorts_location_queries() {
        let url = url::Url::parse("http://example.com/item?b=2&a=1").unwrap();
        assert_eq!(canonical_url(url), "http://example.com/item?a=1&b=2");
    }
}
