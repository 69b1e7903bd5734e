use http::HeaderMap;

/// Split every `Cache-Control` value on the request or response into
/// lowercase, trimmed directives. The header may appear multiple times and
/// directives may carry quoted-string arguments containing commas
/// (`no-cache="Set-Cookie, X-Test"`), so the split is quote-aware.
pub fn directives(headers: &HeaderMap) -> Vec<String> {
    let mut out = Vec::new();
    for value in headers.get_all(http::header::CACHE_CONTROL) {
        if let Ok(value) = value.to_str() {
            split_directives(value, &mut out);
        }
    }
    out
}

fn split_directives(value: &str, out: &mut Vec<String>) {
    let value = value.to_ascii_lowercase();
    let mut in_quote = false;
    let mut token = String::new();
    for ch in value.chars() {
        match ch {
            '"' => {
                in_quote = !in_quote;
                token.push(ch);
            }
            ',' if !in_quote => {
                push_token(&mut token, out);
            }
            _ => token.push(ch),
        }
    }
    push_token(&mut token, out);
}

fn push_token(token: &mut String, out: &mut Vec<String>) {
    let trimmed = token.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
    token.clear();
}

/// Exact-match lookup. `has_directive(d, "no-cache")` matches only the
/// unqualified form, never `no-cache="..."`.
pub fn has_directive(directives: &[String], name: &str) -> bool {
    directives.iter().any(|d| d == name)
}

/// True when the directive is present in either its bare or argument form.
pub fn has_directive_or_value(directives: &[String], name: &str) -> bool {
    directives
        .iter()
        .any(|d| d == name || d.strip_prefix(name).is_some_and(|rest| rest.starts_with('=')))
}

/// Parse the seconds argument of a `name=N` directive. Both the token form
/// and the quoted form (`max-age="600"`) are accepted.
pub fn directive_seconds(directives: &[String], name: &str) -> Option<i64> {
    for directive in directives {
        if let Some(rest) = directive.strip_prefix(name)
            && let Some(argument) = rest.strip_prefix('=')
        {
            return argument.trim_matches('"').parse().ok();
        }
    }
    None
}

/// `max-stale` tolerance: `Some(None)` for the unlimited bare form,
/// `Some(Some(n))` for `max-stale=n`, `None` when absent.
pub fn max_stale(directives: &[String]) -> Option<Option<i64>> {
    for directive in directives {
        if directive == "max-stale" {
            return Some(None);
        }
        if let Some(rest) = directive.strip_prefix("max-stale=") {
            return Some(rest.trim_matches('"').parse().ok());
        }
    }
    None
}

/// Header field names listed in a qualified `no-cache="f1, f2"` directive.
/// Those fields must not be reused from a stored response without
/// revalidation, so callers strip them before serving.
pub fn no_cache_fields(directives: &[String]) -> Vec<String> {
    let mut fields = Vec::new();
    for directive in directives {
        if let Some(argument) = directive.strip_prefix("no-cache=") {
            for field in argument.trim_matches('"').split(',') {
                let field = field.trim();
                if !field.is_empty() {
                    fields.push(field.to_string());
                }
            }
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn header_map(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(
                http::header::CACHE_CONTROL,
                HeaderValue::from_static(value),
            );
        }
        headers
    }

    #[test]
    fn splits_and_lowercases_directives() {
        let headers = header_map(&["Public, MAX-AGE=600 , , must-revalidate"]);
        assert_eq!(
            directives(&headers),
            vec!["public", "max-age=600", "must-revalidate"]
        );
    }

    #[test]
    fn merges_repeated_headers() {
        let headers = header_map(&["no-store", "private"]);
        assert_eq!(directives(&headers), vec!["no-store", "private"]);
    }

    #[test]
    fn keeps_commas_inside_quoted_arguments() {
        let headers = header_map(&["no-cache=\"Set-Cookie, X-Test\", max-age=60"]);
        let parsed = directives(&headers);
        assert_eq!(parsed, vec!["no-cache=\"set-cookie, x-test\"", "max-age=60"]);
        assert_eq!(no_cache_fields(&parsed), vec!["set-cookie", "x-test"]);
    }

    #[test]
    fn unqualified_lookup_ignores_field_list_form() {
        let headers = header_map(&["no-cache=\"Set-Cookie\""]);
        let parsed = directives(&headers);
        assert!(!has_directive(&parsed, "no-cache"));

        let headers = header_map(&["no-cache"]);
        let parsed = directives(&headers);
        assert!(has_directive(&parsed, "no-cache"));
        assert!(no_cache_fields(&parsed).is_empty());
    }

    #[test]
    fn parses_seconds_arguments() {
        let headers = header_map(&["s-maxage=300, max-age=\"120\""]);
        let parsed = directives(&headers);
        assert_eq!(directive_seconds(&parsed, "s-maxage"), Some(300));
        assert_eq!(directive_seconds(&parsed, "max-age"), Some(120));
        assert_eq!(directive_seconds(&parsed, "min-fresh"), None);
    }

    #[test]
    fn s_maxage_argument_does_not_shadow_max_age() {
        let headers = header_map(&["s-maxage=300"]);
        let parsed = directives(&headers);
        assert_eq!(directive_seconds(&parsed, "max-age"), None);
        assert!(has_directive_or_value(&parsed, "s-maxage"));
        assert!(!has_directive_or_value(&parsed, "max-age"));
    }

    #[test]
    fn max_stale_forms() {
        let bare = directives(&header_map(&["max-stale"]));
        assert_eq!(max_stale(&bare), Some(None));

        let bounded = directives(&header_map(&["max-stale=5"]));
        assert_eq!(max_stale(&bounded), Some(Some(5)));

        let absent = directives(&header_map(&["max-age=5"]));
        assert_eq!(max_stale(&absent), None);
    }
}
