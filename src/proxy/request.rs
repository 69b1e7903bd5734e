use std::net::IpAddr;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri};

/// A fully-read client request as handed to the cache controller.
///
/// The URI is kept exactly as received: origin-form (`/path?q`), asterisk-form
/// (`*`), or absolute-form. The TLS flag describes the client-facing
/// connection and drives the scheme of the effective URI when the target is
/// not absolute.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub tls: bool,
    pub peer: Option<IpAddr>,
}

impl ClientRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            tls: false,
            peer: None,
        }
    }

    /// First `Host` header value, if any. Duplicate `Host` headers do not
    /// change the request's authority.
    pub fn host_header(&self) -> Option<&str> {
        self.headers
            .get(http::header::HOST)
            .and_then(|value| value.to_str().ok())
    }

    pub fn is_absolute_form(&self) -> bool {
        self.uri.scheme().is_some() && self.uri.authority().is_some()
    }

    /// Request path as used for the cacheable-extension check.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Path and query in the form the origin expects on the request line.
    pub fn origin_form_target(&self) -> String {
        if self.uri.path() == "*" {
            return "*".to_string();
        }
        match self.uri.path_and_query() {
            Some(pq) if !pq.as_str().is_empty() => pq.as_str().to_string(),
            _ => "/".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_uses_first_value() {
        let mut request = ClientRequest::new(Method::GET, Uri::from_static("/a"));
        request
            .headers
            .append(http::header::HOST, "one.example.com".parse().unwrap());
        request
            .headers
            .append(http::header::HOST, "two.example.com".parse().unwrap());
        assert_eq!(request.host_header(), Some("one.example.com"));
    }

    #[test]
    fn origin_form_target_defaults_to_root() {
        let request = ClientRequest::new(
            Method::GET,
            Uri::from_static("http://example.com"),
        );
        assert_eq!(request.origin_form_target(), "/");

        let asterisk = ClientRequest::new(Method::OPTIONS, Uri::from_static("*"));
        assert_eq!(asterisk.origin_form_target(), "*");
    }
}
