use anyhow::{Context, Result, anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use time::Duration;

/// A fully-materialized HTTP response: origin responses after the body has
/// been read, and cached responses after parsing the stored wire form.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Plain-text response for statuses the proxy generates itself.
    pub fn text(status: StatusCode, message: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        let body = Bytes::from(format!("{message}\n"));
        headers.insert(http::header::CONTENT_LENGTH, content_length_value(body.len()));
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn header_str(&self, name: http::header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Stamp the `Age` header with a non-negative whole-second value.
    pub fn set_age(&mut self, age: Duration) {
        let seconds = age.whole_seconds().max(0);
        if let Ok(value) = http::HeaderValue::from_str(&seconds.to_string()) {
            self.headers.insert(http::header::AGE, value);
        }
    }

    /// Serialize the response head in wire form (status line, headers, blank
    /// line), without the body.
    pub fn wire_head(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(256);
        buffer.put_slice(b"HTTP/1.1 ");
        buffer.put_slice(self.status.as_str().as_bytes());
        buffer.put_u8(b' ');
        buffer.put_slice(self.status.canonical_reason().unwrap_or("").as_bytes());
        buffer.put_slice(b"\r\n");
        for (name, value) in self.headers.iter() {
            buffer.put_slice(name.as_str().as_bytes());
            buffer.put_slice(b": ");
            buffer.put_slice(value.as_bytes());
            buffer.put_slice(b"\r\n");
        }
        buffer.put_slice(b"\r\n");
        buffer.freeze()
    }

    /// Full wire serialization, the exact byte form stored in cache layers.
    pub fn to_wire(&self) -> Bytes {
        let head = self.wire_head();
        let mut buffer = BytesMut::with_capacity(head.len() + self.body.len());
        buffer.put_slice(&head);
        buffer.put_slice(&self.body);
        buffer.freeze()
    }

    /// Parse a stored wire form back into a response. The input is expected
    /// to be a serialization produced by [`HttpResponse::to_wire`].
    pub fn from_wire(raw: &[u8]) -> Result<Self> {
        let head_end = find_head_end(raw)
            .ok_or_else(|| anyhow!("stored response is missing the header terminator"))?;
        let head = std::str::from_utf8(&raw[..head_end])
            .context("stored response head is not valid UTF-8")?;
        let mut lines = head.split("\r\n");

        let status_line = lines
            .next()
            .ok_or_else(|| anyhow!("stored response is missing a status line"))?;
        let status = parse_status_line(status_line)?;

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed stored header line '{line}'"))?;
            let name = http::header::HeaderName::from_bytes(name.trim().as_bytes())
                .with_context(|| format!("invalid stored header name '{name}'"))?;
            let value = http::HeaderValue::from_str(value.trim())
                .with_context(|| format!("invalid stored header value for '{name:?}'"))?;
            headers.append(name, value);
        }

        let body = Bytes::copy_from_slice(&raw[head_end + 4..]);
        Ok(Self {
            status,
            headers,
            body,
        })
    }
}

pub fn content_length_value(len: usize) -> http::HeaderValue {
    http::HeaderValue::from_str(&len.to_string()).expect("decimal length is a valid header value")
}

fn find_head_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_status_line(line: &str) -> Result<StatusCode> {
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("empty status line"))?;
    if !version.starts_with("HTTP/1.") {
        bail!("unsupported stored protocol version '{version}'");
    }
    let code = parts
        .next()
        .ok_or_else(|| anyhow!("status line '{line}' is missing a status code"))?;
    StatusCode::from_bytes(code.as_bytes())
        .with_context(|| format!("invalid status code '{code}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_preserves_status_headers_and_body() -> Result<()> {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain".parse()?);
        headers.append("set-cookie", "a=1".parse()?);
        headers.append("set-cookie", "b=2".parse()?);
        let response = HttpResponse::new(
            StatusCode::OK,
            headers,
            Bytes::from_static(b"hello world"),
        );

        let parsed = HttpResponse::from_wire(&response.to_wire())?;
        assert_eq!(parsed.status, StatusCode::OK);
        assert_eq!(parsed.body, response.body);
        assert_eq!(parsed.headers, response.headers);
        Ok(())
    }

    #[test]
    fn from_wire_rejects_truncated_head() {
        let err = HttpResponse::from_wire(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n").unwrap_err();
        assert!(
            err.to_string().contains("header terminator"),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn from_wire_accepts_empty_reason_phrase() -> Result<()> {
        let parsed = HttpResponse::from_wire(b"HTTP/1.1 599 \r\n\r\n")?;
        assert_eq!(parsed.status.as_u16(), 599);
        assert!(parsed.body.is_empty());
        Ok(())
    }

    #[test]
    fn set_age_clamps_negative_values() {
        let mut response =
            HttpResponse::new(StatusCode::OK, HeaderMap::new(), Bytes::new());
        response.set_age(Duration::seconds(-7));
        assert_eq!(
            response.headers.get(http::header::AGE).unwrap(),
            &http::HeaderValue::from_static("0")
        );
    }
}
