use anyhow::{Context, Result, anyhow, bail, ensure};
use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::response::{HttpResponse, content_length_value};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Parsed request line and header section of an HTTP/1.x request.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Read one request from the stream. `Ok(None)` reports a clean connection
/// close before the first byte of a new request.
pub async fn read_request<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_header_size: usize,
    max_body_size: usize,
) -> Result<Option<(RequestHead, Bytes)>>
where
    R: AsyncRead + Unpin,
{
    let head_bytes = match read_head_section(reader, buffer, max_header_size).await? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };
    let head = parse_request_head(&head_bytes)?;
    let body = read_message_body(reader, buffer, &head.headers, max_body_size).await?;
    Ok(Some((head, body)))
}

/// Read one response from an origin connection. Responses without explicit
/// framing are delimited by connection close.
pub async fn read_response<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_header_size: usize,
    max_body_size: usize,
    head_only: bool,
) -> Result<HttpResponse>
where
    R: AsyncRead + Unpin,
{
    let head_bytes = read_head_section(reader, buffer, max_header_size)
        .await?
        .ok_or_else(|| anyhow!("origin closed the connection before responding"))?;
    let (status, headers) = parse_response_head(&head_bytes)?;

    let body = if head_only || !status_allows_body(status) {
        Bytes::new()
    } else if is_chunked(&headers) {
        read_chunked_body(reader, buffer, max_body_size).await?
    } else if let Some(length) = content_length(&headers)? {
        read_sized_body(reader, buffer, length, max_body_size).await?
    } else {
        read_until_close(reader, buffer, max_body_size).await?
    };

    Ok(HttpResponse::new(status, headers, body))
}

/// Encode a response for the client connection. The body framing is always
/// rewritten to `Content-Length` (bodies are fully materialized), so stale
/// framing headers from the stored form are replaced.
pub fn encode_client_response(
    response: &HttpResponse,
    keep_alive: bool,
    head_only: bool,
) -> Bytes {
    let mut buffer = BytesMut::with_capacity(256 + response.body.len());
    buffer.put_slice(b"HTTP/1.1 ");
    buffer.put_slice(response.status.as_str().as_bytes());
    buffer.put_u8(b' ');
    buffer.put_slice(response.status.canonical_reason().unwrap_or("").as_bytes());
    buffer.put_slice(b"\r\n");

    for (name, value) in response.headers.iter() {
        if matches!(name.as_str(), "content-length" | "connection") {
            continue;
        }
        buffer.put_slice(name.as_str().as_bytes());
        buffer.put_slice(b": ");
        buffer.put_slice(value.as_bytes());
        buffer.put_slice(b"\r\n");
    }

    if status_allows_body(response.status) {
        buffer.put_slice(b"Content-Length: ");
        buffer.put_slice(content_length_value(response.body.len()).as_bytes());
        buffer.put_slice(b"\r\n");
    }
    if !keep_alive {
        buffer.put_slice(b"Connection: close\r\n");
    }
    buffer.put_slice(b"\r\n");

    if !head_only && status_allows_body(response.status) {
        buffer.put_slice(&response.body);
    }
    buffer.freeze()
}

fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Accumulate bytes until the blank line ending the header section.
async fn read_head_section<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_header_size: usize,
) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(position) = find_subsequence(buffer, HEAD_TERMINATOR) {
            ensure!(
                position + HEAD_TERMINATOR.len() <= max_header_size,
                "header section exceeds configured limit"
            );
            let mut head = buffer.split_to(position + HEAD_TERMINATOR.len());
            head.truncate(position);
            return Ok(Some(head.freeze()));
        }
        ensure!(
            buffer.len() <= max_header_size,
            "header section exceeds configured limit"
        );
        let read = reader.read_buf(buffer).await?;
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            bail!("connection closed inside the header section");
        }
    }
}

fn parse_request_head(raw: &[u8]) -> Result<RequestHead> {
    let text = std::str::from_utf8(raw).context("request head is not valid UTF-8")?;
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("empty request line"))?;
    let method = Method::from_bytes(method.as_bytes())
        .with_context(|| format!("invalid request method '{method}'"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("request line '{request_line}' is missing a target"))?;
    let target: Uri = target
        .parse()
        .with_context(|| format!("invalid request target '{target}'"))?;
    let version = parse_version(parts.next())?;
    ensure!(
        parts.next().is_none(),
        "malformed request line '{request_line}'"
    );

    Ok(RequestHead {
        method,
        target,
        version,
        headers: parse_header_lines(lines)?,
    })
}

fn parse_response_head(raw: &[u8]) -> Result<(StatusCode, HeaderMap)> {
    let text = std::str::from_utf8(raw).context("response head is not valid UTF-8")?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    ensure!(
        version.starts_with("HTTP/1."),
        "unsupported origin protocol '{version}'"
    );
    let code = parts
        .next()
        .ok_or_else(|| anyhow!("status line '{status_line}' is missing a code"))?;
    let status = StatusCode::from_bytes(code.as_bytes())
        .with_context(|| format!("invalid status code '{code}'"))?;

    Ok((status, parse_header_lines(lines)?))
}

fn parse_version(token: Option<&str>) -> Result<Version> {
    match token {
        Some("HTTP/1.1") => Ok(Version::HTTP_11),
        Some("HTTP/1.0") => Ok(Version::HTTP_10),
        Some(other) => bail!("unsupported protocol version '{other}'"),
        None => bail!("request line is missing the protocol version"),
    }
}

fn parse_header_lines<'a, I>(lines: I) -> Result<HeaderMap>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed header line '{line}'"))?;
        ensure!(
            !name.ends_with(' ') && !name.ends_with('\t'),
            "whitespace before ':' in header line '{line}'"
        );
        let name = http::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name '{name}'"))?;
        let value = http::HeaderValue::from_str(value.trim())
            .with_context(|| format!("invalid value for header '{name:?}'"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

async fn read_message_body<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    headers: &HeaderMap,
    max_body_size: usize,
) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    if is_chunked(headers) {
        return read_chunked_body(reader, buffer, max_body_size).await;
    }
    match content_length(headers)? {
        Some(length) => read_sized_body(reader, buffer, length, max_body_size).await,
        None => Ok(Bytes::new()),
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
    let mut parsed = None;
    for value in headers.get_all(http::header::CONTENT_LENGTH) {
        let length: usize = value
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .ok_or_else(|| anyhow!("invalid Content-Length value"))?;
        if let Some(previous) = parsed {
            ensure!(previous == length, "conflicting Content-Length headers");
        }
        parsed = Some(length);
    }
    Ok(parsed)
}

async fn read_sized_body<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    length: usize,
    max_body_size: usize,
) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    ensure!(length <= max_body_size, "message body exceeds configured limit");
    fill_buffer(reader, buffer, length).await?;
    Ok(buffer.split_to(length).freeze())
}

async fn read_chunked_body<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_body_size: usize,
) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        let size_line = read_line(reader, buffer).await?;
        let size_token = size_line
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        let size = usize::from_str_radix(size_token, 16)
            .with_context(|| format!("invalid chunk size '{size_token}'"))?;

        if size == 0 {
            // Consume optional trailer lines up to the empty one.
            loop {
                let trailer = read_line(reader, buffer).await?;
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(body.freeze());
        }

        ensure!(
            body.len() + size <= max_body_size,
            "message body exceeds configured limit"
        );
        fill_buffer(reader, buffer, size + 2).await?;
        body.put_slice(&buffer.split_to(size));
        let delimiter = buffer.split_to(2);
        ensure!(&delimiter[..] == b"\r\n", "missing chunk delimiter");
    }
}

async fn read_until_close<R>(
    reader: &mut R,
    buffer: &mut BytesMut,
    max_body_size: usize,
) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    loop {
        ensure!(
            buffer.len() <= max_body_size,
            "message body exceeds configured limit"
        );
        if reader.read_buf(buffer).await? == 0 {
            return Ok(buffer.split().freeze());
        }
    }
}

async fn read_line<R>(reader: &mut R, buffer: &mut BytesMut) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(position) = find_subsequence(buffer, b"\r\n") {
            let line = buffer.split_to(position + 2);
            return Ok(String::from_utf8_lossy(&line[..position]).into_owned());
        }
        ensure!(buffer.len() <= 8 * 1024, "line exceeds configured limit");
        if reader.read_buf(buffer).await? == 0 {
            bail!("connection closed inside a chunked body");
        }
    }
}

async fn fill_buffer<R>(reader: &mut R, buffer: &mut BytesMut, needed: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    while buffer.len() < needed {
        if reader.read_buf(buffer).await? == 0 {
            bail!("connection closed inside the message body");
        }
    }
    Ok(())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
