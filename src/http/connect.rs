//! HTTP/1.1 codec for the proxy CONNECT handshake.
//!
//! Just enough HTTP to open a tunnel: serialize one request head and parse
//! one response head. Bodies are never read.

use crate::base::neterror::NetError;
use crate::socket::conn::ManagedConnection;
use crate::socket::stream::StreamSocket;
use bytes::{BufMut, BytesMut};
use http::header::{HeaderName, HeaderValue, HOST, PROXY_AUTHORIZATION, USER_AGENT};
use http::{Method, Request, Response, StatusCode, Version};

/// Upper bound on the size of a response head.
pub const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Build a CONNECT request for `target` (`host:port`).
pub fn connect_request(
    target: &str,
    proxy_auth: Option<&str>,
    user_agent: &str,
) -> Result<Request<()>, NetError> {
    let mut builder = Request::builder()
        .method(Method::CONNECT)
        .uri(format!("http://{}", target))
        .version(Version::HTTP_11)
        .header(USER_AGENT, user_agent);
    if let Some(auth) = proxy_auth {
        builder = builder.header(PROXY_AUTHORIZATION, auth);
    }
    builder.body(()).map_err(|_| NetError::AddressInvalid)
}

/// Serialize a request head.
///
/// CONNECT uses the authority form (`CONNECT host:port HTTP/1.1`); other
/// methods use origin form. A `Host` header is added when missing.
pub fn encode_request(req: &Request<()>) -> BytesMut {
    let uri = req.uri();
    let authority = uri.authority().map(|a| a.as_str()).unwrap_or_default();
    let target = if *req.method() == Method::CONNECT {
        authority
    } else {
        uri.path_and_query().map(|p| p.as_str()).unwrap_or("/")
    };

    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(req.method().as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(target.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    if !req.headers().contains_key(HOST) && !authority.is_empty() {
        put_header(&mut buf, HOST.as_str(), authority.as_bytes());
    }
    for (name, value) in req.headers() {
        put_header(&mut buf, name.as_str(), value.as_bytes());
    }
    buf.put_slice(b"\r\n");
    buf
}

fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_slice(canonical_name(name).as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

// `http` lowercases header names; proxies expect the canonical spelling.
fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        out.push(if upper { c.to_ascii_uppercase() } else { c });
        upper = c == '-';
    }
    out
}

/// Parse a complete response head (status line, headers, blank line).
pub fn parse_response_head(head: &str) -> Result<Response<()>, NetError> {
    let mut lines = head.split("\r\n").flat_map(|l| l.split('\n'));
    let status_line = lines.next().ok_or(NetError::InvalidHttpResponse)?;

    let mut parts = status_line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        _ => return Err(NetError::InvalidHttpResponse),
    };
    let status = parts
        .next()
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or(NetError::InvalidHttpResponse)?;

    let mut builder = Response::builder().version(version).status(status);
    for line in lines.take_while(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').ok_or(NetError::InvalidHttpResponse)?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| NetError::InvalidHttpResponse)?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| NetError::InvalidHttpResponse)?;
        builder = builder.header(name, value);
    }
    builder.body(()).map_err(|_| NetError::InvalidHttpResponse)
}

/// Read one response head from `conn` and parse it.
///
/// Reads line by line through the connection's buffer, so bytes that follow
/// the head stay queued for the caller. Each line read is bounded by what is
/// left of [`MAX_RESPONSE_HEAD`], so a peer that never sends `\n` cannot
/// make the head grow past it.
pub async fn read_response<S: StreamSocket>(
    conn: &ManagedConnection<S>,
) -> Result<Response<()>, NetError> {
    let mut head = String::new();
    loop {
        let remaining = MAX_RESPONSE_HEAD.saturating_sub(head.len());
        let line = conn.read_line_capped(remaining).await?;
        head.push_str(&line);
        if line == "\r\n" || line == "\n" {
            break;
        }
    }
    parse_response_head(&head)
}
