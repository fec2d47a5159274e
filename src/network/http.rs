//! Minimal HTTP/1.1 framing for the AMF endpoint.
//!
//! Only what the gateway needs: a request head with a Content-Length body,
//! keep-alive, and fixed-length responses. No chunked transfer encoding.

use std::net::SocketAddr;

use thiserror::Error;

use crate::dispatch::Identity;

pub const MAX_HEADERS: usize = 32;
pub const MAX_HEAD_BYTES: usize = 16 * 1024;
pub const AMF_CONTENT_TYPE: &str = "application/x-amf";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
pub const DEFAULT_IDENTITY_HEADER: &str = "X-Session-User";

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("invalid content-length header")]
    BadContentLength,

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
}

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Minor version: 1 for HTTP/1.1, 0 for HTTP/1.0.
    pub version: u8,
    pub content_length: Option<usize>,
    pub keep_alive: bool,
    /// Bytes taken by the head, including the blank line.
    pub head_len: usize,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// `Ok(None)` while the head is still incomplete.
pub fn parse_head(buf: &[u8]) -> Result<Option<RequestHead>, HttpError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    let head_len = match req.parse(buf)? {
        httparse::Status::Partial if buf.len() > MAX_HEAD_BYTES => {
            return Err(HttpError::HeadTooLarge {
                limit: MAX_HEAD_BYTES,
            })
        }
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(n) => n,
    };

    let version = req.version.unwrap_or(1);
    let headers: Vec<(String, String)> = req
        .headers
        .iter()
        .map(|h| (h.name.to_owned(), String::from_utf8_lossy(h.value).trim().to_owned()))
        .collect();

    let content_length = match headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
    {
        Some((_, v)) => Some(v.parse::<usize>().map_err(|_| HttpError::BadContentLength)?),
        None => None,
    };

    let connection = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("connection"))
        .map(|(_, v)| v.to_ascii_lowercase());
    let keep_alive = match connection.as_deref() {
        Some(v) if v.contains("close") => false,
        Some(v) if v.contains("keep-alive") => true,
        _ => version >= 1,
    };

    Ok(Some(RequestHead {
        method: req.method.unwrap_or_default().to_owned(),
        path: req.path.unwrap_or_default().to_owned(),
        version,
        content_length,
        keep_alive,
        head_len,
        headers,
    }))
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        405 => "Method Not Allowed",
        411 => "Length Required",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Append a complete response to `out`.
pub fn write_response(out: &mut Vec<u8>, status: u16, content_type: &str, body: &[u8], keep_alive: bool) {
    let mut head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: {}\r\n",
        status,
        reason_phrase(status),
        content_type,
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
    );
    if status == 405 {
        head.push_str("Allow: POST\r\n");
    }
    head.push_str("\r\n");

    out.reserve(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
}

/// Maps an HTTP request to the caller identity handed to handlers.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, head: &RequestHead, peer: SocketAddr) -> Identity;
}

/// Trusts a session header set by an authenticating front proxy; requests
/// without it are guests keyed by peer address.
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    header: String,
}

impl HeaderIdentity {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

impl Default for HeaderIdentity {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTITY_HEADER)
    }
}

impl IdentityResolver for HeaderIdentity {
    fn resolve(&self, head: &RequestHead, peer: SocketAddr) -> Identity {
        match head.header(&self.header).filter(|v| !v.is_empty()) {
            Some(user) => Identity::user(user),
            None => Identity::guest(format!("guest:{}", peer.ip())),
        }
    }
}
