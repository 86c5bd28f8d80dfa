//! HTTP/1.x codec, the worked example of the `Codec` contract.
//!
//! `HttpServerCodec` decodes requests and encodes responses;
//! `HttpClientCodec` is its mirror image for outbound connections. Both
//! share the same incremental head/headers/body state machine and the same
//! canonicalisations:
//!
//! - encoding always emits `HTTP/1.1` and inserts a `content-length` header
//!   carrying the exact body byte length (overwriting the user's value in
//!   place when supplied, prepending otherwise),
//! - header names travel on the wire in the case supplied and compare
//!   lowercased,
//! - line endings are strict CRLF; a bare LF is a protocol violation.
//!
//! Chunked transfer encoding is not supported.

use crate::codec::{Codec, ProtocolViolation};
use bytes::{Bytes, BytesMut};
use memchr::memchr;
use std::fmt;
use std::mem;
use std::str;

/// Protocol versions the parser accepts. The encoder only ever produces
/// `Http11`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    fn parse(token: &[u8]) -> Result<Version, ProtocolViolation> {
        match token {
            b"HTTP/1.0" => Ok(Version::Http10),
            b"HTTP/1.1" => Ok(Version::Http11),
            other => Err(ProtocolViolation::new(format!(
                "unsupported HTTP version {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric status plus reason phrase, e.g. `200 OK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCode {
    pub code: u16,
    pub reason: String,
}

impl StatusCode {
    pub fn new<S: Into<String>>(code: u16, reason: S) -> StatusCode {
        StatusCode {
            code,
            reason: reason.into(),
        }
    }

    pub fn ok() -> StatusCode {
        StatusCode::new(200, "OK")
    }
}

/// Ordered header sequence. Names keep the case they were supplied in;
/// lookups and equality compare names lowercased (ASCII), and duplicates are
/// permitted.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers {
            entries: Vec::new(),
        }
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Headers {
        Headers {
            entries: pairs
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }

    pub fn push<N: Into<String>, V: Into<String>>(&mut self, name: N, value: V) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value whose name matches `name` case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(entry, _)| entry.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn matching(&self, name: &str) -> impl Iterator<Item = &str> {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(move |(entry, _)| entry.eq_ignore_ascii_case(&name))
            .map(|(_, value)| value.as_str())
    }
}

impl PartialEq for Headers {
    fn eq(&self, other: &Headers) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|((an, av), (bn, bv))| an.eq_ignore_ascii_case(bn) && av == bv)
    }
}

impl Eq for Headers {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new<M: Into<String>, P: Into<String>>(
        method: M,
        path: P,
        headers: Headers,
        body: Bytes,
    ) -> HttpRequest {
        HttpRequest {
            method: method.into(),
            path: path.into(),
            version: Version::Http11,
            headers,
            body,
        }
    }

    pub fn get<P: Into<String>>(path: P) -> HttpRequest {
        HttpRequest::new("GET", path, Headers::new(), Bytes::new())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: Version,
    pub code: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(code: StatusCode, headers: Headers, body: Bytes) -> HttpResponse {
        HttpResponse {
            version: Version::Http11,
            code,
            headers,
            body,
        }
    }

    pub fn ok<B: Into<Bytes>>(body: B) -> HttpResponse {
        HttpResponse::new(StatusCode::ok(), Headers::new(), body.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Head,
    Headers,
    Body(usize),
}

/// Server-side HTTP codec: requests in, responses out.
pub struct HttpServerCodec {
    buf: BytesMut,
    state: DecodeState,
    head: Option<(String, String, Version)>,
    headers: Headers,
}

impl HttpServerCodec {
    pub fn new() -> HttpServerCodec {
        HttpServerCodec {
            buf: BytesMut::new(),
            state: DecodeState::Head,
            head: None,
            headers: Headers::new(),
        }
    }

    fn emit(&mut self, body: Bytes) -> HttpRequest {
        let (method, path, version) = self.head.take().expect("Request head missing at emit");

        self.state = DecodeState::Head;

        HttpRequest {
            method,
            path,
            version,
            headers: mem::take(&mut self.headers),
            body,
        }
    }
}

impl Codec for HttpServerCodec {
    type In = HttpRequest;
    type Out = HttpResponse;

    fn decode(&mut self, input: &[u8], out: &mut Vec<HttpRequest>) -> Result<(), ProtocolViolation> {
        self.buf.extend_from_slice(input);

        loop {
            match self.state {
                DecodeState::Head => match take_line(&mut self.buf)? {
                    None => return Ok(()),
                    Some(line) => {
                        self.head = Some(parse_request_line(&line)?);
                        self.state = DecodeState::Headers;
                    }
                },
                DecodeState::Headers => match take_line(&mut self.buf)? {
                    None => return Ok(()),
                    Some(line) => {
                        if line.is_empty() {
                            match content_length(&self.headers)? {
                                Some(length) if length > 0 => {
                                    self.state = DecodeState::Body(length)
                                }
                                _ => out.push(self.emit(Bytes::new())),
                            }
                        } else {
                            let (name, value) = split_header_line(&line)?;
                            self.headers.push(name, value);
                        }
                    }
                },
                DecodeState::Body(length) => {
                    if self.buf.len() < length {
                        return Ok(());
                    }

                    let body = self.buf.split_to(length).freeze();
                    out.push(self.emit(body));
                }
            }
        }
    }

    fn eof(&mut self) -> Result<Option<HttpRequest>, ProtocolViolation> {
        eof_check(self.state, &self.buf)
    }

    fn encode(message: &HttpResponse, dst: &mut BytesMut) {
        let head = format!(
            "HTTP/1.1 {} {}\r\n",
            message.code.code, message.code.reason
        );

        dst.extend_from_slice(head.as_bytes());
        write_headers(dst, &message.headers, message.body.len());
        dst.extend_from_slice(&message.body);
    }
}

/// Client-side HTTP codec: responses in, requests out.
pub struct HttpClientCodec {
    buf: BytesMut,
    state: DecodeState,
    head: Option<(Version, StatusCode)>,
    headers: Headers,
}

impl HttpClientCodec {
    pub fn new() -> HttpClientCodec {
        HttpClientCodec {
            buf: BytesMut::new(),
            state: DecodeState::Head,
            head: None,
            headers: Headers::new(),
        }
    }

    fn emit(&mut self, body: Bytes) -> HttpResponse {
        let (version, code) = self.head.take().expect("Response head missing at emit");

        self.state = DecodeState::Head;

        HttpResponse {
            version,
            code,
            headers: mem::take(&mut self.headers),
            body,
        }
    }
}

impl Codec for HttpClientCodec {
    type In = HttpResponse;
    type Out = HttpRequest;

    fn decode(
        &mut self,
        input: &[u8],
        out: &mut Vec<HttpResponse>,
    ) -> Result<(), ProtocolViolation> {
        self.buf.extend_from_slice(input);

        loop {
            match self.state {
                DecodeState::Head => match take_line(&mut self.buf)? {
                    None => return Ok(()),
                    Some(line) => {
                        self.head = Some(parse_status_line(&line)?);
                        self.state = DecodeState::Headers;
                    }
                },
                DecodeState::Headers => match take_line(&mut self.buf)? {
                    None => return Ok(()),
                    Some(line) => {
                        if line.is_empty() {
                            match content_length(&self.headers)? {
                                Some(length) if length > 0 => {
                                    self.state = DecodeState::Body(length)
                                }
                                _ => out.push(self.emit(Bytes::new())),
                            }
                        } else {
                            let (name, value) = split_header_line(&line)?;
                            self.headers.push(name, value);
                        }
                    }
                },
                DecodeState::Body(length) => {
                    if self.buf.len() < length {
                        return Ok(());
                    }

                    let body = self.buf.split_to(length).freeze();
                    out.push(self.emit(body));
                }
            }
        }
    }

    fn eof(&mut self) -> Result<Option<HttpResponse>, ProtocolViolation> {
        eof_check(self.state, &self.buf)
    }

    fn encode(message: &HttpRequest, dst: &mut BytesMut) {
        let head = format!("{} {} HTTP/1.1\r\n", message.method, message.path);

        dst.extend_from_slice(head.as_bytes());
        write_headers(dst, &message.headers, message.body.len());
        dst.extend_from_slice(&message.body);
    }
}

/// Splits one CRLF-terminated line off the front of `buf`, without the
/// terminator. `None` means the terminator has not arrived yet.
fn take_line(buf: &mut BytesMut) -> Result<Option<BytesMut>, ProtocolViolation> {
    match memchr(b'\n', buf) {
        None => Ok(None),
        Some(idx) => {
            if idx == 0 || buf[idx - 1] != b'\r' {
                return Err(ProtocolViolation::new("bare LF in line ending"));
            }

            let mut line = buf.split_to(idx + 1);
            line.truncate(idx - 1);
            Ok(Some(line))
        }
    }
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode), ProtocolViolation> {
    let mut parts = line.splitn(3, |&byte| byte == b' ');

    let version = Version::parse(parts.next().unwrap_or(b""))?;

    let code = ascii(parts.next().unwrap_or(b""))?
        .parse::<u16>()
        .map_err(|_| ProtocolViolation::new("malformed status code"))?;

    let reason = ascii(parts.next().unwrap_or(b""))?.to_string();

    Ok((version, StatusCode::new(code, reason)))
}

fn parse_request_line(line: &[u8]) -> Result<(String, String, Version), ProtocolViolation> {
    let mut parts = line.splitn(3, |&byte| byte == b' ');

    let method = ascii(parts.next().unwrap_or(b""))?;
    let path = ascii(parts.next().unwrap_or(b""))?;

    if method.is_empty() || path.is_empty() {
        return Err(ProtocolViolation::new("malformed request line"));
    }

    let version = Version::parse(parts.next().unwrap_or(b""))?;

    Ok((method.to_string(), path.to_string(), version))
}

fn split_header_line(line: &[u8]) -> Result<(String, String), ProtocolViolation> {
    let idx = memchr(b':', line)
        .ok_or_else(|| ProtocolViolation::new("header line missing ':' separator"))?;

    if idx == 0 {
        return Err(ProtocolViolation::new("header line with empty name"));
    }

    let name = ascii(&line[..idx])?;
    let value = ascii(&line[idx + 1..])?.trim_start_matches(|c| c == ' ' || c == '\t');

    Ok((name.to_string(), value.to_string()))
}

/// Extracts the declared body length. More than one `content-length` header
/// is a violation regardless of the values.
fn content_length(headers: &Headers) -> Result<Option<usize>, ProtocolViolation> {
    let mut matching = headers.matching("content-length");

    let value = match matching.next() {
        None => return Ok(None),
        Some(value) => value,
    };

    if matching.next().is_some() {
        return Err(ProtocolViolation::new("duplicate content-length header"));
    }

    value
        .trim()
        .parse::<usize>()
        .map(Some)
        .map_err(|_| ProtocolViolation::new("malformed content-length value"))
}

fn eof_check<M>(state: DecodeState, buf: &BytesMut) -> Result<Option<M>, ProtocolViolation> {
    if state == DecodeState::Head && buf.is_empty() {
        Ok(None)
    } else {
        Err(ProtocolViolation::new("stream truncated mid-message"))
    }
}

/// Writes the header block plus terminating blank line, inserting the
/// `content-length` canonicalisation: an existing header (any case) keeps
/// its position but its value is replaced; otherwise the header is
/// prepended.
fn write_headers(dst: &mut BytesMut, headers: &Headers, body_len: usize) {
    if !headers.contains("content-length") {
        let line = format!("content-length: {}\r\n", body_len);
        dst.extend_from_slice(line.as_bytes());
    }

    for (name, value) in headers.iter() {
        let line = if name.eq_ignore_ascii_case("content-length") {
            format!("{}: {}\r\n", name, body_len)
        } else {
            format!("{}: {}\r\n", name, value)
        };

        dst.extend_from_slice(line.as_bytes());
    }

    dst.extend_from_slice(b"\r\n");
}

fn ascii(bytes: &[u8]) -> Result<&str, ProtocolViolation> {
    str::from_utf8(bytes).map_err(|_| ProtocolViolation::new("non-UTF-8 bytes in message head"))
}
