use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::io::{self, Read};
use std::slice;

use crate::control::CacheControl;
use crate::error::{self, HoardError};
use crate::time::Milliseconds;
use crate::Result;

/// Ordered, case-insensitive multi-map of header names to values. Order and
/// duplicates are preserved so stored entries round-trip byte for byte and
/// repeated headers such as Warning or Vary keep every value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    /// Append a header, keeping any previous values for the same name.
    pub fn add<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every value of `name` with a single one.
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, name: K, value: V) {
        let name = name.into();
        self.remove_all(&name);
        self.0.push((name, value.into()));
    }

    pub fn remove_all(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Last value for `name`, like the original's header lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn values(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn iter(&self) -> slice::Iter<'_, (String, String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Headers(iter.into_iter().collect())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Method {
    #[default]
    GET,
    HEAD,
    POST,
    PUT,
    PATCH,
    DELETE,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::HEAD => "HEAD",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::PATCH => "PATCH",
            Method::DELETE => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "GET" => Ok(Method::GET),
            "HEAD" => Ok(Method::HEAD),
            "POST" => Ok(Method::POST),
            "PUT" => Ok(Method::PUT),
            "PATCH" => Ok(Method::PATCH),
            "DELETE" => Ok(Method::DELETE),
            _ => Err(HoardError::Decode(format!("unknown request method: {value}")).into()),
        }
    }

    /// Write-through methods whose success invalidates any stored response
    /// for the same URL.
    pub fn invalidates_cache(&self) -> bool {
        matches!(
            self,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Protocol {
    Http10,
    #[default]
    Http11,
    Http2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http10 => "HTTP/1.0",
            Protocol::Http11 => "HTTP/1.1",
            Protocol::Http2 => "h2",
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The first line of a stored response: protocol, status code, reason phrase.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusLine {
    pub protocol: Protocol,
    pub code: u16,
    pub message: String,
}

impl StatusLine {
    pub fn parse(line: &str) -> Result<Self> {
        let (protocol, rest) = if let Some(rest) = line.strip_prefix("HTTP/1.1 ") {
            (Protocol::Http11, rest)
        } else if let Some(rest) = line.strip_prefix("HTTP/1.0 ") {
            (Protocol::Http10, rest)
        } else if let Some(rest) = line.strip_prefix("h2 ") {
            (Protocol::Http2, rest)
        } else {
            return Err(error::gen(format!("unexpected status line: {line}")));
        };
        if rest.len() < 3 || !rest.is_char_boundary(3) {
            return Err(error::gen(format!("unexpected status line: {line}")));
        }
        let code = rest[..3]
            .parse::<u16>()
            .map_err(|_| error::gen(format!("unexpected status line: {line}")))?;
        let message = match &rest[3..] {
            "" => String::new(),
            m if m.starts_with(' ') => m[1..].to_string(),
            _ => return Err(error::gen(format!("unexpected status line: {line}"))),
        };
        Ok(StatusLine {
            protocol,
            code,
            message,
        })
    }
}

impl Display for StatusLine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.protocol, self.code, self.message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsVersion {
    Ssl30,
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Ssl30 => "SSLv3",
            TlsVersion::Tls10 => "TLSv1",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "SSLv3" => Ok(TlsVersion::Ssl30),
            "TLSv1" => Ok(TlsVersion::Tls10),
            "TLSv1.1" => Ok(TlsVersion::Tls11),
            "TLSv1.2" => Ok(TlsVersion::Tls12),
            "TLSv1.3" => Ok(TlsVersion::Tls13),
            _ => Err(HoardError::Decode(format!("unexpected TLS version: {value}")).into()),
        }
    }
}

/// Summary of the TLS handshake an HTTPS response arrived over. Certificates
/// are kept as DER bytes; this crate never validates chains, it only records
/// what the transport reported.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    pub tls_version: TlsVersion,
    pub cipher_suite: String,
    pub peer_certificates: Vec<Vec<u8>>,
    pub local_certificates: Vec<Vec<u8>>,
}

/// A response body as a one-shot byte stream. Cache-served bodies stream
/// from the entry's body file; dropping the body releases the snapshot.
pub struct Body {
    reader: Box<dyn Read + Send>,
    content_length: Option<u64>,
}

impl Body {
    pub fn empty() -> Self {
        Body {
            reader: Box::new(io::empty()),
            content_length: Some(0),
        }
    }

    pub fn from_bytes<B: Into<Vec<u8>>>(bytes: B) -> Self {
        let bytes = bytes.into();
        let content_length = Some(bytes.len() as u64);
        Body {
            reader: Box::new(io::Cursor::new(bytes)),
            content_length,
        }
    }

    pub fn from_reader(reader: Box<dyn Read + Send>, content_length: Option<u64>) -> Self {
        Body {
            reader,
            content_length,
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Drain the stream into memory.
    pub fn bytes(mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.reader.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::empty()
    }
}

#[derive(Clone, Debug, Builder)]
#[builder(pattern = "owned")]
pub struct Request {
    #[builder(setter(into))]
    url: String,
    #[builder(default)]
    method: Method,
    #[builder(default)]
    headers: Headers,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.set(name, value);
    }

    pub fn is_https(&self) -> bool {
        self.url.starts_with("https://")
    }

    /// The URL's query component, if any.
    pub fn query(&self) -> Option<&str> {
        let without_fragment = self.url.split('#').next().unwrap_or(&self.url);
        without_fragment.split_once('?').map(|(_, q)| q)
    }

    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }
}

#[derive(Debug)]
pub struct Response {
    request: Request,
    protocol: Protocol,
    status: u16,
    message: String,
    headers: Headers,
    body: Option<Body>,
    handshake: Option<Handshake>,
    sent_request_at: Milliseconds,
    received_response_at: Milliseconds,
    /// Store sequence number captured when this response was loaded from
    /// cache. Present only on cache-served responses; used to re-edit the
    /// same entry without clobbering a concurrent writer.
    snapshot_sequence: Option<u64>,
}

/// Hand-rolled because the body stream is not `Clone`, which rules out the
/// derived builder used elsewhere.
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    request: Option<Request>,
    protocol: Option<Protocol>,
    status: Option<u16>,
    message: String,
    headers: Headers,
    body: Option<Body>,
    handshake: Option<Handshake>,
    sent_request_at: Milliseconds,
    received_response_at: Milliseconds,
    snapshot_sequence: Option<u64>,
}

impl ResponseBuilder {
    pub fn request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn message<M: Into<String>>(mut self, message: M) -> Self {
        self.message = message.into();
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn handshake(mut self, handshake: Handshake) -> Self {
        self.handshake = Some(handshake);
        self
    }

    pub fn sent_request_at(mut self, at: Milliseconds) -> Self {
        self.sent_request_at = at;
        self
    }

    pub fn received_response_at(mut self, at: Milliseconds) -> Self {
        self.received_response_at = at;
        self
    }

    pub fn snapshot_sequence(mut self, sequence: u64) -> Self {
        self.snapshot_sequence = Some(sequence);
        self
    }

    pub fn build(self) -> Result<Response> {
        let request = self
            .request
            .ok_or_else(|| error::gen("response requires a request"))?;
        let status = self
            .status
            .ok_or_else(|| error::gen("response requires a status code"))?;
        Ok(Response {
            request,
            protocol: self.protocol.unwrap_or_default(),
            status,
            message: self.message,
            headers: self.headers,
            body: self.body,
            handshake: self.handshake,
            sent_request_at: self.sent_request_at,
            received_response_at: self.received_response_at,
            snapshot_sequence: self.snapshot_sequence,
        })
    }
}

impl Response {
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder::default()
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.add(name, value);
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub fn sent_request_at(&self) -> Milliseconds {
        self.sent_request_at
    }

    pub fn received_response_at(&self) -> Milliseconds {
        self.received_response_at
    }

    pub fn snapshot_sequence(&self) -> Option<u64> {
        self.snapshot_sequence
    }

    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    pub fn body(&mut self) -> Option<&mut Body> {
        self.body.as_mut()
    }

    pub fn take_body(&mut self) -> Option<Body> {
        self.body.take()
    }

    pub fn set_body(&mut self, body: Body) {
        self.body = Some(body);
    }

    pub fn set_headers(&mut self, headers: Headers) {
        self.headers = headers;
    }

    pub fn set_sent_request_at(&mut self, at: Milliseconds) {
        self.sent_request_at = at;
    }

    pub fn set_received_response_at(&mut self, at: Milliseconds) {
        self.received_response_at = at;
    }

    /// A body-less copy of this response's metadata.
    pub fn strip_body(&self) -> Response {
        Response {
            request: self.request.clone(),
            protocol: self.protocol,
            status: self.status,
            message: self.message.clone(),
            headers: self.headers.clone(),
            body: None,
            handshake: self.handshake.clone(),
            sent_request_at: self.sent_request_at,
            received_response_at: self.received_response_at,
            snapshot_sequence: self.snapshot_sequence,
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length").and_then(|v| v.parse().ok())
    }

    /// Whether a message body is expected, per the status code and framing
    /// headers. HEAD responses and 1xx/204/304 codes carry none unless the
    /// framing headers promise one anyway.
    pub fn has_body(&self) -> bool {
        if self.request.method() == Method::HEAD {
            return false;
        }
        let code = self.status;
        if (code < 100 || code >= 200) && code != 204 && code != 304 {
            return true;
        }
        self.content_length().is_some()
            || self
                .header("Transfer-Encoding")
                .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    }
}

/// The set of request header names a response's Vary headers name. Names are
/// compared case-insensitively; "*" is kept verbatim.
pub fn vary_fields(response_headers: &Headers) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    for value in response_headers.values("Vary") {
        for field in value.split(',') {
            fields.insert(field.trim().to_ascii_lowercase());
        }
    }
    fields
}

pub fn has_vary_all(response_headers: &Headers) -> bool {
    vary_fields(response_headers).contains("*")
}

/// The subset of the request's headers the response's Vary header names.
/// This is what gets persisted next to the response so a later request can
/// be checked against it.
pub fn vary_headers(request_headers: &Headers, response_headers: &Headers) -> Headers {
    let fields = vary_fields(response_headers);
    let mut result = Headers::new();
    for (name, value) in request_headers.iter() {
        if fields.contains(&name.to_ascii_lowercase()) {
            result.add(name.clone(), value.clone());
        }
    }
    result
}

/// True when every request header named by the stored response's Vary
/// headers carries the same values on the new request as it did on the
/// cached one. Absent on both sides counts as a match.
pub fn vary_matches(
    response_headers: &Headers,
    cached_request_headers: &Headers,
    request: &Request,
) -> bool {
    vary_fields(response_headers)
        .iter()
        .all(|field| cached_request_headers.values(field) == request.headers().values(field))
}
