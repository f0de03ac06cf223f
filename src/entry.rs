use std::io::{BufRead, BufReader, BufWriter, Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::HoardError;
use crate::http::{
    self, Body, Handshake, Headers, Method, Protocol, Request, Response, StatusLine, TlsVersion,
};
use crate::store::Snapshot;
use crate::time::Milliseconds;
use crate::Result;

/// Value slot holding the serialized HTTP metadata.
pub const ENTRY_METADATA: usize = 0;
/// Value slot holding the raw response body bytes.
pub const ENTRY_BODY: usize = 1;
pub const ENTRY_COUNT: usize = 2;

/// Synthetic response headers storing when the request was sent and the
/// response received. Written into the metadata slot and stripped again on
/// decode; they never reach callers.
const SENT_MILLIS: &str = "Hoard-Sent-Millis";
const RECEIVED_MILLIS: &str = "Hoard-Received-Millis";

/// One cache entry's HTTP metadata, serialized to the metadata slot as a
/// line-oriented text record:
///
/// ```text
/// https://example.com/index.html
/// GET
/// 1
/// Accept-Language: fr
/// HTTP/1.1 200 OK
/// 4
/// Content-Type: text/html
/// Cache-Control: max-age=600
/// Hoard-Sent-Millis: 1700000000000
/// Hoard-Received-Millis: 1700000000120
/// ```
///
/// HTTPS entries append a blank line, the cipher suite, the two certificate
/// chains (decimal count, then one base64 DER line each) and the TLS
/// version.
pub struct CacheEntry {
    url: String,
    request_method: Method,
    vary_headers: Headers,
    protocol: Protocol,
    code: u16,
    message: String,
    response_headers: Headers,
    handshake: Option<Handshake>,
    sent_request_at: Milliseconds,
    received_response_at: Milliseconds,
}

fn decode_err<T: Into<String>>(msg: T) -> crate::Error {
    HoardError::Decode(msg.into()).into()
}

impl CacheEntry {
    pub fn from_response(response: &Response) -> Self {
        CacheEntry {
            url: response.request().url().to_string(),
            request_method: response.request().method(),
            vary_headers: http::vary_headers(response.request().headers(), response.headers()),
            protocol: response.protocol(),
            code: response.status(),
            message: response.message().to_string(),
            response_headers: response.headers().clone(),
            handshake: response.handshake().cloned(),
            sent_request_at: response.sent_request_at(),
            received_response_at: response.received_response_at(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Decode an entry from the metadata slot. Any truncated or malformed
    /// line fails the whole decode; nothing partial is returned.
    pub fn read<R: Read>(source: R) -> Result<Self> {
        let mut lines = StrictLines::new(source);

        let url = lines.next_line()?;
        let request_method = Method::parse(&lines.next_line()?)?;

        let mut vary_headers = Headers::new();
        for _ in 0..lines.next_count()? {
            let (name, value) = parse_header_line(&lines.next_line()?)?;
            vary_headers.add(name, value);
        }

        let status = StatusLine::parse(&lines.next_line()?)
            .map_err(|err| decode_err(err.to_string()))?;

        let mut response_headers = Headers::new();
        for _ in 0..lines.next_count()? {
            let (name, value) = parse_header_line(&lines.next_line()?)?;
            response_headers.add(name, value);
        }
        let sent_request_at = take_millis_header(&mut response_headers, SENT_MILLIS)?;
        let received_response_at = take_millis_header(&mut response_headers, RECEIVED_MILLIS)?;

        let handshake = if url.starts_with("https://") {
            let blank = lines.next_line()?;
            if !blank.is_empty() {
                return Err(decode_err(format!("expected \"\" but was \"{blank}\"")));
            }
            let cipher_suite = lines.next_line()?;
            let peer_certificates = read_certificate_list(&mut lines)?;
            let local_certificates = read_certificate_list(&mut lines)?;
            // Entries written before the version line was added default to
            // the oldest version.
            let tls_version = if lines.exhausted()? {
                TlsVersion::Ssl30
            } else {
                TlsVersion::parse(&lines.next_line()?)?
            };
            Some(Handshake {
                tls_version,
                cipher_suite,
                peer_certificates,
                local_certificates,
            })
        } else {
            None
        };

        Ok(CacheEntry {
            url,
            request_method,
            vary_headers,
            protocol: status.protocol,
            code: status.code,
            message: status.message,
            response_headers,
            handshake,
            sent_request_at,
            received_response_at,
        })
    }

    pub fn write_to<W: Write>(&self, sink: W) -> Result<()> {
        let mut sink = BufWriter::new(sink);

        writeln!(sink, "{}", self.url)?;
        writeln!(sink, "{}", self.request_method)?;
        writeln!(sink, "{}", self.vary_headers.len())?;
        for (name, value) in self.vary_headers.iter() {
            writeln!(sink, "{name}: {value}")?;
        }

        let status = StatusLine {
            protocol: self.protocol,
            code: self.code,
            message: self.message.clone(),
        };
        writeln!(sink, "{status}")?;
        writeln!(sink, "{}", self.response_headers.len() + 2)?;
        for (name, value) in self.response_headers.iter() {
            writeln!(sink, "{name}: {value}")?;
        }
        writeln!(sink, "{SENT_MILLIS}: {}", self.sent_request_at)?;
        writeln!(sink, "{RECEIVED_MILLIS}: {}", self.received_response_at)?;

        if self.is_https() {
            let handshake = self
                .handshake
                .as_ref()
                .ok_or_else(|| decode_err("https entry without handshake"))?;
            writeln!(sink)?;
            writeln!(sink, "{}", handshake.cipher_suite)?;
            write_certificate_list(&mut sink, &handshake.peer_certificates)?;
            write_certificate_list(&mut sink, &handshake.local_certificates)?;
            writeln!(sink, "{}", handshake.tls_version.as_str())?;
        }
        sink.flush()?;
        Ok(())
    }

    fn is_https(&self) -> bool {
        self.url.starts_with("https://")
    }

    /// True when this stored entry answers `request`: same URL and method,
    /// and every request header the stored response varies on carries the
    /// values it had when the entry was stored.
    pub fn matches(&self, request: &Request) -> bool {
        self.url == request.url()
            && self.request_method == request.method()
            && http::vary_matches(&self.response_headers, &self.vary_headers, request)
    }

    /// Turn the decoded metadata plus the snapshot's body slot into a
    /// served response. The body streams from disk; dropping it releases
    /// the snapshot's file handles.
    pub fn into_response(self, mut snapshot: Snapshot) -> Result<Response> {
        let body_length = snapshot.length(ENTRY_BODY);
        let body_source = snapshot
            .take_source(ENTRY_BODY)
            .ok_or_else(|| decode_err("snapshot body already consumed"))?;
        let sequence = snapshot.sequence_number();

        let request = Request::builder()
            .url(self.url.clone())
            .method(self.request_method)
            .headers(self.vary_headers.clone())
            .build()?;
        let mut builder = Response::builder()
            .request(request)
            .protocol(self.protocol)
            .status(self.code)
            .message(self.message)
            .headers(self.response_headers)
            .body(Body::from_reader(body_source, Some(body_length)))
            .sent_request_at(self.sent_request_at)
            .received_response_at(self.received_response_at)
            .snapshot_sequence(sequence);
        if let Some(handshake) = self.handshake {
            builder = builder.handshake(handshake);
        }
        Ok(builder.build()?)
    }
}

fn parse_header_line(line: &str) -> Result<(String, String)> {
    let colon = line
        .find(':')
        .ok_or_else(|| decode_err(format!("malformed header line: {line}")))?;
    let name = line[..colon].trim_end();
    let value = line[colon + 1..].trim_start();
    if name.is_empty() {
        return Err(decode_err(format!("malformed header line: {line}")));
    }
    Ok((name.to_string(), value.to_string()))
}

fn take_millis_header(headers: &mut Headers, name: &str) -> Result<Milliseconds> {
    let millis = match headers.get(name) {
        Some(value) => Milliseconds::new(
            value
                .parse::<u64>()
                .map_err(|_| decode_err(format!("malformed {name} header: {value}")))?,
        ),
        None => Milliseconds::new(0),
    };
    headers.remove_all(name);
    Ok(millis)
}

fn read_certificate_list<R: Read>(lines: &mut StrictLines<R>) -> Result<Vec<Vec<u8>>> {
    let count_line = lines.next_line()?;
    let count = count_line
        .parse::<i64>()
        .map_err(|_| decode_err(format!("expected a certificate count but was \"{count_line}\"")))?;
    // Early writers used -1 for an absent chain.
    if count == -1 {
        return Ok(Vec::new());
    }
    if count < 0 {
        return Err(decode_err(format!(
            "expected a certificate count but was \"{count_line}\""
        )));
    }
    let mut certificates = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let line = lines.next_line()?;
        let bytes = BASE64
            .decode(line.as_bytes())
            .map_err(|_| decode_err("malformed certificate"))?;
        certificates.push(bytes);
    }
    Ok(certificates)
}

fn write_certificate_list<W: Write>(sink: &mut W, certificates: &[Vec<u8>]) -> Result<()> {
    writeln!(sink, "{}", certificates.len())?;
    for certificate in certificates {
        writeln!(sink, "{}", BASE64.encode(certificate))?;
    }
    Ok(())
}

/// Newline-terminated line reader that fails on a torn final line instead
/// of silently returning it.
struct StrictLines<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> StrictLines<R> {
    fn new(source: R) -> Self {
        StrictLines {
            reader: BufReader::new(source),
        }
    }

    fn next_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|err| decode_err(format!("unreadable entry: {err}")))?;
        if n == 0 {
            return Err(decode_err("unexpected end of stream"));
        }
        if line.pop() != Some('\n') {
            return Err(decode_err("truncated line at end of stream"));
        }
        if line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    fn next_count(&mut self) -> Result<usize> {
        let line = self.next_line()?;
        line.parse::<usize>()
            .map_err(|_| decode_err(format!("expected a count but was \"{line}\"")))
    }

    fn exhausted(&mut self) -> Result<bool> {
        let buf = self
            .reader
            .fill_buf()
            .map_err(|err| decode_err(format!("unreadable entry: {err}")))?;
        Ok(buf.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn plain_entry() -> CacheEntry {
        let mut vary_headers = Headers::new();
        vary_headers.add("Accept-Language", "fr");
        let mut response_headers = Headers::new();
        response_headers.add("Content-Type", "text/plain");
        response_headers.add("Vary", "Accept-Language");
        CacheEntry {
            url: "http://example.com/data".to_string(),
            request_method: Method::GET,
            vary_headers,
            protocol: Protocol::Http11,
            code: 200,
            message: "OK".to_string(),
            response_headers,
            handshake: None,
            sent_request_at: Milliseconds::new(1_700_000_000_000),
            received_response_at: Milliseconds::new(1_700_000_000_120),
        }
    }

    fn https_entry() -> CacheEntry {
        let mut entry = plain_entry();
        entry.url = "https://example.com/data".to_string();
        entry.handshake = Some(Handshake {
            tls_version: TlsVersion::Tls13,
            cipher_suite: "TLS_AES_128_GCM_SHA256".to_string(),
            peer_certificates: vec![vec![0x30, 0x82, 0x01, 0x0a], vec![0x30, 0x82]],
            local_certificates: vec![],
        });
        entry
    }

    fn round_trip(entry: &CacheEntry) -> CacheEntry {
        let mut encoded = Vec::new();
        entry.write_to(&mut encoded).unwrap();
        CacheEntry::read(Cursor::new(encoded)).unwrap()
    }

    #[test]
    fn test_plain_entry_round_trip() {
        let entry = plain_entry();
        let decoded = round_trip(&entry);
        assert_eq!(entry.url, decoded.url);
        assert_eq!(entry.request_method, decoded.request_method);
        assert_eq!(entry.vary_headers, decoded.vary_headers);
        assert_eq!(entry.code, decoded.code);
        assert_eq!(entry.message, decoded.message);
        assert_eq!(entry.response_headers, decoded.response_headers);
        assert_eq!(entry.sent_request_at, decoded.sent_request_at);
        assert_eq!(entry.received_response_at, decoded.received_response_at);
        assert!(decoded.handshake.is_none());
    }

    #[test]
    fn test_https_entry_round_trip_keeps_handshake() {
        let entry = https_entry();
        let decoded = round_trip(&entry);
        assert_eq!(entry.handshake, decoded.handshake);
    }

    #[test]
    fn test_timing_headers_are_synthetic() {
        let entry = plain_entry();
        let mut encoded = Vec::new();
        entry.write_to(&mut encoded).unwrap();
        let text = String::from_utf8(encoded).unwrap();
        assert!(text.contains("Hoard-Sent-Millis: 1700000000000\n"));
        // They are stripped from the decoded headers.
        let decoded = round_trip(&entry);
        assert!(decoded.response_headers.get(SENT_MILLIS).is_none());
        assert!(decoded.response_headers.get(RECEIVED_MILLIS).is_none());
    }

    #[test]
    fn test_truncated_stream_is_decode_error() {
        let entry = plain_entry();
        let mut encoded = Vec::new();
        entry.write_to(&mut encoded).unwrap();
        for cut in [1, encoded.len() / 2, encoded.len() - 1] {
            assert!(
                CacheEntry::read(Cursor::new(&encoded[..cut])).is_err(),
                "decoded a stream cut at {cut}"
            );
        }
    }

    #[test]
    fn test_garbage_count_is_decode_error() {
        let encoded = "http://example.com/\nGET\nnot-a-number\n";
        assert!(CacheEntry::read(Cursor::new(encoded.as_bytes())).is_err());
    }

    #[test]
    fn test_legacy_negative_one_certificate_count() {
        let encoded = "https://example.com/\nGET\n0\nHTTP/1.1 200 OK\n2\n\
                       Hoard-Sent-Millis: 1\nHoard-Received-Millis: 2\n\n\
                       TLS_AES_128_GCM_SHA256\n-1\n-1\nTLSv1.2\n";
        let entry = CacheEntry::read(Cursor::new(encoded.as_bytes())).unwrap();
        let handshake = entry.handshake.unwrap();
        assert!(handshake.peer_certificates.is_empty());
        assert!(handshake.local_certificates.is_empty());
        assert_eq!(TlsVersion::Tls12, handshake.tls_version);
    }

    #[test]
    fn test_missing_tls_version_defaults_to_ssl3() {
        let encoded = "https://example.com/\nGET\n0\nHTTP/1.1 200 OK\n2\n\
                       Hoard-Sent-Millis: 1\nHoard-Received-Millis: 2\n\n\
                       TLS_AES_128_GCM_SHA256\n0\n0\n";
        let entry = CacheEntry::read(Cursor::new(encoded.as_bytes())).unwrap();
        assert_eq!(TlsVersion::Ssl30, entry.handshake.unwrap().tls_version);
    }

    #[test]
    fn test_matches_same_request() {
        let entry = plain_entry();
        let mut headers = Headers::new();
        headers.add("Accept-Language", "fr");
        let request = Request::builder()
            .url("http://example.com/data")
            .headers(headers)
            .build()
            .unwrap();
        assert!(entry.matches(&request));
    }

    #[test]
    fn test_matches_rejects_different_vary_value() {
        let entry = plain_entry();
        let mut headers = Headers::new();
        headers.add("Accept-Language", "en");
        let request = Request::builder()
            .url("http://example.com/data")
            .headers(headers)
            .build()
            .unwrap();
        assert!(!entry.matches(&request));
    }

    #[test]
    fn test_matches_rejects_different_url_or_method() {
        let entry = plain_entry();
        let mut headers = Headers::new();
        headers.add("Accept-Language", "fr");
        let request = Request::builder()
            .url("http://example.com/other")
            .headers(headers.clone())
            .build()
            .unwrap();
        assert!(!entry.matches(&request));
        let request = Request::builder()
            .url("http://example.com/data")
            .method(Method::HEAD)
            .headers(headers)
            .build()
            .unwrap();
        assert!(!entry.matches(&request));
    }
}
