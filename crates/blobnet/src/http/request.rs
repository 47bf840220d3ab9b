use std::collections::BTreeMap;

use crate::buffer::ByteBuffer;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }

    fn parse(s: &str) -> Result<Method> {
        Ok(match s {
            "GET" => Method::Get,
            "PUT" => Method::Put,
            "POST" => Method::Post,
            "DELETE" => Method::Delete,
            _ => return Err(Error::HttpProtocol("unsupported request method")),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Version {
    Http1_0,
    Http1_1,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http1_0 => "HTTP/1.0",
            Version::Http1_1 => "HTTP/1.1",
        }
    }

    /// Split a leading version token off `line`.
    pub(crate) fn parse_prefix(line: &str) -> Result<(Version, &str)> {
        for version in [Version::Http1_1, Version::Http1_0] {
            if let Some(rest) = line.strip_prefix(version.as_str()) {
                return Ok((version, rest));
            }
        }
        Err(Error::HttpProtocol("not an HTTP/1.0 or HTTP/1.1 preamble"))
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
pub fn encode_url_parameters(raw: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push(HEX[(byte >> 4) as usize] as char);
                out.push(HEX[(byte & 15) as usize] as char);
            }
        }
    }
    out
}

fn decode_url_parameters(encoded: &str) -> Result<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or(Error::HttpProtocol("truncated percent escape"))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| Error::HttpProtocol("percent escape is not UTF-8"))
}

/// A request preamble in its canonical form: queries and headers are kept
/// ordered maps, so serialization is deterministic and signing sees the
/// exact same ordering the wire does.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Option<Method>,
    pub version: Option<Version>,
    /// RFC 3986 conform; leading slash included.
    pub path: String,
    /// Keys and values stored decoded; encoding happens at serialization.
    pub queries: BTreeMap<String, String>,
    /// Without leading or trailing whitespace.
    pub headers: BTreeMap<String, String>,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        HttpRequest {
            method: Some(method),
            version: Some(Version::Http1_1),
            path: path.into(),
            queries: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }

    /// The encoded query string, `k=v` pairs joined by `&`.
    pub fn query_string(&self) -> String {
        let mut out = String::new();
        for (i, (key, value)) in self.queries.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(&encode_url_parameters(key));
            out.push('=');
            out.push_str(&encode_url_parameters(value));
        }
        out
    }

    /// Serialize into wire bytes; the request target carries a query
    /// string only when queries exist.
    pub fn serialize(&self) -> Result<ByteBuffer> {
        let method = self
            .method
            .ok_or(Error::HttpProtocol("request without method"))?;
        let version = self
            .version
            .ok_or(Error::HttpProtocol("request without version"))?;
        let mut header = String::with_capacity(256);
        header.push_str(method.as_str());
        header.push(' ');
        header.push_str(if self.path.is_empty() { "/" } else { &self.path });
        if !self.queries.is_empty() {
            header.push('?');
            header.push_str(&self.query_string());
        }
        header.push(' ');
        header.push_str(version.as_str());
        header.push_str("\r\n");
        for (key, value) in &self.headers {
            header.push_str(key);
            header.push_str(": ");
            header.push_str(value);
            header.push_str("\r\n");
        }
        header.push_str("\r\n");
        Ok(ByteBuffer::from_slice(header.as_bytes()))
    }

    pub fn deserialize(data: &[u8]) -> Result<HttpRequest> {
        let preamble = std::str::from_utf8(data)
            .map_err(|_| Error::HttpProtocol("request preamble is not valid UTF-8"))?;
        let mut lines = preamble.split("\r\n");

        let request_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or(Error::HttpProtocol("missing request line"))?;
        let mut parts = request_line.splitn(3, ' ');
        let method = Method::parse(parts.next().unwrap_or_default())?;
        let target = parts
            .next()
            .ok_or(Error::HttpProtocol("request line without target"))?;
        let version_str = parts
            .next()
            .ok_or(Error::HttpProtocol("request line without version"))?;
        let (version, rest) = Version::parse_prefix(version_str)?;
        if !rest.is_empty() {
            return Err(Error::HttpProtocol("trailing bytes after version"));
        }

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        let mut queries = BTreeMap::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            queries.insert(decode_url_parameters(key)?, decode_url_parameters(value)?);
        }

        let mut headers = BTreeMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or(Error::HttpProtocol("header line without separator"))?;
            headers.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(HttpRequest {
            method: Some(method),
            version: Some(version),
            path: path.to_string(),
            queries,
            headers,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> HttpRequest {
        let mut request = HttpRequest::new(Method::Put, "/bucket/key with space.txt");
        request.queries.insert("partNumber".into(), "2".into());
        request.queries.insert("uploadId".into(), "a/b+c=".into());
        request.headers.insert("Host".into(), "example.com".into());
        request
            .headers
            .insert("Content-Length".into(), "11".into());
        request
    }

    #[test]
    fn serialize_is_canonical() {
        let bytes = sample().serialize().unwrap();
        let text = std::str::from_utf8(bytes.data()).unwrap();
        assert_eq!(
            text,
            "PUT /bucket/key with space.txt?partNumber=2&uploadId=a%2Fb%2Bc%3D HTTP/1.1\r\n\
             Content-Length: 11\r\n\
             Host: example.com\r\n\
             \r\n"
        );
    }

    #[test]
    fn round_trip() {
        let request = sample();
        let bytes = request.serialize().unwrap();
        let decoded = HttpRequest::deserialize(bytes.data()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn empty_query_omits_question_mark() {
        let request = HttpRequest::new(Method::Get, "/a/b/c.d");
        let bytes = request.serialize().unwrap();
        assert!(std::str::from_utf8(bytes.data())
            .unwrap()
            .starts_with("GET /a/b/c.d HTTP/1.1\r\n"));
    }

    #[test]
    fn url_parameter_encoding() {
        assert_eq!(encode_url_parameters("a-b_c.d~e"), "a-b_c.d~e");
        assert_eq!(encode_url_parameters("a/b c"), "a%2Fb%20c");
        assert_eq!(decode_url_parameters("a%2Fb%20c").unwrap(), "a/b c");
    }
}
