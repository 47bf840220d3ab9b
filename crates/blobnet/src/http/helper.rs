use memchr::memmem;

use super::response::StatusCode;
use crate::{Error, Result};

/// How the end of the response body is determined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    ContentLength(u64),
    Chunked,
}

/// What one pass over the preamble yields: enough to know when the message
/// ends and which status it carries. Parsed once, on the first receive that
/// contains the full header.
#[derive(Clone, Debug)]
pub struct ResponseInfo {
    pub status: StatusCode,
    pub header_length: usize,
    pub encoding: Encoding,
}

impl ResponseInfo {
    /// Body length when known up front; used to presize the receive buffer.
    pub fn content_length(&self) -> u64 {
        match self.encoding {
            Encoding::ContentLength(n) => n,
            Encoding::Chunked => 0,
        }
    }
}

/// Case-insensitive scan for `name:` at line starts within the preamble;
/// returns the value with surrounding whitespace stripped.
fn header_value<'a>(preamble: &'a [u8], name: &str) -> Option<&'a [u8]> {
    let mut at = 0;
    while at < preamble.len() {
        let end = memmem::find(&preamble[at..], b"\r\n").map(|p| at + p)?;
        let line = &preamble[at..end];
        if let Some(colon) = memchr::memchr(b':', line) {
            if line[..colon].eq_ignore_ascii_case(name.as_bytes()) {
                let mut value = &line[colon + 1..];
                while let [b' ' | b'\t', rest @ ..] = value {
                    value = rest;
                }
                while let [rest @ .., b' ' | b'\t'] = value {
                    value = rest;
                }
                return Some(value);
            }
        }
        at = end + 2;
    }
    None
}

/// Parse a response preamble. Returns None while the header terminator has
/// not arrived yet; a malformed preamble is a protocol failure.
pub fn detect(data: &[u8]) -> Result<Option<ResponseInfo>> {
    let Some(header_end) = memmem::find(data, b"\r\n\r\n") else {
        return Ok(None);
    };
    let preamble = &data[..header_end + 2];
    let header_length = header_end + 4;

    let line_end = memmem::find(preamble, b"\r\n").unwrap_or(preamble.len());
    let status_line = std::str::from_utf8(&preamble[..line_end])
        .map_err(|_| Error::HttpProtocol("status line is not valid UTF-8"))?;
    let (_, rest) = super::Version::parse_prefix(status_line)?;
    let status = StatusCode::parse(rest.trim_start())?;

    let encoding = if header_value(preamble, "transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case(b"chunked"))
    {
        Encoding::Chunked
    } else if let Some(value) = header_value(preamble, "content-length") {
        let length = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .ok_or(Error::HttpProtocol("unparsable Content-Length"))?;
        Encoding::ContentLength(length)
    } else if status.without_content() {
        Encoding::ContentLength(0)
    } else {
        return Err(Error::HttpProtocol(
            "neither Content-Length nor chunked transfer encoding",
        ));
    };

    Ok(Some(ResponseInfo {
        status,
        header_length,
        encoding,
    }))
}

/// Whether `length` received bytes complete the message. Parses the
/// preamble into `info` on first success; `info` is cleared again when the
/// preamble turns out to be malformed so a retry restarts cleanly.
pub fn finished(data: &[u8], length: usize, info: &mut Option<ResponseInfo>) -> Result<bool> {
    if info.is_none() {
        match detect(&data[..length]) {
            Ok(parsed) => *info = parsed,
            Err(err) => {
                *info = None;
                return Err(err);
            }
        }
    }
    let Some(info) = info.as_ref() else {
        return Ok(false);
    };
    match info.encoding {
        Encoding::ContentLength(body) => Ok(length as u64 >= info.header_length as u64 + body),
        Encoding::Chunked => Ok(data[..length].ends_with(b"0\r\n\r\n")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn content_length_completion() {
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut info = None;
        assert!(!finished(response, 10, &mut info).unwrap());
        assert!(info.is_some(), "preamble parsed once available");
        assert!(finished(response, response.len(), &mut info).unwrap());

        let info = info.unwrap();
        assert_eq!(info.status, StatusCode::Ok200);
        assert_eq!(info.encoding, Encoding::ContentLength(5));
        assert_eq!(info.header_length, response.len() - 5);
    }

    #[test]
    fn detect_waits_for_header_end() {
        assert!(detect(b"HTTP/1.1 200 OK\r\nContent-Le").unwrap().is_none());
    }

    #[test]
    fn header_names_are_case_insensitive_and_whitespace_tolerant() {
        let response = b"HTTP/1.1 404 Not Found\r\ncOnTeNt-LeNgTh:   7  \r\n\r\nmissing";
        let info = detect(response).unwrap().unwrap();
        assert_eq!(info.status, StatusCode::NotFound404);
        assert_eq!(info.encoding, Encoding::ContentLength(7));
    }

    #[test]
    fn chunked_completion() {
        let head = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n";
        let mut info = None;
        assert!(!finished(head, head.len(), &mut info).unwrap());
        assert_eq!(info.as_ref().unwrap().encoding, Encoding::Chunked);

        let full = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        assert!(finished(full, full.len(), &mut info).unwrap());
    }

    #[test]
    fn no_content_needs_no_length_header() {
        let response = b"HTTP/1.1 204 No Content\r\nDate: now\r\n\r\n";
        let info = detect(response).unwrap().unwrap();
        assert_eq!(info.encoding, Encoding::ContentLength(0));
        let mut cell = Some(info);
        assert!(finished(response, response.len(), &mut cell).unwrap());
    }

    #[test]
    fn malformed_preamble_is_a_protocol_failure() {
        let mut info = None;
        let gopher = b"GOPHER nonsense\r\n\r\n";
        assert!(finished(gopher, gopher.len(), &mut info).is_err());
        assert!(info.is_none(), "cleared for a clean retry");

        let no_frame = b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\nbody";
        assert!(detect(no_frame).is_err());
    }
}
