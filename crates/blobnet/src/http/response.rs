use std::collections::BTreeMap;

use crate::{Error, Result};

/// The response codes object stores answer with. Anything else is treated
/// as a protocol failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    Ok200,
    Created201,
    NoContent204,
    PartialContent206,
    BadRequest400,
    Unauthorized401,
    Forbidden403,
    NotFound404,
    Conflict409,
    LengthRequired411,
    RangeNotSatisfiable416,
    TooManyRequests429,
    InternalServerError500,
    ServiceUnavailable503,
    SlowDown503,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Ok200 => "200 OK",
            StatusCode::Created201 => "201 Created",
            StatusCode::NoContent204 => "204 No Content",
            StatusCode::PartialContent206 => "206 Partial Content",
            StatusCode::BadRequest400 => "400 Bad Request",
            StatusCode::Unauthorized401 => "401 Unauthorized",
            StatusCode::Forbidden403 => "403 Forbidden",
            StatusCode::NotFound404 => "404 Not Found",
            StatusCode::Conflict409 => "409 Conflict",
            StatusCode::LengthRequired411 => "411 Length Required",
            StatusCode::RangeNotSatisfiable416 => "416 Range Not Satisfiable",
            StatusCode::TooManyRequests429 => "429 Too Many Requests",
            StatusCode::InternalServerError500 => "500 Internal Server Error",
            StatusCode::SlowDown503 => "503 Slow Down",
            StatusCode::ServiceUnavailable503 => "503 Service Unavailable",
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            StatusCode::Ok200 => 200,
            StatusCode::Created201 => 201,
            StatusCode::NoContent204 => 204,
            StatusCode::PartialContent206 => 206,
            StatusCode::BadRequest400 => 400,
            StatusCode::Unauthorized401 => 401,
            StatusCode::Forbidden403 => 403,
            StatusCode::NotFound404 => 404,
            StatusCode::Conflict409 => 409,
            StatusCode::LengthRequired411 => 411,
            StatusCode::RangeNotSatisfiable416 => 416,
            StatusCode::TooManyRequests429 => 429,
            StatusCode::InternalServerError500 => 500,
            StatusCode::ServiceUnavailable503 | StatusCode::SlowDown503 => 503,
        }
    }

    /// 2xx answers.
    pub fn success(&self) -> bool {
        matches!(
            self,
            StatusCode::Ok200
                | StatusCode::Created201
                | StatusCode::NoContent204
                | StatusCode::PartialContent206
        )
    }

    pub fn without_content(&self) -> bool {
        matches!(self, StatusCode::NoContent204)
    }

    /// Throttling and overload answers; transient from the engine's view.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            StatusCode::TooManyRequests429
                | StatusCode::ServiceUnavailable503
                | StatusCode::SlowDown503
        )
    }

    /// Parse the status portion of a status line, e.g. "503 Slow Down".
    /// The reason phrase disambiguates the two 503 variants; for the other
    /// codes only the number matters.
    pub(crate) fn parse(status: &str) -> Result<StatusCode> {
        let code: u16 = status
            .split(' ')
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or(Error::HttpProtocol("malformed status line"))?;
        Ok(match code {
            200 => StatusCode::Ok200,
            201 => StatusCode::Created201,
            204 => StatusCode::NoContent204,
            206 => StatusCode::PartialContent206,
            400 => StatusCode::BadRequest400,
            401 => StatusCode::Unauthorized401,
            403 => StatusCode::Forbidden403,
            404 => StatusCode::NotFound404,
            409 => StatusCode::Conflict409,
            411 => StatusCode::LengthRequired411,
            416 => StatusCode::RangeNotSatisfiable416,
            429 => StatusCode::TooManyRequests429,
            500 => StatusCode::InternalServerError500,
            503 if status.trim_end().ends_with("Slow Down") => StatusCode::SlowDown503,
            503 => StatusCode::ServiceUnavailable503,
            _ => return Err(Error::HttpProtocol("unrecognized status code")),
        })
    }
}

/// A fully deserialized response preamble. The streaming receive path uses
/// the lighter `helper::ResponseInfo`; this type is for callers that need
/// the headers, e.g. to pull an ETag out of a part upload answer.
#[derive(Debug)]
pub struct HttpResponse {
    pub version: super::Version,
    pub status: StatusCode,
    pub headers: BTreeMap<String, String>,
}

impl HttpResponse {
    pub fn deserialize(data: &[u8]) -> Result<HttpResponse> {
        let preamble = std::str::from_utf8(data)
            .map_err(|_| Error::HttpProtocol("response preamble is not valid UTF-8"))?;
        let mut lines = preamble.split("\r\n");

        let status_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or(Error::HttpProtocol("missing status line"))?;
        let (version, rest) = super::Version::parse_prefix(status_line)?;
        let status = StatusCode::parse(rest.trim_start())?;

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

        Ok(HttpResponse {
            version,
            status,
            headers,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deserialize_headers() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\nETag: \"abc\"\r\n\r\nHello World!";
        let response = HttpResponse::deserialize(raw).unwrap();
        assert_eq!(response.status, StatusCode::Ok200);
        assert_eq!(response.version, crate::http::Version::Http1_1);
        assert_eq!(response.header("content-length"), Some("12"));
        assert_eq!(response.header("etag"), Some("\"abc\""));
        assert_eq!(response.header("x-missing"), None);
    }

    #[test]
    fn slow_down_and_service_unavailable_differ() {
        let slow = HttpResponse::deserialize(b"HTTP/1.1 503 Slow Down\r\n\r\n").unwrap();
        assert_eq!(slow.status, StatusCode::SlowDown503);
        let unavailable =
            HttpResponse::deserialize(b"HTTP/1.1 503 Service Unavailable\r\n\r\n").unwrap();
        assert_eq!(unavailable.status, StatusCode::ServiceUnavailable503);
        assert!(slow.status.retryable());
        assert!(unavailable.status.retryable());
        assert_eq!(slow.status.code(), 503);
    }

    #[test]
    fn unknown_status_is_protocol_failure() {
        assert!(HttpResponse::deserialize(b"HTTP/1.1 302 Found\r\n\r\n").is_err());
        assert!(HttpResponse::deserialize(b"SPDY/3 200 OK\r\n\r\n").is_err());
    }
}
