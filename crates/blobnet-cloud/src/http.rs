use blobnet::buffer::ByteBuffer;
use blobnet::http::{HttpRequest, Method};
use blobnet::{Provider, Result};

use crate::RemoteInfo;

/// A plain, unsigned HTTP endpoint: requests are transmitted verbatim
/// without any authorization. Also carries the metadata-service exchanges
/// of the signed providers.
pub struct Http {
    hostname: String,
    port: u16,
}

impl Http {
    pub fn new(info: RemoteInfo) -> Self {
        Http {
            hostname: info.endpoint,
            port: info.port,
        }
    }

    pub fn with_endpoint(hostname: impl Into<String>, port: u16) -> Self {
        Http {
            hostname: hostname.into(),
            port,
        }
    }

    fn build(&self, request: &HttpRequest) -> Result<ByteBuffer> {
        request.serialize()
    }
}

impl Provider for Http {
    fn get_request(&self, path: &str, range: Option<(u64, u64)>) -> Result<ByteBuffer> {
        let mut request = HttpRequest::new(Method::Get, format!("/{path}"));
        request.headers.insert("Host".into(), self.address());
        if let Some((begin, end)) = range {
            if begin != end {
                request
                    .headers
                    .insert("Range".into(), format!("bytes={begin}-{end}"));
            }
        }
        self.build(&request)
    }

    fn put_request(&self, path: &str, object: &[u8]) -> Result<ByteBuffer> {
        let mut request = HttpRequest::new(Method::Put, format!("/{path}"));
        request.headers.insert("Host".into(), self.address());
        request
            .headers
            .insert("Content-Length".into(), object.len().to_string());
        self.build(&request)
    }

    fn delete_request(&self, path: &str) -> Result<ByteBuffer> {
        let mut request = HttpRequest::new(Method::Delete, format!("/{path}"));
        request.headers.insert("Host".into(), self.address());
        self.build(&request)
    }

    fn address(&self) -> String {
        self.hostname.clone()
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn tls(&self) -> bool {
        false
    }
}
