use blobnet::buffer::ByteBuffer;
use blobnet::config::Config;
use blobnet::http::{HttpRequest, Method};
use blobnet::worker::WorkerHandle;
use blobnet::{Provider, Result};

use crate::aws::build_amz_timestamp;
use crate::gcp_signer::{GcpSigner, StringToSign};
use crate::instances::{fetch_metadata, gcp_instances, Instance};
use crate::RemoteInfo;

#[derive(Clone, Debug)]
pub struct GcpSettings {
    pub bucket: String,
    pub region: String,
    pub port: u16,
}

struct GcpSecret {
    /// HMAC interoperability access id.
    access_id: String,
    secret: String,
}

/// GCP Cloud Storage over the XML interoperability API, signed with HMAC
/// keys in the GOOG4 signed-URL form.
pub struct Gcp {
    settings: GcpSettings,
    https: bool,
    secret: GcpSecret,
}

impl Gcp {
    pub fn new(info: RemoteInfo, https: bool, key_id: &str, secret: &str) -> Self {
        let port = if info.port != 80 {
            info.port
        } else if https {
            443
        } else {
            80
        };
        Gcp {
            settings: GcpSettings {
                bucket: info.bucket,
                region: info.region,
                port,
            },
            https,
            secret: GcpSecret {
                access_id: key_id.to_string(),
                secret: secret.replace('\n', ""),
            },
        }
    }

    pub(crate) fn instance_address() -> &'static str {
        "169.254.169.254"
    }

    pub(crate) fn instance_port() -> u16 {
        80
    }

    /// GCE metadata request; requires the Metadata-Flavor marker.
    pub(crate) fn download_instance_info(info: &str) -> ByteBuffer {
        let header = format!(
            "GET /computeMetadata/v1/instance/{info} HTTP/1.1\r\nHost: {}\r\nMetadata-Flavor: Google\r\n\r\n",
            Self::instance_address()
        );
        ByteBuffer::from_slice(header.as_bytes())
    }

    pub fn instance_details(&self, handle: &mut WorkerHandle<'_>) -> Result<Instance> {
        let msg = fetch_metadata(
            handle,
            Self::download_instance_info("machine-type"),
            Self::instance_address(),
            Self::instance_port(),
        )?;
        let body = String::from_utf8_lossy(msg.result.body()).to_string();
        // The metadata answer is "projects/<id>/machineTypes/<type>".
        let kind = body
            .rsplit("machineTypes/")
            .next()
            .unwrap_or(&body)
            .trim()
            .to_string();
        Ok(gcp_instances()
            .iter()
            .find(|instance| instance.kind == kind)
            .cloned()
            .unwrap_or(Instance {
                kind,
                memory_gib: 0.0,
                vcpu: 0,
                network_mbits: 0,
            }))
    }

    /// The region, derived from the zone by dropping the "-a" suffix.
    pub fn get_instance_region(handle: &mut WorkerHandle<'_>) -> Result<String> {
        let msg = fetch_metadata(
            handle,
            Self::download_instance_info("zone"),
            Self::instance_address(),
            Self::instance_port(),
        )?;
        let body = String::from_utf8_lossy(msg.result.body()).to_string();
        let zone = body.rsplit("zones/").next().unwrap_or(&body).trim();
        Ok(zone[..zone.len().saturating_sub(2)].to_string())
    }

    pub fn config(&self, handle: &mut WorkerHandle<'_>) -> Config {
        match self.instance_details(handle) {
            Ok(instance) if instance.network_mbits > 0 => Config::new(instance.network_mbits),
            _ => Config::default(),
        }
    }

    fn sign_and_build(&self, request: &mut HttpRequest) -> Result<ByteBuffer> {
        let scope = StringToSign {
            region: &self.settings.region,
            service: "storage",
        };
        let target = GcpSigner::create_signed_request(
            &self.secret.access_id,
            &self.secret.secret,
            request,
            &scope,
        )?;
        let mut header = String::with_capacity(512);
        header.push_str(request.method.unwrap().as_str());
        header.push(' ');
        header.push_str(&target);
        header.push_str(" HTTP/1.1\r\n");
        for (key, value) in &request.headers {
            header.push_str(key);
            header.push_str(": ");
            header.push_str(value);
            header.push_str("\r\n");
        }
        header.push_str("\r\n");
        Ok(ByteBuffer::from_slice(header.as_bytes()))
    }

    fn put_request_generic(
        &self,
        file_path: &str,
        object: &[u8],
        part: u16,
        upload_id: &str,
    ) -> Result<ByteBuffer> {
        let mut request = HttpRequest::new(Method::Put, format!("/{file_path}"));
        if part > 0 {
            request
                .queries
                .insert("partNumber".into(), part.to_string());
            request.queries.insert("uploadId".into(), upload_id.into());
        }
        let date = build_amz_timestamp();
        request.queries.insert("X-Goog-Date".into(), date.clone());
        request.headers.insert("Host".into(), self.address());
        request.headers.insert("Date".into(), date);
        request
            .headers
            .insert("Content-Length".into(), object.len().to_string());
        self.sign_and_build(&mut request)
    }

    fn delete_request_generic(&self, file_path: &str, upload_id: &str) -> Result<ByteBuffer> {
        let mut request = HttpRequest::new(Method::Delete, format!("/{file_path}"));
        if !upload_id.is_empty() {
            request.queries.insert("uploadId".into(), upload_id.into());
        }
        request
            .queries
            .insert("X-Goog-Date".into(), build_amz_timestamp());
        request.headers.insert("Host".into(), self.address());
        self.sign_and_build(&mut request)
    }
}

impl Provider for Gcp {
    fn get_request(&self, path: &str, range: Option<(u64, u64)>) -> Result<ByteBuffer> {
        let mut request = HttpRequest::new(Method::Get, format!("/{path}"));
        request
            .queries
            .insert("X-Goog-Date".into(), build_amz_timestamp());
        request.headers.insert("Host".into(), self.address());
        if let Some((begin, end)) = range {
            if begin != end {
                request
                    .headers
                    .insert("Range".into(), format!("bytes={begin}-{end}"));
            }
        }
        self.sign_and_build(&mut request)
    }

    fn put_request(&self, path: &str, object: &[u8]) -> Result<ByteBuffer> {
        self.put_request_generic(path, object, 0, "")
    }

    fn delete_request(&self, path: &str) -> Result<ByteBuffer> {
        self.delete_request_generic(path, "")
    }

    fn create_multipart_request(&self, path: &str) -> Result<ByteBuffer> {
        let mut request = HttpRequest::new(Method::Post, format!("/{path}"));
        request.queries.insert("uploads".into(), String::new());
        request
            .queries
            .insert("X-Goog-Date".into(), build_amz_timestamp());
        request.headers.insert("Host".into(), self.address());
        self.sign_and_build(&mut request)
    }

    fn put_part_request(
        &self,
        path: &str,
        part: u16,
        upload_id: &str,
        object: &[u8],
    ) -> Result<ByteBuffer> {
        self.put_request_generic(path, object, part, upload_id)
    }

    fn complete_multipart_request(
        &self,
        path: &str,
        upload_id: &str,
        etags: &[String],
    ) -> Result<ByteBuffer> {
        let mut content = String::from("<CompleteMultipartUpload>\n");
        for (at, etag) in etags.iter().enumerate() {
            content.push_str("<Part>\n<PartNumber>");
            content.push_str(&(at + 1).to_string());
            content.push_str("</PartNumber>\n<ETag>\"");
            content.push_str(etag);
            content.push_str("\"</ETag>\n</Part>\n");
        }
        content.push_str("</CompleteMultipartUpload>\n");

        let mut request = HttpRequest::new(Method::Post, format!("/{path}"));
        request.queries.insert("uploadId".into(), upload_id.into());
        request
            .queries
            .insert("X-Goog-Date".into(), build_amz_timestamp());
        request.headers.insert("Host".into(), self.address());
        request
            .headers
            .insert("Content-Length".into(), content.len().to_string());
        let mut buffer = self.sign_and_build(&mut request)?;
        buffer.extend_from_slice(content.as_bytes())?;
        Ok(buffer)
    }

    fn abort_multipart_request(&self, path: &str, upload_id: &str) -> Result<ByteBuffer> {
        self.delete_request_generic(path, upload_id)
    }

    fn address(&self) -> String {
        format!("{}.storage.googleapis.com", self.settings.bucket)
    }

    fn port(&self) -> u16 {
        self.settings.port
    }

    fn tls(&self) -> bool {
        self.https
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{remote_info, set_test_environment};
    use serial_test::serial;

    fn as_str(buffer: &ByteBuffer) -> &str {
        std::str::from_utf8(buffer.data()).unwrap()
    }

    #[test]
    fn metadata_request_bytes() {
        assert_eq!(
            as_str(&Gcp::download_instance_info("zone")),
            "GET /computeMetadata/v1/instance/zone HTTP/1.1\r\nHost: 169.254.169.254\r\nMetadata-Flavor: Google\r\n\r\n"
        );
    }

    #[test]
    #[serial]
    fn get_request_is_query_signed() {
        set_test_environment(true);
        let gcp = Gcp::new(
            remote_info("gcp://bucket:europe-west1/").unwrap(),
            false,
            "interop-id",
            "interop-key",
        );
        let dv = gcp.get_request("a/b/c.d", None).unwrap();
        let text = as_str(&dv);
        assert!(text.starts_with("GET /a/b/c.d?X-Goog-Algorithm=GOOG4-HMAC-SHA256"));
        assert!(text.contains("X-Goog-Date=21000101T000000Z"));
        assert!(text.contains("&x-goog-signature="));
        assert!(text.contains("\r\nHost: bucket.storage.googleapis.com\r\n"));
        assert!(!text.contains("Authorization"), "signature rides the query");
        set_test_environment(false);
    }

    #[test]
    #[serial]
    fn put_request_carries_length_and_date() {
        set_test_environment(true);
        let gcp = Gcp::new(
            remote_info("gcp://bucket:europe-west1/").unwrap(),
            false,
            "id",
            "key",
        );
        let dv = gcp.put_request("x.bin", &[0u8; 32]).unwrap();
        let text = as_str(&dv);
        assert!(text.contains("\r\nContent-Length: 32\r\n"));
        assert!(text.contains("\r\nDate: 21000101T000000Z\r\n"));
        set_test_environment(false);
    }

    #[test]
    #[serial]
    fn range_header_for_partial_reads() {
        set_test_environment(true);
        let gcp = Gcp::new(remote_info("gcp://b:r/").unwrap(), false, "id", "key");
        let dv = gcp.get_request("x", Some((0, 1024))).unwrap();
        assert!(as_str(&dv).contains("\r\nRange: bytes=0-1024\r\n"));
        let dv = gcp.get_request("x", Some((5, 5))).unwrap();
        assert!(!as_str(&dv).contains("Range:"));
        set_test_environment(false);
    }
}
