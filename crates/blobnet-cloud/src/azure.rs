use blobnet::buffer::ByteBuffer;
use blobnet::config::Config;
use blobnet::http::{HttpRequest, Method};
use blobnet::worker::WorkerHandle;
use blobnet::{Provider, Result};
use chrono::Utc;

use crate::azure_signer::AzureSigner;
use crate::instances::{azure_instances, fetch_metadata, Instance};
use crate::RemoteInfo;

pub(crate) const FAKE_XMS_TIMESTAMP: &str = "Fri, 01 Jan 2100 00:00:00 GMT";

/// The x-ms-date timestamp (RFC 1123) of the current instant, or the
/// fixed test stamp.
fn build_xms_timestamp() -> String {
    if crate::test_environment() {
        FAKE_XMS_TIMESTAMP.to_string()
    } else {
        Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
    }
}

#[derive(Clone, Debug)]
pub struct AzureSettings {
    pub container: String,
    pub port: u16,
}

struct AzureSecret {
    account_name: String,
    /// Base64 account key, newlines stripped.
    account_key: String,
}

/// Azure Blob Storage with SharedKey request signing.
pub struct Azure {
    settings: AzureSettings,
    https: bool,
    secret: AzureSecret,
}

impl Azure {
    /// `key_id` is the storage account name, `key` its base64 account key.
    pub fn new(info: RemoteInfo, https: bool, key_id: &str, key: &str) -> Self {
        let port = if info.port != 80 {
            info.port
        } else if https {
            443
        } else {
            80
        };
        Azure {
            settings: AzureSettings {
                container: info.bucket,
                port,
            },
            https,
            secret: AzureSecret {
                account_name: key_id.to_string(),
                account_key: key.replace('\n', ""),
            },
        }
    }

    pub(crate) fn instance_address() -> &'static str {
        "169.254.169.254"
    }

    pub(crate) fn instance_port() -> u16 {
        80
    }

    /// Azure IMDS request; requires the Metadata marker header.
    pub(crate) fn download_instance_info() -> ByteBuffer {
        let header = format!(
            "GET /metadata/instance?api-version=2021-02-01 HTTP/1.1\r\nHost: {}\r\nMetadata: true\r\n\r\n",
            Self::instance_address()
        );
        ByteBuffer::from_slice(header.as_bytes())
    }

    fn json_field(body: &str, name: &str) -> Option<String> {
        let needle = format!("\"{name}\" : \"");
        let start = body.find(&needle)? + needle.len();
        let end = body[start..].find('"')? + start;
        Some(body[start..end].to_string())
    }

    /// VM shape from the metadata service, matched against the table.
    pub fn instance_details(&self, handle: &mut WorkerHandle<'_>) -> Result<Instance> {
        let msg = fetch_metadata(
            handle,
            Self::download_instance_info(),
            Self::instance_address(),
            Self::instance_port(),
        )?;
        let body = String::from_utf8_lossy(msg.result.body()).to_string();
        let kind = Self::json_field(&body, "vmSize").unwrap_or(body);
        Ok(azure_instances()
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

    /// The region ("location") the VM runs in.
    pub fn get_region(handle: &mut WorkerHandle<'_>) -> Result<String> {
        let msg = fetch_metadata(
            handle,
            Self::download_instance_info(),
            Self::instance_address(),
            Self::instance_port(),
        )?;
        let body = String::from_utf8_lossy(msg.result.body()).to_string();
        Self::json_field(&body, "location")
            .ok_or_else(|| crate::provider_err("metadata answer without location"))
    }

    pub fn config(&self, handle: &mut WorkerHandle<'_>) -> Config {
        match self.instance_details(handle) {
            Ok(instance) if instance.network_mbits > 0 => Config::new(instance.network_mbits),
            _ => Config::default(),
        }
    }

    /// Sign and serialize; the request target carries no query marker
    /// unless queries exist.
    fn build_request(&self, request: &mut HttpRequest) -> Result<ByteBuffer> {
        let target = AzureSigner::create_signed_request(
            &self.secret.account_name,
            &self.secret.account_key,
            request,
        )?;
        let mut header = String::with_capacity(256);
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
}

impl Provider for Azure {
    fn get_request(&self, path: &str, range: Option<(u64, u64)>) -> Result<ByteBuffer> {
        let mut request = HttpRequest::new(
            Method::Get,
            format!("/{}/{path}", self.settings.container),
        );
        request
            .headers
            .insert("x-ms-date".into(), build_xms_timestamp());
        request.headers.insert("Host".into(), self.address());
        if let Some((begin, end)) = range {
            if begin != end {
                request
                    .headers
                    .insert("Range".into(), format!("bytes={begin}-{end}"));
            }
        }
        self.build_request(&mut request)
    }

    fn put_request(&self, path: &str, object: &[u8]) -> Result<ByteBuffer> {
        let mut request = HttpRequest::new(
            Method::Put,
            format!("/{}/{path}", self.settings.container),
        );
        request
            .headers
            .insert("x-ms-date".into(), build_xms_timestamp());
        request
            .headers
            .insert("x-ms-blob-type".into(), "BlockBlob".into());
        request.headers.insert("Host".into(), self.address());
        request
            .headers
            .insert("Content-Length".into(), object.len().to_string());
        self.build_request(&mut request)
    }

    fn delete_request(&self, path: &str) -> Result<ByteBuffer> {
        let mut request = HttpRequest::new(
            Method::Delete,
            format!("/{}/{path}", self.settings.container),
        );
        request
            .headers
            .insert("x-ms-date".into(), build_xms_timestamp());
        request.headers.insert("Host".into(), self.address());
        self.build_request(&mut request)
    }

    fn address(&self) -> String {
        format!("{}.blob.core.windows.net", self.secret.account_name)
    }

    fn port(&self) -> u16 {
        self.settings.port
    }

    fn tls(&self) -> bool {
        self.https
    }
}
