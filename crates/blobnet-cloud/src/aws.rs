use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use blobnet::buffer::ByteBuffer;
use blobnet::config::Config;
use blobnet::http::{HttpRequest, Method};
use blobnet::worker::WorkerHandle;
use blobnet::{Provider, Result};
use chrono::Utc;

use crate::aws_signer::AwsSigner;
use crate::instances::{aws_instances, fetch_metadata, Instance};
use crate::{provider_err, RemoteInfo};

pub(crate) const FAKE_AMZ_TIMESTAMP: &str = "21000101T000000Z";
pub(crate) const FAKE_IAM_TIMESTAMP: &str = "2100-01-01T00:00:00Z";

/// The AMZ timestamp of the current instant (or the fixed test stamp).
pub(crate) fn build_amz_timestamp() -> String {
    if crate::test_environment() {
        FAKE_AMZ_TIMESTAMP.to_string()
    } else {
        Utc::now().format("%Y%m%dT%H%M%SZ").to_string()
    }
}

fn convert_iam_timestamp(timestamp: &str) -> i64 {
    chrono::NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%SZ")
        .map(|t| t.and_utc().timestamp())
        .unwrap_or(0)
}

#[derive(Clone, Debug)]
pub struct AwsSettings {
    pub bucket: String,
    pub region: String,
    pub endpoint: String,
    pub port: u16,
    /// S3 Express One Zone bucket (`…--x-s3`), which signs with a session
    /// token instead of the requester-pays header.
    pub zonal: bool,
}

/// An access credential: static keys, an IAM role credential from the
/// instance metadata service, or a zonal session token.
#[derive(Clone, Debug, Default)]
pub struct Secret {
    pub iam_user: String,
    pub key_id: String,
    pub secret: String,
    pub token: String,
    /// Unix seconds; refreshed ahead of expiry.
    pub expiration: i64,
}

/// AWS S3 (and its interface-compatible dialects). Requests are signed
/// with Signature V4; credentials come from construction or the instance
/// metadata flow.
pub struct Aws {
    settings: AwsSettings,
    https: bool,
    /// Dialect host (IBM COS, Oracle) replacing the amazonaws.com scheme.
    host_override: Option<String>,
    secret: RwLock<Option<Arc<Secret>>>,
    session_secret: RwLock<Option<Arc<Secret>>>,
    multipart_upload_size: AtomicU64,
}

impl Aws {
    pub fn new(info: RemoteInfo, https: bool) -> Self {
        let zonal = info.bucket.ends_with("--x-s3");
        let port = if info.port != 80 {
            info.port
        } else if https {
            443
        } else {
            80
        };
        Aws {
            settings: AwsSettings {
                bucket: info.bucket,
                region: info.region,
                endpoint: info.endpoint,
                port,
                zonal,
            },
            https,
            host_override: None,
            secret: RwLock::new(None),
            session_secret: RwLock::new(None),
            multipart_upload_size: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_host_override(&mut self, host: String) {
        self.host_override = Some(host);
    }

    /// Provider with caller-supplied keys; an empty key id leaves the
    /// credential to the metadata refresh flow.
    pub fn with_keys(info: RemoteInfo, https: bool, key_id: &str, secret: &str) -> Self {
        let aws = Self::new(info, https);
        if !key_id.is_empty() {
            *aws.secret.write().unwrap() = Some(Arc::new(Secret {
                key_id: key_id.to_string(),
                secret: secret.to_string(),
                expiration: i64::MAX,
                ..Secret::default()
            }));
        }
        aws
    }

    pub fn settings(&self) -> &AwsSettings {
        &self.settings
    }

    /// Split threshold for multipart uploads; 0 disables splitting.
    pub fn set_multipart_upload_size(&self, size: u64) {
        self.multipart_upload_size.store(size, Ordering::Relaxed);
    }

    pub(crate) fn secret(&self) -> Option<Arc<Secret>> {
        self.secret.read().unwrap().clone()
    }

    fn session(&self) -> Option<Arc<Secret>> {
        self.session_secret.read().unwrap().clone()
    }

    /// Whether the keys survive at least `offset` more seconds.
    fn valid_keys(&self, offset: i64) -> bool {
        match self.secret() {
            Some(secret) => {
                !(!secret.token.is_empty() && secret.expiration - offset < Utc::now().timestamp()
                    || secret.secret.is_empty())
            }
            None => false,
        }
    }

    fn valid_session(&self, offset: i64) -> bool {
        match self.session() {
            Some(session) => {
                !(!session.token.is_empty()
                    && session.expiration - offset < Utc::now().timestamp()
                    || session.secret.is_empty())
            }
            None => false,
        }
    }

    fn check_keys(&self) -> Result<()> {
        if !self.valid_keys(0) || (self.settings.zonal && !self.valid_session(0)) {
            return Err(provider_err("aws credentials missing or expired"));
        }
        Ok(())
    }

    pub(crate) fn instance_address() -> &'static str {
        "169.254.169.254"
    }

    pub(crate) fn instance_port() -> u16 {
        80
    }

    /// Metadata request for `info`, e.g. "instance-type".
    pub(crate) fn download_instance_info(info: &str) -> ByteBuffer {
        let header = format!(
            "GET /latest/meta-data/{info} HTTP/1.1\r\nHost: {}\r\n\r\n",
            Self::instance_address()
        );
        ByteBuffer::from_slice(header.as_bytes())
    }

    /// Request listing the instance's IAM roles.
    fn download_iam_user() -> ByteBuffer {
        let header = format!(
            "GET /latest/meta-data/iam/security-credentials HTTP/1.1\r\nHost: {}\r\n\r\n",
            Self::instance_address()
        );
        ByteBuffer::from_slice(header.as_bytes())
    }

    /// Request for the role credential; `content` is the role listing.
    fn download_secret(content: &str) -> Option<(ByteBuffer, String)> {
        let user = content.lines().next()?.trim();
        if user.is_empty() {
            return None;
        }
        let header = format!(
            "GET /latest/meta-data/iam/security-credentials/{user} HTTP/1.1\r\nHost: {}\r\n\r\n",
            Self::instance_address()
        );
        Some((ByteBuffer::from_slice(header.as_bytes()), user.to_string()))
    }

    /// Parse the metadata credential JSON and install it.
    fn update_secret(&self, content: &str, iam_user: &str) -> bool {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(content) else {
            return false;
        };
        let field = |name: &str| value.get(name).and_then(|v| v.as_str()).map(str::to_string);
        let (Some(key_id), Some(secret), Some(token), Some(expiration)) = (
            field("AccessKeyId"),
            field("SecretAccessKey"),
            field("Token"),
            field("Expiration"),
        ) else {
            return false;
        };
        *self.secret.write().unwrap() = Some(Arc::new(Secret {
            iam_user: iam_user.to_string(),
            key_id,
            secret,
            token,
            expiration: convert_iam_timestamp(&expiration),
        }));
        true
    }

    /// Parse a CreateSession answer and install the zonal session secret.
    fn update_session_token(&self, content: &str) -> bool {
        let tag = |name: &str| find_xml_tag(content, name);
        let (Some(key_id), Some(secret), Some(token), Some(expiration)) = (
            tag("AccessKeyId"),
            tag("SecretAccessKey"),
            tag("SessionToken"),
            tag("Expiration"),
        ) else {
            return false;
        };
        *self.session_secret.write().unwrap() = Some(Arc::new(Secret {
            key_id,
            secret,
            token,
            expiration: convert_iam_timestamp(&expiration),
            ..Secret::default()
        }));
        true
    }

    /// CreateSession request for zonal buckets.
    fn get_session_token(&self, mode: &str) -> Result<ByteBuffer> {
        let secret = self
            .secret()
            .ok_or_else(|| provider_err("aws credentials missing"))?;
        let mut request = HttpRequest::new(Method::Get, "/");
        request.queries.insert("session".into(), String::new());
        request.headers.insert(
            "Host".into(),
            format!("{}.s3.amazonaws.com", self.settings.bucket),
        );
        request
            .headers
            .insert("x-amz-create-session-mode".into(), mode.to_string());
        request
            .headers
            .insert("x-amz-date".into(), build_amz_timestamp());
        if !secret.token.is_empty() {
            request
                .headers
                .insert("x-amz-security-token".into(), secret.token.clone());
        }
        self.build_request(&mut request, b"", b"", false)
    }

    /// Object path, virtual-hosted by default, path-style against an
    /// explicit endpoint.
    fn object_path(&self, file_path: &str) -> String {
        if self.settings.endpoint.is_empty() {
            format!("/{file_path}")
        } else {
            format!("/{}/{file_path}", self.settings.bucket)
        }
    }

    /// Sign and serialize a request. `body` enters the signature; `payload`
    /// is appended inline after the header (completion XML).
    fn build_request(
        &self,
        request: &mut HttpRequest,
        body: &[u8],
        payload: &[u8],
        init_headers: bool,
    ) -> Result<ByteBuffer> {
        let secret;
        if init_headers {
            request.headers.insert("Host".into(), self.address());
            request
                .headers
                .insert("x-amz-date".into(), build_amz_timestamp());
            if !self.settings.zonal {
                request
                    .headers
                    .insert("x-amz-request-payer".into(), "requester".into());
                secret = self
                    .secret()
                    .ok_or_else(|| provider_err("aws credentials missing"))?;
                if !secret.token.is_empty() {
                    request
                        .headers
                        .insert("x-amz-security-token".into(), secret.token.clone());
                }
            } else {
                secret = self
                    .session()
                    .ok_or_else(|| provider_err("aws session missing"))?;
                request
                    .headers
                    .insert("x-amz-s3session-token".into(), secret.token.clone());
            }
        } else {
            secret = self
                .secret()
                .ok_or_else(|| provider_err("aws credentials missing"))?;
        }

        let signed_path = AwsSigner::create_signed_request(
            &secret.key_id,
            &secret.secret,
            request,
            body,
            &self.settings.region,
            "s3",
        )?;

        let mut header = String::with_capacity(512);
        header.push_str(request.method.unwrap().as_str());
        header.push(' ');
        header.push_str(&signed_path);
        header.push_str(" HTTP/1.1\r\n");
        for (key, value) in &request.headers {
            header.push_str(key);
            header.push_str(": ");
            header.push_str(value);
            header.push_str("\r\n");
        }
        header.push_str("\r\n");

        let mut buffer = ByteBuffer::from_slice(header.as_bytes());
        if !payload.is_empty() {
            buffer.extend_from_slice(payload)?;
        }
        Ok(buffer)
    }

    fn put_request_generic(
        &self,
        file_path: &str,
        object: &[u8],
        part: u16,
        upload_id: &str,
    ) -> Result<ByteBuffer> {
        self.check_keys()?;
        let mut request = HttpRequest::new(Method::Put, self.object_path(file_path));
        if part > 0 {
            request
                .queries
                .insert("partNumber".into(), part.to_string());
            request.queries.insert("uploadId".into(), upload_id.into());
        }
        request
            .headers
            .insert("Content-Length".into(), object.len().to_string());
        self.build_request(&mut request, object, b"", true)
    }

    fn delete_request_generic(&self, file_path: &str, upload_id: &str) -> Result<ByteBuffer> {
        self.check_keys()?;
        let mut request = HttpRequest::new(Method::Delete, self.object_path(file_path));
        if !upload_id.is_empty() {
            request.queries.insert("uploadId".into(), upload_id.into());
        }
        self.build_request(&mut request, b"", b"", true)
    }

    /// The region the instance runs in, from the metadata service.
    pub fn get_instance_region(handle: &mut WorkerHandle<'_>) -> Result<String> {
        let msg = fetch_metadata(
            handle,
            Self::download_instance_info("placement/region"),
            Self::instance_address(),
            Self::instance_port(),
        )?;
        Ok(String::from_utf8_lossy(msg.result.body()).to_string())
    }

    /// Instance details from the metadata service, matched against the
    /// known instance table.
    pub fn instance_details(&self, handle: &mut WorkerHandle<'_>) -> Result<Instance> {
        let msg = fetch_metadata(
            handle,
            Self::download_instance_info("instance-type"),
            Self::instance_address(),
            Self::instance_port(),
        )?;
        let kind = String::from_utf8_lossy(msg.result.body()).to_string();
        Ok(aws_instances()
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

    /// Engine sizing from the instance's advertised bandwidth.
    pub fn config(&self, handle: &mut WorkerHandle<'_>) -> Config {
        match self.instance_details(handle) {
            Ok(instance) if instance.network_mbits > 0 => Config::new(instance.network_mbits),
            _ => Config::default(),
        }
    }
}

impl Provider for Aws {
    fn get_request(&self, path: &str, range: Option<(u64, u64)>) -> Result<ByteBuffer> {
        self.check_keys()?;
        let mut request = HttpRequest::new(Method::Get, self.object_path(path));
        if let Some((begin, end)) = range {
            if begin != end {
                request
                    .headers
                    .insert("Range".into(), format!("bytes={begin}-{end}"));
            }
        }
        self.build_request(&mut request, b"", b"", true)
    }

    fn put_request(&self, path: &str, object: &[u8]) -> Result<ByteBuffer> {
        self.put_request_generic(path, object, 0, "")
    }

    fn delete_request(&self, path: &str) -> Result<ByteBuffer> {
        self.delete_request_generic(path, "")
    }

    fn create_multipart_request(&self, path: &str) -> Result<ByteBuffer> {
        self.check_keys()?;
        let mut request = HttpRequest::new(Method::Post, self.object_path(path));
        request.queries.insert("uploads".into(), String::new());
        self.build_request(&mut request, b"", b"", true)
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
        self.check_keys()?;
        let mut content = String::from("<CompleteMultipartUpload>\n");
        for (at, etag) in etags.iter().enumerate() {
            content.push_str("<Part>\n<PartNumber>");
            content.push_str(&(at + 1).to_string());
            content.push_str("</PartNumber>\n<ETag>\"");
            content.push_str(etag);
            content.push_str("\"</ETag>\n</Part>\n");
        }
        content.push_str("</CompleteMultipartUpload>\n");

        let mut request = HttpRequest::new(Method::Post, self.object_path(path));
        request.queries.insert("uploadId".into(), upload_id.into());
        request
            .headers
            .insert("Content-Length".into(), content.len().to_string());
        self.build_request(&mut request, content.as_bytes(), content.as_bytes(), true)
    }

    fn abort_multipart_request(&self, path: &str, upload_id: &str) -> Result<ByteBuffer> {
        self.delete_request_generic(path, upload_id)
    }

    fn address(&self) -> String {
        if !self.settings.endpoint.is_empty() {
            return self.settings.endpoint.clone();
        }
        if let Some(host) = &self.host_override {
            return host.clone();
        }
        if self.settings.zonal {
            // Strip the trailing "--x-s3", keep at most the 9-character
            // availability-zone id plus its "--" separator.
            let bucket = &self.settings.bucket[..self.settings.bucket.len() - 6];
            let tail = &bucket[bucket.len().saturating_sub(11)..];
            let zone = match tail.find("--") {
                Some(at) => &tail[at + 2..],
                None => tail,
            };
            return format!(
                "{}.s3express-{zone}.{}.amazonaws.com",
                self.settings.bucket, self.settings.region
            );
        }
        format!(
            "{}.s3.{}.amazonaws.com",
            self.settings.bucket, self.settings.region
        )
    }

    fn port(&self) -> u16 {
        self.settings.port
    }

    fn tls(&self) -> bool {
        self.https
    }

    fn multipart_upload_size(&self) -> u64 {
        self.multipart_upload_size.load(Ordering::Relaxed)
    }

    fn credentials_valid(&self) -> bool {
        // Refresh ahead of expiry, as the request may be in flight a while.
        self.valid_keys(180) && (!self.settings.zonal || self.valid_session(180))
    }

    fn refresh_credentials(&self, handle: &mut WorkerHandle<'_>) -> Result<()> {
        if !self.valid_keys(180) {
            let msg = fetch_metadata(
                handle,
                Self::download_iam_user(),
                Self::instance_address(),
                Self::instance_port(),
            )?;
            let listing = String::from_utf8_lossy(msg.result.body()).to_string();
            let (header, iam_user) = Self::download_secret(&listing)
                .ok_or_else(|| provider_err("metadata service listed no IAM role"))?;
            let msg = fetch_metadata(
                handle,
                header,
                Self::instance_address(),
                Self::instance_port(),
            )?;
            let content = String::from_utf8_lossy(msg.result.body()).to_string();
            if !self.update_secret(&content, &iam_user) {
                return Err(provider_err("could not parse IAM credential"));
            }
            tracing::debug!(iam_user, "refreshed aws credentials");
        }
        if self.settings.zonal && !self.valid_session(180) {
            let header = self.get_session_token("ReadWrite")?;
            let msg = fetch_metadata(handle, header, &self.address(), self.port())?;
            let content = String::from_utf8_lossy(msg.result.body()).to_string();
            if !self.update_session_token(&content) {
                return Err(provider_err("could not parse zonal session token"));
            }
            tracing::debug!("refreshed zonal session token");
        }
        Ok(())
    }
}

fn find_xml_tag(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(text[start..end].to_string())
}
