use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use blobnet::{Error, Provider, Result};

pub mod aws;
pub mod aws_cache;
pub mod aws_signer;
pub mod azure;
pub mod azure_signer;
pub mod gcp;
pub mod gcp_signer;
pub mod http;
pub mod ibm;
pub mod instances;
pub mod minio;
pub mod oracle;
pub mod util;

pub use aws::Aws;
pub use aws_cache::AwsCache;
pub use azure::Azure;
pub use gcp::Gcp;
pub use http::Http;
pub use ibm::Ibm;
pub use minio::MinIo;
pub use oracle::Oracle;

/// With the test environment enabled, providers stamp requests with fixed
/// far-future timestamps so signed bytes are reproducible.
static TEST_ENVIRONMENT: AtomicBool = AtomicBool::new(false);

pub fn set_test_environment(enabled: bool) {
    TEST_ENVIRONMENT.store(enabled, Ordering::Relaxed);
}

pub(crate) fn test_environment() -> bool {
    TEST_ENVIRONMENT.load(Ordering::Relaxed)
}

pub(crate) fn provider_err(msg: impl Into<String>) -> Error {
    Error::Provider(msg.into())
}

/// The storage dialects a URL can name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudService {
    Aws,
    Azure,
    Gcp,
    MinIo,
    Ibm,
    Oracle,
    Http,
}

const REMOTE_PREFIXES: [(&str, CloudService); 7] = [
    ("s3://", CloudService::Aws),
    ("azure://", CloudService::Azure),
    ("gcp://", CloudService::Gcp),
    ("minio://", CloudService::MinIo),
    ("ibm://", CloudService::Ibm),
    ("oracle://", CloudService::Oracle),
    ("http://", CloudService::Http),
];

/// Parsed `scheme://[endpoint/]bucket[:region]/…` remote location.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteInfo {
    pub service: Option<CloudService>,
    pub bucket: String,
    pub region: String,
    pub endpoint: String,
    pub port: u16,
}

pub fn is_remote_url(url: &str) -> bool {
    REMOTE_PREFIXES
        .iter()
        .any(|(prefix, _)| url.starts_with(prefix))
}

/// The object-key prefix of a remote URL, without scheme and bucket.
pub fn remote_parent_directory(url: &str) -> String {
    let mut rest = url;
    for (prefix, _) in REMOTE_PREFIXES {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = match stripped.find('/') {
                Some(at) => &stripped[at + 1..],
                None => "",
            };
            break;
        }
    }
    match rest.rfind('/') {
        Some(at) => rest[..at + 1].to_string(),
        None => String::new(),
    }
}

/// Parse the remote grammar: everything after the scheme up to the first
/// `/` is `[endpoint/]bucket[:region]`; MinIO and plain HTTP carry an
/// explicit endpoint (with optional port) ahead of the bucket.
pub fn remote_info(url: &str) -> Result<RemoteInfo> {
    let mut info = RemoteInfo {
        port: 80,
        ..RemoteInfo::default()
    };
    for (prefix, service) in REMOTE_PREFIXES {
        let Some(mut rest) = url.strip_prefix(prefix) else {
            continue;
        };
        if matches!(service, CloudService::MinIo | CloudService::Http) {
            let endpoint_end = rest.find('/').unwrap_or(rest.len());
            let endpoint = &rest[..endpoint_end];
            match endpoint.split_once(':') {
                Some((host, port)) => {
                    info.endpoint = host.to_string();
                    info.port = port
                        .parse()
                        .map_err(|_| provider_err(format!("invalid port in '{url}'")))?;
                }
                None => {
                    info.endpoint = endpoint.to_string();
                }
            }
            rest = rest.get(endpoint_end + 1..).unwrap_or("");
        }
        let bucket_end = rest.find('/').unwrap_or(rest.len());
        let bucket_region = &rest[..bucket_end];
        match bucket_region.split_once(':') {
            Some((bucket, region)) => {
                info.bucket = bucket.to_string();
                info.region = region.to_string();
            }
            None => {
                info.bucket = bucket_region.to_string();
            }
        }
        info.service = Some(service);
        return Ok(info);
    }
    Err(provider_err(format!("'{url}' is not a remote URL")))
}

/// Create the provider a remote URL names. `key_id` carries the account
/// name for Azure and the access id for the S3 dialects; GCP interop keys
/// use the HMAC access id.
pub fn make_provider(
    url: &str,
    https: bool,
    key_id: &str,
    secret: &str,
) -> Result<Arc<dyn Provider>> {
    let info = remote_info(url)?;
    match info.service {
        Some(CloudService::Aws) => Ok(Arc::new(Aws::with_keys(info, https, key_id, secret))),
        Some(CloudService::MinIo) => Ok(Arc::new(MinIo::new(info, https, key_id, secret)?)),
        Some(CloudService::Ibm) => Ok(Arc::new(Ibm::new(info, https, key_id, secret))),
        Some(CloudService::Oracle) => Ok(Arc::new(Oracle::new(info, https, key_id, secret))),
        Some(CloudService::Azure) => Ok(Arc::new(Azure::new(info, https, key_id, secret))),
        Some(CloudService::Gcp) => Ok(Arc::new(Gcp::new(info, https, key_id, secret))),
        Some(CloudService::Http) => Ok(Arc::new(Http::new(info))),
        None => Err(provider_err(format!("'{url}' names no provider"))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn remote_url_detection() {
        assert!(is_remote_url("s3://bucket:region/key"));
        assert!(is_remote_url("minio://host:9000/bucket:region/"));
        assert!(!is_remote_url("file:///tmp/x"));
        assert!(!is_remote_url("bucket/key"));
    }

    #[test]
    fn parse_s3_url() {
        let info = remote_info("s3://data:eu-central-1/prefix/key").unwrap();
        assert_eq!(info.service, Some(CloudService::Aws));
        assert_eq!(info.bucket, "data");
        assert_eq!(info.region, "eu-central-1");
        assert_eq!(info.endpoint, "");
    }

    #[test]
    fn parse_minio_url_with_port() {
        let info = remote_info("minio://storage.local:9000/data:us-east-1/x").unwrap();
        assert_eq!(info.service, Some(CloudService::MinIo));
        assert_eq!(info.endpoint, "storage.local");
        assert_eq!(info.port, 9000);
        assert_eq!(info.bucket, "data");
        assert_eq!(info.region, "us-east-1");
    }

    #[test]
    fn parse_minio_url_default_port() {
        let info = remote_info("minio://storage.local/data:r/").unwrap();
        assert_eq!(info.port, 80);
        assert_eq!(info.bucket, "data");
    }

    #[test]
    fn parse_azure_url() {
        let info = remote_info("azure://container/blob.bin").unwrap();
        assert_eq!(info.service, Some(CloudService::Azure));
        assert_eq!(info.bucket, "container");
        assert_eq!(info.region, "");
    }

    #[test]
    fn parent_directory() {
        assert_eq!(
            remote_parent_directory("s3://bucket:region/a/b/c.d"),
            "a/b/"
        );
        assert_eq!(remote_parent_directory("s3://bucket:region/c.d"), "");
    }

    #[test]
    fn unknown_scheme_is_an_error() {
        assert!(remote_info("ftp://host/x").is_err());
    }
}
