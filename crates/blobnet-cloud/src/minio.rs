use blobnet::buffer::ByteBuffer;
use blobnet::worker::WorkerHandle;
use blobnet::{Provider, Result};

use crate::aws::Aws;
use crate::{provider_err, RemoteInfo};

/// MinIO through the S3 compatibility API. MinIO does not speak
/// virtual-hosted addressing, so requests are always path-style against
/// the explicit endpoint.
pub struct MinIo {
    inner: Aws,
}

impl MinIo {
    pub fn new(info: RemoteInfo, https: bool, key_id: &str, secret: &str) -> Result<Self> {
        if info.endpoint.is_empty() {
            return Err(provider_err("minio requires an explicit endpoint"));
        }
        Ok(MinIo {
            inner: Aws::with_keys(info, https, key_id, secret),
        })
    }

    /// Split threshold for multipart uploads; MinIO enforces the 5 MiB
    /// part minimum of the S3 API.
    pub fn set_multipart_upload_size(&self, size: u64) {
        self.inner.set_multipart_upload_size(size);
    }

    pub fn inner(&self) -> &Aws {
        &self.inner
    }
}

impl Provider for MinIo {
    fn get_request(&self, path: &str, range: Option<(u64, u64)>) -> Result<ByteBuffer> {
        self.inner.get_request(path, range)
    }

    fn put_request(&self, path: &str, object: &[u8]) -> Result<ByteBuffer> {
        self.inner.put_request(path, object)
    }

    fn delete_request(&self, path: &str) -> Result<ByteBuffer> {
        self.inner.delete_request(path)
    }

    fn create_multipart_request(&self, path: &str) -> Result<ByteBuffer> {
        self.inner.create_multipart_request(path)
    }

    fn put_part_request(
        &self,
        path: &str,
        part: u16,
        upload_id: &str,
        object: &[u8],
    ) -> Result<ByteBuffer> {
        self.inner.put_part_request(path, part, upload_id, object)
    }

    fn complete_multipart_request(
        &self,
        path: &str,
        upload_id: &str,
        etags: &[String],
    ) -> Result<ByteBuffer> {
        self.inner.complete_multipart_request(path, upload_id, etags)
    }

    fn abort_multipart_request(&self, path: &str, upload_id: &str) -> Result<ByteBuffer> {
        self.inner.abort_multipart_request(path, upload_id)
    }

    fn address(&self) -> String {
        self.inner.address()
    }

    fn port(&self) -> u16 {
        self.inner.port()
    }

    fn tls(&self) -> bool {
        self.inner.tls()
    }

    fn multipart_upload_size(&self) -> u64 {
        self.inner.multipart_upload_size()
    }

    fn credentials_valid(&self) -> bool {
        self.inner.credentials_valid()
    }

    fn refresh_credentials(&self, handle: &mut WorkerHandle<'_>) -> Result<()> {
        self.inner.refresh_credentials(handle)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::remote_info;

    #[test]
    fn requires_an_endpoint() {
        assert!(MinIo::new(remote_info("s3://b:r/").unwrap(), false, "k", "s").is_err());
        let minio = MinIo::new(
            remote_info("minio://host:9000/bucket:region/").unwrap(),
            false,
            "k",
            "s",
        )
        .unwrap();
        assert_eq!(minio.address(), "host");
        assert_eq!(minio.port(), 9000);
    }

    #[test]
    fn multipart_threshold_is_settable() {
        let minio = MinIo::new(
            remote_info("minio://host/bucket:region/").unwrap(),
            false,
            "k",
            "s",
        )
        .unwrap();
        assert_eq!(minio.multipart_upload_size(), 0);
        minio.set_multipart_upload_size(6 << 20);
        assert_eq!(minio.multipart_upload_size(), 6 << 20);
    }
}
