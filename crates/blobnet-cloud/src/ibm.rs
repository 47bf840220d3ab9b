use blobnet::buffer::ByteBuffer;
use blobnet::worker::WorkerHandle;
use blobnet::{Provider, Result};

use crate::aws::Aws;
use crate::RemoteInfo;

/// IBM Cloud Object Storage through its S3 interface, virtual-hosted
/// against the COS region scheme.
pub struct Ibm {
    inner: Aws,
}

impl Ibm {
    pub fn new(info: RemoteInfo, https: bool, key_id: &str, secret: &str) -> Self {
        let host = format!(
            "{}.s3.{}.cloud-object-storage.appdomain.cloud",
            info.bucket, info.region
        );
        let mut inner = Aws::with_keys(info, https, key_id, secret);
        inner.set_host_override(host);
        Ibm { inner }
    }
}

impl Provider for Ibm {
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
