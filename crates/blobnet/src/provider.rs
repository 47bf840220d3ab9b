use crate::buffer::ByteBuffer;
use crate::worker::WorkerHandle;
use crate::{Error, Result};

/// What the engine needs from a storage dialect: serialized (and signed)
/// request bytes, the destination, and credential upkeep. All providers
/// share the transaction and multipart logic built on top of this.
pub trait Provider: Send + Sync {
    /// Request bytes for downloading a blob, optionally a byte range.
    fn get_request(&self, path: &str, range: Option<(u64, u64)>) -> Result<ByteBuffer>;

    /// Request header bytes for uploading `object`; the body itself is
    /// transmitted separately after the header.
    fn put_request(&self, path: &str, object: &[u8]) -> Result<ByteBuffer>;

    fn delete_request(&self, path: &str) -> Result<ByteBuffer>;

    /// Initiate a multipart upload for `path`.
    fn create_multipart_request(&self, _path: &str) -> Result<ByteBuffer> {
        Err(Error::Provider(
            "provider does not support multipart uploads".to_string(),
        ))
    }

    /// Upload one part; `part` counts from 1.
    fn put_part_request(
        &self,
        _path: &str,
        _part: u16,
        _upload_id: &str,
        _object: &[u8],
    ) -> Result<ByteBuffer> {
        Err(Error::Provider(
            "provider does not support multipart uploads".to_string(),
        ))
    }

    /// Complete a multipart upload from the parts' etags, in part order.
    fn complete_multipart_request(
        &self,
        _path: &str,
        _upload_id: &str,
        _etags: &[String],
    ) -> Result<ByteBuffer> {
        Err(Error::Provider(
            "provider does not support multipart uploads".to_string(),
        ))
    }

    fn abort_multipart_request(&self, _path: &str, _upload_id: &str) -> Result<ByteBuffer> {
        Err(Error::Provider(
            "provider does not support multipart uploads".to_string(),
        ))
    }

    /// Destination host for this provider's requests.
    fn address(&self) -> String;

    fn port(&self) -> u16;

    fn tls(&self) -> bool;

    /// Threshold above which puts split into multipart uploads; 0 disables
    /// splitting.
    fn multipart_upload_size(&self) -> u64 {
        0
    }

    /// Whether the current credentials are usable as-is.
    fn credentials_valid(&self) -> bool {
        true
    }

    /// Refresh credentials synchronously through the given worker. Runs
    /// ahead of any request wrapped in `verify_key_request`.
    fn refresh_credentials(&self, _handle: &mut WorkerHandle<'_>) -> Result<()> {
        Ok(())
    }
}
