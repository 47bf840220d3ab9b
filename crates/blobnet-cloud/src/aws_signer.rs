use std::collections::BTreeMap;

use blobnet::http::{HttpRequest, Method};
use blobnet::Result;

use crate::provider_err;
use crate::util::{base64_encode, hex_encode, hmac_sha256, md5_digest, sha256_hex};

/// Bodies up to this size are hashed into the signature; larger ones are
/// declared UNSIGNED-PAYLOAD.
const SIGNED_BODY_LIMIT: usize = 1 << 10;

/// Outcome of canonicalization: what goes into the string to sign.
pub struct CanonicalRequest {
    pub signed_headers: String,
    pub request_sha: String,
    pub payload_hash: String,
}

/// Signature V4 over request headers.
/// https://docs.aws.amazon.com/general/latest/gr/sigv4-create-canonical-request.html
pub struct AwsSigner;

impl AwsSigner {
    /// Canonicalize the request (task 1). Inserts the payload hash header
    /// (and Content-MD5 for uploads) before the header set is fixed.
    pub fn encode_canonical_request(
        request: &mut HttpRequest,
        body: &[u8],
    ) -> Result<CanonicalRequest> {
        let method = request
            .method
            .ok_or_else(|| provider_err("request without method"))?;
        let mut canonical = String::with_capacity(512);
        canonical.push_str(method.as_str());
        canonical.push('\n');

        // Path and query are assumed RFC 3986 conform.
        canonical.push_str(if request.path.is_empty() {
            "/"
        } else {
            &request.path
        });
        canonical.push('\n');
        canonical.push_str(&request.query_string());
        canonical.push('\n');

        // Payload hash first, so it participates in the signed header set.
        let payload_hash = if body.len() <= SIGNED_BODY_LIMIT {
            let hash = sha256_hex(body);
            if matches!(method, Method::Put | Method::Post) {
                request
                    .headers
                    .insert("Content-MD5".into(), base64_encode(&md5_digest(body)));
            }
            hash
        } else {
            "UNSIGNED-PAYLOAD".to_string()
        };
        request
            .headers
            .insert("x-amz-content-sha256".into(), payload_hash.clone());

        // Headers, lowercased names, sorted; values without extra spaces.
        let sorted: BTreeMap<String, &String> = request
            .headers
            .iter()
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .collect();
        for (key, value) in &sorted {
            canonical.push_str(key);
            canonical.push(':');
            canonical.push_str(value);
            canonical.push('\n');
        }
        canonical.push('\n');

        let signed_headers = sorted
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(";");
        canonical.push_str(&signed_headers);
        canonical.push('\n');
        canonical.push_str(&payload_hash);

        Ok(CanonicalRequest {
            signed_headers,
            request_sha: sha256_hex(canonical.as_bytes()),
            payload_hash,
        })
    }

    /// The string to sign (task 2).
    pub fn create_string_to_sign(
        request: &HttpRequest,
        canonical: &CanonicalRequest,
        region: &str,
        service: &str,
    ) -> Result<String> {
        let date = request
            .headers
            .get("x-amz-date")
            .ok_or_else(|| provider_err("missing x-amz-date"))?;
        Ok(format!(
            "AWS4-HMAC-SHA256\n{date}\n{scope_date}/{region}/{service}/aws4_request\n{sha}",
            scope_date = &date[..8],
            sha = canonical.request_sha,
        ))
    }

    /// Derive the signing key, sign, attach the Authorization header (tasks
    /// 3 and 4), and return the signed request target (`path?query`).
    pub fn create_signed_request(
        key_id: &str,
        secret: &str,
        request: &mut HttpRequest,
        body: &[u8],
        region: &str,
        service: &str,
    ) -> Result<String> {
        let canonical = Self::encode_canonical_request(request, body)?;
        let string_to_sign = Self::create_string_to_sign(request, &canonical, region, service)?;
        let date = request.headers.get("x-amz-date").unwrap().clone();
        let scope_date = &date[..8];

        let mut key = hmac_sha256(format!("AWS4{secret}").as_bytes(), scope_date.as_bytes());
        key = hmac_sha256(&key, region.as_bytes());
        key = hmac_sha256(&key, service.as_bytes());
        key = hmac_sha256(&key, b"aws4_request");
        let signature = hex_encode(&hmac_sha256(&key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={key_id}/{scope_date}/{region}/{service}/aws4_request, \
             SignedHeaders={signed}, Signature={signature}",
            signed = canonical.signed_headers,
        );
        request.headers.insert("Authorization".into(), authorization);

        let path = if request.path.is_empty() {
            "/"
        } else {
            &request.path
        };
        Ok(format!("{path}?{query}", query = request.query_string()))
    }
}
