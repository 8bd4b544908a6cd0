//! Canonical JSON serialization and content hashing for stream documents.
//!
//! The optimistic-concurrency check in [`crate::stream_store`] depends on hash
//! determinism: two processes serializing the same logical document must
//! produce byte-identical output. `serde_json` already emits object keys in
//! struct-field-declaration order (not map order) for `#[derive(Serialize)]`
//! types, which is stable across processes for a fixed struct definition, so
//! canonicalization here only has to pin down a single numeric/boolean/null
//! encoding -- which `serde_json` already does -- and documents aren't
//! sorted reflectively. Values under `metadata` (a `BTreeMap`) sort by key so
//! that insertion order of caller-supplied metadata entries never affects the
//! hash.

use md5::{Digest as _, Md5};
use sha2::{Digest, Sha256};

/// Computes the hex-encoded SHA-256 hash of `bytes`.
///
/// This is the hash returned by [`crate::object_store_adapter::ObjectStoreAdapter::get`]
/// and [`crate::object_store_adapter::ObjectStoreAdapter::put`] alongside the
/// raw payload, and the value stored in `lastObjectDocumentHash`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Computes the (non-cryptographic) Content-MD5 used for PUT transport
/// integrity, base64-encoded the way S3-compatible APIs expect it.
#[must_use]
pub fn content_md5_base64(bytes: &[u8]) -> String {
    use base64_lite::encode;
    let digest = Md5::digest(bytes);
    encode(&digest)
}

/// The same MD5 digest as [`content_md5_base64`], hex-encoded. S3-compatible
/// backends set a single-part object's ETag to exactly this value, which
/// lets [`crate::object_store_adapter::ObjectStoreAdapter::put`] cross-check
/// the backend's response against what was actually sent.
#[must_use]
pub fn content_md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Minimal base64 encoder so we don't have to pull in a whole `base64` crate
/// just for this one header value.
mod base64_lite {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    pub(super) fn encode(bytes: &[u8]) -> String {
        let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
        for chunk in bytes.chunks(3) {
            let b0 = chunk[0];
            let b1 = chunk.get(1).copied();
            let b2 = chunk.get(2).copied();

            let n = (u32::from(b0) << 16) | (u32::from(b1.unwrap_or(0)) << 8) | u32::from(b2.unwrap_or(0));

            out.push(ALPHABET[(n >> 18 & 0x3f) as usize] as char);
            out.push(ALPHABET[(n >> 12 & 0x3f) as usize] as char);
            out.push(if b1.is_some() {
                ALPHABET[(n >> 6 & 0x3f) as usize] as char
            } else {
                '='
            });
            out.push(if b2.is_some() {
                ALPHABET[(n & 0x3f) as usize] as char
            } else {
                '='
            });
        }
        out
    }
}
