//! Versioning types shared across the stream store and the registry.
//!
//! Mirrors the spirit of `eventually::version` (a plain numeric alias plus a
//! small conflict-description type), adapted to the `u32`, dense,
//! zero-based `eventVersion` this runtime uses instead of a generic
//! monotonic `u64`.

/// The version of an event within its stream: a zero-based, dense index.
pub type Version = u32;

/// Sentinel written by the hash codec for "no previous write" / "any version".
pub const ANY_HASH: &str = "*";
