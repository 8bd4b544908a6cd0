//! Object-store key layout (§6 of the specification).
//!
//! Centralizing these in one module keeps every component (D, E, F) agreeing
//! on the exact same key shapes, the same way `eventually-redis::stream`
//! centralizes its Redis key-naming in one place rather than scattering
//! `format!` calls through the store.

/// Bucket name for a logical object: `lower(objectName)`.
#[must_use]
pub fn bucket_for_object(object_name: &str) -> String {
    object_name.to_lowercase()
}

/// Key for an unchunked stream document.
#[must_use]
pub fn stream_key(stream_id: &str) -> String {
    format!("{stream_id}.json")
}

/// Key for one chunk of a chunked stream document.
#[must_use]
pub fn stream_chunk_key(stream_id: &str, chunk: u32) -> String {
    format!("{stream_id}-{chunk:010}.json")
}

/// Key for a snapshot object.
#[must_use]
pub fn snapshot_key(stream_id: &str, version: u32, label: Option<&str>) -> String {
    match label {
        Some(label) => format!("snapshot/{stream_id}-{version:020}_{label}.json"),
        None => format!("snapshot/{stream_id}-{version:020}.json"),
    }
}

/// Key for the tag-index object backing a given tag.
#[must_use]
pub fn tag_index_key(tag: &str) -> String {
    format!("tags/stream-by-tag/{}.json", sanitize_tag(tag))
}

/// Prefix used when listing every object belonging to a logical object name.
#[must_use]
pub fn object_listing_prefix(object_name: &str) -> String {
    format!("{}/", object_name.to_lowercase())
}

/// Strips the reserved filesystem/URL-hostile characters from a tag and
/// lower-cases the result, so that tags are case-insensitive and the
/// on-disk key is stable regardless of caller casing (decision recorded in
/// DESIGN.md for the corresponding Open Question).
#[must_use]
pub fn sanitize_tag(tag: &str) -> String {
    tag.chars()
        .filter(|c| !matches!(c, '\\' | '/' | '*' | '?' | '<' | '>' | '|' | '"' | '\r' | '\n'))
        .collect::<String>()
        .to_lowercase()
}
