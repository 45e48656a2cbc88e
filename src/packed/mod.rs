//! Packed-storage layers (§4.5-§4.7): multiplex many small logical blobs
//! into a bounded number of physical container blobs through a persisted
//! master index.
//!
//! Both [`append::AppendPacked`] and [`json::JsonPacked`] share the same
//! lazy-load / synchronous-save discipline and the same root-prefix
//! convention; what differs is the container's physical layout (raw
//! concatenated bytes with an offset/length index vs. a JSON object keyed
//! by logical key).

pub mod append;
pub mod json;

use crate::blob::Key;

/// Joins `root` and `suffix` with `/`, or returns `suffix` unchanged when
/// `root` is empty, so an unset root doesn't produce a leading slash.
pub(crate) fn join_root(root: &str, suffix: &str) -> String {
    if root.is_empty() {
        suffix.to_string()
    } else {
        format!("{root}/{suffix}")
    }
}

/// A freshly generated, opaque physical container key under `root`.
pub(crate) fn new_container_key(root: &str) -> Key {
    Key::new(join_root(root, &uuid::Uuid::new_v4().to_string()))
}
