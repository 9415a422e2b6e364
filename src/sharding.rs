//! Shard keyspace layout.
//!
//! Shards live at `{counter}/{collection_id}/{shard_id}`. Partials live in
//! the same collection under keys made of a shard-id prefix (1 to 4 chars)
//! left-padded with `\t` to five characters, so every partial sorts before
//! every real shard id and shorter prefixes sort before longer ones.

/// Pad character reserved for partial keys.
pub const PARTIAL_MARKER: char = '\t';

/// Length of an encoded partial key.
pub const ENCODED_PARTIAL_LEN: usize = 5;

/// Deepest partial prefix.
pub const MAX_PREFIX_LEN: usize = 4;

/// Array field holding a partial's pending updates.
pub const UPDATES_FIELD: &str = "_updates_";

/// Parent path (`a/b/c` -> `a/b`), empty for a top-level segment.
pub fn dirname(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Last path segment (`a/b/c` -> `c`).
pub fn basename(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

pub fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Id of the collection a document belongs to.
pub fn collection_id(path: &str) -> &str {
    basename(dirname(path))
}

/// Counter document owning a shard or partial.
pub fn counter_path(shard_path: &str) -> &str {
    dirname(dirname(shard_path))
}

pub fn is_partial_key(key: &str) -> bool {
    key.starts_with(PARTIAL_MARKER)
}

pub fn is_partial_path(path: &str) -> bool {
    is_partial_key(basename(path))
}

/// Strip the partial padding, leaving the shard-id prefix.
pub fn decode_shard_key(key: &str) -> &str {
    key.trim_start_matches(PARTIAL_MARKER)
}

/// Encode a shard-id prefix as a partial key.
pub fn encode_partial_key(prefix: &str) -> String {
    let len = prefix.chars().count();
    let mut key: String = std::iter::repeat(PARTIAL_MARKER)
        .take(ENCODED_PARTIAL_LEN.saturating_sub(len))
        .collect();
    key.push_str(prefix);
    key
}

/// First `len` characters of a key.
pub fn key_prefix(key: &str, len: usize) -> String {
    key.chars().take(len).collect()
}

/// Partial keys a shard id rolls up through, deepest first.
pub fn partial_ancestors(shard_id: &str) -> Vec<String> {
    (1..=MAX_PREFIX_LEN)
        .rev()
        .filter(|len| *len < shard_id.chars().count())
        .map(|len| encode_partial_key(&key_prefix(shard_id, len)))
        .collect()
}

/// Worker document keys are zero-padded hex so they sort in slice order.
pub fn encode_worker_key(index: usize) -> String {
    format!("{index:04x}")
}
