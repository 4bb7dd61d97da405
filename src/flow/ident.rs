use std::fmt::Write as _;

use sha1::{Digest, Sha1};

/// Computes a stable identifier for a flow: the lowercase hex SHA-1 of the
/// host id and the given parts, `|`-delimited. When `host_id` is empty both
/// it and its separator are omitted.
///
/// The collector deduplicates on these ids byte-for-byte, across ticks and
/// across sensor restarts, so the format must never change.
pub fn stable_id<I, S>(host_id: &str, parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha1::new();
    if !host_id.is_empty() {
        hasher.update(host_id.as_bytes());
        hasher.update(b"|");
    }
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_ref().as_bytes());
    }

    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
