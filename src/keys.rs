use sha2::{Digest, Sha256};

/// Number of hex characters kept from the digest.
pub const KEY_HASH_LEN: usize = 16;

/// Item id used for gets that must miss. Never produced by a create.
pub const MISS_KEY_ID: i64 = -1;

/// Maps an item id to its wire key: the first 16 hex chars of
/// sha256(decimal id), optionally prefixed with `prefix-`.
pub fn key_for(id: i64, prefix: &str) -> String {
    let digest = Sha256::digest(id.to_string().as_bytes());
    let hash = hex_prefix(&digest, KEY_HASH_LEN);
    if prefix.is_empty() {
        hash
    } else {
        format!("{}-{}", prefix, hash)
    }
}

/// Lowercase hex of the leading bytes of `bytes`, cut to `len` chars.
pub(crate) fn hex_prefix(bytes: &[u8], len: usize) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(len);
    for byte in bytes {
        if out.len() >= len {
            break;
        }
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out.truncate(len);
    out
}
