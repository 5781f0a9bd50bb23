//! Deterministic document bodies for set payloads.
//!
//! Every field is derived from the item's wire key, so the same key always
//! produces the same document. The trailing `"body"` padding is built once per
//! size class when the synthesizer is created.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::keys::{hex_prefix, KEY_HASH_LEN};

#[derive(Debug, Clone)]
pub struct DocumentSynthesizer {
    json: bool,
    suffixes: HashMap<usize, String>,
}

impl DocumentSynthesizer {
    pub fn new(size_classes: &[usize], json: bool) -> Self {
        let suffixes = size_classes
            .iter()
            .map(|&size| (size, padding_suffix(size)))
            .collect();
        Self { json, suffixes }
    }

    /// Builds the document for `id`/`key`. The result is at least
    /// `size_class` bytes long.
    pub fn synthesize(&self, id: i64, key: &str, size_class: usize) -> String {
        let owned;
        let suffix = match self.suffixes.get(&size_class) {
            Some(suffix) => suffix.as_str(),
            None => {
                owned = padding_suffix(size_class);
                owned.as_str()
            }
        };

        let hex = hash_part(key);
        let opener = if self.json { '{' } else { '*' };
        let achievements = achievements(hex)
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "{}\"key\":\"{}\",\n \"key_num\":{},\n \"name\":\"{}\",\n \"email\":\"{}\",\n \"city\":\"{}\",\n \"country\":\"{}\",\n \"realm\":\"{}\",\n \"coins\":{:.2},\n \"achievements\":[{}],\n {}",
            opener,
            key,
            id,
            name(hex),
            email(hex),
            slice(hex, 4, 7),
            slice(hex, 7, 9),
            slice(hex, 9, 12),
            coins(hex),
            achievements,
            suffix,
        )
    }
}

/// `"body":"x…"}` where the body is grown with hex digests until it reaches
/// `size` bytes.
fn padding_suffix(size: usize) -> String {
    let mut body = String::from("x");
    while body.len() < size {
        let digest = Sha256::digest(body.len().to_string().as_bytes());
        body.push_str(&hex_prefix(&digest, 64));
    }
    format!("\"body\":\"{}\"}}", body)
}

/// Keys end in the 16-char hex hash; any `prefix-` is skipped.
fn hash_part(key: &str) -> &str {
    if key.len() >= KEY_HASH_LEN && key.is_char_boundary(key.len() - KEY_HASH_LEN) {
        &key[key.len() - KEY_HASH_LEN..]
    } else {
        key
    }
}

fn slice(hex: &str, start: usize, end: usize) -> &str {
    let end = end.min(hex.len());
    let start = start.min(end);
    hex.get(start..end).unwrap_or("")
}

fn name(hex: &str) -> String {
    let len = hex.len();
    let tail = if len >= 4 { slice(hex, len - 4, len - 1) } else { "" };
    format!("{} {}", slice(hex, 0, 4), tail)
}

fn email(hex: &str) -> String {
    format!("{}@{}.com", slice(hex, 0, 4), slice(hex, 3, 5))
}

fn coins(hex: &str) -> f64 {
    let value = u32::from_str_radix(slice(hex, 0, 4), 16).unwrap_or(0);
    (value as f64 / 100.0).max(0.0)
}

/// Small integers below 256 from the recurrence
/// `next = (next + digit(i) * i) % 500`, seeded with 300.
fn achievements(hex: &str) -> Vec<u32> {
    let mut next = 300u32;
    let mut out = Vec::new();
    for (i, c) in hex.chars().enumerate() {
        let digit = c.to_digit(16).unwrap_or(0);
        next = (next + digit * i as u32) % 500;
        if next < 256 {
            out.push(next);
        }
    }
    out
}
