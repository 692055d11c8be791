//! Throttle key generation.
//!
//! Keys are SHA-1 digests of the identity and the route so raw addresses and
//! account identifiers never reach the storage backend.

use crate::validation::MAX_STORAGE_KEY_BYTES;
use axum::http::{Method, Uri};
use sha1::{Digest, Sha1};

/// Namespace of account tier keys, keeping them apart from IP tier keys.
pub const ACCOUNT_KEY_PREFIX: &str = "acct:";

/// The request path without its query string.
pub fn normalized_path(uri: &Uri) -> String {
    let path = uri.path();
    if path.is_empty() {
        uri.to_string()
    } else {
        path.to_string()
    }
}

/// Key of the IP tier: `sha1(ip|method|path)`.
pub fn ip_key(ip: &str, method: &Method, path: &str) -> String {
    sha1_hex(&format!("{}|{}|{}", ip, method.as_str(), path))
}

/// Key of the account tier, or `None` when there is no account value.
///
/// The value is trimmed and lowercased so `User@Example.com ` and
/// `user@example.com` share a bucket.
pub fn account_key(value: &str, method: &Method, path: &str) -> Option<String> {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return None;
    }

    Some(format!(
        "{}{}",
        ACCOUNT_KEY_PREFIX,
        sha1_hex(&format!("{}|{}|{}", value, method.as_str(), path))
    ))
}

/// A caller supplied key, hashed when it is too long for every backend to store.
pub fn caller_key(key: String) -> String {
    if key.len() > MAX_STORAGE_KEY_BYTES {
        sha1_hex(&key)
    } else {
        key
    }
}

fn sha1_hex(input: &str) -> String {
    hex::encode(Sha1::digest(input.as_bytes()))
}
