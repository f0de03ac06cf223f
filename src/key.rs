use md5::{Digest, Md5};
use regex::Regex;

lazy_static! {
    static ref LEGAL_KEY: Regex = Regex::new("^[a-z0-9_-]{1,120}$").unwrap();
}

/// Derive the store key for a URL: the lowercase hex MD5 of the URL string.
/// 32 hex characters, so it always satisfies the store's key syntax.
pub fn cache_key(url: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(url);
    let hash = hasher.finalize();
    format!("{hash:x}")
}

pub fn is_legal_key(key: &str) -> bool {
    LEGAL_KEY.is_match(key)
}

/// Keys are caller-supplied; a malformed one is a bug in the caller.
pub fn validate_key(key: &str) {
    if !is_legal_key(key) {
        panic!("keys must match regex [a-z0-9_-]{{1,120}}: \"{key}\"");
    }
}
