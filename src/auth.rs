use rand::Rng;

use crate::hex_string;

// Stored form: `blake3$<salt-hex>$<digest-hex>`.
const SCHEME: &str = "blake3";

fn salted_digest(salt_hex: &str, password: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt_hex.as_bytes());
    hasher.update(b"$");
    hasher.update(password.as_bytes());
    hasher.finalize().to_hex().to_string()
}

pub(crate) fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    rand::thread_rng().fill(&mut salt[..]);
    let salt_hex = hex_string(&salt);
    let digest = salted_digest(&salt_hex, password);
    format!("{SCHEME}${salt_hex}${digest}")
}

pub(crate) fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(salt_hex), Some(digest)) if scheme == SCHEME => {
            salted_digest(salt_hex, password) == digest
        }
        _ => false,
    }
}

/// Opaque session token: blake3 hex over 32 random bytes.
pub(crate) fn new_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes[..]);
    blake3::hash(&bytes).to_hex().to_string()
}
