use rand::Rng;
use sha2::{Digest, Sha256};

/// Prefix carried by every refresh token
pub const REFRESH_TOKEN_PREFIX: &str = "rt_";

/// Generate a secure random token (32 bytes, hex encoded = 64 characters)
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

/// Generate a refresh token: `rt_` followed by 32 random bytes in hex
pub fn generate_refresh_token() -> String {
    format!("{REFRESH_TOKEN_PREFIX}{}", generate_token())
}

/// SHA-256 hex of a token, the only form in which refresh tokens are stored
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
