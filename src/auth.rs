//! Session/auth layer (C7): password set/verify, token issue, and
//! per-connection auth state.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;

pub const MIN_PASSWORD_LEN: usize = 8;
const BCRYPT_COST: u32 = 10;
const TOKEN_BYTES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Minimum password length: {MIN_PASSWORD_LEN} characters")]
    PasswordTooShort,
    #[error("a password is already set; authenticate first to change it")]
    NotPermitted,
    #[error("hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
}

/// Whether the connection attempting `config:{password: ...}` is allowed
/// to set it: either it's already authenticated, or no password is
/// configured yet and the request didn't arrive over the remote tunnel.
pub fn can_set_password(already_authenticated: bool, password_configured: bool, is_remote: bool) -> bool {
    already_authenticated || (!password_configured && !is_remote)
}

/// Hash a new password, enforcing the minimum length.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    if password.len() < MIN_PASSWORD_LEN {
        return Err(AuthError::PasswordTooShort);
    }
    Ok(bcrypt::hash(password, BCRYPT_COST)?)
}

/// Verify a password attempt against the stored hash. Never panics on a
/// malformed hash — treats it as a verification failure.
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}

/// Generate a fresh opaque 256-bit token, base64-encoded for transport.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}
