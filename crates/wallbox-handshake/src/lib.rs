//! Credential derivation for the wallbox authentication handshake.
//!
//! Two pure computations, no I/O:
//!
//! - [`derive_session_secret`] turns the user password and the device
//!   serial into the per-session secret, via PBKDF2.
//! - [`derive_auth_response`] answers an `authRequired` challenge with a
//!   fresh nonce and the SHA-256 proof hash the device expects.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

/// PBKDF2 rounds for the session secret.
const PBKDF2_ROUNDS: u32 = 100_000;

/// Raw PBKDF2 output length in bytes, before base64 reduction.
const PBKDF2_OUTPUT_LEN: usize = 256;

/// Length of the reduced session secret and of the `token3` nonce.
pub const SECRET_LEN: usize = 32;

/// Errors from handshake derivation.
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The OS random source failed. A predictable nonce would weaken the
    /// handshake, so this is not recoverable.
    #[error("random source failure: {0}")]
    Rng(#[from] rand::Error),
}

/// The derived per-session credential.
///
/// Held in memory only, never persisted. `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionSecret(String);

impl SessionSecret {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}

/// Derive the session secret from the user password and device serial.
///
/// PBKDF2-HMAC-SHA512, 100k rounds, serial as salt (treated as opaque
/// bytes), 256-byte output, reduced to the first 32 characters of its
/// standard base64 encoding. Deterministic for a given (password, serial)
/// pair.
pub fn derive_session_secret(password: &str, serial: &str) -> SessionSecret {
    let mut derived = [0u8; PBKDF2_OUTPUT_LEN];
    pbkdf2_hmac::<Sha512>(
        password.as_bytes(),
        serial.as_bytes(),
        PBKDF2_ROUNDS,
        &mut derived,
    );

    let encoded = BASE64.encode(derived);
    SessionSecret(encoded[..SECRET_LEN].to_owned())
}

/// The client's answer to an `authRequired` challenge.
#[derive(Debug, Clone)]
pub struct AuthProof {
    /// Fresh 32-hex-char nonce, unique per authentication attempt.
    pub token3: String,
    /// 64-hex-char SHA-256 proof over the challenge tokens and secret.
    pub hash: String,
}

/// Compute the proof hash for a given nonce.
///
/// `hash1 = sha256(token1 ++ secret)`, then
/// `sha256(token3 ++ token2 ++ hash1)`, each digest rendered as lowercase
/// hex and concatenated as text before the next hashing step.
pub fn auth_hash(token3: &str, token1: &str, token2: &str, secret: &SessionSecret) -> String {
    let hash1 = sha256_hex(&format!("{token1}{}", secret.as_str()));
    sha256_hex(&format!("{token3}{token2}{hash1}"))
}

/// Answer a challenge with a freshly generated nonce.
pub fn derive_auth_response(
    token1: &str,
    token2: &str,
    secret: &SessionSecret,
) -> Result<AuthProof, HandshakeError> {
    let token3 = random_hex_token()?;
    let hash = auth_hash(&token3, token1, token2, secret);
    Ok(AuthProof { token3, hash })
}

fn random_hex_token() -> Result<String, HandshakeError> {
    let mut bytes = [0u8; SECRET_LEN / 2];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(hex::encode(bytes))
}

fn sha256_hex(data: &str) -> String {
    hex::encode(Sha256::digest(data.as_bytes()))
}
