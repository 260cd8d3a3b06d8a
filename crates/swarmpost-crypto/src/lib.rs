//! Swarmpost Crypto -- the signing side of authenticated storage requests.
//!
//! Nodes authenticate `retrieve` and `store` calls by an Ed25519 signature
//! over `method || namespace fragment || timestamp`, sent base64 encoded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::signature::{UnparsedPublicKey, ED25519};

pub mod identity;

pub use identity::SigningIdentity;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("identity error: {0}")]
    IdentityError(String),
    #[error("base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),
    #[error("hex decode error: {0}")]
    HexError(#[from] hex::FromHexError),
    #[error("signature verification failed")]
    BadSignature,
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Bytes a node expects to be signed for `method` on a namespace.
///
/// `namespace_fragment` is empty for the default namespace and the decimal
/// code otherwise.
pub fn request_verification_data(method: &str, namespace_fragment: &str, timestamp_ms: u64) -> Vec<u8> {
    format!("{method}{namespace_fragment}{timestamp_ms}").into_bytes()
}

pub fn retrieve_verification_data(namespace_fragment: &str, timestamp_ms: u64) -> Vec<u8> {
    request_verification_data("retrieve", namespace_fragment, timestamp_ms)
}

/// Sign and encode for the `signature` field.
pub fn sign_base64(identity: &SigningIdentity, data: &[u8]) -> String {
    BASE64.encode(identity.sign(data))
}

/// Check a base64 signature against a hex Ed25519 public key.
pub fn verify_base64(public_key_hex: &str, data: &[u8], signature_b64: &str) -> Result<(), CryptoError> {
    let public_key = hex::decode(public_key_hex)?;
    let signature = BASE64.decode(signature_b64)?;
    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(data, &signature)
        .map_err(|_| CryptoError::BadSignature)
}
