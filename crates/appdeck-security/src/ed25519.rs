use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

pub fn sha256_hex(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

pub fn verify_ed25519_signature_hex(
    payload: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool> {
    let public_key_bytes =
        hex::decode(public_key_hex).context("failed to decode Ed25519 public key hex")?;
    let signature_bytes =
        hex::decode(signature_hex).context("failed to decode Ed25519 signature hex")?;
    let public_key_len = public_key_bytes.len();
    let signature_len = signature_bytes.len();

    let public_key_array: [u8; 32] = public_key_bytes.try_into().map_err(|_| {
        anyhow::anyhow!(
            "invalid Ed25519 public key length: expected 32 bytes, got {}",
            public_key_len
        )
    })?;
    let signature_array: [u8; 64] = signature_bytes.try_into().map_err(|_| {
        anyhow::anyhow!(
            "invalid Ed25519 signature length: expected 64 bytes, got {}",
            signature_len
        )
    })?;

    let verifying_key =
        VerifyingKey::from_bytes(&public_key_array).context("invalid Ed25519 public key bytes")?;
    let signature = Signature::from_bytes(&signature_array);

    Ok(verifying_key.verify(payload, &signature).is_ok())
}

// The chain of trust is a flat list of root keys; a signature is accepted if
// any configured key verifies it. Malformed configured keys are hard errors,
// not silent skips.
pub fn verify_against_trusted_keys(
    payload: &[u8],
    signature_hex: &str,
    trusted_public_keys_hex: &[String],
) -> Result<bool> {
    for public_key_hex in trusted_public_keys_hex {
        if verify_ed25519_signature_hex(payload, public_key_hex, signature_hex)? {
            return Ok(true);
        }
    }
    Ok(false)
}
