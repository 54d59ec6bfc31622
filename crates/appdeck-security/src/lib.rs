mod ed25519;

pub use ed25519::{sha256_hex, verify_against_trusted_keys, verify_ed25519_signature_hex};
