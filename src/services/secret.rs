/// Key-derivation context for per-image secret hashes.
const KEY_CONTEXT: &str = "image-pipeline 2025-01-01 access secret";

fn image_key(image_id: &str) -> [u8; 32] {
    blake3::derive_key(KEY_CONTEXT, image_id.as_bytes())
}

/// Hash an access secret for storage, keyed by the image it protects.
pub fn hash_secret(image_id: &str, secret: &str) -> String {
    blake3::keyed_hash(&image_key(image_id), secret.as_bytes())
        .to_hex()
        .to_string()
}

/// Compare a presented secret against the stored hash in constant time.
pub fn verify_secret(image_id: &str, secret: &str, stored_hash: &str) -> Result<bool, SecretError> {
    let stored = blake3::Hash::from_hex(stored_hash).map_err(|_| SecretError::MalformedHash)?;
    let presented = blake3::keyed_hash(&image_key(image_id), secret.as_bytes());
    // `blake3::Hash` equality is constant-time.
    Ok(stored == presented)
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("Stored secret hash is malformed")]
    MalformedHash,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_secret("abc", "open sesame");
        assert_eq!(hash.len(), 64);
        assert!(verify_secret("abc", "open sesame", &hash).unwrap());
        assert!(!verify_secret("abc", "open sesame!", &hash).unwrap());
    }

    #[test]
    fn test_hash_is_bound_to_image() {
        let hash = hash_secret("abc", "open sesame");
        assert_ne!(hash, hash_secret("abd", "open sesame"));
        assert!(!verify_secret("abd", "open sesame", &hash).unwrap());
    }

    #[test]
    fn test_malformed_hash() {
        assert!(matches!(
            verify_secret("abc", "x", "not-hex"),
            Err(SecretError::MalformedHash)
        ));
    }
}
