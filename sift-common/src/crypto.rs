//! Fernet wrapper for the pipeline's sensitive fields.
//!
//! Staging columns and task payloads only ever carry the token strings this
//! module produces; plaintext lives in worker memory during processing.

use fernet::{Fernet, MultiFernet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("no valid fernet key found in configuration")]
    NoValidKeys,
    #[error("failed to decrypt token")]
    DecryptError,
    #[error("decrypted payload is not valid utf-8")]
    Utf8Error(#[from] std::string::FromUtf8Error),
}

/// Encrypts and decrypts string fields with a set of rotating fernet keys.
/// Encryption always uses the first key; decryption tries all of them.
#[derive(Clone)]
pub struct TokenCipher {
    fernet: MultiFernet,
}

impl TokenCipher {
    /// Build from a comma-separated list of base64-urlsafe 32-byte keys.
    pub fn from_keys(keys: &str) -> Result<Self, CryptoError> {
        let fernets: Vec<_> = keys
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .filter_map(Fernet::new)
            .collect();

        if fernets.is_empty() {
            return Err(CryptoError::NoValidKeys);
        }

        Ok(Self {
            fernet: MultiFernet::new(fernets),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        self.fernet.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt(&self, token: &str) -> Result<String, CryptoError> {
        let decrypted = self
            .fernet
            .decrypt(token)
            .map_err(|_| CryptoError::DecryptError)?;

        Ok(String::from_utf8(decrypted)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let key = Fernet::generate_key();
        let cipher = TokenCipher::from_keys(&key).unwrap();

        for plaintext in ["", "user-42", "Subject: Application received for Software Engineer"] {
            let token = cipher.encrypt(plaintext);
            assert_ne!(token, plaintext);
            assert_eq!(cipher.decrypt(&token).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_decrypts_with_rotated_keys() {
        let old_key = Fernet::generate_key();
        let new_key = Fernet::generate_key();

        let old_cipher = TokenCipher::from_keys(&old_key).unwrap();
        let token = old_cipher.encrypt("hello");

        let rotated = TokenCipher::from_keys(&format!("{},{}", new_key, old_key)).unwrap();
        assert_eq!(rotated.decrypt(&token).unwrap(), "hello");
    }

    #[test]
    fn test_rejects_garbage() {
        let cipher = TokenCipher::from_keys(&Fernet::generate_key()).unwrap();
        assert!(cipher.decrypt("not-a-token").is_err());
        assert!(TokenCipher::from_keys("").is_err());
    }
}
