//! Connection passwords encrypted at rest.
//!
//! Stored form is `base64(nonce || ciphertext)` under AES-256-GCM, keyed by the
//! SHA-256 digest of the configured master key.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::errors::{AppError, Result};
use crate::models::DatabaseConnection;
use crate::store::DatabaseStore;

const NONCE_SIZE: usize = 12;

#[derive(Clone)]
pub struct CredentialCipher {
    key: Key<Aes256Gcm>,
}

impl CredentialCipher {
    pub fn new(master_key: &str) -> Self {
        let digest = Sha256::digest(master_key.as_bytes());
        CredentialCipher {
            key: *Key::<Aes256Gcm>::from_slice(&digest),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| AppError::Credentials(format!("encryption failed: {}", e)))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let sealed = BASE64
            .decode(stored.trim())
            .map_err(|e| AppError::Credentials(format!("invalid encoding: {}", e)))?;
        if sealed.len() < NONCE_SIZE {
            return Err(AppError::Credentials("ciphertext too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| AppError::Credentials(format!("decryption failed: {}", e)))?;
        String::from_utf8(plaintext)
            .map_err(|e| AppError::Credentials(format!("password is not UTF-8: {}", e)))
    }
}

/// [`DatabaseStore`] that hands out connections with decrypted passwords.
pub struct DecryptingDatabaseStore {
    inner: Arc<dyn DatabaseStore>,
    cipher: CredentialCipher,
}

impl DecryptingDatabaseStore {
    pub fn new(inner: Arc<dyn DatabaseStore>, cipher: CredentialCipher) -> Self {
        DecryptingDatabaseStore { inner, cipher }
    }
}

#[async_trait]
impl DatabaseStore for DecryptingDatabaseStore {
    async fn get_database(&self, id: i64) -> Result<Option<DatabaseConnection>> {
        let Some(mut database) = self.inner.get_database(id).await? else {
            return Ok(None);
        };
        // Passwordless connections are stored as an empty string.
        if !database.password.is_empty() {
            database.password = self.cipher.decrypt(&database.password)?;
        }
        Ok(Some(database))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::database;

    #[test]
    fn encrypted_password_decrypts_with_the_same_key_only() {
        let cipher = CredentialCipher::new("master key");
        let stored = cipher.encrypt("s3cret").unwrap();
        assert_ne!(stored, "s3cret");
        assert_ne!(stored, cipher.encrypt("s3cret").unwrap(), "nonce must vary");
        assert_eq!(cipher.decrypt(&stored).unwrap(), "s3cret");

        let other = CredentialCipher::new("another key");
        assert!(matches!(other.decrypt(&stored), Err(AppError::Credentials(_))));
        assert!(matches!(cipher.decrypt("not base64!"), Err(AppError::Credentials(_))));
        assert!(matches!(cipher.decrypt("AAAA"), Err(AppError::Credentials(_))));
    }

    #[tokio::test]
    async fn store_hands_out_plain_passwords() -> anyhow::Result<()> {
        let cipher = CredentialCipher::new("master key");
        let store = Arc::new(MemoryStore::new());
        let mut encrypted = database(1, 10, "postgresql");
        encrypted.password = cipher.encrypt("s3cret")?;
        store.add_database(encrypted);
        let mut passwordless = database(2, 10, "mysql");
        passwordless.password = String::new();
        store.add_database(passwordless);

        let decrypting = DecryptingDatabaseStore::new(store, cipher);
        assert_eq!(decrypting.get_database(1).await?.unwrap().password, "s3cret");
        assert_eq!(decrypting.get_database(2).await?.unwrap().password, "");
        assert!(decrypting.get_database(3).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn undecryptable_password_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        store.add_database(database(1, 10, "postgresql"));
        let decrypting = DecryptingDatabaseStore::new(store, CredentialCipher::new("master key"));
        assert!(matches!(
            decrypting.get_database(1).await,
            Err(AppError::Credentials(_))
        ));
    }
}
