use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use std::fs;
use std::path::Path;

use crate::error::{AppError, AppResult};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const KEY_FILE_NAME: &str = ".encryption.key";
const KEY_ENV_VAR: &str = "QUOTIO_ENCRYPTION_KEY";

// Master key for secret fields at rest. Resolved once at startup:
// environment variable, then key file, then freshly generated and persisted.
#[derive(Clone)]
pub struct MasterKey {
    key: [u8; KEY_LEN],
}

impl MasterKey {
    pub fn load(data_dir: &Path) -> AppResult<Self> {
        if let Ok(encoded) = std::env::var(KEY_ENV_VAR) {
            if !encoded.trim().is_empty() {
                return Self::from_base64(encoded.trim()).map_err(|e| {
                    AppError::Crypto(format!("invalid {} value: {}", KEY_ENV_VAR, e))
                });
            }
        }

        let key_path = data_dir.join(KEY_FILE_NAME);
        if key_path.exists() {
            let encoded = fs::read_to_string(&key_path)?;
            return Self::from_base64(encoded.trim())
                .map_err(|e| AppError::Crypto(format!("invalid key file {:?}: {}", key_path, e)));
        }

        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        let encoded = general_purpose::STANDARD.encode(key);
        fs::create_dir_all(data_dir)?;
        fs::write(&key_path, &encoded)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&key_path, fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!("Generated new encryption key at {:?}", key_path);
        Ok(Self { key })
    }

    fn from_base64(encoded: &str) -> Result<Self, String> {
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| format!("base64 decode failed: {}", e))?;
        if decoded.len() != KEY_LEN {
            return Err(format!("key must be {} bytes, got {}", KEY_LEN, decoded.len()));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&decoded);
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let cipher = Aes256Gcm::new(&self.key.into());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| AppError::Crypto(format!("encryption failed: {}", e)))?;

        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(packed))
    }

    // Decrypts base64(nonce || ciphertext). Any failure (bad base64, short
    // input, bad auth tag) returns the input unchanged so rows written before
    // encryption was introduced keep loading.
    pub fn decrypt(&self, stored: &str) -> String {
        if stored.is_empty() {
            return String::new();
        }

        let decoded = match general_purpose::STANDARD.decode(stored) {
            Ok(d) => d,
            Err(_) => return stored.to_string(),
        };
        if decoded.len() <= NONCE_LEN {
            return stored.to_string();
        }

        let cipher = Aes256Gcm::new(&self.key.into());
        let (nonce_bytes, ciphertext) = decoded.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        match cipher.decrypt(nonce, ciphertext) {
            Ok(plaintext) => String::from_utf8(plaintext).unwrap_or_else(|_| stored.to_string()),
            Err(_) => stored.to_string(),
        }
    }
}
