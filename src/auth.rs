use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use std::fmt;
use std::sync::Arc;

/// Пара учётных данных для REST API удалённого хранилища
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Sent as the `apikey` header
    pub api_key: String,
    /// Bearer token; falls back to `api_key` for anonymous access
    pub access_token: Option<String>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            access_token: None,
        }
    }

    pub fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }
}

// Ключи не должны попадать в логи через {:?}
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Менеджер учётных данных для синхронизации.
/// Ключ приходит из конфигурации; access token меняется при входе/выходе пользователя.
pub struct CredentialManager {
    credentials: Arc<tokio::sync::RwLock<Option<Credentials>>>,
}

impl CredentialManager {
    pub fn new(credentials: Option<Credentials>) -> Self {
        Self {
            credentials: Arc::new(tokio::sync::RwLock::new(credentials)),
        }
    }

    /// Заменить учётные данные целиком (None = выход)
    pub async fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.credentials.write().await = credentials;
    }

    /// Обновить только пользовательский токен, сохранив api key
    pub async fn set_access_token(&self, access_token: Option<String>) {
        if let Some(creds) = self.credentials.write().await.as_mut() {
            creds.access_token = access_token;
        }
    }

    /// Получить учётные данные; пустой api key считается отсутствующим
    pub async fn get_credentials(&self) -> Result<Credentials, String> {
        match self.credentials.read().await.clone() {
            Some(creds) if !creds.api_key.trim().is_empty() => Ok(creds),
            _ => Err("Remote credentials not configured".to_string()),
        }
    }
}

// ============================================
// SNAPSHOT ENCRYPTION
// ============================================

const NONCE_LEN: usize = 12;

/// Шифрование снимка очереди перед сохранением в SQLite (AES-256-GCM).
/// Формат: base64(nonce || ciphertext).
pub struct SnapshotEncryption {
    cipher: Aes256Gcm,
}

impl SnapshotEncryption {
    pub fn from_key(key: &[u8]) -> Result<Self, String> {
        let key_array: [u8; 32] = key
            .try_into()
            .map_err(|_| "Encryption key must be 32 bytes".to_string())?;
        Ok(Self {
            cipher: Aes256Gcm::new(&key_array.into()),
        })
    }

    /// Ключ в hex (64 символа), как он лежит в переменной окружения
    pub fn from_hex(hex_key: &str) -> Result<Self, String> {
        let key = hex::decode(hex_key.trim())
            .map_err(|e| format!("Encryption key is not valid hex: {}", e))?;
        Self::from_key(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| format!("Encryption failed: {}", e))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(&result))
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, String> {
        let data = general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| format!("Base64 decode failed: {}", e))?;

        if data.len() < NONCE_LEN {
            return Err("Invalid encrypted data length".to_string());
        }

        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        let plaintext = self
            .cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|e| format!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).map_err(|e| format!("UTF-8 decode failed: {}", e))
    }

    /// Расшифровать значение; если это открытый JSON, записанный до включения
    /// шифрования, вернуть его как есть. Второй элемент = нужна перезапись.
    pub fn decrypt_with_legacy_fallback(&self, stored: &str) -> Result<(String, bool), String> {
        match self.decrypt(stored) {
            Ok(plaintext) => Ok((plaintext, false)),
            Err(e) => {
                if serde_json::from_str::<serde_json::Value>(stored).is_ok() {
                    Ok((stored.to_string(), true))
                } else {
                    Err(e)
                }
            }
        }
    }
}
