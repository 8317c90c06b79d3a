use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;
use serde_json::Value;
use tracing::warn;

const ENVELOPE_PREFIX: &str = "enc:v1:";
pub(crate) const REDACTED: &str = "********";

#[derive(Debug, thiserror::Error)]
pub(crate) enum SecretError {
    #[error("secret key must be 32 bytes of base64, got {0} bytes")]
    KeyLength(usize),
    #[error("secret key is not valid base64")]
    KeyEncoding,
    #[error("secret envelope is invalid")]
    Envelope,
    #[error("secret was sealed with key `{found}`, active key is `{active}`")]
    KeyMismatch { found: String, active: String },
    #[error("secret cipher failure: {0}")]
    Cipher(String),
}

/// Seals secret configuration values before they are persisted or logged.
#[derive(Clone)]
pub(crate) struct SecretCipher {
    key_id: String,
    key: [u8; 32],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl SecretCipher {
    pub fn from_base64(encoded: &str, key_id: impl Into<String>) -> Result<Self, SecretError> {
        let trimmed = encoded.trim();
        let bytes = URL_SAFE_NO_PAD
            .decode(trimmed.as_bytes())
            .or_else(|_| STANDARD.decode(trimmed.as_bytes()))
            .map_err(|_| SecretError::KeyEncoding)?;
        if bytes.len() != 32 {
            return Err(SecretError::KeyLength(bytes.len()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self {
            key_id: key_id.into(),
            key,
        })
    }

    /// Random key that lives as long as the process.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self {
            key_id: "ephemeral".to_string(),
            key,
        }
    }

    pub fn from_settings(key: Option<&str>, key_id: &str) -> Result<Self, SecretError> {
        match key.map(str::trim).filter(|value| !value.is_empty()) {
            Some(encoded) => Self::from_base64(encoded, key_id),
            None => {
                warn!(
                    target: "fleet::secrets",
                    "no secret key configured; using an ephemeral key, sealed values will not survive a restart"
                );
                Ok(Self::ephemeral())
            }
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(ENVELOPE_PREFIX)
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, SecretError> {
        if Self::is_sealed(plaintext) {
            return Ok(plaintext.to_string());
        }
        let mut nonce_bytes = [0u8; 12];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let aead = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|err| SecretError::Cipher(err.to_string()))?;
        let ciphertext = aead
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|err| SecretError::Cipher(err.to_string()))?;
        Ok(format!(
            "{ENVELOPE_PREFIX}{}:{}:{}",
            self.key_id,
            URL_SAFE_NO_PAD.encode(nonce_bytes),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    pub fn open(&self, sealed: &str) -> Result<String, SecretError> {
        let rest = sealed
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or(SecretError::Envelope)?;
        let mut parts = rest.split(':');
        let (Some(key_id), Some(nonce_b64), Some(ciphertext_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SecretError::Envelope);
        };
        if key_id != self.key_id {
            return Err(SecretError::KeyMismatch {
                found: key_id.to_string(),
                active: self.key_id.clone(),
            });
        }
        let nonce = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|_| SecretError::Envelope)?;
        if nonce.len() != 12 {
            return Err(SecretError::Envelope);
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64)
            .map_err(|_| SecretError::Envelope)?;
        let aead = ChaCha20Poly1305::new_from_slice(&self.key)
            .map_err(|err| SecretError::Cipher(err.to_string()))?;
        let plaintext = aead
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|err| SecretError::Cipher(err.to_string()))?;
        String::from_utf8(plaintext).map_err(|_| SecretError::Envelope)
    }

    /// Secret values are sealed as their JSON text so non-string secrets
    /// round-trip too.
    pub fn seal_value(&self, value: &Value) -> Result<Value, SecretError> {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(Value::String(self.seal(&text)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixed_cipher() -> SecretCipher {
        SecretCipher::from_base64(&STANDARD.encode([7u8; 32]), "test").expect("cipher")
    }

    #[test]
    fn sealed_values_open_back_to_plaintext() {
        let cipher = fixed_cipher();
        let sealed = cipher.seal("hunter2").expect("seal");
        assert!(SecretCipher::is_sealed(&sealed));
        assert!(!sealed.contains("hunter2"));
        assert_eq!(cipher.open(&sealed).expect("open"), "hunter2");
    }

    #[test]
    fn sealing_twice_is_a_no_op() {
        let cipher = fixed_cipher();
        let sealed = cipher.seal("token").expect("seal");
        assert_eq!(cipher.seal(&sealed).expect("reseal"), sealed);
    }

    #[test]
    fn nonces_differ_between_seals() {
        let cipher = fixed_cipher();
        assert_ne!(
            cipher.seal("same").expect("a"),
            cipher.seal("same").expect("b")
        );
    }

    #[test]
    fn opening_with_another_key_id_fails() {
        let sealed = fixed_cipher().seal("x").expect("seal");
        let other = SecretCipher::from_base64(&STANDARD.encode([9u8; 32]), "rotated")
            .expect("cipher");
        assert!(matches!(
            other.open(&sealed),
            Err(SecretError::KeyMismatch { .. })
        ));
    }

    #[test]
    fn short_keys_are_rejected() {
        let err = SecretCipher::from_base64(&STANDARD.encode([1u8; 16]), "v1").expect_err("short");
        assert!(matches!(err, SecretError::KeyLength(16)));
    }

    #[test]
    fn non_string_secrets_are_sealed_as_json_text() {
        let cipher = fixed_cipher();
        let sealed = cipher.seal_value(&json!(1234)).expect("seal");
        let text = sealed.as_str().expect("string envelope");
        assert_eq!(cipher.open(text).expect("open"), "1234");
    }
}
