use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use zeroize::Zeroize;

const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const CIPHERTEXT_TAG: &str = "v1";

/// Envelope encryption for stored task passwords. Callers only ever see the
/// `v1:<nonce>:<payload>` string form; key material stays inside.
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; KEY_BYTES],
}

impl SecretBox {
    pub fn new(key: [u8; KEY_BYTES]) -> Self {
        Self { key }
    }

    /// Reads the key file, creating it with fresh random material on first
    /// use.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read key file: {}", path.display()))?;
            let bytes = BASE64
                .decode(raw.trim())
                .with_context(|| format!("key file {} is not base64", path.display()))?;
            let key: [u8; KEY_BYTES] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("key file {} is not {} bytes", path.display(), KEY_BYTES))?;
            return Ok(Self::new(key));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create key dir: {}", parent.display()))?;
        }
        let key = random_bytes::<KEY_BYTES>();
        fs::write(path, BASE64.encode(key))
            .with_context(|| format!("failed to write key file: {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to restrict key file: {}", path.display()))?;
        }
        Ok(Self::new(key))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| anyhow!("invalid encryption key length"))?;
        let iv = random_bytes::<NONCE_BYTES>();
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("password encryption failed"))?;
        Ok(format!(
            "{CIPHERTEXT_TAG}:{}:{}",
            BASE64.encode(iv),
            BASE64.encode(ciphertext)
        ))
    }

    // Error messages stay generic here: the stored value or the plaintext
    // must never surface through the error chain.
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let mut parts = stored.splitn(3, ':');
        let (tag, iv, payload) = match (parts.next(), parts.next(), parts.next()) {
            (Some(tag), Some(iv), Some(payload)) => (tag, iv, payload),
            _ => return Err(anyhow!("stored password has an unknown format")),
        };
        if tag != CIPHERTEXT_TAG {
            return Err(anyhow!("stored password has an unknown version tag"));
        }
        let iv = BASE64
            .decode(iv)
            .map_err(|_| anyhow!("stored password is corrupt"))?;
        if iv.len() != NONCE_BYTES {
            return Err(anyhow!("stored password is corrupt"));
        }
        let payload = BASE64
            .decode(payload)
            .map_err(|_| anyhow!("stored password is corrupt"))?;
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| anyhow!("invalid encryption key length"))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), payload.as_ref())
            .map_err(|_| anyhow!("password decryption failed"))?;
        String::from_utf8(plaintext).map_err(|_| anyhow!("password decryption failed"))
    }
}

/// Recognizes the string form produced by `encrypt`.
pub fn looks_encrypted(value: &str) -> bool {
    let mut parts = value.splitn(3, ':');
    parts.next() == Some(CIPHERTEXT_TAG) && parts.next().is_some() && parts.next().is_some()
}

/// Zeroes and empties a plaintext buffer before it goes out of scope.
pub fn scrub(value: &mut String) {
    value.zeroize();
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_box() -> SecretBox {
        SecretBox::new([7u8; KEY_BYTES])
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let secrets = test_box();
        for plaintext in ["", "hunter2", "pa ss:wo'rd\"!", "päßwörd"] {
            let stored = secrets.encrypt(plaintext).unwrap();
            assert!(looks_encrypted(&stored));
            assert_eq!(secrets.decrypt(&stored).unwrap(), plaintext);
        }
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let secrets = test_box();
        let a = secrets.encrypt("same input").unwrap();
        let b = secrets.encrypt("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn plaintext_is_not_mistaken_for_ciphertext() {
        assert!(!looks_encrypted("hunter2"));
        assert!(!looks_encrypted("v1:onlyonecolon"));
        assert!(!looks_encrypted("v2:aaaa:bbbb"));
        assert!(looks_encrypted("v1:aaaa:bbbb"));
    }

    #[test]
    fn tampered_payload_fails_closed() {
        let secrets = test_box();
        let stored = secrets.encrypt("hunter2").unwrap();
        let mut tampered = stored.clone();
        tampered.pop();
        tampered.push('A');
        let err = secrets.decrypt(&tampered).unwrap_err();
        assert!(!err.to_string().contains("hunter2"));
    }

    #[test]
    fn wrong_key_fails() {
        let stored = test_box().encrypt("hunter2").unwrap();
        let other = SecretBox::new([9u8; KEY_BYTES]);
        assert!(other.decrypt(&stored).is_err());
    }

    #[test]
    fn key_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("secret.key");
        let first = SecretBox::load_or_init(&path).unwrap();
        let stored = first.encrypt("hunter2").unwrap();
        let second = SecretBox::load_or_init(&path).unwrap();
        assert_eq!(second.decrypt(&stored).unwrap(), "hunter2");
    }

    #[test]
    fn scrub_empties_the_buffer() {
        let mut value = "hunter2".to_string();
        scrub(&mut value);
        assert!(value.is_empty());
    }
}
