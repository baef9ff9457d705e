use crate::error::{OdsError, Result};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use rand::rngs::OsRng;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;

/// AES-256 in CBC mode with PKCS#7 padding.
///
/// Output layout is `base64(ciphertext || iv)`: the IV is freshly drawn from
/// the OS RNG on every call and travels as the trailing 16 bytes.
#[derive(Clone)]
pub struct AesCipher {
    key: [u8; KEY_SIZE],
}

impl AesCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; KEY_SIZE] = key.try_into().map_err(|_| {
            OdsError::Config(format!(
                "cipher key must be {} bytes, got {}",
                KEY_SIZE,
                key.len()
            ))
        })?;
        Ok(Self { key })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let encryptor = Aes256CbcEnc::new_from_slices(&self.key, &iv)
            .map_err(|error| OdsError::Cipher(error.to_string()))?;
        let mut raw = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        raw.extend_from_slice(&iv);

        Ok(STANDARD.encode(raw))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|error| OdsError::Cipher(format!("invalid base64: {}", error)))?;

        if raw.len() < IV_SIZE * 2 || raw.len() % IV_SIZE != 0 {
            return Err(OdsError::Cipher(format!(
                "ciphertext has invalid length {}",
                raw.len()
            )));
        }

        let (cipher_text, iv) = raw.split_at(raw.len() - IV_SIZE);
        let decryptor = Aes256CbcDec::new_from_slices(&self.key, iv)
            .map_err(|error| OdsError::Cipher(error.to_string()))?;

        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(cipher_text)
            .map_err(|_| OdsError::Cipher("decryption failed: bad key or corrupted data".to_string()))
    }

    pub fn decrypt_string(&self, encoded: &str) -> Result<String> {
        let bytes = self.decrypt(encoded)?;
        String::from_utf8(bytes)
            .map_err(|_| OdsError::Cipher("decrypted data is not valid UTF-8".to_string()))
    }
}

impl std::fmt::Debug for AesCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AesCipher(<redacted>)")
    }
}
