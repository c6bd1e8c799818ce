//! Authenticated encryption of token records at rest.
//!
//! AES-256-CTR for confidentiality with an encrypt-then-MAC HMAC-SHA256 tag.
//! Both subkeys are derived from the caller's key material with distinct
//! labels, so the raw secret never keys a primitive directly.
//!
//! Sealed layout: `version(1) || nonce(16) || ciphertext || tag(32)`.

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::error::{TokenError, TokenResult};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 32;
const HEADER_LEN: usize = 1 + NONCE_LEN;

const LABEL_ENCRYPTION: &[u8] = b"token-keeper/v1/encryption";
const LABEL_AUTHENTICATION: &[u8] = b"token-keeper/v1/authentication";

/// Symmetric cipher keyed once at construction.
#[derive(Clone)]
pub struct TokenCipher {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher { .. }")
    }
}

impl TokenCipher {
    /// Derive the cipher from secret key material (a dedicated key or the
    /// client secret).
    pub fn new(key_material: &[u8]) -> TokenResult<Self> {
        if key_material.is_empty() {
            return Err(TokenError::InvalidInput(
                "encryption key material is empty".into(),
            ));
        }
        Ok(Self {
            enc_key: derive_key(key_material, LABEL_ENCRYPTION)?,
            mac_key: derive_key(key_material, LABEL_AUTHENTICATION)?,
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> TokenResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce)
            .map_err(|e| TokenError::Storage(format!("OS CSPRNG failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(HEADER_LEN + plaintext.len() + TAG_LEN);
        sealed.push(FORMAT_VERSION);
        sealed.extend_from_slice(&nonce);

        let mut body = plaintext.to_vec();
        let mut cipher = Aes256Ctr::new((&self.enc_key).into(), (&nonce).into());
        cipher.apply_keystream(&mut body);
        sealed.extend_from_slice(&body);

        let tag = self.mac()?.chain_update(&sealed).finalize().into_bytes();
        sealed.extend_from_slice(&tag);
        Ok(sealed)
    }

    /// Verify and decrypt. Never returns plaintext for a wrong key or
    /// modified ciphertext.
    pub fn decrypt(&self, sealed: &[u8]) -> TokenResult<Vec<u8>> {
        if sealed.len() < HEADER_LEN + TAG_LEN {
            return Err(TokenError::Decryption("ciphertext too short".into()));
        }
        if sealed[0] != FORMAT_VERSION {
            return Err(TokenError::Decryption(format!(
                "unsupported format version {}",
                sealed[0]
            )));
        }

        let tag_offset = sealed.len() - TAG_LEN;
        let (authenticated, tag) = sealed.split_at(tag_offset);
        self.mac()?
            .chain_update(authenticated)
            .verify_slice(tag)
            .map_err(|_| TokenError::Decryption("authentication tag mismatch".into()))?;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[1..HEADER_LEN]);
        let mut body = sealed[HEADER_LEN..tag_offset].to_vec();
        let mut cipher = Aes256Ctr::new((&self.enc_key).into(), (&nonce).into());
        cipher.apply_keystream(&mut body);
        Ok(body)
    }

    fn mac(&self) -> TokenResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|e| TokenError::InvalidInput(format!("invalid MAC key: {}", e)))
    }
}

fn derive_key(material: &[u8], label: &[u8]) -> TokenResult<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(material)
        .map_err(|e| TokenError::InvalidInput(format!("invalid key material: {}", e)))?;
    mac.update(label);
    let mut key = [0u8; 32];
    key.copy_from_slice(&mac.finalize().into_bytes());
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cipher = TokenCipher::new(b"client-secret").unwrap();
        let plaintext = br#"{"access_token":"Atza|abc"}"#;

        let sealed = cipher.encrypt(plaintext).unwrap();
        assert_eq!(sealed.len(), HEADER_LEN + plaintext.len() + TAG_LEN);
        assert_ne!(&sealed[HEADER_LEN..HEADER_LEN + plaintext.len()], plaintext);

        assert_eq!(cipher.decrypt(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_nonce_is_fresh_per_encryption() {
        let cipher = TokenCipher::new(b"k").unwrap();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = TokenCipher::new(b"right").unwrap().encrypt(b"secret").unwrap();
        let err = TokenCipher::new(b"wrong").unwrap().decrypt(&sealed).unwrap_err();
        assert!(matches!(err, TokenError::Decryption(_)));
    }

    #[test]
    fn test_tampering_detected() {
        let cipher = TokenCipher::new(b"k").unwrap();
        let mut sealed = cipher.encrypt(b"refresh-token-material").unwrap();
        sealed[HEADER_LEN + 2] ^= 0x01;
        assert!(cipher.decrypt(&sealed).is_err());

        let mut sealed = cipher.encrypt(b"refresh-token-material").unwrap();
        let len = sealed.len();
        sealed[len - 1] ^= 0xFF;
        assert!(cipher.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_truncated_input() {
        let cipher = TokenCipher::new(b"k").unwrap();
        let sealed = cipher.encrypt(b"data").unwrap();
        assert!(cipher.decrypt(&sealed[..10]).is_err());
        assert!(cipher.decrypt(&sealed[..sealed.len() - 1]).is_err());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(TokenCipher::new(b"").is_err());
    }
}
