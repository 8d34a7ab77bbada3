//! WeChat cryptographic utilities
//!
//! Handles SHA1 signature verification and AES-256-CBC encryption/decryption
//! of the message envelope used by WeChat Official Accounts in safe mode.

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use base64::alphabet;
use base64::engine::general_purpose;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::config::ENCODING_AES_KEY_LEN;
use crate::error::{AdapterError, Result};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// WeChat pads plaintext to a multiple of 32 bytes, not the AES block size
const PAD_BLOCK_SIZE: usize = 32;
const AES_BLOCK_SIZE: usize = 16;
const RANDOM_PREFIX_LEN: usize = 16;
const HEADER_LEN: usize = RANDOM_PREFIX_LEN + 4;

/// Generated keys often carry non-zero trailing bits in the last character
const LENIENT_KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// WeChat cryptographic handler
#[derive(Clone)]
pub struct WechatCrypto {
    encoding_aes_key: [u8; 32], // Decoded 43-char base64 key = 32 bytes
    app_id: String,
}

impl std::fmt::Debug for WechatCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WechatCrypto")
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl WechatCrypto {
    /// Create from 43-character EncodingAESKey and AppID
    pub fn new(encoding_aes_key: &str, app_id: &str) -> Result<Self> {
        let encoding_aes_key = encoding_aes_key.trim();

        if encoding_aes_key.len() != ENCODING_AES_KEY_LEN {
            return Err(AdapterError::Configuration(format!(
                "EncodingAESKey must be {} characters, got {}",
                ENCODING_AES_KEY_LEN,
                encoding_aes_key.len()
            )));
        }

        let decoded = Self::decode_key(encoding_aes_key)?;

        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);

        Ok(Self {
            encoding_aes_key: key,
            app_id: app_id.to_string(),
        })
    }

    /// Decode the 43-character key by restoring the stripped '=' padding
    fn decode_key(key: &str) -> Result<Vec<u8>> {
        let padded = format!("{}=", key);

        let decoded = base64::Engine::decode(&LENIENT_KEY_ENGINE, &padded)
            .map_err(|e| AdapterError::Configuration(format!("Invalid EncodingAESKey: {}", e)))?;

        if decoded.len() != 32 {
            return Err(AdapterError::Configuration(format!(
                "Decoded EncodingAESKey to {} bytes, expected 32",
                decoded.len()
            )));
        }

        Ok(decoded)
    }

    /// Verify WeChat signature
    ///
    /// WeChat sends: signature = SHA1(sort(token, timestamp, nonce))
    pub fn verify(token: &str, timestamp: &str, nonce: &str, signature: &str) -> bool {
        let computed = Self::sign(token, timestamp, nonce);
        constant_time_eq(computed.as_bytes(), signature.trim().as_bytes())
    }

    /// Generate signature
    pub fn sign(token: &str, timestamp: &str, nonce: &str) -> String {
        sha1_of_sorted(&mut [token, timestamp, nonce])
    }

    /// Verify message signature (for encrypted messages)
    pub fn verify_message(
        token: &str,
        timestamp: &str,
        nonce: &str,
        encrypted_msg: &str,
        msg_signature: &str,
    ) -> bool {
        let computed = Self::sign_message(token, timestamp, nonce, encrypted_msg);
        constant_time_eq(computed.as_bytes(), msg_signature.trim().as_bytes())
    }

    /// Generate message signature over the encrypted payload
    pub fn sign_message(token: &str, timestamp: &str, nonce: &str, encrypted_msg: &str) -> String {
        sha1_of_sorted(&mut [token, timestamp, nonce, encrypted_msg])
    }

    /// Decrypt WeChat message
    ///
    /// Format: random(16) + msg_len(4) + msg + app_id + pad
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let encrypted_bytes = base64::Engine::decode(&general_purpose::STANDARD, encrypted.trim())
            .map_err(|e| {
                AdapterError::Decryption(format!("Failed to base64 decode payload: {}", e))
            })?;

        if encrypted_bytes.len() < PAD_BLOCK_SIZE || encrypted_bytes.len() % AES_BLOCK_SIZE != 0
        {
            return Err(AdapterError::Decryption(format!(
                "Invalid ciphertext length: {} bytes",
                encrypted_bytes.len()
            )));
        }

        // IV = first 16 bytes of the key
        let iv = &self.encoding_aes_key[..16];
        let cipher = Aes256CbcDec::new_from_slices(&self.encoding_aes_key, iv)
            .map_err(|e| AdapterError::Decryption(format!("Failed to create AES cipher: {}", e)))?;

        let mut buf = encrypted_bytes;
        let decrypted = cipher
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|e| AdapterError::Decryption(format!("AES decryption failed: {:?}", e)))?;

        let decrypted = strip_padding(decrypted)?;

        if decrypted.len() < HEADER_LEN {
            return Err(AdapterError::Decryption(format!(
                "Decrypted message too short: {} bytes",
                decrypted.len()
            )));
        }

        let msg_len = u32::from_be_bytes([
            decrypted[16],
            decrypted[17],
            decrypted[18],
            decrypted[19],
        ]) as usize;

        let msg_end = HEADER_LEN.saturating_add(msg_len);
        if msg_end > decrypted.len() {
            return Err(AdapterError::Decryption(format!(
                "Invalid message length: declared {} bytes but only have {} bytes",
                msg_len,
                decrypted.len() - HEADER_LEN
            )));
        }

        let msg = &decrypted[HEADER_LEN..msg_end];
        let app_id_in_msg = &decrypted[msg_end..];

        if app_id_in_msg != self.app_id.as_bytes() {
            return Err(AdapterError::Decryption(format!(
                "AppID mismatch in decrypted message: expected '{}', got '{}'",
                self.app_id,
                String::from_utf8_lossy(app_id_in_msg)
            )));
        }

        String::from_utf8(msg.to_vec())
            .map_err(|e| AdapterError::Decryption(format!("Message is not UTF-8: {}", e)))
    }

    /// Encrypt message for WeChat
    ///
    /// Format: random(16) + msg_len(4) + msg + app_id + pad
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut random_bytes = [0u8; RANDOM_PREFIX_LEN];
        rand::rng().fill_bytes(&mut random_bytes);
        self.encrypt_with_prefix(plaintext, &random_bytes)
    }

    fn encrypt_with_prefix(
        &self,
        plaintext: &str,
        random_bytes: &[u8; RANDOM_PREFIX_LEN],
    ) -> Result<String> {
        let msg_bytes = plaintext.as_bytes();
        let msg_len = u32::try_from(msg_bytes.len())
            .map_err(|_| AdapterError::Reply("Plaintext too large to encrypt".to_string()))?;
        let app_id_bytes = self.app_id.as_bytes();

        let mut buf = Vec::with_capacity(
            HEADER_LEN + msg_bytes.len() + app_id_bytes.len() + PAD_BLOCK_SIZE,
        );
        buf.extend_from_slice(random_bytes);
        buf.extend_from_slice(&msg_len.to_be_bytes());
        buf.extend_from_slice(msg_bytes);
        buf.extend_from_slice(app_id_bytes);

        let pad_len = PAD_BLOCK_SIZE - (buf.len() % PAD_BLOCK_SIZE);
        buf.extend(std::iter::repeat_n(pad_len as u8, pad_len));

        let iv = &self.encoding_aes_key[..16];
        let cipher = Aes256CbcEnc::new_from_slices(&self.encoding_aes_key, iv)
            .map_err(|e| AdapterError::Reply(format!("Failed to create AES cipher: {}", e)))?;

        let total_len = buf.len();
        let encrypted = cipher
            .encrypt_padded_mut::<NoPadding>(&mut buf, total_len)
            .map_err(|_| AdapterError::Reply("Failed to encrypt message".to_string()))?;

        Ok(base64::Engine::encode(&general_purpose::STANDARD, encrypted))
    }

}

fn sha1_of_sorted(parts: &mut [&str]) -> String {
    parts.sort_unstable();
    let hash = Sha1::digest(parts.concat().as_bytes());
    hex::encode(hash)
}

/// Remove WeChat's PKCS#7-style padding (block size 32)
fn strip_padding(input: &[u8]) -> Result<&[u8]> {
    let Some(&last) = input.last() else {
        return Err(AdapterError::Decryption("Empty plaintext".to_string()));
    };
    let pad_len = last as usize;
    if pad_len == 0 || pad_len > PAD_BLOCK_SIZE || pad_len > input.len() {
        return Err(AdapterError::Decryption(format!(
            "Invalid padding length: {}",
            pad_len
        )));
    }
    let (body, pad) = input.split_at(input.len() - pad_len);
    if pad.iter().any(|&b| b != last) {
        return Err(AdapterError::Decryption("Corrupted padding".to_string()));
    }
    Ok(body)
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut mismatch = 0u8;
    for (l, r) in left.iter().zip(right.iter()) {
        mismatch |= l ^ r;
    }
    mismatch == 0
}
