//! # Password-Derived Encryption
//!
//! AES-128-CBC keyed from a shared password.
//!
//! ```text
//! key = SHA-512(password || KEY_SALT)[..16]
//! iv  = FIXED_IV
//! ```
//!
//! A blank password never produces a [`Cipher`]; the session runs in plaintext
//! instead. That choice is made once per connect, not per packet.
//!
//! Objects are encrypted whole with PKCS#7 padding into an [`EncryptedEnvelope`].
//! Raw streams go through the block adapters in [`stream`].
//!
//! The IV is fixed so every peer sharing a password interoperates. Identical
//! plaintext prefixes encrypt to identical ciphertext prefixes across sessions.

pub mod stream;

use crate::config::{FIXED_IV, KEY_SALT};
use crate::core::packet::Packet;
use crate::error::{Result, SessionError};
use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha512};
use std::fmt;

pub use stream::{DecryptingReader, EncryptingWriter};

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Derived key length in bytes (128 bits)
pub const KEY_SIZE: usize = 16;

pub(crate) type Aes128CbcEnc = cbc::Encryptor<Aes128>;
pub(crate) type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Ciphertext of one serialized packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope(Vec<u8>);

impl EncryptedEnvelope {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Hash `password || salt` with SHA-512 and keep the first 16 bytes
pub fn derive_key(password: &str, salt: &str) -> [u8; KEY_SIZE] {
    let mut hasher = Sha512::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    let digest = hasher.finalize();

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&digest[..KEY_SIZE]);
    key
}

/// Encryption context of one connected session
#[derive(Clone)]
pub struct Cipher {
    key: [u8; KEY_SIZE],
    iv: [u8; BLOCK_SIZE],
}

impl Cipher {
    /// Build a context with explicit key material
    pub fn new(key: [u8; KEY_SIZE], iv: [u8; BLOCK_SIZE]) -> Self {
        Self { key, iv }
    }

    /// Derive a context from a password, or `None` when the password is blank
    pub fn from_password(password: &str) -> Option<Self> {
        if password.trim().is_empty() {
            return None;
        }
        Some(Self::new(derive_key(password, KEY_SALT), FIXED_IV))
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub(crate) fn encryptor(&self) -> Aes128CbcEnc {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
    }

    pub(crate) fn decryptor(&self) -> Aes128CbcDec {
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
    }

    /// Encrypt a byte buffer with PKCS#7 padding
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        self.encryptor().encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    /// Decrypt a PKCS#7 padded buffer
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(SessionError::DecryptionFailure(format!(
                "ciphertext length {} is not a positive multiple of {BLOCK_SIZE}",
                ciphertext.len()
            )));
        }
        self.decryptor()
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| SessionError::DecryptionFailure("invalid padding".into()))
    }

    /// Serialize and encrypt one packet
    pub fn encrypt_packet(&self, packet: &Packet) -> Result<EncryptedEnvelope> {
        let plaintext = bincode::serialize(packet)
            .map_err(|e| SessionError::EncryptionFailure(e.to_string()))?;
        Ok(EncryptedEnvelope(self.encrypt(&plaintext)))
    }

    /// Decrypt and deserialize one packet.
    ///
    /// A wrong key or corrupted envelope yields `DecryptionFailure`, never a panic.
    pub fn decrypt_packet(&self, envelope: &EncryptedEnvelope) -> Result<Packet> {
        let plaintext = self.decrypt(envelope.as_bytes())?;
        bincode::deserialize(&plaintext).map_err(|e| SessionError::DecryptionFailure(e.to_string()))
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}
