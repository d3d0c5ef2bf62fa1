//! # nkeys
//!
//! NKey handling for NATS authentication: base32-encoded Ed25519 key
//! material with a prefix byte and CRC-16/ARC checksum. Seeds begin
//! with `S`, user public keys with `U`. Also parses the PEM-like
//! credentials (`.creds`) file format carrying a user JWT and seed.

use ed25519_dalek::{Signer, SigningKey};
use thiserror::Error;

mod crc;
pub mod creds;

pub use crc::crc16;
pub use creds::{load_creds, parse_creds, Creds};

/// Errors raised while decoding or using NKey material.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NKeyError {
    /// Seed string failed decoding or validation.
    #[error("invalid seed: {reason}")]
    InvalidSeed { reason: String },

    /// The nonce to sign is unusable.
    #[error("invalid nonce")]
    InvalidNonce,

    /// The signing operation itself failed.
    #[error("signing failed: {reason}")]
    SigningFailed { reason: String },
}

fn invalid_seed(reason: impl Into<String>) -> NKeyError {
    NKeyError::InvalidSeed {
        reason: reason.into(),
    }
}

/// RFC-4648 upper-case alphabet, no padding; the NKey wire alphabet.
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Prefix value 18, `S` once shifted into the top bits.
const PREFIX_SEED: u8 = 18 << 3;
/// Prefix value 20, `U` once shifted into the top bits.
const PREFIX_USER: u8 = 20 << 3;

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &byte in data {
        acc = (acc << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((acc >> bits) & 0x1F) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((acc << (5 - bits)) & 0x1F) as usize] as char);
    }
    out
}

fn base32_decode(text: &str) -> Result<Vec<u8>, NKeyError> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for ch in text.bytes() {
        let value = match ch {
            b'A'..=b'Z' => ch - b'A',
            b'2'..=b'7' => ch - b'2' + 26,
            _ => return Err(invalid_seed(format!("invalid base32 character '{}'", ch as char))),
        };
        acc = (acc << 5) | u32::from(value);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((acc >> bits) & 0xFF) as u8);
        }
    }
    Ok(out)
}

/// Append the CRC and base32-encode.
fn encode_with_crc(raw: &[u8]) -> String {
    let mut buf = raw.to_vec();
    buf.extend_from_slice(&crc16(raw).to_le_bytes());
    base32_encode(&buf)
}

/// Base32-decode, verify and strip the trailing CRC.
fn decode_with_crc(text: &str) -> Result<Vec<u8>, NKeyError> {
    let mut raw = base32_decode(text)?;
    if raw.len() < 4 {
        return Err(invalid_seed("encoded key too short"));
    }
    let crc_bytes = raw.split_off(raw.len() - 2);
    let expected = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    if crc16(&raw) != expected {
        return Err(invalid_seed("checksum mismatch"));
    }
    Ok(raw)
}

/// An Ed25519 key pair held in NKey form.
pub struct KeyPair {
    signing: SigningKey,
    public_prefix: u8,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key material
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Decode a seed string (`S...`) into a key pair.
    ///
    /// Seed layout after base32/CRC stripping: two packed prefix bytes
    /// (seed prefix plus the public-key prefix) followed by the 32-byte
    /// Ed25519 secret.
    pub fn from_seed(seed: &str) -> Result<Self, NKeyError> {
        let raw = decode_with_crc(seed.trim())?;
        if raw.len() < 2 {
            return Err(invalid_seed("missing prefix bytes"));
        }
        if raw[0] & 0xF8 != PREFIX_SEED {
            return Err(invalid_seed("not a seed (expected 'S' prefix)"));
        }
        let public_prefix = ((raw[0] & 0x07) << 5) | (raw[1] >> 3);
        let secret: [u8; 32] = raw[2..]
            .try_into()
            .map_err(|_| invalid_seed(format!("seed payload must be 32 bytes, got {}", raw.len() - 2)))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&secret),
            public_prefix,
        })
    }

    /// Generate a fresh user key pair.
    pub fn generate_user() -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        Self {
            signing,
            public_prefix: PREFIX_USER,
        }
    }

    /// The seed string (`SU...` for user keys).
    pub fn seed(&self) -> String {
        let mut raw = Vec::with_capacity(34);
        raw.push(PREFIX_SEED | (self.public_prefix >> 5));
        raw.push((self.public_prefix & 0x1F) << 3);
        raw.extend_from_slice(self.signing.to_bytes().as_slice());
        encode_with_crc(&raw)
    }

    /// The public NKey string (`U...` for user keys).
    pub fn public_key(&self) -> String {
        let mut raw = Vec::with_capacity(33);
        raw.push(self.public_prefix);
        raw.extend_from_slice(self.signing.verifying_key().as_bytes());
        encode_with_crc(&raw)
    }

    /// Sign a server nonce; returns the 64-byte Ed25519 signature.
    pub fn sign(&self, nonce: &[u8]) -> Result<[u8; 64], NKeyError> {
        if nonce.is_empty() {
            return Err(NKeyError::InvalidNonce);
        }
        let signature = self
            .signing
            .try_sign(nonce)
            .map_err(|e| NKeyError::SigningFailed {
                reason: e.to_string(),
            })?;
        Ok(signature.to_bytes())
    }
}
