//! Cryptographic primitives used by the license container.
//!
//! - SHA-256 digests
//! - AES-256-GCM encryption with a random 96-bit nonce per call, laid out as
//!   `nonce || ciphertext`
//! - Ed25519 signatures over digests
//! - Argon2id passphrase key derivation with a random salt
//!
//! Symmetric key material comes in two shapes that are told apart by length:
//! a raw 32-byte key (simple mode) or a 16-byte salt that must be combined
//! with a passphrase (passphrase mode).

use aes_gcm::{
  Aes256Gcm, Nonce,
  aead::{Aead, KeyInit},
};
use argon2::{Algorithm, Argon2, Params, Version};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const SALT_SIZE: usize = 16;
pub const DIGEST_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum CryptoError {
  #[error("{0} must not be empty")]
  EmptyInput(&'static str),

  #[error("invalid key: {0}")]
  InvalidKey(String),

  #[error("encryption failed")]
  Encryption,

  #[error("decryption failed (wrong key or tampered data)")]
  Decryption,

  #[error("key derivation failed: {0}")]
  KeyDerivation(String),

  #[error("signature error: {0}")]
  Signature(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

fn ensure_not_empty(data: &[u8], what: &'static str) -> CryptoResult<()> {
  if data.is_empty() {
    return Err(CryptoError::EmptyInput(what));
  }
  Ok(())
}

fn random_bytes<const N: usize>() -> [u8; N] {
  let mut bytes = [0u8; N];
  OsRng.fill_bytes(&mut bytes);
  bytes
}

/// 256-bit symmetric key, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
  bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
  pub fn random() -> Self {
    Self { bytes: random_bytes() }
  }

  pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
    let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
      CryptoError::InvalidKey(format!(
        "expected {KEY_SIZE} bytes, got {}",
        bytes.len()
      ))
    })?;
    Ok(Self { bytes })
  }

  pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
    &self.bytes
  }
}

impl std::fmt::Debug for SymmetricKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SymmetricKey").field("bytes", &"[REDACTED]").finish()
  }
}

/// How the symmetric key of a container is obtained on read.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
  /// The key itself travels with the ciphertext.
  Raw(SymmetricKey),
  /// Only the salt travels; the key is re-derived from a passphrase.
  Salted([u8; SALT_SIZE]),
}

impl KeyMaterial {
  pub fn to_bytes(&self) -> Vec<u8> {
    match self {
      KeyMaterial::Raw(key) => key.as_bytes().to_vec(),
      KeyMaterial::Salted(salt) => salt.to_vec(),
    }
  }

  pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
    match bytes.len() {
      KEY_SIZE => Ok(KeyMaterial::Raw(SymmetricKey::from_slice(bytes)?)),
      SALT_SIZE => {
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(bytes);
        Ok(KeyMaterial::Salted(salt))
      }
      0 => Err(CryptoError::EmptyInput("key material")),
      len => Err(CryptoError::InvalidKey(format!(
        "key material of {len} bytes is neither a key nor a salt"
      ))),
    }
  }

  /// Resolves the material into a usable key.
  pub fn resolve(&self, passphrase: Option<&str>) -> CryptoResult<SymmetricKey> {
    match (self, passphrase) {
      (KeyMaterial::Raw(key), _) => Ok(key.clone()),
      (KeyMaterial::Salted(salt), Some(passphrase)) => {
        derive_key(passphrase, salt)
      }
      (KeyMaterial::Salted(_), None) => {
        Err(CryptoError::InvalidKey("passphrase required".into()))
      }
    }
  }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone)]
pub struct KdfParams {
  /// Memory cost in KiB.
  pub memory_cost: u32,
  pub time_cost: u32,
  pub parallelism: u32,
}

impl Default for KdfParams {
  fn default() -> Self {
    Self { memory_cost: 19 * 1024, time_cost: 2, parallelism: 1 }
  }
}

pub fn hash(data: &[u8]) -> CryptoResult<[u8; DIGEST_SIZE]> {
  ensure_not_empty(data, "data")?;
  Ok(Sha256::digest(data).into())
}

pub fn generate_salt() -> [u8; SALT_SIZE] {
  random_bytes()
}

pub fn derive_key(
  passphrase: &str,
  salt: &[u8; SALT_SIZE],
) -> CryptoResult<SymmetricKey> {
  derive_key_with(passphrase, salt, &KdfParams::default())
}

pub fn derive_key_with(
  passphrase: &str,
  salt: &[u8; SALT_SIZE],
  params: &KdfParams,
) -> CryptoResult<SymmetricKey> {
  ensure_not_empty(passphrase.as_bytes(), "passphrase")?;

  let params = Params::new(
    params.memory_cost,
    params.time_cost,
    params.parallelism,
    Some(KEY_SIZE),
  )
  .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

  let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

  let mut bytes = [0u8; KEY_SIZE];
  argon2
    .hash_password_into(passphrase.as_bytes(), salt, &mut bytes)
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

  let key = SymmetricKey { bytes };
  bytes.zeroize();
  Ok(key)
}

/// Encrypts `data`, returning `nonce || ciphertext`.
pub fn encrypt(data: &[u8], key: &SymmetricKey) -> CryptoResult<Vec<u8>> {
  ensure_not_empty(data, "data")?;

  let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

  let nonce: [u8; NONCE_SIZE] = random_bytes();
  let ciphertext = cipher
    .encrypt(Nonce::from_slice(&nonce), data)
    .map_err(|_| CryptoError::Encryption)?;

  let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
  out.extend_from_slice(&nonce);
  out.extend_from_slice(&ciphertext);
  Ok(out)
}

/// Reverses [`encrypt`].
pub fn decrypt(data: &[u8], key: &SymmetricKey) -> CryptoResult<Vec<u8>> {
  ensure_not_empty(data, "data")?;
  if data.len() <= NONCE_SIZE {
    return Err(CryptoError::Decryption);
  }

  let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

  let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
  cipher
    .decrypt(Nonce::from_slice(nonce), ciphertext)
    .map_err(|_| CryptoError::Decryption)
}

pub fn generate_keypair() -> (SigningKey, VerifyingKey) {
  let mut seed: [u8; 32] = random_bytes();
  let signing = SigningKey::from_bytes(&seed);
  seed.zeroize();
  let verifying = signing.verifying_key();
  (signing, verifying)
}

pub fn signing_key(bytes: &[u8]) -> CryptoResult<SigningKey> {
  ensure_not_empty(bytes, "private key")?;
  let seed: [u8; 32] = bytes.try_into().map_err(|_| {
    CryptoError::InvalidKey(format!(
      "private key must be 32 bytes, got {}",
      bytes.len()
    ))
  })?;
  Ok(SigningKey::from_bytes(&seed))
}

pub fn verifying_key(bytes: &[u8]) -> CryptoResult<VerifyingKey> {
  ensure_not_empty(bytes, "public key")?;
  let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
    CryptoError::InvalidKey(format!(
      "public key must be 32 bytes, got {}",
      bytes.len()
    ))
  })?;
  VerifyingKey::from_bytes(&bytes)
    .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

pub fn sign(digest: &[u8], key: &SigningKey) -> CryptoResult<Vec<u8>> {
  ensure_not_empty(digest, "digest")?;
  Ok(key.sign(digest).to_bytes().to_vec())
}

/// Returns `Ok(false)` for a well-formed but wrong signature.
pub fn verify(
  digest: &[u8],
  signature: &[u8],
  key: &VerifyingKey,
) -> CryptoResult<bool> {
  ensure_not_empty(digest, "digest")?;
  ensure_not_empty(signature, "signature")?;

  let signature = Signature::from_slice(signature)
    .map_err(|e| CryptoError::Signature(e.to_string()))?;
  Ok(key.verify(digest, &signature).is_ok())
}

#[cfg(test)]
pub(crate) fn fast_kdf() -> KdfParams {
  KdfParams { memory_cost: 1024, time_cost: 1, parallelism: 1 }
}
