//! License container codec.
//!
//! Layout, each section prefixed by its length as a little-endian `u32`:
//!
//! ```text
//! digest | signature | encrypted payload | key material
//! ```
//!
//! The payload is the JSON-serialized [`License`] encrypted with
//! [`crypto::encrypt`]. The digest is SHA-256 over the *encrypted* payload,
//! and the signature is Ed25519 over the digest. There is no magic number or
//! version byte.
//!
//! With the default (random key) mode the key material is the symmetric key
//! itself, so the container is tamper-evident but not confidential to anyone
//! holding the file.

use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::{
  crypto::{self, KeyMaterial, SymmetricKey},
  model::License,
  prelude::*,
};

const LEN_PREFIX: usize = 4;

/// The four sections of a container, without any cryptographic check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
  pub digest: Vec<u8>,
  pub signature: Vec<u8>,
  pub payload: Vec<u8>,
  pub key_material: Vec<u8>,
}

impl Container {
  pub fn to_bytes(&self) -> Vec<u8> {
    let sections =
      [&self.digest, &self.signature, &self.payload, &self.key_material];
    let len = sections.iter().map(|s| LEN_PREFIX + s.len()).sum();

    let mut out = Vec::with_capacity(len);
    for section in sections {
      // sections stay far below u32::MAX
      out.extend_from_slice(&(section.len() as u32).to_le_bytes());
      out.extend_from_slice(section);
    }
    out
  }
}

/// Packs a license with a random per-container key.
pub fn pack(license: &License, private_key: &SigningKey) -> Result<Vec<u8>> {
  seal(license, private_key, KeyMaterial::Raw(SymmetricKey::random()), None)
}

/// Packs a license with a key derived from `passphrase`; only the salt is
/// stored in the container.
pub fn pack_with_passphrase(
  license: &License,
  private_key: &SigningKey,
  passphrase: &str,
) -> Result<Vec<u8>> {
  let material = KeyMaterial::Salted(crypto::generate_salt());
  seal(license, private_key, material, Some(passphrase))
}

fn seal(
  license: &License,
  private_key: &SigningKey,
  material: KeyMaterial,
  passphrase: Option<&str>,
) -> Result<Vec<u8>> {
  let plain = json::to_vec(license)
    .map_err(|e| Error::Generation(format!("serialize license: {e}")))?;

  let sealed = || -> crypto::CryptoResult<Container> {
    let key = material.resolve(passphrase)?;
    let payload = crypto::encrypt(&plain, &key)?;
    let digest = crypto::hash(&payload)?;
    let signature = crypto::sign(&digest, private_key)?;

    Ok(Container {
      digest: digest.to_vec(),
      signature,
      payload,
      key_material: material.to_bytes(),
    })
  };

  let container = sealed().map_err(|e| Error::Generation(e.to_string()))?;
  Ok(container.to_bytes())
}

/// Splits a container into its sections.
pub fn unpack(bytes: &[u8]) -> Result<Container> {
  let mut rest = bytes;
  let mut next = || -> Result<Vec<u8>> {
    if rest.len() < LEN_PREFIX {
      return Err(Error::InvalidFormat);
    }
    let (prefix, tail) = rest.split_at(LEN_PREFIX);
    let len = u32::from_le_bytes(
      prefix.try_into().map_err(|_| Error::InvalidFormat)?,
    ) as usize;
    if tail.len() < len {
      return Err(Error::InvalidFormat);
    }
    let (section, tail) = tail.split_at(len);
    rest = tail;
    Ok(section.to_vec())
  };

  let container = Container {
    digest: next()?,
    signature: next()?,
    payload: next()?,
    key_material: next()?,
  };

  if !rest.is_empty() {
    return Err(Error::InvalidFormat);
  }
  Ok(container)
}

/// Verifies integrity and authenticity, then decrypts and deserializes.
///
/// Every failure is reported as [`Error::InvalidFormat`].
pub fn verify_and_open(
  bytes: &[u8],
  public_key: &VerifyingKey,
) -> Result<License> {
  open(bytes, public_key, None)
}

pub fn verify_and_open_with_passphrase(
  bytes: &[u8],
  public_key: &VerifyingKey,
  passphrase: &str,
) -> Result<License> {
  open(bytes, public_key, Some(passphrase))
}

fn open(
  bytes: &[u8],
  public_key: &VerifyingKey,
  passphrase: Option<&str>,
) -> Result<License> {
  let container = unpack(bytes)?;

  let opened = || -> std::result::Result<License, String> {
    let digest = crypto::hash(&container.payload).map_err(|e| e.to_string())?;
    if digest.as_slice() != container.digest.as_slice() {
      return Err("digest mismatch".into());
    }

    let authentic = crypto::verify(&digest, &container.signature, public_key)
      .map_err(|e| e.to_string())?;
    if !authentic {
      return Err("signature mismatch".into());
    }

    let key = KeyMaterial::from_bytes(&container.key_material)
      .and_then(|material| material.resolve(passphrase))
      .map_err(|e| e.to_string())?;
    let plain =
      crypto::decrypt(&container.payload, &key).map_err(|e| e.to_string())?;

    json::from_slice(&plain).map_err(|e| format!("payload: {e}"))
  };

  opened().map_err(|reason| {
    debug!("License container rejected: {reason}");
    Error::InvalidFormat
  })
}
