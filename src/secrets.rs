//! Issuer secrets: the Ed25519 key pair and the API key used by clients.
//!
//! On disk the secrets are a JSON document encrypted with a key derived from
//! a passphrase:
//!
//! ```text
//! salt (16) | nonce (12) | AES-256-GCM ciphertext
//! ```

use std::path::Path;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
  crypto::{self, KdfParams, SALT_SIZE},
  prelude::*,
};

#[derive(Clone)]
pub struct Secrets {
  pub private_key: SigningKey,
  pub public_key: VerifyingKey,
  pub api_key: String,
}

impl std::fmt::Debug for Secrets {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Secrets")
      .field("public_key", &hex::encode(self.public_key.as_bytes()))
      .field("private_key", &"[REDACTED]")
      .field("api_key", &"[REDACTED]")
      .finish()
  }
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct Stored {
  private_key: String,
  public_key: String,
  api_key: String,
}

fn failed(e: impl std::fmt::Display) -> Error {
  Error::KeyManagementFailed(e.to_string())
}

impl Secrets {
  /// Fresh key pair; a random API key is used when none is given.
  pub fn generate(api_key: Option<String>) -> Self {
    let (private_key, public_key) = crypto::generate_keypair();
    let api_key = api_key
      .filter(|key| !key.trim().is_empty())
      .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    Self { private_key, public_key, api_key }
  }

  pub async fn save(&self, path: impl AsRef<Path>, passphrase: &str) -> Result<()> {
    self.save_with(path, passphrase, &KdfParams::default()).await
  }

  pub async fn load(path: impl AsRef<Path>, passphrase: &str) -> Result<Self> {
    Self::load_with(path, passphrase, &KdfParams::default()).await
  }

  /// Loads the secrets at `path`, creating and persisting new ones when the
  /// file does not exist yet.
  pub async fn load_or_generate(
    path: impl AsRef<Path>,
    passphrase: &str,
    api_key: Option<String>,
  ) -> Result<Self> {
    let path = path.as_ref();
    if fs::try_exists(path).await.map_err(failed)? {
      return Self::load(path, passphrase).await;
    }

    warn!("No secrets at {}, generating a new key pair", path.display());
    let secrets = Self::generate(api_key);
    secrets.save(path, passphrase).await?;
    Ok(secrets)
  }

  pub async fn save_with(
    &self,
    path: impl AsRef<Path>,
    passphrase: &str,
    kdf: &KdfParams,
  ) -> Result<()> {
    let stored = Stored {
      private_key: BASE64.encode(self.private_key.to_bytes()),
      public_key: BASE64.encode(self.public_key.as_bytes()),
      api_key: self.api_key.clone(),
    };
    let mut plain = json::to_vec(&stored).map_err(failed)?;

    let salt = crypto::generate_salt();
    let sealed = crypto::derive_key_with(passphrase, &salt, kdf)
      .and_then(|key| crypto::encrypt(&plain, &key));
    plain.zeroize();
    let sealed = sealed.map_err(failed)?;

    let mut out = Vec::with_capacity(SALT_SIZE + sealed.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&sealed);
    fs::write(path.as_ref(), out).await.map_err(failed)?;

    info!("Secrets written to {}", path.as_ref().display());
    Ok(())
  }

  pub async fn load_with(
    path: impl AsRef<Path>,
    passphrase: &str,
    kdf: &KdfParams,
  ) -> Result<Self> {
    let bytes = fs::read(path.as_ref()).await.map_err(failed)?;
    if bytes.len() <= SALT_SIZE {
      return Err(failed("secrets file is truncated"));
    }

    let (salt, sealed) = bytes.split_at(SALT_SIZE);
    let salt: [u8; SALT_SIZE] = salt.try_into().map_err(failed)?;

    let mut plain = crypto::derive_key_with(passphrase, &salt, kdf)
      .and_then(|key| crypto::decrypt(sealed, &key))
      .map_err(|_| failed("wrong passphrase or corrupted secrets file"))?;
    let stored: std::result::Result<Stored, _> = json::from_slice(&plain);
    plain.zeroize();
    let stored = stored.map_err(failed)?;

    let mut private = BASE64.decode(&stored.private_key).map_err(failed)?;
    let private_key = crypto::signing_key(&private);
    private.zeroize();
    let private_key = private_key.map_err(failed)?;

    let public = BASE64.decode(&stored.public_key).map_err(failed)?;
    let public_key = crypto::verifying_key(&public).map_err(failed)?;

    if private_key.verifying_key() != public_key {
      return Err(failed("public key does not belong to private key"));
    }

    Ok(Self { private_key, public_key, api_key: stored.api_key.clone() })
  }
}
