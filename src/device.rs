//! Device fingerprinting for node-locked licenses.
//!
//! The core only ever compares fingerprints as opaque strings; this module
//! supplies a default way of producing one.

use std::env;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of a fingerprint produced by [`MachineFingerprint`] (hex SHA-256).
pub const FINGERPRINT_LEN: usize = 64;

pub trait DeviceId: Send + Sync {
  /// Stable identifier of the current machine.
  fn device_id(&self) -> Result<String>;

  /// Checks that `id` is a well-formed identifier from this source.
  fn verify(&self, id: &str) -> bool;
}

/// SHA-256 over OS, architecture, hostname and the platform machine id.
#[derive(Debug, Default, Clone, Copy)]
pub struct MachineFingerprint;

impl DeviceId for MachineFingerprint {
  fn device_id(&self) -> Result<String> {
    let components = collect_components();
    if components.is_empty() {
      return Err(Error::Generation("no hardware identifiers available".into()));
    }

    let digest = Sha256::digest(components.join("|").as_bytes());
    Ok(hex::encode_upper(digest))
  }

  fn verify(&self, id: &str) -> bool {
    id.len() == FINGERPRINT_LEN
      && id.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
  }
}

/// Fixed identifier, for tests and for callers that fingerprint elsewhere.
#[derive(Debug, Clone)]
pub struct StaticDeviceId(pub String);

impl DeviceId for StaticDeviceId {
  fn device_id(&self) -> Result<String> {
    Ok(self.0.clone())
  }

  fn verify(&self, id: &str) -> bool {
    id == self.0
  }
}

fn collect_components() -> Vec<String> {
  let mut ids = vec![env::consts::OS.to_string(), env::consts::ARCH.to_string()];

  if let Some(hostname) =
    hostname::get().ok().and_then(|h| h.into_string().ok())
  {
    ids.push(hostname);
  }

  if let Some(machine_id) = machine_id() {
    ids.push(machine_id);
  }

  ids
}

fn machine_id() -> Option<String> {
  #[cfg(target_os = "linux")]
  {
    std::fs::read_to_string("/etc/machine-id")
      .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
      .ok()
      .map(|s| s.trim().to_string())
      .filter(|s| !s.is_empty())
  }

  #[cfg(not(target_os = "linux"))]
  {
    None
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fingerprint_is_stable_and_well_formed() {
    let device = MachineFingerprint;
    let a = device.device_id().unwrap();
    let b = device.device_id().unwrap();

    assert_eq!(a, b);
    assert!(device.verify(&a));
    assert!(!device.verify("HW-123"));
  }
}
