//! JSON bodies exchanged between a [`Session`](crate::session::Session) and
//! the license server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{model::ActivationMode, validator::Params};

pub const VALIDATE: &str = "validate";
pub const ACTIVATE: &str = "activate";
pub const HEARTBEAT: &str = "heartbeat";
pub const DISCONNECT: &str = "disconnect";
pub const REVOKE: &str = "revoke";
pub const RENEW: &str = "renew";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateReq {
  pub license_key: String,
  #[serde(default)]
  pub params: Params,
  /// Base64 of the license container.
  pub container: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateReq {
  pub license_key: String,
  #[serde(default)]
  pub machine_id: Option<String>,
  #[serde(default)]
  pub user_id: Option<String>,
  #[serde(default)]
  pub mode: ActivationMode,
}

/// Body of `heartbeat` and `disconnect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatReq {
  pub license_key: String,
  pub machine_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeReq {
  pub license_key: String,
  #[serde(default)]
  pub machine_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewReq {
  pub license_key: String,
  pub expiration_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Res<T> {
  pub success: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<T>,
}

impl<T> Res<T> {
  pub fn ok(data: T) -> Self {
    Self { success: true, error: None, data: Some(data) }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatRes {
  pub machine_id: String,
  pub last_heartbeat: DateTime<Utc>,
}
