//! Offline license validation.
//!
//! Validation runs in two stages:
//!
//! 1. a per-type check selected by the license's own type (expiry first, then
//!    the identity the type is bound to),
//! 2. the rule pipeline: ordered [`RuleGroup`]s of independent rules.
//!
//! Both stages produce a [`Verdict`]; nothing here reads the wall clock, the
//! time comes from the injected [`Clock`].

mod params;
pub mod rules;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::params::{Params, keys};
pub use self::rules::{Rule, RuleGroup};
use crate::{
  clock::SystemClock,
  codec,
  model::{Kind, License},
  prelude::*,
};

/// Why a license did not pass validation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Failure {
  #[error("license expired")]
  Expired,

  #[error("missing parameter `{0}`")]
  MissingParameter(String),

  #[error("invalid parameter `{key}`: `{value}`")]
  InvalidParameter { key: String, value: String },

  #[error("`{0}` does not match")]
  Mismatch(String),

  #[error("malformed license: {0}")]
  Malformed(String),

  #[error("rule `{rule}` rejected the license: {reason}")]
  Rule { rule: String, reason: String },

  #[error("{0}")]
  Remote(String),
}

pub type Verdict = Result<(), Failure>;

pub struct Validator {
  clock: Arc<dyn Clock>,
  pipeline: Vec<RuleGroup>,
}

impl Default for Validator {
  fn default() -> Self {
    Self::new(Arc::new(SystemClock))
  }
}

impl std::fmt::Debug for Validator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Validator").field("pipeline", &self.pipeline).finish()
  }
}

impl Validator {
  /// Validator with the default `sanity` group.
  pub fn new(clock: Arc<dyn Clock>) -> Self {
    Self::bare(clock).with_group(
      RuleGroup::new("sanity")
        .rule(rules::ExpiryAfterIssue)
        .rule(rules::IssuedNotInFuture::default()),
    )
  }

  /// Validator without any pipeline rules.
  pub fn bare(clock: Arc<dyn Clock>) -> Self {
    Self { clock, pipeline: Vec::new() }
  }

  pub fn with_group(mut self, group: RuleGroup) -> Self {
    self.pipeline.push(group);
    self
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  pub fn validate(&self, license: &License, params: &Params) -> Verdict {
    let now = self.clock.now();
    check_type(license, params, now)?;
    self
      .pipeline
      .iter()
      .try_for_each(|group| group.check(license, params, now))
  }

  /// Opens a container and validates what is inside.
  pub fn open_and_validate(
    &self,
    bytes: &[u8],
    public_key: &VerifyingKey,
    params: &Params,
  ) -> Result<License> {
    let license = codec::verify_and_open(bytes, public_key)?;
    self.validate(&license, params)?;
    Ok(license)
  }
}

fn check_type(license: &License, params: &Params, now: DateTime<Utc>) -> Verdict {
  match license.kind() {
    Kind::Standard { user_name } => {
      not_expired(license, now)?;
      matches(params, keys::USER_NAME, user_name)?;
      matches(params, keys::SERIAL_NUMBER, license.license_key())
    }
    Kind::Trial { .. } => match license.expiration_date() {
      Some(expiration) if expiration > now => Ok(()),
      Some(_) => Err(Failure::Expired),
      None => Err(Failure::Malformed("trial without expiration".into())),
    },
    Kind::NodeLocked { hardware_id, .. } => {
      not_expired(license, now)?;
      matches(params, keys::HARDWARE_ID, hardware_id)
    }
    Kind::Subscription { .. } => not_expired(license, now),
    Kind::Floating { user_name, max_active_users_count }
    | Kind::Concurrent { user_name, max_active_users_count } => {
      not_expired(license, now)?;
      matches(params, keys::USER_NAME, user_name)?;
      let raw = params.require(keys::MAX_ACTIVE_USERS_COUNT)?;
      let supplied: u32 = raw.trim().parse().map_err(|_| {
        Failure::InvalidParameter {
          key: keys::MAX_ACTIVE_USERS_COUNT.into(),
          value: raw.into(),
        }
      })?;
      if supplied != *max_active_users_count {
        return Err(Failure::Mismatch(keys::MAX_ACTIVE_USERS_COUNT.into()));
      }
      Ok(())
    }
  }
}

fn not_expired(license: &License, now: DateTime<Utc>) -> Verdict {
  if license.is_expired_at(now) {
    return Err(Failure::Expired);
  }
  Ok(())
}

fn matches(params: &Params, key: &str, expected: &str) -> Verdict {
  if params.require(key)? != expected {
    return Err(Failure::Mismatch(key.into()));
  }
  Ok(())
}
