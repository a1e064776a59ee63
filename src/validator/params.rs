use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::Failure;
use crate::model::{Kind, License};

/// Well-known parameter keys.
pub mod keys {
  pub const USER_NAME: &str = "UserName";
  pub const SERIAL_NUMBER: &str = "SerialNumber";
  pub const HARDWARE_ID: &str = "HardwareId";
  pub const MAX_ACTIVE_USERS_COUNT: &str = "MaxActiveUsersCount";
  pub const SUBSCRIPTION_START_DATE: &str = "SubscriptionStartDate";
  pub const SUBSCRIPTION_DURATION: &str = "SubscriptionDuration";
  pub const TRIAL_PERIOD: &str = "TrialPeriod";
}

/// String-keyed validation parameters supplied by the license holder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(HashMap<String, String>);

impl Params {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.insert(key, value);
    self
  }

  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.0.insert(key.into(), value.into());
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.0.get(key).map(String::as_str)
  }

  pub fn require(&self, key: &str) -> Result<&str, Failure> {
    self.get(key).ok_or_else(|| Failure::MissingParameter(key.to_string()))
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// Entries of `other` take precedence.
  pub fn merge(mut self, other: &Params) -> Self {
    for (key, value) in other.iter() {
      self.insert(key, value);
    }
    self
  }

  /// The parameters a holder of `license` would present about itself.
  pub fn from_license(license: &License) -> Self {
    let params = Self::new();
    match license.kind() {
      Kind::Standard { user_name } => params
        .with(keys::USER_NAME, user_name)
        .with(keys::SERIAL_NUMBER, license.license_key()),
      Kind::Trial { trial_period } => params.with(
        keys::TRIAL_PERIOD,
        humantime::format_duration(*trial_period).to_string(),
      ),
      Kind::NodeLocked { hardware_id, .. } => {
        params.with(keys::HARDWARE_ID, hardware_id)
      }
      Kind::Subscription {
        user_name,
        subscription_start_date,
        subscription_duration,
      } => params
        .with(keys::USER_NAME, user_name)
        .with(keys::SUBSCRIPTION_START_DATE, subscription_start_date.to_rfc3339())
        .with(
          keys::SUBSCRIPTION_DURATION,
          humantime::format_duration(*subscription_duration).to_string(),
        ),
      Kind::Floating { user_name, max_active_users_count }
      | Kind::Concurrent { user_name, max_active_users_count } => params
        .with(keys::USER_NAME, user_name)
        .with(keys::MAX_ACTIVE_USERS_COUNT, max_active_users_count.to_string()),
    }
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::generator::Generator;

  #[test]
  fn derived_params_follow_variant() {
    let generator = Generator::default();

    let standard = generator.standard("Alice");
    let params = Params::from_license(&standard);
    assert_eq!(params.get(keys::USER_NAME), Some("Alice"));
    assert_eq!(params.get(keys::SERIAL_NUMBER), Some(standard.license_key()));

    let floating = generator.floating("Dan", 4);
    let params = Params::from_license(&floating);
    assert_eq!(params.get(keys::MAX_ACTIVE_USERS_COUNT), Some("4"));
    assert_eq!(params.get(keys::HARDWARE_ID), None);
  }

  #[test]
  fn merge_prefers_caller_entries() {
    let base = Params::new().with(keys::USER_NAME, "Alice").with("Extra", "1");
    let caller = Params::new().with(keys::USER_NAME, "Mallory");

    let merged = base.merge(&caller);
    assert_eq!(merged.get(keys::USER_NAME), Some("Mallory"));
    assert_eq!(merged.get("Extra"), Some("1"));
  }
}
