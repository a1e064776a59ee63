//! License data model.
//!
//! A [`License`] is a shared base record plus one of six variant payloads
//! ([`Kind`]). It is serialized with an explicit `type` discriminator, so
//! every consumer can match exhaustively on the variant.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(
  Clone,
  Copy,
  Debug,
  PartialEq,
  Eq,
  Hash,
  EnumIter,
  DeriveActiveEnum,
  Serialize,
  Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum LicenseType {
  #[sea_orm(string_value = "standard")]
  Standard,
  #[sea_orm(string_value = "trial")]
  Trial,
  #[sea_orm(string_value = "node_locked")]
  NodeLocked,
  #[sea_orm(string_value = "subscription")]
  Subscription,
  #[sea_orm(string_value = "floating")]
  Floating,
  #[sea_orm(string_value = "concurrent")]
  Concurrent,
}

impl LicenseType {
  /// Types whose use is capped by a number of simultaneous seats.
  pub fn is_seat_limited(self) -> bool {
    matches!(self, LicenseType::Floating | LicenseType::Concurrent)
  }
}

#[derive(
  Clone,
  Copy,
  Debug,
  Default,
  PartialEq,
  Eq,
  EnumIter,
  DeriveActiveEnum,
  Serialize,
  Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum LicenseStatus {
  #[default]
  #[sea_orm(string_value = "active")]
  Active,
  #[sea_orm(string_value = "revoked")]
  Revoked,
}

#[derive(
  Clone,
  Copy,
  Debug,
  Default,
  PartialEq,
  Eq,
  EnumIter,
  DeriveActiveEnum,
  Serialize,
  Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
pub enum ActivationMode {
  #[default]
  #[sea_orm(string_value = "online")]
  Online,
  #[sea_orm(string_value = "offline")]
  Offline,
}

/// Person a node-locked license is issued to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseUser {
  pub issued_to: String,
  pub user_name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reference_user_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Kind {
  Standard {
    user_name: String,
  },
  Trial {
    #[serde(with = "duration")]
    trial_period: Duration,
  },
  NodeLocked {
    hardware_id: String,
    #[serde(default)]
    user: Option<LicenseUser>,
    #[serde(default)]
    validate_user_ip_address: bool,
  },
  Subscription {
    user_name: String,
    subscription_start_date: DateTime<Utc>,
    #[serde(with = "duration")]
    subscription_duration: Duration,
  },
  Floating {
    user_name: String,
    /// Zero means unlimited.
    max_active_users_count: u32,
  },
  Concurrent {
    user_name: String,
    /// Zero means unlimited.
    max_active_users_count: u32,
  },
}

impl Kind {
  pub fn license_type(&self) -> LicenseType {
    match self {
      Kind::Standard { .. } => LicenseType::Standard,
      Kind::Trial { .. } => LicenseType::Trial,
      Kind::NodeLocked { .. } => LicenseType::NodeLocked,
      Kind::Subscription { .. } => LicenseType::Subscription,
      Kind::Floating { .. } => LicenseType::Floating,
      Kind::Concurrent { .. } => LicenseType::Concurrent,
    }
  }

  pub fn user_name(&self) -> Option<&str> {
    match self {
      Kind::Standard { user_name }
      | Kind::Subscription { user_name, .. }
      | Kind::Floating { user_name, .. }
      | Kind::Concurrent { user_name, .. } => Some(user_name),
      Kind::NodeLocked { user, .. } => {
        user.as_ref().map(|user| user.user_name.as_str())
      }
      Kind::Trial { .. } => None,
    }
  }

  /// Seat cap for seat-limited types, `None` otherwise.
  pub fn max_active_users(&self) -> Option<u32> {
    match self {
      Kind::Floating { max_active_users_count, .. }
      | Kind::Concurrent { max_active_users_count, .. } => {
        Some(*max_active_users_count)
      }
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
  pub(crate) license_id: Uuid,
  pub(crate) license_key: String,
  pub(crate) issued_on: DateTime<Utc>,
  pub(crate) expiration_date: Option<DateTime<Utc>>,
  #[serde(default)]
  pub(crate) features: HashMap<String, bool>,
  #[serde(default)]
  pub(crate) issuer: String,
  #[serde(default)]
  pub(crate) description: String,
  #[serde(flatten)]
  pub(crate) kind: Kind,
}

impl License {
  pub fn license_id(&self) -> Uuid {
    self.license_id
  }

  pub fn license_key(&self) -> &str {
    &self.license_key
  }

  pub fn license_type(&self) -> LicenseType {
    self.kind.license_type()
  }

  pub fn issued_on(&self) -> DateTime<Utc> {
    self.issued_on
  }

  pub fn expiration_date(&self) -> Option<DateTime<Utc>> {
    self.expiration_date
  }

  pub fn features(&self) -> &HashMap<String, bool> {
    &self.features
  }

  pub fn issuer(&self) -> &str {
    &self.issuer
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn kind(&self) -> &Kind {
    &self.kind
  }

  /// Derived predicate, never stored.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self.expiration_date.is_some_and(|expiration| now >= expiration)
  }

  pub fn is_feature_enabled(&self, name: &str) -> bool {
    self.features.get(name).copied().unwrap_or(false)
  }

  pub fn with_license_key(mut self, key: impl Into<String>) -> Result<Self> {
    let key = key.into();
    if key.trim().is_empty() {
      return Err(Error::Generation("license key must not be empty".into()));
    }
    self.license_key = key;
    Ok(self)
  }

  /// Sets an explicit expiration. Trial and Subscription derive theirs and
  /// reject this.
  pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Result<Self> {
    match self.kind {
      Kind::Trial { .. } | Kind::Subscription { .. } => {
        Err(Error::Generation(format!(
          "expiration of a {:?} license is derived and cannot be set",
          self.license_type()
        )))
      }
      _ => {
        self.expiration_date = Some(expiration);
        Ok(self)
      }
    }
  }

  pub fn with_feature(mut self, name: impl Into<String>, enabled: bool) -> Self {
    self.features.insert(name.into(), enabled);
    self
  }

  pub fn with_features(
    mut self,
    features: impl IntoIterator<Item = (String, bool)>,
  ) -> Self {
    self.features = features.into_iter().collect();
    self
  }

  pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
    self.issuer = issuer.into();
    self
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  /// Moves the expiration to `new_expiration`. For subscriptions the
  /// duration is recomputed from the start date.
  pub fn renew(&mut self, new_expiration: DateTime<Utc>) -> Result<()> {
    match &mut self.kind {
      Kind::Trial { .. } => {
        return Err(Error::Generation(
          "trial licenses cannot be renewed".into(),
        ));
      }
      Kind::Subscription {
        subscription_start_date, subscription_duration, ..
      } => {
        *subscription_duration = (new_expiration - *subscription_start_date)
          .to_std()
          .map_err(|_| {
            Error::Generation(
              "renewal date precedes subscription start".into(),
            )
          })?;
      }
      _ => {}
    }
    self.expiration_date = Some(new_expiration);
    Ok(())
  }
}

/// Serializes durations as humantime strings (`"7days"`, `"0s"`).
pub(crate) mod duration {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer, de::Error};

  pub fn serialize<S: Serializer>(
    duration: &Duration,
    s: S,
  ) -> Result<S::Ok, S::Error> {
    s.collect_str(&humantime::format_duration(*duration))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    d: D,
  ) -> Result<Duration, D::Error> {
    let raw = String::deserialize(d)?;
    humantime::parse_duration(&raw)
      .map_err(|e| D::Error::custom(format!("invalid duration `{raw}`: {e}")))
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeDelta;

  use super::*;
  use crate::generator::Generator;

  #[test]
  fn serialized_form_carries_type_tag() {
    let license = Generator::default().standard("Alice");
    let value = json::to_value(&license).unwrap();

    assert_eq!(value["type"], "Standard");
    assert_eq!(value["user_name"], "Alice");

    let back: License = json::from_value(value).unwrap();
    assert_eq!(back, license);
  }

  #[test]
  fn trial_and_subscription_reject_explicit_expiry() {
    let generator = Generator::default();
    let expiry = Utc::now() + TimeDelta::days(10);

    let trial = generator.trial(Duration::from_secs(3600));
    assert!(matches!(trial.with_expiration(expiry), Err(Error::Generation(_))));

    let standard = generator.standard("Bob").with_expiration(expiry).unwrap();
    assert_eq!(standard.expiration_date(), Some(expiry));
  }

  #[test]
  fn feature_updates_overwrite() {
    let license = Generator::default()
      .standard("Bob")
      .with_feature("Export", false)
      .with_feature("Export", true);

    assert!(license.is_feature_enabled("Export"));
    assert!(!license.is_feature_enabled("Import"));
    assert_eq!(license.features().len(), 1);
  }

  #[test]
  fn subscription_renewal_extends_duration() {
    let generator = Generator::default();
    let mut license =
      generator.subscription("Carol", Utc::now(), Duration::from_secs(86400));
    let start = match license.kind() {
      Kind::Subscription { subscription_start_date, .. } => {
        *subscription_start_date
      }
      _ => unreachable!(),
    };

    let new_expiry = start + TimeDelta::days(30);
    license.renew(new_expiry).unwrap();

    assert_eq!(license.expiration_date(), Some(new_expiry));
    match license.kind() {
      Kind::Subscription { subscription_duration, .. } => {
        assert_eq!(*subscription_duration, Duration::from_secs(30 * 86400));
      }
      _ => unreachable!(),
    }

    assert!(license.renew(start - TimeDelta::days(1)).is_err());
  }

  #[test]
  fn trial_cannot_be_renewed() {
    let mut license = Generator::default().trial(Duration::from_secs(60));
    assert!(license.renew(Utc::now() + TimeDelta::days(1)).is_err());
  }
}
