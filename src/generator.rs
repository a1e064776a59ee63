//! License generation.
//!
//! One factory per variant. Every factory stamps `issued_on` from the
//! generator's clock and assigns a fresh license key; the builder methods on
//! [`License`] override the rest. Nothing here validates: a generated license
//! is only well-typed, checking it is the validator's job.

use std::time::Duration;

use chrono::TimeDelta;
use uuid::Uuid;

use crate::{
  clock::SystemClock,
  device::{DeviceId, MachineFingerprint},
  model::{Kind, License, LicenseUser},
  prelude::*,
};

/// Human-shareable key, e.g. `3F2504E0-4F89-11D3-9A0C-0305E82C3301`.
pub fn generate_license_key() -> String {
  Uuid::new_v4().hyphenated().to_string().to_uppercase()
}

fn add(start: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
  TimeDelta::from_std(duration)
    .ok()
    .and_then(|delta| start.checked_add_signed(delta))
    .ok_or_else(|| Error::Generation("duration out of range".into()))
}

pub struct Generator {
  clock: Arc<dyn Clock>,
  device: Arc<dyn DeviceId>,
}

impl Default for Generator {
  fn default() -> Self {
    Self::new(Arc::new(SystemClock), Arc::new(MachineFingerprint))
  }
}

impl Generator {
  pub fn new(clock: Arc<dyn Clock>, device: Arc<dyn DeviceId>) -> Self {
    Self { clock, device }
  }

  fn base(&self, kind: Kind) -> License {
    License {
      license_id: Uuid::new_v4(),
      license_key: generate_license_key(),
      issued_on: self.clock.now(),
      expiration_date: None,
      features: HashMap::new(),
      issuer: String::new(),
      description: String::new(),
      kind,
    }
  }

  pub fn standard(&self, user_name: impl Into<String>) -> License {
    self.base(Kind::Standard { user_name: user_name.into() })
  }

  /// Expires at `issued_on + trial_period`.
  pub fn trial(&self, trial_period: Duration) -> License {
    let mut license = self.base(Kind::Trial { trial_period });
    // far-future periods saturate
    license.expiration_date = Some(
      add(license.issued_on, trial_period)
        .unwrap_or(DateTime::<Utc>::MAX_UTC),
    );
    license
  }

  /// Binds to `hardware_id`, or to this machine's fingerprint when `None`.
  pub fn node_locked(&self, hardware_id: Option<&str>) -> Result<License> {
    self.node_locked_for(hardware_id, None, false)
  }

  pub fn node_locked_for(
    &self,
    hardware_id: Option<&str>,
    user: Option<LicenseUser>,
    validate_user_ip_address: bool,
  ) -> Result<License> {
    let hardware_id = match hardware_id {
      Some(id) => id.to_string(),
      None => self.device.device_id()?,
    };

    Ok(self.base(Kind::NodeLocked {
      hardware_id,
      user,
      validate_user_ip_address,
    }))
  }

  /// Expires at `start + duration`.
  pub fn subscription(
    &self,
    user_name: impl Into<String>,
    start: DateTime<Utc>,
    duration: Duration,
  ) -> License {
    let mut license = self.base(Kind::Subscription {
      user_name: user_name.into(),
      subscription_start_date: start,
      subscription_duration: duration,
    });
    license.expiration_date =
      Some(add(start, duration).unwrap_or(DateTime::<Utc>::MAX_UTC));
    license
  }

  /// `max_active_users_count` of zero means unlimited seats.
  pub fn floating(
    &self,
    user_name: impl Into<String>,
    max_active_users_count: u32,
  ) -> License {
    self.base(Kind::Floating {
      user_name: user_name.into(),
      max_active_users_count,
    })
  }

  /// `max_active_users_count` of zero means unlimited seats.
  pub fn concurrent(
    &self,
    user_name: impl Into<String>,
    max_active_users_count: u32,
  ) -> License {
    self.base(Kind::Concurrent {
      user_name: user_name.into(),
      max_active_users_count,
    })
  }
}
