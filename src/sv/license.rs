use ed25519_dalek::VerifyingKey;

use crate::{
  codec,
  entity::{LicenseStatus, LicenseType, license},
  model::{self, Kind},
  prelude::*,
  validator::{Failure, Params, Validator, keys},
};

pub struct License<'a> {
  db: &'a DatabaseConnection,
  clock: &'a Arc<dyn Clock>,
  public_key: &'a VerifyingKey,
}

/// Rejects records that cannot be used right now.
pub fn ensure_usable(record: &license::Model, now: DateTime<Utc>) -> Result<()> {
  if record.status == LicenseStatus::Revoked {
    return Err(Error::LicenseRevoked);
  }
  if record.is_expired_at(now) {
    return Err(Error::Expired);
  }
  Ok(())
}

fn issued_to(kind: &Kind) -> String {
  match kind {
    Kind::NodeLocked { user: Some(user), .. } if !user.issued_to.is_empty() => {
      user.issued_to.clone()
    }
    kind => kind.user_name().unwrap_or_default().to_string(),
  }
}

impl<'a> License<'a> {
  pub fn new(
    db: &'a DatabaseConnection,
    clock: &'a Arc<dyn Clock>,
    public_key: &'a VerifyingKey,
  ) -> Self {
    Self { db, clock, public_key }
  }

  /// Stores the server record of an issued license.
  pub async fn register(&self, license: &model::License) -> Result<license::Model> {
    if self.by_key(license.license_key()).await?.is_some() {
      return Err(Error::InvalidArgument(format!(
        "license key `{}` is already registered",
        license.license_key()
      )));
    }

    let hardware_id = match license.kind() {
      Kind::NodeLocked { hardware_id, .. } => Some(hardware_id.clone()),
      _ => None,
    };
    let subscription_start_date = match license.kind() {
      Kind::Subscription { subscription_start_date, .. } => {
        Some(*subscription_start_date)
      }
      _ => None,
    };
    let max_active_users_count = license
      .kind()
      .max_active_users()
      .map(|cap| i32::try_from(cap).unwrap_or(i32::MAX))
      .unwrap_or(0);

    let record = license::ActiveModel {
      key: Set(license.license_key().to_string()),
      license_id: Set(license.license_id()),
      license_type: Set(license.license_type()),
      status: Set(LicenseStatus::Active),
      issued_to: Set(issued_to(license.kind())),
      issuer: Set(license.issuer().to_string()),
      issued_on: Set(license.issued_on()),
      expiration_date: Set(license.expiration_date()),
      subscription_start_date: Set(subscription_start_date),
      max_active_users_count: Set(max_active_users_count),
      active_users_count: Set(0),
      hardware_id: Set(hardware_id),
    };

    let record = record.insert(self.db).await?;
    info!(
      "Registered {:?} license {} for `{}`",
      record.license_type, record.key, record.issued_to
    );
    Ok(record)
  }

  pub async fn by_key(&self, key: &str) -> Result<Option<license::Model>> {
    let license = license::Entity::find_by_id(key).one(self.db).await?;
    Ok(license)
  }

  pub async fn get(&self, key: &str) -> Result<license::Model> {
    self.by_key(key).await?.ok_or(Error::LicenseNotFound)
  }

  /// Moves the expiration of an active license.
  pub async fn renew(
    &self,
    key: &str,
    new_expiration: DateTime<Utc>,
  ) -> Result<license::Model> {
    let txn = self.db.begin().await?;

    let license = license::Entity::find_by_id(key)
      .one(&txn)
      .await?
      .ok_or(Error::LicenseNotFound)?;

    if license.status == LicenseStatus::Revoked {
      return Err(Error::LicenseRevoked);
    }
    if license.license_type == LicenseType::Trial {
      return Err(Error::InvalidArgument(
        "trial licenses cannot be renewed".into(),
      ));
    }
    if new_expiration <= license.issued_on {
      return Err(Error::InvalidArgument(
        "new expiration precedes issue date".into(),
      ));
    }
    if let Some(start) = license.subscription_start_date
      && new_expiration <= start
    {
      return Err(Error::InvalidArgument(
        "new expiration precedes subscription start".into(),
      ));
    }

    let license = license::ActiveModel {
      expiration_date: Set(Some(new_expiration)),
      ..license.into()
    }
    .update(&txn)
    .await?;

    txn.commit().await?;
    info!("License {key} renewed until {new_expiration}");
    Ok(license)
  }

  /// `Active -> Revoked` only; revocation is terminal.
  pub async fn set_status(&self, key: &str, status: LicenseStatus) -> Result<()> {
    let license = self.get(key).await?;

    match (license.status, status) {
      (current, wanted) if current == wanted => return Ok(()),
      (LicenseStatus::Revoked, _) => return Err(Error::LicenseRevoked),
      _ => {}
    }

    license::ActiveModel { status: Set(status), ..license.into() }
      .update(self.db)
      .await?;

    info!("License {key} is now {status:?}");
    Ok(())
  }

  /// Server side of online validation: the container must be authentic and
  /// belong to `key`, the stored record must be usable, and the offline
  /// rules must pass against `params`.
  pub async fn validate_online(
    &self,
    key: &str,
    container: &[u8],
    params: &Params,
  ) -> Result<model::License> {
    let mut license = codec::verify_and_open(container, self.public_key)?;
    if license.license_key() != key {
      return Err(Failure::Mismatch(keys::SERIAL_NUMBER.into()).into());
    }

    let record = self.get(key).await?;
    ensure_usable(&record, self.clock.now())?;

    // renewals only exist server side
    if let Some(expiration) = record.expiration_date
      && license.expiration_date() != Some(expiration)
      && license.license_type() != LicenseType::Trial
    {
      license.renew(expiration).map_err(|_| {
        Failure::Malformed(format!("stored expiration {expiration} is unusable"))
      })?;
    }

    Validator::new(self.clock.clone()).validate(&license, params)?;
    debug!("Online validation of {key} passed");
    Ok(license)
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::{
    clock::ManualClock, crypto, device::StaticDeviceId, generator::Generator,
    state::testing,
  };

  struct Fixture {
    db: DatabaseConnection,
    clock: Arc<dyn Clock>,
    manual: Arc<ManualClock>,
    generator: Generator,
    private: ed25519_dalek::SigningKey,
    public: VerifyingKey,
  }

  impl Fixture {
    async fn new() -> Self {
      let manual = Arc::new(ManualClock::default());
      let (private, public) = crypto::generate_keypair();
      Self {
        db: testing::memory_db().await,
        clock: manual.clone(),
        generator: Generator::new(
          manual.clone(),
          Arc::new(StaticDeviceId("HW-LOCAL".into())),
        ),
        manual,
        private,
        public,
      }
    }

    fn sv(&self) -> License<'_> {
      License::new(&self.db, &self.clock, &self.public)
    }
  }

  #[tokio::test]
  async fn register_stores_server_fields() {
    let fx = Fixture::new().await;

    let floating = fx.generator.floating("Dan", 4);
    let record = fx.sv().register(&floating).await.unwrap();
    assert_eq!(record.key, floating.license_key());
    assert_eq!(record.status, LicenseStatus::Active);
    assert_eq!(record.max_active_users_count, 4);
    assert_eq!(record.active_users_count, 0);
    assert_eq!(record.issued_to, "Dan");

    let locked = fx.generator.node_locked(Some("HW-123")).unwrap();
    let record = fx.sv().register(&locked).await.unwrap();
    assert_eq!(record.hardware_id.as_deref(), Some("HW-123"));

    assert!(matches!(
      fx.sv().register(&floating).await,
      Err(Error::InvalidArgument(_))
    ));
  }

  #[tokio::test]
  async fn revocation_is_terminal() {
    let fx = Fixture::new().await;
    let license = fx.generator.standard("Alice");
    fx.sv().register(&license).await.unwrap();

    fx.sv().set_status(license.license_key(), LicenseStatus::Revoked).await.unwrap();
    assert!(matches!(
      fx.sv().set_status(license.license_key(), LicenseStatus::Active).await,
      Err(Error::LicenseRevoked)
    ));
    assert!(matches!(
      fx.sv().set_status("unknown", LicenseStatus::Revoked).await,
      Err(Error::LicenseNotFound)
    ));
  }

  #[tokio::test]
  async fn renew_moves_expiration_except_for_trials() {
    let fx = Fixture::new().await;
    let sv = fx.sv();

    let standard = fx
      .generator
      .standard("Alice")
      .with_expiration(fx.clock.now() + TimeDelta::days(1))
      .unwrap();
    sv.register(&standard).await.unwrap();
    let target = fx.clock.now() + TimeDelta::days(30);
    let renewed = sv.renew(standard.license_key(), target).await.unwrap();
    assert_eq!(renewed.expiration_date, Some(target));

    let trial = fx.generator.trial(Duration::from_secs(3600));
    sv.register(&trial).await.unwrap();
    assert!(matches!(
      sv.renew(trial.license_key(), target).await,
      Err(Error::InvalidArgument(_))
    ));
  }

  #[tokio::test]
  async fn online_validation_checks_record_and_rules() {
    let fx = Fixture::new().await;
    let sv = fx.sv();

    let license = fx.generator.standard("Alice");
    let container = codec::pack(&license, &fx.private).unwrap();
    sv.register(&license).await.unwrap();
    let key = license.license_key();

    let params = Params::from_license(&license);
    assert_eq!(sv.validate_online(key, &container, &params).await.unwrap(), license);

    let wrong_user = params.clone().with(keys::USER_NAME, "Mallory");
    assert!(matches!(
      sv.validate_online(key, &container, &wrong_user).await,
      Err(Error::ValidationFailed(Failure::Mismatch(_)))
    ));

    assert!(matches!(
      sv.validate_online("OTHER-KEY", &container, &params).await,
      Err(Error::ValidationFailed(_))
    ));

    assert!(matches!(
      sv.validate_online(key, &container[1..], &params).await,
      Err(Error::InvalidFormat)
    ));

    sv.set_status(key, LicenseStatus::Revoked).await.unwrap();
    assert!(matches!(
      sv.validate_online(key, &container, &params).await,
      Err(Error::LicenseRevoked)
    ));
  }

  #[tokio::test]
  async fn online_validation_honours_server_renewal() {
    let fx = Fixture::new().await;
    let sv = fx.sv();

    let license = fx
      .generator
      .standard("Alice")
      .with_expiration(fx.clock.now() + TimeDelta::days(1))
      .unwrap();
    let container = codec::pack(&license, &fx.private).unwrap();
    sv.register(&license).await.unwrap();
    let params = Params::from_license(&license);

    fx.manual.advance(TimeDelta::days(2));
    assert!(matches!(
      sv.validate_online(license.license_key(), &container, &params).await,
      Err(Error::Expired)
    ));

    sv.renew(license.license_key(), fx.clock.now() + TimeDelta::days(30))
      .await
      .unwrap();
    assert!(
      sv.validate_online(license.license_key(), &container, &params)
        .await
        .is_ok()
    );
  }

  #[tokio::test]
  async fn subscription_renewal_before_start_is_rejected() {
    let fx = Fixture::new().await;
    let sv = fx.sv();

    let start = fx.clock.now() + TimeDelta::days(10);
    let license =
      fx.generator.subscription("Carol", start, Duration::from_secs(30 * 86400));
    let container = codec::pack(&license, &fx.private).unwrap();
    let record = sv.register(&license).await.unwrap();
    assert_eq!(record.subscription_start_date, Some(start));
    let key = license.license_key();
    let params = Params::from_license(&license);

    assert!(matches!(
      sv.renew(key, fx.clock.now() + TimeDelta::days(5)).await,
      Err(Error::InvalidArgument(_))
    ));
    assert_eq!(sv.get(key).await.unwrap().expiration_date, license.expiration_date());
    assert!(sv.validate_online(key, &container, &params).await.is_ok());

    // a stored expiration the container cannot take is a rule failure
    license::ActiveModel {
      expiration_date: Set(Some(fx.clock.now() + TimeDelta::days(5))),
      ..record.into()
    }
    .update(&fx.db)
    .await
    .unwrap();
    assert!(matches!(
      sv.validate_online(key, &container, &params).await,
      Err(Error::ValidationFailed(Failure::Malformed(_)))
    ));
  }
}
