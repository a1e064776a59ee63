//! Seat accounting for activations.
//!
//! Every read-modify-write on the activation set of a license runs under that
//! license's lock and inside one transaction, so concurrent `activate` calls
//! can never both observe a free seat.

use sea_orm::{DatabaseTransaction, QueryOrder, sea_query::Expr};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::license::ensure_usable;
use crate::{
  entity::{ActivationMode, LicenseStatus, LicenseType, activation, license},
  prelude::*,
  state::SeatLocks,
  validator::{Failure, keys},
};

pub struct Activation<'a> {
  db: &'a DatabaseConnection,
  clock: &'a Arc<dyn Clock>,
  locks: &'a SeatLocks,
  timeout: Duration,
}

impl<'a> Activation<'a> {
  pub fn new(
    db: &'a DatabaseConnection,
    clock: &'a Arc<dyn Clock>,
    locks: &'a SeatLocks,
    timeout: Duration,
  ) -> Self {
    Self { db, clock, locks, timeout }
  }

  /// Takes the seat lock of an existing license.
  async fn lock(&self, key: &str) -> Result<SeatGuard<'a>> {
    license::Entity::find_by_id(key)
      .one(self.db)
      .await?
      .ok_or(Error::LicenseNotFound)?;

    let lock = self.locks.entry(key.to_string()).or_default().clone();
    Ok(SeatGuard {
      locks: self.locks,
      key: key.to_string(),
      guard: Some(lock.lock_owned().await),
    })
  }

  fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    TimeDelta::from_std(self.timeout)
      .ok()
      .and_then(|timeout| now.checked_sub_signed(timeout))
      .unwrap_or(DateTime::<Utc>::MIN_UTC)
  }

  pub async fn activate(
    &self,
    key: &str,
    machine_id: Option<&str>,
  ) -> Result<activation::Model> {
    self.activate_with(key, machine_id, None, ActivationMode::Online).await
  }

  /// Takes a seat for `machine_id` (a fresh id when `None`). Activating a
  /// machine that already holds a seat refreshes it instead.
  pub async fn activate_with(
    &self,
    key: &str,
    machine_id: Option<&str>,
    user_id: Option<&str>,
    mode: ActivationMode,
  ) -> Result<activation::Model> {
    let machine_id = match machine_id.map(str::trim) {
      Some(id) if !id.is_empty() => id.to_string(),
      _ => Uuid::new_v4().to_string(),
    };

    let _guard = self.lock(key).await?;

    let now = self.clock.now();
    let txn = self.db.begin().await?;

    let record = license::Entity::find_by_id(key)
      .one(&txn)
      .await?
      .ok_or(Error::LicenseNotFound)?;
    ensure_usable(&record, now)?;

    if record.license_type == LicenseType::NodeLocked {
      match &record.hardware_id {
        Some(bound) if *bound != machine_id => {
          debug!("Machine {machine_id} rejected, {key} is bound to {bound}");
          return Err(Failure::Mismatch(keys::HARDWARE_ID.into()).into());
        }
        Some(_) => {}
        None => {
          license::ActiveModel {
            hardware_id: Set(Some(machine_id.clone())),
            ..record.clone().into()
          }
          .update(&txn)
          .await?;
        }
      }
    }

    purge(&txn, Some(key), self.cutoff(now)).await?;

    let existing = activation::Entity::find()
      .filter(activation::Column::LicenseKey.eq(key))
      .filter(activation::Column::MachineId.eq(&machine_id))
      .one(&txn)
      .await?;

    if let Some(existing) = existing {
      let refreshed = activation::ActiveModel {
        last_heartbeat: Set(now),
        ..existing.into()
      }
      .update(&txn)
      .await?;
      txn.commit().await?;
      return Ok(refreshed);
    }

    let live = count(&txn, key).await?;
    if let Some(max) = record.seat_cap()
      && live >= max
    {
      warn!("Seat limit reached for {key} ({live}/{max})");
      return Err(Error::CapacityExceeded { active: live, max });
    }

    let activation = activation::ActiveModel {
      license_key: Set(key.to_string()),
      machine_id: Set(machine_id),
      user_id: Set(user_id.map(str::to_string)),
      activation_mode: Set(mode),
      activation_date: Set(now),
      last_heartbeat: Set(now),
      ..Default::default()
    }
    .insert(&txn)
    .await?;

    set_count(&txn, key, live + 1).await?;
    txn.commit().await?;

    info!("License {key} activated ({}/{})", live + 1, record.max_active_users_count);
    debug!("Activation {} for machine {}", activation.id, activation.machine_id);
    Ok(activation)
  }

  /// Refreshes the lease of `machine_id`; a lease that already lapsed is
  /// re-acquired through [`Self::activate`].
  pub async fn heartbeat(
    &self,
    key: &str,
    machine_id: &str,
  ) -> Result<activation::Model> {
    {
      let _guard = self.lock(key).await?;

      let now = self.clock.now();
      let txn = self.db.begin().await?;

      let record = license::Entity::find_by_id(key)
        .one(&txn)
        .await?
        .ok_or(Error::LicenseNotFound)?;
      ensure_usable(&record, now)?;

      let existing = activation::Entity::find()
        .filter(activation::Column::LicenseKey.eq(key))
        .filter(activation::Column::MachineId.eq(machine_id))
        .filter(activation::Column::LastHeartbeat.gte(self.cutoff(now)))
        .one(&txn)
        .await?;

      if let Some(existing) = existing {
        let refreshed = activation::ActiveModel {
          last_heartbeat: Set(now),
          ..existing.into()
        }
        .update(&txn)
        .await?;
        txn.commit().await?;
        return Ok(refreshed);
      }
    }

    debug!("Lease of {machine_id} on {key} lapsed, re-acquiring");
    self.activate(key, Some(machine_id)).await
  }

  /// Releases the seat of `machine_id`. Returns whether one was held.
  pub async fn disconnect(&self, key: &str, machine_id: &str) -> Result<bool> {
    let _guard = self.lock(key).await?;

    let txn = self.db.begin().await?;
    license::Entity::find_by_id(key)
      .one(&txn)
      .await?
      .ok_or(Error::LicenseNotFound)?;

    let removed = release(&txn, key, Some(machine_id)).await?;
    txn.commit().await?;

    if removed > 0 {
      info!("License {key} seat released");
    }
    Ok(removed > 0)
  }

  /// With a machine id, releases that machine's seat and, when it is the
  /// bound one, the node-lock binding. Without one, revokes the license itself
  /// and releases every seat.
  pub async fn revoke(&self, key: &str, machine_id: Option<&str>) -> Result<()> {
    let _guard = self.lock(key).await?;

    let txn = self.db.begin().await?;
    let record = license::Entity::find_by_id(key)
      .one(&txn)
      .await?
      .ok_or(Error::LicenseNotFound)?;

    let removed = release(&txn, key, machine_id).await?;

    let (status, unbind) = match machine_id {
      Some(machine_id) => (
        record.status,
        removed > 0 || record.hardware_id.as_deref() == Some(machine_id),
      ),
      None => (LicenseStatus::Revoked, true),
    };
    let mut update: license::ActiveModel = record.into();
    update.status = Set(status);
    if unbind {
      update.hardware_id = Set(None);
    }
    update.update(&txn).await?;
    txn.commit().await?;

    match machine_id {
      Some(_) => info!("License {key}: machine revoked ({removed} seat freed)"),
      None => warn!("License {key} revoked ({removed} seats freed)"),
    }
    Ok(())
  }

  /// Deletes every activation whose lease lapsed before `now`.
  pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
    let txn = self.db.begin().await?;
    let removed = purge(&txn, None, self.cutoff(now)).await?;
    txn.commit().await?;
    Ok(removed)
  }

  /// Activations whose lease has not lapsed.
  pub async fn live(&self, key: &str) -> Result<Vec<activation::Model>> {
    let cutoff = self.cutoff(self.clock.now());
    let activations = activation::Entity::find()
      .filter(activation::Column::LicenseKey.eq(key))
      .filter(activation::Column::LastHeartbeat.gte(cutoff))
      .order_by_asc(activation::Column::ActivationDate)
      .all(self.db)
      .await?;
    Ok(activations)
  }

  pub async fn live_count(&self, key: &str) -> Result<u64> {
    let cutoff = self.cutoff(self.clock.now());
    let count = activation::Entity::find()
      .filter(activation::Column::LicenseKey.eq(key))
      .filter(activation::Column::LastHeartbeat.gte(cutoff))
      .count(self.db)
      .await?;
    Ok(count)
  }
}

/// Seat lock held for one license; the map entry goes away with its last
/// holder.
struct SeatGuard<'a> {
  locks: &'a SeatLocks,
  key: String,
  guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SeatGuard<'_> {
  fn drop(&mut self) {
    self.guard.take();
    self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
  }
}

async fn count(txn: &DatabaseTransaction, key: &str) -> Result<u64> {
  let count = activation::Entity::find()
    .filter(activation::Column::LicenseKey.eq(key))
    .count(txn)
    .await?;
  Ok(count)
}

async fn set_count(txn: &DatabaseTransaction, key: &str, count: u64) -> Result<()> {
  license::Entity::update_many()
    .col_expr(
      license::Column::ActiveUsersCount,
      Expr::value(i32::try_from(count).unwrap_or(i32::MAX)),
    )
    .filter(license::Column::Key.eq(key))
    .exec(txn)
    .await?;
  Ok(())
}

async fn release(
  txn: &DatabaseTransaction,
  key: &str,
  machine_id: Option<&str>,
) -> Result<u64> {
  let mut delete = activation::Entity::delete_many()
    .filter(activation::Column::LicenseKey.eq(key));
  if let Some(machine_id) = machine_id {
    delete = delete.filter(activation::Column::MachineId.eq(machine_id));
  }
  let removed = delete.exec(txn).await?.rows_affected;

  set_count(txn, key, count(txn, key).await?).await?;
  Ok(removed)
}

/// Deletes stale activations (of one license, or of all) and recounts the
/// seats of every license that lost one.
async fn purge(
  txn: &DatabaseTransaction,
  key: Option<&str>,
  cutoff: DateTime<Utc>,
) -> Result<u64> {
  let mut stale = activation::Entity::find()
    .filter(activation::Column::LastHeartbeat.lt(cutoff));
  if let Some(key) = key {
    stale = stale.filter(activation::Column::LicenseKey.eq(key));
  }
  let stale = stale.all(txn).await?;
  if stale.is_empty() {
    return Ok(0);
  }

  let ids: Vec<i32> = stale.iter().map(|activation| activation.id).collect();
  let removed = activation::Entity::delete_many()
    .filter(activation::Column::Id.is_in(ids))
    .exec(txn)
    .await?
    .rows_affected;

  let mut affected: Vec<&str> =
    stale.iter().map(|activation| activation.license_key.as_str()).collect();
  affected.sort_unstable();
  affected.dedup();
  for key in affected {
    set_count(txn, key, count(txn, key).await?).await?;
  }

  Ok(removed)
}
