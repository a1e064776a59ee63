//! Server-side license record.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::{LicenseStatus, LicenseType};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "licenses")]
pub struct Model {
  #[sea_orm(primary_key, auto_increment = false)]
  pub key: String,
  pub license_id: Uuid,
  pub license_type: LicenseType,
  pub status: LicenseStatus,
  pub issued_to: String,
  pub issuer: String,
  pub issued_on: DateTimeUtc,
  pub expiration_date: Option<DateTimeUtc>,
  pub subscription_start_date: Option<DateTimeUtc>,
  /// Zero means unlimited.
  pub max_active_users_count: i32,
  pub active_users_count: i32,
  pub hardware_id: Option<String>,
}

impl Model {
  pub fn is_expired_at(&self, now: DateTimeUtc) -> bool {
    self.expiration_date.is_some_and(|expiration| now >= expiration)
  }

  /// Seat cap to enforce, `None` when unbounded.
  pub fn seat_cap(&self) -> Option<u64> {
    (self.license_type.is_seat_limited() && self.max_active_users_count > 0)
      .then_some(self.max_active_users_count as u64)
  }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
  #[sea_orm(has_many = "super::activation::Entity")]
  Activation,
}

impl Related<super::activation::Entity> for Entity {
  fn to() -> RelationDef {
    Relation::Activation.def()
  }
}

impl ActiveModelBehavior for ActiveModel {}
