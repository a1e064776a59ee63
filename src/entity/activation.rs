//! One machine holding a seat on a license.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::{ActivationMode, license};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "activations")]
pub struct Model {
  #[sea_orm(primary_key)]
  pub id: i32,
  pub license_key: String,
  pub machine_id: String,
  pub user_id: Option<String>,
  pub activation_mode: ActivationMode,
  pub activation_date: DateTimeUtc,
  pub last_heartbeat: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
  #[sea_orm(
    belongs_to = "license::Entity",
    from = "Column::LicenseKey",
    to = "license::Column::Key",
    on_delete = "Cascade"
  )]
  License,
}

impl Related<license::Entity> for Entity {
  fn to() -> RelationDef {
    Relation::License.def()
  }
}

impl ActiveModelBehavior for ActiveModel {}
