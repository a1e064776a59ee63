use sea_orm_migration::prelude::*;

use super::m20251220_000001_create_licenses::Licenses;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
  async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager
      .create_table(
        Table::create()
          .table(Activations::Table)
          .if_not_exists()
          .col(
            ColumnDef::new(Activations::Id)
              .integer()
              .not_null()
              .auto_increment()
              .primary_key(),
          )
          .col(ColumnDef::new(Activations::LicenseKey).string().not_null())
          .col(ColumnDef::new(Activations::MachineId).string().not_null())
          .col(ColumnDef::new(Activations::UserId).string().null())
          .col(
            ColumnDef::new(Activations::ActivationMode)
              .string()
              .not_null()
              .default("online"),
          )
          .col(
            ColumnDef::new(Activations::ActivationDate)
              .timestamp_with_time_zone()
              .not_null(),
          )
          .col(
            ColumnDef::new(Activations::LastHeartbeat)
              .timestamp_with_time_zone()
              .not_null(),
          )
          .foreign_key(
            ForeignKey::create()
              .name("fk_activations_license")
              .from(Activations::Table, Activations::LicenseKey)
              .to(Licenses::Table, Licenses::Key)
              .on_delete(ForeignKeyAction::Cascade),
          )
          .to_owned(),
      )
      .await?;

    manager
      .create_index(
        Index::create()
          .name("idx_activations_license_machine")
          .table(Activations::Table)
          .col(Activations::LicenseKey)
          .col(Activations::MachineId)
          .unique()
          .to_owned(),
      )
      .await?;

    manager
      .create_index(
        Index::create()
          .name("idx_activations_last_heartbeat")
          .table(Activations::Table)
          .col(Activations::LastHeartbeat)
          .to_owned(),
      )
      .await
  }

  async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager
      .drop_table(Table::drop().table(Activations::Table).to_owned())
      .await
  }
}

#[derive(DeriveIden)]
pub enum Activations {
  Table,
  Id,
  LicenseKey,
  MachineId,
  UserId,
  ActivationMode,
  ActivationDate,
  LastHeartbeat,
}
