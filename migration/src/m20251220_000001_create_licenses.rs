use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
  async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager
      .create_table(
        Table::create()
          .table(Licenses::Table)
          .if_not_exists()
          .col(ColumnDef::new(Licenses::Key).string().not_null().primary_key())
          .col(ColumnDef::new(Licenses::LicenseId).uuid().not_null())
          .col(ColumnDef::new(Licenses::LicenseType).string().not_null())
          .col(
            ColumnDef::new(Licenses::Status)
              .string()
              .not_null()
              .default("active"),
          )
          .col(ColumnDef::new(Licenses::IssuedTo).string().not_null())
          .col(ColumnDef::new(Licenses::Issuer).string().not_null().default(""))
          .col(
            ColumnDef::new(Licenses::IssuedOn)
              .timestamp_with_time_zone()
              .not_null(),
          )
          .col(
            ColumnDef::new(Licenses::ExpirationDate)
              .timestamp_with_time_zone()
              .null(),
          )
          .col(
            ColumnDef::new(Licenses::SubscriptionStartDate)
              .timestamp_with_time_zone()
              .null(),
          )
          .col(
            ColumnDef::new(Licenses::MaxActiveUsersCount)
              .integer()
              .not_null()
              .default(0),
          )
          .col(
            ColumnDef::new(Licenses::ActiveUsersCount)
              .integer()
              .not_null()
              .default(0),
          )
          .col(ColumnDef::new(Licenses::HardwareId).string().null())
          .to_owned(),
      )
      .await
  }

  async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
    manager.drop_table(Table::drop().table(Licenses::Table).to_owned()).await
  }
}

#[derive(DeriveIden)]
pub enum Licenses {
  Table,
  Key,
  LicenseId,
  LicenseType,
  Status,
  IssuedTo,
  Issuer,
  IssuedOn,
  ExpirationDate,
  SubscriptionStartDate,
  MaxActiveUsersCount,
  ActiveUsersCount,
  HardwareId,
}
