pub use sea_orm_migration::prelude::*;

mod m20251220_000001_create_licenses;
mod m20251220_000002_create_activations;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
  fn migrations() -> Vec<Box<dyn MigrationTrait>> {
    vec![
      Box::new(m20251220_000001_create_licenses::Migration),
      Box::new(m20251220_000002_create_activations::Migration),
    ]
  }
}
