pub use sea_orm_migration::prelude::*;

mod m20250301_000001_create_catalog_tables;
mod m20250301_000002_create_checkout_tables;
mod m20250301_000003_create_order_tables;
mod m20250301_000004_create_event_tables;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_catalog_tables::Migration),
            Box::new(m20250301_000002_create_checkout_tables::Migration),
            Box::new(m20250301_000003_create_order_tables::Migration),
            Box::new(m20250301_000004_create_event_tables::Migration),
        ]
    }
}
