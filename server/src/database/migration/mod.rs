//! Database migrations.

pub use sea_orm_migration::*;

mod m20240101_000001_create_info_record_table;
mod m20240101_000002_create_nar_file_table;
mod m20240101_000003_create_chunk_table;
mod m20240101_000004_create_nar_file_chunk_table;
mod m20240101_000005_create_info_nar_file_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_info_record_table::Migration),
            Box::new(m20240101_000002_create_nar_file_table::Migration),
            Box::new(m20240101_000003_create_chunk_table::Migration),
            Box::new(m20240101_000004_create_nar_file_chunk_table::Migration),
            Box::new(m20240101_000005_create_info_nar_file_table::Migration),
        ]
    }
}
