use sea_orm_migration::prelude::*;

use crate::database::entity::info_record::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20240101_000001_create_info_record_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Column::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Column::Hash)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Column::StorePath).string().not_null())
                    .col(ColumnDef::new(Column::Compression).string().not_null())
                    .col(ColumnDef::new(Column::FileHash).string().null())
                    .col(ColumnDef::new(Column::FileSize).big_integer().null())
                    .col(ColumnDef::new(Column::NarHash).string().not_null())
                    .col(ColumnDef::new(Column::NarSize).big_integer().not_null())
                    .col(ColumnDef::new(Column::Sigs).string().not_null())
                    .col(ColumnDef::new(Column::References).string().not_null())
                    .col(ColumnDef::new(Column::System).string().null())
                    .col(ColumnDef::new(Column::Deriver).string().null())
                    .col(ColumnDef::new(Column::Ca).string().null())
                    .col(
                        ColumnDef::new(Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Column::LastAccessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-info-record-hash")
                    .table(Entity)
                    .col(Column::Hash)
                    .to_owned(),
            )
            .await
    }
}
