use sea_orm_migration::prelude::*;

use crate::database::entity::chunk;
use crate::database::entity::nar_file;
use crate::database::entity::nar_file_chunk::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20240101_000004_create_nar_file_chunk_table"
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
                    .col(ColumnDef::new(Column::NarFileId).big_integer().not_null())
                    .col(ColumnDef::new(Column::ChunkIndex).integer().not_null())
                    .col(ColumnDef::new(Column::ChunkId).big_integer().not_null())
                    .foreign_key(
                        ForeignKeyCreateStatement::new()
                            .name("fk_nar_file_chunk_nar_file")
                            .from_tbl(Entity)
                            .from_col(Column::NarFileId)
                            .to_tbl(nar_file::Entity)
                            .to_col(nar_file::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKeyCreateStatement::new()
                            .name("fk_nar_file_chunk_chunk")
                            .from_tbl(Entity)
                            .from_col(Column::ChunkId)
                            .to_tbl(chunk::Entity)
                            .to_col(chunk::Column::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-nar-file-chunk-nar-file-id")
                    .table(Entity)
                    .col(Column::NarFileId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-nar-file-chunk-chunk-id")
                    .table(Entity)
                    .col(Column::ChunkId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-nar-file-chunk-nar-file-id-chunk-index")
                    .table(Entity)
                    .col(Column::NarFileId)
                    .col(Column::ChunkIndex)
                    .unique()
                    .to_owned(),
            )
            .await
    }
}
