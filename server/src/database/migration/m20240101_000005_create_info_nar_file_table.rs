use sea_orm_migration::prelude::*;

use crate::database::entity::info_nar_file::*;
use crate::database::entity::info_record;
use crate::database::entity::nar_file;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20240101_000005_create_info_nar_file_table"
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
                        ColumnDef::new(Column::InfoRecordId)
                            .big_integer()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Column::NarFileId).big_integer().not_null())
                    .foreign_key(
                        ForeignKeyCreateStatement::new()
                            .name("fk_info_nar_file_info_record")
                            .from_tbl(Entity)
                            .from_col(Column::InfoRecordId)
                            .to_tbl(info_record::Entity)
                            .to_col(info_record::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKeyCreateStatement::new()
                            .name("fk_info_nar_file_nar_file")
                            .from_tbl(Entity)
                            .from_col(Column::NarFileId)
                            .to_tbl(nar_file::Entity)
                            .to_col(nar_file::Column::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-info-nar-file-nar-file-id")
                    .table(Entity)
                    .col(Column::NarFileId)
                    .to_owned(),
            )
            .await
    }
}
