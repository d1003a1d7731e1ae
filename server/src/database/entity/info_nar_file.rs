//! A many-to-many link between an info record and a NAR file.
//!
//! An info record links to exactly one NAR file at a time (enforced by a
//! unique index on `info_record_id`); a NAR file may be linked from many
//! info records sharing identical content under different store paths. A
//! CDC migration or NAR repair relinks an info record to a new NAR file
//! without touching the info record's own row.

use sea_orm::entity::prelude::*;

pub type InfoNarFileModel = Model;

/// A link between an info record and the NAR file backing it.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "info_nar_file")]
pub struct Model {
    /// Unique numeric ID of the link.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the info record. Unique: an info record has one live link.
    #[sea_orm(unique, indexed)]
    pub info_record_id: i64,

    /// ID of the NAR file.
    #[sea_orm(indexed)]
    pub nar_file_id: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::info_record::Entity",
        from = "Column::InfoRecordId",
        to = "super::info_record::Column::Id"
    )]
    InfoRecord,

    #[sea_orm(
        belongs_to = "super::nar_file::Entity",
        from = "Column::NarFileId",
        to = "super::nar_file::Column::Id"
    )]
    NarFile,
}

impl Related<super::info_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InfoRecord.def()
    }
}

impl Related<super::nar_file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarFile.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
