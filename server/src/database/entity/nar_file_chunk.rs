//! A reference binding a NAR file to a constituent chunk.
//!
//! A NAR is backed by a sequence of chunks; the `chunk_index` column
//! defines reassembly order. For a fully-chunked NAR file the indices are
//! exactly `0..total_chunks-1` with no gaps.
//!
//! A chunk may become unavailable (disk corruption, manual repair) and be
//! removed from the database, in which case every NAR file referencing it
//! becomes unavailable until it is re-fetched from upstream and re-chunked.

use sea_orm::entity::prelude::*;

pub type NarFileChunkModel = Model;

/// A reference binding a NAR file to a chunk.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "nar_file_chunk")]
pub struct Model {
    /// Unique numeric ID of the link.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the NAR file.
    #[sea_orm(indexed)]
    pub nar_file_id: i64,

    /// The zero-indexed sequence number of the chunk within the NAR.
    pub chunk_index: i32,

    /// ID of the chunk.
    #[sea_orm(indexed)]
    pub chunk_id: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::chunk::Entity",
        from = "Column::ChunkId",
        to = "super::chunk::Column::Id"
    )]
    Chunk,

    #[sea_orm(
        belongs_to = "super::nar_file::Entity",
        from = "Column::NarFileId",
        to = "super::nar_file::Column::Id"
    )]
    NarFile,
}

impl Related<super::chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Chunk.def()
    }
}

impl Related<super::nar_file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarFile.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
