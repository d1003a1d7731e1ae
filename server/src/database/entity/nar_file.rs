//! A content-addressed NAR in the global cache.
//!
//! A NAR is identified by the triple (hash, compression, query). The same
//! decompressed content can be pulled through under more than one
//! compression, and each combination gets its own row and its own storage.

use sea_orm::entity::prelude::*;

pub type NarFileModel = Model;

/// A content-addressed NAR.
///
/// `total_chunks = 0 ∧ chunking_started_at = NULL` means the NAR is only
/// available as a whole file in the object store (C2). `total_chunks > 0`
/// means it has been fully split into chunks (C3) and `total_chunks = 0 ∧
/// chunking_started_at ≠ NULL` means a chunking pass is in progress, with
/// liveness of the owning process tracked by the distributed lock rather
/// than this timestamp.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "nar_file")]
pub struct Model {
    /// Unique numeric ID of the NAR file.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The hash of the NAR archive.
    ///
    /// This always begins with "sha256:" with the hash in hexadecimal
    /// format.
    #[sea_orm(indexed)]
    pub hash: String,

    /// The type of compression in use.
    #[sea_orm(column_type = "String(StringLen::N(10))", indexed)]
    pub compression: String,

    /// Extra query-string parameters this NAR was fetched under, if any.
    ///
    /// Part of the row's logical identity alongside `hash` and
    /// `compression`; upstream caches occasionally vary NAR URLs by query
    /// string for the same underlying content.
    #[sea_orm(column_type = "Text", default_value = "")]
    pub query: String,

    /// The size of the NAR, in the unit implied by `compression`.
    pub file_size: i64,

    /// Number of chunks that make up this NAR. Zero means unchunked.
    pub total_chunks: i32,

    /// Set while a chunking pass owns this row; cleared once
    /// `total_chunks` is flipped to its final value.
    pub chunking_started_at: Option<ChronoDateTimeUtc>,

    /// Timestamp when the NAR file row was created.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp when the NAR file was last accessed.
    pub last_accessed_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::info_nar_file::Entity")]
    InfoNarFile,

    #[sea_orm(has_many = "super::nar_file_chunk::Entity")]
    NarFileChunk,
}

impl Related<super::info_nar_file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InfoNarFile.def()
    }
}

impl Related<super::nar_file_chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarFileChunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
