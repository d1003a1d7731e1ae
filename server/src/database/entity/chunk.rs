//! A content-addressed chunk in the global chunk store.

use sea_orm::entity::prelude::*;

use super::Json;
use crate::storage::RemoteFile;

pub type ChunkModel = Model;

/// A content-addressed chunk.
///
/// Immutable once created: the row is the GC anchor for the bytes living in
/// the chunk store (C3). A chunk with no incoming [`super::nar_file_chunk`]
/// link is unreachable and eligible for deletion by the evictor.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "chunk")]
pub struct Model {
    /// Unique numeric ID of the chunk.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The hash of the uncompressed chunk (content address).
    ///
    /// This always begins with "sha256:" with the hash in hexadecimal
    /// format.
    #[sea_orm(unique, indexed)]
    pub chunk_hash: String,

    /// The size of the uncompressed chunk.
    pub chunk_size: i64,

    /// The size of the compressed chunk as stored in C3.
    pub compressed_size: i64,

    /// The type of compression the stored bytes are under.
    #[sea_orm(column_type = "String(StringLen::N(10))")]
    pub compression: String,

    /// The remote file backing this chunk.
    pub remote_file: Json<RemoteFile>,

    /// Unique string identifying the remote file.
    #[sea_orm(unique)]
    pub remote_file_id: String,

    /// Timestamp when the chunk is created.
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::nar_file_chunk::Entity")]
    NarFileChunk,
}

impl Related<super::nar_file_chunk::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::NarFileChunk.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
