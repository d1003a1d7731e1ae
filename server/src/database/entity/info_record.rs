//! A content-addressed info record ("narinfo") for a single store path.
//!
//! An info record is created the first time a store path is pulled through
//! from an upstream cache (or directly uploaded as a maintenance operation).
//! It is updated only to heal previously-NULL fields or to repoint at a
//! different [`super::nar_file`] row after a CDC migration; otherwise it is
//! immutable until deleted by the evictor.

use sea_orm::entity::prelude::*;

use super::Json;

pub type InfoRecordModel = Model;

/// A content-addressed info record.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "info_record")]
pub struct Model {
    /// Unique numeric ID of the info record.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// The hash identifying this info record, e.g. the store path hash.
    ///
    /// This always begins with "sha256:" with the hash in hexadecimal
    /// format.
    #[sea_orm(unique, indexed)]
    pub hash: String,

    /// The full store path being cached, including the store directory.
    pub store_path: String,

    /// The type of compression the NAR is served under.
    #[sea_orm(column_type = "String(StringLen::N(10))")]
    pub compression: String,

    /// The hash of the compressed NAR, if known.
    pub file_hash: Option<String>,

    /// The size of the compressed NAR, if known.
    pub file_size: Option<i64>,

    /// The hash of the uncompressed NAR.
    pub nar_hash: String,

    /// The size of the uncompressed NAR.
    pub nar_size: i64,

    /// Signatures carried on this info record, re-signed under the local
    /// cache identity once an upstream signature has been verified.
    pub sigs: Json<Vec<String>>,

    /// Other store paths this object directly references.
    pub references: Json<Vec<String>>,

    /// The system this derivation is built for.
    pub system: Option<String>,

    /// The derivation that produced this object.
    pub deriver: Option<String>,

    /// The content address of this object, if content-addressed.
    pub ca: Option<String>,

    /// Timestamp when the info record was created.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp when the info record was last accessed.
    ///
    /// Debounced by `record-age-ignore-touch`; not updated on every hit.
    pub last_accessed_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::info_nar_file::Entity")]
    InfoNarFile,
}

impl Related<super::info_nar_file::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InfoNarFile.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
