pub mod entity;
pub mod migration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::entity::Iterable as EnumIterable;
use sea_orm::query::{JoinType, QueryOrder, QuerySelect, QueryTrait};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ActiveValue::Set, ActiveValue::NotSet, ConnectionTrait, DatabaseConnection, DbErr, TransactionTrait};

use crate::error::{ServerError, ServerResult};
use entity::chunk::{self, ChunkModel, Entity as Chunk};
use entity::info_nar_file::{self, Entity as InfoNarFile};
use entity::info_record::{self, Entity as InfoRecord, InfoRecordModel};
use entity::nar_file::{self, Entity as NarFile, NarFileModel};
use entity::nar_file_chunk::{self, Entity as NarFileChunk};

// Prefixes used to disambiguate columns in the joined GetNAR query.
const SELECT_INFO_RECORD: &str = "IR_";
const SELECT_NAR_FILE: &str = "NF_";
const SELECT_CHUNK: &str = "CH_";
const SELECT_NAR_FILE_CHUNK: &str = "NFC_";

/// A freshly-created info record together with the data needed to decide
/// whether it already carries a linked NAR file.
pub struct NewInfoRecord {
    pub hash: String,
    pub store_path: String,
    pub compression: String,
    pub file_hash: Option<String>,
    pub file_size: Option<i64>,
    pub nar_hash: String,
    pub nar_size: i64,
    pub sigs: Vec<String>,
    pub references: Vec<String>,
    pub system: Option<String>,
    pub deriver: Option<String>,
    pub ca: Option<String>,
}

/// A freshly-created NAR file.
pub struct NewNarFile {
    pub hash: String,
    pub compression: String,
    pub query: String,
    pub file_size: i64,
}

/// A freshly-created chunk.
pub struct NewChunk {
    pub chunk_hash: String,
    pub chunk_size: i64,
    pub compressed_size: i64,
    pub compression: String,
    pub remote_file: crate::storage::RemoteFile,
    pub remote_file_id: String,
}

fn prefix_column<E: EntityTrait, S: QuerySelect>(mut select: S, prefix: &str) -> S {
    for col in <E::Column as EnumIterable>::iter() {
        let alias = format!("{}{}", prefix, Iden::to_string(&col));
        select = select.column_as(col, alias);
    }
    select
}

/// Builds the quintuple join used to answer `GetInfoRecord`/`GetNAR` in a
/// single round trip: info record, its linked NAR file, and (if chunked)
/// every constituent chunk in index order.
///
/// A `None` entry in the returned chunk vector means a `NARFileChunk` row
/// exists but its `Chunk` has gone missing (e.g. manual repair); the NAR
/// cannot be fully reassembled until it is healed.
pub fn build_info_nar_file_query() -> Select<InfoRecord> {
    let mut query = InfoRecord::find()
        .select_only()
        .join(JoinType::InnerJoin, info_record::Relation::InfoNarFile.def())
        .join(JoinType::InnerJoin, info_nar_file::Relation::NarFile.def())
        .join(JoinType::LeftJoin, nar_file::Relation::NarFileChunk.def())
        .join(JoinType::LeftJoin, nar_file_chunk::Relation::Chunk.def())
        .order_by_asc(nar_file_chunk::Column::ChunkIndex);

    query = prefix_column::<info_record::Entity, _>(query, SELECT_INFO_RECORD);
    query = prefix_column::<nar_file::Entity, _>(query, SELECT_NAR_FILE);
    query = prefix_column::<chunk::Entity, _>(query, SELECT_CHUNK);
    query = prefix_column::<nar_file_chunk::Entity, _>(query, SELECT_NAR_FILE_CHUNK);

    query
}

#[async_trait]
pub trait Querier: Send + Sync {
    /// Looks up an info record by its hash.
    async fn get_info_record_by_hash(&self, hash: &str) -> ServerResult<Option<InfoRecordModel>>;

    /// Looks up an info record together with its linked NAR file and, if
    /// chunked, every constituent chunk in index order.
    async fn get_info_record_with_nar(
        &self,
        hash: &str,
    ) -> ServerResult<Option<(InfoRecordModel, NarFileModel, Vec<Option<ChunkModel>>)>>;

    /// Creates a new info record. Fails if the hash already exists; callers
    /// that want idempotent upload semantics should use `upsert_info_record`.
    async fn create_info_record(&self, record: NewInfoRecord) -> ServerResult<InfoRecordModel>;

    /// Creates an info record, or returns the existing row unchanged if one
    /// with the same hash already exists. Used by the C8 double-checked
    /// locking path so a duplicate concurrent fetch is a no-op rather than
    /// an error.
    async fn upsert_info_record(&self, record: NewInfoRecord) -> ServerResult<InfoRecordModel>;

    /// Deletes an info record by hash.
    async fn delete_info_record(&self, hash: &str) -> ServerResult<()>;

    /// Touches `last_accessed_at`, subject to the caller's debounce check.
    async fn touch_info_record(&self, id: i64, now: DateTime<Utc>) -> ServerResult<()>;

    /// Looks up a NAR file by its (hash, compression, query) identity.
    async fn get_nar_file_by_hash_and_compression_and_query(
        &self,
        hash: &str,
        compression: &str,
        query: &str,
    ) -> ServerResult<Option<NarFileModel>>;

    /// Creates a new NAR file row, unchunked (`total_chunks = 0`).
    async fn create_nar_file(&self, nar_file: NewNarFile) -> ServerResult<NarFileModel>;

    /// Deletes a NAR file by hash.
    async fn delete_nar_file_by_hash(&self, hash: &str) -> ServerResult<()>;

    /// Deletes a NAR file by its row id. Unlike `delete_nar_file_by_hash`,
    /// this touches exactly one row even when another NAR file shares the
    /// same `hash` under a different compression — the case during a
    /// whole-file-to-chunked migration, where the old and new rows share
    /// `hash` but differ in `compression`/`query`.
    async fn delete_nar_file_by_id(&self, nar_file_id: i64) -> ServerResult<()>;

    /// Atomically relinks every info record off `old_nar_file_id` onto
    /// `new_nar_file_id`, normalizes each relinked info record to the
    /// chunked convention (`compression=none`, no whole-file size/hash),
    /// and deletes the old NAR file row. Used by the whole-file-to-chunked
    /// migration so a reader never observes a torn intermediate state
    /// (an info record pointing at a NAR file row that no longer exists).
    async fn migrate_nar_file_links(&self, old_nar_file_id: i64, new_nar_file_id: i64) -> ServerResult<()>;

    /// Normalizes every info record currently linked to `nar_file_id` to the
    /// chunked convention (`compression=none`, no whole-file size/hash).
    /// Used to re-heal an info record whose columns were corrupted or
    /// reverted after its migration already completed, without redoing the
    /// relink (the link is already correct).
    async fn renormalize_info_records_for_nar_file(&self, nar_file_id: i64) -> ServerResult<()>;

    /// Links (or relinks) an info record to a NAR file. An existing link
    /// for the info record, if any, is replaced.
    async fn link_info_to_nar_file(&self, info_record_id: i64, nar_file_id: i64)
        -> ServerResult<()>;

    /// Marks a NAR file as actively being chunked by this process.
    async fn set_nar_file_chunking_started(
        &self,
        nar_file_id: i64,
        started_at: Option<DateTime<Utc>>,
    ) -> ServerResult<()>;

    /// Flips `total_chunks` once chunking completes, clearing
    /// `chunking_started_at`.
    async fn set_nar_file_total_chunks(
        &self,
        nar_file_id: i64,
        total_chunks: i32,
    ) -> ServerResult<()>;

    /// Creates a content-addressed chunk row, or returns the existing one if
    /// a chunk with the same hash and compression is already stored.
    async fn create_chunk(&self, chunk: NewChunk) -> ServerResult<ChunkModel>;

    /// Links a chunk to a NAR file at the given index.
    async fn link_nar_file_to_chunk(
        &self,
        nar_file_id: i64,
        chunk_index: i32,
        chunk_id: i64,
    ) -> ServerResult<()>;

    /// Returns every chunk backing a NAR file, in index order. A `None`
    /// entry means the link exists but the chunk row is missing.
    async fn get_chunks_by_nar_file_id(
        &self,
        nar_file_id: i64,
    ) -> ServerResult<Vec<Option<ChunkModel>>>;

    /// Selects the least-recently-used info records whose linked NAR files'
    /// *unique* total size exceeds `keep_under_bytes`, for the evictor to
    /// reclaim. NAR files shared by multiple info records are counted once.
    async fn list_lru_info_records_over_budget(
        &self,
        keep_under_bytes: u64,
    ) -> ServerResult<Vec<InfoRecordModel>>;

    /// Deletes every NARFileChunk link for a NAR file, used to tear down a
    /// partial chunking attempt abandoned by a crashed writer.
    async fn clear_nar_file_chunk_links(&self, nar_file_id: i64) -> ServerResult<()>;

    /// Whether a chunk is still linked to any NAR file other than the one
    /// currently being torn down.
    async fn chunk_has_other_links(&self, chunk_id: i64) -> ServerResult<bool>;

    /// Deletes a chunk row once its physical bytes are gone (or the delete
    /// was accepted as best-effort).
    async fn delete_orphan_chunk(&self, chunk_id: i64) -> ServerResult<()>;

    /// Whether any info record still links to `nar_file_id`. Used by the
    /// evictor to decide whether a NAR file's chunks/object can be
    /// reclaimed once its last referencing info record is deleted.
    async fn nar_file_has_other_info_links(&self, nar_file_id: i64) -> ServerResult<bool>;
}

#[async_trait]
impl Querier for DatabaseConnection {
    async fn get_info_record_by_hash(&self, hash: &str) -> ServerResult<Option<InfoRecordModel>> {
        InfoRecord::find()
            .filter(info_record::Column::Hash.eq(hash))
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn get_info_record_with_nar(
        &self,
        hash: &str,
    ) -> ServerResult<Option<(InfoRecordModel, NarFileModel, Vec<Option<ChunkModel>>)>> {
        let stmt = build_info_nar_file_query()
            .filter(info_record::Column::Hash.eq(hash))
            .build(self.get_database_backend());

        let results = self
            .query_all(stmt)
            .await
            .map_err(ServerError::database_error)?;

        if results.is_empty() {
            return Ok(None);
        }

        let mut it = results.iter();
        let first = it.next().unwrap();

        let info = info_record::Model::from_query_result(first, SELECT_INFO_RECORD)
            .map_err(ServerError::database_error)?;
        let nar = nar_file::Model::from_query_result(first, SELECT_NAR_FILE)
            .map_err(ServerError::database_error)?;

        let extract_chunk = |row: &QueryResult| -> ServerResult<Option<ChunkModel>> {
            let chunk_id: Option<i64> = row
                .try_get(SELECT_CHUNK, chunk::Column::Id.as_str())
                .map_err(ServerError::database_error)?;

            if chunk_id.is_some() {
                Ok(Some(
                    chunk::Model::from_query_result(row, SELECT_CHUNK)
                        .map_err(ServerError::database_error)?,
                ))
            } else {
                Ok(None)
            }
        };

        let mut chunks = vec![extract_chunk(first)?];
        for row in it {
            chunks.push(extract_chunk(row)?);
        }

        // The join has no NARFileChunk rows at all for a whole-file (unchunked)
        // NAR; in that case the single `None` placeholder carries no meaning.
        if nar.total_chunks == 0 {
            chunks.clear();
        } else if chunks.len() != nar.total_chunks as usize {
            return Err(ServerError::inconsistent_state(anyhow!(
                "nar file {} declares {} chunks but the join returned {}",
                nar.id,
                nar.total_chunks,
                chunks.len()
            )));
        }

        Ok(Some((info, nar, chunks)))
    }

    async fn create_info_record(&self, record: NewInfoRecord) -> ServerResult<InfoRecordModel> {
        let now = Utc::now();

        let active = info_record::ActiveModel {
            id: NotSet,
            hash: Set(record.hash),
            store_path: Set(record.store_path),
            compression: Set(record.compression),
            file_hash: Set(record.file_hash),
            file_size: Set(record.file_size),
            nar_hash: Set(record.nar_hash),
            nar_size: Set(record.nar_size),
            sigs: Set(entity::Json(record.sigs)),
            references: Set(entity::Json(record.references)),
            system: Set(record.system),
            deriver: Set(record.deriver),
            ca: Set(record.ca),
            created_at: Set(now),
            last_accessed_at: Set(None),
        };

        active.insert(self).await.map_err(ServerError::database_error)
    }

    async fn upsert_info_record(&self, record: NewInfoRecord) -> ServerResult<InfoRecordModel> {
        if let Some(existing) = self.get_info_record_by_hash(&record.hash).await? {
            return Ok(existing);
        }

        let hash = record.hash.clone();

        match self.create_info_record(record).await {
            Ok(model) => Ok(model),
            Err(_) => {
                // Lost a race with another process inserting the same hash
                // concurrently; the insert conflicted on the unique `hash`
                // column, so the row now exists under the loser's nose.
                self.get_info_record_by_hash(&hash)
                    .await?
                    .ok_or_else(|| {
                        ServerError::inconsistent_state(anyhow!(
                            "info record insert for {hash} conflicted but no row could be found"
                        ))
                    })
            }
        }
    }

    async fn delete_info_record(&self, hash: &str) -> ServerResult<()> {
        InfoRecord::delete_many()
            .filter(info_record::Column::Hash.eq(hash))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn touch_info_record(&self, id: i64, now: DateTime<Utc>) -> ServerResult<()> {
        InfoRecord::update(info_record::ActiveModel {
            id: Set(id),
            last_accessed_at: Set(Some(now)),
            ..Default::default()
        })
        .exec(self)
        .await
        .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn get_nar_file_by_hash_and_compression_and_query(
        &self,
        hash: &str,
        compression: &str,
        query: &str,
    ) -> ServerResult<Option<NarFileModel>> {
        NarFile::find()
            .filter(nar_file::Column::Hash.eq(hash))
            .filter(nar_file::Column::Compression.eq(compression))
            .filter(nar_file::Column::Query.eq(query))
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn create_nar_file(&self, nar_file: NewNarFile) -> ServerResult<NarFileModel> {
        let now = Utc::now();

        let active = nar_file::ActiveModel {
            id: NotSet,
            hash: Set(nar_file.hash),
            compression: Set(nar_file.compression),
            query: Set(nar_file.query),
            file_size: Set(nar_file.file_size),
            total_chunks: Set(0),
            chunking_started_at: Set(None),
            created_at: Set(now),
            last_accessed_at: Set(None),
        };

        active.insert(self).await.map_err(ServerError::database_error)
    }

    async fn delete_nar_file_by_hash(&self, hash: &str) -> ServerResult<()> {
        NarFile::delete_many()
            .filter(nar_file::Column::Hash.eq(hash))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn delete_nar_file_by_id(&self, nar_file_id: i64) -> ServerResult<()> {
        NarFile::delete_many()
            .filter(nar_file::Column::Id.eq(nar_file_id))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn migrate_nar_file_links(&self, old_nar_file_id: i64, new_nar_file_id: i64) -> ServerResult<()> {
        self.transaction::<_, (), DbErr>(|txn| {
            Box::pin(async move {
                let info_ids: Vec<i64> = InfoNarFile::find()
                    .filter(info_nar_file::Column::NarFileId.eq(old_nar_file_id))
                    .all(txn)
                    .await?
                    .into_iter()
                    .map(|link| link.info_record_id)
                    .collect();

                InfoNarFile::update_many()
                    .col_expr(info_nar_file::Column::NarFileId, Expr::value(new_nar_file_id))
                    .filter(info_nar_file::Column::NarFileId.eq(old_nar_file_id))
                    .exec(txn)
                    .await?;

                if !info_ids.is_empty() {
                    InfoRecord::update_many()
                        .col_expr(info_record::Column::Compression, Expr::value("none"))
                        .col_expr(info_record::Column::FileHash, Expr::value::<Option<String>>(None))
                        .col_expr(info_record::Column::FileSize, Expr::value::<Option<i64>>(None))
                        .filter(info_record::Column::Id.is_in(info_ids))
                        .exec(txn)
                        .await?;
                }

                NarFile::delete_many()
                    .filter(nar_file::Column::Id.eq(old_nar_file_id))
                    .exec(txn)
                    .await?;

                Ok(())
            })
        })
        .await
        .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn renormalize_info_records_for_nar_file(&self, nar_file_id: i64) -> ServerResult<()> {
        let info_ids: Vec<i64> = InfoNarFile::find()
            .filter(info_nar_file::Column::NarFileId.eq(nar_file_id))
            .all(self)
            .await
            .map_err(ServerError::database_error)?
            .into_iter()
            .map(|link| link.info_record_id)
            .collect();

        if info_ids.is_empty() {
            return Ok(());
        }

        InfoRecord::update_many()
            .col_expr(info_record::Column::Compression, Expr::value("none"))
            .col_expr(info_record::Column::FileHash, Expr::value::<Option<String>>(None))
            .col_expr(info_record::Column::FileSize, Expr::value::<Option<i64>>(None))
            .filter(info_record::Column::Id.is_in(info_ids))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn link_info_to_nar_file(
        &self,
        info_record_id: i64,
        nar_file_id: i64,
    ) -> ServerResult<()> {
        let existing = InfoNarFile::find()
            .filter(info_nar_file::Column::InfoRecordId.eq(info_record_id))
            .one(self)
            .await
            .map_err(ServerError::database_error)?;

        if let Some(existing) = existing {
            InfoNarFile::update(info_nar_file::ActiveModel {
                id: Set(existing.id),
                nar_file_id: Set(nar_file_id),
                ..Default::default()
            })
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;
        } else {
            info_nar_file::ActiveModel {
                id: NotSet,
                info_record_id: Set(info_record_id),
                nar_file_id: Set(nar_file_id),
            }
            .insert(self)
            .await
            .map_err(ServerError::database_error)?;
        }

        Ok(())
    }

    async fn set_nar_file_chunking_started(
        &self,
        nar_file_id: i64,
        started_at: Option<DateTime<Utc>>,
    ) -> ServerResult<()> {
        NarFile::update(nar_file::ActiveModel {
            id: Set(nar_file_id),
            chunking_started_at: Set(started_at),
            ..Default::default()
        })
        .exec(self)
        .await
        .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn set_nar_file_total_chunks(
        &self,
        nar_file_id: i64,
        total_chunks: i32,
    ) -> ServerResult<()> {
        NarFile::update(nar_file::ActiveModel {
            id: Set(nar_file_id),
            total_chunks: Set(total_chunks),
            chunking_started_at: Set(None),
            ..Default::default()
        })
        .exec(self)
        .await
        .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn create_chunk(&self, chunk: NewChunk) -> ServerResult<ChunkModel> {
        if let Some(existing) = Chunk::find()
            .filter(chunk::Column::ChunkHash.eq(chunk.chunk_hash.clone()))
            .filter(chunk::Column::Compression.eq(chunk.compression.clone()))
            .one(self)
            .await
            .map_err(ServerError::database_error)?
        {
            return Ok(existing);
        }

        let chunk_hash = chunk.chunk_hash.clone();
        let compression = chunk.compression.clone();

        let now = Utc::now();
        let active = chunk::ActiveModel {
            id: NotSet,
            chunk_hash: Set(chunk.chunk_hash),
            chunk_size: Set(chunk.chunk_size),
            compressed_size: Set(chunk.compressed_size),
            compression: Set(chunk.compression),
            remote_file: Set(entity::Json(chunk.remote_file)),
            remote_file_id: Set(chunk.remote_file_id),
            created_at: Set(now),
        };

        // A racing insert of the same (chunk_hash, compression) pair loses
        // gracefully: both columns are unique, so the loser's insert
        // conflicts and we fall back to reading the winner's row.
        match active.insert(self).await {
            Ok(model) => Ok(model),
            Err(_) => Chunk::find()
                .filter(chunk::Column::ChunkHash.eq(chunk_hash.clone()))
                .filter(chunk::Column::Compression.eq(compression))
                .one(self)
                .await
                .map_err(ServerError::database_error)?
                .ok_or_else(|| {
                    ServerError::inconsistent_state(anyhow!(
                        "chunk insert for {chunk_hash} conflicted but no matching row could be found"
                    ))
                }),
        }
    }

    async fn link_nar_file_to_chunk(
        &self,
        nar_file_id: i64,
        chunk_index: i32,
        chunk_id: i64,
    ) -> ServerResult<()> {
        let on_conflict = OnConflict::columns([
            nar_file_chunk::Column::NarFileId,
            nar_file_chunk::Column::ChunkIndex,
        ])
        .update_column(nar_file_chunk::Column::ChunkId)
        .to_owned();

        NarFileChunk::insert(nar_file_chunk::ActiveModel {
            id: NotSet,
            nar_file_id: Set(nar_file_id),
            chunk_index: Set(chunk_index),
            chunk_id: Set(chunk_id),
        })
        .on_conflict(on_conflict)
        .exec(self)
        .await
        .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn get_chunks_by_nar_file_id(
        &self,
        nar_file_id: i64,
    ) -> ServerResult<Vec<Option<ChunkModel>>> {
        let links = NarFileChunk::find()
            .filter(nar_file_chunk::Column::NarFileId.eq(nar_file_id))
            .order_by_asc(nar_file_chunk::Column::ChunkIndex)
            .find_also_related(Chunk)
            .all(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(links.into_iter().map(|(_link, chunk)| chunk).collect())
    }

    async fn list_lru_info_records_over_budget(
        &self,
        keep_under_bytes: u64,
    ) -> ServerResult<Vec<InfoRecordModel>> {
        // The simple portable form: fetch every info record ordered oldest
        // access first, joined to its NAR file's size, and accumulate
        // *unique* NAR file sizes client-side (dedup by nar_file_id) until
        // the running total drops the remainder under budget. A
        // backend-native window function would avoid the client-side
        // dedup, but this keeps the query identical across SQLite and
        // PostgreSQL, which is the whole reason both are supported.
        let rows = InfoRecord::find()
            .select_only()
            .column(info_record::Column::Id)
            .column(info_record::Column::Hash)
            .column(info_record::Column::StorePath)
            .column(info_record::Column::Compression)
            .column(info_record::Column::FileHash)
            .column(info_record::Column::FileSize)
            .column(info_record::Column::NarHash)
            .column(info_record::Column::NarSize)
            .column(info_record::Column::Sigs)
            .column(info_record::Column::References)
            .column(info_record::Column::System)
            .column(info_record::Column::Deriver)
            .column(info_record::Column::Ca)
            .column(info_record::Column::CreatedAt)
            .column(info_record::Column::LastAccessedAt)
            .column_as(nar_file::Column::Id, "nar_file_id")
            .column_as(nar_file::Column::FileSize, "nar_file_size")
            .join(JoinType::InnerJoin, info_record::Relation::InfoNarFile.def())
            .join(JoinType::InnerJoin, info_nar_file::Relation::NarFile.def())
            .order_by_asc(info_record::Column::LastAccessedAt)
            .order_by_asc(info_record::Column::CreatedAt)
            .into_model::<LruRow>()
            .all(self)
            .await
            .map_err(ServerError::database_error)?;

        let mut seen_nar_files = std::collections::HashSet::new();
        let total_unique_start: u64 = rows
            .iter()
            .filter(|r| seen_nar_files_contains(&mut seen_nar_files, r.nar_file_id))
            .map(|r| r.nar_file_size as u64)
            .sum();
        seen_nar_files.clear();

        if total_unique_start <= keep_under_bytes {
            return Ok(Vec::new());
        }

        let mut total_unique = total_unique_start;
        let mut victims = Vec::new();
        for row in rows {
            if total_unique <= keep_under_bytes {
                break;
            }

            if seen_nar_files_contains(&mut seen_nar_files, row.nar_file_id) {
                total_unique = total_unique.saturating_sub(row.nar_file_size as u64);
            }

            victims.push(InfoRecordModel {
                id: row.id,
                hash: row.hash,
                store_path: row.store_path,
                compression: row.compression,
                file_hash: row.file_hash,
                file_size: row.file_size,
                nar_hash: row.nar_hash,
                nar_size: row.nar_size,
                sigs: row.sigs,
                references: row.references,
                system: row.system,
                deriver: row.deriver,
                ca: row.ca,
                created_at: row.created_at,
                last_accessed_at: row.last_accessed_at,
            });
        }

        Ok(victims)
    }

    async fn clear_nar_file_chunk_links(&self, nar_file_id: i64) -> ServerResult<()> {
        NarFileChunk::delete_many()
            .filter(nar_file_chunk::Column::NarFileId.eq(nar_file_id))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn chunk_has_other_links(&self, chunk_id: i64) -> ServerResult<bool> {
        let count = NarFileChunk::find()
            .filter(nar_file_chunk::Column::ChunkId.eq(chunk_id))
            .count(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(count > 0)
    }

    async fn delete_orphan_chunk(&self, chunk_id: i64) -> ServerResult<()> {
        Chunk::delete_many()
            .filter(chunk::Column::Id.eq(chunk_id))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn nar_file_has_other_info_links(&self, nar_file_id: i64) -> ServerResult<bool> {
        let count = InfoNarFile::find()
            .filter(info_nar_file::Column::NarFileId.eq(nar_file_id))
            .count(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(count > 0)
    }
}

#[derive(Debug, FromQueryResult)]
struct LruRow {
    id: i64,
    hash: String,
    store_path: String,
    compression: String,
    file_hash: Option<String>,
    file_size: Option<i64>,
    nar_hash: String,
    nar_size: i64,
    sigs: entity::Json<Vec<String>>,
    references: entity::Json<Vec<String>>,
    system: Option<String>,
    deriver: Option<String>,
    ca: Option<String>,
    created_at: DateTime<Utc>,
    last_accessed_at: Option<DateTime<Utc>>,
    nar_file_id: i64,
    nar_file_size: i64,
}

fn seen_nar_files_contains(seen: &mut std::collections::HashSet<i64>, nar_file_id: i64) -> bool {
    seen.insert(nar_file_id)
}
