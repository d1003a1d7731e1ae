//! LRU evictor (C9).
//!
//! Reclaims info records (and, transitively, their NAR files and chunks)
//! once the unique bytes held by the cache exceed the configured budget.
//! Runs periodically and can also be invoked on demand (e.g. from an admin
//! endpoint).

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time;
use tracing::{instrument, warn};

use crate::chunking::SharedStorage;
use crate::config::EvictionConfig;
use crate::controller::nar_object_name;
use crate::database::Querier;
use crate::error::ServerResult;
use crate::lock::{Locker, NS_MAINTENANCE};

/// Runs the evictor periodically until the process exits.
pub async fn run_periodic_eviction<D: Querier + 'static>(
    db: Arc<D>,
    storage: SharedStorage,
    locker: Arc<dyn Locker>,
    max_size: u64,
    config: EvictionConfig,
) {
    if config.interval.is_zero() || max_size == 0 {
        return;
    }

    loop {
        if let Err(e) = run_eviction_once(&*db, &storage, &locker, max_size, &config).await {
            warn!("eviction pass failed: {e}");
        }

        time::sleep(config.interval).await;
    }
}

/// Runs one eviction pass: selects the LRU info records whose linked NAR
/// files' unique size exceeds `max_size`, deletes their metadata, and
/// best-effort deletes the now-unreferenced NAR files/chunks from storage.
/// Holds the maintenance lock for the duration so two processes never run
/// concurrent passes against the same budget.
#[instrument(skip_all)]
pub async fn run_eviction_once<D: Querier>(
    db: &D,
    storage: &SharedStorage,
    locker: &Arc<dyn Locker>,
    max_size: u64,
    config: &EvictionConfig,
) -> ServerResult<()> {
    let guard = locker.try_lock(NS_MAINTENANCE, "eviction", config.interval).await?;
    let Some(guard) = guard else {
        tracing::debug!("another process is already running eviction, skipping this pass");
        return Ok(());
    };

    let victims = db.list_lru_info_records_over_budget(max_size).await?;
    if victims.is_empty() {
        drop(guard);
        return Ok(());
    }

    tracing::info!("evicting {} info records over the {} byte budget", victims.len(), max_size);

    let permits = Arc::new(Semaphore::new(config.max_concurrent_deletes));
    let futures: Vec<_> = victims
        .into_iter()
        .map(|victim| {
            let permits = permits.clone();
            async move {
                let _permit = permits.acquire().await.expect("semaphore is never closed");
                evict_one(db, storage, &victim.hash).await
            }
        })
        .collect();

    let results = join_all(futures).await;
    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        warn!("{failed} info records failed to evict cleanly this pass; they remain over budget and will be retried next pass");
    }

    drop(guard);
    Ok(())
}

async fn evict_one<D: Querier>(db: &D, storage: &SharedStorage, hash: &str) -> ServerResult<()> {
    let Some((info, nar, _)) = db.get_info_record_with_nar(hash).await? else {
        return Ok(());
    };

    db.delete_info_record(&info.hash).await?;

    if db.nar_file_has_other_info_links(nar.id).await? {
        return Ok(());
    }

    if nar.total_chunks > 0 {
        for chunk in db.get_chunks_by_nar_file_id(nar.id).await?.into_iter().flatten() {
            if db.chunk_has_other_links(chunk.id).await? {
                continue;
            }

            if let Err(e) = storage.delete_file_db(&chunk.remote_file.0).await {
                warn!("best-effort chunk delete failed during eviction: {e}");
            }

            db.delete_orphan_chunk(chunk.id).await?;
        }
    } else {
        let object_name = nar_object_name(&nar.hash, &nar.compression, &nar.query);
        if let Err(e) = storage.delete_file(object_name).await {
            warn!("best-effort NAR delete failed during eviction: {e}");
        }
    }

    db.delete_nar_file_by_hash(&nar.hash).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::{DateTime, Utc};

    use crate::database::entity::chunk::ChunkModel;
    use crate::database::entity::info_record::InfoRecordModel;
    use crate::database::entity::nar_file::NarFileModel;
    use crate::database::entity::Json;
    use crate::database::{NewChunk, NewInfoRecord, NewNarFile, Querier};
    use crate::error::ServerResult;
    use crate::storage::{Download, HttpRemoteFile, RemoteFile, StorageBackend};

    // `InfoRecordModel` has no `nar_file_id` column (the link lives in the
    // junction table); `MockDb::get_info_record_with_nar` below just returns
    // the one NAR file each test registers, which is enough to exercise
    // `evict_one`'s logic without modeling the join.
    fn info(id: i64, hash: &str) -> InfoRecordModel {
        InfoRecordModel {
            id,
            hash: hash.to_string(),
            store_path: format!("/nix/store/{hash}-pkg"),
            compression: "none".to_string(),
            file_hash: None,
            file_size: None,
            nar_hash: "sha256:0000000000000000000000000000000000000000000000000000".to_string(),
            nar_size: 0,
            sigs: Json(vec![]),
            references: Json(vec![]),
            system: None,
            deriver: None,
            ca: None,
            created_at: Utc::now(),
            last_accessed_at: None,
        }
    }

    fn nar_file(id: i64, hash: &str, total_chunks: i32) -> NarFileModel {
        NarFileModel {
            id,
            hash: hash.to_string(),
            compression: "none".to_string(),
            query: "".to_string(),
            file_size: 0,
            total_chunks,
            chunking_started_at: None,
            created_at: Utc::now(),
            last_accessed_at: None,
        }
    }

    fn chunk(id: i64) -> ChunkModel {
        ChunkModel {
            id,
            chunk_hash: format!("chunk{id}"),
            chunk_size: 0,
            compressed_size: 0,
            compression: "zstd".to_string(),
            remote_file: Json(RemoteFile::Http(HttpRemoteFile { url: format!("https://example/{id}") })),
            remote_file_id: format!("http:https://example/{id}"),
        }
    }

    /// Minimal in-memory `Querier` covering only what `evict_one` touches:
    /// one info record linked to one NAR file, optionally chunked, with a
    /// configurable number of "other" links standing in for the junction
    /// tables this test doesn't model directly.
    #[derive(Default)]
    struct MockDb {
        info_by_hash: Mutex<HashMap<String, InfoRecordModel>>,
        nar_by_id: Mutex<HashMap<i64, NarFileModel>>,
        chunks_by_nar: Mutex<HashMap<i64, Vec<ChunkModel>>>,
        nar_has_other_links: Mutex<HashMap<i64, bool>>,
        chunk_has_other_links: Mutex<HashMap<i64, bool>>,
        deleted_info: Mutex<Vec<String>>,
        deleted_nar: Mutex<Vec<String>>,
        deleted_chunks: Mutex<Vec<i64>>,
    }

    #[async_trait::async_trait]
    impl Querier for MockDb {
        async fn get_info_record_by_hash(&self, hash: &str) -> ServerResult<Option<InfoRecordModel>> {
            Ok(self.info_by_hash.lock().unwrap().get(hash).cloned())
        }

        async fn get_info_record_with_nar(
            &self,
            hash: &str,
        ) -> ServerResult<Option<(InfoRecordModel, NarFileModel, Vec<Option<ChunkModel>>)>> {
            let Some(info) = self.info_by_hash.lock().unwrap().get(hash).cloned() else {
                return Ok(None);
            };
            let nar_by_id = self.nar_by_id.lock().unwrap();
            let nar = nar_by_id.values().next().cloned().expect("test fixture always has exactly one NAR file");
            let chunks = self.chunks_by_nar.lock().unwrap().get(&nar.id).cloned().unwrap_or_default();
            Ok(Some((info, nar, chunks.into_iter().map(Some).collect())))
        }

        async fn create_info_record(&self, _record: NewInfoRecord) -> ServerResult<InfoRecordModel> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn upsert_info_record(&self, _record: NewInfoRecord) -> ServerResult<InfoRecordModel> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn delete_info_record(&self, hash: &str) -> ServerResult<()> {
            self.info_by_hash.lock().unwrap().remove(hash);
            self.deleted_info.lock().unwrap().push(hash.to_string());
            Ok(())
        }

        async fn touch_info_record(&self, _id: i64, _now: DateTime<Utc>) -> ServerResult<()> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn get_nar_file_by_hash_and_compression_and_query(
            &self,
            _hash: &str,
            _compression: &str,
            _query: &str,
        ) -> ServerResult<Option<NarFileModel>> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn create_nar_file(&self, _nar_file: NewNarFile) -> ServerResult<NarFileModel> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn delete_nar_file_by_hash(&self, hash: &str) -> ServerResult<()> {
            self.nar_by_id.lock().unwrap().retain(|_, nar| nar.hash != hash);
            self.deleted_nar.lock().unwrap().push(hash.to_string());
            Ok(())
        }

        async fn delete_nar_file_by_id(&self, nar_file_id: i64) -> ServerResult<()> {
            self.nar_by_id.lock().unwrap().remove(&nar_file_id);
            Ok(())
        }

        async fn migrate_nar_file_links(&self, _old_nar_file_id: i64, _new_nar_file_id: i64) -> ServerResult<()> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn renormalize_info_records_for_nar_file(&self, _nar_file_id: i64) -> ServerResult<()> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn link_info_to_nar_file(&self, _info_record_id: i64, _nar_file_id: i64) -> ServerResult<()> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn set_nar_file_chunking_started(
            &self,
            _nar_file_id: i64,
            _started_at: Option<DateTime<Utc>>,
        ) -> ServerResult<()> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn set_nar_file_total_chunks(&self, _nar_file_id: i64, _total_chunks: i32) -> ServerResult<()> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn create_chunk(&self, _chunk: NewChunk) -> ServerResult<ChunkModel> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn link_nar_file_to_chunk(&self, _nar_file_id: i64, _chunk_index: i32, _chunk_id: i64) -> ServerResult<()> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn get_chunks_by_nar_file_id(&self, nar_file_id: i64) -> ServerResult<Vec<Option<ChunkModel>>> {
            Ok(self
                .chunks_by_nar
                .lock()
                .unwrap()
                .get(&nar_file_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(Some)
                .collect())
        }

        async fn list_lru_info_records_over_budget(&self, _keep_under_bytes: u64) -> ServerResult<Vec<InfoRecordModel>> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn clear_nar_file_chunk_links(&self, _nar_file_id: i64) -> ServerResult<()> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn chunk_has_other_links(&self, chunk_id: i64) -> ServerResult<bool> {
            Ok(*self.chunk_has_other_links.lock().unwrap().get(&chunk_id).unwrap_or(&false))
        }

        async fn delete_orphan_chunk(&self, chunk_id: i64) -> ServerResult<()> {
            for chunks in self.chunks_by_nar.lock().unwrap().values_mut() {
                chunks.retain(|c| c.id != chunk_id);
            }
            self.deleted_chunks.lock().unwrap().push(chunk_id);
            Ok(())
        }

        async fn nar_file_has_other_info_links(&self, nar_file_id: i64) -> ServerResult<bool> {
            Ok(*self.nar_has_other_links.lock().unwrap().get(&nar_file_id).unwrap_or(&false))
        }
    }

    #[derive(Debug, Default)]
    struct MockStorage {
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl StorageBackend for MockStorage {
        async fn upload_file(
            &self,
            _name: String,
            _stream: &mut (dyn tokio::io::AsyncRead + Unpin + Send),
        ) -> ServerResult<RemoteFile> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn delete_file(&self, name: String) -> ServerResult<()> {
            self.deleted.lock().unwrap().push(name);
            Ok(())
        }

        async fn delete_file_db(&self, file: &RemoteFile) -> ServerResult<()> {
            self.deleted.lock().unwrap().push(file.remote_file_id());
            Ok(())
        }

        async fn download_file(&self, _name: String) -> ServerResult<Download> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn download_file_db(&self, _file: &RemoteFile) -> ServerResult<Download> {
            unimplemented!("not exercised by evictor tests")
        }

        async fn make_db_reference(&self, _name: String) -> ServerResult<RemoteFile> {
            unimplemented!("not exercised by evictor tests")
        }
    }

    #[tokio::test]
    async fn evicting_an_unshared_whole_file_nar_deletes_it_from_storage() {
        let db = MockDb::default();
        db.info_by_hash.lock().unwrap().insert("h1".to_string(), info(1, "h1"));
        db.nar_by_id.lock().unwrap().insert(1, nar_file(1, "narhash", 0));

        let storage: SharedStorage = Arc::new(MockStorage::default());

        evict_one(&db, &storage, "h1").await.unwrap();

        assert_eq!(*db.deleted_info.lock().unwrap(), vec!["h1".to_string()]);
        assert_eq!(*db.deleted_nar.lock().unwrap(), vec!["narhash".to_string()]);
    }

    #[tokio::test]
    async fn evicting_a_nar_still_shared_by_another_info_record_keeps_it() {
        let db = MockDb::default();
        db.info_by_hash.lock().unwrap().insert("h1".to_string(), info(1, "h1"));
        db.nar_by_id.lock().unwrap().insert(1, nar_file(1, "narhash", 0));
        db.nar_has_other_links.lock().unwrap().insert(1, true);

        let storage: SharedStorage = Arc::new(MockStorage::default());

        evict_one(&db, &storage, "h1").await.unwrap();

        // the info record itself is always reclaimed...
        assert_eq!(*db.deleted_info.lock().unwrap(), vec!["h1".to_string()]);
        // ...but the NAR it pointed to survives because another info record
        // still references it.
        assert!(db.deleted_nar.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn evicting_a_chunked_nar_deletes_only_unshared_chunks() {
        let db = MockDb::default();
        db.info_by_hash.lock().unwrap().insert("h1".to_string(), info(1, "h1"));
        db.nar_by_id.lock().unwrap().insert(1, nar_file(1, "narhash", 2));
        db.chunks_by_nar.lock().unwrap().insert(1, vec![chunk(10), chunk(11)]);
        db.chunk_has_other_links.lock().unwrap().insert(11, true);

        let storage = Arc::new(MockStorage::default());
        let shared: SharedStorage = storage.clone();

        evict_one(&db, &shared, "h1").await.unwrap();

        assert_eq!(*db.deleted_chunks.lock().unwrap(), vec![10]);
        assert_eq!(storage.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn evicting_a_missing_info_record_is_a_no_op() {
        let db = MockDb::default();
        let storage: SharedStorage = Arc::new(MockStorage::default());

        evict_one(&db, &storage, "missing").await.unwrap();

        assert!(db.deleted_info.lock().unwrap().is_empty());
    }
}
