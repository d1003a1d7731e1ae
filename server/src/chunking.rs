//! Content-defined chunking engine (C7).
//!
//! Splits NARs into content-addressed chunks so that byte-identical
//! regions across different store paths are only ever stored once, and so
//! a small edit to a large NAR only touches the chunks around the edit.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_compression::tokio::bufread::{ZstdDecoder, ZstdEncoder};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

use pullcache_core::chunking::chunk_stream;
use pullcache_core::io::merge_chunks;

use crate::config::ChunkingConfig;
use crate::database::entity::chunk::ChunkModel;
use crate::database::entity::nar_file::NarFileModel;
use crate::database::{NewChunk, Querier};
use crate::dedup::Handle as DedupHandle;
use crate::error::{ServerError, ServerResult};
use crate::storage::StorageBackend;

/// Shared handle to the configured storage backend, cheap to clone into
/// detached streams and tasks.
pub type SharedStorage = Arc<dyn StorageBackend>;

/// Number of chunks fetched concurrently ahead of the reader during the
/// read path, overlapping C3 latency with caller-side I/O.
const READ_PREFETCH: usize = 4;

/// How long a `chunking_started_at` marker is trusted before a second
/// writer is allowed to recover the row as abandoned.
pub const CHUNKING_LOCK_TTL: Duration = Duration::from_secs(300);

async fn compress_chunk(bytes: Bytes) -> ServerResult<Bytes> {
    let mut encoder = ZstdEncoder::new(BufReader::new(Cursor::new(bytes)));
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).await.map_err(ServerError::storage_error)?;
    Ok(Bytes::from(out))
}

async fn decompress_chunk(bytes: Bytes) -> ServerResult<Bytes> {
    let mut decoder = ZstdDecoder::new(BufReader::new(Cursor::new(bytes)));
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).await.map_err(ServerError::storage_error)?;
    Ok(Bytes::from(out))
}

fn chunk_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest)
}

/// Chunks `nar_stream` (already decompressed to plaintext), writing each
/// chunk to the chunk store and linking it to `nar_file`, then flips the
/// row to fully-chunked. Bytes are also published to `progress` as they
/// are produced, so same-process waiters can stream along before this
/// function returns; `progress` is signalled `stored` as soon as the first
/// chunk is durably linked, rather than waiting for the whole NAR to
/// finish chunking, so waiters get a minimal time-to-first-byte.
pub async fn run_write_path<D>(
    db: &D,
    storage: &SharedStorage,
    nar_file: &NarFileModel,
    nar_stream: impl AsyncRead + Unpin + Send,
    chunking: &ChunkingConfig,
    progress: Option<&DedupHandle>,
) -> ServerResult<()>
where
    D: Querier,
{
    let mut stream = chunk_stream(
        nar_stream,
        chunking.cdc_min_chunk_size,
        chunking.cdc_avg_chunk_size,
        chunking.cdc_max_chunk_size,
    );

    let mut index = 0i32;
    let mut stored_signalled = false;

    while let Some(chunk) = stream.next().await {
        let plaintext = chunk.map_err(ServerError::io_error)?;

        if let Some(progress) = progress {
            progress.publish_chunk(index, plaintext.clone());
        }

        let hash = chunk_hash(&plaintext);
        let chunk_size = plaintext.len() as i64;
        let compressed = compress_chunk(plaintext).await?;
        let compressed_size = compressed.len() as i64;

        let object_name = format!("chunks/{hash}");
        let mut reader = Cursor::new(compressed);
        let remote_file = storage.upload_file(object_name.clone(), &mut reader).await?;
        let remote_file_id = remote_file.remote_file_id();

        let chunk_row = db
            .create_chunk(NewChunk {
                chunk_hash: hash,
                chunk_size,
                compressed_size,
                compression: "zstd".to_string(),
                remote_file,
                remote_file_id,
            })
            .await?;

        db.link_nar_file_to_chunk(nar_file.id, index, chunk_row.id).await?;
        index += 1;

        if !stored_signalled {
            if let Some(progress) = progress {
                progress.signal_stored();
            }
            stored_signalled = true;
        }
    }

    db.set_nar_file_total_chunks(nar_file.id, index).await?;

    // An empty NAR never entered the loop above, so the row only becomes
    // readable once `total_chunks` is flipped here.
    if !stored_signalled {
        if let Some(progress) = progress {
            progress.signal_stored();
        }
    }

    Ok(())
}

/// Returns `true` if `nar_file`'s chunking marker is stale enough that a
/// new writer may reclaim it.
pub fn is_chunking_lock_stale(nar_file: &NarFileModel) -> bool {
    match nar_file.chunking_started_at {
        None => false,
        Some(started_at) => Utc::now().signed_duration_since(started_at).to_std().unwrap_or(Duration::ZERO) > CHUNKING_LOCK_TTL,
    }
}

/// Tears down a partially-chunked NARFile left behind by a writer whose
/// `chunking_started_at` marker went stale, so a new writer can restart
/// from scratch. Deletes NARFileChunk links and any Chunk rows left with
/// no other links; physical chunk bytes are best-effort (a failed delete
/// here is picked up later by the evictor's orphan sweep).
pub async fn recover_stale_chunking<D>(db: &D, storage: &SharedStorage, nar_file_id: i64) -> ServerResult<()>
where
    D: Querier,
{
    let chunks = db.get_chunks_by_nar_file_id(nar_file_id).await?;

    db.clear_nar_file_chunk_links(nar_file_id).await?;

    for chunk in chunks.into_iter().flatten() {
        if db.chunk_has_other_links(chunk.id).await? {
            continue;
        }

        if let Err(e) = storage.delete_file_db(&chunk.remote_file.0).await {
            tracing::warn!("best-effort chunk delete failed during stale-lock recovery: {e}");
        }

        db.delete_orphan_chunk(chunk.id).await?;
    }

    db.set_nar_file_chunking_started(nar_file_id, None).await?;

    Ok(())
}

/// Reassembles a fully-chunked NARFile into a single byte stream, ordered
/// by chunk index, prefetching `READ_PREFETCH` chunks ahead of the reader.
/// `skip` drops the first `skip` chunks, for a caller that already has
/// them from another source (a progressive waiter that consumed the start
/// of the NAR off the in-process broadcast channel before falling back to
/// the durable store).
pub async fn run_read_path<D>(
    db: &D,
    storage: SharedStorage,
    nar_file_id: i64,
    skip: usize,
) -> ServerResult<BoxStream<'static, Result<Bytes, ServerError>>>
where
    D: Querier,
{
    let chunks: VecDeque<ChunkModel> = db
        .get_chunks_by_nar_file_id(nar_file_id)
        .await?
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| ServerError::inconsistent_state(anyhow::anyhow!("NAR file {nar_file_id} has a gap in its chunk sequence")))?
        .into_iter()
        .skip(skip)
        .collect();

    let streamer = |chunk: ChunkModel, storage: SharedStorage| async move {
        let plaintext = read_chunk_bytes(&storage, &chunk).await?;

        let s: BoxStream<'static, Result<Bytes, ServerError>> =
            Box::pin(futures::stream::once(async move { Ok(plaintext) }));
        Ok(s)
    };

    Ok(merge_chunks(chunks, streamer, storage, READ_PREFETCH).boxed())
}

/// Downloads and decompresses a single chunk. Used by [`run_read_path`]'s
/// prefetch pipeline and by a cross-process waiter polling for chunks that
/// have committed since it last checked, ahead of the NAR being fully
/// chunked.
pub async fn read_chunk_bytes(storage: &SharedStorage, chunk: &ChunkModel) -> ServerResult<Bytes> {
    let download = storage.download_file_db(&chunk.remote_file.0).await?;
    let compressed = read_download(download).await?;
    decompress_chunk(compressed).await
}

async fn read_download(download: crate::storage::Download) -> ServerResult<Bytes> {
    use crate::storage::Download;

    match download {
        Download::Redirect(_) => Err(ServerError::inconsistent_state(anyhow::anyhow!(
            "chunk store returned a redirect instead of bytes"
        ))),
        Download::Stream(mut reader) => {
            let mut buf = BytesMut::new();

            loop {
                let n = reader.read_buf(&mut buf).await.map_err(ServerError::storage_error)?;
                if n == 0 {
                    break;
                }
            }

            Ok(buf.freeze())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nar_file_with_chunking_started(started_at: Option<chrono::DateTime<Utc>>) -> NarFileModel {
        NarFileModel {
            id: 1,
            hash: "abc".to_string(),
            compression: "none".to_string(),
            query: "".to_string(),
            file_size: 0,
            total_chunks: 0,
            chunking_started_at: started_at,
            created_at: Utc::now(),
            last_accessed_at: None,
        }
    }

    #[test]
    fn no_marker_is_never_stale() {
        assert!(!is_chunking_lock_stale(&nar_file_with_chunking_started(None)));
    }

    #[test]
    fn fresh_marker_is_not_stale() {
        let nar_file = nar_file_with_chunking_started(Some(Utc::now()));
        assert!(!is_chunking_lock_stale(&nar_file));
    }

    #[test]
    fn marker_past_the_ttl_is_stale() {
        let started_at = Utc::now() - chrono::Duration::from_std(CHUNKING_LOCK_TTL).unwrap() - chrono::Duration::seconds(1);
        let nar_file = nar_file_with_chunking_started(Some(started_at));
        assert!(is_chunking_lock_stale(&nar_file));
    }

    #[test]
    fn chunk_hash_is_stable_and_content_derived() {
        assert_eq!(chunk_hash(b"hello"), chunk_hash(b"hello"));
        assert_ne!(chunk_hash(b"hello"), chunk_hash(b"world"));
    }
}
