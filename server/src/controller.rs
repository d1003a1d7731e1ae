//! Cache controller (C8).
//!
//! Orchestrates the full request lifecycle for the four client-facing
//! operations: look up locally, coordinate a single upstream fetch across
//! processes and in-process callers, persist the result, and reply.

use std::io::Cursor;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::time::Instant;

use crate::chunking::{self, SharedStorage};
use crate::config::{ChunkingConfig, CompressionConfig};
use crate::database::entity::info_record::InfoRecordModel;
use crate::database::entity::nar_file::NarFileModel;
use crate::database::{NewInfoRecord, NewNarFile, Querier};
use crate::decompression::StreamingDecompressor;
use crate::dedup::{Deduplicator, FetchState, Handle as DedupHandle, Role};
use crate::error::{ServerError, ServerResult};
use crate::lock::{Locker, NS_INFO, NS_NAR};
use crate::narinfo::{Compression, NarInfo};
use crate::storage::Download;
use crate::upstream::UpstreamPool;
use pullcache_core::hash::Hash;
use pullcache_core::signing::NixKeypair;

/// Re-exported so callers wiring up a controller don't need a second import
/// for the chunking marker's staleness window.
pub use chunking::CHUNKING_LOCK_TTL;

/// Everything the controller needs to carry out `GetInfoRecord`/`GetNAR`/
/// `PutInfoRecord`/`PutNAR`. Generic over the database type so tests can
/// substitute an in-memory `Querier`.
pub struct CacheController<D: Querier> {
    db: Arc<D>,
    storage: SharedStorage,
    locker: Arc<dyn Locker>,
    dedup: Arc<Deduplicator>,
    upstream: Arc<UpstreamPool>,
    keypair: Arc<NixKeypair>,
    chunking: ChunkingConfig,
    #[allow(dead_code)] // consulted once non-default-level local compression lands
    compression: CompressionConfig,
    cache_sign_info_record: bool,
    record_age_ignore_touch: Duration,
    download_poll_timeout: Duration,
    download_lock_ttl: Duration,
}

fn compression_extension(compression: &str) -> &'static str {
    match compression {
        "xz" => ".xz",
        "bzip2" => ".bz2",
        "br" => ".br",
        "zstd" => ".zst",
        _ => "",
    }
}

/// Maps a narinfo `Compression` string to the codec name
/// [`StreamingDecompressor`] understands.
fn decompressor_kind(compression: &str) -> ServerResult<&'static str> {
    match compression {
        "none" => Ok(""),
        "xz" => Ok("xz"),
        "br" => Ok("br"),
        "zstd" => Ok("zstd"),
        other => Err(ServerError::request_error(anyhow::anyhow!(
            "cannot decode upstream compression `{other}` for chunking"
        ))),
    }
}

pub(crate) fn nar_object_name(hash: &str, compression: &str, query: &str) -> String {
    if query.is_empty() {
        format!("nar/{hash}.nar{}", compression_extension(compression))
    } else {
        let query_hash = hex::encode(Sha256::digest(query.as_bytes()));
        format!("nar/{hash}.nar{}.q{query_hash}", compression_extension(compression))
    }
}

fn nar_url(nar: &NarFileModel) -> String {
    let mut url = format!("nar/{}.nar{}", nar.hash, compression_extension(&nar.compression));
    if !nar.query.is_empty() {
        url.push('?');
        url.push_str(&nar.query);
    }
    url
}

fn nar_url_path(hash: &str, compression: &str, query: &str) -> String {
    nar_url(&NarFileModel {
        id: 0,
        hash: hash.to_string(),
        compression: compression.to_string(),
        query: query.to_string(),
        file_size: 0,
        total_chunks: 0,
        chunking_started_at: None,
        created_at: Utc::now(),
        last_accessed_at: None,
    })
}

fn fetch_key(hash: &str, compression: &str, query: &str) -> String {
    format!("{hash}:{compression}:{query}")
}

/// Whether a NAR file row's content can be read right now, either whole or
/// via the chunk store, without waiting on an in-progress fetch.
fn nar_present(nar: &NarFileModel) -> bool {
    nar.total_chunks > 0 || nar.chunking_started_at.is_none()
}

/// Renders a `ServerError` to a fresh, equivalent instance. `ServerError`
/// doesn't implement `Clone` (its variants wrap `anyhow::Error`), but every
/// waiter observing a failed fetch needs its own copy of the terminal state.
fn render_error(e: &ServerError) -> ServerError {
    ServerError::inconsistent_state(anyhow::anyhow!(e.to_string()))
}

/// An `AsyncRead` wrapper that counts bytes read through it, so callers can
/// learn the size of a stream whose length the storage backend doesn't hand
/// back (local disk just returns a `RemoteFile` reference, not a byte count).
struct CountingReader<R> {
    inner: R,
    count: Arc<AtomicU64>,
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let read = buf.filled().len() - before;
            self.count.fetch_add(read as u64, Ordering::Relaxed);
        }
        result
    }
}

async fn download_to_bytes(download: Download) -> ServerResult<Bytes> {
    match download {
        Download::Redirect(_) => Err(ServerError::inconsistent_state(anyhow::anyhow!(
            "object store returned a redirect for a resource that must be read locally"
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

fn stream_whole_file(download: Download) -> BoxStream<'static, Result<Bytes, ServerError>> {
    let s = try_stream! {
        let bytes = download_to_bytes(download).await?;
        yield bytes;
    };

    Box::pin(s)
}

/// The stream a `Waiter` reads: early chunks as the owner publishes them
/// over the broadcast channel, then (once the fetch reaches a terminal
/// state) the remainder read back from the durable store. The broadcast
/// channel is lossy and a waiter may attach after earlier chunks already
/// went out, so chunks are only accepted in order starting from index 0;
/// the first gap (an out-of-order index, a lag, or the channel closing)
/// ends the broadcast phase and the rest of the NAR is served durably
/// from wherever the waiter left off, never by re-reading from the start.
fn progressive_waiter_stream(
    controller: Arc<CacheController<impl Querier + 'static>>,
    hash: String,
    compression: String,
    query: String,
    handle: Arc<DedupHandle>,
) -> BoxStream<'static, Result<Bytes, ServerError>> {
    let s = try_stream! {
        let mut chunks = handle.subscribe_chunks();
        let mut state = handle.subscribe_state();
        let mut next_index = 0i32;

        loop {
            tokio::select! {
                biased;

                chunk = chunks.recv() => {
                    match chunk {
                        Ok((index, bytes)) if index == next_index => {
                            yield bytes;
                            next_index += 1;
                        }
                        Ok((index, _)) if index < next_index => continue,
                        Ok(_) => break, // gap: an earlier chunk was missed
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() || !matches!(&*state.borrow(), FetchState::Pending) {
                        break;
                    }
                }
            }
        }

        if let Err(e) = handle.wait_terminal().await {
            Err(ServerError::inconsistent_state(anyhow::anyhow!(e.to_string())))?;
        }

        let nar = controller
            .db
            .get_nar_file_by_hash_and_compression_and_query(&hash, &compression, &query)
            .await?
            .ok_or_else(|| ServerError::inconsistent_state(anyhow::anyhow!("NAR fetch reported success but no row exists")))?;

        let mut rest = controller
            .try_stream_present_from(&nar, next_index as usize)
            .await?
            .ok_or_else(|| ServerError::inconsistent_state(anyhow::anyhow!("NAR row committed but still mid-chunking")))?;

        while let Some(bytes) = rest.next().await {
            yield bytes?;
        }
    };

    Box::pin(s)
}

fn build_narinfo(info: &InfoRecordModel, nar: &NarFileModel) -> ServerResult<NarInfo> {
    Ok(NarInfo {
        store_path: info.store_path.clone().into(),
        url: nar_url(nar),
        compression: Compression::from_str(&info.compression)?,
        file_hash: info.file_hash.as_ref().map(|h| Hash::from_typed(h)).transpose()?,
        file_size: info.file_size.map(|s| s as usize),
        nar_hash: Hash::from_typed(&info.nar_hash)?,
        nar_size: info.nar_size as usize,
        references: info.references.0.clone(),
        system: info.system.clone(),
        deriver: info.deriver.clone(),
        signature: info.sigs.0.first().cloned(),
        ca: info.ca.clone(),
    })
}

fn info_record_from_narinfo(hash: &str, narinfo: &NarInfo) -> NewInfoRecord {
    NewInfoRecord {
        hash: hash.to_string(),
        store_path: narinfo.store_path.to_string_lossy().into_owned(),
        compression: narinfo.compression.as_str().to_string(),
        file_hash: narinfo.file_hash.as_ref().map(|h| h.to_typed_base32()),
        file_size: narinfo.file_size.map(|s| s as i64),
        nar_hash: narinfo.nar_hash.to_typed_base32(),
        nar_size: narinfo.nar_size as i64,
        sigs: narinfo.signature().cloned().into_iter().collect(),
        references: narinfo.references.clone(),
        system: narinfo.system.clone(),
        deriver: narinfo.deriver.clone(),
        ca: narinfo.ca.clone(),
    }
}

/// Rewrites an info record's compression-related fields to the CDC
/// convention (`compression=none`, extension-less URL, no whole-file size
/// or hash) when the NAR is large enough to be chunked rather than stored
/// whole.
fn normalize_for_cdc(narinfo: &mut NarInfo, chunking: &ChunkingConfig) {
    if chunking.cdc_enabled && narinfo.nar_size >= chunking.nar_size_threshold {
        narinfo.compression = Compression::None;
        narinfo.url = format!("nar/{}", narinfo.nar_hash.to_typed_base32());
        narinfo.file_size = None;
        narinfo.file_hash = None;
    }
}

/// Extracts the base32 store-path hash segment from a narinfo's `StorePath`
/// (e.g. `p4pclmv1gyja5kzc26npqpia1qqxrf0l` out of
/// `/nix/store/p4pclmv1gyja5kzc26npqpia1qqxrf0l-ruby-2.7.3`). This is the
/// same raw string used as the `hash` column and in narinfo URLs, not a
/// typed `sha256:...` hash (the store-path hash is a truncated digest, not
/// a full SHA-256).
fn info_hash_from_store_path(narinfo: &NarInfo) -> ServerResult<String> {
    let file_name = narinfo
        .store_path
        .file_name()
        .ok_or_else(|| ServerError::request_error(anyhow::anyhow!("store path has no file name")))?
        .to_string_lossy();

    let hash = file_name.split_once('-').map(|(hash, _)| hash).unwrap_or(&file_name);

    Ok(hash.to_string())
}

/// Splits a narinfo `URL` field (e.g. `nar/HASH.nar.xz?foo=bar`) into its
/// (hash, compression, query) identity.
pub(crate) fn parse_nar_url(relative_url: &str) -> ServerResult<(String, String, String)> {
    let (path, query) = relative_url.split_once('?').unwrap_or((relative_url, ""));
    let file_name = path
        .rsplit('/')
        .next()
        .ok_or_else(|| ServerError::request_error(anyhow::anyhow!("empty NAR URL")))?;

    let (hash, ext) = file_name
        .strip_suffix(".nar")
        .map(|h| (h, ""))
        .or_else(|| file_name.split_once(".nar.").map(|(h, ext)| (h, ext)))
        .ok_or_else(|| ServerError::request_error(anyhow::anyhow!("NAR URL `{file_name}` has no .nar component")))?;

    let compression = match ext {
        "" => "none",
        "xz" => "xz",
        "bz2" => "bzip2",
        "br" => "br",
        "zst" => "zstd",
        other => return Err(ServerError::request_error(anyhow::anyhow!("unknown NAR extension `{other}`"))),
    };

    Ok((hash.to_string(), compression.to_string(), query.to_string()))
}

impl<D: Querier + 'static> CacheController<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<D>,
        storage: SharedStorage,
        locker: Arc<dyn Locker>,
        dedup: Arc<Deduplicator>,
        upstream: Arc<UpstreamPool>,
        keypair: Arc<NixKeypair>,
        chunking: ChunkingConfig,
        compression: CompressionConfig,
        cache_sign_info_record: bool,
        record_age_ignore_touch: Duration,
        download_poll_timeout: Duration,
        download_lock_ttl: Duration,
    ) -> Self {
        Self {
            db,
            storage,
            locker,
            dedup,
            upstream,
            keypair,
            chunking,
            compression,
            cache_sign_info_record,
            record_age_ignore_touch,
            download_poll_timeout,
            download_lock_ttl,
        }
    }

    /// `GetInfoRecord(hash)`.
    pub async fn get_info_record(self: &Arc<Self>, hash: &str) -> ServerResult<NarInfo> {
        if let Some((info, nar, _)) = self.db.get_info_record_with_nar(hash).await? {
            if nar_present(&nar) {
                self.maybe_touch_info_record(info.id, info.last_accessed_at).await?;
                return build_narinfo(&info, &nar);
            }
        }

        let guard = self.locker.lock(NS_INFO, hash, self.download_lock_ttl).await?;

        // Double-checked: another process may have fetched it while we waited.
        if let Some((info, nar, _)) = self.db.get_info_record_with_nar(hash).await? {
            if nar_present(&nar) {
                drop(guard);
                self.maybe_touch_info_record(info.id, info.last_accessed_at).await?;
                return build_narinfo(&info, &nar);
            }
        }

        let (body, upstream) = self.upstream.get_info(hash).await?;
        let mut narinfo = NarInfo::from_str(&body)?;

        if !upstream.public_keys.is_empty() {
            let fingerprint = narinfo.fingerprint();
            let signature = narinfo.signature().ok_or(ServerError::SignatureVerificationFailed)?.clone();
            let verified = upstream.public_keys.iter().any(|key| key.verify(&fingerprint, &signature).is_ok());

            if !verified {
                return Err(ServerError::SignatureVerificationFailed);
            }
        }

        narinfo.signature = None;
        normalize_for_cdc(&mut narinfo, &self.chunking);

        if self.cache_sign_info_record {
            narinfo.sign(&self.keypair);
        }

        let info = self.db.upsert_info_record(info_record_from_narinfo(hash, &narinfo)).await?;
        drop(guard);

        let prefetch_url = narinfo.url.clone();
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(e) = controller.prefetch_nar(info.id, &prefetch_url).await {
                tracing::warn!("background NAR prefetch for info record {} failed: {e}", info.id);
            }
        });

        Ok(narinfo)
    }

    async fn maybe_touch_info_record(&self, id: i64, last_accessed_at: Option<chrono::DateTime<Utc>>) -> ServerResult<()> {
        let now = Utc::now();
        let stale = match last_accessed_at {
            None => true,
            Some(t) => now.signed_duration_since(t).to_std().unwrap_or(Duration::ZERO) > self.record_age_ignore_touch,
        };

        if stale {
            self.db.touch_info_record(id, now).await?;
        }

        Ok(())
    }

    /// Fetches and links the NAR referenced by a just-fetched info record's
    /// `URL` field, in the background so an HTTP response for
    /// `GetInfoRecord` is not held up waiting for it.
    async fn prefetch_nar(self: Arc<Self>, info_record_id: i64, relative_url: &str) -> ServerResult<()> {
        let (hash, compression, query) = parse_nar_url(relative_url)?;
        let _stream = self.get_nar(&hash, &compression, &query).await?;

        if let Some(nar) = self
            .db
            .get_nar_file_by_hash_and_compression_and_query(&hash, &compression, &query)
            .await?
        {
            self.db.link_info_to_nar_file(info_record_id, nar.id).await?;
        }

        Ok(())
    }

    /// `GetNAR(hash, compression, query)`.
    pub async fn get_nar(
        self: &Arc<Self>,
        hash: &str,
        compression: &str,
        query: &str,
    ) -> ServerResult<BoxStream<'static, Result<Bytes, ServerError>>> {
        if let Some(nar) = self.db.get_nar_file_by_hash_and_compression_and_query(hash, compression, query).await? {
            if let Some(stream) = self.try_stream_present(&nar).await? {
                return Ok(stream);
            }
        }

        let key = fetch_key(hash, compression, query);
        let (role, handle) = self.dedup.begin(key.clone());

        match role {
            Role::Owner => {
                let result = self.own_nar_fetch(hash, compression, query, &handle).await;
                self.dedup.finish(&key);

                match result? {
                    Some(stream) => Ok(stream),
                    None => self.stream_after_fetch(hash, compression, query).await,
                }
            }
            Role::Waiter => Ok(progressive_waiter_stream(
                self.clone(),
                hash.to_string(),
                compression.to_string(),
                query.to_string(),
                handle,
            )),
        }
    }

    /// Returns a stream if `nar` is already readable locally (whole file or
    /// fully chunked), `None` if it's missing or still being fetched.
    async fn try_stream_present(&self, nar: &NarFileModel) -> ServerResult<Option<BoxStream<'static, Result<Bytes, ServerError>>>> {
        self.try_stream_present_from(nar, 0).await
    }

    /// Like [`Self::try_stream_present`], but for the chunked case skips
    /// the first `skip_chunks` chunks — for a progressive waiter that
    /// already has them from the in-process broadcast channel.
    async fn try_stream_present_from(
        &self,
        nar: &NarFileModel,
        skip_chunks: usize,
    ) -> ServerResult<Option<BoxStream<'static, Result<Bytes, ServerError>>>> {
        if nar.total_chunks > 0 {
            return Ok(Some(chunking::run_read_path(&*self.db, self.storage.clone(), nar.id, skip_chunks).await?));
        }

        if skip_chunks == 0 && nar.chunking_started_at.is_none() {
            let object_name = nar_object_name(&nar.hash, &nar.compression, &nar.query);
            let download = self.storage.download_file(object_name).await?;
            return Ok(Some(stream_whole_file(download)));
        }

        Ok(None)
    }

    /// Owner-side fetch for a NAR not yet present locally: tries for the
    /// cross-process lock; on success fetches from upstream and persists,
    /// on failure enters polling mode waiting for another process to do it.
    /// A poller that wins doesn't re-read the NAR from scratch afterward —
    /// it already streamed it progressively, so it returns that stream
    /// directly rather than `None` (which tells the caller to build a fresh
    /// one from the now-committed row).
    async fn own_nar_fetch(
        self: &Arc<Self>,
        hash: &str,
        compression: &str,
        query: &str,
        handle: &DedupHandle,
    ) -> ServerResult<Option<BoxStream<'static, Result<Bytes, ServerError>>>> {
        let lock_key = fetch_key(hash, compression, query);

        match self.locker.try_lock(NS_NAR, &lock_key, self.download_lock_ttl).await? {
            Some(guard) => {
                let result = self.fetch_and_store_nar(hash, compression, query, handle).await;
                drop(guard);

                if let Err(e) = &result {
                    handle.signal_failed(render_error(e));
                }

                result?;
                Ok(None)
            }
            None => {
                let result = self.poll_for_local_nar(hash, compression, query).await;

                match &result {
                    Ok(_) => handle.signal_stored(),
                    Err(e) => handle.signal_failed(render_error(e)),
                }

                result.map(Some)
            }
        }
    }

    /// Waits for another process to make `hash`/`compression`/`query`
    /// readable, streaming it progressively rather than blocking until
    /// chunking fully completes: once the NAR file row exists, any chunk
    /// already committed (by index) is streamed as soon as it's seen, so a
    /// polling reader gets bytes well before the NAR is fully chunked.
    async fn poll_for_local_nar(
        self: &Arc<Self>,
        hash: &str,
        compression: &str,
        query: &str,
    ) -> ServerResult<BoxStream<'static, Result<Bytes, ServerError>>> {
        let deadline = Instant::now() + self.download_poll_timeout;
        let hash = hash.to_string();
        let compression = compression.to_string();
        let query = query.to_string();
        let controller = self.clone();

        let s = try_stream! {
            let mut next_index = 0usize;

            'poll: loop {
                let nar = controller
                    .db
                    .get_nar_file_by_hash_and_compression_and_query(&hash, &compression, &query)
                    .await?;

                if let Some(nar) = &nar {
                    if nar.total_chunks > 0 {
                        let mut rest = controller
                            .try_stream_present_from(nar, next_index)
                            .await?
                            .ok_or_else(|| ServerError::inconsistent_state(anyhow::anyhow!("NAR row committed but still mid-chunking")))?;

                        while let Some(bytes) = rest.next().await {
                            yield bytes?;
                        }

                        break 'poll;
                    }

                    if nar.chunking_started_at.is_none() {
                        if next_index == 0 {
                            let mut rest = controller
                                .try_stream_present(nar)
                                .await?
                                .ok_or_else(|| ServerError::inconsistent_state(anyhow::anyhow!("NAR row committed but not yet readable")))?;

                            while let Some(bytes) = rest.next().await {
                                yield bytes?;
                            }
                        }

                        break 'poll;
                    }

                    let chunks = controller.db.get_chunks_by_nar_file_id(nar.id).await?;

                    for chunk in chunks.into_iter().skip(next_index) {
                        let Some(chunk) = chunk else { break };
                        let bytes = chunking::read_chunk_bytes(&controller.storage, &chunk).await?;
                        yield bytes;
                        next_index += 1;
                    }
                }

                if Instant::now() >= deadline {
                    Err(ServerError::LockUnavailable)?;
                }

                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };

        Ok(Box::pin(s))
    }

    /// Fetches from upstream and persists, holding the distributed NAR
    /// lock. Signals `stored` on the handle once the artifact is safely
    /// readable by waiters (for CDC, `chunking::run_write_path` does this
    /// itself as soon as the NAR file row exists).
    async fn fetch_and_store_nar(&self, hash: &str, compression: &str, query: &str, handle: &DedupHandle) -> ServerResult<()> {
        let relative_url = nar_url_path(hash, compression, query);
        let (body, _upstream) = self.upstream.get_nar_any(&relative_url).await?;

        if self.chunking.cdc_enabled {
            let kind = decompressor_kind(compression)?;
            let decompressed = StreamingDecompressor::new_unbuffered(body.reader, kind)?;

            let nar_file = self.claim_chunking_row(hash).await?;
            chunking::run_write_path(&*self.db, &self.storage, &nar_file, decompressed, &self.chunking, Some(handle)).await
        } else {
            let object_name = nar_object_name(hash, compression, query);
            let count = Arc::new(AtomicU64::new(0));
            let mut counted = CountingReader { inner: body.reader, count: count.clone() };
            self.storage.upload_file(object_name, &mut counted).await?;

            self.db
                .create_nar_file(NewNarFile {
                    hash: hash.to_string(),
                    compression: compression.to_string(),
                    query: query.to_string(),
                    file_size: count.load(Ordering::Relaxed) as i64,
                })
                .await?;

            handle.signal_stored();
            Ok(())
        }
    }

    /// Finds (or creates) the unchunked NAR file row this fetch will chunk
    /// into, recovering a stale chunking marker left by a crashed writer.
    async fn claim_chunking_row(&self, hash: &str) -> ServerResult<NarFileModel> {
        match self.db.get_nar_file_by_hash_and_compression_and_query(hash, "none", "").await? {
            Some(existing) if existing.chunking_started_at.is_some() => {
                if chunking::is_chunking_lock_stale(&existing) {
                    chunking::recover_stale_chunking(&*self.db, &self.storage, existing.id).await?;
                }
                self.db.set_nar_file_chunking_started(existing.id, Some(Utc::now())).await?;
                Ok(existing)
            }
            Some(existing) => {
                self.db.set_nar_file_chunking_started(existing.id, Some(Utc::now())).await?;
                Ok(existing)
            }
            None => {
                let created = self
                    .db
                    .create_nar_file(NewNarFile {
                        hash: hash.to_string(),
                        compression: "none".to_string(),
                        query: String::new(),
                        file_size: 0,
                    })
                    .await?;
                self.db.set_nar_file_chunking_started(created.id, Some(Utc::now())).await?;
                Ok(created)
            }
        }
    }

    async fn stream_after_fetch(
        self: &Arc<Self>,
        hash: &str,
        compression: &str,
        query: &str,
    ) -> ServerResult<BoxStream<'static, Result<Bytes, ServerError>>> {
        let nar = match self.db.get_nar_file_by_hash_and_compression_and_query(hash, compression, query).await? {
            Some(nar) => nar,
            None => self
                .db
                .get_nar_file_by_hash_and_compression_and_query(hash, "none", "")
                .await?
                .ok_or_else(|| ServerError::inconsistent_state(anyhow::anyhow!("NAR fetch reported success but no row exists")))?,
        };

        self.try_stream_present(&nar)
            .await?
            .ok_or_else(|| ServerError::inconsistent_state(anyhow::anyhow!("NAR row committed but still mid-chunking")))
    }

    /// `PutInfoRecord` — client-originated upload, idempotent. Also
    /// resolves and links the NARFile the narinfo's `URL` points to: if it
    /// already exists (e.g. another store path already uploaded the same
    /// content, or the client uploaded the NAR first), the new info record
    /// is linked to it rather than erroring; if it doesn't exist yet, a
    /// placeholder row is created so the link can be established now.
    pub async fn put_info_record(&self, body: &str) -> ServerResult<()> {
        let mut narinfo = NarInfo::from_str(body)?;
        let hash = info_hash_from_store_path(&narinfo)?;

        let guard = self.locker.lock(NS_INFO, &hash, self.download_lock_ttl).await?;
        normalize_for_cdc(&mut narinfo, &self.chunking);
        let info = self.db.upsert_info_record(info_record_from_narinfo(&hash, &narinfo)).await?;
        drop(guard);

        let (nar_hash, nar_compression, nar_query) = parse_nar_url(&narinfo.url)?;
        let nar_lock_key = fetch_key(&nar_hash, &nar_compression, &nar_query);
        let nar_guard = self.locker.lock(NS_NAR, &nar_lock_key, self.download_lock_ttl).await?;

        let nar = match self
            .db
            .get_nar_file_by_hash_and_compression_and_query(&nar_hash, &nar_compression, &nar_query)
            .await?
        {
            Some(nar) => nar,
            None => {
                self.db
                    .create_nar_file(NewNarFile {
                        hash: nar_hash,
                        compression: nar_compression,
                        query: nar_query,
                        file_size: narinfo.file_size.map(|s| s as i64).unwrap_or(narinfo.nar_size as i64),
                    })
                    .await?
            }
        };

        self.db.link_info_to_nar_file(info.id, nar.id).await?;
        drop(nar_guard);

        Ok(())
    }

    /// `PutNAR` — client-originated upload, idempotent. Stores the NAR
    /// whole; chunking (if eligible) happens lazily the first time it is
    /// read, same as an upstream-fetched NAR.
    pub async fn put_nar(
        &self,
        hash: &str,
        compression: &str,
        query: &str,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<()> {
        let guard = self.locker.lock(NS_NAR, &fetch_key(hash, compression, query), self.download_lock_ttl).await?;

        if self
            .db
            .get_nar_file_by_hash_and_compression_and_query(hash, compression, query)
            .await?
            .is_some()
        {
            drop(guard);
            return Ok(());
        }

        let object_name = nar_object_name(hash, compression, query);
        let count = Arc::new(AtomicU64::new(0));
        let mut counted = CountingReader { inner: stream, count: count.clone() };
        self.storage.upload_file(object_name, &mut counted).await?;

        self.db
            .create_nar_file(NewNarFile {
                hash: hash.to_string(),
                compression: compression.to_string(),
                query: query.to_string(),
                file_size: count.load(Ordering::Relaxed) as i64,
            })
            .await?;

        drop(guard);
        Ok(())
    }

    /// `MigrateNarToChunks(hash, compression)` — converts a whole-file NAR
    /// already stored under `compression` into chunked storage: reads the
    /// whole-file bytes back, chunks them into a fresh `compression=none`
    /// NAR file row, relinks every info record pointing at the old row onto
    /// the new one and normalizes them, then removes the old row and its
    /// object-store bytes. Returns `AlreadyChunked` if the target is already
    /// chunked, so a caller retrying after a crash between relinking and the
    /// final bytes delete gets a clean idempotent signal rather than redoing
    /// the (by then pointless) chunking work.
    pub async fn migrate_nar_to_chunks(self: &Arc<Self>, hash: &str, compression: &str, query: &str) -> ServerResult<()> {
        if compression == "none" && query.is_empty() {
            // Already the chunking convention's own identity: there is no
            // separate whole-file row to migrate off of, just the ordinary
            // lazy-chunking path this row would take on its next read.
            return Err(ServerError::request_error(anyhow::anyhow!(
                "NAR {hash} already uses the chunked storage identity; nothing to migrate"
            )));
        }

        let lock_key = fetch_key(hash, compression, query);
        let guard = self.locker.lock(NS_NAR, &lock_key, self.download_lock_ttl).await?;

        let old_nar = self.db.get_nar_file_by_hash_and_compression_and_query(hash, compression, query).await?;
        let target = self.db.get_nar_file_by_hash_and_compression_and_query(hash, "none", "").await?;

        if let Some(target) = &target {
            if target.total_chunks > 0 {
                // Migration already completed. Re-heal two things a caller
                // might have left behind or re-introduced since: a stale
                // whole-file row/bytes re-created under the old identity
                // (a crash between relinking at step 4 and the old-bytes
                // delete at step 5), and an info record whose columns were
                // reverted to the whole-file convention out from under an
                // already-correct link.
                self.db.renormalize_info_records_for_nar_file(target.id).await?;

                if let Some(old_nar) = old_nar {
                    if old_nar.id != target.id {
                        let object_name = nar_object_name(&old_nar.hash, &old_nar.compression, &old_nar.query);
                        if let Err(e) = self.storage.delete_file(object_name).await {
                            tracing::warn!("best-effort delete of stale whole-file bytes for {hash} failed: {e}");
                        }
                        self.db.delete_nar_file_by_id(old_nar.id).await?;
                    }
                }

                drop(guard);
                return Err(ServerError::AlreadyChunked);
            }
        }

        let old_nar = old_nar.ok_or(ServerError::NotFound)?;

        let object_name = nar_object_name(&old_nar.hash, &old_nar.compression, &old_nar.query);
        let download = self.storage.download_file(object_name.clone()).await?;
        let whole_file = download_to_bytes(download).await?;

        let kind = decompressor_kind(compression)?;
        let decompressed = StreamingDecompressor::new_unbuffered(Cursor::new(whole_file), kind)?;

        let new_nar = self.claim_chunking_row(hash).await?;
        chunking::run_write_path(&*self.db, &self.storage, &new_nar, decompressed, &self.chunking, None).await?;

        self.db.migrate_nar_file_links(old_nar.id, new_nar.id).await?;

        if let Err(e) = self.storage.delete_file(object_name).await {
            tracing::warn!("best-effort delete of migrated whole-file bytes for {hash} failed: {e}");
        }

        drop(guard);
        Ok(())
    }

    /// `DeleteInfoRecord` — removes the row only; any NAR file it links to
    /// is reclaimed later by the evictor once unreferenced.
    pub async fn delete_info_record(&self, hash: &str) -> ServerResult<()> {
        let guard = self.locker.lock(NS_INFO, hash, self.download_lock_ttl).await?;
        self.db.delete_info_record(hash).await?;
        drop(guard);
        Ok(())
    }

    /// `DeleteNAR` — refuses to remove a NAR file still linked from an info
    /// record, since that would leave a dangling reference.
    pub async fn delete_nar(&self, hash: &str, compression: &str, query: &str) -> ServerResult<()> {
        let lock_key = fetch_key(hash, compression, query);
        let guard = self.locker.lock(NS_NAR, &lock_key, self.download_lock_ttl).await?;

        if let Some(nar) = self.db.get_nar_file_by_hash_and_compression_and_query(hash, compression, query).await? {
            if self.db.nar_file_has_other_info_links(nar.id).await? {
                drop(guard);
                return Err(ServerError::inconsistent_state(anyhow::anyhow!(
                    "refusing to delete NAR file {} still linked from an info record",
                    nar.id
                )));
            }

            if nar.total_chunks > 0 {
                for chunk in self.db.get_chunks_by_nar_file_id(nar.id).await?.into_iter().flatten() {
                    if self.db.chunk_has_other_links(chunk.id).await? {
                        continue;
                    }
                    self.storage.delete_file_db(&chunk.remote_file.0).await?;
                    self.db.delete_orphan_chunk(chunk.id).await?;
                }
            } else {
                let object_name = nar_object_name(&nar.hash, &nar.compression, &nar.query);
                self.storage.delete_file(object_name).await?;
            }

            self.db.delete_nar_file_by_hash(&nar.hash).await?;
        }

        drop(guard);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_NARINFO: &str = r#"
StorePath: /nix/store/xcp9cav49dmsjbwdjlmkjxj10gkpx553-hello-2.10
URL: nar/0nqgf15qfiacfxrgm2wkw0gwwncjqqzzalj8rs14w9srkydkjsk9.nar.xz
Compression: xz
FileHash: sha256:0nqgf15qfiacfxrgm2wkw0gwwncjqqzzalj8rs14w9srkydkjsk9
FileSize: 41104
NarHash: sha256:16mvl7v0ylzcg2n3xzjn41qhzbmgcn5iyarx16nn5l2r36n2kqci
NarSize: 206104
References: 563528481rvhc5kxwipjmg6rqrl95mdx-glibc-2.33-56 xcp9cav49dmsjbwdjlmkjxj10gkpx553-hello-2.10
Deriver: vvb4wxmnjixmrkhmj2xb75z62hrr41i7-hello-2.10.drv
Sig: cache.nixos.org-1:lo9EfNIL4eGRuNh7DTbAAffWPpI2SlYC/8uP7JnhgmfRIUNGhSbFe8qEaKN0mFS02TuhPpXFPNtRkFcCp0hGAQ==
    "#;

    #[test]
    fn parse_nar_url_plain() {
        let (hash, compression, query) = parse_nar_url("nar/abc123.nar").unwrap();
        assert_eq!(hash, "abc123");
        assert_eq!(compression, "none");
        assert_eq!(query, "");
    }

    #[test]
    fn parse_nar_url_compressed_with_query() {
        let (hash, compression, query) = parse_nar_url("nar/abc123.nar.xz?foo=bar").unwrap();
        assert_eq!(hash, "abc123");
        assert_eq!(compression, "xz");
        assert_eq!(query, "foo=bar");
    }

    #[test]
    fn parse_nar_url_rejects_unknown_extension() {
        assert!(parse_nar_url("nar/abc123.nar.weird").is_err());
    }

    #[test]
    fn parse_nar_url_rejects_missing_nar_component() {
        assert!(parse_nar_url("nar/abc123").is_err());
    }

    #[test]
    fn nar_object_name_round_trips_through_parse_nar_url() {
        for (compression, ext) in [("none", ""), ("xz", ".xz"), ("bzip2", ".bz2"), ("br", ".br"), ("zstd", ".zst")] {
            let name = nar_object_name("abc123", compression, "");
            assert_eq!(name, format!("nar/abc123.nar{ext}"));

            let relative = name.strip_prefix("nar/").map(|p| format!("nar/{p}")).unwrap();
            let (hash, parsed_compression, query) = parse_nar_url(&relative).unwrap();
            assert_eq!(hash, "abc123");
            assert_eq!(parsed_compression, compression);
            assert_eq!(query, "");
        }
    }

    #[test]
    fn nar_object_name_includes_query_hash_when_present() {
        let a = nar_object_name("abc123", "xz", "foo=bar");
        let b = nar_object_name("abc123", "xz", "foo=baz");
        assert_ne!(a, b);
        assert!(a.starts_with("nar/abc123.nar.xz.q"));
    }

    #[test]
    fn fetch_key_is_distinct_per_identity_component() {
        assert_ne!(fetch_key("a", "xz", ""), fetch_key("b", "xz", ""));
        assert_ne!(fetch_key("a", "xz", ""), fetch_key("a", "none", ""));
        assert_ne!(fetch_key("a", "xz", "q=1"), fetch_key("a", "xz", "q=2"));
    }

    #[test]
    fn compression_extension_known_and_unknown() {
        assert_eq!(compression_extension("xz"), ".xz");
        assert_eq!(compression_extension("none"), "");
        assert_eq!(compression_extension("made-up"), "");
    }

    #[test]
    fn decompressor_kind_rejects_whatever_it_cannot_decode() {
        assert!(decompressor_kind("zstd").is_ok());
        assert!(decompressor_kind("made-up").is_err());
    }

    #[test]
    fn info_hash_from_store_path_extracts_the_hash_segment() {
        let narinfo = NarInfo::from_str(SAMPLE_NARINFO).unwrap();
        let hash = info_hash_from_store_path(&narinfo).unwrap();
        assert_eq!(hash, "xcp9cav49dmsjbwdjlmkjxj10gkpx553");
    }

    #[test]
    fn normalize_for_cdc_rewrites_large_nars_to_the_chunked_convention() {
        let mut narinfo = NarInfo::from_str(SAMPLE_NARINFO).unwrap();
        let chunking = ChunkingConfig {
            cdc_enabled: true,
            nar_size_threshold: 1024,
            cdc_min_chunk_size: 1,
            cdc_avg_chunk_size: 2,
            cdc_max_chunk_size: 4,
        };

        normalize_for_cdc(&mut narinfo, &chunking);

        assert_eq!(narinfo.compression, Compression::None);
        assert!(narinfo.file_size.is_none());
        assert!(narinfo.file_hash.is_none());
        assert_eq!(narinfo.url, format!("nar/{}", narinfo.nar_hash.to_typed_base32()));
    }

    #[test]
    fn normalize_for_cdc_leaves_small_nars_alone() {
        let mut narinfo = NarInfo::from_str(SAMPLE_NARINFO).unwrap();
        let original_url = narinfo.url.clone();
        let chunking = ChunkingConfig {
            cdc_enabled: true,
            nar_size_threshold: narinfo.nar_size + 1,
            cdc_min_chunk_size: 1,
            cdc_avg_chunk_size: 2,
            cdc_max_chunk_size: 4,
        };

        normalize_for_cdc(&mut narinfo, &chunking);

        assert_eq!(narinfo.url, original_url);
        assert!(narinfo.file_size.is_some());
    }

    #[test]
    fn nar_present_whole_file_vs_mid_chunking_vs_chunked() {
        let base = NarFileModel {
            id: 1,
            hash: "abc".to_string(),
            compression: "none".to_string(),
            query: "".to_string(),
            file_size: 0,
            total_chunks: 0,
            chunking_started_at: None,
            created_at: Utc::now(),
            last_accessed_at: None,
        };

        assert!(nar_present(&base));

        let mid_chunking = NarFileModel {
            chunking_started_at: Some(Utc::now()),
            ..base.clone()
        };
        assert!(!nar_present(&mid_chunking));

        let chunked = NarFileModel {
            total_chunks: 4,
            chunking_started_at: Some(Utc::now()),
            ..base
        };
        assert!(nar_present(&chunked));
    }
}
