//! Distributed lock service (C1).
//!
//! Coordinates fetches and maintenance operations across processes sharing
//! one metadata database. Exclusive locks are `SET key token NX PX ttl_ms`
//! with a compare-and-delete Lua script on release, keyed on the fencing
//! token so a holder can never release a lease it lost to TTL expiry and
//! someone else's re-acquisition. Shared/exclusive (RW) locks layer a
//! readers hash on top of the same writer key.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::LockRetryConfig;
use crate::error::{ServerError, ServerResult};

/// Lock namespaces, separated per artifact kind so an info-record fetch
/// and the NAR fetch it triggers never contend on the same key.
pub const NS_INFO: &str = "info";
pub const NS_NAR: &str = "nar";
pub const NS_CHUNK: &str = "chunk";
pub const NS_MAINTENANCE: &str = "maintenance";

fn lock_key(namespace: &str, key: &str) -> String {
    format!("pullcache:lock:{namespace}:{key}")
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the UNIX epoch")
        .as_millis() as i64
}

/// Releases an exclusive lock only if the stored value still matches the
/// caller's fencing token.
const UNLOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Removes this reader's entry from the readers hash. `KEYS[1]` is the
/// readers hash, `ARGV[1]` the reader's token.
const READ_UNLOCK_SCRIPT: &str = r#"
return redis.call("hdel", KEYS[1], ARGV[1])
"#;

/// Atomically purges expired reader entries, then admits a new reader iff
/// no writer holds the lock. `KEYS[1]` the writer key, `KEYS[2]` the
/// readers hash; `ARGV[1]` the reader token, `ARGV[2]` now (ms), `ARGV[3]`
/// the reader's own expiry (ms).
const READ_LOCK_SCRIPT: &str = r#"
if redis.call("exists", KEYS[1]) == 1 then
    return 0
end
local fields = redis.call("hgetall", KEYS[2])
for i = 1, #fields, 2 do
    if tonumber(fields[i + 1]) < tonumber(ARGV[2]) then
        redis.call("hdel", KEYS[2], fields[i])
    end
end
redis.call("hset", KEYS[2], ARGV[1], ARGV[3])
return 1
"#;

/// Atomically purges expired reader entries, then admits a writer iff no
/// live readers remain. Same key layout as `READ_LOCK_SCRIPT`; `ARGV[1]`
/// the writer token, `ARGV[2]` now (ms), `ARGV[3]` the writer's own PX
/// expiry in milliseconds.
const WRITE_LOCK_SCRIPT: &str = r#"
local fields = redis.call("hgetall", KEYS[2])
local live_readers = 0
for i = 1, #fields, 2 do
    if tonumber(fields[i + 1]) < tonumber(ARGV[2]) then
        redis.call("hdel", KEYS[2], fields[i])
    else
        live_readers = live_readers + 1
    end
end
if live_readers > 0 then
    return 0
end
if redis.call("set", KEYS[1], ARGV[1], "NX", "PX", ARGV[3]) then
    return 1
end
return 0
"#;

enum GuardKind {
    Exclusive { full_key: String },
    Read { readers_key: String },
    Write { full_key: String },
}

/// A held lock, released when dropped (or explicitly via [`LockGuard::unlock`]).
#[must_use = "the lock is released when this guard is dropped"]
pub struct LockGuard {
    client: Arc<LockClient>,
    token: String,
    kind: GuardKind,
}

impl LockGuard {
    /// Releases the lock immediately rather than waiting for `Drop`.
    pub async fn unlock(mut self) -> ServerResult<()> {
        self.release().await
    }

    async fn release(&mut self) -> ServerResult<()> {
        let mut conn = self.client.conn.clone();

        match &self.kind {
            GuardKind::Exclusive { full_key } | GuardKind::Write { full_key } => {
                Script::new(UNLOCK_SCRIPT)
                    .key(full_key)
                    .arg(&self.token)
                    .invoke_async::<_, i32>(&mut conn)
                    .await
                    .map_err(ServerError::storage_error)?;
            }
            GuardKind::Read { readers_key } => {
                Script::new(READ_UNLOCK_SCRIPT)
                    .key(readers_key)
                    .arg(&self.token)
                    .invoke_async::<_, i32>(&mut conn)
                    .await
                    .map_err(ServerError::storage_error)?;
            }
        }

        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let client = self.client.clone();
        let token = std::mem::take(&mut self.token);
        let kind = match &self.kind {
            GuardKind::Exclusive { full_key } => GuardKind::Exclusive { full_key: full_key.clone() },
            GuardKind::Read { readers_key } => GuardKind::Read { readers_key: readers_key.clone() },
            GuardKind::Write { full_key } => GuardKind::Write { full_key: full_key.clone() },
        };
        let mut guard = LockGuard { client, token, kind };

        tokio::spawn(async move {
            if let Err(e) = guard.release().await {
                warn!("failed to release lock on drop: {e}");
            }
        });
    }
}

/// Exclusive distributed lock, as specified by C1.
///
/// Takes `self: Arc<Self>` because a successful acquisition hands back a
/// [`LockGuard`] that holds its own `Arc` clone of the client, so `Drop` can
/// release the lease without borrowing from the caller.
#[async_trait::async_trait]
pub trait Locker: Send + Sync {
    /// Blocks (retrying with backoff) until the lock is acquired or the
    /// retry policy is exhausted, surfacing `LockUnavailable` in that case.
    async fn lock(self: &Arc<Self>, namespace: &'static str, key: &str, ttl: Duration) -> ServerResult<LockGuard>;

    /// Attempts to acquire the lock once, returning immediately.
    async fn try_lock(
        self: &Arc<Self>,
        namespace: &'static str,
        key: &str,
        ttl: Duration,
    ) -> ServerResult<Option<LockGuard>>;
}

/// Shared-or-exclusive distributed lock, as specified by C1. Used by
/// maintenance operations (eviction, CDC migration) that want to block
/// exclusive access without blocking ordinary readers against each other.
#[async_trait::async_trait]
pub trait RWLocker: Send + Sync {
    /// Acquires a shared lock, blocking out writers but not other readers.
    async fn read_lock(self: &Arc<Self>, namespace: &'static str, key: &str, ttl: Duration) -> ServerResult<LockGuard>;

    /// Acquires an exclusive lock, blocking out both readers and writers.
    async fn write_lock(
        self: &Arc<Self>,
        namespace: &'static str,
        key: &str,
        ttl: Duration,
    ) -> ServerResult<LockGuard>;
}

/// Redis-backed implementation of [`Locker`] and [`RWLocker`].
pub struct LockClient {
    conn: ConnectionManager,
    retry: LockRetryConfig,
}

impl LockClient {
    pub async fn connect(url: &str, retry: LockRetryConfig) -> ServerResult<Self> {
        let client = redis::Client::open(url).map_err(ServerError::storage_error)?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(ServerError::storage_error)?;

        Ok(Self { conn, retry })
    }

    async fn acquire_once(&self, namespace: &str, key: &str, ttl: Duration) -> ServerResult<Option<String>> {
        let full_key = lock_key(namespace, key);
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn.clone();

        let reply: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(&full_key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await;

        match reply.map_err(ServerError::storage_error)? {
            Some(_) => Ok(Some(token)),
            None => Ok(None),
        }
    }

    fn rw_keys(namespace: &str, key: &str) -> (String, String) {
        let base = lock_key(namespace, key);
        (format!("{base}:writer"), format!("{base}:readers"))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(&self.retry, attempt)
    }
}

fn backoff_delay(retry: &LockRetryConfig, attempt: u32) -> Duration {
    let exp = retry.initial_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
    let capped = exp.min(retry.max_delay.as_millis() as u64);

    if retry.jitter <= 0.0 {
        return Duration::from_millis(capped);
    }

    let jitter_span = (capped as f64 * retry.jitter) as i64;
    let offset = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    let jittered = (capped as i64 + offset).max(0) as u64;
    Duration::from_millis(jittered)
}

#[async_trait::async_trait]
impl Locker for LockClient {
    #[instrument(skip(self), fields(namespace, key))]
    async fn lock(self: &Arc<Self>, namespace: &'static str, key: &str, ttl: Duration) -> ServerResult<LockGuard> {
        for attempt in 0..self.retry.max_attempts {
            if let Some(token) = self.acquire_once(namespace, key, ttl).await? {
                return Ok(LockGuard {
                    client: self.clone(),
                    token,
                    kind: GuardKind::Exclusive { full_key: lock_key(namespace, key) },
                });
            }

            if attempt + 1 < self.retry.max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(ServerError::LockUnavailable)
    }

    async fn try_lock(
        self: &Arc<Self>,
        namespace: &'static str,
        key: &str,
        ttl: Duration,
    ) -> ServerResult<Option<LockGuard>> {
        Ok(self.acquire_once(namespace, key, ttl).await?.map(|token| LockGuard {
            client: self.clone(),
            token,
            kind: GuardKind::Exclusive { full_key: lock_key(namespace, key) },
        }))
    }
}

#[async_trait::async_trait]
impl RWLocker for LockClient {
    async fn read_lock(self: &Arc<Self>, namespace: &'static str, key: &str, ttl: Duration) -> ServerResult<LockGuard> {
        let (writer_key, readers_key) = Self::rw_keys(namespace, key);

        for attempt in 0..self.retry.max_attempts {
            let token = Uuid::new_v4().to_string();
            let now = now_millis();
            let mut conn = self.conn.clone();

            let admitted: i64 = Script::new(READ_LOCK_SCRIPT)
                .key(&writer_key)
                .key(&readers_key)
                .arg(&token)
                .arg(now)
                .arg(now + ttl.as_millis() as i64)
                .invoke_async(&mut conn)
                .await
                .map_err(ServerError::storage_error)?;

            if admitted == 1 {
                return Ok(LockGuard {
                    client: self.clone(),
                    token,
                    kind: GuardKind::Read { readers_key },
                });
            }

            if attempt + 1 < self.retry.max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(ServerError::LockUnavailable)
    }

    async fn write_lock(
        self: &Arc<Self>,
        namespace: &'static str,
        key: &str,
        ttl: Duration,
    ) -> ServerResult<LockGuard> {
        let (writer_key, readers_key) = Self::rw_keys(namespace, key);

        for attempt in 0..self.retry.max_attempts {
            let token = Uuid::new_v4().to_string();
            let now = now_millis();
            let mut conn = self.conn.clone();

            let admitted: i64 = Script::new(WRITE_LOCK_SCRIPT)
                .key(&writer_key)
                .key(&readers_key)
                .arg(&token)
                .arg(now)
                .arg(ttl.as_millis() as u64)
                .invoke_async(&mut conn)
                .await
                .map_err(ServerError::storage_error)?;

            if admitted == 1 {
                return Ok(LockGuard {
                    client: self.clone(),
                    token,
                    kind: GuardKind::Write { full_key: writer_key },
                });
            }

            if attempt + 1 < self.retry.max_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(ServerError::LockUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_max_delay() {
        let retry = LockRetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: 0.0,
        };

        assert_eq!(backoff_delay(&retry, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&retry, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(&retry, 10), Duration::from_millis(500));
    }
}
