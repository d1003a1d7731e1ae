//! Single-fetch deduplicator (C6).
//!
//! Ensures that within one process, concurrent requests for the same
//! artifact share a single upstream fetch rather than each re-fetching it.
//! Composed with an exclusive lock from [`crate::lock`] at the call site
//! for the cross-process dimension; this module only knows about
//! same-process callers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{broadcast, watch};

use crate::error::ServerError;

/// Artifact identity used to key in-flight fetches. Distinct namespaces
/// (info/NAR/chunk) must use distinct key prefixes to avoid an info fetch
/// and a NAR fetch it triggers colliding.
pub type FetchKey = String;

/// Terminal or in-progress state of a fetch, observed by waiters through a
/// `watch` channel.
#[derive(Clone)]
pub enum FetchState {
    Pending,
    Stored,
    Failed(Arc<ServerError>),
}

/// Whether the caller of `begin` must perform the fetch or just wait on it.
pub enum Role {
    /// Caller owns the fetch: perform it and report progress through the handle.
    Owner,
    /// Caller waits: another same-process caller is already fetching.
    Waiter,
}

/// Shared handle to an in-flight (or just-finished) fetch.
pub struct Handle {
    state: watch::Sender<FetchState>,
    chunks: broadcast::Sender<(i32, Bytes)>,
}

impl Handle {
    fn new() -> Self {
        let (state, _) = watch::channel(FetchState::Pending);
        let (chunks, _) = broadcast::channel(256);

        Self { state, chunks }
    }

    /// Subscribes to the fetch's state transitions. The returned receiver
    /// immediately observes the current state, including if it is already
    /// terminal.
    pub fn subscribe_state(&self) -> watch::Receiver<FetchState> {
        self.state.subscribe()
    }

    /// Subscribes to progressive chunk bytes published by the owner, each
    /// tagged with its chunk index. Attaching before "stored" is signalled
    /// lets a waiter stream the artifact with minimal time-to-first-byte;
    /// the index lets a waiter detect a gap (a missed or out-of-order
    /// chunk, from attaching late or from lagging the bounded channel) and
    /// fall back to reading the durable chunk store from that point on.
    pub fn subscribe_chunks(&self) -> broadcast::Receiver<(i32, Bytes)> {
        self.chunks.subscribe()
    }

    /// Published by the owner as bytes become available, before the
    /// artifact is durable.
    pub fn publish_chunk(&self, index: i32, bytes: Bytes) {
        // No receivers is fine: progressive readers are optional.
        let _ = self.chunks.send((index, bytes));
    }

    /// Published by the owner once the artifact is durable in the object
    /// or chunk store and its metadata row is committed.
    pub fn signal_stored(&self) {
        let _ = self.state.send(FetchState::Stored);
    }

    /// Published by the owner when the fetch fails; waiters observe the
    /// same error rather than each re-attempting it.
    pub fn signal_failed(&self, error: ServerError) {
        let _ = self.state.send(FetchState::Failed(Arc::new(error)));
    }

    /// Waits for the fetch to reach a terminal state.
    pub async fn wait_terminal(&self) -> Result<(), Arc<ServerError>> {
        let mut rx = self.subscribe_state();

        loop {
            match &*rx.borrow() {
                FetchState::Stored => return Ok(()),
                FetchState::Failed(e) => return Err(e.clone()),
                FetchState::Pending => {}
            }

            if rx.changed().await.is_err() {
                // Sender dropped without ever reaching a terminal state:
                // the owner task was aborted or panicked mid-fetch.
                return Err(Arc::new(ServerError::Canceled));
            }
        }
    }
}

/// Registry of in-flight fetches, keyed by artifact identity.
#[derive(Default)]
pub struct Deduplicator {
    inflight: Mutex<HashMap<FetchKey, Arc<Handle>>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in fetching `key`. The first caller becomes the
    /// `Owner` and is responsible for calling `signal_stored`/
    /// `signal_failed` on the returned handle and then [`Deduplicator::finish`].
    /// Every subsequent caller before `finish` is a `Waiter` sharing the
    /// same handle.
    pub fn begin(&self, key: FetchKey) -> (Role, Arc<Handle>) {
        let mut inflight = self.inflight.lock().unwrap();

        if let Some(handle) = inflight.get(&key) {
            return (Role::Waiter, handle.clone());
        }

        let handle = Arc::new(Handle::new());
        inflight.insert(key, handle.clone());
        (Role::Owner, handle)
    }

    /// Removes the fetch from the in-flight registry. Called by the owner
    /// once the handle has reached a terminal state; waiters that already
    /// hold a cloned `Arc<Handle>` keep observing it regardless.
    pub fn finish(&self, key: &str) {
        self.inflight.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn owner_then_waiter_share_one_handle() {
        let dedup = Deduplicator::new();

        let (role_a, handle_a) = dedup.begin("nar:abc".to_string());
        assert!(matches!(role_a, Role::Owner));

        let (role_b, handle_b) = dedup.begin("nar:abc".to_string());
        assert!(matches!(role_b, Role::Waiter));
        assert!(Arc::ptr_eq(&handle_a, &handle_b));

        handle_a.signal_stored();
        dedup.finish("nar:abc");

        handle_b.wait_terminal().await.unwrap();

        let (role_c, _) = dedup.begin("nar:abc".to_string());
        assert!(matches!(role_c, Role::Owner));
    }

    #[tokio::test]
    async fn waiter_observes_failure() {
        let dedup = Deduplicator::new();

        let (_, handle_a) = dedup.begin("info:xyz".to_string());
        let (_, handle_b) = dedup.begin("info:xyz".to_string());

        handle_a.signal_failed(ServerError::UpstreamUnavailable);
        dedup.finish("info:xyz");

        let err = handle_b.wait_terminal().await.unwrap_err();
        assert_eq!(err.name(), "UpstreamUnavailable");
    }
}
