//! In-process remote store with fault injection.
//!
//! Behaves like a well-mannered remote store (idempotent `create`, stable
//! `exists`) and lets callers script failures: transient errors, permanent
//! rejections, lost responses for writes that did land, added latency, or a
//! full outage.  Call counters make duplicate sends observable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

use super::{RemoteError, RemoteMessage, RemoteSyncClient};

/// What the next `create` call should do instead of succeeding normally.
#[derive(Debug, Clone)]
pub enum CreateFault {
    /// Fail without writing anything.
    Fail(RemoteError),
    /// Write the document, then report a transient failure as if the
    /// response had been lost.
    LoseResponse,
}

#[derive(Default)]
struct State {
    messages: HashMap<Uuid, RemoteMessage>,
    blobs: HashMap<String, Bytes>,
    create_calls: HashMap<Uuid, u32>,
    upload_calls: u32,
    exists_calls: u32,
    create_faults: VecDeque<CreateFault>,
    upload_faults: VecDeque<RemoteError>,
    exists_faults: VecDeque<RemoteError>,
    offline: bool,
    latency: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the counters from the others.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Every call fails transiently until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    pub fn push_create_fault(&self, fault: CreateFault) {
        self.state().create_faults.push_back(fault);
    }

    /// The next `n` creates fail transiently.
    pub fn fail_next_creates(&self, n: usize) {
        let mut state = self.state();
        for _ in 0..n {
            state
                .create_faults
                .push_back(CreateFault::Fail(RemoteError::Transient("injected".into())));
        }
    }

    /// The next create is rejected permanently.
    pub fn reject_next_create(&self, reason: &str) {
        self.push_create_fault(CreateFault::Fail(RemoteError::Permanent(reason.into())));
    }

    pub fn fail_next_uploads(&self, n: usize) {
        let mut state = self.state();
        for _ in 0..n {
            state
                .upload_faults
                .push_back(RemoteError::Transient("injected".into()));
        }
    }

    pub fn fail_next_exists(&self, n: usize) {
        let mut state = self.state();
        for _ in 0..n {
            state
                .exists_faults
                .push_back(RemoteError::Transient("injected".into()));
        }
    }

    /// Store a document directly, as if an earlier process had created it.
    pub fn insert(&self, message: RemoteMessage) {
        self.state().messages.insert(message.id, message);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn contains(&self, id: Uuid) -> bool {
        self.state().messages.contains_key(&id)
    }

    pub fn get(&self, id: Uuid) -> Option<RemoteMessage> {
        self.state().messages.get(&id).cloned()
    }

    pub fn message_count(&self) -> usize {
        self.state().messages.len()
    }

    pub fn blob_count(&self) -> usize {
        self.state().blobs.len()
    }

    /// `create` calls seen for one id, failed ones included.
    pub fn create_calls(&self, id: Uuid) -> u32 {
        self.state().create_calls.get(&id).copied().unwrap_or(0)
    }

    pub fn total_create_calls(&self) -> u32 {
        self.state().create_calls.values().sum()
    }

    pub fn upload_calls(&self) -> u32 {
        self.state().upload_calls
    }

    pub fn exists_calls(&self) -> u32 {
        self.state().exists_calls
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn enter(&self) -> Result<InFlight<'_>, RemoteError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let (latency, offline) = {
            let state = self.state();
            (state.latency, state.offline)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if offline {
            return Err(RemoteError::Transient("network unreachable".into()));
        }
        Ok(guard)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSyncClient for MemoryRemote {
    async fn create(&self, message: &RemoteMessage) -> Result<(), RemoteError> {
        *self.state().create_calls.entry(message.id).or_insert(0) += 1;
        let _guard = self.enter().await?;

        let mut state = self.state();
        match state.create_faults.pop_front() {
            Some(CreateFault::Fail(e)) => Err(e),
            Some(CreateFault::LoseResponse) => {
                state
                    .messages
                    .entry(message.id)
                    .or_insert_with(|| message.clone());
                Err(RemoteError::Transient("response lost".into()))
            }
            None => {
                state
                    .messages
                    .entry(message.id)
                    .or_insert_with(|| message.clone());
                Ok(())
            }
        }
    }

    async fn exists(&self, id: Uuid) -> Result<bool, RemoteError> {
        self.state().exists_calls += 1;
        let _guard = self.enter().await?;

        let mut state = self.state();
        match state.exists_faults.pop_front() {
            Some(e) => Err(e),
            None => Ok(state.messages.contains_key(&id)),
        }
    }

    async fn upload_blob(&self, bytes: Bytes) -> Result<String, RemoteError> {
        self.state().upload_calls += 1;
        let _guard = self.enter().await?;

        let mut state = self.state();
        if let Some(e) = state.upload_faults.pop_front() {
            return Err(e);
        }
        let url = format!("mem://blobs/{}", Uuid::new_v4());
        state.blobs.insert(url.clone(), bytes);
        Ok(url)
    }
}
