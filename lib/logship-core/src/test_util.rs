//! Test doubles for exercising client chains without a network.

use std::sync::{
    atomic::{AtomicBool, Ordering::SeqCst},
    Arc, Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use logship_error::{generic_error, GenericError};

use crate::{LabelSet, LogClient, LogEntry};

/// A client that records everything it is given.
#[derive(Default)]
pub struct FakeClient {
    entries: Mutex<Vec<LogEntry>>,
    failing: AtomicBool,
    stopped: AtomicBool,
    gracefully_stopped: AtomicBool,
}

impl FakeClient {
    /// Creates a new, shareable `FakeClient`.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes subsequent calls to `handle` fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, SeqCst);
    }

    /// Returns a copy of every entry handled so far, in order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Returns `true` if `stop` was called.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(SeqCst)
    }

    /// Returns `true` if `stop_wait` was called.
    pub fn is_gracefully_stopped(&self) -> bool {
        self.gracefully_stopped.load(SeqCst)
    }
}

#[async_trait]
impl LogClient for FakeClient {
    async fn handle(&self, labels: LabelSet, timestamp: DateTime<Utc>, line: String) -> Result<(), GenericError> {
        if self.failing.load(SeqCst) {
            return Err(generic_error!("fake client is failing"));
        }

        self.entries.lock().unwrap().push(LogEntry::new(labels, timestamp, line));
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, SeqCst);
    }

    async fn stop_wait(&self) {
        self.gracefully_stopped.store(true, SeqCst);
    }
}
