//! Progress tracking for one scan: four disjoint sets of invocation uuids
//! moving through a fixed lattice (invoke -> pending, begin -> running,
//! end -> completed, data -> data-received).

use std::{
    collections::HashSet,
    sync::Arc,
};

use parking_lot::Mutex;

pub struct Progress {
    scan_id: String,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    pending: HashSet<String>,
    running: HashSet<String>,
    completed: HashSet<String>,
    data_received: HashSet<String>,
    invocation_done: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub data_received: usize,
    pub invocation_done: bool,
}

impl Progress {
    pub fn new(scan_id: String) -> Arc<Self> {
        Arc::new(Self {
            scan_id,
            inner: Mutex::new(Inner {
                seq: 1,
                ..Inner::default()
            }),
        })
    }

    pub fn scan_id(&self) -> &str {
        &self.scan_id
    }

    /// Mint the next invocation uuid, `{scan_id}:{seq}`.
    pub fn next_uuid(&self) -> String {
        let mut inner = self.inner.lock();
        let seq = inner.seq;
        inner.seq += 1;
        format!("{}:{seq}", self.scan_id)
    }

    fn owns(&self, uuid: &str) -> bool {
        uuid.strip_prefix(&self.scan_id)
            .is_some_and(|rest| rest.starts_with(':'))
    }

    pub fn set_invoked(&self, uuid: &str) {
        assert!(self.owns(uuid), "launched an invocation this scan doesn't own");
        self.inner.lock().pending.insert(uuid.to_string());
    }

    /// A launch that never made it out; forget it so the scan can finish.
    pub fn set_failed(&self, uuid: &str) {
        self.inner.lock().pending.remove(uuid);
    }

    pub fn set_running(&self, uuid: &str) {
        if !self.owns(uuid) {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.pending.remove(uuid) {
            inner.running.insert(uuid.to_string());
        }
    }

    pub fn set_done(&self, uuid: &str) {
        if !self.owns(uuid) {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.running.remove(uuid) {
            inner.completed.insert(uuid.to_string());
        }
        tracing::debug!(
            "progress now [{} {} {} {} {}]",
            inner.pending.len(),
            inner.running.len(),
            inner.completed.len(),
            inner.data_received.len(),
            inner.invocation_done,
        );
    }

    pub fn set_data(&self, uuid: &str) {
        if !self.owns(uuid) {
            return;
        }
        self.inner.lock().data_received.insert(uuid.to_string());
    }

    pub fn set_invocation_done(&self) {
        self.inner.lock().invocation_done = true;
    }

    /// Invocations launched but not yet finished.
    pub fn in_flight(&self) -> usize {
        let inner = self.inner.lock();
        inner.pending.len() + inner.running.len()
    }

    /// The scan is over: no more launches will happen, nothing is pending
    /// or running, and every completion has reported its data.
    pub fn all_done(&self) -> bool {
        let inner = self.inner.lock();
        inner.invocation_done
            && inner.pending.is_empty()
            && inner.running.is_empty()
            && inner.completed == inner.data_received
    }

    pub fn counts(&self) -> ProgressCounts {
        let inner = self.inner.lock();
        ProgressCounts {
            pending: inner.pending.len(),
            running: inner.running.len(),
            completed: inner.completed.len(),
            data_received: inner.data_received.len(),
            invocation_done: inner.invocation_done,
        }
    }
}
