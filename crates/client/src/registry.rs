//! In-memory table of tracked jobs and their subscribers.
//!
//! The map itself sits behind one `RwLock`; each entry has its own `Mutex`,
//! so updates to one handle are serialized while different handles proceed
//! in parallel. No lock is ever held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use jobwatch_core::{JobHandle, JobStatus};

pub type SubscriberId = u64;

/// What a subscriber observes for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum JobEvent {
    /// A fresh status from the backend.
    Status(JobStatus),
    /// Refreshing failed; `status` is the last known good value and `error`
    /// the failure as reported (backend message for rejected requests).
    Stale {
        status: JobStatus,
        staleness: u32,
        error: String,
    },
    /// The client stopped trusting this job's data (protocol error).
    Lost { reason: String },
}

impl JobEvent {
    /// Whether no further events follow this one.
    pub fn is_final(&self) -> bool {
        match self {
            JobEvent::Status(status) => status.is_terminal(),
            JobEvent::Stale { .. } => false,
            JobEvent::Lost { .. } => true,
        }
    }
}

/// Point-in-time copy of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub handle: JobHandle,
    pub status: JobStatus,
    pub status_path: String,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub subscriber_count: usize,
    /// Consecutive refreshes that failed since the last good poll.
    pub staleness: u32,
    pub lost: Option<String>,
}

impl JobSnapshot {
    /// Terminal, or abandoned after a protocol error.
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() || self.lost.is_some()
    }
}

/// Result of [`JobRegistry::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Same status as before; subscribers were not notified.
    Unchanged,
    /// Response to an outdated request, or the entry is already lost.
    Discarded,
    /// The update would regress the state machine; the entry is now lost.
    ProtocolViolation,
    Unknown,
}

/// A live subscription. Dropping `receiver` is not enough to free the slot;
/// call [`JobRegistry::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: UnboundedReceiver<JobEvent>,
    /// Subscribers on this handle, including this one.
    pub subscriber_count: usize,
}

#[derive(Debug)]
struct Entry {
    status: JobStatus,
    status_path: String,
    last_polled_at: Option<DateTime<Utc>>,
    staleness: u32,
    issued_seq: u64,
    applied_seq: u64,
    lost: Option<String>,
    subscribers: HashMap<SubscriberId, UnboundedSender<JobEvent>>,
}

impl Entry {
    fn new(status: JobStatus, status_path: String) -> Self {
        Self {
            status: status.normalized(),
            status_path,
            last_polled_at: None,
            staleness: 0,
            issued_seq: 0,
            applied_seq: 0,
            lost: None,
            subscribers: HashMap::new(),
        }
    }

    fn is_settled(&self) -> bool {
        self.status.is_terminal() || self.lost.is_some()
    }

    fn current_event(&self) -> JobEvent {
        match &self.lost {
            Some(reason) => JobEvent::Lost {
                reason: reason.clone(),
            },
            None => JobEvent::Status(self.status.clone()),
        }
    }

    /// Fan an event out; closed receivers are pruned.
    fn publish(&mut self, event: JobEvent) {
        self.subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn snapshot(&self, handle: &JobHandle) -> JobSnapshot {
        JobSnapshot {
            handle: handle.clone(),
            status: self.status.clone(),
            status_path: self.status_path.clone(),
            last_polled_at: self.last_polled_at,
            subscriber_count: self.subscribers.len(),
            staleness: self.staleness,
            lost: self.lost.clone(),
        }
    }
}

/// Process-wide job table. Share it behind an `Arc`.
#[derive(Debug, Default)]
pub struct JobRegistry {
    entries: RwLock<HashMap<JobHandle, Arc<Mutex<Entry>>>>,
    next_subscriber: AtomicU64,
    changed: Notify,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as `Pending 0%`. Returns `false` if already known.
    pub fn register(&self, handle: JobHandle, status_path: Option<String>) -> bool {
        self.register_with_status(handle, status_path, JobStatus::pending())
    }

    /// Register `handle` with a known status (submission, discovery).
    ///
    /// An existing entry is left untouched.
    pub fn register_with_status(
        &self,
        handle: JobHandle,
        status_path: Option<String>,
        status: JobStatus,
    ) -> bool {
        let inserted = {
            let mut entries = self.write_entries();
            if entries.contains_key(&handle) {
                false
            } else {
                let path = status_path.unwrap_or_else(|| handle.status_path());
                tracing::debug!(job = %handle, path = %path, state = %status.state, "registered job");
                entries.insert(handle, Arc::new(Mutex::new(Entry::new(status, path))));
                true
            }
        };
        if inserted {
            self.changed.notify_one();
        }
        inserted
    }

    pub fn contains(&self, handle: &JobHandle) -> bool {
        self.read_entries().contains_key(handle)
    }

    pub fn get(&self, handle: &JobHandle) -> Option<JobSnapshot> {
        let entry = self.entry(handle)?;
        let guard = lock_entry(&entry);
        Some(guard.snapshot(handle))
    }

    pub fn status_path(&self, handle: &JobHandle) -> Option<String> {
        let entry = self.entry(handle)?;
        let guard = lock_entry(&entry);
        Some(guard.status_path.clone())
    }

    /// Subscribe to `handle`. The current status (or loss) is queued on the
    /// receiver before this returns.
    pub fn subscribe(&self, handle: &JobHandle) -> Option<Subscription> {
        let entry = self.entry(handle)?;
        let (tx, receiver) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let mut guard = lock_entry(&entry);
        // Receiver is alive; this cannot fail.
        let _ = tx.send(guard.current_event());
        guard.subscribers.insert(id, tx);
        let subscriber_count = guard.subscribers.len();
        tracing::debug!(job = %handle, subscriber = id, subscriber_count, "subscribed");

        Some(Subscription {
            id,
            receiver,
            subscriber_count,
        })
    }

    /// Remove one subscriber. Returns the remaining count.
    pub fn unsubscribe(&self, handle: &JobHandle, id: SubscriberId) -> Option<usize> {
        let entry = self.entry(handle)?;
        let mut guard = lock_entry(&entry);
        guard.subscribers.remove(&id);
        let remaining = guard.subscribers.len();
        tracing::debug!(job = %handle, subscriber = id, remaining, "unsubscribed");
        Some(remaining)
    }

    pub fn subscriber_count(&self, handle: &JobHandle) -> usize {
        self.entry(handle)
            .map(|entry| lock_entry(&entry).subscribers.len())
            .unwrap_or(0)
    }

    /// Drop the entry if nobody watches it and it is settled.
    pub fn unregister_if_unreferenced(&self, handle: &JobHandle) -> bool {
        let mut entries = self.write_entries();
        let removable = entries.get(handle).is_some_and(|entry| {
            let guard = lock_entry(entry);
            guard.subscribers.is_empty() && guard.is_settled()
        });
        if removable {
            entries.remove(handle);
            tracing::debug!(job = %handle, "removed settled job");
        }
        removable
    }

    /// Drop every entry (logout). Open streams receive a final `Lost`.
    pub fn clear(&self) {
        let drained: Vec<_> = self.write_entries().drain().collect();
        for (_, entry) in drained {
            let mut guard = lock_entry(&entry);
            guard.publish(JobEvent::Lost {
                reason: "session cleared".to_string(),
            });
            guard.subscribers.clear();
        }
        self.changed.notify_one();
    }

    /// Close every subscriber channel without touching job state (shutdown).
    pub fn disconnect_all(&self) {
        let entries: Vec<_> = self.read_entries().values().cloned().collect();
        for entry in entries {
            lock_entry(&entry).subscribers.clear();
        }
    }

    /// Issue the sequence number for a new status request.
    pub fn next_request_seq(&self, handle: &JobHandle) -> Option<u64> {
        let entry = self.entry(handle)?;
        let mut guard = lock_entry(&entry);
        guard.issued_seq += 1;
        Some(guard.issued_seq)
    }

    /// Apply the response to request `seq`.
    ///
    /// Only a response to the most recently issued request is applied;
    /// anything older, or already applied, is discarded.
    pub fn apply(&self, handle: &JobHandle, seq: u64, status: JobStatus) -> ApplyOutcome {
        let Some(entry) = self.entry(handle) else {
            return ApplyOutcome::Unknown;
        };
        let mut guard = lock_entry(&entry);

        if guard.lost.is_some() || seq != guard.issued_seq || seq <= guard.applied_seq {
            tracing::debug!(
                job = %handle,
                seq,
                issued = guard.issued_seq,
                applied = guard.applied_seq,
                "discarding out-of-order status"
            );
            return ApplyOutcome::Discarded;
        }
        guard.applied_seq = seq;
        guard.last_polled_at = Some(Utc::now());

        let advanced = guard.status.advance_to(status);
        match advanced {
            Err(e) => {
                tracing::error!(job = %handle, seq, error = %e, "protocol error; no longer tracking job");
                let reason = format!("protocol error: {e}");
                guard.lost = Some(reason.clone());
                guard.publish(JobEvent::Lost { reason });
                ApplyOutcome::ProtocolViolation
            }
            Ok(next) => {
                let was_stale = guard.staleness > 0;
                guard.staleness = 0;
                if next == guard.status && !was_stale {
                    return ApplyOutcome::Unchanged;
                }
                guard.status = next.clone();
                guard.publish(JobEvent::Status(next));
                ApplyOutcome::Applied
            }
        }
    }

    /// Record a failed refresh for request `seq`; keeps the last good status.
    ///
    /// Returns the new staleness counter, or `None` if the request is
    /// outdated or the entry is already settled.
    pub fn mark_stale(&self, handle: &JobHandle, seq: u64, error: impl Into<String>) -> Option<u32> {
        let entry = self.entry(handle)?;
        let mut guard = lock_entry(&entry);
        if guard.is_settled() || seq != guard.issued_seq || seq <= guard.applied_seq {
            return None;
        }
        guard.staleness += 1;
        let event = JobEvent::Stale {
            status: guard.status.clone(),
            staleness: guard.staleness,
            error: error.into(),
        };
        guard.publish(event);
        Some(guard.staleness)
    }

    /// Stop trusting `handle` and tell its subscribers.
    pub fn mark_lost(&self, handle: &JobHandle, reason: impl Into<String>) -> bool {
        let Some(entry) = self.entry(handle) else {
            return false;
        };
        let mut guard = lock_entry(&entry);
        if guard.lost.is_some() {
            return false;
        }
        let reason = reason.into();
        guard.lost = Some(reason.clone());
        guard.publish(JobEvent::Lost { reason });
        true
    }

    pub fn is_settled(&self, handle: &JobHandle) -> bool {
        self.entry(handle)
            .is_some_and(|entry| lock_entry(&entry).is_settled())
    }

    /// Handles that still need polling.
    pub fn active_handles(&self) -> Vec<JobHandle> {
        let entries: Vec<_> = self
            .read_entries()
            .iter()
            .map(|(handle, entry)| (handle.clone(), Arc::clone(entry)))
            .collect();
        entries
            .into_iter()
            .filter(|(_, entry)| !lock_entry(entry).is_settled())
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Settled entries nobody subscribes to; candidates for removal.
    pub fn settled_unobserved(&self) -> Vec<JobHandle> {
        let entries: Vec<_> = self
            .read_entries()
            .iter()
            .map(|(handle, entry)| (handle.clone(), Arc::clone(entry)))
            .collect();
        entries
            .into_iter()
            .filter(|(_, entry)| {
                let guard = lock_entry(entry);
                guard.is_settled() && guard.subscribers.is_empty()
            })
            .map(|(handle, _)| handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// Signalled whenever a job is registered or the table is cleared.
    pub fn changed(&self) -> &Notify {
        &self.changed
    }

    fn entry(&self, handle: &JobHandle) -> Option<Arc<Mutex<Entry>>> {
        self.read_entries().get(handle).cloned()
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<JobHandle, Arc<Mutex<Entry>>>> {
        self.entries.read().unwrap_or_else(|poisoned| {
            tracing::error!("RwLock poisoned reading job registry; recovering");
            poisoned.into_inner()
        })
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<JobHandle, Arc<Mutex<Entry>>>> {
        self.entries.write().unwrap_or_else(|poisoned| {
            tracing::error!("RwLock poisoned writing job registry; recovering");
            poisoned.into_inner()
        })
    }
}

fn lock_entry(entry: &Mutex<Entry>) -> MutexGuard<'_, Entry> {
    entry.lock().unwrap_or_else(|poisoned| {
        tracing::error!("job entry mutex poisoned; recovering");
        poisoned.into_inner()
    })
}
