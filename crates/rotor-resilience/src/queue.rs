//! In-memory priority work queue with visibility-timeout leases and
//! dead-lettering.
//!
//! Lower numeric priority is dequeued first and equal priorities keep FIFO
//! order. A dequeued item is leased for `visibility_timeout`; if the lease
//! expires before `mark_completed`/`mark_failed`, exactly one
//! [`QueueEvent::VisibilityTimeout`] is broadcast. The item stays
//! `in_progress` unless `requeue_expired_leases` is enabled.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use rotor_config::QueueConfig;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    DeadLetter,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueItem<T> {
    pub id: String,
    pub payload: T,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub status: QueueStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum QueueEvent {
    Enqueued { id: String, priority: i32 },
    Dequeued { id: String, attempt: u32 },
    Completed { id: String },
    Failed { id: String, attempts: u32, error: String, requeued: bool },
    DeadLettered { id: String, attempts: u32 },
    VisibilityTimeout { id: String, attempt: u32 },
    LeaseRequeued { id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: u64,
    pub failed: u64,
    pub dead_letter: usize,
    pub total_enqueued: u64,
}

struct Lease {
    attempt: u32,
    timer: Option<AbortHandle>,
}

struct QueueInner<T> {
    items: HashMap<String, QueueItem<T>>,
    pending: VecDeque<String>,
    leases: HashMap<String, Lease>,
    dead_letter: Vec<String>,
    completed: VecDeque<String>,
    /// Terminally failed ids, kept only when dead-lettering is off.
    failed: VecDeque<String>,
    completed_total: u64,
    failed_total: u64,
    enqueued_total: u64,
}

pub struct QueueManager<T> {
    config: QueueConfig,
    inner: Arc<Mutex<QueueInner<T>>>,
    events: broadcast::Sender<QueueEvent>,
}

impl<T> std::fmt::Debug for QueueManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn lock_inner<T>(inner: &Mutex<QueueInner<T>>) -> MutexGuard<'_, QueueInner<T>> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drop the oldest ids in `order` (and their items) beyond `keep`.
fn retain_newest<T>(
    items: &mut HashMap<String, QueueItem<T>>,
    order: &mut VecDeque<String>,
    keep: usize,
) {
    while order.len() > keep {
        if let Some(old) = order.pop_front() {
            items.remove(&old);
        }
    }
}

impl<T> QueueManager<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            inner: Arc::new(Mutex::new(QueueInner {
                items: HashMap::new(),
                pending: VecDeque::new(),
                leases: HashMap::new(),
                dead_letter: Vec::new(),
                completed: VecDeque::new(),
                failed: VecDeque::new(),
                completed_total: 0,
                failed_total: 0,
                enqueued_total: 0,
            })),
            events,
        }
    }

    /// Receive every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Insert before the first pending item with a strictly greater
    /// priority. Returns the new item id.
    pub fn enqueue(&self, payload: T, priority: i32) -> String {
        let id = ulid::Ulid::new().to_string();
        let item = QueueItem {
            id: id.clone(),
            payload,
            priority,
            created_at: Utc::now(),
            attempts: 0,
            status: QueueStatus::Pending,
            last_error: None,
        };
        {
            let mut inner = lock_inner(&self.inner);
            let position = inner.pending.iter().position(|pending_id| {
                inner
                    .items
                    .get(pending_id)
                    .is_some_and(|p| p.priority > priority)
            });
            match position {
                Some(index) => inner.pending.insert(index, id.clone()),
                None => inner.pending.push_back(id.clone()),
            }
            inner.items.insert(id.clone(), item);
            inner.enqueued_total += 1;
        }
        debug!(id = %id, priority, "Enqueued item");
        self.emit(QueueEvent::Enqueued {
            id: id.clone(),
            priority,
        });
        id
    }

    /// Take the head of the pending list and lease it.
    ///
    /// The lease timer runs on the current Tokio runtime; outside a runtime
    /// the item is leased without expiry.
    pub fn dequeue(&self) -> Option<QueueItem<T>> {
        let item = {
            let mut inner = lock_inner(&self.inner);
            let id = inner.pending.pop_front()?;
            let item = inner.items.get_mut(&id)?;
            item.status = QueueStatus::InProgress;
            item.attempts += 1;
            let snapshot = item.clone();
            let timer = self.start_lease_timer(&id, snapshot.attempts);
            inner.leases.insert(
                id,
                Lease {
                    attempt: snapshot.attempts,
                    timer,
                },
            );
            snapshot
        };
        debug!(id = %item.id, attempt = item.attempts, "Dequeued item");
        self.emit(QueueEvent::Dequeued {
            id: item.id.clone(),
            attempt: item.attempts,
        });
        Some(item)
    }

    pub fn mark_completed(&self, id: &str) -> Result<()> {
        {
            let mut inner = lock_inner(&self.inner);
            Self::take_lease(&mut inner, id)?;
            if let Some(item) = inner.items.get_mut(id) {
                item.status = QueueStatus::Completed;
            }
            inner.completed.push_back(id.to_string());
            inner.completed_total += 1;
            let QueueInner { items, completed, .. } = &mut *inner;
            retain_newest(items, completed, self.config.completed_retention);
        }
        debug!(id, "Completed item");
        self.emit(QueueEvent::Completed { id: id.to_string() });
        Ok(())
    }

    /// Record a failed attempt. Requeues to the tail of pending while
    /// `attempts < max_retries`, otherwise dead-letters (or marks `failed`
    /// when dead-lettering is disabled). Returns the item's new status.
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<QueueStatus> {
        let (status, attempts) = {
            let mut inner = lock_inner(&self.inner);
            Self::take_lease(&mut inner, id)?;
            let Some(item) = inner.items.get_mut(id) else {
                bail!("Queue item '{id}' not found");
            };
            item.last_error = Some(error.to_string());
            let attempts = item.attempts;
            let status = if attempts < self.config.max_retries {
                QueueStatus::Pending
            } else if self.config.dead_letter_enabled {
                QueueStatus::DeadLetter
            } else {
                QueueStatus::Failed
            };
            item.status = status;
            match status {
                QueueStatus::Pending => inner.pending.push_back(id.to_string()),
                QueueStatus::DeadLetter => inner.dead_letter.push(id.to_string()),
                _ => {
                    inner.failed.push_back(id.to_string());
                    let QueueInner { items, failed, .. } = &mut *inner;
                    retain_newest(items, failed, self.config.completed_retention);
                }
            }
            inner.failed_total += 1;
            (status, attempts)
        };

        warn!(id, attempts, error, status = ?status, "Queue item failed");
        self.emit(QueueEvent::Failed {
            id: id.to_string(),
            attempts,
            error: error.to_string(),
            requeued: status == QueueStatus::Pending,
        });
        if status == QueueStatus::DeadLetter {
            self.emit(QueueEvent::DeadLettered {
                id: id.to_string(),
                attempts,
            });
        }
        Ok(status)
    }

    pub fn get(&self, id: &str) -> Option<QueueItem<T>> {
        lock_inner(&self.inner).items.get(id).cloned()
    }

    pub fn dead_letter_queue(&self) -> Vec<QueueItem<T>> {
        let inner = lock_inner(&self.inner);
        inner
            .dead_letter
            .iter()
            .filter_map(|id| inner.items.get(id).cloned())
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = lock_inner(&self.inner);
        QueueStats {
            pending: inner.pending.len(),
            in_progress: inner.leases.len(),
            completed: inner.completed_total,
            failed: inner.failed_total,
            dead_letter: inner.dead_letter.len(),
            total_enqueued: inner.enqueued_total,
        }
    }

    fn take_lease(inner: &mut QueueInner<T>, id: &str) -> Result<()> {
        let Some(lease) = inner.leases.remove(id) else {
            bail!("Queue item '{id}' is not in progress");
        };
        if let Some(timer) = lease.timer {
            timer.abort();
        }
        Ok(())
    }

    fn emit(&self, event: QueueEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn start_lease_timer(&self, id: &str, attempt: u32) -> Option<AbortHandle> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        let timeout = self.config.visibility_timeout();
        let requeue = self.config.requeue_expired_leases;
        let id = id.to_string();
        let task = handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            expire_lease(&inner, &events, &id, attempt, timeout, requeue);
        });
        Some(task.abort_handle())
    }
}

fn expire_lease<T>(
    inner: &Mutex<QueueInner<T>>,
    events: &broadcast::Sender<QueueEvent>,
    id: &str,
    attempt: u32,
    timeout: Duration,
    requeue: bool,
) {
    let mut guard = lock_inner(inner);
    // A completion racing the timer wins: only the lease we started expires.
    let current = guard.leases.get(id).map(|lease| lease.attempt);
    if current != Some(attempt) {
        return;
    }
    warn!(
        id,
        attempt,
        timeout_ms = timeout.as_millis() as u64,
        "Queue lease expired"
    );
    let _ = events.send(QueueEvent::VisibilityTimeout {
        id: id.to_string(),
        attempt,
    });
    if !requeue {
        // Keep the lease record but drop its timer so it cannot fire again.
        if let Some(lease) = guard.leases.get_mut(id) {
            lease.timer = None;
        }
        return;
    }
    guard.leases.remove(id);
    if let Some(item) = guard.items.get_mut(id) {
        item.status = QueueStatus::Pending;
    }
    guard.pending.push_back(id.to_string());
    let _ = events.send(QueueEvent::LeaseRequeued { id: id.to_string() });
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
