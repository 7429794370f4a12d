//! Single-slot admission queue
//!
//! Downloads wait here for their turn. Only one id is ever processing.
//!
//! # Position Semantics
//!
//! - Position 1 = currently processing
//! - Position 2+ = waiting (`index + 1 + processing_count`)
//!
//! Each ticket observes its position through a `watch` channel, so waiters
//! are woken on every shift without polling.

use crate::error::DownloadError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// How a wait on the queue ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// The id now owns the processing slot
    Fulfilled,
    /// The id was removed before reaching the slot
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Waiting(u32),
    Active,
    Cancelled,
}

type CancelHandler = Box<dyn FnOnce() + Send>;

struct QueueEntry<T> {
    id: Uuid,
    item: T,
    signal: watch::Sender<Slot>,
    on_cancel: Option<CancelHandler>,
}

struct Processing<T> {
    id: Uuid,
    item: T,
    // Kept so a waiter that has not yet observed `Active` still can
    _signal: watch::Sender<Slot>,
}

struct QueueState<T> {
    pending: VecDeque<QueueEntry<T>>,
    processing: Option<Processing<T>>,
}

impl<T> QueueState<T> {
    fn contains(&self, id: &Uuid) -> bool {
        self.processing.as_ref().is_some_and(|p| &p.id == id)
            || self.pending.iter().any(|entry| &entry.id == id)
    }

    fn processing_count(&self) -> u32 {
        u32::from(self.processing.is_some())
    }

    fn position_of(&self, id: &Uuid) -> Option<u32> {
        if self.processing.as_ref().is_some_and(|p| &p.id == id) {
            return Some(1);
        }
        self.pending
            .iter()
            .position(|entry| &entry.id == id)
            .map(|index| index as u32 + 1 + self.processing_count())
    }

    /// Move the head of the pending list into the slot if the slot is free
    fn promote_if_idle(&mut self) {
        if self.processing.is_some() {
            return;
        }
        if let Some(entry) = self.pending.pop_front() {
            debug!("Queue: promoting {} to processing", entry.id);
            entry.signal.send_replace(Slot::Active);
            self.processing = Some(Processing {
                id: entry.id,
                item: entry.item,
                _signal: entry.signal,
            });
        }
    }

    fn publish_positions(&self) {
        let offset = 1 + self.processing_count();
        for (index, entry) in self.pending.iter().enumerate() {
            let position = index as u32 + offset;
            entry.signal.send_if_modified(|slot| {
                if *slot == Slot::Waiting(position) {
                    false
                } else {
                    *slot = Slot::Waiting(position);
                    true
                }
            });
        }
    }
}

/// FIFO admission control with exactly one processing slot
pub struct AdmissionQueue<T> {
    state: Mutex<QueueState<T>>,
}

impl<T: Send + 'static> AdmissionQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                processing: None,
            }),
        }
    }

    /// Add an id to the back of the queue.
    ///
    /// When nothing is processing the new entry is promoted immediately, so
    /// its ticket starts at position 1.
    pub fn enqueue(self: &Arc<Self>, id: Uuid, item: T) -> Result<QueueTicket<T>, DownloadError> {
        let mut state = self.state.lock();
        if state.contains(&id) {
            return Err(DownloadError::AlreadyQueued(id));
        }

        let (signal, receiver) = watch::channel(Slot::Waiting(0));
        state.pending.push_back(QueueEntry {
            id,
            item,
            signal,
            on_cancel: None,
        });
        state.promote_if_idle();
        state.publish_positions();

        let initial_position = state.position_of(&id).unwrap_or(1);
        debug!("Queue: {} enqueued at position {}", id, initial_position);

        Ok(QueueTicket {
            id,
            initial_position,
            signal: receiver,
            queue: Arc::clone(self),
        })
    }

    /// Release the processing slot held by `id` and promote the next entry.
    ///
    /// Returns false (and does nothing) if `id` is not processing.
    pub fn finish(&self, id: &Uuid) -> bool {
        let mut state = self.state.lock();
        if !state.processing.as_ref().is_some_and(|p| &p.id == id) {
            return false;
        }
        state.processing = None;
        state.promote_if_idle();
        state.publish_positions();
        true
    }

    /// Drop a still-pending id, resolving its waiter with `Cancelled`.
    ///
    /// Returns false if `id` is not pending (processing ids are untouched).
    pub fn remove(&self, id: &Uuid) -> bool {
        let handler = {
            let mut state = self.state.lock();
            let Some(index) = state.pending.iter().position(|entry| &entry.id == id) else {
                return false;
            };
            let entry = state.pending.remove(index);
            state.publish_positions();
            entry.and_then(|mut entry| {
                entry.signal.send_replace(Slot::Cancelled);
                entry.on_cancel.take()
            })
        };

        // Run outside the lock so the handler may call back into the queue
        if let Some(handler) = handler {
            handler();
        }
        debug!("Queue: removed {}", id);
        true
    }

    /// Current position of `id`, if queued or processing
    pub fn position(&self, id: &Uuid) -> Option<u32> {
        self.state.lock().position_of(id)
    }

    pub fn is_processing(&self, id: &Uuid) -> bool {
        self.state
            .lock()
            .processing
            .as_ref()
            .is_some_and(|p| &p.id == id)
    }

    pub fn processing_id(&self) -> Option<Uuid> {
        self.state.lock().processing.as_ref().map(|p| p.id)
    }

    /// Ids waiting for the slot, in order
    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.state.lock().pending.iter().map(|entry| entry.id).collect()
    }

    /// Number of ids queued or processing
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.processing_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn set_cancel_handler(&self, id: &Uuid, handler: CancelHandler) {
        let mut state = self.state.lock();
        if let Some(entry) = state.pending.iter_mut().find(|entry| &entry.id == id) {
            entry.on_cancel = Some(handler);
        }
    }
}

impl<T: Clone + Send + 'static> AdmissionQueue<T> {
    /// The item currently owning the slot
    pub fn processing_item(&self) -> Option<T> {
        self.state.lock().processing.as_ref().map(|p| p.item.clone())
    }
}

impl<T: Send + 'static> Default for AdmissionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`AdmissionQueue::enqueue`]
pub struct QueueTicket<T: Send + 'static> {
    id: Uuid,
    initial_position: u32,
    signal: watch::Receiver<Slot>,
    queue: Arc<AdmissionQueue<T>>,
}

impl<T: Send + 'static> QueueTicket<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn initial_position(&self) -> u32 {
        self.initial_position
    }

    /// Wait until this id owns the processing slot.
    ///
    /// `on_position` fires immediately with the current position and again
    /// on every change.
    pub async fn wait<F>(&mut self, mut on_position: F) -> QueueOutcome
    where
        F: FnMut(u32),
    {
        loop {
            let slot = *self.signal.borrow_and_update();
            match slot {
                Slot::Waiting(position) => on_position(position),
                Slot::Active => {
                    on_position(1);
                    return QueueOutcome::Fulfilled;
                }
                Slot::Cancelled => return QueueOutcome::Cancelled,
            }

            if self.signal.changed().await.is_err() {
                return QueueOutcome::Cancelled;
            }
        }
    }

    /// Register a callback run when this id is removed while pending
    pub fn cancel_handler<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.set_cancel_handler(&self.id, Box::new(handler));
    }

    /// Release the slot held by this ticket's id
    pub fn finish(&self) -> bool {
        self.queue.finish(&self.id)
    }
}
