use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::models::Direction;
use crate::persistence::PendingTriggers;

/// Position lifecycle as the controller sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// No position, no resting entry trigger
    Idle,
    /// One or two entry triggers resting on the exchange
    TriggerPending,
    /// Fill observed, stop-loss not yet confirmed live
    EntryFilledUnprotected,
    /// Stop-loss live, take-profit attempted
    Protected,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecyclePhase::Idle => "Idle",
            LifecyclePhase::TriggerPending => "TriggerPending",
            LifecyclePhase::EntryFilledUnprotected => "EntryFilled/Unprotected",
            LifecyclePhase::Protected => "Protected",
        };
        f.write_str(s)
    }
}

/// An entry trigger the exchange reported as fired, fill not yet handled
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredEntry {
    pub direction: Direction,
    pub algo_id: String,
    pub size: f64,
    pub at: Instant,
}

#[derive(Debug)]
struct TriggerState {
    pending: PendingTriggers,
    triggered: Option<TriggeredEntry>,
    entry_in_progress: bool,
    phase: LifecyclePhase,
}

/// Entry-side bookkeeping shared by the control loop and the private stream
///
/// Holds the pending trigger ids, the triggered-but-unfilled marker, the
/// entry-in-progress flag and the lifecycle phase. The lock is only ever held
/// for the duration of a single method call, never across an await.
#[derive(Debug, Clone)]
pub struct TriggerBook {
    inner: Arc<Mutex<TriggerState>>,
}

impl Default for TriggerBook {
    fn default() -> Self {
        Self::new(PendingTriggers::default())
    }
}

impl TriggerBook {
    pub fn new(pending: PendingTriggers) -> Self {
        let phase = if pending.is_empty() {
            LifecyclePhase::Idle
        } else {
            LifecyclePhase::TriggerPending
        };
        Self {
            inner: Arc::new(Mutex::new(TriggerState {
                pending,
                triggered: None,
                entry_in_progress: false,
                phase,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TriggerState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn pending(&self) -> PendingTriggers {
        self.lock().pending.clone()
    }

    pub fn set_pending(&self, direction: Direction, algo_id: String) {
        *self.lock().pending.slot_mut(direction) = Some(algo_id);
    }

    /// Remove and return the pending id for one side
    pub fn take_pending(&self, direction: Direction) -> Option<String> {
        self.lock().pending.slot_mut(direction).take()
    }

    /// Clear a slot only if it still holds `algo_id`
    pub fn clear_pending_if(&self, direction: Direction, algo_id: &str) -> bool {
        let mut state = self.lock();
        let slot = state.pending.slot_mut(direction);
        if slot.as_deref() == Some(algo_id) {
            *slot = None;
            true
        } else {
            false
        }
    }

    pub fn replace_pending(&self, pending: PendingTriggers) {
        self.lock().pending = pending;
    }

    /// Record that an algo order went `effective`
    ///
    /// Sets the triggered marker when the id belongs to a pending entry
    /// trigger and returns its direction. Repeated reports of the same trigger
    /// keep the original receipt time.
    pub fn mark_algo_effective(&self, algo_id: &str, size: f64) -> Option<Direction> {
        let mut state = self.lock();
        let direction = state.pending.direction_of(algo_id)?;
        let already = matches!(&state.triggered, Some(t) if t.algo_id == algo_id);
        if !already {
            state.triggered = Some(TriggeredEntry {
                direction,
                algo_id: algo_id.to_string(),
                size,
                at: Instant::now(),
            });
        }
        Some(direction)
    }

    pub fn triggered(&self) -> Option<TriggeredEntry> {
        self.lock().triggered.clone()
    }

    /// Consume the triggered marker
    pub fn take_triggered(&self) -> Option<TriggeredEntry> {
        self.lock().triggered.take()
    }

    /// Time since the pending trigger fired, if one did
    pub fn triggered_elapsed(&self) -> Option<Duration> {
        self.lock().triggered.as_ref().map(|t| t.at.elapsed())
    }

    pub fn entry_in_progress(&self) -> bool {
        self.lock().entry_in_progress
    }

    /// An entry is in flight: trigger fired, or fill being processed
    ///
    /// Reconciliation and cancel/replace back off while this is true.
    pub fn entry_active(&self) -> bool {
        let state = self.lock();
        state.entry_in_progress || state.triggered.is_some()
    }

    /// Mark an entry as being processed until the guard is dropped
    pub fn begin_entry(&self) -> EntryGuard {
        self.lock().entry_in_progress = true;
        EntryGuard { book: self.clone() }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.lock().phase
    }

    pub fn transition(&self, to: LifecyclePhase) {
        let from = {
            let mut state = self.lock();
            std::mem::replace(&mut state.phase, to)
        };
        if from != to {
            tracing::info!(from = %from, to = %to, "lifecycle transition");
        }
    }
}

/// Clears the entry-in-progress flag when dropped
#[must_use]
pub struct EntryGuard {
    book: TriggerBook,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.book.lock().entry_in_progress = false;
    }
}
