//! Per-response control signals.
//!
//! Each in-progress response carries three one-slot mailboxes — stop,
//! pause, update — written by the serializer and drained by whichever
//! worker currently drives the traversal. Reads are non-blocking
//! try-takes; a second raise before the first is consumed collapses into
//! one delivery.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Why a stop was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The requester cancelled, or the response's context was torn down.
    External,
    /// The responder itself asked to cancel (application or update hook).
    SelfCancel,
}

const STOP_NONE: u8 = 0;
const STOP_EXTERNAL: u8 = 1;
const STOP_SELF: u8 = 2;

/// Handle to one response's signal trio. Clones share the mailboxes.
#[derive(Clone, Debug, Default)]
pub struct ResponseSignals {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    stop: AtomicU8,
    pause: AtomicBool,
    update: AtomicBool,
}

impl ResponseSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the stop signal. An external stop never downgrades a
    /// self-cancel already waiting in the slot.
    pub fn raise_stop(&self, reason: StopReason) {
        let value = match reason {
            StopReason::External => STOP_EXTERNAL,
            StopReason::SelfCancel => STOP_SELF,
        };
        let _ = self.inner.stop.compare_exchange(
            STOP_NONE,
            value,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn raise_pause(&self) {
        self.inner.pause.store(true, Ordering::SeqCst);
    }

    pub fn raise_update(&self) {
        self.inner.update.store(true, Ordering::SeqCst);
    }

    /// Take the stop signal, if raised.
    pub fn take_stop(&self) -> Option<StopReason> {
        match self.inner.stop.swap(STOP_NONE, Ordering::SeqCst) {
            STOP_EXTERNAL => Some(StopReason::External),
            STOP_SELF => Some(StopReason::SelfCancel),
            _ => None,
        }
    }

    /// Take the pause signal, if raised.
    pub fn take_pause(&self) -> bool {
        self.inner.pause.swap(false, Ordering::SeqCst)
    }

    /// Take the update signal, if raised.
    pub fn take_update(&self) -> bool {
        self.inner.update.swap(false, Ordering::SeqCst)
    }
}
