// ABOUTME: Single-slot promise/future cell, condvar-gated exclusive acquisition.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

struct Slot<T> {
    /// `Some` while a caller holds the cell awaiting a matching reply.
    pending: Option<PendingRequest<T>>,
}

struct PendingRequest<T> {
    reference: u32,
    result: Option<Result<T>>,
}

/// A single-slot cell: at most one request is outstanding at a time. A caller
/// acquires it (blocking until any previous holder's result has been taken),
/// registers the reference number it expects to see echoed, then blocks on
/// `await_result` while the command-pipe reader thread calls `fulfill`.
pub struct PendingCell<T> {
    inner: Mutex<Slot<T>>,
    cv: Condvar,
}

impl<T> PendingCell<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Slot { pending: None }),
            cv: Condvar::new(),
        })
    }

    /// Block until the slot is free, then occupy it with `reference`.
    /// Returns a handle used to await the eventual result.
    pub fn acquire(self: &Arc<Self>, reference: u32) -> PendingHandle<T> {
        let mut slot = self.inner.lock().unwrap();
        while slot.pending.is_some() {
            slot = self.cv.wait(slot).unwrap();
        }
        slot.pending = Some(PendingRequest {
            reference,
            result: None,
        });
        PendingHandle {
            cell: Arc::clone(self),
            reference,
        }
    }

    /// Called by the command-pipe reader when a reply matching `reference`
    /// arrives (or any reply, if no reference check is needed). Returns
    /// `true` if a waiter was actually pending with this reference.
    pub fn fulfill(&self, reference: u32, result: Result<T>) -> bool {
        let mut slot = self.inner.lock().unwrap();
        match &slot.pending {
            Some(p) if p.reference == reference => {
                slot.pending.as_mut().unwrap().result = Some(result);
                self.cv.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Current pending reference, if any — used by the reader to detect
    /// reference mismatches before deciding how to resolve the cell.
    pub fn pending_reference(&self) -> Option<u32> {
        self.inner.lock().unwrap().pending.as_ref().map(|p| p.reference)
    }

    /// Resolve whatever is pending (regardless of reference) with `result`.
    /// Used on disconnect to unblock every waiter with `IsDisconnected`.
    pub fn fulfill_any(&self, result_fn: impl FnOnce() -> Error) {
        let mut slot = self.inner.lock().unwrap();
        if let Some(p) = slot.pending.as_mut() {
            if p.result.is_none() {
                p.result = Some(Err(result_fn()));
                self.cv.notify_all();
            }
        }
    }

    /// Resolve the pending slot in one atomic step, deciding match vs.
    /// mismatch against the reference actually observed on the wire. Returns
    /// `None` if nothing was pending (the reader saw a reply with no waiter),
    /// `Some(true)` on a matching reference, `Some(false)` on a mismatch.
    pub fn resolve_observed(
        &self,
        observed: u32,
        make_ok: impl FnOnce() -> T,
        make_mismatch_err: impl FnOnce(u32, u32) -> Error,
    ) -> Option<bool> {
        let mut slot = self.inner.lock().unwrap();
        let p = slot.pending.as_mut()?;
        if p.result.is_some() {
            return None;
        }
        if p.reference == observed {
            p.result = Some(Ok(make_ok()));
            self.cv.notify_all();
            Some(true)
        } else {
            let err = make_mismatch_err(p.reference, observed);
            p.result = Some(Err(err));
            self.cv.notify_all();
            Some(false)
        }
    }
}

pub struct PendingHandle<T> {
    cell: Arc<PendingCell<T>>,
    reference: u32,
}

impl<T> PendingHandle<T> {
    pub fn reference(&self) -> u32 {
        self.reference
    }

    /// Block until a result is posted or `timeout` elapses. On timeout the
    /// slot is released by the caller calling `resolve_timeout` so a
    /// subsequent attempt can reuse it.
    pub fn await_result(&self, timeout: Duration) -> Option<Result<T>> {
        let mut slot = self.cell.inner.lock().unwrap();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(p) = slot.pending.as_ref() {
                if p.result.is_some() {
                    let p = slot.pending.take().unwrap();
                    self.cell.cv.notify_all();
                    return p.result;
                }
            } else {
                // Slot was already released (shouldn't normally happen while
                // we hold a handle, but don't hang forever).
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, timeout_result) =
                self.cell.cv.wait_timeout(slot, deadline - now).unwrap();
            slot = guard;
            if timeout_result.timed_out() {
                // loop once more to check if a result landed exactly at the deadline
                if slot
                    .pending
                    .as_ref()
                    .map(|p| p.result.is_some())
                    .unwrap_or(false)
                {
                    continue;
                }
                return None;
            }
        }
    }

    /// Release the slot without a result (used after a timeout so the next
    /// attempt can acquire the cell). Equivalent to letting the handle drop;
    /// kept as an explicit call for call sites that want the release to
    /// happen before doing further work that itself needs the cell.
    pub fn release(self) {}
}

/// A timed-out or otherwise abandoned handle must not leave the slot
/// occupied — the original's `PendingResponse` is cleared by its owning
/// scope unwinding the same way. Without this, a retry loop's next
/// `acquire()` on the same cell would block forever.
impl<T> Drop for PendingHandle<T> {
    fn drop(&mut self) {
        let mut slot = self.cell.inner.lock().unwrap();
        if matches!(&slot.pending, Some(p) if p.reference == self.reference) {
            slot.pending = None;
            self.cell.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fulfill_wakes_the_waiting_acquirer() {
        let cell: Arc<PendingCell<u32>> = PendingCell::new();
        let handle = cell.acquire(42);
        let cell2 = Arc::clone(&cell);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            assert!(cell2.fulfill(42, Ok(7)));
        });
        let result = handle.await_result(Duration::from_secs(1));
        t.join().unwrap();
        assert_eq!(result.unwrap().unwrap(), 7);
    }

    #[test]
    fn second_acquire_blocks_until_first_is_released() {
        let cell: Arc<PendingCell<u32>> = PendingCell::new();
        let h1 = cell.acquire(1);
        let cell2 = Arc::clone(&cell);
        let t = thread::spawn(move || {
            let h2 = cell2.acquire(2);
            assert_eq!(h2.reference(), 2);
        });
        thread::sleep(Duration::from_millis(20));
        h1.release();
        t.join().unwrap();
    }

    #[test]
    fn timeout_returns_none_and_releases_slot() {
        let cell: Arc<PendingCell<u32>> = PendingCell::new();
        let handle = cell.acquire(1);
        let result = handle.await_result(Duration::from_millis(10));
        assert!(result.is_none());
        drop(handle);
        // A retry loop re-acquiring after a timeout must not block forever:
        // dropping a timed-out handle has to release the slot.
        let handle2 = cell.acquire(2);
        assert_eq!(handle2.reference(), 2);
    }

    #[test]
    fn dropping_a_handle_without_release_still_frees_the_slot() {
        let cell: Arc<PendingCell<u32>> = PendingCell::new();
        {
            let _handle = cell.acquire(1);
            // handle goes out of scope here without an explicit release() call,
            // as happens on every timeout branch in transaction::TransactionEngine.
        }
        let handle2 = cell.acquire(2);
        assert_eq!(handle2.reference(), 2);
    }

    #[test]
    fn fulfill_with_mismatched_reference_does_not_wake() {
        let cell: Arc<PendingCell<u32>> = PendingCell::new();
        let handle = cell.acquire(1);
        assert!(!cell.fulfill(2, Ok(99)));
        let result = handle.await_result(Duration::from_millis(10));
        assert!(result.is_none());
    }

    #[test]
    fn resolve_observed_matches_and_mismatches() {
        let cell: Arc<PendingCell<u32>> = PendingCell::new();
        let handle = cell.acquire(0x1234);
        let outcome = cell.resolve_observed(0x1234, || 7, |_, _| Error::SuperFormatError);
        assert_eq!(outcome, Some(true));
        assert_eq!(handle.await_result(Duration::from_millis(10)).unwrap().unwrap(), 7);

        let handle = cell.acquire(0x1234);
        let outcome = cell.resolve_observed(0x5678, || 7, |expected, actual| {
            Error::SuperReferenceMismatch {
                expected: expected as u16,
                actual: actual as u16,
            }
        });
        assert_eq!(outcome, Some(false));
        assert!(matches!(
            handle.await_result(Duration::from_millis(10)).unwrap(),
            Err(Error::SuperReferenceMismatch { .. })
        ));
    }
}
