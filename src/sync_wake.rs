// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wake notification with an atomic fast-path, shared by the handoff layer
//! and the receiver wait loop.
//!
//! Ingress callbacks must never block (they run in a softirq-like context),
//! so `notify()` is lock-free. A waiting receiver thread may sleep, so
//! `wait_timeout()` falls back to a condvar once the busy-poll budget is
//! spent.
//!
//! # Architecture
//! - Atomic flag for lock-free fast-path (hot traffic)
//! - Condvar fallback for idle wake (sporadic traffic)

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Two-tier wake notification: an atomic flag for the lock-free fast path,
/// a condvar for the sleeping fallback.
#[derive(Debug)]
pub struct WakeNotifier {
    data_ready: AtomicBool,
    sleeping: Mutex<bool>,
    condvar: Condvar,
}

impl WakeNotifier {
    #[inline]
    pub fn new() -> Self {
        Self {
            data_ready: AtomicBool::new(false),
            sleeping: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Publish that an RPC is ready. Safe to call from ingress context: no
    /// lock is taken unless a receiver is already parked in the condvar.
    #[inline]
    pub fn notify(&self) {
        self.data_ready.store(true, Ordering::Release);
        if *self.sleeping.lock() {
            self.condvar.notify_one();
        }
    }

    /// Lock-free peek-and-clear, used by the busy-poll phase of the wait
    /// loop.
    #[inline]
    pub fn check_and_clear(&self) -> bool {
        self.data_ready.swap(false, Ordering::Acquire)
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.data_ready.load(Ordering::Acquire)
    }

    /// Sleep until notified or `timeout` elapses. Returns whether a
    /// notification (rather than a timeout) woke the caller.
    #[inline]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.data_ready.swap(false, Ordering::Acquire) {
            return true;
        }

        let mut sleeping = self.sleeping.lock();
        if self.data_ready.swap(false, Ordering::Acquire) {
            return true;
        }

        *sleeping = true;
        let result = self.condvar.wait_for(&mut sleeping, timeout);
        *sleeping = false;

        if self.data_ready.swap(false, Ordering::Acquire) {
            !result.timed_out()
        } else {
            false
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for WakeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn atomic_fast_path_round_trips() {
        let notifier = WakeNotifier::new();
        assert!(!notifier.is_ready());
        notifier.notify();
        assert!(notifier.is_ready());
        assert!(notifier.check_and_clear());
        assert!(!notifier.is_ready());
    }

    #[test]
    fn notify_wakes_sleeping_waiter() {
        let notifier = Arc::new(WakeNotifier::new());
        let n = Arc::clone(&notifier);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            n.notify();
        });

        let start = std::time::Instant::now();
        let woken = notifier.wait_timeout(Duration::from_millis(200));
        assert!(woken, "should be woken by notify");
        assert!(start.elapsed() < Duration::from_millis(150));

        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out_without_notify() {
        let notifier = WakeNotifier::new();
        assert!(!notifier.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn pending_notify_is_observed_immediately() {
        let notifier = WakeNotifier::new();
        notifier.notify();
        assert!(notifier.wait_timeout(Duration::from_millis(100)));
    }
}
