// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket-level interest lists and the ingress-side handoff from a newly
//! ready RPC to a waiting receiver thread.
//!
//! The wake primitive is [`crate::sync_wake::WakeNotifier`]: an atomic
//! fast-path plus `Condvar` fallback split serves both "ingress callbacks
//! must not block" and "receiver thread may sleep".

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::rpc::{Interest, RpcHandle, RpcId};
use crate::sync_wake::WakeNotifier;

/// An interest is treated as idle, and preferred as a handoff target, once
/// this many ticks have passed since it was last touched by its owning
/// thread. Not part of the enumerated configuration knobs (`spec.md` §6):
/// this is an implementation-internal affinity hint, not a tunable a caller
/// is expected to set per protocol instance.
const BUSY_CYCLES_THRESHOLD: u64 = 64;

struct SocketInner {
    request_interests: VecDeque<Arc<Interest>>,
    response_interests: VecDeque<Arc<Interest>>,
    targeted: HashMap<RpcId, Arc<Interest>>,
    ready_requests: VecDeque<RpcHandle>,
    ready_responses: VecDeque<RpcHandle>,
    shutdown: bool,
}

impl SocketInner {
    fn new() -> Self {
        Self {
            request_interests: VecDeque::new(),
            response_interests: VecDeque::new(),
            targeted: HashMap::new(),
            ready_requests: VecDeque::new(),
            ready_responses: VecDeque::new(),
            shutdown: false,
        }
    }
}

/// The receive-side half of a socket: interest lists and ready queues,
/// guarded by the socket lock (lock order position 1, ahead of the
/// grant-table and RPC locks). Port allocation, the send path, and kernel
/// registration live on the real socket and are out of scope here.
pub struct HomaSocket {
    inner: Mutex<SocketInner>,
    cycle: AtomicU64,
    pub data_ready: Arc<WakeNotifier>,
}

impl HomaSocket {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SocketInner::new()),
            cycle: AtomicU64::new(0),
            data_ready: WakeNotifier::shared(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.data_ready.notify();
    }

    /// Monotonic tick, advanced once per wait-loop iteration, used as the
    /// idleness clock for [`choose_interest`].
    pub fn tick(&self) -> u64 {
        self.cycle.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `interest` targeting one specific RPC id, under the socket
    /// lock. Used by `wait_for_message` when `id != 0`.
    pub fn register_targeted(&self, id: RpcId, interest: Arc<Interest>) {
        self.inner.lock().targeted.insert(id, interest);
    }

    /// Register `interest` at the front of the request or response list
    /// (stack discipline, per `spec.md` §4.4), or claim an already-queued
    /// ready RPC of the matching category instead. Returns the claimed RPC,
    /// if any.
    pub fn register_or_claim(&self, interest: Arc<Interest>, wants_request: bool, wants_response: bool) -> Option<RpcHandle> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return None;
        }
        if wants_request {
            if let Some(rpc) = inner.ready_requests.pop_front() {
                return Some(rpc);
            }
            inner.request_interests.push_front(interest.clone());
        }
        if wants_response {
            if let Some(rpc) = inner.ready_responses.pop_front() {
                // Undo the request registration above; this interest is
                // being claimed by a response instead.
                if wants_request {
                    inner.request_interests.retain(|i| !Arc::ptr_eq(i, &interest));
                }
                return Some(rpc);
            }
            inner.response_interests.push_front(interest);
        }
        None
    }

    /// Remove `interest` from every list it might still be linked into
    /// (teardown after a wake, per `spec.md` §4.5 step 6).
    pub fn unlink_interest(&self, id: Option<RpcId>, interest: &Arc<Interest>) {
        let mut inner = self.inner.lock();
        if let Some(id) = id {
            inner.targeted.remove(&id);
        }
        inner.request_interests.retain(|i| !Arc::ptr_eq(i, interest));
        inner.response_interests.retain(|i| !Arc::ptr_eq(i, interest));
    }

    pub fn reap_dead<T: crate::collab::RpcTable>(&self, table: &T, limit: u32) -> u32 {
        table.reap(limit)
    }
}

impl Default for HomaSocket {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefer the first interest in `list` that has been idle (its owning
/// thread's core hasn't touched it) for at least `BUSY_CYCLES_THRESHOLD`
/// ticks; fall back to the front of the list if every interest looks busy.
/// Reusing the front preserves thread/cache affinity per `spec.md` §4.4.
fn choose_interest(list: &VecDeque<Arc<Interest>>, current_tick: u64) -> Option<usize> {
    if list.is_empty() {
        return None;
    }
    let idle = list.iter().position(|interest| {
        current_tick.saturating_sub(interest.last_active()) >= BUSY_CYCLES_THRESHOLD
    });
    Some(idle.unwrap_or(0))
}

/// Hand `rpc` off to a waiting receiver. Preconditions: `rpc` must not
/// already be mid-handoff (checked and set here under the socket lock).
///
/// Target priority: (a) an interest registered specifically on this RPC's
/// id; (b) the front of the request or response interest list, chosen by
/// [`choose_interest`]; (c) otherwise link the RPC at the tail of the
/// matching ready queue and fire a data-ready notification.
pub fn rpc_handoff(socket: &HomaSocket, rpc: &RpcHandle, is_request: bool) {
    let id = {
        let mut guard = rpc.lock();
        if guard.handing_off {
            return;
        }
        guard.handing_off = true;
        guard.id
    };

    let mut inner = socket.inner.lock();
    if let Some(interest) = inner.targeted.remove(&id) {
        drop(inner);
        publish(rpc, &interest);
        return;
    }

    let tick = socket.cycle.load(Ordering::Relaxed);
    let list = if is_request {
        &mut inner.request_interests
    } else {
        &mut inner.response_interests
    };
    if let Some(pos) = choose_interest(list, tick) {
        let interest = list.remove(pos).expect("position came from this list");
        drop(inner);
        publish(rpc, &interest);
        return;
    }

    if is_request {
        inner.ready_requests.push_back(rpc.clone());
    } else {
        inner.ready_responses.push_back(rpc.clone());
    }
    drop(inner);
    rpc.lock().handing_off = false;
    socket.data_ready.notify();
}

fn publish(rpc: &RpcHandle, interest: &Arc<Interest>) {
    interest.satisfy(rpc.clone());
    rpc.lock().handing_off = false;
}
