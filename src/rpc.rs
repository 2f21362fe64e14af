// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Core data model: RPCs, in-flight messages, and wait-side interests.
//!
//! RPCs are owned by a [`crate::collab::RpcTable`] implementation (typically
//! backed by a `DashMap`, per the arena-ownership rule); every other
//! structure in this crate holds non-owning `Arc<Mutex<RpcInner>>` clones.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::error::HomaError;
use crate::range::ByteRange;
use crate::sync_wake::WakeNotifier;

/// Identifies one RPC. The low bit distinguishes the originating side:
/// even ids were allocated by the client, odd ids by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RpcId(u64);

impl RpcId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub fn is_client_originated(self) -> bool {
        self.0 & 1 == 0
    }
}

/// Opaque peer address handle; the real transport maps this to a socket
/// address, which is out of scope here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

/// Lifecycle state of one RPC as seen by the receive-side core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    /// Request sent (client side), awaiting a response.
    Outgoing,
    /// Message still being assembled; not yet deliverable.
    Incoming,
    /// Fully reassembled and waiting for a receiver to claim it.
    Ready,
    /// Terminated (completed, aborted, or peer unreachable); reaped lazily.
    Dead,
}

/// One segment received for a message, queued until the gap tracker admits
/// it for copy-out.
#[derive(Debug, Clone)]
pub struct QueuedSegment {
    pub range: ByteRange,
    pub data: Vec<u8>,
}

/// State of an incoming (or outgoing, from the grant engine's perspective)
/// message body.
#[derive(Debug)]
pub struct MsgIn {
    /// Total message length once known; `None` before the first packet.
    pub length: Option<u64>,
    /// Highest contiguous byte offset received so far.
    pub recv_end: u64,
    /// Bytes not yet received, once `length` is known.
    pub bytes_remaining: i64,
    /// Bytes granted to the sender so far (monotonic).
    pub granted: u64,
    /// Whether this message needs scheduled grants at all (false for
    /// messages that fit entirely in the unscheduled prefix).
    pub scheduled: bool,
    /// Sender asked for every segment to be resent.
    pub resend_all: bool,
    /// Most recently granted priority.
    pub priority: u8,
    /// Insertion time, used as the FIFO tiebreaker.
    pub birth: Instant,
    /// Gaps not yet filled, sorted ascending and non-overlapping.
    pub gaps: Vec<ByteRange>,
    /// Segments received but not yet copied to user buffers.
    pub segments: VecDeque<QueuedSegment>,
    /// Whether this message is currently linked into the grant table's
    /// grantable list.
    pub on_grantable: bool,
    /// Set while a copy-out is in flight, per the two-phase copy protocol.
    pub copying_to_user: bool,
    /// Buffer pages allocated for copy-out; 0 means buffers were never
    /// obtained (or were released), and arriving packets must be dropped.
    pub num_bpages: usize,
    /// Count of in-flight `send_grants` rounds that computed a grant for
    /// this RPC but have not yet emitted it; pins the RPC against
    /// concurrent freeing between the grant-table unlock and the emit.
    pub grants_in_progress: u32,
}

impl MsgIn {
    pub fn new(scheduled_hint: bool) -> Self {
        Self {
            length: None,
            recv_end: 0,
            bytes_remaining: 0,
            granted: 0,
            scheduled: scheduled_hint,
            resend_all: false,
            priority: 0,
            birth: Instant::now(),
            gaps: Vec::new(),
            segments: VecDeque::new(),
            on_grantable: false,
            copying_to_user: false,
            num_bpages: 0,
            grants_in_progress: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.length, Some(len) if self.recv_end >= len) && self.gaps.is_empty()
    }
}

/// Outbound-message bookkeeping the receive-side core still needs: GRANT
/// packets advance `granted` here, and RESEND asks whether transmission has
/// fallen behind it. The transmit path itself (framing and scheduling the
/// actual retransmission) is out of scope; this is only the state the
/// dispatch table in `spec.md` §4.2 reads and writes.
#[derive(Debug, Clone, Copy)]
pub struct MsgOut {
    pub length: u64,
    /// High-water mark of bytes the peer has authorized via GRANT.
    pub granted: u64,
    /// Bytes actually handed to the transmit path so far.
    pub sent: u64,
}

impl MsgOut {
    pub fn new(length: u64, unscheduled: u64) -> Self {
        Self {
            length,
            granted: unscheduled.min(length),
            sent: 0,
        }
    }
}

/// Mutable per-RPC state, held behind the RPC lock (lock order position 3).
#[derive(Debug)]
pub struct RpcInner {
    pub id: RpcId,
    pub peer: PeerId,
    pub sport: u16,
    pub dport: u16,
    pub state: RpcState,
    pub msgin: Option<MsgIn>,
    pub msgout: Option<MsgOut>,
    /// Set while a handoff to a waiting thread is in progress, so a
    /// concurrent dispatch doesn't double-hand-off the same RPC.
    pub handing_off: bool,
    /// Set once this RPC is linked into a socket's ready queue.
    pub ready_linked: bool,
    /// Interest this RPC was claimed by, if a receiver is already waiting
    /// for it specifically.
    pub claimed_by: Option<Arc<Interest>>,
    pub error: Option<HomaError>,
    /// Consecutive BUSY-or-silent ticks observed, reset by any BUSY packet.
    pub silent_ticks: u32,
}

/// Non-owning handle shared across the grantable list, ready queues, and
/// interests. The `RpcTable` is the sole owner.
pub type RpcHandle = Arc<Mutex<RpcInner>>;

impl RpcInner {
    pub fn new(id: RpcId, peer: PeerId, sport: u16, dport: u16, state: RpcState) -> Self {
        Self {
            id,
            peer,
            sport,
            dport,
            state,
            msgin: None,
            msgout: None,
            handing_off: false,
            ready_linked: false,
            claimed_by: None,
            error: None,
            silent_ticks: 0,
        }
    }
}

/// A receiver's registered wait, published on a socket's interest lists.
///
/// `ready_rpc` is the atomically-published slot the dispatcher/handoff path
/// fills in; the waiting thread polls it instead of taking the socket lock
/// on the fast path.
pub struct Interest {
    /// RPC this interest targets specifically, if any (a blocking `Recv`
    /// for one particular id rather than "any ready request/response").
    pub target_rpc: Option<RpcId>,
    pub wants_request: bool,
    pub wants_response: bool,
    /// Logical core/thread slot, used by the handoff layer's idle-core
    /// preference.
    pub core: u32,
    /// Monotonic counter of when this interest's owning thread was last
    /// active; compared against `busy_cycles` to decide idleness.
    pub last_active: AtomicU64,
    ready_rpc: ArcSwapOption<RpcHandle>,
    pub wake: Arc<WakeNotifier>,
}

impl Interest {
    pub fn new(
        target_rpc: Option<RpcId>,
        wants_request: bool,
        wants_response: bool,
        core: u32,
    ) -> Self {
        Self {
            target_rpc,
            wants_request,
            wants_response,
            core,
            last_active: AtomicU64::new(0),
            ready_rpc: ArcSwapOption::from(None),
            wake: WakeNotifier::shared(),
        }
    }

    /// Publish `rpc` as the answer to this interest and wake the waiter.
    pub fn satisfy(&self, rpc: RpcHandle) {
        self.ready_rpc.store(Some(Arc::new(rpc)));
        self.wake.notify();
    }

    /// Take the published RPC, if any, clearing the slot.
    pub fn take_ready(&self) -> Option<RpcHandle> {
        self.ready_rpc.swap(None).map(|arc| (*arc).clone())
    }

    pub fn matches(&self, rpc: &RpcInner, is_request: bool) -> bool {
        if let Some(target) = self.target_rpc {
            return target == rpc.id;
        }
        if is_request {
            self.wants_request
        } else {
            self.wants_response
        }
    }

    pub fn touch(&self, tick: u64) {
        self.last_active.store(tick, Ordering::Relaxed);
    }

    pub fn last_active(&self) -> u64 {
        self.last_active.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Interest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interest")
            .field("target_rpc", &self.target_rpc)
            .field("wants_request", &self.wants_request)
            .field("wants_response", &self.wants_response)
            .field("core", &self.core)
            .finish()
    }
}

/// Per-peer unscheduled-byte cutoffs, as advertised by the most recent
/// CUTOFFS packet from that peer.
#[derive(Debug)]
pub struct PeerState {
    pub addr: PeerId,
    pub unsched_cutoffs: Mutex<[u32; crate::wire::MAX_PRIORITIES]>,
    pub cutoff_version: AtomicU64,
    /// Last time a CUTOFFS reply was sent to this peer, rate-limiting how
    /// often a stale `cutoff_version` on an inbound DATA packet triggers a
    /// fresh one.
    last_cutoffs_notice: Mutex<Option<Instant>>,
}

impl PeerState {
    pub fn new(addr: PeerId) -> Self {
        Self {
            addr,
            unsched_cutoffs: Mutex::new([0; crate::wire::MAX_PRIORITIES]),
            cutoff_version: AtomicU64::new(0),
            last_cutoffs_notice: Mutex::new(None),
        }
    }

    /// Returns `true` (and records "now") if a CUTOFFS reply should be sent
    /// — i.e. none was sent within `min_interval`.
    pub fn cutoffs_notice_due(&self, min_interval: std::time::Duration) -> bool {
        let mut last = self.last_cutoffs_notice.lock();
        let now = Instant::now();
        let due = last.map_or(true, |t| now.duration_since(t) >= min_interval);
        if due {
            *last = Some(now);
        }
        due
    }
}

pub type PeerHandle = Arc<PeerState>;
