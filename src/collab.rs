// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Contracts for the external collaborators this crate only reaches through
//! traits: the buffer-page pool, the RPC table, the peer table, and the
//! control-packet emitter. Socket lifecycle, port allocation, retransmission
//! scheduling and kernel plumbing live on the other side of these traits and
//! are out of scope here.
//!
//! This module also ships in-memory test doubles for each trait so the core
//! is exercisable without a real kernel socket, keeping collaborator state
//! behind a `DashMap` for lock-free lookup rather than a single global
//! mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::rpc::{PeerHandle, PeerId, RpcHandle, RpcId, RpcInner, RpcState};
use crate::wire::{CommonHeader, PacketType};

/// The bpage allocator's contract: acquire buffer pages for an RPC and
/// resolve `(offset, length)` into a destination to copy into.
///
/// `get_buffer` returns a raw pointer because the real allocator hands out
/// slots in a user-mapped pool without a lock held across the copy; a safe
/// `&mut [u8]` would need a lifetime this crate cannot express without
/// pretending the external pool is simpler than it is. `copy_to_user` is the
/// sole caller and confines the `unsafe` dereference to one documented call
/// site.
pub trait BufferPool: Send + Sync {
    /// Acquire buffer pages for `rpc`, returning how many pages were
    /// acquired (0 means none available; the caller must drop the message).
    fn allocate(&self, rpc: RpcId) -> usize;
    /// Resolve `offset` within `rpc`'s buffer to a destination pointer and
    /// the number of contiguous bytes available there.
    fn get_buffer(&self, rpc: RpcId, offset: u64) -> Option<(*mut u8, usize)>;
    /// Release all pages held by `rpc`.
    fn release(&self, rpc: RpcId);
}

/// The RPC table's contract: lookup, server-side creation, and teardown.
/// The table is the sole owner of every `RpcHandle`; everything else in this
/// crate holds non-owning clones.
pub trait RpcTable: Send + Sync {
    fn find_client(&self, id: RpcId) -> Option<RpcHandle>;
    fn find_server(&self, peer: PeerId, sport: u16, id: RpcId) -> Option<RpcHandle>;
    /// Create (or return the existing) server RPC for `id`. The bool is
    /// `true` only when this call created it.
    fn new_server(&self, peer: PeerId, sport: u16, dport: u16, id: RpcId) -> (RpcHandle, bool);
    fn free(&self, id: RpcId);
    /// Dead RPCs still in the table, awaiting opportunistic reaping.
    fn dead_count(&self) -> usize;
    /// Reap up to `limit` dead RPCs, returning how many were freed.
    fn reap(&self, limit: u32) -> u32;
}

/// The peer table's contract: resolve an address to its cutoff state.
pub trait PeerTable: Send + Sync {
    fn find(&self, addr: PeerId) -> PeerHandle;
}

/// A control packet destination: either a specific RPC (its peer/ports are
/// read off the RPC) or a bare peer/socket pair (used for replies to
/// packets addressed to an unknown RPC).
pub enum ControlTarget<'a> {
    Rpc(&'a RpcHandle),
    Peer { peer: PeerId, sport: u16, dport: u16 },
}

/// The outbound control-packet contract. Implementations hand packets to
/// the transmit path, which is out of scope here.
pub trait ControlEmitter: Send + Sync {
    fn xmit_control(&self, kind: PacketType, header: CommonHeader, target: ControlTarget<'_>);
}

/// One emitted control packet, as recorded by [`RecordingEmitter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedControl {
    pub kind: PacketType,
    pub header: CommonHeader,
    pub rpc_id: Option<u64>,
}

/// A `ControlEmitter` that records every packet instead of transmitting it,
/// for use in tests.
#[derive(Default)]
pub struct RecordingEmitter {
    emitted: Mutex<Vec<EmittedControl>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<EmittedControl> {
        std::mem::take(&mut self.emitted.lock())
    }

    pub fn len(&self) -> usize {
        self.emitted.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ControlEmitter for RecordingEmitter {
    fn xmit_control(&self, kind: PacketType, header: CommonHeader, target: ControlTarget<'_>) {
        let rpc_id = match target {
            ControlTarget::Rpc(rpc) => Some(rpc.lock().id.value()),
            ControlTarget::Peer { .. } => None,
        };
        self.emitted.lock().push(EmittedControl {
            kind,
            header,
            rpc_id,
        });
    }
}

/// An in-memory, `DashMap`-backed RPC table for tests and for any
/// integration that doesn't yet need a real kernel-backed one.
#[derive(Default)]
pub struct MemoryRpcTable {
    rpcs: DashMap<u64, RpcHandle>,
    next_server_id: AtomicU16,
}

impl MemoryRpcTable {
    pub fn new() -> Self {
        Self {
            rpcs: DashMap::new(),
            next_server_id: AtomicU16::new(1),
        }
    }

    /// Insert a pre-built RPC (used by tests that want to seed state
    /// directly rather than go through `new_server`).
    pub fn insert(&self, handle: RpcHandle) {
        let id = handle.lock().id.value();
        self.rpcs.insert(id, handle);
    }

    pub fn get(&self, id: RpcId) -> Option<RpcHandle> {
        self.rpcs.get(&id.value()).map(|e| e.value().clone())
    }
}

impl RpcTable for MemoryRpcTable {
    fn find_client(&self, id: RpcId) -> Option<RpcHandle> {
        debug_assert!(id.is_client_originated());
        self.get(id)
    }

    fn find_server(&self, _peer: PeerId, _sport: u16, id: RpcId) -> Option<RpcHandle> {
        debug_assert!(!id.is_client_originated());
        self.get(id)
    }

    fn new_server(&self, peer: PeerId, sport: u16, dport: u16, id: RpcId) -> (RpcHandle, bool) {
        match self.rpcs.entry(id.value()) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let handle: RpcHandle = Arc::new(parking_lot::Mutex::new(RpcInner::new(
                    id,
                    peer,
                    sport,
                    dport,
                    RpcState::Incoming,
                )));
                e.insert(handle.clone());
                self.next_server_id.fetch_add(1, Ordering::Relaxed);
                (handle, true)
            }
        }
    }

    fn free(&self, id: RpcId) {
        if let Some((_, handle)) = self.rpcs.remove(&id.value()) {
            handle.lock().state = RpcState::Dead;
        }
    }

    fn dead_count(&self) -> usize {
        self.rpcs
            .iter()
            .filter(|e| e.value().lock().state == RpcState::Dead)
            .count()
    }

    fn reap(&self, limit: u32) -> u32 {
        let dead: Vec<u64> = self
            .rpcs
            .iter()
            .filter(|e| e.value().lock().state == RpcState::Dead)
            .take(limit as usize)
            .map(|e| *e.key())
            .collect();
        let reaped = dead.len() as u32;
        for id in dead {
            self.rpcs.remove(&id);
        }
        reaped
    }
}

/// An in-memory peer table; cutoffs default to zero (no unscheduled-byte
/// restriction) until a CUTOFFS packet updates them.
#[derive(Default)]
pub struct MemoryPeerTable {
    peers: DashMap<u32, PeerHandle>,
}

impl MemoryPeerTable {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerTable for MemoryPeerTable {
    fn find(&self, addr: PeerId) -> PeerHandle {
        self.peers
            .entry(addr.0)
            .or_insert_with(|| Arc::new(crate::rpc::PeerState::new(addr)))
            .clone()
    }
}

/// A growable-`Vec`-per-RPC buffer pool, standing in for the kernel's
/// fixed-size bpage slab allocator (a real allocator hands out slots from a
/// small number of fixed size-classes via an atomic bitmap; this double just
/// grows a `Vec<u8>`, since tests only need correct offsets, not bounded
/// memory).
#[derive(Default)]
pub struct MemoryBufferPool {
    buffers: Mutex<HashMap<u64, Vec<u8>>>,
    /// When `Some(0)`, the next `allocate` call reports "no pages available"
    /// — used by tests that exercise the buffer-exhaustion path.
    pub fail_next_allocate: std::sync::atomic::AtomicBool,
}

const BPAGE_SIZE: usize = 64 * 1024;

impl MemoryBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self, rpc: RpcId) -> Vec<u8> {
        self.buffers
            .lock()
            .get(&rpc.value())
            .cloned()
            .unwrap_or_default()
    }
}

impl BufferPool for MemoryBufferPool {
    fn allocate(&self, rpc: RpcId) -> usize {
        if self
            .fail_next_allocate
            .swap(false, Ordering::AcqRel)
        {
            return 0;
        }
        self.buffers.lock().entry(rpc.value()).or_default();
        1
    }

    fn get_buffer(&self, rpc: RpcId, offset: u64) -> Option<(*mut u8, usize)> {
        let mut guard = self.buffers.lock();
        let buf = guard.entry(rpc.value()).or_default();
        let offset = offset as usize;
        if buf.len() < offset + BPAGE_SIZE {
            buf.resize(offset + BPAGE_SIZE, 0);
        }
        let ptr = buf[offset..].as_mut_ptr();
        Some((ptr, BPAGE_SIZE))
    }

    fn release(&self, rpc: RpcId) {
        self.buffers.lock().remove(&rpc.value());
    }
}

/// Reserved extension point for RPC cleanup keyed by peer, distinct from
/// [`abort_socket_rpcs`]: the kernel source overloads one function name for
/// both, this crate keeps them as two named operations per the resolved
/// open question in `SPEC_FULL.md` §9. Neither is implemented here — both
/// belong to socket/peer lifecycle, out of scope per this crate's charter —
/// but the signatures are reserved so an integration has an obvious place
/// to hang them.
pub fn abort_peer_rpcs<T: RpcTable>(_table: &T, _peer: PeerId, _error: crate::error::HomaError) {
    unimplemented!("socket/peer lifecycle is out of scope for the receive-side core")
}

/// See [`abort_peer_rpcs`].
pub fn abort_socket_rpcs<T: RpcTable>(_table: &T, _error: crate::error::HomaError) {
    unimplemented!("socket/peer lifecycle is out of scope for the receive-side core")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_rpc_table_new_server_is_idempotent() {
        let table = MemoryRpcTable::new();
        let id = RpcId::new(41);
        let (first, created) = table.new_server(PeerId(1), 80, 81, id);
        assert!(created);
        let (second, created_again) = table.new_server(PeerId(1), 80, 81, id);
        assert!(!created_again);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn free_marks_dead_and_removes_from_table() {
        let table = MemoryRpcTable::new();
        let id = RpcId::new(41);
        table.new_server(PeerId(1), 80, 81, id);
        table.free(id);
        assert!(table.find_server(PeerId(1), 80, id).is_none());
    }

    #[test]
    fn buffer_pool_allocate_then_resolve_offsets() {
        let pool = MemoryBufferPool::new();
        let rpc = RpcId::new(4);
        assert_eq!(pool.allocate(rpc), 1);
        let (ptr, len) = pool.get_buffer(rpc, 128).unwrap();
        assert!(!ptr.is_null());
        assert!(len >= BPAGE_SIZE);
    }

    #[test]
    fn buffer_pool_can_be_forced_to_fail() {
        let pool = MemoryBufferPool::new();
        pool.fail_next_allocate.store(true, Ordering::Release);
        assert_eq!(pool.allocate(RpcId::new(4)), 0);
        assert_eq!(pool.allocate(RpcId::new(4)), 1);
    }

    #[test]
    fn recording_emitter_captures_packets() {
        let emitter = RecordingEmitter::new();
        let rpc: RpcHandle = Arc::new(parking_lot::Mutex::new(RpcInner::new(
            RpcId::new(6),
            PeerId(1),
            80,
            81,
            RpcState::Incoming,
        )));
        let header = CommonHeader {
            rpc_id: 6,
            sport: 80,
            dport: 81,
            packet_type: PacketType::Grant,
        };
        emitter.xmit_control(PacketType::Grant, header, ControlTarget::Rpc(&rpc));
        let drained = emitter.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].rpc_id, Some(6));
        assert!(emitter.is_empty());
    }
}
