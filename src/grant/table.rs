// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The ordered grantable-RPC list plus the global counters that meter it.
//!
//! Ordering keys (`bytes_remaining`, `birth`) are snapshotted into each
//! entry at insertion/reorder time rather than re-read from the owning RPC
//! during a scan: the caller of `check_grantable` already holds that RPC's
//! lock and has the fresh values in hand, and re-deriving them for every
//! comparison during a list walk would mean taking a second, different
//! RPC's lock while already holding one — a lock-order hazard the design
//! notes in `spec.md` §9 ask us to avoid by modeling this as a
//! back-reference, not a live dereference.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::rpc::{PeerId, RpcHandle};

/// One entry in the grantable list: a non-owning handle to the RPC plus the
/// SRPT sort key snapshotted under the RPC's own lock.
#[derive(Clone)]
pub struct GrantEntry {
    pub rpc: RpcHandle,
    pub peer: PeerId,
    pub bytes_remaining: i64,
    pub birth: Instant,
}

/// Ordered collection of grantable RPCs plus the counters `send_grants`
/// meters against, guarded by one coarse-grained lock distinct from any
/// per-RPC lock (lock order position 2, between the socket lock and any
/// RPC lock).
pub struct GrantTable {
    inner: Mutex<Vec<GrantEntry>>,
    /// Bytes currently "incoming" across every RPC this protocol instance
    /// has granted to. Atomic so readers (e.g. `send_grants`'s initial
    /// budget check) don't need the list lock.
    pub total_incoming: AtomicU64,
    /// Non-FIFO byte budget left before the next round must include a FIFO
    /// grant; replenished from `HomaConfig::grant_nonfifo()`.
    pub grant_nonfifo_left: AtomicI64,
}

impl GrantTable {
    pub fn new(grant_nonfifo: i64) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            total_incoming: AtomicU64::new(0),
            grant_nonfifo_left: AtomicI64::new(grant_nonfifo),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the current ordering, for tests and for `choose_rpcs`.
    pub fn snapshot_ids(&self) -> Vec<u64> {
        self.inner
            .lock()
            .iter()
            .map(|e| e.rpc.lock().id.value())
            .collect()
    }

    fn sort_key_less(a: &GrantEntry, b: &GrantEntry) -> bool {
        (a.bytes_remaining, a.birth) < (b.bytes_remaining, b.birth)
    }

    /// Insert `entry` at its sorted position, or move an already-linked
    /// entry for the same RPC to its new sorted position after its key
    /// changed. Returns `true` if this was a fresh insertion.
    pub fn upsert(&self, entry: GrantEntry) -> bool {
        let mut list = self.inner.lock();
        let id = entry.rpc.lock().id;
        if let Some(pos) = list.iter().position(|e| e.rpc.lock().id == id) {
            list.remove(pos);
            let insert_at = list.partition_point(|e| Self::sort_key_less(e, &entry));
            list.insert(insert_at, entry);
            false
        } else {
            let insert_at = list.partition_point(|e| Self::sort_key_less(e, &entry));
            list.insert(insert_at, entry);
            true
        }
    }

    /// Remove the entry for `id`, if linked. Returns whether it was
    /// present.
    pub fn remove(&self, id: crate::rpc::RpcId) -> bool {
        let mut list = self.inner.lock();
        if let Some(pos) = list.iter().position(|e| e.rpc.lock().id == id) {
            list.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: crate::rpc::RpcId) -> bool {
        self.inner.lock().iter().any(|e| e.rpc.lock().id == id)
    }

    /// Select up to `max_overcommit` entries in list order, skipping (but
    /// not unlinking) any RPC whose peer has already reached
    /// `max_rpcs_per_peer` in this round. Entries chosen for removal (fully
    /// granted) are unlinked here under the same lock acquisition.
    pub fn choose_and_drain<F>(
        &self,
        max_overcommit: u32,
        max_rpcs_per_peer: u32,
        mut on_selected: F,
    ) -> Vec<RpcHandle>
    where
        F: FnMut(&RpcHandle) -> GrantOutcome,
    {
        let mut list = self.inner.lock();
        let mut per_peer: std::collections::HashMap<PeerId, u32> = std::collections::HashMap::new();
        let mut chosen = Vec::new();
        let mut remove_ids = Vec::new();

        for entry in list.iter() {
            if chosen.len() as u32 >= max_overcommit {
                break;
            }
            let count = per_peer.entry(entry.peer).or_insert(0);
            if *count >= max_rpcs_per_peer {
                continue;
            }
            *count += 1;
            chosen.push(entry.rpc.clone());
            match on_selected(&entry.rpc) {
                GrantOutcome::StayGrantable => {}
                GrantOutcome::FullyGranted => remove_ids.push(entry.rpc.lock().id),
            }
        }

        if !remove_ids.is_empty() {
            list.retain(|e| !remove_ids.contains(&e.rpc.lock().id));
        }
        chosen
    }

    /// Entry with the oldest `birth` in the list, used by the FIFO grant
    /// path. This is a separate scan from the SRPT order the list is kept
    /// in: the most-urgent (smallest `bytes_remaining`) entry at the front
    /// is not generally the oldest one, and the FIFO/pity grant exists
    /// specifically to rescue whichever message SRPT has been starving the
    /// longest. Does not unlink.
    pub fn oldest(&self) -> Option<RpcHandle> {
        self.inner
            .lock()
            .iter()
            .min_by_key(|e| e.birth)
            .map(|e| e.rpc.clone())
    }
}

/// Whether a selected RPC should be unlinked from the grantable list after
/// this round's grant (it reached `granted == length`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    StayGrantable,
    FullyGranted,
}
