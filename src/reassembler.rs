// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-RPC inbound reassembly: gap tracking and two-phase copy-out.
//!
//! Gap splitting/merging is grounded on `GapTracker::mark_filled`'s
//! clip-against-every-range approach, generalized from RTPS sequence
//! numbers to byte offsets and tightened: an out-of-order segment must land
//! within exactly one existing gap, aligned at a boundary or strictly
//! interior. A segment that straddles a gap boundary, or spans more than
//! one gap, is a protocol violation and is discarded rather than clipped.

use crate::collab::BufferPool;
use crate::error::HomaError;
use crate::range::ByteRange;
use crate::rpc::{MsgIn, QueuedSegment, RpcHandle};

/// Batch size for one `copy_to_user` iteration: detach this many segments
/// under the RPC lock, drop the lock, then copy all of them.
const COPY_BATCH: usize = 20;

/// Zero-length DATA segments are a protocol error (resolved open question,
/// `SPEC_FULL.md` §9): nothing arrives this way on a conformant sender.
fn is_zero_length(length: u32) -> bool {
    length == 0
}

/// Initialize `msgin` for a freshly-discovered message. `granted` starts at
/// `min(unscheduled, length)`; if the buffer pool has no pages to offer,
/// `granted` is forced to 0 so arriving packets are dropped until buffers
/// free up.
pub fn init(msgin: &mut MsgIn, rpc_id: crate::rpc::RpcId, length: u64, unscheduled: u64, pool: &dyn BufferPool) {
    msgin.length = Some(length);
    msgin.bytes_remaining = length as i64;
    msgin.scheduled = length > unscheduled;
    msgin.granted = unscheduled.min(length);
    msgin.num_bpages = pool.allocate(rpc_id);
    if msgin.num_bpages == 0 {
        log::warn!(
            "[REASSEMBLER] rpc={} no buffer pages available, granted forced to 0",
            rpc_id.value()
        );
        msgin.granted = 0;
    }
}

/// Outcome of [`add_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New bytes were integrated; the caller should post a handoff event
    /// and consider re-ranking the RPC on the grantable list.
    Accepted,
    /// Bytes already received (duplicate); no state change.
    Duplicate,
    /// Segment overruns the message, has zero length, or straddles a gap
    /// boundary — discarded and metered.
    Discarded,
}

/// Integrate one received segment `[offset, offset+length)` into `msgin`.
pub fn add_packet(msgin: &mut MsgIn, offset: u64, length: u32, payload: Vec<u8>) -> AddOutcome {
    if is_zero_length(length) {
        log::debug!("[REASSEMBLER] drop zero-length segment at offset={}", offset);
        return AddOutcome::Discarded;
    }
    let Some(msg_length) = msgin.length else {
        log::debug!("[REASSEMBLER] drop segment offset={} length={}: message length unknown", offset, length);
        return AddOutcome::Discarded;
    };
    let end = offset + length as u64;
    if end > msg_length {
        log::debug!(
            "[REASSEMBLER] drop segment [{}, {}): overruns message length={}",
            offset, end, msg_length
        );
        return AddOutcome::Discarded;
    }

    if offset == msgin.recv_end {
        msgin.recv_end = end;
        msgin.bytes_remaining -= length as i64;
        msgin.segments.push_back(QueuedSegment {
            range: ByteRange::new(offset, end),
            data: payload,
        });
        return AddOutcome::Accepted;
    }

    if offset > msgin.recv_end {
        msgin.gaps.push(ByteRange::from_gap(msgin.recv_end, offset));
        msgin.recv_end = end;
        msgin.bytes_remaining -= length as i64;
        msgin.segments.push_back(QueuedSegment {
            range: ByteRange::new(offset, end),
            data: payload,
        });
        return AddOutcome::Accepted;
    }

    // offset < recv_end: must land within exactly one existing gap.
    let Some(idx) = msgin.gaps.iter().position(|g| g.contains(offset)) else {
        // Falls entirely within already-received data: a duplicate.
        return AddOutcome::Duplicate;
    };
    let gap = msgin.gaps[idx];
    if end > gap.end() {
        // Straddles the gap's far boundary (into received data or the next
        // gap): a protocol violation, not a valid retransmission.
        log::debug!(
            "[REASSEMBLER] drop segment [{}, {}): straddles gap [{}, {})",
            offset, end, gap.start(), gap.end()
        );
        return AddOutcome::Discarded;
    }

    if offset == gap.start() && end == gap.end() {
        msgin.gaps.remove(idx);
    } else if offset == gap.start() {
        msgin.gaps[idx] = ByteRange::new(end, gap.end());
    } else if end == gap.end() {
        msgin.gaps[idx] = ByteRange::new(gap.start(), offset);
    } else {
        msgin.gaps[idx] = ByteRange::new(gap.start(), offset);
        msgin.gaps.insert(idx + 1, ByteRange::new(end, gap.end()));
    }

    msgin.bytes_remaining -= length as i64;
    msgin.segments.push_back(QueuedSegment {
        range: ByteRange::new(offset, end),
        data: payload,
    });
    AddOutcome::Accepted
}

/// What the dispatcher should ask the peer to retransmit, if anything.
pub fn get_resend_range(msgin: &MsgIn) -> Option<(u64, u32)> {
    if msgin.length.is_none() {
        // Nothing is known about the message at all; force the sender to
        // emit at least one full packet carrying its metadata.
        return Some((0, 100));
    }
    if let Some(gap) = msgin.gaps.first() {
        return Some((gap.start(), gap.len() as u32));
    }
    if msgin.granted > msgin.recv_end {
        return Some((msgin.recv_end, (msgin.granted - msgin.recv_end) as u32));
    }
    None
}

/// Drain `msgin`'s packet queue into the user buffers resolved through
/// `pool`, in bounded batches, without holding the RPC lock across any
/// individual copy.
///
/// `rpc` must currently be locked by the caller for the duration of each
/// lock-protected section; this function itself manages the drop/reacquire
/// cycle around the copy phase.
pub fn copy_to_user(rpc: &RpcHandle, pool: &dyn BufferPool) -> Result<(), HomaError> {
    loop {
        let (rpc_id, batch) = {
            let mut inner = rpc.lock();
            let Some(msgin) = inner.msgin.as_mut() else {
                return Ok(());
            };
            if msgin.segments.is_empty() {
                msgin.copying_to_user = false;
                return Ok(());
            }
            msgin.copying_to_user = true;
            let mut batch = Vec::with_capacity(COPY_BATCH.min(msgin.segments.len()));
            for _ in 0..COPY_BATCH {
                match msgin.segments.pop_front() {
                    Some(seg) => batch.push(seg),
                    None => break,
                }
            }
            (inner.id, batch)
        };
        // RPC lock dropped: packet handlers may keep enqueuing segments on
        // this RPC, and this copy may sleep on a user-space page fault.
        for seg in &batch {
            let (dst, available) = pool
                .get_buffer(rpc_id, seg.range.start())
                .ok_or(HomaError::CopyFailed(-5))?; // -EIO
            if available < seg.data.len() {
                return Err(HomaError::CopyFailed(-7)); // -EFAULT-equivalent
            }
            // SAFETY: `dst` points at `available` bytes of caller-owned
            // memory resolved for this exact offset by the buffer pool
            // contract (`BufferPool::get_buffer`); `seg.data.len() <=
            // available` was just checked above.
            unsafe {
                std::ptr::copy_nonoverlapping(seg.data.as_ptr(), dst, seg.data.len());
            }
        }
        if batch.len() < COPY_BATCH {
            let mut inner = rpc.lock();
            if let Some(msgin) = inner.msgin.as_mut() {
                if msgin.segments.is_empty() {
                    msgin.copying_to_user = false;
                }
            }
            return Ok(());
        }
    }
}
