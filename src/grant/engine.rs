// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `check_grantable`, `remove_from_grantable`, and `send_grants`: the three
//! operations that keep the grantable list in SRPT order and turn spare
//! "incoming" budget into GRANT packets.

use std::sync::atomic::Ordering;

use crate::collab::{ControlEmitter, ControlTarget};
use crate::config::HomaConfig;
use crate::grant::table::{GrantEntry, GrantOutcome, GrantTable};
use crate::rpc::{RpcHandle, RpcId, RpcState};
use crate::wire::{CommonHeader, GrantHeader, PacketType};

/// Insert `rpc` into the grantable list (or move it to its new sorted
/// position after a packet arrival reduced `bytes_remaining`). No-op if the
/// RPC is already fully granted or dead. The caller must hold `rpc`'s lock.
pub fn check_grantable(table: &GrantTable, rpc: &RpcHandle) {
    let (should_link, entry) = {
        let inner = rpc.lock();
        if matches!(inner.state, RpcState::Dead) {
            (false, None)
        } else if let Some(msgin) = &inner.msgin {
            match msgin.length {
                Some(length) if msgin.granted < length => (
                    true,
                    Some(GrantEntry {
                        rpc: rpc.clone(),
                        peer: inner.peer,
                        bytes_remaining: msgin.bytes_remaining,
                        birth: msgin.birth,
                    }),
                ),
                _ => (false, None),
            }
        } else {
            (false, None)
        }
    };

    if !should_link {
        let id = rpc.lock().id;
        table.remove(id);
        return;
    }

    if let Some(entry) = entry {
        let id = entry.rpc.lock().id.value();
        let inserted = table.upsert(entry);
        if inserted {
            log::debug!("[GRANT] rpc={} inserted into grantable list", id);
            rpc.lock().msgin.as_mut().unwrap().on_grantable = true;
        }
    }
}

/// Unlink `rpc` from the grantable list, if linked, and trigger a fresh
/// `send_grants` round since capacity may have freed up. The caller must
/// hold `rpc`'s lock; the list linkage is read without the grant-table lock
/// first (only the owning RPC links/unlinks itself, so this is race-free),
/// and only re-checked under the lock if it looked linked.
pub fn remove_from_grantable<E: ControlEmitter>(
    table: &GrantTable,
    config: &HomaConfig,
    rpc: &RpcHandle,
    emitter: &E,
) {
    let (id, looked_linked) = {
        let inner = rpc.lock();
        let linked = inner.msgin.as_ref().is_some_and(|m| m.on_grantable);
        (inner.id, linked)
    };
    if !looked_linked {
        return;
    }
    let removed = table.remove(id);
    if removed {
        if let Some(msgin) = rpc.lock().msgin.as_mut() {
            msgin.on_grantable = false;
        }
        send_grants(table, config, emitter);
    }
}

fn effective_window(config: &HomaConfig, num_rpcs: usize) -> u64 {
    if config.window != 0 {
        config.window
    } else {
        config.max_incoming / (num_rpcs as u64 + 1)
    }
}

/// Priority for SRPT rank `r` (0 = most urgent) out of `num_rpcs` granted
/// this round. Uses the top of the schedulable band and floors at 0 when
/// overcommitted past `max_sched_prio` levels.
fn priority_for_rank(config: &HomaConfig, rank: usize) -> u8 {
    let max_sched_prio = i32::from(config.max_sched_prio);
    (max_sched_prio - rank as i32).max(0) as u8
}

struct PlannedGrant {
    rpc: RpcHandle,
    increment: u64,
    new_granted: u64,
    priority: u8,
    fully_granted: bool,
}

/// Compute and emit this round's grants. Safe to call repeatedly; it is a
/// no-op if there is no spare "incoming" budget.
pub fn send_grants<E: ControlEmitter>(table: &GrantTable, config: &HomaConfig, emitter: &E) {
    let total_incoming = table.total_incoming.load(Ordering::Acquire);
    if total_incoming >= config.max_incoming {
        return;
    }
    let mut available = (config.max_incoming - total_incoming) as i64;

    let mut planned: Vec<PlannedGrant> = Vec::new();
    let selected = table.choose_and_drain(config.max_overcommit, config.max_rpcs_per_peer, |_| {
        GrantOutcome::StayGrantable
    });
    let num_rpcs = selected.len();

    // Second pass with the real count in hand (the list walk above doesn't
    // know the final count until it finishes), computing each grant without
    // emitting. `choose_and_drain` already removed fully-granted RPCs from
    // a *prior* round only; this round's own completions are unlinked
    // below once computed.
    let mut fully_granted_ids = Vec::new();
    for (rank, rpc) in selected.into_iter().enumerate() {
        if available <= 0 {
            break;
        }
        let mut inner = rpc.lock();
        let Some(msgin) = inner.msgin.as_mut() else {
            continue;
        };
        let Some(length) = msgin.length else { continue };
        let window = effective_window(config, num_rpcs);
        let new_grant = (msgin.recv_end + window).min(length);
        let increment = new_grant as i64 - msgin.granted as i64;
        if increment <= 0 {
            continue;
        }
        let increment = increment.min(available) as u64;
        if increment == 0 {
            continue;
        }
        available -= increment as i64;
        let new_granted = msgin.granted + increment;
        msgin.granted = new_granted;
        msgin.grants_in_progress += 1;
        let priority = priority_for_rank(config, rank);
        msgin.priority = priority;
        let fully_granted = new_granted >= length;
        if fully_granted {
            msgin.on_grantable = false;
            fully_granted_ids.push(inner.id);
        }
        drop(inner);
        planned.push(PlannedGrant {
            rpc,
            increment,
            new_granted,
            priority,
            fully_granted,
        });
    }

    for id in &fully_granted_ids {
        table.remove(*id);
    }

    let granted_bytes: u64 = planned.iter().map(|p| p.increment).sum();
    table
        .total_incoming
        .fetch_add(granted_bytes, Ordering::AcqRel);

    if !planned.is_empty() {
        log::debug!(
            "[GRANT] round granted {} bytes across {} rpc(s), total_incoming={}",
            granted_bytes,
            planned.len(),
            table.total_incoming.load(Ordering::Acquire)
        );
    }

    let remaining = table
        .grant_nonfifo_left
        .fetch_sub(granted_bytes as i64, Ordering::AcqRel)
        - granted_bytes as i64;
    let mut fifo_grant = None;
    if remaining <= 0 && config.grant_fifo_fraction > 0 {
        table
            .grant_nonfifo_left
            .fetch_add(config.grant_nonfifo(), Ordering::AcqRel);
        fifo_grant = choose_fifo_grant(table, config, &planned);
    }

    for plan in &planned {
        emit_grant(emitter, &plan.rpc, plan.new_granted, plan.priority);
        // `grants_in_progress` only pins the RPC against being freed across
        // this window; `msgin` itself may already be gone (e.g. the RPC
        // went DEAD and was reset), so this must not panic on a miss.
        if let Some(msgin) = plan.rpc.lock().msgin.as_mut() {
            msgin.grants_in_progress -= 1;
        }
    }

    if let Some((rpc, new_granted, priority)) = fifo_grant {
        log::debug!(
            "[GRANT] rpc={} fifo grant advances granted to {}",
            rpc.lock().id.value(),
            new_granted
        );
        emit_grant(emitter, &rpc, new_granted, priority);
    }
}

/// Pick the oldest grantable RPC not already granted in this round whose
/// outstanding "on-the-way" bytes (`granted - recv_end`) are within the
/// unscheduled budget, i.e. it isn't already sitting on a full window of
/// ungranted-but-in-flight data. Advances it by `fifo_grant_increment`,
/// capped at `length`.
fn choose_fifo_grant(
    table: &GrantTable,
    config: &HomaConfig,
    planned_this_round: &[PlannedGrant],
) -> Option<(RpcHandle, u64, u8)> {
    let candidate = table.oldest()?;
    let already_planned = planned_this_round
        .iter()
        .any(|p| p.rpc.lock().id == candidate.lock().id);
    if already_planned {
        return None;
    }

    let snapshot_granted = {
        let inner = candidate.lock();
        inner.msgin.as_ref().map(|m| m.granted)
    }?;

    let mut inner = candidate.lock();
    let msgin = inner.msgin.as_mut()?;
    // Re-check against the snapshot: another core may have already issued a
    // FIFO grant for this RPC between releasing the grant-table lock and
    // getting here.
    if msgin.granted != snapshot_granted {
        return None;
    }
    let length = msgin.length?;
    let on_the_way = msgin.granted.saturating_sub(msgin.recv_end);
    if on_the_way > config.unsched_bytes {
        return None;
    }
    let new_granted = (msgin.granted + config.fifo_grant_increment).min(length);
    if new_granted <= msgin.granted {
        return None;
    }
    msgin.granted = new_granted;
    let priority = config.max_sched_prio;
    msgin.priority = priority;
    if new_granted >= length {
        msgin.on_grantable = false;
        drop(inner);
        table.remove(candidate.lock().id);
    }
    Some((candidate, new_granted, priority))
}

fn emit_grant<E: ControlEmitter>(emitter: &E, rpc: &RpcHandle, offset: u64, priority: u8) {
    let (rpc_id, sport, dport, resend_all) = {
        let mut inner = rpc.lock();
        let resend_all = inner
            .msgin
            .as_mut()
            .map(|m| std::mem::take(&mut m.resend_all))
            .unwrap_or(false);
        (inner.id.value(), inner.sport, inner.dport, resend_all)
    };
    let header = CommonHeader {
        rpc_id,
        sport,
        dport,
        packet_type: PacketType::Grant,
    };
    let _ = GrantHeader {
        offset,
        priority,
        resend_all,
    };
    emitter.xmit_control(PacketType::Grant, header, ControlTarget::Rpc(rpc));
}
