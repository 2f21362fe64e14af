// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `dispatch()`: the single entry point for an arriving datagram, routing
//! by packet type and enforcing the lock-order and ACK-piggyback ordering
//! invariants from `spec.md` §4.2.
//!
//! The dispatcher never returns an error to its caller (ingress context
//! cannot propagate failures meaningfully); every internal failure is
//! accounted in [`DispatchMetrics`] and the packet is dropped, per the
//! Propagation Policy in `spec.md` §7.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::collab::{BufferPool, ControlEmitter, ControlTarget, PeerTable, RpcTable};
use crate::config::HomaConfig;
use crate::grant::{self, GrantTable};
use crate::handoff::{self, HomaSocket};
use crate::reassembler;
use crate::rpc::{MsgIn, MsgOut, PeerId, RpcHandle, RpcId, RpcState};
use crate::wire::{
    AckHeader, CommonHeader, CutoffsHeader, DataHeader, GrantHeader, PacketType, ResendHeader,
};

/// Minimum spacing between two CUTOFFS replies sent to the same peer.
const CUTOFFS_NOTICE_INTERVAL: Duration = Duration::from_millis(5);

/// Accounted discards and protocol-level events, mirroring the atomic
/// counter pattern in `reliability::ReliableMetrics`, minus its
/// telemetry-frame export (out of scope per this spec's own Non-goals on
/// metrics export).
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    pub packets_overrun: AtomicU64,
    pub packets_no_buffers: AtomicU64,
    pub unknown_client_grant_busy_data: AtomicU64,
    pub unknown_type: AtomicU64,
    pub protocol_violations: AtomicU64,
    pub resend_replies: AtomicU64,
    pub busy_replies: AtomicU64,
    pub unknown_replies: AtomicU64,
    pub cutoffs_replies: AtomicU64,
    pub acks_processed: AtomicU64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A decoded inbound datagram, independent of its wire encoding.
pub struct InboundPacket {
    pub common: CommonHeader,
    pub peer: PeerId,
    pub body: PacketBody,
}

pub enum PacketBody {
    Data(DataHeader),
    Grant(GrantHeader),
    Resend(ResendHeader),
    Unknown,
    Busy,
    Cutoffs(CutoffsHeader),
    NeedAck,
    Ack(AckHeader),
}

/// Retains the last RPC this dispatcher touched so a burst of packets for
/// one RPC skips a repeated table lookup. Per the Design Note in `spec.md`
/// §9 this is a contract ("the dispatcher may retain the previously-looked-
/// up RPC between calls; any transition to a different RPC looks up
/// again"), not a retained lock: `parking_lot::MutexGuard`s aren't held
/// across calls here, only the `Arc` handle is cached.
#[derive(Default)]
pub struct LockCache {
    last: Mutex<Option<(RpcId, RpcHandle)>>,
}

impl LockCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, id: RpcId) -> Option<RpcHandle> {
        let cache = self.last.lock();
        cache
            .as_ref()
            .and_then(|(cached_id, rpc)| (*cached_id == id).then(|| rpc.clone()))
    }

    fn remember(&self, id: RpcId, rpc: RpcHandle) {
        *self.last.lock() = Some((id, rpc));
    }
}

/// Bundles every collaborator `dispatch` needs. Constructed once per
/// protocol instance and threaded through every call, per the Design Note
/// in `spec.md` §9 ("wrap global mutable state as a handle").
pub struct Dispatcher<R, P, C, B> {
    pub rpc_table: R,
    pub peer_table: P,
    pub grant_table: GrantTable,
    pub config: HomaConfig,
    pub emitter: C,
    pub buffer_pool: B,
    pub metrics: DispatchMetrics,
    pub lock_cache: LockCache,
}

impl<R, P, C, B> Dispatcher<R, P, C, B>
where
    R: RpcTable,
    P: PeerTable,
    C: ControlEmitter,
    B: BufferPool,
{
    pub fn new(rpc_table: R, peer_table: P, config: HomaConfig, emitter: C, buffer_pool: B) -> Self {
        let grant_table = GrantTable::new(config.grant_nonfifo());
        Self {
            rpc_table,
            peer_table,
            grant_table,
            config,
            emitter,
            buffer_pool,
            metrics: DispatchMetrics::new(),
            lock_cache: LockCache::new(),
        }
    }

    fn resolve(&self, pkt: &InboundPacket, create_if_server: bool) -> Option<RpcHandle> {
        let id = pkt.common.rpc_id();
        if let Some(cached) = self.lock_cache.get(id) {
            return Some(cached);
        }
        let found = if id.is_client_originated() {
            self.rpc_table.find_client(id)
        } else {
            self.rpc_table.find_server(pkt.peer, pkt.common.dport, id)
        };
        let rpc = match found {
            Some(rpc) => Some(rpc),
            None if create_if_server && !id.is_client_originated() => {
                let (rpc, _created) =
                    self.rpc_table
                        .new_server(pkt.peer, pkt.common.dport, pkt.common.sport, id);
                Some(rpc)
            }
            None => None,
        };
        if let Some(rpc) = &rpc {
            self.lock_cache.remember(id, rpc.clone());
        }
        rpc
    }

    /// Route one inbound datagram. Returns `true` if new message bytes were
    /// accepted and a handoff was attempted (useful for tests).
    pub fn dispatch(&self, pkt: InboundPacket, socket: &HomaSocket) -> bool {
        // ACK piggyback on DATA: process first, against a *different* RPC,
        // so no RPC lock from the DATA path is held while taking another.
        if let PacketBody::Data(data) = &pkt.body {
            if let Some(ack) = data.ack {
                self.free_acked(RpcId::new(ack.acked_rpc));
            }
        }

        match &pkt.body {
            PacketBody::Data(_) => self.handle_data(pkt),
            PacketBody::Grant(hdr) => {
                self.handle_grant(&pkt, *hdr);
                false
            }
            PacketBody::Resend(hdr) => {
                self.handle_resend(&pkt, *hdr);
                false
            }
            PacketBody::Unknown => {
                self.handle_unknown(&pkt);
                false
            }
            PacketBody::Busy => {
                self.handle_busy(&pkt);
                false
            }
            PacketBody::Cutoffs(hdr) => {
                self.handle_cutoffs(&pkt, *hdr);
                false
            }
            PacketBody::NeedAck => {
                self.handle_need_ack(&pkt);
                false
            }
            PacketBody::Ack(hdr) => {
                self.handle_ack(hdr);
                false
            }
        }
    }

    fn handle_data(&self, pkt: InboundPacket) -> bool {
        let hdr = match &pkt.body {
            PacketBody::Data(hdr) => hdr.clone(),
            _ => unreachable!(),
        };
        let Some(rpc) = self.resolve(&pkt, true) else {
            log::debug!(
                "[DISPATCH] DATA for unknown client rpc={}, discarding",
                pkt.common.rpc_id().value()
            );
            self.metrics
                .unknown_client_grant_busy_data
                .fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let is_request = {
            let mut inner = rpc.lock();
            if inner.msgin.is_none() {
                let mut msg = MsgIn::new(false);
                reassembler::init(&mut msg, inner.id, hdr.message_length, hdr.incoming, &self.buffer_pool);
                inner.msgin = Some(msg);
                if matches!(inner.state, RpcState::Outgoing) {
                    inner.state = RpcState::Incoming;
                }
            }
            inner.id.is_client_originated()
        };

        let (outcome, scheduled, length_known) = {
            let mut inner = rpc.lock();
            let msgin = inner.msgin.as_mut().expect("initialized above");
            if msgin.num_bpages == 0 {
                log::debug!(
                    "[DISPATCH] rpc={} has no buffer pages, dropping DATA offset={} length={}",
                    inner.id.value(),
                    hdr.offset,
                    hdr.segment_length
                );
                self.metrics
                    .packets_no_buffers
                    .fetch_add(1, Ordering::Relaxed);
                return false;
            }
            let outcome = reassembler::add_packet(msgin, hdr.offset, hdr.segment_length, hdr.payload.clone());
            if outcome == reassembler::AddOutcome::Discarded {
                self.metrics.packets_overrun.fetch_add(1, Ordering::Relaxed);
            }
            (outcome, msgin.scheduled, msgin.length.is_some())
        };

        if outcome == reassembler::AddOutcome::Accepted {
            handoff::rpc_handoff(socket, &rpc, is_request);
            if scheduled && length_known {
                grant::check_grantable(&self.grant_table, &rpc);
            }
        }

        let peer_state = self.peer_table.find(pkt.peer);
        if u64::from(hdr.cutoff_version) < peer_state.cutoff_version.load(Ordering::Acquire)
            && peer_state.cutoffs_notice_due(CUTOFFS_NOTICE_INTERVAL)
        {
            self.emit_cutoffs(&rpc, &peer_state);
        }

        if self.rpc_table.dead_count() > 2 * self.config.dead_buffs_limit as usize {
            self.rpc_table.reap(self.config.reap_limit);
        }

        outcome == reassembler::AddOutcome::Accepted
    }

    fn handle_grant(&self, pkt: &InboundPacket, hdr: GrantHeader) {
        let Some(rpc) = self.resolve(pkt, false) else {
            self.metrics
                .unknown_client_grant_busy_data
                .fetch_add(1, Ordering::Relaxed);
            return;
        };
        let mut inner = rpc.lock();
        if !matches!(inner.state, RpcState::Outgoing) {
            return;
        }
        if let Some(msgout) = inner.msgout.as_mut() {
            if hdr.offset > msgout.granted {
                msgout.granted = hdr.offset.min(msgout.length);
            }
        }
        if hdr.resend_all {
            if let Some(msgout) = inner.msgout.as_mut() {
                msgout.sent = 0;
            }
        }
    }

    fn handle_resend(&self, pkt: &InboundPacket, hdr: ResendHeader) {
        let Some(rpc) = self.resolve(pkt, false) else {
            self.reply_unknown(pkt);
            return;
        };
        let (is_server, outgoing, behind_grant, header) = {
            let inner = rpc.lock();
            let is_server = !inner.id.is_client_originated();
            let outgoing = matches!(inner.state, RpcState::Outgoing);
            let behind_grant = inner
                .msgout
                .as_ref()
                .is_some_and(|m| m.sent < m.granted.min(hdr.offset + u64::from(hdr.length)));
            let header = self.common_header(&inner, PacketType::Busy);
            (is_server, outgoing, behind_grant, header)
        };
        if (is_server && !outgoing) || behind_grant || hdr.length == 0 {
            log::debug!(
                "[DISPATCH] rpc={} replying BUSY to RESEND (is_server={} outgoing={} behind_grant={} length={})",
                pkt.common.rpc_id().value(),
                is_server,
                outgoing,
                behind_grant,
                hdr.length
            );
            self.emitter
                .xmit_control(PacketType::Busy, header, ControlTarget::Rpc(&rpc));
            self.metrics.busy_replies.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // Emitting the actual retransmission is the transmit path's job
        // (out of scope); the dispatcher's contribution is this decision.
        self.metrics.resend_replies.fetch_add(1, Ordering::Relaxed);
    }

    fn handle_unknown(&self, pkt: &InboundPacket) {
        let Some(rpc) = self.resolve(pkt, false) else {
            return;
        };
        let mut inner = rpc.lock();
        let is_client = inner.id.is_client_originated();
        match (is_client, inner.state) {
            (true, RpcState::Outgoing) => {
                if let Some(msgout) = inner.msgout.as_mut() {
                    msgout.sent = 0;
                }
            }
            (true, _) => {
                self.metrics.unknown_type.fetch_add(1, Ordering::Relaxed);
            }
            (false, _) => {
                log::warn!(
                    "[DISPATCH] rpc={} received UNKNOWN as server, freeing",
                    pkt.common.rpc_id().value()
                );
                drop(inner);
                self.rpc_table.free(pkt.common.rpc_id());
            }
        }
    }

    fn handle_busy(&self, pkt: &InboundPacket) {
        if let Some(rpc) = self.resolve(pkt, false) {
            rpc.lock().silent_ticks = 0;
        }
    }

    fn handle_cutoffs(&self, pkt: &InboundPacket, hdr: CutoffsHeader) {
        let peer = self.peer_table.find(pkt.peer);
        *peer.unsched_cutoffs.lock() = hdr.unsched_cutoffs;
        peer.cutoff_version
            .store(u64::from(hdr.cutoff_version), Ordering::Release);
    }

    fn handle_need_ack(&self, pkt: &InboundPacket) {
        match self.resolve(pkt, false) {
            Some(rpc) => {
                let complete = rpc
                    .lock()
                    .msgin
                    .as_ref()
                    .is_some_and(|m| m.is_complete());
                if complete {
                    self.reply_ack(pkt, &rpc);
                }
            }
            None => self.reply_ack_unknown(pkt),
        }
    }

    fn handle_ack(&self, hdr: &AckHeader) {
        log::debug!("[DISPATCH] ACK batch processing {} rpc(s)", hdr.acked.len());
        for id in &hdr.acked {
            self.rpc_table.free(RpcId::new(*id));
            self.metrics.acks_processed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn free_acked(&self, id: RpcId) {
        self.rpc_table.free(id);
    }

    fn common_header(&self, inner: &crate::rpc::RpcInner, kind: PacketType) -> CommonHeader {
        CommonHeader {
            rpc_id: inner.id.value(),
            sport: inner.sport,
            dport: inner.dport,
            packet_type: kind,
        }
    }

    fn emit_cutoffs(&self, rpc: &RpcHandle, peer: &crate::rpc::PeerHandle) {
        log::debug!(
            "[DISPATCH] rpc={} sender cutoff_version stale, replying CUTOFFS",
            rpc.lock().id.value()
        );
        let header = self.common_header(&rpc.lock(), PacketType::Cutoffs);
        let _ = CutoffsHeader {
            unsched_cutoffs: *peer.unsched_cutoffs.lock(),
            cutoff_version: peer.cutoff_version.load(Ordering::Acquire) as u16,
        };
        self.emitter
            .xmit_control(PacketType::Cutoffs, header, ControlTarget::Rpc(rpc));
        self.metrics.cutoffs_replies.fetch_add(1, Ordering::Relaxed);
    }

    fn reply_unknown(&self, pkt: &InboundPacket) {
        let header = CommonHeader {
            rpc_id: pkt.common.rpc_id,
            sport: pkt.common.dport,
            dport: pkt.common.sport,
            packet_type: PacketType::Unknown,
        };
        self.emitter.xmit_control(
            PacketType::Unknown,
            header,
            ControlTarget::Peer {
                peer: pkt.peer,
                sport: pkt.common.dport,
                dport: pkt.common.sport,
            },
        );
        self.metrics.unknown_replies.fetch_add(1, Ordering::Relaxed);
    }

    fn reply_ack(&self, pkt: &InboundPacket, rpc: &RpcHandle) {
        let header = self.common_header(&rpc.lock(), PacketType::Ack);
        self.emitter
            .xmit_control(PacketType::Ack, header, ControlTarget::Rpc(rpc));
        let _ = pkt;
    }

    fn reply_ack_unknown(&self, pkt: &InboundPacket) {
        let header = CommonHeader {
            rpc_id: pkt.common.rpc_id,
            sport: pkt.common.dport,
            dport: pkt.common.sport,
            packet_type: PacketType::Ack,
        };
        self.emitter.xmit_control(
            PacketType::Ack,
            header,
            ControlTarget::Peer {
                peer: pkt.peer,
                sport: pkt.common.dport,
                dport: pkt.common.sport,
            },
        );
    }
}

/// Construct an outgoing RPC's `msgout`, mirroring `reassembler::init` for
/// the send side (scaled-down: the transmit path owns real pacing, this
/// just gives GRANT/RESEND/UNKNOWN handlers state to read).
pub fn init_outgoing(rpc: &RpcHandle, length: u64, unscheduled: u64) {
    rpc.lock().msgout = Some(MsgOut::new(length, unscheduled));
}
