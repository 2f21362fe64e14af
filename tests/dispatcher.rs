// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end dispatch scenarios: a burst of DATA packets for one RPC
//! (exercising the lock cache, handoff, and grant re-ranking together) and a
//! burst interleaved across two RPCs (exercising cache invalidation).

use homa_rx::collab::{MemoryBufferPool, MemoryPeerTable, MemoryRpcTable, RecordingEmitter};
use homa_rx::config::HomaConfig;
use homa_rx::dispatcher::{Dispatcher, InboundPacket, PacketBody};
use homa_rx::grant::send_grants;
use homa_rx::handoff::HomaSocket;
use homa_rx::rpc::{Interest, PeerId, RpcId};
use homa_rx::wire::{CommonHeader, DataHeader, PacketType};

use std::sync::Arc;

type TestDispatcher = Dispatcher<MemoryRpcTable, MemoryPeerTable, RecordingEmitter, MemoryBufferPool>;

fn make_dispatcher() -> TestDispatcher {
    Dispatcher::new(
        MemoryRpcTable::new(),
        MemoryPeerTable::new(),
        HomaConfig::default(),
        RecordingEmitter::new(),
        MemoryBufferPool::new(),
    )
}

fn data_packet(rpc_id: u64, offset: u64, segment_length: u32, message_length: u64) -> InboundPacket {
    InboundPacket {
        common: CommonHeader {
            rpc_id,
            sport: 4000,
            dport: 80,
            packet_type: PacketType::Data,
        },
        peer: PeerId(1),
        body: PacketBody::Data(DataHeader {
            message_length,
            incoming: 600,
            cutoff_version: 0,
            retransmit: false,
            offset,
            segment_length,
            ack: None,
            payload: vec![7u8; segment_length as usize],
        }),
    }
}

#[test]
fn a_burst_of_data_packets_for_one_rpc_completes_the_message_and_drains_the_grant_table() {
    let dispatcher = make_dispatcher();
    let socket = HomaSocket::new();
    let id = RpcId::new(41); // server-originated (odd)

    // A waiting thread is already registered for this RPC's request before
    // any bytes arrive, so every accepted packet hands it a fresh reference.
    let interest = Arc::new(Interest::new(Some(id), true, false, 0));
    socket.register_targeted(id, interest.clone());

    assert!(dispatcher.dispatch(data_packet(41, 0, 600, 2000), &socket));
    let handed_off = interest.take_ready().expect("first packet triggers a handoff");
    assert_eq!(handed_off.lock().id, id);
    // Re-register for the next handoff; `rpc_handoff` clears `handing_off`
    // after publishing, so a second registration is picked up normally.
    socket.register_targeted(id, interest.clone());

    assert!(dispatcher.dispatch(data_packet(41, 600, 600, 2000), &socket));
    interest.take_ready();
    socket.register_targeted(id, interest.clone());

    assert!(dispatcher.dispatch(data_packet(41, 1200, 800, 2000), &socket));

    let rpc = dispatcher
        .rpc_table
        .find_server(PeerId(1), 80, id)
        .expect("rpc stays in the table until explicitly freed");
    {
        let inner = rpc.lock();
        let msg = inner.msgin.as_ref().expect("initialized by the first packet");
        assert!(msg.is_complete());
        assert_eq!(msg.bytes_remaining, 0);
    }

    // The dispatcher only re-ranks the grantable list on each arrival; a
    // grant round still has to run to advance `granted` to the full length.
    send_grants(&dispatcher.grant_table, &dispatcher.config, &dispatcher.emitter);
    assert!(
        dispatcher.grant_table.is_empty(),
        "a fully granted message must not remain on the grantable list"
    );
}

#[test]
fn interleaved_packets_across_two_rpcs_resolve_to_the_correct_rpc_each_time() {
    let dispatcher = make_dispatcher();
    let socket = HomaSocket::new();

    assert!(dispatcher.dispatch(data_packet(41, 0, 500, 500), &socket));
    assert!(dispatcher.dispatch(data_packet(43, 0, 500, 500), &socket));

    let rpc_41 = dispatcher
        .rpc_table
        .find_server(PeerId(1), 80, RpcId::new(41))
        .unwrap();
    let rpc_43 = dispatcher
        .rpc_table
        .find_server(PeerId(1), 80, RpcId::new(43))
        .unwrap();
    assert!(rpc_41.lock().msgin.as_ref().unwrap().is_complete());
    assert!(rpc_43.lock().msgin.as_ref().unwrap().is_complete());
    assert_ne!(rpc_41.lock().id, rpc_43.lock().id);
}
