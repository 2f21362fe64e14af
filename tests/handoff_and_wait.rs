// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end handoff scenario: of two threads waiting on the same interest
//! list, the one that has been idle longer is preferred as the handoff
//! target over the one that registered more recently.

use homa_rx::handoff::{rpc_handoff, HomaSocket};
use homa_rx::rpc::{Interest, PeerId, RpcId, RpcInner, RpcState};

use parking_lot::Mutex;
use std::sync::Arc;

fn rpc(id: u64) -> homa_rx::rpc::RpcHandle {
    Arc::new(Mutex::new(RpcInner::new(
        RpcId::new(id),
        PeerId(1),
        80,
        81,
        RpcState::Incoming,
    )))
}

#[test]
fn handoff_prefers_the_idle_thread_over_the_more_recently_registered_one() {
    let socket = HomaSocket::new();

    // Thread A registers first and never touches its interest again: it
    // will look idle once enough ticks pass.
    let idle = Arc::new(Interest::new(None, true, false, 0));
    socket.register_or_claim(idle.clone(), true, false);

    // Some ticks pass (unrelated activity on the socket).
    for _ in 0..9 {
        socket.tick();
    }

    // Thread B registers after A, ending up at the front of the list (stack
    // discipline), and immediately marks itself active at the current tick.
    let busy = Arc::new(Interest::new(None, true, false, 0));
    socket.register_or_claim(busy.clone(), true, false);
    busy.touch(socket.tick());

    // Advance far enough that `idle` (never touched, last_active == 0)
    // crosses the idleness threshold while `busy` (touched a few ticks ago)
    // does not.
    for _ in 0..60 {
        socket.tick();
    }

    let incoming = rpc(99);
    rpc_handoff(&socket, &incoming, true);

    assert!(
        idle.take_ready().is_some(),
        "the long-idle interest should receive the handoff"
    );
    assert!(
        busy.take_ready().is_none(),
        "the recently active interest should not be disturbed"
    );
}

#[test]
fn handoff_falls_back_to_the_front_of_the_list_when_every_interest_looks_busy() {
    let socket = HomaSocket::new();

    let first = Arc::new(Interest::new(None, false, true, 0));
    socket.register_or_claim(first.clone(), false, true);
    first.touch(socket.tick());

    let second = Arc::new(Interest::new(None, false, true, 0));
    socket.register_or_claim(second.clone(), false, true);
    second.touch(socket.tick());

    let incoming = rpc(100);
    rpc_handoff(&socket, &incoming, false);

    // Neither interest is idle; the front of the (stack-ordered) list is
    // `second`, preserving thread/cache affinity.
    assert!(second.take_ready().is_some());
    assert!(first.take_ready().is_none());
}
