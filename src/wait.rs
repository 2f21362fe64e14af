// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `wait_for_message`: the blocking outer loop an application thread runs
//! to receive a completed RPC.
//!
//! Busy-poll-then-sleep is built on the same [`WakeNotifier::wait_timeout`]
//! used by the handoff layer, reusing one wake primitive across both
//! producer and consumer sides of the queue.

use std::sync::Arc;
use std::time::Instant;

use crate::collab::{BufferPool, RpcTable};
use crate::config::HomaConfig;
use crate::error::HomaError;
use crate::handoff::HomaSocket;
use crate::reassembler;
use crate::rpc::{Interest, RpcHandle, RpcId, RpcState};

/// Which categories of RPC an application thread will accept, and whether
/// it is willing to block waiting for one.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitFlags {
    pub request: bool,
    pub response: bool,
    pub nonblocking: bool,
}

impl WaitFlags {
    pub fn request() -> Self {
        Self {
            request: true,
            ..Default::default()
        }
    }

    pub fn response() -> Self {
        Self {
            response: true,
            ..Default::default()
        }
    }
}

/// Register this thread's interest, claiming an already-ready RPC
/// immediately if one is available. Returns `Ok(Some(rpc))` if claimed,
/// `Ok(None)` if registered and still waiting, `Err` on an immediate
/// rejection (unknown targeted id, or shutdown).
fn register_interests(
    socket: &HomaSocket,
    rpc_table: &impl RpcTable,
    interest: &Arc<Interest>,
    target: Option<RpcId>,
    flags: WaitFlags,
) -> Result<Option<RpcHandle>, HomaError> {
    if let Some(id) = target {
        let rpc = if id.is_client_originated() {
            rpc_table.find_client(id)
        } else {
            None
        };
        let Some(rpc) = rpc else {
            return Err(HomaError::NoSuchRpc);
        };
        let ready = {
            let inner = rpc.lock();
            matches!(inner.state, RpcState::Ready) || inner.error.is_some()
        };
        if ready {
            return Ok(Some(rpc));
        }
        socket.register_targeted(id, interest.clone());
        return Ok(None);
    }

    if socket.is_shutdown() {
        return Err(HomaError::Shutdown);
    }
    match socket.register_or_claim(interest.clone(), flags.request, flags.response) {
        Some(rpc) => Ok(Some(rpc)),
        None => Ok(None),
    }
}

/// Lock `rpc`, run `copy_to_user`, and decide whether the message is
/// complete. Returns the locked-and-complete RPC, or `Err` if `copy_to_user`
/// hit a permanent failure.
fn finish<B: BufferPool>(rpc: RpcHandle, pool: &B) -> Result<RpcHandle, HomaError> {
    if let Err(err) = reassembler::copy_to_user(&rpc, pool) {
        let mut inner = rpc.lock();
        inner.error = Some(err.clone());
        drop(inner);
        return Err(err);
    }
    Ok(rpc)
}

fn is_delivery_complete(rpc: &RpcHandle) -> bool {
    let inner = rpc.lock();
    if matches!(inner.state, RpcState::Dead) {
        return false;
    }
    if inner.error.is_some() {
        return true;
    }
    inner
        .msgin
        .as_ref()
        .is_some_and(|m| m.bytes_remaining == 0 && m.segments.is_empty())
}

/// Block until an RPC matching `flags`/`target` is ready, complete its
/// copy-out, and return it. See `spec.md` §4.5 for the full step-by-step
/// contract this follows.
pub fn wait_for_message<R: RpcTable, B: BufferPool>(
    socket: &HomaSocket,
    rpc_table: &R,
    buffer_pool: &B,
    config: &HomaConfig,
    flags: WaitFlags,
    target: Option<RpcId>,
    core: u32,
) -> Result<RpcHandle, HomaError> {
    loop {
        let interest = Arc::new(Interest::new(target, flags.request, flags.response, core));

        let claimed = register_interests(socket, rpc_table, &interest, target, flags)?;

        let rpc = match claimed {
            Some(rpc) => rpc,
            None => {
                if flags.nonblocking {
                    socket.unlink_interest(target, &interest);
                    return Err(HomaError::WouldBlock);
                }

                rpc_table.reap(config.reap_limit);

                let busy_deadline = Instant::now() + config.poll_duration();
                let mut woke = false;
                while Instant::now() < busy_deadline {
                    if interest.wake.check_and_clear() {
                        woke = true;
                        break;
                    }
                    std::thread::yield_now();
                }
                if !woke {
                    woke = interest.wake.wait_timeout(config.busy_duration());
                }

                socket.unlink_interest(target, &interest);
                socket.tick();

                match interest.take_ready() {
                    Some(rpc) => rpc,
                    None if socket.is_shutdown() => return Err(HomaError::Shutdown),
                    None if woke => continue,
                    None => continue,
                }
            }
        };

        if matches!(rpc.lock().state, RpcState::Dead) {
            continue;
        }

        let rpc = finish(rpc, buffer_pool)?;
        if is_delivery_complete(&rpc) {
            return Ok(rpc);
        }
        // Not yet complete (more segments queued behind this wake): loop
        // and re-register, since `finish` already drained what had arrived.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{MemoryBufferPool, MemoryRpcTable};
    use crate::handoff;
    use crate::rpc::{MsgIn, PeerId, RpcInner};
    use std::sync::Arc as StdArc;

    fn complete_rpc(id: u64) -> RpcHandle {
        let rpc: RpcHandle = StdArc::new(parking_lot::Mutex::new(RpcInner::new(
            RpcId::new(id),
            PeerId(1),
            80,
            81,
            RpcState::Ready,
        )));
        let mut msg = MsgIn::new(false);
        msg.length = Some(4);
        msg.bytes_remaining = 0;
        rpc.lock().msgin = Some(msg);
        rpc
    }

    #[test]
    fn nonblocking_with_nothing_ready_returns_would_block() {
        let socket = HomaSocket::new();
        let rpc_table = MemoryRpcTable::new();
        let pool = MemoryBufferPool::new();
        let config = HomaConfig::default();
        let result = wait_for_message(
            &socket,
            &rpc_table,
            &pool,
            &config,
            WaitFlags {
                request: true,
                response: false,
                nonblocking: true,
            },
            None,
            0,
        );
        assert_eq!(result.unwrap_err(), HomaError::WouldBlock);
    }

    #[test]
    fn targeted_wait_for_unknown_client_id_fails_immediately() {
        let socket = HomaSocket::new();
        let rpc_table = MemoryRpcTable::new();
        let pool = MemoryBufferPool::new();
        let config = HomaConfig::default();
        let result = wait_for_message(
            &socket,
            &rpc_table,
            &pool,
            &config,
            WaitFlags {
                request: false,
                response: true,
                nonblocking: true,
            },
            Some(RpcId::new(40)),
            0,
        );
        assert_eq!(result.unwrap_err(), HomaError::NoSuchRpc);
    }

    #[test]
    fn claims_already_ready_request_and_completes_copy() {
        let socket = HomaSocket::new();
        let rpc_table = MemoryRpcTable::new();
        let pool = MemoryBufferPool::new();
        let config = HomaConfig::default();
        let rpc = complete_rpc(41);
        handoff::rpc_handoff(&socket, &rpc, true);

        let result = wait_for_message(
            &socket,
            &rpc_table,
            &pool,
            &config,
            WaitFlags::request(),
            None,
            0,
        )
        .expect("should deliver the ready rpc");
        assert_eq!(result.lock().id, RpcId::new(41));
    }
}
