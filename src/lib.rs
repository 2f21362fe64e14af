// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Receive-side core of a message-granting RPC transport
//!
//! Implements the receiver half of a datagram-based, low-latency RPC
//! transport built around SRPT (shortest-remaining-processing-time) grant
//! scheduling: senders transmit only as much of a message as the receiver
//! has explicitly authorized, and the receiver grants scheduled bytes to
//! whichever in-flight message has the fewest bytes left, so short messages
//! finish ahead of long ones without per-flow reservations.
//!
//! ## Components, in dependency order
//!
//! - [`reassembler`] — per-RPC gap tracking and two-phase copy-out.
//! - [`grant`] — the SRPT-ordered grantable list and grant issuance.
//! - [`dispatcher`] — the single entry point for an arriving datagram,
//!   routing by packet type.
//! - [`handoff`] — socket-level interest lists and ingress-to-receiver
//!   handoff.
//! - [`wait`] — the blocking outer loop an application thread runs to
//!   receive a completed RPC.
//!
//! Socket lifecycle, the buffer-page allocator, the RPC/peer tables, and
//! the transmit path are external collaborators, reached only through the
//! trait contracts in [`collab`]; this crate owns scheduling and assembly
//! decisions, not kernel plumbing or wire transmission.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                    Application (wait_for_message)                   |
//! +---------------------------------------------------------------------+
//! |  wait.rs          busy-poll -> sleep -> copy_to_user -> completion   |
//! |  handoff.rs        interest lists, ready queues, rpc_handoff         |
//! |  dispatcher.rs     dispatch(): DATA/GRANT/RESEND/... dispatch table  |
//! |  grant/            check_grantable, remove_from_grantable,           |
//! |                     send_grants (SRPT order + FIFO anti-starvation)  |
//! |  reassembler.rs    gap tracking, two-phase copy_to_user              |
//! +---------------------------------------------------------------------+
//! |  collab.rs          BufferPool | RpcTable | PeerTable | ControlEmitter|
//! +---------------------------------------------------------------------+
//! |         external: socket lifecycle, bpage allocator, transmit path   |
//! +---------------------------------------------------------------------+
//! ```

pub mod collab;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod grant;
pub mod handoff;
pub mod logging;
pub mod range;
pub mod reassembler;
pub mod rpc;
pub mod sync_wake;
pub mod wait;
pub mod wire;

pub use config::HomaConfig;
pub use dispatcher::{Dispatcher, DispatchMetrics, InboundPacket, PacketBody};
pub use error::HomaError;
pub use handoff::HomaSocket;
pub use rpc::{MsgIn, PeerId, RpcHandle, RpcId, RpcState};
pub use wait::{wait_for_message, WaitFlags};

/// Convenience alias for fallible operations in this crate.
pub type Result<T> = std::result::Result<T, HomaError>;
