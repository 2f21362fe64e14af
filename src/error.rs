// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types surfaced by the receive-side core.
//!
//! Only [`wait_for_message`](crate::wait::wait_for_message) returns these to
//! callers; every other internal failure is accounted as a discard and
//! swallowed at the dispatcher boundary.

use std::fmt;

/// Errors that can be returned to an application waiting on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HomaError {
    /// `NONBLOCKING` was set and no RPC was immediately ready.
    WouldBlock,
    /// The wait was interrupted by a signal before an RPC became ready.
    Interrupted,
    /// The socket was shut down, or shutdown raced with this call.
    Shutdown,
    /// Allocation or copy-out failed while assembling the message; the
    /// wrapped value is the collaborator-reported errno.
    CopyFailed(i32),
    /// The peer became unreachable or the RPC was otherwise aborted.
    PeerUnreachable,
    /// The targeted RPC id does not exist (or is no longer owned by this
    /// socket).
    NoSuchRpc,
}

impl fmt::Display for HomaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HomaError::WouldBlock => write!(f, "operation would block"),
            HomaError::Interrupted => write!(f, "interrupted by signal"),
            HomaError::Shutdown => write!(f, "socket shut down"),
            HomaError::CopyFailed(errno) => write!(f, "copy to user failed (errno {errno})"),
            HomaError::PeerUnreachable => write!(f, "peer unreachable"),
            HomaError::NoSuchRpc => write!(f, "no such rpc"),
        }
    }
}

impl std::error::Error for HomaError {}
