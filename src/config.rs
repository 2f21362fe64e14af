// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Receive-side tunables.
//!
//! Level 1 (this struct) holds every knob enumerated for the core; unlike
//! the rest of the ambient stack there is no open namespace here, so a
//! plain struct with a `recompute_derived()` step is enough — no `DashMap`,
//! no `ArcSwap`.

use std::time::Duration;

/// Compile-time upper bound on `max_overcommit` (mirrors the kernel source's
/// fixed-size per-round grant batch).
pub const MAX_OVERCOMMIT_CEILING: u32 = 10;

/// Receive-side configuration for one protocol instance.
#[derive(Clone, Debug)]
pub struct HomaConfig {
    /// Global cap on bytes simultaneously "incoming" across all RPCs.
    pub max_incoming: u64,
    /// Per-RPC grant window; 0 selects the dynamic rule in `send_grants`.
    pub window: u64,
    /// Maximum RPCs granted in a single `send_grants` round.
    pub max_overcommit: u32,
    /// Maximum RPCs from one peer selected in a single round.
    pub max_rpcs_per_peer: u32,
    /// Number of priority levels implemented on the wire.
    pub num_priorities: u8,
    /// Highest schedulable priority value (levels are `0..=max_sched_prio`).
    pub max_sched_prio: u8,
    /// Bytes a sender may transmit before any grant (default unscheduled
    /// prefix, absent a peer-specific cutoff).
    pub unsched_bytes: u64,
    /// Fraction (per-mille, 0..500) of granted bytes reserved for FIFO
    /// anti-starvation grants.
    pub grant_fifo_fraction: u32,
    /// Bytes advanced by a single FIFO grant.
    pub fifo_grant_increment: u64,
    /// Busy-poll interval before the wait loop yields.
    pub poll_usecs: u64,
    /// Total busy-poll budget before the wait loop sleeps.
    pub busy_usecs: u64,
    /// Dead-RPC backlog threshold that triggers opportunistic reaping.
    pub dead_buffs_limit: u32,
    /// Maximum dead RPCs reaped in one opportunistic pass.
    pub reap_limit: u32,

    /// Derived: non-FIFO budget drained per round before a FIFO grant is
    /// forced; recomputed by [`HomaConfig::recompute_derived`].
    grant_nonfifo: i64,
}

impl HomaConfig {
    /// Construct a config with the kernel source's defaults and compute
    /// derived fields.
    pub fn new(
        max_incoming: u64,
        window: u64,
        max_overcommit: u32,
        max_rpcs_per_peer: u32,
        num_priorities: u8,
        max_sched_prio: u8,
        unsched_bytes: u64,
        grant_fifo_fraction: u32,
        fifo_grant_increment: u64,
        poll_usecs: u64,
        busy_usecs: u64,
        dead_buffs_limit: u32,
        reap_limit: u32,
    ) -> Self {
        let mut cfg = Self {
            max_incoming,
            window,
            max_overcommit: max_overcommit.min(MAX_OVERCOMMIT_CEILING),
            max_rpcs_per_peer,
            num_priorities,
            max_sched_prio,
            unsched_bytes,
            grant_fifo_fraction: grant_fifo_fraction.min(500),
            fifo_grant_increment,
            poll_usecs,
            busy_usecs,
            dead_buffs_limit,
            reap_limit,
            grant_nonfifo: 0,
        };
        cfg.recompute_derived();
        cfg
    }

    /// Recompute fields derived from the primary knobs. Call after mutating
    /// any public field directly.
    pub fn recompute_derived(&mut self) {
        self.grant_nonfifo = if self.grant_fifo_fraction == 0 {
            i64::MAX
        } else {
            let increment = self.fifo_grant_increment as i64;
            (1000 * increment) / self.grant_fifo_fraction as i64 - increment
        };
    }

    /// Non-FIFO byte budget drained per `send_grants` round before a FIFO
    /// grant is forced.
    pub fn grant_nonfifo(&self) -> i64 {
        self.grant_nonfifo
    }

    /// Busy-poll interval as a [`Duration`].
    pub fn poll_duration(&self) -> Duration {
        Duration::from_micros(self.poll_usecs)
    }

    /// Total busy-poll budget as a [`Duration`].
    pub fn busy_duration(&self) -> Duration {
        Duration::from_micros(self.busy_usecs)
    }
}

impl Default for HomaConfig {
    fn default() -> Self {
        Self::new(
            1_000_000, // max_incoming
            0,         // window: dynamic
            8,         // max_overcommit
            4,         // max_rpcs_per_peer
            8,         // num_priorities
            7,         // max_sched_prio
            10_000,    // unsched_bytes
            100,       // grant_fifo_fraction (10%)
            10_000,    // fifo_grant_increment
            50,        // poll_usecs
            1_000,     // busy_usecs
            5,         // dead_buffs_limit
            10,        // reap_limit
        )
    }
}
