// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IGMP/MLD snooping queriers.
//!
//! Two workers of identical shape, one per family, each owning an event
//! manager, its monitored interfaces and per-interface group tables. The
//! family modules handle the wire; this module holds what is common: the
//! querier modes, the group table with its fixed/dynamic split, and the
//! protocol interval arithmetic.
//!
//! The implementation deviates from the RFCs in a few deliberate ways:
//!
//! 1. Link-local scope groups (224.0.0.0/24, ff02::/16) are ignored.
//! 2. IGMPv3/MLDv2 are handled at group granularity; source lists are
//!    ignored, like a switch forwarding on "IP Group Address".
//! 3. Multiple querier modes are offered (see [`QuerierMode`]).
//! 4. Timeouts get a few milliseconds of grace for network round trip and
//!    host processing time.

pub mod igmp;
pub mod mld;

use crate::bridge::BridgeInstance;
use crate::evm::TimerHandle;
use std::str::FromStr;
use std::sync::Arc;

/// Grace allowance added to protocol timeouts, in milliseconds.
pub const GRACE_MILLIS: u64 = 10;

/// How long `delay` and `defer` modes wait for another querier before
/// self-promoting: the query interval plus half a second.
pub const STARTUP_QUERIER_DELAY_MS: u64 = 125_500;

/// When to become the querier on a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuerierMode {
    /// Never self-promote; only track observed queriers.
    Never,
    /// Become querier immediately at startup (RFC behavior). Yield to a
    /// numerically lower address.
    #[default]
    Quick,
    /// Wait [`STARTUP_QUERIER_DELAY_MS`] for another querier first, then
    /// behave like `Quick`.
    Delay,
    /// Like `Delay`, but always yield to any other querier regardless of
    /// relative address.
    Defer,
}

impl QuerierMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuerierMode::Never => "never",
            QuerierMode::Quick => "quick",
            QuerierMode::Delay => "delay",
            QuerierMode::Defer => "defer",
        }
    }
}

impl FromStr for QuerierMode {
    type Err = String;

    fn from_str(s: &str) -> Result<QuerierMode, String> {
        match s {
            "never" => Ok(QuerierMode::Never),
            "quick" => Ok(QuerierMode::Quick),
            "delay" => Ok(QuerierMode::Delay),
            "defer" => Ok(QuerierMode::Defer),
            other => Err(format!("Unknown querier mode \"{}\"", other)),
        }
    }
}

/// The querier variables of one snooper interface, normalized to
/// milliseconds regardless of the family's wire encoding (IGMP carries
/// tenths of a second, MLD milliseconds).
#[derive(Debug, Clone, Copy)]
pub struct QuerierTiming {
    pub robustness: u32,
    pub query_interval_secs: u32,
    pub response_interval_ms: u32,
    pub lastmbr_interval_ms: u32,
}

impl QuerierTiming {
    /// Group Membership Interval: `RV * QI + QRI` (RFC 9776 Section 9 /
    /// RFC 9777 Section 10), plus grace.
    pub fn membership_timeout_ms(&self) -> u64 {
        u64::from(self.robustness) * u64::from(self.query_interval_secs) * 1000
            + u64::from(self.response_interval_ms)
            + GRACE_MILLIS
    }

    /// Other Querier Present Interval: `RV * QI + QRI / 2`, plus grace.
    pub fn other_querier_timeout_ms(&self) -> u64 {
        u64::from(self.robustness) * u64::from(self.query_interval_secs) * 1000
            + u64::from(self.response_interval_ms) / 2
            + GRACE_MILLIS
    }

    /// Shortened membership timeout after a leave: `RV * LMQI`, plus
    /// grace. Also the spacing base for the group-specific query burst.
    pub fn leave_timeout_ms(&self) -> u64 {
        u64::from(self.robustness) * u64::from(self.lastmbr_interval_ms) + GRACE_MILLIS
    }

    /// Membership timeout re-armed when the elected querier sends a
    /// group-specific query: `RV * QRI`, plus grace.
    pub fn group_query_timeout_ms(&self) -> u64 {
        u64::from(self.robustness) * u64::from(self.response_interval_ms) + GRACE_MILLIS
    }
}

/// One tracked multicast group on a snooper interface.
#[derive(Debug)]
pub struct SnoopGroup<A> {
    pub addr: A,
    /// Live while refreshed by reports; drives activation for fixed
    /// groups.
    pub active: bool,
    /// IGMP only: a v1 host reported recently, so leaves are ignored.
    pub v1_host_present: bool,
    /// Group-specific queries still to send in the current burst.
    pub queries_remaining: u32,
    /// Bridge interfaces to activate/deactivate with this group. Empty
    /// for dynamic (learned) groups.
    pub outputs: Vec<(Arc<BridgeInstance>, usize)>,
    pub membership_timer: Option<TimerHandle>,
    pub v1_timer: Option<TimerHandle>,
}

impl<A> SnoopGroup<A> {
    fn new(addr: A) -> SnoopGroup<A> {
        SnoopGroup {
            addr,
            active: false,
            v1_host_present: false,
            queries_remaining: 0,
            outputs: Vec::new(),
            membership_timer: None,
            v1_timer: None,
        }
    }
}

/// The group array of one snooper interface.
///
/// Fixed groups sit at `[0..fixed_limit)`: one per registered
/// `(interface, group)`, created at initialization, never removed, at
/// stable indexes. The dynamic tail holds groups learned from reports for
/// other multicast traffic on the segment — they never drive activation
/// but keep the querier honest for non-bridged groups. Inactive dynamic
/// slots are reused before the array grows, and the array is capped so
/// unknown traffic cannot grow memory without bound.
#[derive(Debug)]
pub struct GroupTable<A> {
    groups: Vec<SnoopGroup<A>>,
    fixed_limit: usize,
    cap: usize,
}

impl<A: Copy + Eq> GroupTable<A> {
    pub fn new() -> GroupTable<A> {
        GroupTable { groups: Vec::new(), fixed_limit: 0, cap: 0 }
    }

    /// Register a fixed group, merging repeated registrations of the same
    /// address. Only valid before [`finalize`](Self::finalize).
    pub fn register_fixed(&mut self, addr: A, output: (Arc<BridgeInstance>, usize)) {
        let idx = match self.groups.iter().position(|g| g.addr == addr) {
            Some(idx) => idx,
            None => {
                self.groups.push(SnoopGroup::new(addr));
                self.groups.len() - 1
            }
        };
        self.groups[idx].outputs.push(output);
    }

    /// Freeze the fixed prefix and set the dynamic-tail allowance.
    pub fn finalize(&mut self, dynamic_cap: usize) {
        self.fixed_limit = self.groups.len();
        self.cap = self.fixed_limit + dynamic_cap;
    }

    /// Find the group for `addr`, or allocate a dynamic slot for it:
    /// first a matching fixed group, then a matching active dynamic
    /// group, then the first inactive dynamic slot, then a fresh slot if
    /// the cap allows. `None` means the table is full; the caller logs
    /// and ignores the group. The caller sets the active flag.
    pub fn find_or_create(&mut self, addr: A) -> Option<usize> {
        let mut first_empty = None;

        for (idx, group) in self.groups.iter().enumerate() {
            if idx < self.fixed_limit {
                if group.addr == addr {
                    return Some(idx);
                }
            } else if group.active {
                if group.addr == addr {
                    return Some(idx);
                }
            } else if first_empty.is_none() {
                first_empty = Some(idx);
            }
        }

        let idx = match first_empty {
            Some(idx) => idx,
            None => {
                if self.groups.len() >= self.cap {
                    return None;
                }
                self.groups.push(SnoopGroup::new(addr));
                self.groups.len() - 1
            }
        };

        let group = &mut self.groups[idx];
        group.addr = addr;
        group.v1_host_present = false;
        group.queries_remaining = 0;
        group.membership_timer = None;
        group.v1_timer = None;
        Some(idx)
    }

    /// Drop trailing inactive dynamic slots after a membership timeout.
    pub fn compact_tail(&mut self) {
        while self.groups.len() > self.fixed_limit {
            if self.groups.last().map(|g| g.active) == Some(false) {
                self.groups.pop();
            } else {
                break;
            }
        }
    }

    pub fn is_fixed(&self, idx: usize) -> bool {
        idx < self.fixed_limit
    }

    pub fn get(&self, idx: usize) -> &SnoopGroup<A> {
        &self.groups[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut SnoopGroup<A> {
        &mut self.groups[idx]
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn iter(&self) -> impl Iterator<Item = &SnoopGroup<A>> {
        self.groups.iter()
    }
}

impl<A: Copy + Eq> Default for GroupTable<A> {
    fn default() -> GroupTable<A> {
        GroupTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(fixed: &[u32], dynamic_cap: usize) -> GroupTable<u32> {
        let mut table = GroupTable::new();
        let instance = crate::bridge::BridgeInstance::for_tests(
            crate::Family::V4,
            7500,
            "239.0.75.0".parse().unwrap(),
            Vec::new(),
        );
        for &addr in fixed {
            table.register_fixed(addr, (instance.clone(), 0));
        }
        table.finalize(dynamic_cap);
        table
    }

    #[test]
    fn fixed_groups_found_even_when_inactive() {
        let mut t = table(&[10, 20], 4);
        assert_eq!(t.find_or_create(10), Some(0));
        assert_eq!(t.find_or_create(20), Some(1));
        assert!(t.is_fixed(0));
        assert!(t.is_fixed(1));
    }

    #[test]
    fn repeated_registration_merges_outputs() {
        let t = table(&[10, 10], 0);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(0).outputs.len(), 2);
    }

    #[test]
    fn dynamic_groups_reuse_inactive_slots() {
        let mut t = table(&[10], 4);
        let a = t.find_or_create(100).unwrap();
        t.get_mut(a).active = true;
        let b = t.find_or_create(200).unwrap();
        t.get_mut(b).active = true;
        assert_ne!(a, b);

        // Deactivate the first dynamic group; its slot is reused.
        t.get_mut(a).active = false;
        let c = t.find_or_create(300).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn inactive_dynamic_group_is_not_found_by_address() {
        let mut t = table(&[], 4);
        let a = t.find_or_create(100).unwrap();
        t.get_mut(a).active = false;
        // The address matches but the slot is dead: it is simply reused.
        let b = t.find_or_create(100).unwrap();
        assert_eq!(a, b);
        assert!(!t.get(b).active);
    }

    #[test]
    fn cap_limits_dynamic_tail() {
        let mut t = table(&[10], 2);
        let a = t.find_or_create(100).unwrap();
        t.get_mut(a).active = true;
        let b = t.find_or_create(200).unwrap();
        t.get_mut(b).active = true;
        assert_eq!(t.find_or_create(300), None);
        // The fixed group is still reachable when the tail is full.
        assert_eq!(t.find_or_create(10), Some(0));
    }

    #[test]
    fn compaction_stops_at_active_slot() {
        let mut t = table(&[10], 4);
        let a = t.find_or_create(100).unwrap();
        t.get_mut(a).active = true;
        let b = t.find_or_create(200).unwrap();
        t.get_mut(b).active = true;
        let c = t.find_or_create(300).unwrap();
        t.get_mut(c).active = true;

        t.get_mut(b).active = false;
        t.get_mut(c).active = false;
        t.compact_tail();
        // c and b are dropped, a survives, the fixed prefix is untouched.
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(a).addr, 100);
    }

    #[test]
    fn timing_formulas() {
        let timing = QuerierTiming {
            robustness: 2,
            query_interval_secs: 125,
            response_interval_ms: 10000,
            lastmbr_interval_ms: 1000,
        };
        assert_eq!(timing.membership_timeout_ms(), 250_000 + 10_000 + GRACE_MILLIS);
        assert_eq!(timing.other_querier_timeout_ms(), 250_000 + 5_000 + GRACE_MILLIS);
        assert_eq!(timing.leave_timeout_ms(), 2_000 + GRACE_MILLIS);
        assert_eq!(timing.group_query_timeout_ms(), 20_000 + GRACE_MILLIS);
    }

    #[test]
    fn querier_mode_strings() {
        for mode in [QuerierMode::Never, QuerierMode::Quick, QuerierMode::Delay, QuerierMode::Defer]
        {
            assert_eq!(mode.as_str().parse::<QuerierMode>().unwrap(), mode);
        }
        assert!("sometimes".parse::<QuerierMode>().is_err());
    }
}
