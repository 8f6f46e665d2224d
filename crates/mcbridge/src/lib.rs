// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast bridging between isolated layer-2 segments.
//!
//! For each configured `(port, group address)` pair on a set of interfaces,
//! the bridge receives multicast UDP datagrams on inbound interfaces and
//! re-emits them on outbound interfaces. Replication is gated by IGMP/MLD
//! snooping: an outbound interface is only active while a host on its
//! segment holds membership in the bridged group.
//!
//! # Architecture
//!
//! ```text
//! AF_PACKET capture -> packet codecs -> snooper (join/leave/election)
//!                                           v
//!                             bridge activation (atomic flags, group joins)
//!                                           v
//! UDP recv_from() -> inbound flag gate -> fan-out sendto() on active peers
//! ```
//!
//! Threads: one IGMP snooper, one MLD snooper, one forwarder per bridge
//! instance. Each runs a single-threaded [`evm::EventManager`] reactor.
//! The only cross-thread writes are the per-interface activation flags.

pub mod bridge;
pub mod capture;
pub mod config;
pub mod evm;
pub mod netif;
pub mod packet;
pub mod snoop;

use std::fmt;

/// Maximum UDP payload we will ever forward.
///
/// IPv4 tops out at 65507 in practice and IPv6 at 65495; jumbograms are not
/// supported. A single 64 KiB scratch buffer per worker covers both.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Address family of a bridge instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}
