// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! On-wire structures for the protocols the snooper speaks.
//!
//! Everything here works on byte slices in network byte order; bit fields
//! are assembled by explicit shifts so the layout never depends on the
//! compiler. Encoders leave checksum fields zeroed; the caller patches the
//! variable parts and computes the checksum last, since the group address
//! changes the covered bytes.

pub mod csum;
pub mod ether;
pub mod igmp;
pub mod ip4;
pub mod ip6;
pub mod mld;
pub mod mrd;

use thiserror::Error;

/// Errors surfaced while decoding a received packet. These are logged and
/// the packet dropped; they never abort the process.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated")]
    Truncated,
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("unknown group record type {0}")]
    UnknownRecordType(u8),
}

/// Group record types shared by IGMPv3 and MLDv2 reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    ModeIsInclude = 1,
    ModeIsExclude = 2,
    ChangeToInclude = 3,
    ChangeToExclude = 4,
    AllowNewSources = 5,
    BlockOldSources = 6,
}

impl RecordType {
    pub fn from_wire(value: u8) -> Option<RecordType> {
        match value {
            1 => Some(RecordType::ModeIsInclude),
            2 => Some(RecordType::ModeIsExclude),
            3 => Some(RecordType::ChangeToInclude),
            4 => Some(RecordType::ChangeToExclude),
            5 => Some(RecordType::AllowNewSources),
            6 => Some(RecordType::BlockOldSources),
            _ => None,
        }
    }
}

/// What a group record means at group granularity (sources are ignored;
/// we forward whole groups, never source-specific ranges).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    Join,
    Leave,
    /// BLOCK_OLD_SOURCES with a non-empty source list narrows sources
    /// without leaving the group; at group granularity it is a no-op.
    Ignore,
}

/// A group record from an IGMPv3 or MLDv2 report, reduced to the fields
/// the snooper uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupRecord<A> {
    pub rtype: RecordType,
    pub num_srcs: u16,
    pub group: A,
}

impl<A> GroupRecord<A> {
    /// Classify the record as a join or a leave.
    pub fn action(&self) -> RecordAction {
        match self.rtype {
            RecordType::ModeIsInclude | RecordType::ChangeToInclude => {
                if self.num_srcs > 0 {
                    RecordAction::Join
                } else {
                    RecordAction::Leave
                }
            }
            RecordType::ModeIsExclude
            | RecordType::ChangeToExclude
            | RecordType::AllowNewSources => RecordAction::Join,
            RecordType::BlockOldSources => {
                if self.num_srcs == 0 {
                    RecordAction::Leave
                } else {
                    RecordAction::Ignore
                }
            }
        }
    }
}
