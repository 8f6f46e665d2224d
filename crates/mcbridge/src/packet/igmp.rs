// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IGMP v1/v2/v3 messages (RFC 2236, RFC 3376 / RFC 9776).
//!
//! Parsing produces a tagged [`IgmpMessage`]; the caller dispatches on the
//! variant. The checksum over the IGMP bytes is verified by the receive
//! path before parsing, not here.
//!
//! # Query layout (IGMPv3, 12 bytes)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Type = 0x11  | Max Resp Code |           Checksum            |
//! +---------------+---------------+-------------------------------+
//! |                         Group Address                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Resv  |S| QRV |     QQIC      |     Number of Sources (N)     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! A v1/v2 query is the first 8 bytes of the same layout.

use super::{GroupRecord, PacketError, RecordType};
use std::net::Ipv4Addr;

/// IGMP message types.
pub const IGMP_QUERY: u8 = 0x11;
pub const IGMP_V1_REPORT: u8 = 0x12;
pub const IGMP_V2_REPORT: u8 = 0x16;
pub const IGMP_V2_LEAVE: u8 = 0x17;
pub const IGMP_V3_REPORT: u8 = 0x22;
pub const IGMP_MRD_ADVERTISEMENT: u8 = 0x30;
pub const IGMP_MRD_SOLICITATION: u8 = 0x31;
pub const IGMP_MRD_TERMINATION: u8 = 0x32;

/// Length of the v1/v2 header, also the minimum IGMP payload.
pub const IGMP_HDR_LEN: usize = 8;

/// Length of a v3 query without sources.
pub const IGMP_V3_QUERY_LEN: usize = 12;

/// Length of the v3 report header.
pub const IGMP_V3_REPORT_HDR_LEN: usize = 8;

/// Length of a v3 group record without sources.
pub const IGMP_V3_RECORD_HDR_LEN: usize = 8;

/// IGMP protocol defaults (RFC 2236 / RFC 9776).
pub const IGMP_ROBUSTNESS: u32 = 2;
pub const IGMP_QUERY_INTERVAL_SECS: u32 = 125;
pub const IGMP_RESPONSE_INTERVAL_TENTHS: u8 = 100;
pub const IGMP_LASTMBR_INTERVAL_TENTHS: u8 = 10;

/// All-systems group 224.0.0.1.
pub const IGMP_ALL_SYSTEMS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
/// All-routers group 224.0.0.2.
pub const IGMP_ALL_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);
/// IGMPv3 report destination 224.0.0.22.
pub const IGMP_ALL_REPORTS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);
/// MRD all-snoopers group 224.0.0.106.
pub const IGMP_ALL_SNOOPERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 106);

/// True for the link-local scope 224.0.0.0/24, which is never bridged.
pub fn is_link_local_scope(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    o[0] == 224 && o[1] == 0 && o[2] == 0
}

/// Parameters only present in an IGMPv3 query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V3QueryParams {
    pub s_flag: bool,
    pub qrv: u8,
    pub qqic: u8,
}

/// A parsed membership query. `code` is the max response code in tenths of
/// a second; `v3` is present when the payload is long enough to be a v3
/// query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgmpQuery {
    pub code: u8,
    pub group: Ipv4Addr,
    pub v3: Option<V3QueryParams>,
}

/// A parsed IGMP message.
#[derive(Debug)]
pub enum IgmpMessage<'a> {
    Query(IgmpQuery),
    V1Report { group: Ipv4Addr },
    V2Report { group: Ipv4Addr },
    V2Leave { group: Ipv4Addr },
    V3Report(V3Records<'a>),
    MrdAdvertisement,
    MrdSolicitation,
    MrdTermination,
}

/// Parse an IGMP payload (checksum already verified).
///
/// MRD solicitations are shorter than the common IGMP header, so the
/// type is examined before the length.
pub fn parse(payload: &[u8]) -> Result<IgmpMessage<'_>, PacketError> {
    if payload.len() < 4 {
        return Err(PacketError::Truncated);
    }

    match payload[0] {
        IGMP_MRD_ADVERTISEMENT => return Ok(IgmpMessage::MrdAdvertisement),
        IGMP_MRD_SOLICITATION => return Ok(IgmpMessage::MrdSolicitation),
        IGMP_MRD_TERMINATION => return Ok(IgmpMessage::MrdTermination),
        _ => {}
    }

    if payload.len() < IGMP_HDR_LEN {
        return Err(PacketError::Truncated);
    }

    let group4 = |buf: &[u8]| Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);

    match payload[0] {
        IGMP_QUERY => {
            let v3 = if payload.len() >= IGMP_V3_QUERY_LEN {
                Some(V3QueryParams {
                    s_flag: payload[8] & 0x08 != 0,
                    qrv: payload[8] & 0x07,
                    qqic: payload[9],
                })
            } else {
                None
            };
            Ok(IgmpMessage::Query(IgmpQuery {
                code: payload[1],
                group: group4(payload),
                v3,
            }))
        }
        IGMP_V1_REPORT => Ok(IgmpMessage::V1Report { group: group4(payload) }),
        IGMP_V2_REPORT => Ok(IgmpMessage::V2Report { group: group4(payload) }),
        IGMP_V2_LEAVE => Ok(IgmpMessage::V2Leave { group: group4(payload) }),
        IGMP_V3_REPORT => {
            let num_records = u16::from_be_bytes([payload[6], payload[7]]);
            Ok(IgmpMessage::V3Report(V3Records {
                buf: &payload[IGMP_V3_REPORT_HDR_LEN..],
                remaining: num_records,
            }))
        }
        t => Err(PacketError::UnknownType(t)),
    }
}

/// Iterator over the group records of an IGMPv3 report.
///
/// Yields `Err` once on a malformed record and then stops; the record
/// count in the header is trusted only as an upper bound.
#[derive(Debug)]
pub struct V3Records<'a> {
    buf: &'a [u8],
    remaining: u16,
}

impl<'a> Iterator for V3Records<'a> {
    type Item = Result<GroupRecord<Ipv4Addr>, PacketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        if self.buf.len() < IGMP_V3_RECORD_HDR_LEN {
            self.remaining = 0;
            return Some(Err(PacketError::Truncated));
        }

        let rtype = match RecordType::from_wire(self.buf[0]) {
            Some(t) => t,
            None => {
                let t = self.buf[0];
                self.remaining = 0;
                return Some(Err(PacketError::UnknownRecordType(t)));
            }
        };
        let aux_len = usize::from(self.buf[1]) * 4;
        let num_srcs = u16::from_be_bytes([self.buf[2], self.buf[3]]);
        let group = Ipv4Addr::new(self.buf[4], self.buf[5], self.buf[6], self.buf[7]);

        let record_len = IGMP_V3_RECORD_HDR_LEN + usize::from(num_srcs) * 4 + aux_len;
        if self.buf.len() < record_len {
            self.remaining = 0;
            return Some(Err(PacketError::Truncated));
        }
        self.buf = &self.buf[record_len..];

        Some(Ok(GroupRecord { rtype, num_srcs, group }))
    }
}

/// Write an IGMPv3 query into `buf[..12]` with a zero checksum: the caller
/// patches the group and S flag as needed and computes the checksum last.
pub fn write_v3_query(buf: &mut [u8], code: u8, group: Ipv4Addr, qrv: u8, qqic: u8) {
    buf[0] = IGMP_QUERY;
    buf[1] = code;
    buf[2..4].copy_from_slice(&[0, 0]); // checksum
    buf[4..8].copy_from_slice(&group.octets());
    buf[8] = qrv & 0x07; // Resv(4) | S(1) | QRV(3)
    buf[9] = qqic;
    buf[10..12].copy_from_slice(&[0, 0]); // no sources
}

/// Set or clear the S flag (suppress router-side processing) of a query
/// built by [`write_v3_query`].
pub fn set_s_flag(buf: &mut [u8], s_flag: bool) {
    if s_flag {
        buf[8] |= 0x08;
    } else {
        buf[8] &= !0x08;
    }
}

/// Patch the group address of a query built by [`write_v3_query`].
pub fn patch_group(buf: &mut [u8], group: Ipv4Addr) {
    buf[4..8].copy_from_slice(&group.octets());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::csum::inet_checksum;

    fn v3_report(records: &[(u8, u16, [u8; 4], usize)]) -> Vec<u8> {
        let mut buf = vec![IGMP_V3_REPORT, 0, 0, 0, 0, 0];
        buf.extend_from_slice(&(records.len() as u16).to_be_bytes());
        for &(rtype, num_srcs, group, src_count) in records {
            buf.push(rtype);
            buf.push(0);
            buf.extend_from_slice(&num_srcs.to_be_bytes());
            buf.extend_from_slice(&group);
            buf.extend(std::iter::repeat(0u8).take(src_count * 4));
        }
        buf
    }

    #[test]
    fn parse_v2_report() {
        let payload = [IGMP_V2_REPORT, 0, 0, 0, 239, 0, 75, 0];
        match parse(&payload).unwrap() {
            IgmpMessage::V2Report { group } => assert_eq!(group, Ipv4Addr::new(239, 0, 75, 0)),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn parse_v2_query_has_no_v3_params() {
        let payload = [IGMP_QUERY, 100, 0, 0, 0, 0, 0, 0];
        match parse(&payload).unwrap() {
            IgmpMessage::Query(q) => {
                assert_eq!(q.code, 100);
                assert!(q.v3.is_none());
                assert_eq!(q.group, Ipv4Addr::UNSPECIFIED);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn parse_v3_query_flags() {
        let mut payload = [0u8; IGMP_V3_QUERY_LEN];
        write_v3_query(&mut payload, 100, Ipv4Addr::new(239, 0, 75, 0), 2, 125);
        set_s_flag(&mut payload, true);
        match parse(&payload).unwrap() {
            IgmpMessage::Query(q) => {
                let v3 = q.v3.unwrap();
                assert!(v3.s_flag);
                assert_eq!(v3.qrv, 2);
                assert_eq!(v3.qqic, 125);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn v3_report_record_walk() {
        let payload = v3_report(&[
            (RecordType::ModeIsExclude as u8, 0, [239, 0, 75, 0], 0),
            (RecordType::BlockOldSources as u8, 1, [239, 0, 75, 1], 1),
        ]);
        match parse(&payload).unwrap() {
            IgmpMessage::V3Report(records) => {
                let recs: Vec<_> = records.map(Result::unwrap).collect();
                assert_eq!(recs.len(), 2);
                assert_eq!(recs[0].rtype, RecordType::ModeIsExclude);
                assert_eq!(recs[1].rtype, RecordType::BlockOldSources);
                assert_eq!(recs[1].num_srcs, 1);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn v3_report_truncated_record() {
        let mut payload = v3_report(&[(RecordType::ModeIsExclude as u8, 4, [239, 0, 75, 0], 0)]);
        payload.truncate(payload.len()); // record claims 4 sources it does not have
        match parse(&payload).unwrap() {
            IgmpMessage::V3Report(mut records) => {
                assert_eq!(records.next().unwrap().unwrap_err(), PacketError::Truncated);
                assert!(records.next().is_none());
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn v3_report_unknown_record_type() {
        let payload = v3_report(&[(0x4b, 0, [239, 0, 75, 0], 0)]);
        match parse(&payload).unwrap() {
            IgmpMessage::V3Report(mut records) => {
                assert_eq!(
                    records.next().unwrap().unwrap_err(),
                    PacketError::UnknownRecordType(0x4b)
                );
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn query_checksum_round() {
        let mut payload = [0u8; IGMP_V3_QUERY_LEN];
        write_v3_query(&mut payload, 100, Ipv4Addr::UNSPECIFIED, 2, 125);
        let csum = inet_checksum(&payload);
        payload[2..4].copy_from_slice(&csum.to_be_bytes());
        assert_eq!(inet_checksum(&payload), 0);
    }

    #[test]
    fn short_payload_rejected() {
        assert_eq!(parse(&[IGMP_QUERY, 0, 0]).unwrap_err(), PacketError::Truncated);
    }

    #[test]
    fn link_local_scope() {
        assert!(is_link_local_scope(Ipv4Addr::new(224, 0, 0, 1)));
        assert!(is_link_local_scope(Ipv4Addr::new(224, 0, 0, 251)));
        assert!(!is_link_local_scope(Ipv4Addr::new(224, 0, 1, 1)));
        assert!(!is_link_local_scope(Ipv4Addr::new(239, 0, 75, 0)));
    }
}
