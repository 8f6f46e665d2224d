// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IPv6 header and the Hop-by-Hop extension carrying Router Alert.
//!
//! MLD packets travel with a Hop-by-Hop extension header containing the
//! Router Alert option (RFC 2711) and a PadN option to reach the mandatory
//! 8-byte alignment. The RA/PadN order is not fixed by the RFC, so parsing
//! accepts either.

use std::net::Ipv6Addr;

/// Length of the fixed IPv6 header.
pub const IPV6_HDR_LEN: usize = 40;

/// Length of the Hop-by-Hop extension we emit (minimum: 8 bytes).
pub const IPV6_HBH_LEN: usize = 8;

/// Next-header value for Hop-by-Hop options.
pub const IPV6_NEXT_HOP_BY_HOP: u8 = 0;

/// Next-header value for ICMPv6.
pub const IPPROTO_ICMPV6: u8 = 58;

/// Hop-by-Hop option type: Router Alert.
pub const IPV6_OPT_RA: u8 = 0x05;

/// Hop-by-Hop option type: PadN.
pub const IPV6_OPT_PADN: u8 = 0x01;

/// Parsed view of an IPv6 header.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6Header {
    pub payload_len: usize,
    pub next_header: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Ipv6Header {
    /// Read the fixed fields. The caller has checked that `buf` holds at
    /// least [`IPV6_HDR_LEN`] bytes.
    pub fn parse(buf: &[u8]) -> Ipv6Header {
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&buf[8..24]);
        dst.copy_from_slice(&buf[24..40]);
        Ipv6Header {
            payload_len: usize::from(u16::from_be_bytes([buf[4], buf[5]])),
            next_header: buf[6],
            src: Ipv6Addr::from(src),
            dst: Ipv6Addr::from(dst),
        }
    }
}

/// Parsed view of an 8-byte Hop-by-Hop header.
#[derive(Debug, Clone, Copy)]
pub struct HopByHop {
    pub next_header: u8,
    pub header_len: u8,
}

impl HopByHop {
    /// Read the first two bytes. The caller has checked the length.
    pub fn parse(buf: &[u8]) -> HopByHop {
        HopByHop {
            next_header: buf[0],
            header_len: buf[1],
        }
    }

    /// True if the 6 option bytes carry a Router Alert, in either the
    /// RA-then-PadN or PadN-then-RA arrangement.
    pub fn has_router_alert(options: &[u8]) -> bool {
        options.len() >= 6 && (options[0] == IPV6_OPT_RA || options[2] == IPV6_OPT_RA)
    }
}

/// Write a 40-byte IPv6 header into `buf`: version 6, hop limit 1,
/// next header Hop-by-Hop, payload length covering the extension plus
/// `upper_len` bytes of ICMPv6.
pub fn write_header(buf: &mut [u8], src: &Ipv6Addr, dst: &Ipv6Addr, upper_len: usize) {
    let payload_len = (IPV6_HBH_LEN + upper_len) as u16;

    buf[0..4].copy_from_slice(&0x6000_0000u32.to_be_bytes()); // version, TC, flow
    buf[4..6].copy_from_slice(&payload_len.to_be_bytes());
    buf[6] = IPV6_NEXT_HOP_BY_HOP;
    buf[7] = 1; // hop limit
    buf[8..24].copy_from_slice(&src.octets());
    buf[24..40].copy_from_slice(&dst.octets());
}

/// Write the 8-byte Hop-by-Hop extension into `buf`: next header ICMPv6,
/// Router Alert option (value 0, MLD) followed by a PadN option.
pub fn write_hop_by_hop(buf: &mut [u8]) {
    buf[0] = IPPROTO_ICMPV6;
    buf[1] = 0; // extension length in 8-byte units beyond the first
    buf[2] = IPV6_OPT_RA;
    buf[3] = 2;
    buf[4..6].copy_from_slice(&[0, 0]); // RA value 0: MLD
    buf[6] = IPV6_OPT_PADN;
    buf[7] = 0;
}

/// Patch the destination address of a header built by [`write_header`].
pub fn patch_dst(buf: &mut [u8], dst: &Ipv6Addr) {
    buf[24..40].copy_from_slice(&dst.octets());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_parse_roundtrip() {
        let mut buf = [0u8; IPV6_HDR_LEN + IPV6_HBH_LEN];
        let src: Ipv6Addr = "fe80::1".parse().unwrap();
        let dst: Ipv6Addr = "ff02::1".parse().unwrap();
        write_header(&mut buf, &src, &dst, 28);
        write_hop_by_hop(&mut buf[IPV6_HDR_LEN..]);

        let hdr = Ipv6Header::parse(&buf);
        assert_eq!(hdr.payload_len, IPV6_HBH_LEN + 28);
        assert_eq!(hdr.next_header, IPV6_NEXT_HOP_BY_HOP);
        assert_eq!(hdr.src, src);
        assert_eq!(hdr.dst, dst);

        let hbh = HopByHop::parse(&buf[IPV6_HDR_LEN..]);
        assert_eq!(hbh.next_header, IPPROTO_ICMPV6);
        assert_eq!(hbh.header_len, 0);
        assert!(HopByHop::has_router_alert(&buf[IPV6_HDR_LEN + 2..]));
    }

    #[test]
    fn router_alert_order_may_swap() {
        // PadN first, Router Alert second
        let options = [IPV6_OPT_PADN, 0, IPV6_OPT_RA, 2, 0, 0];
        assert!(HopByHop::has_router_alert(&options));
        // No Router Alert at all
        let options = [IPV6_OPT_PADN, 0, IPV6_OPT_PADN, 2, 0, 0];
        assert!(!HopByHop::has_router_alert(&options));
    }
}
