// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Raw layer-2 capture and injection.
//!
//! One non-blocking `AF_PACKET` socket per monitored interface, placed in
//! promiscuous mode with a classic BPF program attached so the kernel only
//! delivers the protocol of interest:
//!
//! - IGMP: ethertype 0x0800 and IPv4 protocol 2
//! - MLD: ethertype 0x86dd, next header Hop-by-Hop, HBH next header
//!   ICMPv6, and ICMPv6 type in {130, 131, 132, 143, 152}
//!
//! The filter only narrows; the receive path re-validates every layer.
//! Injection writes a complete Ethernet frame.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::packet::ether::{ETHERTYPE_IPV4, ETHERTYPE_IPV6};
use crate::packet::ip4::IPPROTO_IGMP;
use crate::packet::ip6::{IPPROTO_ICMPV6, IPV6_NEXT_HOP_BY_HOP};

// Classic BPF opcodes (linux/bpf_common.h). Spelled out locally so the
// programs below read without chasing system headers.
const BPF_LD_H_ABS: u16 = 0x28; // A = half word at absolute offset k
const BPF_LD_B_ABS: u16 = 0x30; // A = byte at absolute offset k
const BPF_JEQ_K: u16 = 0x15; // pc += (A == k) ? jt : jf
const BPF_RET_K: u16 = 0x06; // accept k bytes

const fn stmt(code: u16, k: u32) -> libc::sock_filter {
    libc::sock_filter { code, jt: 0, jf: 0, k }
}

const fn jeq(k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter { code: BPF_JEQ_K, jt, jf, k }
}

// ldh [12]            ; ethertype
// jeq 0x0800, L1, drop
// L1: ldb [23]        ; IPv4 protocol
// jeq 2, accept, drop
const IGMP_FILTER: [libc::sock_filter; 6] = [
    stmt(BPF_LD_H_ABS, 12),
    jeq(ETHERTYPE_IPV4 as u32, 0, 3),
    stmt(BPF_LD_B_ABS, 23),
    jeq(IPPROTO_IGMP as u32, 0, 1),
    stmt(BPF_RET_K, u32::MAX),
    stmt(BPF_RET_K, 0),
];

// ldh [12]            ; ethertype
// jeq 0x86dd, L1, drop
// L1: ldb [20]        ; IPv6 next header
// jeq 0, L2, drop     ; Hop-by-Hop
// L2: ldb [54]        ; HBH next header
// jeq 58, L3, drop    ; ICMPv6
// L3: ldb [62]        ; ICMPv6 type
// jeq 130 | 131 | 132 | 143 | 152 -> accept, else drop
const MLD_FILTER: [libc::sock_filter; 14] = [
    stmt(BPF_LD_H_ABS, 12),
    jeq(ETHERTYPE_IPV6 as u32, 0, 11),
    stmt(BPF_LD_B_ABS, 20),
    jeq(IPV6_NEXT_HOP_BY_HOP as u32, 0, 9),
    stmt(BPF_LD_B_ABS, 54),
    jeq(IPPROTO_ICMPV6 as u32, 0, 7),
    stmt(BPF_LD_B_ABS, 62),
    jeq(130, 4, 0),
    jeq(131, 3, 0),
    jeq(132, 2, 0),
    jeq(143, 1, 0),
    jeq(152, 0, 1),
    stmt(BPF_RET_K, u32::MAX),
    stmt(BPF_RET_K, 0),
];

/// Which protocol family a capture socket filters for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFilter {
    Igmp,
    Mld,
}

impl CaptureFilter {
    fn program(&self) -> &'static [libc::sock_filter] {
        match self {
            CaptureFilter::Igmp => &IGMP_FILTER,
            CaptureFilter::Mld => &MLD_FILTER,
        }
    }
}

/// A raw capture/injection socket bound to one interface.
#[derive(Debug)]
pub struct CaptureSocket {
    fd: OwnedFd,
}

fn last_error() -> io::Error {
    io::Error::last_os_error()
}

impl CaptureSocket {
    /// Open an AF_PACKET socket on the interface: non-blocking, bound to
    /// `if_index`, promiscuous, with the family's BPF program attached.
    pub fn open(if_index: u32, filter: CaptureFilter) -> io::Result<CaptureSocket> {
        // SAFETY: plain socket(2); ownership is taken immediately.
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                (libc::ETH_P_ALL as u16).to_be() as libc::c_int,
            )
        };
        if raw < 0 {
            return Err(last_error());
        }
        // SAFETY: raw is a freshly created, valid descriptor.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // Bind to the interface so we only see its traffic.
        // SAFETY: sockaddr_ll is zero-initialized and sized for bind(2).
        unsafe {
            let mut sll: libc::sockaddr_ll = mem::zeroed();
            sll.sll_family = libc::AF_PACKET as u16;
            sll.sll_protocol = (libc::ETH_P_ALL as u16).to_be();
            sll.sll_ifindex = if_index as libc::c_int;
            let r = libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            );
            if r < 0 {
                return Err(last_error());
            }
        }

        // Promiscuous membership: reports sent to the group MAC would
        // otherwise be invisible to us.
        // SAFETY: packet_mreq is zero-initialized and sized for setsockopt(2).
        unsafe {
            let mut mreq: libc::packet_mreq = mem::zeroed();
            mreq.mr_ifindex = if_index as libc::c_int;
            mreq.mr_type = libc::PACKET_MR_PROMISC as u16;
            let r = libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const libc::packet_mreq as *const libc::c_void,
                mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            );
            if r < 0 {
                return Err(last_error());
            }
        }

        // Attach the BPF program.
        let program = filter.program();
        // SAFETY: the program points at a static array; sock_fprog only
        // borrows it for the duration of the call.
        unsafe {
            let prog = libc::sock_fprog {
                len: program.len() as u16,
                filter: program.as_ptr() as *mut libc::sock_filter,
            };
            let r = libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &prog as *const libc::sock_fprog as *const libc::c_void,
                mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            );
            if r < 0 {
                return Err(last_error());
            }
        }

        Ok(CaptureSocket { fd })
    }

    /// Wrap an existing datagram descriptor. Used by tests to stand in a
    /// socketpair end for the packet socket.
    #[cfg(test)]
    pub(crate) fn from_owned_fd(fd: OwnedFd) -> CaptureSocket {
        CaptureSocket { fd }
    }

    /// Receive one frame. Returns `WouldBlock` when drained.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for writes of its length.
        let r = unsafe {
            libc::recv(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        if r < 0 {
            return Err(last_error());
        }
        Ok(r as usize)
    }

    /// Inject one complete Ethernet frame.
    pub fn inject(&self, frame: &[u8]) -> io::Result<()> {
        // SAFETY: frame is valid for reads of its length.
        let r = unsafe {
            libc::send(self.fd.as_raw_fd(), frame.as_ptr() as *const libc::c_void, frame.len(), 0)
        };
        if r < 0 {
            return Err(last_error());
        }
        Ok(())
    }
}

impl AsRawFd for CaptureSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Evaluate a classic BPF program over a frame, mirroring the kernel
    /// interpreter for the opcodes we use.
    fn bpf_run(program: &[libc::sock_filter], frame: &[u8]) -> u32 {
        let mut acc: u32 = 0;
        let mut pc = 0usize;
        loop {
            let insn = &program[pc];
            match insn.code {
                BPF_LD_H_ABS => {
                    let k = insn.k as usize;
                    if k + 2 > frame.len() {
                        return 0;
                    }
                    acc = u32::from(u16::from_be_bytes([frame[k], frame[k + 1]]));
                    pc += 1;
                }
                BPF_LD_B_ABS => {
                    let k = insn.k as usize;
                    if k >= frame.len() {
                        return 0;
                    }
                    acc = u32::from(frame[k]);
                    pc += 1;
                }
                BPF_JEQ_K => {
                    pc += 1 + if acc == insn.k { insn.jt } else { insn.jf } as usize;
                }
                BPF_RET_K => return insn.k,
                other => panic!("unhandled opcode {:#x}", other),
            }
        }
    }

    fn igmp_frame(protocol: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 64];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
        frame[23] = protocol;
        frame
    }

    fn mld_frame(next_header: u8, hbh_next: u8, icmp_type: u8) -> Vec<u8> {
        let mut frame = vec![0u8; 96];
        frame[12..14].copy_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
        frame[20] = next_header;
        frame[54] = hbh_next;
        frame[62] = icmp_type;
        frame
    }

    #[test]
    fn igmp_filter_accepts_igmp_only() {
        assert_ne!(bpf_run(&IGMP_FILTER, &igmp_frame(2)), 0);
        assert_eq!(bpf_run(&IGMP_FILTER, &igmp_frame(17)), 0); // UDP
        let mut v6 = igmp_frame(2);
        v6[12..14].copy_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
        assert_eq!(bpf_run(&IGMP_FILTER, &v6), 0);
    }

    #[test]
    fn mld_filter_accepts_mld_types_only() {
        for t in [130u8, 131, 132, 143, 152] {
            assert_ne!(bpf_run(&MLD_FILTER, &mld_frame(0, 58, t)), 0, "type {}", t);
        }
        // MRD advertisement (151) is not wanted
        assert_eq!(bpf_run(&MLD_FILTER, &mld_frame(0, 58, 151)), 0);
        // No Hop-by-Hop
        assert_eq!(bpf_run(&MLD_FILTER, &mld_frame(58, 58, 130)), 0);
        // HBH next header is not ICMPv6
        assert_eq!(bpf_run(&MLD_FILTER, &mld_frame(0, 17, 130)), 0);
    }

    #[test]
    #[ignore = "requires CAP_NET_RAW"]
    fn open_on_loopback() {
        let lo = nix::net::if_::if_nametoindex("lo").expect("lo should exist");
        CaptureSocket::open(lo, CaptureFilter::Igmp).expect("open should succeed with CAP_NET_RAW");
    }
}
