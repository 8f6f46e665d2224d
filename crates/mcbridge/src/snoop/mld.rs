// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The MLD snooping querier (RFC 2710, RFC 3810 / RFC 9777, RFC 4286).
//!
//! The IPv6 twin of [`super::igmp`]: same worker shape, same election and
//! membership machinery, with the IPv6 wire differences — Hop-by-Hop
//! Router Alert instead of an IP option, the ICMPv6 pseudo-header
//! checksum, a link-local source address, and 33:33 multicast MACs.

use crate::bridge::BridgeInstance;
use crate::capture::{CaptureFilter, CaptureSocket};
use crate::evm::EventManager;
use crate::packet::csum::{inet6_checksum, timecode_16bit_decode, timecode_8bit_decode};
use crate::packet::ip6::{
    self, HopByHop, Ipv6Header, IPPROTO_ICMPV6, IPV6_HBH_LEN, IPV6_HDR_LEN, IPV6_NEXT_HOP_BY_HOP,
};
use crate::packet::mld::{
    self, MldMessage, MldQuery, MLD_ALL_NODES, MLD_ALL_SNOOPERS, MLD_LASTMBR_INTERVAL_MS,
    MLD_MRD_ADVERTISEMENT, MLD_QUERY_INTERVAL_SECS, MLD_RESPONSE_INTERVAL_MS, MLD_ROBUSTNESS,
    MLD_V2_QUERY_LEN,
};
use crate::packet::mrd::{self, MRD_ADVERTISEMENT_LEN, MRD_INITIAL_COUNT};
use crate::packet::{ether, PacketError, RecordAction};
use crate::snoop::{GroupTable, QuerierMode, QuerierTiming, STARTUP_QUERIER_DELAY_MS};
use crate::MAX_PACKET_SIZE;
use mio::Token;
use std::io;
use std::net::Ipv6Addr;
use std::os::fd::AsRawFd;
use std::sync::Arc;

// Frame layout: Ethernet, IPv6, Hop-by-Hop with Router Alert, MLD.
const IP_OFF: usize = ether::ETH_HDR_LEN;
const HBH_OFF: usize = IP_OFF + IPV6_HDR_LEN;
const MLD_OFF: usize = HBH_OFF + IPV6_HBH_LEN;
const MRD_FRAME_LEN: usize = MLD_OFF + MRD_ADVERTISEMENT_LEN;
const QUERY_FRAME_LEN: usize = MLD_OFF + MLD_V2_QUERY_LEN;

/// All-ones address, letting anyone win the first election.
const ADDR_ALL_ONES: Ipv6Addr = Ipv6Addr::new(
    0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff, 0xffff,
);

fn default_timing() -> QuerierTiming {
    QuerierTiming {
        robustness: MLD_ROBUSTNESS,
        query_interval_secs: MLD_QUERY_INTERVAL_SECS,
        response_interval_ms: u32::from(MLD_RESPONSE_INTERVAL_MS),
        lastmbr_interval_ms: u32::from(MLD_LASTMBR_INTERVAL_MS),
    }
}

/// Timer payloads of the MLD worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MldEvent {
    GeneralQuery(usize),
    QuerierTimeout(usize),
    MrdAdvertisement(usize),
    GroupTimeout(usize, usize),
    GroupQuery(usize, usize),
}

/// One monitored interface. The source address is the interface's
/// link-local address, as MLD requires.
struct MldInterface {
    name: String,
    addr: Ipv6Addr,
    capture: CaptureSocket,
    groups: GroupTable<Ipv6Addr>,

    querier_addr: Ipv6Addr,
    timing: QuerierTiming,
    startup_queries_remaining: u32,
    mrd_initial_remaining: u32,

    general_query_timer: Option<crate::evm::TimerHandle>,
    querier_timer: Option<crate::evm::TimerHandle>,
    mrd_timer: Option<crate::evm::TimerHandle>,

    mrd_frame: [u8; MRD_FRAME_LEN],
    general_query_frame: [u8; QUERY_FRAME_LEN],
    specific_query_frame: [u8; QUERY_FRAME_LEN],
}

struct PendingInterface {
    name: String,
    if_index: u32,
    mac: [u8; 6],
    addr: Ipv6Addr,
    groups: GroupTable<Ipv6Addr>,
}

/// Collects interface registrations before the worker starts.
pub struct MldSnooperBuilder {
    mode: QuerierMode,
    dynamic_cap: usize,
    pending: Vec<PendingInterface>,
}

impl MldSnooperBuilder {
    pub fn new(mode: QuerierMode, dynamic_cap: usize) -> MldSnooperBuilder {
        MldSnooperBuilder { mode, dynamic_cap, pending: Vec::new() }
    }

    /// Register a dynamic outbound bridge interface for monitoring.
    pub fn register(&mut self, instance: &Arc<BridgeInstance>, idx: usize) {
        let bridge_iface = &instance.interfaces[idx];
        let group = match instance.group {
            std::net::IpAddr::V6(group) => group,
            std::net::IpAddr::V4(_) => unreachable!("IPv4 instance registered with MLD"),
        };

        let pidx = match self.pending.iter().position(|p| p.if_index == bridge_iface.if_index) {
            Some(pidx) => pidx,
            None => {
                self.pending.push(PendingInterface {
                    name: bridge_iface.name.clone(),
                    if_index: bridge_iface.if_index,
                    mac: bridge_iface.mac,
                    addr: bridge_iface.ipv6_ll.unwrap_or(Ipv6Addr::UNSPECIFIED),
                    groups: GroupTable::new(),
                });
                self.pending.len() - 1
            }
        };

        self.pending[pidx].groups.register_fixed(group, (instance.clone(), idx));
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Print the monitored interfaces and registered groups.
    pub fn dump_config(&self) {
        println!("MLD:");
        println!("  Querier Mode: {}", self.mode.as_str());
        for pending in &self.pending {
            println!("  Interface: {}", pending.name);
            println!("    if index: {}", pending.if_index);
            let m = pending.mac;
            println!(
                "    hw-addr: {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                m[0], m[1], m[2], m[3], m[4], m[5]
            );
            println!("    address: {}", pending.addr);
            println!("    groups:");
            for group in pending.groups.iter() {
                println!("      {}", group.addr);
            }
        }
    }

    /// Open the capture sockets and build the worker. `Ok(None)` when no
    /// interface was registered.
    pub fn build(self) -> io::Result<Option<MldSnooper>> {
        self.build_with(|if_index| CaptureSocket::open(if_index, CaptureFilter::Mld))
    }

    fn build_with(
        self,
        mut open: impl FnMut(u32) -> io::Result<CaptureSocket>,
    ) -> io::Result<Option<MldSnooper>> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let mut total_groups = 0;
        let mut pending = self.pending;
        for p in &mut pending {
            p.groups.finalize(self.dynamic_cap);
            total_groups += p.groups.capacity();
        }
        let mut evm = EventManager::new(pending.len(), pending.len() * 3 + total_groups * 2)?;

        let mut ifaces = Vec::with_capacity(pending.len());
        for p in pending {
            let capture = open(p.if_index)?;
            let token = evm.add_socket(capture.as_raw_fd())?;
            debug_assert_eq!(token.0, ifaces.len());

            let mut iface = MldInterface {
                name: p.name,
                addr: p.addr,
                capture,
                groups: p.groups,
                querier_addr: ADDR_ALL_ONES,
                timing: default_timing(),
                startup_queries_remaining: 0,
                mrd_initial_remaining: 0,
                general_query_timer: None,
                querier_timer: None,
                mrd_timer: None,
                mrd_frame: [0; MRD_FRAME_LEN],
                general_query_frame: [0; QUERY_FRAME_LEN],
                specific_query_frame: [0; QUERY_FRAME_LEN],
            };
            build_mrd_frame(&mut iface, p.mac);
            build_query_frames(&mut iface, p.mac);
            ifaces.push(iface);
        }

        Ok(Some(MldSnooper { mode: self.mode, evm, ifaces }))
    }
}

/// The MLD worker.
pub struct MldSnooper {
    mode: QuerierMode,
    evm: EventManager<MldEvent>,
    ifaces: Vec<MldInterface>,
}

/// Build the Multicast Router Discovery advertisement template.
fn build_mrd_frame(iface: &mut MldInterface, mac: [u8; 6]) {
    let frame = &mut iface.mrd_frame;
    ether::write_header(
        frame,
        &ether::ipv6_multicast_mac(&MLD_ALL_SNOOPERS),
        &mac,
        ether::ETHERTYPE_IPV6,
    );
    ip6::write_header(&mut frame[IP_OFF..], &iface.addr, &MLD_ALL_SNOOPERS, MRD_ADVERTISEMENT_LEN);
    ip6::write_hop_by_hop(&mut frame[HBH_OFF..]);
    mrd::write_advertisement(
        &mut frame[MLD_OFF..],
        MLD_MRD_ADVERTISEMENT,
        MLD_QUERY_INTERVAL_SECS as u16,
        MLD_ROBUSTNESS as u16,
    );
    let csum = inet6_checksum(&frame[MLD_OFF..], &iface.addr, &MLD_ALL_SNOOPERS, IPPROTO_ICMPV6);
    frame[MLD_OFF + 2..MLD_OFF + 4].copy_from_slice(&csum.to_be_bytes());
}

/// Build the general and group-specific query templates. The general
/// query is complete; the specific one leaves the low destination MAC
/// bytes, destination IP, group and checksum for per-send patching.
fn build_query_frames(iface: &mut MldInterface, mac: [u8; 6]) {
    let mut frame = [0u8; QUERY_FRAME_LEN];
    ether::write_header(&mut frame, &[0x33, 0x33, 0, 0, 0, 0], &mac, ether::ETHERTYPE_IPV6);
    ip6::write_header(&mut frame[IP_OFF..], &iface.addr, &Ipv6Addr::UNSPECIFIED, MLD_V2_QUERY_LEN);
    ip6::write_hop_by_hop(&mut frame[HBH_OFF..]);
    mld::write_v2_query(
        &mut frame[MLD_OFF..],
        MLD_LASTMBR_INTERVAL_MS,
        &Ipv6Addr::UNSPECIFIED,
        MLD_ROBUSTNESS as u8,
        MLD_QUERY_INTERVAL_SECS as u8,
    );
    iface.specific_query_frame = frame;

    // General query: all-nodes destination, full response interval.
    frame[0..6].copy_from_slice(&ether::ipv6_multicast_mac(&MLD_ALL_NODES));
    ip6::patch_dst(&mut frame[IP_OFF..], &MLD_ALL_NODES);
    frame[MLD_OFF + 4..MLD_OFF + 6].copy_from_slice(&MLD_RESPONSE_INTERVAL_MS.to_be_bytes());
    let csum = inet6_checksum(&frame[MLD_OFF..], &iface.addr, &MLD_ALL_NODES, IPPROTO_ICMPV6);
    frame[MLD_OFF + 2..MLD_OFF + 4].copy_from_slice(&csum.to_be_bytes());
    iface.general_query_frame = frame;
}

fn send_mrd_advertisement(evm: &mut EventManager<MldEvent>, iface: &mut MldInterface, ifidx: usize) {
    log::debug!(
        "[MLD] {} [{}]: sending Multicast Router Discovery advertisement",
        iface.name,
        iface.addr
    );

    if let Err(e) = iface.capture.inject(&iface.mrd_frame) {
        log::error!("[MLD] {}: inject failed: {}", iface.name, e);
    }

    let millis = if iface.mrd_initial_remaining > 0 {
        iface.mrd_initial_remaining -= 1;
        mrd::next_initial_interval_ms()
    } else {
        mrd::next_interval_ms()
    };
    iface.mrd_timer = evm.add_timer(millis, MldEvent::MrdAdvertisement(ifidx));
}

fn send_general_query(evm: &mut EventManager<MldEvent>, iface: &mut MldInterface, ifidx: usize) {
    log::debug!("[MLD] {} [{}]: sending general query", iface.name, iface.addr);

    if let Err(e) = iface.capture.inject(&iface.general_query_frame) {
        log::error!("[MLD] {}: inject failed: {}", iface.name, e);
    }

    let mut millis = u64::from(iface.timing.query_interval_secs) * 1000;
    if iface.startup_queries_remaining > 0 {
        iface.startup_queries_remaining -= 1;
        millis /= 4;
    }
    iface.general_query_timer = evm.add_timer(millis, MldEvent::GeneralQuery(ifidx));
}

fn send_group_specific_query(
    evm: &mut EventManager<MldEvent>,
    iface: &mut MldInterface,
    ifidx: usize,
    gidx: usize,
) {
    let group_addr = iface.groups.get(gidx).addr;
    let first = iface.groups.get(gidx).queries_remaining == iface.timing.robustness;

    log::debug!(
        "[MLD] {} [{}]: sending query [group {}]",
        iface.name,
        iface.addr,
        group_addr
    );

    // Patch the variable parts of the template: the low 4 bytes of the
    // destination MAC, destination IP, group field and S flag, then the
    // pseudo-header checksum over the new destination.
    let src = iface.addr;
    let frame = &mut iface.specific_query_frame;
    frame[2..6].copy_from_slice(&group_addr.octets()[12..16]);
    ip6::patch_dst(&mut frame[IP_OFF..], &group_addr);
    mld::patch_group(&mut frame[MLD_OFF..], &group_addr);
    mld::set_s_flag(&mut frame[MLD_OFF..], !first);
    frame[MLD_OFF + 2..MLD_OFF + 4].copy_from_slice(&[0, 0]);
    let csum = inet6_checksum(&frame[MLD_OFF..], &src, &group_addr, IPPROTO_ICMPV6);
    frame[MLD_OFF + 2..MLD_OFF + 4].copy_from_slice(&csum.to_be_bytes());

    if let Err(e) = iface.capture.inject(&iface.specific_query_frame) {
        log::error!("[MLD] {}: inject failed: {}", iface.name, e);
    }

    let spacing = u64::from(iface.timing.lastmbr_interval_ms);
    let group = iface.groups.get_mut(gidx);
    group.queries_remaining -= 1;
    if group.queries_remaining > 0 {
        let _ = evm.add_timer(spacing, MldEvent::GroupQuery(ifidx, gidx));
    }
}

fn activate_querier_mode(evm: &mut EventManager<MldEvent>, iface: &mut MldInterface, ifidx: usize) {
    log::info!("[MLD] {} [{}]: Querier mode activated", iface.name, iface.addr);

    iface.timing = default_timing();
    iface.querier_addr = iface.addr;
    iface.startup_queries_remaining = iface.timing.robustness - 1;
    send_general_query(evm, iface, ifidx);
}

fn join_common(evm: &mut EventManager<MldEvent>, iface: &mut MldInterface, ifidx: usize, gidx: usize) {
    let millis = iface.timing.membership_timeout_ms();
    let group = iface.groups.get_mut(gidx);

    if group.active {
        if let Some(handle) = group.membership_timer.take() {
            evm.cancel_timer(handle);
        }
    } else {
        group.active = true;
        for (instance, idx) in &group.outputs {
            instance.activate_outbound(*idx);
        }
    }

    let group = iface.groups.get_mut(gidx);
    group.membership_timer = evm.add_timer(millis, MldEvent::GroupTimeout(ifidx, gidx));
}

fn leave_common(evm: &mut EventManager<MldEvent>, iface: &mut MldInterface, ifidx: usize, gidx: usize) {
    if iface.querier_addr != iface.addr {
        return;
    }

    let millis = iface.timing.leave_timeout_ms();
    let robustness = iface.timing.robustness;
    let group = iface.groups.get_mut(gidx);

    if !group.active || group.queries_remaining > 0 {
        return;
    }

    if let Some(handle) = group.membership_timer.take() {
        evm.cancel_timer(handle);
    }
    group.membership_timer = evm.add_timer(millis, MldEvent::GroupTimeout(ifidx, gidx));

    group.queries_remaining = robustness;
    send_group_specific_query(evm, iface, ifidx, gidx);
}

fn log_drop(name: &str, addr: Option<Ipv6Addr>, msg: &str) {
    match addr {
        Some(addr) => log::warn!("[MLD] {} [{}]: {}", name, addr, msg),
        None => log::warn!("[MLD] {} []: {}", name, msg),
    }
}

/// Validate the layers below MLD: lengths, ethertype, the Hop-by-Hop
/// chain with its Router Alert, and the ICMPv6 checksum over the
/// pseudo-header. Returns the source address and the MLD payload,
/// `Ok(None)` for our own echoed packets, or the drop reason.
#[allow(clippy::type_complexity)]
fn validate_frame(
    frame: &[u8],
    own_addr: Ipv6Addr,
) -> Result<Option<(Ipv6Addr, &[u8])>, (Option<Ipv6Addr>, &'static str)> {
    if frame.len() < ether::ETH_HDR_LEN + IPV6_HDR_LEN {
        return Err((None, "Packet too short to contain an IPv6 header"));
    }
    if ether::ethertype(frame) != ether::ETHERTYPE_IPV6 {
        return Err((None, "Packet is not an IPv6 packet"));
    }

    let ip = &frame[IP_OFF..];
    let hdr = Ipv6Header::parse(ip);

    // Our own queries and advertisements echo back through capture.
    if hdr.src == own_addr {
        return Ok(None);
    }

    if hdr.next_header != IPV6_NEXT_HOP_BY_HOP {
        return Err((Some(hdr.src), "Next header in packet is not Hop-by-Hop"));
    }

    let payload = &ip[IPV6_HDR_LEN..];
    if hdr.payload_len > payload.len() {
        return Err((Some(hdr.src), "IP packet overrun"));
    }
    let payload = &payload[..hdr.payload_len];

    if payload.len() < IPV6_HBH_LEN {
        return Err((Some(hdr.src), "Packet too short to contain a Hop-by-Hop header"));
    }
    let hbh = HopByHop::parse(payload);
    // The RA/PadN option order is not fixed.
    if hbh.header_len != 0 || !HopByHop::has_router_alert(&payload[2..IPV6_HBH_LEN]) {
        return Err((Some(hdr.src), "Packet does not contain a Router Alert option"));
    }
    if hbh.next_header != IPPROTO_ICMPV6 {
        return Err((Some(hdr.src), "Packet without next header of ICMP6 in Hop-by-Hop header"));
    }

    // Four bytes covers the type/code/checksum prefix shared by every
    // MLD and MRD message; per-type lengths are enforced by the parser.
    let mld_payload = &payload[IPV6_HBH_LEN..];
    if mld_payload.len() < 4 {
        return Err((Some(hdr.src), "Packet too short to contain an MLD header"));
    }
    if inet6_checksum(mld_payload, &hdr.src, &hdr.dst, IPPROTO_ICMPV6) != 0 {
        return Err((Some(hdr.src), "ICMP6/MLD checksum error"));
    }

    Ok(Some((hdr.src, mld_payload)))
}

impl MldSnooper {
    /// Arm the startup state and run the event loop forever.
    pub fn run(mut self) -> ! {
        self.start();

        let mut ready: Vec<Token> = Vec::new();
        let mut expired: Vec<MldEvent> = Vec::new();
        let mut scratch = vec![0u8; MAX_PACKET_SIZE].into_boxed_slice();

        loop {
            if let Err(e) = self.evm.wait(&mut ready, &mut expired) {
                log::error!("[MLD] poll error: {}", e);
                continue;
            }
            for token in &ready {
                self.service_capture(token.0, &mut scratch);
            }
            for event in &expired {
                self.handle_event(*event);
            }
        }
    }

    /// First advertisements and the querier startup path.
    fn start(&mut self) {
        for ifidx in 0..self.ifaces.len() {
            let iface = &mut self.ifaces[ifidx];

            // The first advertisement goes out without jitter.
            iface.mrd_initial_remaining = MRD_INITIAL_COUNT - 1;
            send_mrd_advertisement(&mut self.evm, iface, ifidx);

            if self.mode == QuerierMode::Quick {
                activate_querier_mode(&mut self.evm, iface, ifidx);
            } else {
                iface.timing = default_timing();
                iface.querier_addr = ADDR_ALL_ONES;
                if self.mode != QuerierMode::Never {
                    iface.querier_timer = self
                        .evm
                        .add_timer(STARTUP_QUERIER_DELAY_MS, MldEvent::QuerierTimeout(ifidx));
                }
            }
        }
    }

    fn service_capture(&mut self, ifidx: usize, scratch: &mut [u8]) {
        loop {
            let len = match self.ifaces[ifidx].capture.recv(scratch) {
                Ok(len) => len,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::error!("[MLD] {}: capture read error: {}", self.ifaces[ifidx].name, e);
                    return;
                }
            };
            self.handle_frame(ifidx, &scratch[..len]);
        }
    }

    fn handle_event(&mut self, event: MldEvent) {
        match event {
            MldEvent::GeneralQuery(ifidx) => {
                send_general_query(&mut self.evm, &mut self.ifaces[ifidx], ifidx);
            }
            MldEvent::QuerierTimeout(ifidx) => self.querier_timeout(ifidx),
            MldEvent::MrdAdvertisement(ifidx) => {
                send_mrd_advertisement(&mut self.evm, &mut self.ifaces[ifidx], ifidx);
            }
            MldEvent::GroupTimeout(ifidx, gidx) => self.group_timeout(ifidx, gidx),
            MldEvent::GroupQuery(ifidx, gidx) => {
                send_group_specific_query(&mut self.evm, &mut self.ifaces[ifidx], ifidx, gidx);
            }
        }
    }

    fn querier_timeout(&mut self, ifidx: usize) {
        let iface = &mut self.ifaces[ifidx];
        iface.querier_timer = None;
        log::warn!("[MLD] {} [{}]: Querier timeout", iface.name, iface.querier_addr);

        if self.mode != QuerierMode::Never {
            activate_querier_mode(&mut self.evm, iface, ifidx);
        } else {
            log::warn!("[MLD] {} [{}]: Querier mode disabled", iface.name, iface.addr);
            iface.querier_addr = ADDR_ALL_ONES;
        }
    }

    fn group_timeout(&mut self, ifidx: usize, gidx: usize) {
        let iface = &mut self.ifaces[ifidx];
        log::warn!(
            "[MLD] {} [{}]: Group membership timeout",
            iface.name,
            iface.groups.get(gidx).addr
        );

        let group = iface.groups.get_mut(gidx);
        group.active = false;
        group.membership_timer = None;
        group.queries_remaining = 0;

        if iface.groups.is_fixed(gidx) {
            for (instance, idx) in &iface.groups.get(gidx).outputs {
                instance.deactivate_outbound(*idx);
            }
            return;
        }

        iface.groups.compact_tail();
    }

    /// Validate and dispatch one captured frame.
    fn handle_frame(&mut self, ifidx: usize, frame: &[u8]) {
        let own_addr = self.ifaces[ifidx].addr;
        let (src, payload) = match validate_frame(frame, own_addr) {
            Ok(Some(v)) => v,
            Ok(None) => return, // our own echo
            Err((addr, msg)) => {
                log_drop(&self.ifaces[ifidx].name, addr, msg);
                return;
            }
        };

        match mld::parse(payload) {
            Ok(MldMessage::Query(query)) => self.handle_query(ifidx, src, query),
            Ok(MldMessage::V1Report { group }) => {
                log::debug!(
                    "[MLD] {} [{}]: received v1 report [group {}]",
                    self.ifaces[ifidx].name,
                    src,
                    group
                );
                self.join(ifidx, group);
            }
            Ok(MldMessage::V1Done { group }) => {
                log::debug!(
                    "[MLD] {} [{}]: received v1 done [group {}]",
                    self.ifaces[ifidx].name,
                    src,
                    group
                );
                self.leave(ifidx, group);
            }
            Ok(MldMessage::V2Report(records)) => {
                // Records before a malformed one still take effect; the
                // rest of the report is abandoned.
                for record in records {
                    let record = match record {
                        Ok(record) => record,
                        Err(PacketError::UnknownRecordType(_)) => {
                            log_drop(
                                &self.ifaces[ifidx].name,
                                Some(src),
                                "Unknown group record type in MLD v2 report",
                            );
                            return;
                        }
                        Err(_) => {
                            log_drop(
                                &self.ifaces[ifidx].name,
                                Some(src),
                                "Group record overrun in MLD v2 report",
                            );
                            return;
                        }
                    };
                    log::debug!(
                        "[MLD] {} [{}]: received v2 report type {:?} [group {}]",
                        self.ifaces[ifidx].name,
                        src,
                        record.rtype,
                        record.group
                    );
                    match record.action() {
                        RecordAction::Join => self.join(ifidx, record.group),
                        RecordAction::Leave => self.leave(ifidx, record.group),
                        RecordAction::Ignore => {}
                    }
                }
            }
            Ok(MldMessage::MrdSolicitation) => {
                log::debug!(
                    "[MLD] {} [{}]: received Multicast Router Solicitation",
                    self.ifaces[ifidx].name,
                    src
                );
                let iface = &mut self.ifaces[ifidx];
                if let Some(handle) = iface.mrd_timer.take() {
                    self.evm.cancel_timer(handle);
                }
                send_mrd_advertisement(&mut self.evm, iface, ifidx);
            }
            Ok(MldMessage::MrdAdvertisement) | Ok(MldMessage::MrdTermination) => {}
            Err(_) => log_drop(&self.ifaces[ifidx].name, Some(src), "Unknown MLD type received"),
        }
    }

    fn handle_query(&mut self, ifidx: usize, src: Ipv6Addr, query: MldQuery) {
        let iface = &mut self.ifaces[ifidx];

        log::debug!(
            "[MLD] {} [{}]: received {} query [group {}]",
            iface.name,
            src,
            if query.v2.is_some() { "v2" } else { "v1" },
            query.group
        );

        if src != iface.querier_addr {
            let mut new_querier = false;

            if iface.querier_addr == iface.addr {
                // We are the querier. RFC election: the lowest address
                // wins; defer mode yields to anyone.
                if src < iface.addr || self.mode == QuerierMode::Defer {
                    new_querier = true;
                    if let Some(handle) = iface.general_query_timer.take() {
                        self.evm.cancel_timer(handle);
                    }
                } else {
                    return;
                }
            } else if src < iface.querier_addr {
                new_querier = true;
            }

            if new_querier {
                iface.querier_addr = src;
                // v1 queries carry no parameters; assume defaults.
                if query.v2.is_none() {
                    iface.timing = default_timing();
                }
                log::warn!("[MLD] {} [{}]: New querier elected", iface.name, iface.querier_addr);
            }
        }

        // Record the observed querier values.
        if let Some(v2) = query.v2 {
            iface.timing.robustness = u32::from(v2.qrv);
            iface.timing.query_interval_secs = u32::from(timecode_8bit_decode(v2.qqic));
            iface.timing.response_interval_ms = timecode_16bit_decode(query.response_code);
        }

        // Re-arm the other-querier-present timeout.
        if let Some(handle) = iface.querier_timer.take() {
            self.evm.cancel_timer(handle);
        }
        iface.querier_timer = self
            .evm
            .add_timer(iface.timing.other_querier_timeout_ms(), MldEvent::QuerierTimeout(ifidx));

        if query.v2.map(|v2| v2.s_flag).unwrap_or(false) {
            return;
        }

        // A group-specific query restarts the membership clock for the
        // group under probe.
        if query.group != Ipv6Addr::UNSPECIFIED {
            if mld::is_link_local_scope(&query.group) {
                return;
            }
            let millis = iface.timing.group_query_timeout_ms();
            let Some(gidx) = iface.groups.find_or_create(query.group) else {
                log::warn!(
                    "[MLD] {} [{}]: Group list full -- group ignored",
                    iface.name,
                    query.group
                );
                return;
            };
            let group = iface.groups.get_mut(gidx);
            if !group.active {
                return;
            }
            if let Some(handle) = group.membership_timer.take() {
                self.evm.cancel_timer(handle);
            }
            group.membership_timer = self.evm.add_timer(millis, MldEvent::GroupTimeout(ifidx, gidx));
        }
    }

    fn join(&mut self, ifidx: usize, group_addr: Ipv6Addr) {
        let Some(gidx) = self.find_group(ifidx, group_addr) else {
            return;
        };
        join_common(&mut self.evm, &mut self.ifaces[ifidx], ifidx, gidx);
    }

    fn leave(&mut self, ifidx: usize, group_addr: Ipv6Addr) {
        let Some(gidx) = self.find_group(ifidx, group_addr) else {
            return;
        };
        leave_common(&mut self.evm, &mut self.ifaces[ifidx], ifidx, gidx);
    }

    /// Group lookup with the link-local refusal and full-table logging
    /// shared by every report path.
    fn find_group(&mut self, ifidx: usize, group_addr: Ipv6Addr) -> Option<usize> {
        if mld::is_link_local_scope(&group_addr) {
            return None;
        }
        let iface = &mut self.ifaces[ifidx];
        let found = iface.groups.find_or_create(group_addr);
        if found.is_none() {
            log::warn!(
                "[MLD] {} [{}]: Group list full -- group ignored",
                iface.name,
                group_addr
            );
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeInstance;
    use crate::config::{BridgeIfaceConfig, IfaceConfig};
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::net::{IpAddr, UdpSocket};
    use std::os::fd::OwnedFd;

    fn own_addr() -> Ipv6Addr {
        "fe80::5".parse().unwrap()
    }

    fn group() -> Ipv6Addr {
        "ff05::7500".parse().unwrap()
    }

    fn iface_cfg(name: &str, inbound: IfaceConfig, outbound: IfaceConfig) -> BridgeIfaceConfig {
        BridgeIfaceConfig {
            name: name.to_string(),
            if_index: 1,
            mac: [0x02, 0, 0, 0, 0, 1],
            ipv4: None,
            ipv6: Some("2001:db8::5".parse().unwrap()),
            ipv6_ll: Some(own_addr()),
            inbound,
            outbound,
        }
    }

    fn loopback_socket() -> UdpSocket {
        let socket = UdpSocket::bind("[::1]:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        socket
    }

    fn instance() -> Arc<BridgeInstance> {
        BridgeInstance::for_tests(
            crate::Family::V6,
            7500,
            IpAddr::V6(group()),
            vec![
                (iface_cfg("a", IfaceConfig::Dynamic, IfaceConfig::None), loopback_socket()),
                (iface_cfg("b", IfaceConfig::None, IfaceConfig::Dynamic), loopback_socket()),
            ],
        )
    }

    fn snooper(mode: QuerierMode, instance: &Arc<BridgeInstance>) -> (MldSnooper, OwnedFd) {
        let mut builder = MldSnooperBuilder::new(mode, 8);
        builder.register(instance, 1);

        let (test_end, capture_end) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .unwrap();
        let mut capture = Some(capture_end);
        let mut snooper = builder
            .build_with(move |_| Ok(CaptureSocket::from_owned_fd(capture.take().unwrap())))
            .unwrap()
            .unwrap();
        snooper.start();
        (snooper, test_end)
    }

    fn read_frames(fd: &OwnedFd) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            // SAFETY: buf is valid for writes of its length.
            let r = unsafe {
                libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if r <= 0 {
                break;
            }
            frames.push(buf[..r as usize].to_vec());
        }
        frames
    }

    /// Build a complete MLD frame with Hop-by-Hop Router Alert and a
    /// valid ICMPv6 checksum.
    fn mld_frame(src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; MLD_OFF + payload.len()];
        ether::write_header(
            &mut frame,
            &ether::ipv6_multicast_mac(&dst),
            &[0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee],
            ether::ETHERTYPE_IPV6,
        );
        ip6::write_header(&mut frame[IP_OFF..], &src, &dst, payload.len());
        ip6::write_hop_by_hop(&mut frame[HBH_OFF..]);
        frame[MLD_OFF..].copy_from_slice(payload);
        let csum = inet6_checksum(&frame[MLD_OFF..], &src, &dst, IPPROTO_ICMPV6);
        frame[MLD_OFF + 2..MLD_OFF + 4].copy_from_slice(&csum.to_be_bytes());
        frame
    }

    fn v1_report(src: Ipv6Addr, group: Ipv6Addr) -> Vec<u8> {
        let mut payload = vec![mld::MLD_V1_REPORT, 0, 0, 0, 0, 0, 0, 0];
        payload.extend_from_slice(&group.octets());
        mld_frame(src, group, &payload)
    }

    fn v1_done(src: Ipv6Addr, group: Ipv6Addr) -> Vec<u8> {
        let mut payload = vec![mld::MLD_V1_DONE, 0, 0, 0, 0, 0, 0, 0];
        payload.extend_from_slice(&group.octets());
        mld_frame(src, mld::MLD_ALL_ROUTERS, &payload)
    }

    fn v1_query(src: Ipv6Addr) -> Vec<u8> {
        let mut payload = vec![mld::MLD_QUERY, 0, 0, 0, 0x27, 0x10, 0, 0];
        payload.extend_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
        mld_frame(src, MLD_ALL_NODES, &payload)
    }

    #[test]
    fn join_activates_bridge_outputs() {
        let instance = instance();
        let (mut snooper, _fd) = snooper(QuerierMode::Quick, &instance);

        snooper.handle_frame(0, &v1_report("fe80::9".parse().unwrap(), group()));

        assert!(instance.interfaces[1].outbound_active());
        assert!(instance.interfaces[0].inbound_active());
        assert!(snooper.ifaces[0].groups.get(0).active);
    }

    #[test]
    fn membership_timeout_deactivates() {
        let instance = instance();
        let (mut snooper, _fd) = snooper(QuerierMode::Quick, &instance);

        snooper.handle_frame(0, &v1_report("fe80::9".parse().unwrap(), group()));
        snooper.handle_event(MldEvent::GroupTimeout(0, 0));

        assert!(!snooper.ifaces[0].groups.get(0).active);
        assert!(!instance.interfaces[1].outbound_active());
        assert!(!instance.interfaces[0].inbound_active());
    }

    #[test]
    fn done_starts_group_specific_query_burst() {
        let instance = instance();
        let (mut snooper, fd) = snooper(QuerierMode::Quick, &instance);

        snooper.handle_frame(0, &v1_report("fe80::9".parse().unwrap(), group()));
        let _ = read_frames(&fd); // discard startup traffic

        snooper.handle_frame(0, &v1_done("fe80::9".parse().unwrap(), group()));
        assert_eq!(snooper.ifaces[0].groups.get(0).queries_remaining, 1);

        let frames = read_frames(&fd);
        assert_eq!(frames.len(), 1);
        let query = &frames[0];
        // Destination MAC for ff05::7500, S flag clear on the first
        // query, pseudo-header checksum valid.
        assert_eq!(&query[0..6], &[0x33, 0x33, 0x00, 0x00, 0x75, 0x00]);
        assert_eq!(query[MLD_OFF], mld::MLD_QUERY);
        assert_eq!(query[MLD_OFF + 24] & 0x08, 0);
        let hdr = Ipv6Header::parse(&query[IP_OFF..]);
        assert_eq!(hdr.dst, group());
        assert_eq!(
            inet6_checksum(&query[MLD_OFF..], &hdr.src, &hdr.dst, IPPROTO_ICMPV6),
            0
        );

        // Second query of the burst: S flag set, spacing by the last
        // member interval.
        snooper.handle_event(MldEvent::GroupQuery(0, 0));
        let frames = read_frames(&fd);
        assert_eq!(frames.len(), 1);
        assert_ne!(frames[0][MLD_OFF + 24] & 0x08, 0);
        let hdr = Ipv6Header::parse(&frames[0][IP_OFF..]);
        assert_eq!(
            inet6_checksum(&frames[0][MLD_OFF..], &hdr.src, &hdr.dst, IPPROTO_ICMPV6),
            0
        );
        assert_eq!(snooper.ifaces[0].groups.get(0).queries_remaining, 0);
    }

    #[test]
    fn lowest_address_wins_election() {
        let instance = instance();
        let (mut snooper, _fd) = snooper(QuerierMode::Quick, &instance);
        assert_eq!(snooper.ifaces[0].querier_addr, own_addr());

        snooper.handle_frame(0, &v1_query("fe80::9".parse().unwrap()));
        assert_eq!(snooper.ifaces[0].querier_addr, own_addr());

        snooper.handle_frame(0, &v1_query("fe80::3".parse().unwrap()));
        assert_eq!(snooper.ifaces[0].querier_addr, "fe80::3".parse::<Ipv6Addr>().unwrap());
        assert!(snooper.ifaces[0].general_query_timer.is_none());
    }

    #[test]
    fn defer_mode_always_yields() {
        let instance = instance();
        let (mut snooper, _fd) = snooper(QuerierMode::Defer, &instance);
        snooper.handle_event(MldEvent::QuerierTimeout(0));
        assert_eq!(snooper.ifaces[0].querier_addr, own_addr());

        snooper.handle_frame(0, &v1_query("fe80::9".parse().unwrap()));
        assert_eq!(snooper.ifaces[0].querier_addr, "fe80::9".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn padn_first_router_alert_accepted() {
        let instance = instance();
        let (mut snooper, _fd) = snooper(QuerierMode::Quick, &instance);

        let mut frame = v1_report("fe80::9".parse().unwrap(), group());
        // Swap the option order inside the Hop-by-Hop header: PadN(2)
        // first, Router Alert second.
        frame[HBH_OFF + 2] = ip6::IPV6_OPT_PADN;
        frame[HBH_OFF + 3] = 0;
        frame[HBH_OFF + 4] = ip6::IPV6_OPT_RA;
        frame[HBH_OFF + 5] = 2;
        // The Hop-by-Hop bytes sit outside the ICMPv6 checksum, so no
        // checksum update is needed.
        snooper.handle_frame(0, &frame);
        assert!(snooper.ifaces[0].groups.get(0).active);
    }

    #[test]
    fn missing_router_alert_dropped() {
        let instance = instance();
        let (mut snooper, _fd) = snooper(QuerierMode::Quick, &instance);

        let mut frame = v1_report("fe80::9".parse().unwrap(), group());
        frame[HBH_OFF + 2] = ip6::IPV6_OPT_PADN;
        frame[HBH_OFF + 4] = ip6::IPV6_OPT_PADN;
        snooper.handle_frame(0, &frame);
        assert!(!snooper.ifaces[0].groups.get(0).active);
    }

    #[test]
    fn bad_checksum_dropped() {
        let instance = instance();
        let (mut snooper, _fd) = snooper(QuerierMode::Quick, &instance);

        let mut frame = v1_report("fe80::9".parse().unwrap(), group());
        frame[MLD_OFF + 2] ^= 0xff;
        snooper.handle_frame(0, &frame);
        assert!(!snooper.ifaces[0].groups.get(0).active);
    }

    #[test]
    fn link_local_reports_ignored() {
        let instance = instance();
        let (mut snooper, _fd) = snooper(QuerierMode::Quick, &instance);

        let ll: Ipv6Addr = "ff02::123".parse().unwrap();
        snooper.handle_frame(0, &v1_report("fe80::9".parse().unwrap(), ll));
        assert_eq!(snooper.ifaces[0].groups.len(), 1);
        assert!(!snooper.ifaces[0].groups.get(0).active);
    }

    #[test]
    fn templates_verify() {
        let instance = instance();
        let (snooper, _fd) = snooper(QuerierMode::Never, &instance);
        let iface = &snooper.ifaces[0];

        let hdr = Ipv6Header::parse(&iface.mrd_frame[IP_OFF..]);
        assert_eq!(hdr.dst, MLD_ALL_SNOOPERS);
        assert_eq!(hdr.next_header, IPV6_NEXT_HOP_BY_HOP);
        assert_eq!(
            inet6_checksum(&iface.mrd_frame[MLD_OFF..], &hdr.src, &hdr.dst, IPPROTO_ICMPV6),
            0
        );

        let hdr = Ipv6Header::parse(&iface.general_query_frame[IP_OFF..]);
        assert_eq!(hdr.dst, MLD_ALL_NODES);
        assert_eq!(
            inet6_checksum(
                &iface.general_query_frame[MLD_OFF..],
                &hdr.src,
                &hdr.dst,
                IPPROTO_ICMPV6
            ),
            0
        );
        // 33:33:00:00:00:01 for ff02::1
        assert_eq!(&iface.general_query_frame[0..6], &[0x33, 0x33, 0, 0, 0, 1]);
    }
}
