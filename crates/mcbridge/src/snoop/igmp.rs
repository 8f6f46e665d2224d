// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The IGMP snooping querier (RFC 2236, RFC 3376 / RFC 9776, RFC 4286).
//!
//! One worker thread owning every monitored IPv4 interface. Per interface
//! it captures IGMP traffic, takes part in querier election, tracks group
//! membership with timeouts, emits general and group-specific queries when
//! elected, and advertises itself via Multicast Router Discovery. Fixed
//! groups drive the bridge activation flags on membership transitions.

use crate::bridge::BridgeInstance;
use crate::capture::{CaptureFilter, CaptureSocket};
use crate::evm::EventManager;
use crate::packet::csum::{inet_checksum, timecode_8bit_decode};
use crate::packet::igmp::{
    self, IgmpMessage, IgmpQuery, IGMP_ALL_SNOOPERS, IGMP_ALL_SYSTEMS,
    IGMP_LASTMBR_INTERVAL_TENTHS, IGMP_MRD_ADVERTISEMENT, IGMP_QUERY_INTERVAL_SECS,
    IGMP_RESPONSE_INTERVAL_TENTHS, IGMP_ROBUSTNESS, IGMP_V3_QUERY_LEN,
};
use crate::packet::ip4::{self, Ipv4Header, IPPROTO_IGMP, IPV4_HDR_LEN, IPV4_HDR_RA_LEN};
use crate::packet::mrd::{self, MRD_ADVERTISEMENT_LEN, MRD_INITIAL_COUNT};
use crate::packet::{ether, PacketError, RecordAction};
use crate::snoop::{GroupTable, QuerierMode, QuerierTiming, STARTUP_QUERIER_DELAY_MS};
use crate::MAX_PACKET_SIZE;
use mio::Token;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::Arc;

// Frame layout: Ethernet, IPv4 with Router Alert, IGMP.
const IP_OFF: usize = ether::ETH_HDR_LEN;
const IGMP_OFF: usize = IP_OFF + IPV4_HDR_RA_LEN;
const MRD_FRAME_LEN: usize = IGMP_OFF + MRD_ADVERTISEMENT_LEN;
const QUERY_FRAME_LEN: usize = IGMP_OFF + IGMP_V3_QUERY_LEN;

fn default_timing() -> QuerierTiming {
    QuerierTiming {
        robustness: IGMP_ROBUSTNESS,
        query_interval_secs: IGMP_QUERY_INTERVAL_SECS,
        response_interval_ms: u32::from(IGMP_RESPONSE_INTERVAL_TENTHS) * 100,
        lastmbr_interval_ms: u32::from(IGMP_LASTMBR_INTERVAL_TENTHS) * 100,
    }
}

/// Timer payloads of the IGMP worker. Groups are addressed by
/// `(interface index, group index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IgmpEvent {
    GeneralQuery(usize),
    QuerierTimeout(usize),
    MrdAdvertisement(usize),
    GroupTimeout(usize, usize),
    V1HostTimeout(usize, usize),
    GroupQuery(usize, usize),
}

/// One monitored interface.
struct IgmpInterface {
    name: String,
    addr: Ipv4Addr,
    capture: CaptureSocket,
    groups: GroupTable<Ipv4Addr>,

    querier_addr: Ipv4Addr,
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
    addr: Ipv4Addr,
    groups: GroupTable<Ipv4Addr>,
}

/// Collects interface registrations before the worker starts.
pub struct IgmpSnooperBuilder {
    mode: QuerierMode,
    dynamic_cap: usize,
    pending: Vec<PendingInterface>,
}

impl IgmpSnooperBuilder {
    pub fn new(mode: QuerierMode, dynamic_cap: usize) -> IgmpSnooperBuilder {
        IgmpSnooperBuilder { mode, dynamic_cap, pending: Vec::new() }
    }

    /// Register a dynamic outbound bridge interface for monitoring. The
    /// snooper interface is keyed by OS interface: two bridge instances
    /// sharing a NIC share one capture and one group table.
    pub fn register(&mut self, instance: &Arc<BridgeInstance>, idx: usize) {
        let bridge_iface = &instance.interfaces[idx];
        let group = match instance.group {
            std::net::IpAddr::V4(group) => group,
            std::net::IpAddr::V6(_) => unreachable!("IPv6 instance registered with IGMP"),
        };

        let pidx = match self.pending.iter().position(|p| p.if_index == bridge_iface.if_index) {
            Some(pidx) => pidx,
            None => {
                self.pending.push(PendingInterface {
                    name: bridge_iface.name.clone(),
                    if_index: bridge_iface.if_index,
                    mac: bridge_iface.mac,
                    addr: bridge_iface.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED),
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
        println!("IGMP:");
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
    pub fn build(self) -> io::Result<Option<IgmpSnooper>> {
        self.build_with(|if_index| CaptureSocket::open(if_index, CaptureFilter::Igmp))
    }

    fn build_with(
        self,
        mut open: impl FnMut(u32) -> io::Result<CaptureSocket>,
    ) -> io::Result<Option<IgmpSnooper>> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        // Timer count is a rough ceiling: three per interface plus a
        // membership and a v1-host timer per group slot.
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

            let mut iface = IgmpInterface {
                name: p.name,
                addr: p.addr,
                capture,
                groups: p.groups,
                querier_addr: Ipv4Addr::BROADCAST,
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

        Ok(Some(IgmpSnooper { mode: self.mode, evm, ifaces }))
    }
}

/// The IGMP worker.
pub struct IgmpSnooper {
    mode: QuerierMode,
    evm: EventManager<IgmpEvent>,
    ifaces: Vec<IgmpInterface>,
}

/// Build the Multicast Router Discovery advertisement template.
fn build_mrd_frame(iface: &mut IgmpInterface, mac: [u8; 6]) {
    let frame = &mut iface.mrd_frame;
    ether::write_header(
        frame,
        &ether::ipv4_multicast_mac(IGMP_ALL_SNOOPERS),
        &mac,
        ether::ETHERTYPE_IPV4,
    );
    ip4::write_header_with_ra(
        &mut frame[IP_OFF..],
        iface.addr,
        IGMP_ALL_SNOOPERS,
        MRD_ADVERTISEMENT_LEN,
    );
    ip4::finalize_checksum(&mut frame[IP_OFF..]);
    mrd::write_advertisement(
        &mut frame[IGMP_OFF..],
        IGMP_MRD_ADVERTISEMENT,
        IGMP_QUERY_INTERVAL_SECS as u16,
        IGMP_ROBUSTNESS as u16,
    );
    let csum = inet_checksum(&frame[IGMP_OFF..]);
    frame[IGMP_OFF + 2..IGMP_OFF + 4].copy_from_slice(&csum.to_be_bytes());
}

/// Build the general and group-specific query templates. The general
/// query is complete; the specific one leaves the low destination MAC
/// bytes, destination IP, group and checksums for per-send patching.
fn build_query_frames(iface: &mut IgmpInterface, mac: [u8; 6]) {
    let mut frame = [0u8; QUERY_FRAME_LEN];
    ether::write_header(&mut frame, &[0x01, 0x00, 0x5e, 0, 0, 0], &mac, ether::ETHERTYPE_IPV4);
    ip4::write_header_with_ra(
        &mut frame[IP_OFF..],
        iface.addr,
        Ipv4Addr::UNSPECIFIED,
        IGMP_V3_QUERY_LEN,
    );
    igmp::write_v3_query(
        &mut frame[IGMP_OFF..],
        IGMP_LASTMBR_INTERVAL_TENTHS,
        Ipv4Addr::UNSPECIFIED,
        IGMP_ROBUSTNESS as u8,
        IGMP_QUERY_INTERVAL_SECS as u8,
    );
    iface.specific_query_frame = frame;

    // General query: all-systems destination, full response interval.
    frame[0..6].copy_from_slice(&ether::ipv4_multicast_mac(IGMP_ALL_SYSTEMS));
    ip4::patch_dst(&mut frame[IP_OFF..], IGMP_ALL_SYSTEMS);
    ip4::finalize_checksum(&mut frame[IP_OFF..]);
    frame[IGMP_OFF + 1] = IGMP_RESPONSE_INTERVAL_TENTHS;
    let csum = inet_checksum(&frame[IGMP_OFF..]);
    frame[IGMP_OFF + 2..IGMP_OFF + 4].copy_from_slice(&csum.to_be_bytes());
    iface.general_query_frame = frame;
}

fn send_mrd_advertisement(evm: &mut EventManager<IgmpEvent>, iface: &mut IgmpInterface, ifidx: usize) {
    log::debug!(
        "[IGMP] {} [{}]: sending Multicast Router Discovery advertisement",
        iface.name,
        iface.addr
    );

    if let Err(e) = iface.capture.inject(&iface.mrd_frame) {
        log::error!("[IGMP] {}: inject failed: {}", iface.name, e);
    }

    let millis = if iface.mrd_initial_remaining > 0 {
        iface.mrd_initial_remaining -= 1;
        mrd::next_initial_interval_ms()
    } else {
        mrd::next_interval_ms()
    };
    iface.mrd_timer = evm.add_timer(millis, IgmpEvent::MrdAdvertisement(ifidx));
}

fn send_general_query(evm: &mut EventManager<IgmpEvent>, iface: &mut IgmpInterface, ifidx: usize) {
    log::debug!("[IGMP] {} [{}]: sending general query", iface.name, iface.addr);

    if let Err(e) = iface.capture.inject(&iface.general_query_frame) {
        log::error!("[IGMP] {}: inject failed: {}", iface.name, e);
    }

    let mut millis = u64::from(iface.timing.query_interval_secs) * 1000;
    if iface.startup_queries_remaining > 0 {
        iface.startup_queries_remaining -= 1;
        millis /= 4;
    }
    iface.general_query_timer = evm.add_timer(millis, IgmpEvent::GeneralQuery(ifidx));
}

fn send_group_specific_query(
    evm: &mut EventManager<IgmpEvent>,
    iface: &mut IgmpInterface,
    ifidx: usize,
    gidx: usize,
) {
    let group_addr = iface.groups.get(gidx).addr;
    let first = iface.groups.get(gidx).queries_remaining == iface.timing.robustness;

    log::debug!(
        "[IGMP] {} [{}]: sending query [group {}]",
        iface.name,
        iface.addr,
        group_addr
    );

    // Patch the variable parts of the template: the low 3 bytes of the
    // destination MAC, destination IP, group field and S flag. The group
    // changes the covered bytes, so both checksums are recomputed.
    let frame = &mut iface.specific_query_frame;
    let o = group_addr.octets();
    frame[3] = o[1] & 0x7f;
    frame[4] = o[2];
    frame[5] = o[3];
    ip4::patch_dst(&mut frame[IP_OFF..], group_addr);
    ip4::finalize_checksum(&mut frame[IP_OFF..]);
    igmp::patch_group(&mut frame[IGMP_OFF..], group_addr);
    igmp::set_s_flag(&mut frame[IGMP_OFF..], !first);
    frame[IGMP_OFF + 2..IGMP_OFF + 4].copy_from_slice(&[0, 0]);
    let csum = inet_checksum(&frame[IGMP_OFF..]);
    frame[IGMP_OFF + 2..IGMP_OFF + 4].copy_from_slice(&csum.to_be_bytes());

    if let Err(e) = iface.capture.inject(&iface.specific_query_frame) {
        log::error!("[IGMP] {}: inject failed: {}", iface.name, e);
    }

    let spacing = u64::from(iface.timing.lastmbr_interval_ms);
    let group = iface.groups.get_mut(gidx);
    group.queries_remaining -= 1;
    if group.queries_remaining > 0 {
        let _ = evm.add_timer(spacing, IgmpEvent::GroupQuery(ifidx, gidx));
    }
}

fn activate_querier_mode(evm: &mut EventManager<IgmpEvent>, iface: &mut IgmpInterface, ifidx: usize) {
    log::info!("[IGMP] {} [{}]: Querier mode activated", iface.name, iface.addr);

    iface.timing = default_timing();
    iface.querier_addr = iface.addr;
    iface.startup_queries_remaining = iface.timing.robustness - 1;
    send_general_query(evm, iface, ifidx);
}

fn join_common(evm: &mut EventManager<IgmpEvent>, iface: &mut IgmpInterface, ifidx: usize, gidx: usize) {
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
    group.membership_timer = evm.add_timer(millis, IgmpEvent::GroupTimeout(ifidx, gidx));
}

fn leave_common(evm: &mut EventManager<IgmpEvent>, iface: &mut IgmpInterface, ifidx: usize, gidx: usize) {
    // Leaves only matter to the elected querier: it is the one probing
    // for remaining members.
    if iface.querier_addr != iface.addr {
        return;
    }

    let millis = iface.timing.leave_timeout_ms();
    let robustness = iface.timing.robustness;
    let group = iface.groups.get_mut(gidx);

    if !group.active || group.v1_host_present || group.queries_remaining > 0 {
        return;
    }

    if let Some(handle) = group.membership_timer.take() {
        evm.cancel_timer(handle);
    }
    group.membership_timer = evm.add_timer(millis, IgmpEvent::GroupTimeout(ifidx, gidx));

    group.queries_remaining = robustness;
    send_group_specific_query(evm, iface, ifidx, gidx);
}

fn log_drop(name: &str, addr: Option<Ipv4Addr>, msg: &str) {
    match addr {
        Some(addr) => log::warn!("[IGMP] {} [{}]: {}", name, addr, msg),
        None => log::warn!("[IGMP] {} []: {}", name, msg),
    }
}

/// Validate the layers below IGMP: lengths, ethertype, IP header
/// checksum, Router Alert and the IGMP checksum. Returns the source
/// address and the IGMP payload, `Ok(None)` for our own echoed packets,
/// or the drop reason.
#[allow(clippy::type_complexity)]
fn validate_frame(
    frame: &[u8],
    own_addr: Ipv4Addr,
) -> Result<Option<(Ipv4Addr, &[u8])>, (Option<Ipv4Addr>, &'static str)> {
    if frame.len() < ether::ETH_HDR_LEN + IPV4_HDR_LEN {
        return Err((None, "Packet too short to contain an IPv4 header"));
    }
    if ether::ethertype(frame) != ether::ETHERTYPE_IPV4 {
        return Err((None, "Packet is not an IPv4 packet"));
    }

    let ip = &frame[IP_OFF..];
    let hdr = Ipv4Header::parse(ip);

    // Our own queries and advertisements echo back through capture.
    if hdr.src == own_addr {
        return Ok(None);
    }

    if hdr.header_len < IPV4_HDR_LEN || hdr.header_len > ip.len() {
        return Err((None, "IP header overrun"));
    }
    if !Ipv4Header::checksum_ok(ip, hdr.header_len) {
        return Err((Some(hdr.src), "IP checksum error"));
    }
    if hdr.total_len < hdr.header_len || hdr.total_len > ip.len() {
        return Err((Some(hdr.src), "IP packet overrun"));
    }
    let ip = &ip[..hdr.total_len];

    if hdr.protocol != IPPROTO_IGMP {
        return Err((Some(hdr.src), "Packet is not an IGMP packet"));
    }
    if hdr.header_len < IPV4_HDR_RA_LEN {
        return Err((Some(hdr.src), "IP header too short to contain a Router Alert option"));
    }
    if !Ipv4Header::has_router_alert(&ip[IPV4_HDR_LEN..hdr.header_len]) {
        return Err((Some(hdr.src), "Packet does not contain a Router Alert option"));
    }

    // Four bytes covers the type/code/checksum prefix shared by every
    // IGMP and MRD message; per-type lengths are enforced by the parser.
    let payload = &ip[hdr.header_len..];
    if payload.len() < 4 {
        return Err((Some(hdr.src), "Packet too short to contain an IGMP header"));
    }
    if inet_checksum(payload) != 0 {
        return Err((Some(hdr.src), "IGMP checksum error"));
    }

    Ok(Some((hdr.src, payload)))
}

impl IgmpSnooper {
    /// Arm the startup state and run the event loop forever.
    pub fn run(mut self) -> ! {
        self.start();

        let mut ready: Vec<Token> = Vec::new();
        let mut expired: Vec<IgmpEvent> = Vec::new();
        let mut scratch = vec![0u8; MAX_PACKET_SIZE].into_boxed_slice();

        loop {
            if let Err(e) = self.evm.wait(&mut ready, &mut expired) {
                log::error!("[IGMP] poll error: {}", e);
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
                // All-ones lets anyone win the first election.
                iface.querier_addr = Ipv4Addr::BROADCAST;
                if self.mode != QuerierMode::Never {
                    iface.querier_timer = self
                        .evm
                        .add_timer(STARTUP_QUERIER_DELAY_MS, IgmpEvent::QuerierTimeout(ifidx));
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
                    log::error!("[IGMP] {}: capture read error: {}", self.ifaces[ifidx].name, e);
                    return;
                }
            };
            self.handle_frame(ifidx, &scratch[..len]);
        }
    }

    fn handle_event(&mut self, event: IgmpEvent) {
        match event {
            IgmpEvent::GeneralQuery(ifidx) => {
                send_general_query(&mut self.evm, &mut self.ifaces[ifidx], ifidx);
            }
            IgmpEvent::QuerierTimeout(ifidx) => self.querier_timeout(ifidx),
            IgmpEvent::MrdAdvertisement(ifidx) => {
                send_mrd_advertisement(&mut self.evm, &mut self.ifaces[ifidx], ifidx);
            }
            IgmpEvent::GroupTimeout(ifidx, gidx) => self.group_timeout(ifidx, gidx),
            IgmpEvent::V1HostTimeout(ifidx, gidx) => {
                let iface = &mut self.ifaces[ifidx];
                log::debug!("[IGMP] {}: v1 host present timeout", iface.name);
                let group = iface.groups.get_mut(gidx);
                group.v1_host_present = false;
                group.v1_timer = None;
            }
            IgmpEvent::GroupQuery(ifidx, gidx) => {
                send_group_specific_query(&mut self.evm, &mut self.ifaces[ifidx], ifidx, gidx);
            }
        }
    }

    fn querier_timeout(&mut self, ifidx: usize) {
        let iface = &mut self.ifaces[ifidx];
        iface.querier_timer = None;
        log::warn!("[IGMP] {} [{}]: Querier timeout", iface.name, iface.querier_addr);

        if self.mode != QuerierMode::Never {
            activate_querier_mode(&mut self.evm, iface, ifidx);
        } else {
            log::warn!("[IGMP] {} [{}]: Querier mode disabled", iface.name, iface.addr);
            iface.querier_addr = Ipv4Addr::BROADCAST;
        }
    }

    fn group_timeout(&mut self, ifidx: usize, gidx: usize) {
        let iface = &mut self.ifaces[ifidx];
        log::warn!(
            "[IGMP] {} [{}]: Group membership timeout",
            iface.name,
            iface.groups.get(gidx).addr
        );

        let group = iface.groups.get_mut(gidx);
        group.active = false;
        group.membership_timer = None;
        group.queries_remaining = 0;
        group.v1_host_present = false;
        if let Some(handle) = group.v1_timer.take() {
            self.evm.cancel_timer(handle);
        }

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

        match igmp::parse(payload) {
            Ok(IgmpMessage::Query(query)) => self.handle_query(ifidx, src, query),
            Ok(IgmpMessage::V1Report { group }) => self.handle_v1_report(ifidx, src, group),
            Ok(IgmpMessage::V2Report { group }) => {
                log::debug!(
                    "[IGMP] {} [{}]: received v2 report [group {}]",
                    self.ifaces[ifidx].name,
                    src,
                    group
                );
                self.join(ifidx, group);
            }
            Ok(IgmpMessage::V2Leave { group }) => {
                log::debug!(
                    "[IGMP] {} [{}]: received v2 leave [group {}]",
                    self.ifaces[ifidx].name,
                    src,
                    group
                );
                self.leave(ifidx, group);
            }
            Ok(IgmpMessage::V3Report(records)) => {
                // Records before a malformed one still take effect; the
                // rest of the report is abandoned.
                for record in records {
                    let record = match record {
                        Ok(record) => record,
                        Err(PacketError::UnknownRecordType(_)) => {
                            log_drop(
                                &self.ifaces[ifidx].name,
                                Some(src),
                                "Unknown group record type in IGMP v3 report",
                            );
                            return;
                        }
                        Err(_) => {
                            log_drop(
                                &self.ifaces[ifidx].name,
                                Some(src),
                                "Group record overrun in IGMP v3 report",
                            );
                            return;
                        }
                    };
                    log::debug!(
                        "[IGMP] {} [{}]: received v3 report type {:?} [group {}]",
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
            Ok(IgmpMessage::MrdSolicitation) => {
                log::debug!(
                    "[IGMP] {} [{}]: received Multicast Router Solicitation",
                    self.ifaces[ifidx].name,
                    src
                );
                let iface = &mut self.ifaces[ifidx];
                if let Some(handle) = iface.mrd_timer.take() {
                    self.evm.cancel_timer(handle);
                }
                send_mrd_advertisement(&mut self.evm, iface, ifidx);
            }
            Ok(IgmpMessage::MrdAdvertisement) | Ok(IgmpMessage::MrdTermination) => {}
            Err(_) => log_drop(&self.ifaces[ifidx].name, Some(src), "Unknown IGMP type received"),
        }
    }

    fn handle_query(&mut self, ifidx: usize, src: Ipv4Addr, query: IgmpQuery) {
        let iface = &mut self.ifaces[ifidx];

        log::debug!(
            "[IGMP] {} [{}]: received {} query [group {}]",
            iface.name,
            src,
            if query.v3.is_some() { "v3" } else { "v2" },
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
                // v1/v2 queries carry no parameters; assume defaults.
                if query.v3.is_none() {
                    iface.timing = default_timing();
                }
                log::warn!(
                    "[IGMP] {} [{}]: New querier elected",
                    iface.name,
                    iface.querier_addr
                );
            }
        }

        // Record the observed querier values.
        if let Some(v3) = query.v3 {
            iface.timing.robustness = u32::from(v3.qrv);
            iface.timing.query_interval_secs = u32::from(timecode_8bit_decode(v3.qqic));
            iface.timing.response_interval_ms = u32::from(timecode_8bit_decode(query.code)) * 100;
        }

        // Re-arm the other-querier-present timeout.
        if let Some(handle) = iface.querier_timer.take() {
            self.evm.cancel_timer(handle);
        }
        iface.querier_timer = self
            .evm
            .add_timer(iface.timing.other_querier_timeout_ms(), IgmpEvent::QuerierTimeout(ifidx));

        // With the S flag set the querier suppresses router-side state.
        if query.v3.map(|v3| v3.s_flag).unwrap_or(false) {
            return;
        }

        // A group-specific query restarts the membership clock for the
        // group under probe.
        if query.group != Ipv4Addr::UNSPECIFIED {
            if igmp::is_link_local_scope(query.group) {
                return;
            }
            let millis = iface.timing.group_query_timeout_ms();
            let Some(gidx) = iface.groups.find_or_create(query.group) else {
                log::warn!(
                    "[IGMP] {} [{}]: Group list full -- group ignored",
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
            group.membership_timer = self.evm.add_timer(millis, IgmpEvent::GroupTimeout(ifidx, gidx));
        }
    }

    fn handle_v1_report(&mut self, ifidx: usize, src: Ipv4Addr, group_addr: Ipv4Addr) {
        let Some(gidx) = self.find_group(ifidx, group_addr) else {
            return;
        };
        let iface = &mut self.ifaces[ifidx];

        log::debug!(
            "[IGMP] {} [{}]: received v1 report [group {}]",
            iface.name,
            src,
            group_addr
        );

        // While a v1 host is present, leaves are ignored for this group:
        // v1 hosts leave silently (RFC 9776 Section 8.12).
        let millis = iface.timing.membership_timeout_ms();
        let group = iface.groups.get_mut(gidx);
        group.v1_host_present = true;
        if let Some(handle) = group.v1_timer.take() {
            self.evm.cancel_timer(handle);
        }
        group.v1_timer = self.evm.add_timer(millis, IgmpEvent::V1HostTimeout(ifidx, gidx));

        join_common(&mut self.evm, iface, ifidx, gidx);
    }

    fn join(&mut self, ifidx: usize, group_addr: Ipv4Addr) {
        let Some(gidx) = self.find_group(ifidx, group_addr) else {
            return;
        };
        join_common(&mut self.evm, &mut self.ifaces[ifidx], ifidx, gidx);
    }

    fn leave(&mut self, ifidx: usize, group_addr: Ipv4Addr) {
        let Some(gidx) = self.find_group(ifidx, group_addr) else {
            return;
        };
        leave_common(&mut self.evm, &mut self.ifaces[ifidx], ifidx, gidx);
    }

    /// Group lookup with the link-local refusal and full-table logging
    /// shared by every report path.
    fn find_group(&mut self, ifidx: usize, group_addr: Ipv4Addr) -> Option<usize> {
        if igmp::is_link_local_scope(group_addr) {
            return None;
        }
        let iface = &mut self.ifaces[ifidx];
        let found = iface.groups.find_or_create(group_addr);
        if found.is_none() {
            log::warn!(
                "[IGMP] {} [{}]: Group list full -- group ignored",
                iface.name,
                group_addr
            );
        }
        found
    }
}
