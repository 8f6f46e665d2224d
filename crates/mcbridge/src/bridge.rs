// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge instances, interface activation and the UDP datapath.
//!
//! A bridge instance is one `(family, port)` pair with its multicast group
//! and an ordered interface list. The snoopers drive the two per-interface
//! activation flags through [`BridgeInstance::activate_outbound`] and
//! [`BridgeInstance::deactivate_outbound`]; the forwarder only reads them.
//!
//! The flags are the single point of cross-thread communication. Writes
//! and reads are relaxed atomics: a stale read costs at most one wrongly
//! dropped or forwarded datagram, corrected within the same interval. The
//! group membership setsockopt calls are idempotent behind the flags and
//! safe from any thread.

use crate::config::{BridgeConfig, BridgeIfaceConfig, IfaceConfig};
use crate::evm::EventManager;
use crate::{Family, MAX_PACKET_SIZE};
use mio::Token;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One interface of a bridge instance.
///
/// Immutable after initialization except for the two activation flags.
#[derive(Debug)]
pub struct BridgeInterface {
    pub name: String,
    pub if_index: u32,
    pub mac: [u8; 6],
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub ipv6_ll: Option<Ipv6Addr>,
    pub inbound_config: IfaceConfig,
    pub outbound_config: IfaceConfig,
    socket: UdpSocket,
    inbound_active: AtomicBool,
    outbound_active: AtomicBool,
}

impl BridgeInterface {
    pub fn inbound_active(&self) -> bool {
        self.inbound_active.load(Ordering::Relaxed)
    }

    pub fn outbound_active(&self) -> bool {
        self.outbound_active.load(Ordering::Relaxed)
    }
}

/// A `(family, port)` bridge instance.
#[derive(Debug)]
pub struct BridgeInstance {
    pub family: Family,
    pub port: u16,
    pub group: IpAddr,
    pub interfaces: Vec<BridgeInterface>,
}

/// Bind the UDP socket for one interface of an instance: bound to
/// `ANY:port` on the device, reusable, multicast TTL/hops 1, loopback off,
/// non-blocking. IPv6 sockets are v6-only so the same port can carry both
/// families.
fn bind_socket(cfg: &BridgeConfig, iface: &BridgeIfaceConfig) -> io::Result<UdpSocket> {
    let (domain, bind_addr): (Domain, SocketAddr) = match cfg.family {
        Family::V4 => (
            Domain::IPV4,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, cfg.port)),
        ),
        Family::V6 => (
            Domain::IPV6,
            SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, cfg.port, 0, 0)),
        ),
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.bind_device(Some(iface.name.as_bytes()))?;

    match cfg.family {
        Family::V4 => {
            socket.set_multicast_ttl_v4(1)?;
            socket.set_multicast_if_v4(&iface.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED))?;
            socket.set_multicast_loop_v4(false)?;
        }
        Family::V6 => {
            socket.set_only_v6(true)?;
            socket.set_unicast_hops_v6(1)?;
            socket.set_multicast_hops_v6(1)?;
            socket.set_multicast_if_v6(iface.if_index)?;
            socket.set_multicast_loop_v6(false)?;
        }
    }

    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

impl BridgeInstance {
    /// Bind the sockets and build the instance. Any socket error is
    /// returned and treated as fatal by the caller; nothing has been
    /// activated yet at that point.
    pub fn build(cfg: &BridgeConfig) -> io::Result<Arc<BridgeInstance>> {
        let mut interfaces = Vec::with_capacity(cfg.interfaces.len());
        for iface in &cfg.interfaces {
            let socket = bind_socket(cfg, iface).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("{} bind on {} failed: {}", cfg.family, iface.name, e),
                )
            })?;
            interfaces.push(BridgeInterface {
                name: iface.name.clone(),
                if_index: iface.if_index,
                mac: iface.mac,
                ipv4: iface.ipv4,
                ipv6: iface.ipv6,
                ipv6_ll: iface.ipv6_ll,
                inbound_config: iface.inbound,
                outbound_config: iface.outbound,
                socket,
                inbound_active: AtomicBool::new(false),
                outbound_active: AtomicBool::new(false),
            });
        }

        Ok(Arc::new(BridgeInstance {
            family: cfg.family,
            port: cfg.port,
            group: cfg.group,
            interfaces,
        }))
    }

    /// Build an instance over plain loopback sockets, skipping the
    /// device-bound socket options that need CAP_NET_RAW.
    #[cfg(test)]
    pub(crate) fn for_tests(
        family: Family,
        port: u16,
        group: IpAddr,
        interfaces: Vec<(BridgeIfaceConfig, UdpSocket)>,
    ) -> Arc<BridgeInstance> {
        Arc::new(BridgeInstance {
            family,
            port,
            group,
            interfaces: interfaces
                .into_iter()
                .map(|(iface, socket)| BridgeInterface {
                    name: iface.name,
                    if_index: iface.if_index,
                    mac: iface.mac,
                    ipv4: iface.ipv4,
                    ipv6: iface.ipv6,
                    ipv6_ll: iface.ipv6_ll,
                    inbound_config: iface.inbound,
                    outbound_config: iface.outbound,
                    socket,
                    inbound_active: AtomicBool::new(false),
                    outbound_active: AtomicBool::new(false),
                })
                .collect(),
        })
    }

    /// Activate everything that is not membership-driven: non-dynamic
    /// inbound interfaces join immediately, non-dynamic outbound
    /// interfaces start forwarding immediately. Dynamic outbound
    /// interfaces are left to the snoopers.
    pub fn startup_activate(&self) {
        for idx in 0..self.interfaces.len() {
            if self.interfaces[idx].inbound_config != IfaceConfig::Dynamic {
                self.activate_inbound(idx);
            }
            if self.interfaces[idx].outbound_config != IfaceConfig::Dynamic
                && self.interfaces[idx].outbound_config != IfaceConfig::None
            {
                self.activate_outbound(idx);
            }
        }
    }

    /// Join the instance group on the interface socket and mark it
    /// inbound-active. No-op when already active. A failed join is logged
    /// and the flag set regardless; the next activation cycle retries.
    fn activate_inbound(&self, idx: usize) {
        let iface = &self.interfaces[idx];
        if iface.inbound_active() {
            return;
        }

        log::info!(
            "[Bridge] {}/{}: Activating inbound interface {} ({})",
            self.family,
            self.port,
            iface.name,
            iface.inbound_config
        );

        let result = match self.group {
            IpAddr::V4(group) => iface
                .socket
                .join_multicast_v4(&group, &iface.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED)),
            IpAddr::V6(group) => iface.socket.join_multicast_v6(&group, iface.if_index),
        };
        if let Err(e) = result {
            log::error!(
                "[Bridge] {}/{}: join of {} on interface {} failed: {}",
                self.family,
                self.port,
                self.group,
                iface.name,
                e
            );
        }

        iface.inbound_active.store(true, Ordering::Relaxed);
    }

    /// Drop the instance group from the interface socket and mark it
    /// inbound-inactive. No-op when inactive; refuses (with a log) to
    /// deactivate anything but a dynamic interface.
    fn deactivate_inbound(&self, idx: usize) {
        let iface = &self.interfaces[idx];
        if !iface.inbound_active() {
            return;
        }
        if iface.inbound_config != IfaceConfig::Dynamic {
            log::warn!(
                "[Bridge] {}/{}: Deactivating non-dynamic inbound interface {}",
                self.family,
                self.port,
                iface.name
            );
            return;
        }

        log::info!(
            "[Bridge] {}/{}: Deactivating inbound interface {}",
            self.family,
            self.port,
            iface.name
        );

        let result = match self.group {
            IpAddr::V4(group) => iface
                .socket
                .leave_multicast_v4(&group, &iface.ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED)),
            IpAddr::V6(group) => iface.socket.leave_multicast_v6(&group, iface.if_index),
        };
        if let Err(e) = result {
            log::error!(
                "[Bridge] {}/{}: leave of {} on interface {} failed: {}",
                self.family,
                self.port,
                self.group,
                iface.name,
                e
            );
        }

        iface.inbound_active.store(false, Ordering::Relaxed);
    }

    /// Mark an interface outbound-active and bring up the dynamic inbound
    /// side of every peer. No-op when already active; idempotent.
    pub fn activate_outbound(&self, idx: usize) {
        let iface = &self.interfaces[idx];
        if iface.outbound_active() {
            return;
        }

        log::info!(
            "[Bridge] {}/{}: Activating outbound interface {} ({})",
            self.family,
            self.port,
            iface.name,
            iface.outbound_config
        );

        iface.outbound_active.store(true, Ordering::Relaxed);

        for peer_idx in 0..self.interfaces.len() {
            if peer_idx == idx {
                continue;
            }
            if self.interfaces[peer_idx].inbound_config == IfaceConfig::Dynamic {
                self.activate_inbound(peer_idx);
            }
        }
    }

    /// Mark a dynamic interface outbound-inactive and drop the inbound
    /// side of every dynamic peer that no longer feeds any active output.
    /// Static and forced outputs never revoke.
    pub fn deactivate_outbound(&self, idx: usize) {
        let iface = &self.interfaces[idx];
        if !iface.outbound_active() {
            return;
        }
        if iface.outbound_config != IfaceConfig::Dynamic {
            log::warn!(
                "[Bridge] {}/{}: Deactivating non-dynamic outbound interface {}",
                self.family,
                self.port,
                iface.name
            );
            return;
        }

        log::info!(
            "[Bridge] {}/{}: Deactivating outbound interface {}",
            self.family,
            self.port,
            iface.name
        );

        iface.outbound_active.store(false, Ordering::Relaxed);

        for peer_idx in 0..self.interfaces.len() {
            if peer_idx == idx
                || self.interfaces[peer_idx].inbound_config != IfaceConfig::Dynamic
            {
                continue;
            }

            let feeds_active_output = self
                .interfaces
                .iter()
                .enumerate()
                .any(|(other, o)| other != peer_idx && o.outbound_active());
            if !feeds_active_output {
                self.deactivate_inbound(peer_idx);
            }
        }
    }

    /// Destination address for datagrams sent out of interface `idx`.
    fn dst_addr(&self, idx: usize) -> SocketAddr {
        match self.group {
            IpAddr::V4(group) => SocketAddr::V4(SocketAddrV4::new(group, self.port)),
            IpAddr::V6(group) => SocketAddr::V6(SocketAddrV6::new(
                group,
                self.port,
                0,
                self.interfaces[idx].if_index,
            )),
        }
    }

    /// Indexes of the interfaces a datagram received on `from` fans out
    /// to: every other interface that is currently outbound-active.
    fn fanout_peers(&self, from: usize) -> impl Iterator<Item = usize> + '_ {
        self.interfaces
            .iter()
            .enumerate()
            .filter(move |(idx, iface)| *idx != from && iface.outbound_active())
            .map(|(idx, _)| idx)
    }
}

/// The per-instance datapath worker.
///
/// Owns its scratch buffer; readiness tokens map one-to-one onto the
/// instance's interface indexes.
pub struct Forwarder {
    instance: Arc<BridgeInstance>,
    evm: EventManager<()>,
    scratch: Box<[u8]>,
}

impl Forwarder {
    pub fn new(instance: Arc<BridgeInstance>) -> io::Result<Forwarder> {
        let mut evm = EventManager::new(instance.interfaces.len(), 0)?;
        for iface in &instance.interfaces {
            evm.add_socket(iface.socket.as_raw_fd())?;
        }
        Ok(Forwarder {
            instance,
            evm,
            scratch: vec![0u8; MAX_PACKET_SIZE].into_boxed_slice(),
        })
    }

    /// Run the fan-out loop forever.
    pub fn run(mut self) -> ! {
        let mut ready: Vec<Token> = Vec::new();
        let mut expired: Vec<()> = Vec::new();

        loop {
            if let Err(e) = self.evm.wait(&mut ready, &mut expired) {
                log::error!(
                    "[Bridge] {}/{}: poll error: {}",
                    self.instance.family,
                    self.instance.port,
                    e
                );
                continue;
            }
            for token in &ready {
                self.service(token.0);
            }
        }
    }

    /// Drain one interface socket, fanning each datagram out to every
    /// other outbound-active interface.
    fn service(&mut self, idx: usize) {
        let instance = &self.instance;
        let iface = &instance.interfaces[idx];

        loop {
            let (len, src) = match iface.socket.recv_from(&mut self.scratch) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::error!(
                        "[Bridge] {}/{}: recv_from error on interface {}: {}",
                        instance.family,
                        instance.port,
                        iface.name,
                        e
                    );
                    return;
                }
            };

            // The membership-driven gate: nobody downstream wants this.
            if !iface.inbound_active() {
                continue;
            }

            for peer_idx in instance.fanout_peers(idx) {
                let peer = &instance.interfaces[peer_idx];
                let dst = instance.dst_addr(peer_idx);
                if let Err(e) = peer.socket.send_to(&self.scratch[..len], dst) {
                    log::error!(
                        "[Bridge] {}/{}: send_to error on interface {}: {}",
                        instance.family,
                        instance.port,
                        peer.name,
                        e
                    );
                    continue;
                }
                log::trace!(
                    "[Bridge] {}/{}: Forwarded {} bytes from {} on {} to {}",
                    instance.family,
                    instance.port,
                    len,
                    src,
                    iface.name,
                    peer.name
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface_cfg(name: &str, inbound: IfaceConfig, outbound: IfaceConfig) -> BridgeIfaceConfig {
        BridgeIfaceConfig {
            name: name.to_string(),
            if_index: 1,
            mac: [2, 0, 0, 0, 0, 1],
            ipv4: Some(Ipv4Addr::new(127, 0, 0, 1)),
            ipv6: None,
            ipv6_ll: None,
            inbound,
            outbound,
        }
    }

    fn loopback_socket() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        socket
    }

    /// Two interfaces: A inbound-dynamic, B outbound-dynamic, on group
    /// 239.0.75.0 port 7500.
    fn two_iface_instance() -> Arc<BridgeInstance> {
        BridgeInstance::for_tests(
            Family::V4,
            7500,
            "239.0.75.0".parse().unwrap(),
            vec![
                (iface_cfg("a", IfaceConfig::Dynamic, IfaceConfig::None), loopback_socket()),
                (iface_cfg("b", IfaceConfig::None, IfaceConfig::Dynamic), loopback_socket()),
            ],
        )
    }

    #[test]
    fn activation_cascades_to_dynamic_inbound() {
        let instance = two_iface_instance();
        instance.activate_outbound(1);
        assert!(instance.interfaces[1].outbound_active());
        assert!(instance.interfaces[0].inbound_active());
    }

    #[test]
    fn activate_is_idempotent() {
        let instance = two_iface_instance();
        for _ in 0..3 {
            instance.activate_outbound(1);
        }
        assert!(instance.interfaces[1].outbound_active());
        assert!(instance.interfaces[0].inbound_active());

        for _ in 0..3 {
            instance.deactivate_outbound(1);
        }
        assert!(!instance.interfaces[1].outbound_active());
        assert!(!instance.interfaces[0].inbound_active());
    }

    #[test]
    fn inbound_drops_only_when_no_output_remains() {
        let instance = BridgeInstance::for_tests(
            Family::V4,
            7500,
            "239.0.75.0".parse().unwrap(),
            vec![
                (iface_cfg("a", IfaceConfig::Dynamic, IfaceConfig::None), loopback_socket()),
                (iface_cfg("b", IfaceConfig::None, IfaceConfig::Dynamic), loopback_socket()),
                (iface_cfg("c", IfaceConfig::None, IfaceConfig::Dynamic), loopback_socket()),
            ],
        );

        instance.activate_outbound(1);
        instance.activate_outbound(2);
        assert!(instance.interfaces[0].inbound_active());

        instance.deactivate_outbound(1);
        // c still forwards, so a keeps its membership
        assert!(instance.interfaces[0].inbound_active());

        instance.deactivate_outbound(2);
        assert!(!instance.interfaces[0].inbound_active());
    }

    #[test]
    fn static_outbound_never_revokes() {
        let instance = BridgeInstance::for_tests(
            Family::V4,
            7500,
            "239.0.75.0".parse().unwrap(),
            vec![
                (iface_cfg("a", IfaceConfig::Forced, IfaceConfig::None), loopback_socket()),
                (iface_cfg("b", IfaceConfig::None, IfaceConfig::Static), loopback_socket()),
            ],
        );

        instance.startup_activate();
        assert!(instance.interfaces[1].outbound_active());
        assert!(instance.interfaces[0].inbound_active());

        instance.deactivate_outbound(1);
        assert!(instance.interfaces[1].outbound_active(), "static output revoked");
        assert!(instance.interfaces[0].inbound_active(), "forced inbound revoked");
    }

    #[test]
    fn fanout_skips_source_and_inactive() {
        let instance = BridgeInstance::for_tests(
            Family::V4,
            7500,
            "239.0.75.0".parse().unwrap(),
            vec![
                (iface_cfg("a", IfaceConfig::Dynamic, IfaceConfig::Dynamic), loopback_socket()),
                (iface_cfg("b", IfaceConfig::None, IfaceConfig::Dynamic), loopback_socket()),
                (iface_cfg("c", IfaceConfig::None, IfaceConfig::Dynamic), loopback_socket()),
            ],
        );

        instance.activate_outbound(0);
        instance.activate_outbound(2);
        let peers: Vec<usize> = instance.fanout_peers(0).collect();
        assert_eq!(peers, vec![2]);

        instance.activate_outbound(1);
        let peers: Vec<usize> = instance.fanout_peers(0).collect();
        assert_eq!(peers, vec![1, 2]);
    }

    #[test]
    fn dst_addr_carries_scope_id_for_v6() {
        let mut cfg = iface_cfg("a", IfaceConfig::Dynamic, IfaceConfig::None);
        cfg.if_index = 7;
        let instance = BridgeInstance::for_tests(
            Family::V6,
            7500,
            "ff05::7500".parse().unwrap(),
            vec![(cfg, loopback_socket())],
        );
        match instance.dst_addr(0) {
            SocketAddr::V6(addr) => {
                assert_eq!(addr.scope_id(), 7);
                assert_eq!(addr.port(), 7500);
            }
            other => panic!("unexpected address {:?}", other),
        }
    }
}
