// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast send/receive test utility.
//!
//! Hand tool for exercising a running bridge: in receive mode it joins
//! the group on an interface and prints every datagram; in send mode it
//! turns stdin lines into datagrams toward the group.
//!
//! ```bash
//! # Listen on eth1 for the default IPv4 group
//! mcast-sr -i eth1
//!
//! # Send to an IPv6 group from eth0
//! mcast-sr -6 -s -i eth0 -p 7500 ff05::7500
//! ```

use clap::Parser;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::BufRead;
use std::net::{
    IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket,
};
use std::process::exit;

const DEFAULT_IPV4_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 75, 0);
const DEFAULT_IPV6_GROUP: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 0x7500);
const DEFAULT_PORT: u16 = 7500;

/// Multicast send/receive tool
#[derive(Parser, Debug)]
#[command(name = "mcast-sr")]
#[command(about = "Send or receive multicast datagrams for a (group, port)")]
#[command(version)]
struct Args {
    /// Use IPv4 (default)
    #[arg(short = '4', conflicts_with = "ipv6")]
    ipv4: bool,

    /// Use IPv6
    #[arg(short = '6')]
    ipv6: bool,

    /// Sender mode (default is receive)
    #[arg(short = 's')]
    send: bool,

    /// Interface name (default is the system default interface)
    #[arg(short = 'i')]
    interface: Option<String>,

    /// UDP port
    #[arg(short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Multicast group address (defaults to 239.0.75.0 / ff05::7500)
    group: Option<IpAddr>,
}

fn fatal(msg: impl std::fmt::Display) -> ! {
    eprintln!("{}", msg);
    exit(1);
}

fn bind_socket(
    group: &SocketAddr,
    interface: Option<(&str, u32)>,
    join: bool,
) -> std::io::Result<UdpSocket> {
    let domain = match group {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;

    if let Some((name, index)) = interface {
        // Egress follows the device binding; IPv6 additionally wants the
        // multicast interface index.
        socket.bind_device(Some(name.as_bytes()))?;
        if let SocketAddr::V6(_) = group {
            socket.set_multicast_if_v6(index)?;
        }
    }

    match group {
        SocketAddr::V4(addr) => {
            socket.set_multicast_ttl_v4(1)?;
            socket.bind(&SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, addr.port())).into())?;
        }
        SocketAddr::V6(addr) => {
            socket.set_only_v6(true)?;
            socket.set_multicast_hops_v6(1)?;
            socket.bind(
                &SocketAddr::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, addr.port(), 0, 0))
                    .into(),
            )?;
        }
    }

    if join {
        let index = interface.map(|(_, index)| index).unwrap_or(0);
        match group {
            SocketAddr::V4(addr) => socket.join_multicast_v4(addr.ip(), &Ipv4Addr::UNSPECIFIED)?,
            SocketAddr::V6(addr) => socket.join_multicast_v6(addr.ip(), index)?,
        }
    }

    Ok(socket.into())
}

fn sender(socket: &UdpSocket, group: SocketAddr) -> ! {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => fatal(format!("read error: {}", e)),
        };
        if let Err(e) = socket.send_to(line.as_bytes(), group) {
            fatal(format!("sendto error: {}", e));
        }
    }
    exit(0);
}

fn receiver(socket: &UdpSocket) -> ! {
    let mut buf = [0u8; 65535];
    loop {
        let (len, src) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) => fatal(format!("recvfrom error: {}", e)),
        };
        let payload = String::from_utf8_lossy(&buf[..len]);
        println!("Received {} bytes from {}: {}", len, src, payload);
    }
}

fn main() {
    let args = Args::parse();

    let interface = args.interface.as_deref().map(|name| {
        let index = nix::net::if_::if_nametoindex(name)
            .unwrap_or_else(|_| fatal(format!("Interface \"{}\" does not exist", name)));
        (name, index)
    });
    let if_index = interface.map(|(_, index)| index).unwrap_or(0);

    let group: SocketAddr = if args.ipv6 {
        let group = match args.group {
            Some(IpAddr::V6(addr)) if addr.is_multicast() => addr,
            Some(addr) => fatal(format!("Invalid IPv6 multicast group address \"{}\"", addr)),
            None => DEFAULT_IPV6_GROUP,
        };
        SocketAddr::V6(SocketAddrV6::new(group, args.port, 0, if_index))
    } else {
        let group = match args.group {
            Some(IpAddr::V4(addr)) if addr.is_multicast() => addr,
            Some(addr) => fatal(format!("Invalid IPv4 multicast group address \"{}\"", addr)),
            None => DEFAULT_IPV4_GROUP,
        };
        SocketAddr::V4(SocketAddrV4::new(group, args.port))
    };

    println!(
        "{} to port {} and multicast group {} on interface {} ({})",
        if args.send { "Sending" } else { "Listening" },
        args.port,
        group.ip(),
        interface.map(|(name, _)| name).unwrap_or("(default)"),
        if_index
    );

    let socket = match bind_socket(&group, interface, !args.send) {
        Ok(socket) => socket,
        Err(e) => fatal(format!("socket setup failed: {}", e)),
    };

    if args.send {
        sender(&socket, group);
    } else {
        receiver(&socket);
    }
}
