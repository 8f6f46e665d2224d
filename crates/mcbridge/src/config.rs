// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge configuration.
//!
//! INI-style file: each section header is a UDP port, keys inside define
//! the group addresses and the interface lists. Parsing is split from
//! interface resolution — the parser works on text and a caller-supplied
//! interface snapshot, so the grammar is testable without live NICs.
//!
//! ```text
//! # fire alarm panel feed
//! [7500]
//! ipv4-address = 239.0.75.0
//! inbound-interfaces = eth0
//! outbound-interfaces = eth1, eth2
//! ```
//!
//! A section carrying both an `ipv4-address` and an `ipv6-address` yields
//! two independent bridge instances on the same port.

use crate::netif::NetInterface;
use crate::Family;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use thiserror::Error;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "mcast-bridge.conf";

/// Default cap on learned (non-configured) groups per snooper interface.
pub const DEFAULT_DYNAMIC_GROUPS: usize = 100;

const KEY_IPV4_ADDRESS: &str = "ipv4-address";
const KEY_IPV6_ADDRESS: &str = "ipv6-address";
const KEY_INBOUND_INTERFACES: &str = "inbound-interfaces";
const KEY_OUTBOUND_INTERFACES: &str = "outbound-interfaces";
const KEY_STATIC_INBOUND_INTERFACES: &str = "static-inbound-interfaces";
const KEY_STATIC_OUTBOUND_INTERFACES: &str = "static-outbound-interfaces";

/// Configuration errors. All of them are fatal before any socket opens.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{file} line {line}: {msg}")]
    Syntax { file: String, line: u32, msg: String },

    #[error("{0}")]
    Invalid(String),
}

/// What an interface is configured for, per direction.
///
/// `Forced` is not written in configuration files: a dynamic inbound
/// interface is promoted to it when the same instance carries a static
/// outbound interface, since traffic toward that output can never be
/// known droppable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfaceConfig {
    #[default]
    None,
    Dynamic,
    Static,
    Forced,
}

impl fmt::Display for IfaceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IfaceConfig::None => write!(f, "none"),
            IfaceConfig::Dynamic => write!(f, "dynamic"),
            IfaceConfig::Static => write!(f, "static"),
            IfaceConfig::Forced => write!(f, "forced"),
        }
    }
}

/// One resolved interface of a bridge instance, before sockets exist.
#[derive(Debug, Clone)]
pub struct BridgeIfaceConfig {
    pub name: String,
    pub if_index: u32,
    pub mac: [u8; 6],
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub ipv6_ll: Option<Ipv6Addr>,
    pub inbound: IfaceConfig,
    pub outbound: IfaceConfig,
}

/// One resolved bridge instance: a `(family, port)` pair, its group and
/// its interfaces.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub family: Family,
    pub port: u16,
    pub group: IpAddr,
    pub interfaces: Vec<BridgeIfaceConfig>,
}

#[derive(Debug)]
struct DraftInterface {
    net: usize, // index into the interface snapshot
    inbound: IfaceConfig,
    outbound: IfaceConfig,
}

#[derive(Debug, Default)]
struct DraftBridge {
    port: u16,
    ipv4_group: Option<Ipv4Addr>,
    ipv6_group: Option<Ipv6Addr>,
    interfaces: Vec<DraftInterface>,
}

/// Load and resolve a configuration file.
pub fn load_config(
    path: &Path,
    interfaces: &[NetInterface],
) -> Result<Vec<BridgeConfig>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Invalid(format!("Unable to open config file \"{}\": {}", path.display(), e))
    })?;
    parse_config(&text, &path.display().to_string(), interfaces)
}

/// Parse and resolve configuration text against an interface snapshot.
pub fn parse_config(
    text: &str,
    filename: &str,
    interfaces: &[NetInterface],
) -> Result<Vec<BridgeConfig>, ConfigError> {
    let syntax = |line: u32, msg: String| ConfigError::Syntax {
        file: filename.to_string(),
        line,
        msg,
    };

    let mut bridges: Vec<BridgeConfig> = Vec::new();
    let mut draft: Option<DraftBridge> = None;

    let mut lineno = 0u32;
    for raw_line in text.lines() {
        lineno += 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(section) = line.strip_prefix('[') {
            // Finish the previous section.
            if let Some(done) = draft.take() {
                finish_draft(done, interfaces, &mut bridges)?;
            }

            let section = section
                .strip_suffix(']')
                .ok_or_else(|| syntax(lineno, "Syntax error".into()))?
                .trim();
            let port = section
                .parse::<u32>()
                .ok()
                .filter(|p| (1..=65535).contains(p))
                .ok_or_else(|| syntax(lineno, "Invalid port number".into()))?;

            draft = Some(DraftBridge { port: port as u16, ..DraftBridge::default() });
            continue;
        }

        let bridge = draft
            .as_mut()
            .ok_or_else(|| syntax(lineno, "Syntax error - value outside of a section".into()))?;

        let (key, value) = split_keyvalue(line)
            .map_err(|msg| syntax(lineno, msg))?;

        match key {
            KEY_IPV4_ADDRESS => {
                let addr: Ipv4Addr = value.parse().map_err(|_| {
                    syntax(lineno, format!("Invalid IPv4 address \"{}\"", value))
                })?;
                if !addr.is_multicast() {
                    return Err(syntax(
                        lineno,
                        format!("Invalid IPv4 multicast group address \"{}\"", value),
                    ));
                }
                if crate::packet::igmp::is_link_local_scope(addr) {
                    return Err(syntax(
                        lineno,
                        format!(
                            "Multicast group address \"{}\" is link local (224.0.0.0/24) and cannot be bridged",
                            value
                        ),
                    ));
                }
                bridge.ipv4_group = Some(addr);
            }
            KEY_IPV6_ADDRESS => {
                let addr: Ipv6Addr = value.parse().map_err(|_| {
                    syntax(lineno, format!("Invalid IPv6 address \"{}\"", value))
                })?;
                if !addr.is_multicast() {
                    return Err(syntax(
                        lineno,
                        format!("Invalid IPv6 multicast group address \"{}\"", value),
                    ));
                }
                if crate::packet::mld::is_link_local_scope(&addr) {
                    return Err(syntax(
                        lineno,
                        format!(
                            "Multicast group address \"{}\" is link local (ff02::/16) and cannot be bridged",
                            value
                        ),
                    ));
                }
                bridge.ipv6_group = Some(addr);
            }
            KEY_INBOUND_INTERFACES => {
                for name in split_comma_list(value).map_err(|msg| syntax(lineno, msg))? {
                    let idx = add_draft_interface(bridge, name, interfaces, filename, lineno)?;
                    let iface = &mut bridge.interfaces[idx];
                    if iface.inbound != IfaceConfig::Static {
                        iface.inbound = IfaceConfig::Dynamic;
                    }
                }
            }
            KEY_OUTBOUND_INTERFACES => {
                for name in split_comma_list(value).map_err(|msg| syntax(lineno, msg))? {
                    let idx = add_draft_interface(bridge, name, interfaces, filename, lineno)?;
                    let iface = &mut bridge.interfaces[idx];
                    if iface.outbound != IfaceConfig::Static {
                        iface.outbound = IfaceConfig::Dynamic;
                    }
                }
            }
            KEY_STATIC_INBOUND_INTERFACES => {
                for name in split_comma_list(value).map_err(|msg| syntax(lineno, msg))? {
                    let idx = add_draft_interface(bridge, name, interfaces, filename, lineno)?;
                    bridge.interfaces[idx].inbound = IfaceConfig::Static;
                }
            }
            KEY_STATIC_OUTBOUND_INTERFACES => {
                for name in split_comma_list(value).map_err(|msg| syntax(lineno, msg))? {
                    let idx = add_draft_interface(bridge, name, interfaces, filename, lineno)?;
                    bridge.interfaces[idx].outbound = IfaceConfig::Static;
                }
            }
            unknown => {
                return Err(syntax(lineno, format!("Unknown parameter \"{}\"", unknown)));
            }
        }
    }

    if let Some(done) = draft.take() {
        finish_draft(done, interfaces, &mut bridges)?;
    }

    if bridges.is_empty() {
        return Err(ConfigError::Invalid(format!("{}: No port bridges defined", filename)));
    }

    Ok(bridges)
}

fn split_keyvalue(line: &str) -> Result<(&str, &str), String> {
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| "Syntax error - missing assignment".to_string())?;
    let value = value.trim();
    if value.is_empty() {
        return Err("Syntax error - missing value".to_string());
    }
    Ok((key.trim(), value))
}

fn split_comma_list(value: &str) -> Result<Vec<&str>, String> {
    let mut elements = Vec::new();
    for element in value.split(',') {
        let element = element.trim();
        if element.is_empty() {
            return Err("Invalid list - empty element".to_string());
        }
        elements.push(element);
    }
    Ok(elements)
}

/// Look up `name` in the snapshot and add it to the draft if new,
/// validating that it is usable for bridging.
fn add_draft_interface(
    bridge: &mut DraftBridge,
    name: &str,
    interfaces: &[NetInterface],
    filename: &str,
    lineno: u32,
) -> Result<usize, ConfigError> {
    let syntax = |msg: String| ConfigError::Syntax {
        file: filename.to_string(),
        line: lineno,
        msg,
    };

    let net = interfaces
        .iter()
        .position(|i| i.name == name)
        .ok_or_else(|| syntax(format!("Interface \"{}\" does not exist", name)))?;

    if let Some(existing) = bridge.interfaces.iter().position(|i| i.net == net) {
        return Ok(existing);
    }

    let info = &interfaces[net];
    if !info.up {
        return Err(syntax(format!("Interface \"{}\" is not up", name)));
    }
    if !info.multicast {
        return Err(syntax(format!("Interface \"{}\" does not support multicast", name)));
    }
    if info.ipv4.is_none() && info.ipv6.is_none() {
        return Err(syntax(format!("Interface \"{}\" does not have an IP address", name)));
    }

    bridge.interfaces.push(DraftInterface {
        net,
        inbound: IfaceConfig::None,
        outbound: IfaceConfig::None,
    });
    Ok(bridge.interfaces.len() - 1)
}

/// Validate a finished section and emit its per-family bridge instances.
fn finish_draft(
    draft: DraftBridge,
    interfaces: &[NetInterface],
    bridges: &mut Vec<BridgeConfig>,
) -> Result<(), ConfigError> {
    if draft.ipv4_group.is_none() && draft.ipv6_group.is_none() {
        return Err(ConfigError::Invalid(format!(
            "Bridge {} does not have a multicast group address",
            draft.port
        )));
    }

    let inbound: Vec<&DraftInterface> = draft
        .interfaces
        .iter()
        .filter(|i| i.inbound != IfaceConfig::None)
        .collect();
    let outbound: Vec<&DraftInterface> = draft
        .interfaces
        .iter()
        .filter(|i| i.outbound != IfaceConfig::None)
        .collect();

    if inbound.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "Bridge {} does not have any inbound interfaces",
            draft.port
        )));
    }
    if outbound.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "Bridge {} does not have any outbound interfaces",
            draft.port
        )));
    }

    // A single inbound interface must not be the single path out as well;
    // bridging an interface onto itself only duplicates packets.
    if let [only] = inbound.as_slice() {
        if only.outbound != IfaceConfig::None {
            return Err(ConfigError::Invalid(format!(
                "Bridge {} has a single inbound interface ({}) which is also declared as an outbound interface",
                draft.port, interfaces[only.net].name
            )));
        }
    }
    if let [only] = outbound.as_slice() {
        if only.inbound != IfaceConfig::None {
            return Err(ConfigError::Invalid(format!(
                "Bridge {} has a single outbound interface ({}) which is also declared as an inbound interface",
                draft.port, interfaces[only.net].name
            )));
        }
    }

    if let Some(group) = draft.ipv4_group {
        add_family_bridge(
            &draft,
            interfaces,
            Family::V4,
            IpAddr::V4(group),
            bridges,
        )?;
    }
    if let Some(group) = draft.ipv6_group {
        add_family_bridge(
            &draft,
            interfaces,
            Family::V6,
            IpAddr::V6(group),
            bridges,
        )?;
    }

    Ok(())
}

fn add_family_bridge(
    draft: &DraftBridge,
    interfaces: &[NetInterface],
    family: Family,
    group: IpAddr,
    bridges: &mut Vec<BridgeConfig>,
) -> Result<(), ConfigError> {
    let has_family_addr = |i: &DraftInterface| match family {
        Family::V4 => interfaces[i.net].ipv4.is_some(),
        Family::V6 => interfaces[i.net].ipv6.is_some(),
    };

    let inbound: Vec<&DraftInterface> = draft
        .interfaces
        .iter()
        .filter(|i| i.inbound != IfaceConfig::None && has_family_addr(i))
        .collect();
    let outbound: Vec<&DraftInterface> = draft
        .interfaces
        .iter()
        .filter(|i| i.outbound != IfaceConfig::None && has_family_addr(i))
        .collect();

    if inbound.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "Bridge {} has an {} multicast group address, but does not have an {} enabled inbound interface",
            draft.port, family, family
        )));
    }
    if outbound.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "Bridge {} has an {} multicast group address, but does not have an {} enabled outbound interface",
            draft.port, family, family
        )));
    }
    if let ([i], [o]) = (inbound.as_slice(), outbound.as_slice()) {
        if i.net == o.net {
            return Err(ConfigError::Invalid(format!(
                "Bridge {} has an {} multicast group address, but has only one {} enabled interface ({})",
                draft.port,
                family,
                family,
                interfaces[i.net].name
            )));
        }
    }

    let mut members: Vec<BridgeIfaceConfig> = draft
        .interfaces
        .iter()
        .filter(|i| has_family_addr(i))
        .map(|i| {
            let info = &interfaces[i.net];
            BridgeIfaceConfig {
                name: info.name.clone(),
                if_index: info.index,
                mac: info.mac,
                ipv4: info.ipv4,
                ipv6: info.ipv6,
                ipv6_ll: info.ipv6_ll,
                inbound: i.inbound,
                outbound: i.outbound,
            }
        })
        .collect();

    // A static outbound interface forces every other dynamic inbound to
    // stay joined for the life of the process: we can never learn whether
    // traffic toward the static output could be dropped.
    let has_static_outbound = members.iter().any(|m| m.outbound == IfaceConfig::Static);
    if has_static_outbound {
        for member in &mut members {
            if member.inbound == IfaceConfig::Dynamic {
                member.inbound = IfaceConfig::Forced;
            }
        }
    }

    bridges.push(BridgeConfig { family, port: draft.port, group, interfaces: members });
    Ok(())
}
