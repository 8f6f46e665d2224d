// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The multicast bridge daemon.
//!
//! Reads the bridge configuration, binds the datapath sockets, registers
//! the dynamic outbound interfaces with the family snoopers and spawns
//! the worker threads: one IGMP snooper, one MLD snooper and one
//! forwarder per bridge instance.
//!
//! # Usage
//!
//! ```bash
//! # Foreground with activation logging
//! mcbridged -f -D 1 -c /etc/mcast-bridge.conf
//!
//! # Daemonized, syslog, pid file
//! mcbridged -s -c /etc/mcast-bridge.conf -p /run/mcbridged.pid
//!
//! # Never become the IGMP querier, defer the MLD one
//! mcbridged -I never -M defer -c mcast-bridge.conf
//! ```

mod logger;

use clap::Parser;
use mcbridge::bridge::{BridgeInstance, Forwarder};
use mcbridge::config::{self, BridgeConfig, IfaceConfig, DEFAULT_DYNAMIC_GROUPS};
use mcbridge::snoop::igmp::IgmpSnooperBuilder;
use mcbridge::snoop::mld::MldSnooperBuilder;
use mcbridge::snoop::QuerierMode;
use mcbridge::{netif, Family};
use std::ffi::CString;
use std::io::{Read, Seek, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// IGMP/MLD snooping multicast bridge
#[derive(Parser, Debug)]
#[command(name = "mcbridged")]
#[command(about = "Bridge multicast UDP between isolated layer-2 segments")]
#[command(version)]
#[command(after_help = "\
Querier modes:
  never  Never become a querier
  quick  Become a querier immediately at startup (default, RFC behavior)
  delay  Become a querier after 125 seconds if no other querier has been seen
  defer  Become a querier after 125 seconds if no other querier has been seen,
         and always defer to any other queriers that may appear regardless of
         relative IP address")]
struct Args {
    /// Run in foreground
    #[arg(short = 'f')]
    foreground: bool,

    /// Log notifications via syslog
    #[arg(short = 's')]
    syslog: bool,

    /// Configuration file name
    #[arg(short = 'c', default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Process id file name
    #[arg(short = 'p')]
    pidfile: Option<PathBuf>,

    /// IGMP querier mode (never|quick|delay|defer)
    #[arg(short = 'I', default_value = "quick", value_parser = parse_querier_mode)]
    igmp_mode: QuerierMode,

    /// MLD querier mode (never|quick|delay|defer)
    #[arg(short = 'M', default_value = "quick", value_parser = parse_querier_mode)]
    mld_mode: QuerierMode,

    /// Debug level 0..4
    #[arg(short = 'D', default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=4))]
    debug_level: u8,
}

fn parse_querier_mode(s: &str) -> Result<QuerierMode, String> {
    s.parse()
}

/// Fatal startup error: report and exit. Nothing to unwind at this
/// point, the workers are not running yet.
fn fatal(msg: impl std::fmt::Display) -> ! {
    eprintln!("{}", msg);
    exit(1);
}

/// Pidfile path for the signal handler, set once before the handler is
/// installed.
static PIDFILE_PATH: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());

/// Termination handler: remove the pidfile and exit. Restricted to
/// async-signal-safe calls.
extern "C" fn term_handler(signum: libc::c_int) {
    let path = PIDFILE_PATH.load(Ordering::Relaxed);
    if !path.is_null() {
        // SAFETY: the pointer was leaked from a valid CString.
        unsafe {
            libc::unlink(path);
        }
    }
    // SAFETY: _exit is async-signal-safe.
    unsafe {
        libc::_exit(128 + signum);
    }
}

fn install_signal_handlers() {
    // SAFETY: zeroed sigaction with a valid handler function.
    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = term_handler as extern "C" fn(libc::c_int) as usize;
        libc::sigaction(libc::SIGTERM, &act, std::ptr::null_mut());
        libc::sigaction(libc::SIGINT, &act, std::ptr::null_mut());
    }
}

/// Create and exclusively lock the pidfile. An existing file is
/// reclaimed when unlocked and its recorded pid is dead. The pid itself
/// is written after daemonizing, when it is final.
fn create_pidfile(path: &PathBuf) -> std::fs::File {
    let file = match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(_) => {
            // The file exists; take it over if its owner is gone.
            let mut file = match std::fs::OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => file,
                Err(e) => fatal(format!("create/open of pid file {} failed: {}", path.display(), e)),
            };

            // SAFETY: flock on a descriptor we own.
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
                fatal(format!("pid file {} is in use by another process", path.display()));
            }

            let mut contents = String::new();
            if file.read_to_string(&mut contents).is_ok() {
                if let Ok(pid) = contents.trim().parse::<i32>() {
                    // SAFETY: signal 0 only checks for existence.
                    if pid > 0 && unsafe { libc::kill(pid, 0) } == 0 {
                        fatal(format!("pid file {} is in use by process {}", path.display(), pid));
                    }
                }
            }

            if file.rewind().is_err() || file.set_len(0).is_err() {
                fatal(format!("reset of pid file {} failed", path.display()));
            }
            return file;
        }
    };

    // SAFETY: flock on a descriptor we own.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
        fatal(format!("lock of pid file {} failed", path.display()));
    }
    file
}

fn write_pidfile(mut file: std::fs::File, path: &PathBuf) {
    if let Err(e) = writeln!(file, "{}", std::process::id()) {
        fatal(format!("write of pid file {} failed: {}", path.display(), e));
    }
    // The descriptor stays open for the life of the process to hold the
    // flock; leak it deliberately.
    std::mem::forget(file);
}

/// Print the resolved bridge configuration.
fn dump_config(configs: &[BridgeConfig]) {
    println!("Bridges:");
    for cfg in configs {
        println!("  {} port {} group {}", cfg.family, cfg.port, cfg.group);
        for iface in &cfg.interfaces {
            println!(
                "    {} (in: {}, out: {})",
                iface.name, iface.inbound, iface.outbound
            );
        }
    }
}

fn main() {
    let args = Args::parse();

    logger::init(args.syslog, args.foreground, args.debug_level);

    // Resolve the configuration against the live interfaces.
    let interfaces = match netif::enumerate() {
        Ok(interfaces) => interfaces,
        Err(e) => fatal(format!("interface enumeration failed: {}", e)),
    };
    let configs = match config::load_config(&args.config, &interfaces) {
        Ok(configs) => configs,
        Err(e) => fatal(e),
    };

    // Bind the datapath sockets.
    let instances: Vec<Arc<BridgeInstance>> = configs
        .iter()
        .map(|cfg| BridgeInstance::build(cfg).unwrap_or_else(|e| fatal(e)))
        .collect();

    // Register dynamic outbound interfaces with the snoopers, bring up
    // everything that is not membership-driven.
    let mut igmp = IgmpSnooperBuilder::new(args.igmp_mode, DEFAULT_DYNAMIC_GROUPS);
    let mut mld = MldSnooperBuilder::new(args.mld_mode, DEFAULT_DYNAMIC_GROUPS);
    for instance in &instances {
        for idx in 0..instance.interfaces.len() {
            if instance.interfaces[idx].outbound_config == IfaceConfig::Dynamic {
                match instance.family {
                    Family::V4 => igmp.register(instance, idx),
                    Family::V6 => mld.register(instance, idx),
                }
            }
        }
        instance.startup_activate();
    }

    if args.foreground {
        dump_config(&configs);
        if !igmp.is_empty() {
            igmp.dump_config();
        }
        if !mld.is_empty() {
            mld.dump_config();
        }
    }

    // Open the capture sockets before daemonizing so resource failures
    // still reach the invoking terminal.
    let igmp_snooper = igmp.build().unwrap_or_else(|e| fatal(format!("IGMP setup failed: {}", e)));
    let mld_snooper = mld.build().unwrap_or_else(|e| fatal(format!("MLD setup failed: {}", e)));

    install_signal_handlers();

    let pidfile = args.pidfile.as_ref().map(|path| {
        let file = create_pidfile(path);
        let cpath = CString::new(path.to_string_lossy().as_bytes())
            .unwrap_or_else(|_| fatal("invalid pid file path"));
        PIDFILE_PATH.store(cpath.into_raw(), Ordering::Relaxed);
        file
    });

    if !args.foreground {
        if let Err(e) = nix::unistd::daemon(false, false) {
            fatal(format!("daemonize failed: {}", e));
        }
    }

    if let (Some(file), Some(path)) = (pidfile, args.pidfile.as_ref()) {
        write_pidfile(file, path);
    }

    // Spawn the workers. Threads run forever; termination is
    // process-global on signal.
    if let Some(snooper) = igmp_snooper {
        std::thread::Builder::new()
            .name("mcb-igmp".to_string())
            .spawn(move || snooper.run())
            .unwrap_or_else(|e| fatal(format!("cannot create IGMP thread: {}", e)));
    }
    if let Some(snooper) = mld_snooper {
        std::thread::Builder::new()
            .name("mcb-mld".to_string())
            .spawn(move || snooper.run())
            .unwrap_or_else(|e| fatal(format!("cannot create MLD thread: {}", e)));
    }
    for instance in &instances {
        let forwarder = Forwarder::new(instance.clone())
            .unwrap_or_else(|e| fatal(format!("cannot create forwarder: {}", e)));
        let name = format!("mcb-{}-{}", instance.family, instance.port);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || forwarder.run())
            .unwrap_or_else(|e| fatal(format!("cannot create bridge thread: {}", e)));
    }

    loop {
        std::thread::park();
    }
}
