// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logging sink for the daemon.
//!
//! Installs a [`log::Log`] implementation behind the `log` facade the
//! library logs through, with two outputs: console (stderr, with a
//! timestamp prefix when running foreground with debugging) and syslog.
//!
//! The `-D` debug level gates records by what they describe rather than
//! by the plain level ordering:
//!
//! | level  | carries                       | shown at |
//! |--------|-------------------------------|----------|
//! | Error  | failures, abnormal events     | always   |
//! | Info   | interface activations         | `-D >= 1`|
//! | Warn   | IGMP/MLD packet issues        | `-D >= 2`|
//! | Debug  | IGMP/MLD send and receive     | `-D >= 3`|
//! | Trace  | per-packet forwarding detail  | `-D >= 4`|

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::ffi::CString;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

enum Output {
    Console,
    Syslog,
}

struct Logger {
    output: Output,
    debug_level: u8,
    foreground: bool,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        match metadata.level() {
            Level::Error => true,
            Level::Info => self.debug_level >= 1,
            Level::Warn => self.debug_level >= 2,
            Level::Debug => self.debug_level >= 3,
            Level::Trace => self.debug_level >= 4,
        }
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        match self.output {
            Output::Console => {
                let stderr = std::io::stderr();
                let mut out = stderr.lock();
                // Timestamp only when someone is watching a debug run.
                if self.foreground && self.debug_level > 0 {
                    if let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) {
                        let _ = write!(out, "{}.{:06}: ", now.as_secs(), now.subsec_micros());
                    }
                }
                let _ = writeln!(out, "{}", record.args());
            }
            Output::Syslog => {
                let priority = match record.level() {
                    Level::Error => libc::LOG_ERR,
                    Level::Warn => libc::LOG_WARNING,
                    Level::Info => libc::LOG_INFO,
                    Level::Debug | Level::Trace => libc::LOG_DEBUG,
                };
                if let Ok(message) = CString::new(record.args().to_string()) {
                    // SAFETY: "%s" with one matching C string argument.
                    unsafe {
                        libc::syslog(priority, b"%s\0".as_ptr().cast(), message.as_ptr());
                    }
                }
            }
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the logger. Called once, before any thread spawns.
pub fn init(syslog: bool, foreground: bool, debug_level: u8) {
    let logger = Logger {
        output: if syslog { Output::Syslog } else { Output::Console },
        debug_level,
        foreground,
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        // Filtering happens in enabled(); let everything through here.
        log::set_max_level(LevelFilter::Trace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(level: Level) -> Metadata<'static> {
        Metadata::builder().level(level).target("test").build()
    }

    #[test]
    fn debug_level_gating() {
        let quiet = Logger { output: Output::Console, debug_level: 0, foreground: false };
        assert!(quiet.enabled(&meta(Level::Error)));
        assert!(!quiet.enabled(&meta(Level::Info)));
        assert!(!quiet.enabled(&meta(Level::Warn)));

        let activations = Logger { output: Output::Console, debug_level: 1, foreground: false };
        assert!(activations.enabled(&meta(Level::Info)));
        assert!(!activations.enabled(&meta(Level::Warn)));

        let full = Logger { output: Output::Console, debug_level: 4, foreground: true };
        assert!(full.enabled(&meta(Level::Trace)));
    }
}
