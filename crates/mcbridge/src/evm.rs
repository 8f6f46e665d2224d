// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded cooperative event manager.
//!
//! A restricted reactor: the socket and timer capacity is fixed at
//! creation so nothing grows afterwards, the only socket event is read
//! readiness, and there is no way to remove a socket. Timer resolution is
//! one millisecond against a monotonic clock.
//!
//! Timers carry a caller-defined `Copy` payload instead of a callback, so
//! the owner dispatches expired events itself. Each armed timer gets an
//! opaque [`TimerHandle`]; cancellation by handle is a silent no-op when
//! the timer has already fired.
//!
//! The poller registers sockets edge-style: a handler woken for a socket
//! must read until `WouldBlock` or it will not be woken again.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Opaque identity of an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

#[derive(Debug)]
struct TimerEntry<T> {
    deadline: Instant,
    handle: TimerHandle,
    payload: T,
}

/// The event manager. `T` is the timer payload type, typically a small
/// event enum owned by the worker.
pub struct EventManager<T> {
    poll: Poll,
    events: Events,
    socket_count: usize,
    max_sockets: usize,
    /// Pending timers in ascending deadline order. The count is expected
    /// to be small, so linear insertion is acceptable.
    timers: Vec<TimerEntry<T>>,
    max_timers: usize,
    next_handle: u64,
}

impl<T: Copy> EventManager<T> {
    /// Create an event manager with fixed socket and timer capacity.
    pub fn new(max_sockets: usize, max_timers: usize) -> io::Result<EventManager<T>> {
        Ok(EventManager {
            poll: Poll::new()?,
            events: Events::with_capacity(max_sockets.max(1)),
            socket_count: 0,
            max_sockets,
            timers: Vec::with_capacity(max_timers),
            max_timers,
            next_handle: 0,
        })
    }

    /// Register a descriptor for read readiness. Returns the token that
    /// [`wait`](Self::wait) reports for it. Registration failure and
    /// capacity overflow are errors; callers treat them as fatal since
    /// registration only happens during initialization.
    pub fn add_socket(&mut self, fd: RawFd) -> io::Result<Token> {
        if self.socket_count >= self.max_sockets {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("socket capacity ({}) exceeded", self.max_sockets),
            ));
        }

        let token = Token(self.socket_count);
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        self.socket_count += 1;
        Ok(token)
    }

    /// Arm a timer `millis` from now. Returns `None` and logs when the
    /// timer capacity is exceeded; the count is only a rough ceiling and a
    /// dropped timer loses at most one protocol beat.
    pub fn add_timer(&mut self, millis: u64, payload: T) -> Option<TimerHandle> {
        if self.timers.len() >= self.max_timers {
            log::warn!("[EVM] timer capacity ({}) exceeded, timer dropped", self.max_timers);
            return None;
        }

        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        let deadline = Instant::now() + Duration::from_millis(millis);

        let index = self
            .timers
            .iter()
            .position(|t| deadline < t.deadline)
            .unwrap_or(self.timers.len());
        self.timers.insert(index, TimerEntry { deadline, handle, payload });
        Some(handle)
    }

    /// Cancel a timer. Silently does nothing when the handle is unknown
    /// (the timer already fired or was never armed).
    pub fn cancel_timer(&mut self, handle: TimerHandle) {
        if let Some(index) = self.timers.iter().position(|t| t.handle == handle) {
            self.timers.remove(index);
        }
    }

    /// Block until a descriptor becomes readable or a timer expires, then
    /// fill `ready` with the readable tokens in poll order and `expired`
    /// with the payloads of due timers in non-decreasing deadline order.
    /// Both vectors are cleared first. The caller dispatches `ready`
    /// before `expired`; changes made by a handler (arming or cancelling
    /// timers, registering sockets) take effect no earlier than the next
    /// call.
    pub fn wait(&mut self, ready: &mut Vec<Token>, expired: &mut Vec<T>) -> io::Result<()> {
        ready.clear();
        expired.clear();

        // Timeout until the earliest deadline, 1ms minimum; infinite when
        // no timers are pending.
        let timeout = self.timers.first().map(|t| {
            let now = Instant::now();
            t.deadline
                .checked_duration_since(now)
                .unwrap_or(Duration::ZERO)
                .max(Duration::from_millis(1))
        });

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            ready.push(event.token());
        }

        let now = Instant::now();
        while let Some(first) = self.timers.first() {
            if first.deadline > now {
                break;
            }
            let entry = self.timers.remove(0);
            expired.push(entry.payload);
        }

        Ok(())
    }

    /// Number of pending timers.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }
}
