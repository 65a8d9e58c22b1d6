// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-direction readiness multiplexer (component G).
//!
//! One descriptor per `eid`: subscription and readiness sets keyed by event
//! kind (`IN`/`OUT`/`ERR`/`UPDATE`/`SPECIAL`), plus a set of natively-polled
//! file descriptors. Socket readiness is driven by [`CEPoll::update_events`]
//! from the protocol core; native fd readiness is polled through a single
//! shared `mio::Poll`, the same native-fd multiplexing primitive this
//! crate's transport-adjacent code reaches for, registered via
//! `mio::unix::SourceFd` rather than `mio`'s own `net` types since callers
//! here hand in raw descriptors they already own. A waiter that finds
//! nothing ready falls back to [`crate::clock::global_event`], the
//! process-wide 10 ms-bounded notifier, so an `update_events` call on
//! another thread wakes it promptly without a dedicated per-descriptor
//! condition variable.
//!
//! Locking follows the teacher's single-mutex-per-subsystem convention
//! (`m_EPollLock` in the reference design): descriptor state lives behind
//! one `parking_lot::Mutex`, and the shared native poller behind a second,
//! always acquired in poll-then-state order to avoid lock inversion.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;

#[cfg(unix)]
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
#[cfg(unix)]
use mio::Interest;
#[cfg(unix)]
use std::os::unix::io::RawFd;
#[cfg(not(unix))]
type RawFd = i32;

use crate::clock::{global_event, TimePoint};
use crate::error::{Error, Result};

/// Opaque identifier for an application socket; owned by the protocol core,
/// not this module.
pub type SocketId = u32;

/// Event-kind bitmask constants, matching the reference library's epoll
/// event flags.
pub mod event {
    pub const IN: u32 = 0b0_0001;
    pub const OUT: u32 = 0b0_0010;
    pub const ERR: u32 = 0b0_0100;
    pub const UPDATE: u32 = 0b0_1000;
    pub const SPECIAL: u32 = 0b1_0000;
    /// `add_usock`'s default subscription when the caller passes no mask.
    pub const DEFAULT: u32 = IN | OUT | ERR;
}

const KINDS: [u32; 5] = [event::IN, event::OUT, event::ERR, event::UPDATE, event::SPECIAL];
const USOCK_KINDS: usize = 3; // IN, OUT, ERR are the kinds wait()/uwait() report on.

fn kind_index(bit: u32) -> Option<usize> {
    KINDS.iter().position(|&k| k == bit)
}

struct Descriptor {
    subs: [HashSet<SocketId>; 5],
    ready: [HashSet<SocketId>; 5],
    native_fds: HashSet<RawFd>,
    native_ready_read: HashSet<RawFd>,
    native_ready_write: HashSet<RawFd>,
    edge_triggered: bool,
    allow_empty: bool,
}

impl Descriptor {
    fn new(edge_triggered: bool, allow_empty: bool) -> Self {
        Descriptor {
            subs: std::array::from_fn(|_| HashSet::new()),
            ready: std::array::from_fn(|_| HashSet::new()),
            native_fds: HashSet::new(),
            native_ready_read: HashSet::new(),
            native_ready_write: HashSet::new(),
            edge_triggered,
            allow_empty,
        }
    }

    fn has_no_usock_subscriptions(&self) -> bool {
        self.subs[..USOCK_KINDS].iter().all(HashSet::is_empty)
    }
}

/// Snapshot of readiness returned by [`CEPoll::wait`].
#[derive(Debug, Clone, Default)]
pub struct WaitReady {
    pub read: Vec<SocketId>,
    pub write: Vec<SocketId>,
    pub local_read: Vec<RawFd>,
    pub local_write: Vec<RawFd>,
}

impl WaitReady {
    fn total(&self) -> usize {
        self.read.len() + self.write.len() + self.local_read.len() + self.local_write.len()
    }
}

struct State {
    next_eid: i32,
    next_token: usize,
    descriptors: HashMap<i32, Descriptor>,
    fd_tokens: HashMap<(i32, RawFd), Token>,
    token_fd: HashMap<Token, (i32, RawFd)>,
}

/// Per-direction readiness multiplexer.
pub struct CEPoll {
    state: Mutex<State>,
    poll: Mutex<Poll>,
}

impl CEPoll {
    /// Builds a fresh multiplexer with no live descriptors.
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(|e| Error::Setup(format!("failed to create native poller: {e}")))?;
        Ok(CEPoll {
            state: Mutex::new(State {
                next_eid: 0,
                next_token: 0,
                descriptors: HashMap::new(),
                fd_tokens: HashMap::new(),
                token_fd: HashMap::new(),
            }),
            poll: Mutex::new(poll),
        })
    }

    /// Allocates a new descriptor from a monotonic seed that wraps below
    /// `2^31`; one shared native poller backs every descriptor, so creation
    /// itself cannot fail.
    pub fn create(&self, edge_triggered: bool, allow_empty: bool) -> i32 {
        let mut g = self.state.lock();
        let eid = g.next_eid;
        g.next_eid = if g.next_eid >= (1 << 30) { 0 } else { g.next_eid + 1 };
        g.descriptors.insert(eid, Descriptor::new(edge_triggered, allow_empty));
        eid
    }

    /// Inserts `u` into the subscription sets named by `events` (`0` means
    /// [`event::DEFAULT`]).
    pub fn add_usock(&self, eid: i32, u: SocketId, events: u32) -> Result<()> {
        let events = if events == 0 { event::DEFAULT } else { events };
        let mut g = self.state.lock();
        let desc = g.descriptors.get_mut(&eid).ok_or(Error::InvalidEid)?;
        for &kind in &KINDS {
            if events & kind != 0 {
                let idx = kind_index(kind).expect("kind is a member of KINDS");
                desc.subs[idx].insert(u);
            }
        }
        Ok(())
    }

    /// Removes `u` from every subscription and readiness set; clearing the
    /// readiness side too prevents a stale event from blocking `wait`
    /// forever once the socket is gone.
    pub fn remove_usock(&self, eid: i32, u: SocketId) -> Result<()> {
        let mut g = self.state.lock();
        let desc = g.descriptors.get_mut(&eid).ok_or(Error::InvalidEid)?;
        for idx in 0..KINDS.len() {
            desc.subs[idx].remove(&u);
            desc.ready[idx].remove(&u);
        }
        Ok(())
    }

    /// Atomically updates `u`'s subscription mask to exactly `events`:
    /// newly requested kinds are inserted, dropped kinds are erased from
    /// both subscription and readiness.
    pub fn update_usock(&self, eid: i32, u: SocketId, events: u32) -> Result<()> {
        let mut g = self.state.lock();
        let desc = g.descriptors.get_mut(&eid).ok_or(Error::InvalidEid)?;
        for (idx, &kind) in KINDS.iter().enumerate() {
            if events & kind != 0 {
                desc.subs[idx].insert(u);
            } else {
                desc.subs[idx].remove(&u);
                desc.ready[idx].remove(&u);
            }
        }
        Ok(())
    }

    /// Called by the protocol core when `u`'s status changes: for every
    /// kind bit in `events`, adds `u` to (or removes it from) the readiness
    /// set of each `eid` in `eids` that currently subscribes to that kind.
    /// Unknown eids are skipped and logged, not an error, since this is a
    /// fan-out call spanning potentially many descriptors. Always wakes
    /// every waiter blocked in [`Self::wait`]/[`Self::uwait`].
    pub fn update_events(&self, u: SocketId, eids: &[i32], events: u32, enable: bool) {
        let mut g = self.state.lock();
        for &eid in eids {
            let Some(desc) = g.descriptors.get_mut(&eid) else {
                log::debug!("[CEPoll::update_events] eid {eid} not found, skipping");
                continue;
            };
            for (idx, &kind) in KINDS.iter().enumerate() {
                if events & kind == 0 {
                    continue;
                }
                if enable {
                    if desc.subs[idx].contains(&u) {
                        desc.ready[idx].insert(u);
                    }
                } else {
                    desc.ready[idx].remove(&u);
                }
            }
        }
        drop(g);
        global_event().trigger();
    }

    fn snapshot_ready(desc: &Descriptor) -> WaitReady {
        let in_idx = kind_index(event::IN).expect("IN is in KINDS");
        let out_idx = kind_index(event::OUT).expect("OUT is in KINDS");
        let err_idx = kind_index(event::ERR).expect("ERR is in KINDS");
        let mut read: Vec<SocketId> = desc.ready[in_idx].iter().chain(desc.ready[err_idx].iter()).copied().collect();
        let mut write: Vec<SocketId> = desc.ready[out_idx].iter().chain(desc.ready[err_idx].iter()).copied().collect();
        read.sort_unstable();
        read.dedup();
        write.sort_unstable();
        write.dedup();
        WaitReady {
            read,
            write,
            local_read: desc.native_ready_read.iter().copied().collect(),
            local_write: desc.native_ready_write.iter().copied().collect(),
        }
    }

    /// Blocks until at least one subscribed socket or native fd becomes
    /// ready, or `timeout_ms` elapses (`timeout_ms < 0` waits forever).
    /// Sockets in the `ERR` subscription that become exceptional appear in
    /// both `read` and `write`. Level-triggered: readiness is left in place
    /// for the next call.
    pub fn wait(&self, eid: i32, timeout_ms: i64) -> Result<WaitReady> {
        let deadline = (timeout_ms >= 0).then(|| TimePoint::now().add(Duration::from_millis(timeout_ms as u64)));
        loop {
            {
                let mut g = self.state.lock();
                let desc = g.descriptors.get_mut(&eid).ok_or(Error::InvalidEid)?;
                if desc.has_no_usock_subscriptions() && desc.native_fds.is_empty() && !desc.allow_empty {
                    return Err(Error::DeadlockUnsupported);
                }
                let snapshot = Self::snapshot_ready(desc);
                if snapshot.total() > 0 {
                    Self::consume_if_edge_triggered(desc);
                    return Ok(snapshot);
                }
            }
            self.poll_native_once()?;
            {
                let mut g = self.state.lock();
                let desc = g.descriptors.get_mut(&eid).ok_or(Error::InvalidEid)?;
                let snapshot = Self::snapshot_ready(desc);
                if snapshot.total() > 0 {
                    Self::consume_if_edge_triggered(desc);
                    return Ok(snapshot);
                }
            }
            if let Some(dl) = deadline {
                if TimePoint::now() >= dl {
                    return Err(Error::Timeout);
                }
            }
            global_event().wait();
        }
    }

    /// Edge-triggered descriptors only report a readiness transition once;
    /// clear the usock ready sets so the next `wait` blocks until a fresh
    /// `update_events` call re-arms them. Level-triggered descriptors (the
    /// default) leave readiness in place for the next call to see again.
    fn consume_if_edge_triggered(desc: &mut Descriptor) {
        if desc.edge_triggered {
            for idx in 0..USOCK_KINDS {
                desc.ready[idx].clear();
            }
        }
    }

    /// Edge-triggered variant: returns each ready socket paired with its
    /// combined `IN`/`OUT`/`ERR` bits and clears those bits from the
    /// readiness sets before returning.
    pub fn uwait(&self, eid: i32, timeout_ms: i64) -> Result<Vec<(SocketId, u32)>> {
        let deadline = (timeout_ms >= 0).then(|| TimePoint::now().add(Duration::from_millis(timeout_ms as u64)));
        loop {
            {
                let mut g = self.state.lock();
                let desc = g.descriptors.get_mut(&eid).ok_or(Error::InvalidEid)?;
                let out = Self::drain_usock_ready(desc);
                if !out.is_empty() {
                    return Ok(out);
                }
                if desc.has_no_usock_subscriptions() && !desc.allow_empty {
                    return Err(Error::DeadlockUnsupported);
                }
            }
            if let Some(dl) = deadline {
                if TimePoint::now() >= dl {
                    return Err(Error::Timeout);
                }
            }
            global_event().wait();
        }
    }

    fn drain_usock_ready(desc: &mut Descriptor) -> Vec<(SocketId, u32)> {
        let mut bits: HashMap<SocketId, u32> = HashMap::new();
        for (idx, &kind) in KINDS[..USOCK_KINDS].iter().enumerate() {
            for &s in &desc.ready[idx] {
                *bits.entry(s).or_insert(0) |= kind;
            }
            desc.ready[idx].clear();
        }
        bits.into_iter().collect()
    }

    /// Closes the descriptor, deregistering any native fds still attached
    /// to it from the shared poller.
    pub fn release(&self, eid: i32) -> Result<()> {
        let mut poll = self.poll.lock();
        let mut g = self.state.lock();
        let desc = g.descriptors.remove(&eid).ok_or(Error::InvalidEid)?;
        for fd in &desc.native_fds {
            if let Some(token) = g.fd_tokens.remove(&(eid, *fd)) {
                g.token_fd.remove(&token);
                Self::deregister_fd(&mut poll, *fd);
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn deregister_fd(poll: &mut Poll, fd: RawFd) {
        let _ = poll.registry().deregister(&mut SourceFd(&fd));
    }

    #[cfg(not(unix))]
    fn deregister_fd(_poll: &mut Poll, _fd: RawFd) {}

    /// Registers a native file descriptor for readiness polling under
    /// `eid`.
    #[cfg(unix)]
    pub fn add_native_fd(&self, eid: i32, fd: RawFd) -> Result<()> {
        let mut poll = self.poll.lock();
        let mut g = self.state.lock();
        if !g.descriptors.contains_key(&eid) {
            return Err(Error::InvalidEid);
        }
        let token = Token(g.next_token);
        g.next_token += 1;
        poll.registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE | Interest::WRITABLE)
            .map_err(Error::from)?;
        g.fd_tokens.insert((eid, fd), token);
        g.token_fd.insert(token, (eid, fd));
        g.descriptors.get_mut(&eid).expect("checked above").native_fds.insert(fd);
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn add_native_fd(&self, _eid: i32, _fd: RawFd) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Deregisters a previously-added native file descriptor.
    pub fn remove_native_fd(&self, eid: i32, fd: RawFd) -> Result<()> {
        let mut poll = self.poll.lock();
        let mut g = self.state.lock();
        let desc = g.descriptors.get_mut(&eid).ok_or(Error::InvalidEid)?;
        if !desc.native_fds.remove(&fd) {
            return Ok(());
        }
        desc.native_ready_read.remove(&fd);
        desc.native_ready_write.remove(&fd);
        if let Some(token) = g.fd_tokens.remove(&(eid, fd)) {
            g.token_fd.remove(&token);
            Self::deregister_fd(&mut poll, fd);
        }
        Ok(())
    }

    /// One non-blocking round of the shared native poller; any readiness
    /// found is recorded against whichever `eid` owns that fd, even if it
    /// is not the caller's, so a later `wait`/`uwait` on that descriptor
    /// finds it already marked.
    fn poll_native_once(&self) -> Result<()> {
        let mut poll = self.poll.lock();
        let mut events = Events::with_capacity(64);
        poll.poll(&mut events, Some(Duration::from_millis(1))).map_err(Error::from)?;
        let mut g = self.state.lock();
        // Refresh rather than accumulate: a fd that stopped being ready
        // since the last round must stop appearing ready here too.
        for desc in g.descriptors.values_mut() {
            desc.native_ready_read.clear();
            desc.native_ready_write.clear();
        }
        for ev in events.iter() {
            let Some(&(owner_eid, fd)) = g.token_fd.get(&ev.token()) else { continue };
            let Some(desc) = g.descriptors.get_mut(&owner_eid) else { continue };
            if ev.is_readable() {
                desc.native_ready_read.insert(fd);
            }
            if ev.is_writable() {
                desc.native_ready_write.insert(fd);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_allocates_distinct_eids() {
        let ep = CEPoll::new().unwrap();
        let a = ep.create(false, false);
        let b = ep.create(false, false);
        assert_ne!(a, b);
    }

    #[test]
    fn wait_on_empty_subscription_without_allow_empty_deadlocks() {
        let ep = CEPoll::new().unwrap();
        let eid = ep.create(false, false);
        let err = ep.wait(eid, 0).unwrap_err();
        assert!(matches!(err, Error::DeadlockUnsupported));
    }

    #[test]
    fn wait_on_empty_subscription_with_allow_empty_times_out() {
        let ep = CEPoll::new().unwrap();
        let eid = ep.create(false, true);
        let err = ep.wait(eid, 5).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn update_events_makes_socket_ready_for_wait() {
        let ep = CEPoll::new().unwrap();
        let eid = ep.create(false, false);
        ep.add_usock(eid, 42, event::DEFAULT).unwrap();
        ep.update_events(42, &[eid], event::IN, true);
        let ready = ep.wait(eid, 0).unwrap();
        assert_eq!(ready.read, vec![42]);
    }

    #[test]
    fn err_subscription_appears_in_both_read_and_write() {
        let ep = CEPoll::new().unwrap();
        let eid = ep.create(false, false);
        ep.add_usock(eid, 7, event::DEFAULT).unwrap();
        ep.update_events(7, &[eid], event::ERR, true);
        let ready = ep.wait(eid, 0).unwrap();
        assert_eq!(ready.read, vec![7]);
        assert_eq!(ready.write, vec![7]);
    }

    #[test]
    fn remove_usock_clears_stale_readiness() {
        let ep = CEPoll::new().unwrap();
        let eid = ep.create(false, true);
        ep.add_usock(eid, 1, event::DEFAULT).unwrap();
        ep.update_events(1, &[eid], event::IN, true);
        ep.remove_usock(eid, 1).unwrap();
        let err = ep.wait(eid, 5).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn update_usock_drops_unsubscribed_kinds_readiness() {
        let ep = CEPoll::new().unwrap();
        let eid = ep.create(false, true);
        ep.add_usock(eid, 1, event::IN | event::OUT).unwrap();
        ep.update_events(1, &[eid], event::OUT, true);
        ep.update_usock(eid, 1, event::IN).unwrap();
        let ready = ep.wait(eid, 5);
        assert!(ready.is_err() || ready.unwrap().write.is_empty());
    }

    #[test]
    fn uwait_clears_readiness_after_returning_it() {
        let ep = CEPoll::new().unwrap();
        let eid = ep.create(true, false);
        ep.add_usock(eid, 3, event::DEFAULT).unwrap();
        ep.update_events(3, &[eid], event::IN, true);
        let first = ep.uwait(eid, 0).unwrap();
        assert_eq!(first, vec![(3, event::IN)]);
        let err = ep.uwait(eid, 5).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn edge_triggered_wait_does_not_repeat_readiness() {
        let ep = CEPoll::new().unwrap();
        let eid = ep.create(true, true);
        ep.add_usock(eid, 5, event::DEFAULT).unwrap();
        ep.update_events(5, &[eid], event::IN, true);
        let first = ep.wait(eid, 0).unwrap();
        assert_eq!(first.read, vec![5]);
        let err = ep.wait(eid, 5).unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn level_triggered_wait_keeps_reporting_until_cleared() {
        let ep = CEPoll::new().unwrap();
        let eid = ep.create(false, true);
        ep.add_usock(eid, 5, event::DEFAULT).unwrap();
        ep.update_events(5, &[eid], event::IN, true);
        let first = ep.wait(eid, 0).unwrap();
        assert_eq!(first.read, vec![5]);
        let second = ep.wait(eid, 0).unwrap();
        assert_eq!(second.read, vec![5]);
    }

    #[test]
    fn release_invalidates_eid() {
        let ep = CEPoll::new().unwrap();
        let eid = ep.create(false, true);
        ep.release(eid).unwrap();
        assert!(matches!(ep.wait(eid, 0).unwrap_err(), Error::InvalidEid));
        assert!(matches!(ep.release(eid).unwrap_err(), Error::InvalidEid));
    }

    #[test]
    fn update_events_to_unknown_eid_is_not_an_error() {
        let ep = CEPoll::new().unwrap();
        ep.update_events(1, &[9999], event::IN, true);
    }
}
