// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Drift-corrected monotonic clock and timer (component B).
//!
//! `sleep_until` waits on a condition variable up to a short busy-wait
//! threshold, then spins, so that callers woken by [`Timer::interrupt`] or
//! [`Timer::tick`] observe sub-millisecond latency without burning a full
//! core while idle. [`DriftTracer`] accumulates round-trip/interval samples
//! and folds them into a running median-drift correction, the same
//! EWMA-adjacent smoothing discipline the rate/RTT estimators use.
//!
//! The cross-thread wakeup here is a plain `(Mutex, Condvar)` pair rather
//! than the eventfd-backed waitset used by [`crate::epoll`]: the timer only
//! ever has one purpose (wake a sleeper early or on schedule), so the
//! simpler primitive is sufficient and keeps this module free of platform
//! `cfg` branches; the eventfd/Win32-Event split is reserved for the epoll
//! multiplexer, which must also interoperate with native OS file
//! descriptors.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on how long [`Timer::sleep_until`] blocks on the condition
/// variable before switching to a tight spin, matching the reference
/// library's platform-dependent busy-wait threshold (collapsed to a single
/// portable value here).
const BUSY_WAIT_THRESHOLD: Duration = Duration::from_millis(1);

/// A monotonic point in time, relative to an arbitrary epoch fixed at
/// process start. Arithmetic never panics: operations saturate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimePoint(Instant);

impl TimePoint {
    /// The current instant.
    #[must_use]
    pub fn now() -> Self {
        TimePoint(Instant::now())
    }

    /// This point plus `d`, saturating at the representable maximum.
    #[must_use]
    pub fn add(self, d: Duration) -> Self {
        TimePoint(self.0 + d)
    }

    /// Signed duration from `earlier` to `self`; zero if `self` is not
    /// after `earlier` (Instant has no negative duration).
    #[must_use]
    pub fn since(self, earlier: TimePoint) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }
}

/// A cooperative sleeper that can be woken early ([`interrupt`](Timer::interrupt))
/// or nudged to re-check its deadline ([`tick`](Timer::tick)) from another
/// thread.
pub struct Timer {
    state: Mutex<TimerState>,
    cond: Condvar,
}

struct TimerState {
    deadline: Option<TimePoint>,
    interrupted: bool,
}

impl Timer {
    /// Builds a timer with no deadline scheduled.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Timer {
            state: Mutex::new(TimerState { deadline: None, interrupted: false }),
            cond: Condvar::new(),
        })
    }

    /// Blocks the calling thread until `deadline` or until woken.
    ///
    /// Returns `true` if it returned because `deadline` was reached
    /// naturally, `false` if [`interrupt`](Self::interrupt) woke it early.
    pub fn sleep_until(&self, deadline: TimePoint) -> bool {
        {
            let mut s = self.state.lock();
            s.deadline = Some(deadline);
            s.interrupted = false;
        }
        loop {
            let now = TimePoint::now();
            if now >= deadline {
                let mut s = self.state.lock();
                let woke_naturally = !s.interrupted;
                s.deadline = None;
                return woke_naturally;
            }
            let remaining = deadline.since(now);
            if remaining <= BUSY_WAIT_THRESHOLD {
                std::hint::spin_loop();
                continue;
            }
            let mut s = self.state.lock();
            if s.interrupted {
                s.deadline = None;
                return false;
            }
            let wait_for = (remaining - BUSY_WAIT_THRESHOLD).min(Duration::from_millis(10));
            let _ = self.cond.wait_for(&mut s, wait_for);
        }
    }

    /// Wakes a sleeper immediately; [`sleep_until`](Self::sleep_until) returns `false`.
    pub fn interrupt(&self) {
        let mut s = self.state.lock();
        s.interrupted = true;
        self.cond.notify_all();
    }

    /// Re-checks the scheduled deadline without forcing an early return;
    /// used when external state changed in a way that might shorten the
    /// effective deadline (e.g. a new retransmit became due).
    pub fn tick(&self) {
        self.cond.notify_all();
    }
}

impl Default for Timer {
    fn default() -> Self {
        // `Timer::new` returns an `Arc<Self>`; `Default` is provided for
        // embedding a bare `Timer` (not behind an `Arc`) in tests.
        Timer { state: Mutex::new(TimerState { deadline: None, interrupted: false }), cond: Condvar::new() }
    }
}

/// Process-wide "something happened" notifier, the fallback wakeup source
/// for [`crate::epoll`] waiters when no native fd readiness has changed.
/// Bounded to a 10 ms wait per the concurrency model in §5.
pub struct GlobalEvent {
    mutex: Mutex<u64>,
    cond: Condvar,
}

impl GlobalEvent {
    const WAIT_BOUND: Duration = Duration::from_millis(10);

    fn new() -> Self {
        GlobalEvent { mutex: Mutex::new(0), cond: Condvar::new() }
    }

    /// Wakes every thread currently parked in [`wait`](Self::wait).
    pub fn trigger(&self) {
        let mut g = self.mutex.lock();
        *g = g.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Blocks up to 10 ms, or until [`trigger`](Self::trigger) is called.
    pub fn wait(&self) {
        let mut g = self.mutex.lock();
        let seen = *g;
        if *g == seen {
            let _ = self.cond.wait_for(&mut g, Self::WAIT_BOUND);
        }
    }
}

static GLOBAL_EVENT: std::sync::OnceLock<GlobalEvent> = std::sync::OnceLock::new();

/// Returns the process-wide [`GlobalEvent`] singleton.
///
/// A single shared instance is unavoidable for the "wake every epoll
/// waiter" side effect described in the design notes; callers that want an
/// injectable context instead should prefer a per-descriptor channel, as
/// [`crate::epoll`] does for its own readiness notifications.
pub fn global_event() -> &'static GlobalEvent {
    GLOBAL_EVENT.get_or_init(GlobalEvent::new)
}

/// Running median-drift estimator over a window of `span` samples, with
/// overdrift clamped to `±max_drift_us`.
///
/// When `clear_on_update` is set, accumulated overdrift beyond the clamp is
/// absorbed into the timebase on each recalculation (clear mode); otherwise
/// it accumulates across windows (sticky mode).
pub struct DriftTracer {
    span: usize,
    max_drift_us: i64,
    clear_on_update: bool,
    samples: Vec<i64>,
    overdrift_us: i64,
    drift_us: i64,
}

impl DriftTracer {
    /// Builds a tracer with the given window size and clamp.
    #[must_use]
    pub fn new(span: usize, max_drift_us: i64, clear_on_update: bool) -> Self {
        DriftTracer {
            span: span.max(1),
            max_drift_us,
            clear_on_update,
            samples: Vec::with_capacity(span.max(1)),
            overdrift_us: 0,
            drift_us: 0,
        }
    }

    /// Adds one raw drift sample (microseconds). Returns `Some(drift_us)`
    /// once a full window has been collected and folded into an update.
    pub fn update(&mut self, sample_us: i64) -> Option<i64> {
        self.samples.push(sample_us);
        if self.samples.len() < self.span {
            return None;
        }
        self.samples.sort_unstable();
        let median = self.samples[self.samples.len() / 2];
        self.samples.clear();

        let mut applied = median + self.overdrift_us;
        if applied > self.max_drift_us {
            self.overdrift_us = applied - self.max_drift_us;
            applied = self.max_drift_us;
        } else if applied < -self.max_drift_us {
            self.overdrift_us = applied + self.max_drift_us;
            applied = -self.max_drift_us;
        } else if self.clear_on_update {
            self.overdrift_us = 0;
        }

        self.drift_us += applied;
        Some(applied)
    }

    /// Accumulated drift correction, in microseconds.
    #[must_use]
    pub fn drift_us(&self) -> i64 {
        self.drift_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_until_returns_true_naturally() {
        let timer = Timer::new();
        let deadline = TimePoint::now().add(Duration::from_millis(5));
        assert!(timer.sleep_until(deadline));
        assert!(TimePoint::now() >= deadline);
    }

    #[test]
    fn interrupt_wakes_sleeper_early() {
        let timer = Timer::new();
        let t2 = timer.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            t2.interrupt();
        });
        let deadline = TimePoint::now().add(Duration::from_secs(5));
        let start = TimePoint::now();
        let woke_naturally = timer.sleep_until(deadline);
        assert!(!woke_naturally);
        assert!(TimePoint::now().since(start) < Duration::from_secs(1));
        handle.join().unwrap();
    }

    #[test]
    fn global_event_trigger_wakes_waiter() {
        let ev = GlobalEvent::new();
        let start = Instant::now();
        ev.trigger();
        ev.wait();
        assert!(start.elapsed() < GlobalEvent::WAIT_BOUND * 2);
    }

    #[test]
    fn drift_tracer_emits_after_full_window() {
        let mut tracer = DriftTracer::new(3, 1000, true);
        assert!(tracer.update(10).is_none());
        assert!(tracer.update(20).is_none());
        let out = tracer.update(30);
        assert_eq!(out, Some(20)); // median of [10,20,30]
    }

    #[test]
    fn drift_tracer_clamps_overdrift() {
        let mut tracer = DriftTracer::new(1, 100, false);
        let applied = tracer.update(500).unwrap();
        assert_eq!(applied, 100);
        // sticky mode: overdrift carries into the next window
        let applied2 = tracer.update(0).unwrap();
        assert_eq!(applied2, 100); // 0 + 400 overdrift still clamps to 100
    }
}
