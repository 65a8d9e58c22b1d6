// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rate and RTT estimation (component E).
//!
//! `InputRateEstimator` and `SendRateEstimator` follow the reference
//! library's two distinct estimator shapes (accumulate-then-recalculate vs.
//! sliding time-bucket window); `RttEstimator` reuses the windowed/EWMA
//! smoothing discipline this crate's congestion-adjacent code applies to
//! round-trip samples, supplying `min_interval`/`rto()` to the send buffer's
//! retransmission scheduling policy (§4.D) and to the FEC ARQ fallback
//! decision (§4.F).

use std::time::Duration;

/// Duration of the fast-start accumulation period before the first
/// recalculation, matching `INPUTRATE_FAST_START_US`.
pub const INPUTRATE_FAST_START_US: u64 = 500_000;
/// Duration of each subsequent accumulation period once running.
pub const INPUTRATE_RUNNING_US: u64 = 1_000_000;
/// Packet count that forces an early recalculation during fast start.
pub const INPUTRATE_MAX_PACKETS: u32 = 2000;
/// Size of a full UDP/IP + protocol header, added per packet to the byte
/// count before computing bandwidth.
pub const FULL_HEADER_SIZE: u32 = 28 + 16;

/// Accumulate-then-recalculate estimator for the rate at which the
/// application is handing data to the send buffer.
pub struct InputRateEstimator {
    start_us: u64,
    pkts: u32,
    bytes: u64,
    fast_start: bool,
    bps: f64,
}

impl InputRateEstimator {
    /// Builds an estimator starting in fast-start mode at `now_us`.
    #[must_use]
    pub fn new(now_us: u64) -> Self {
        InputRateEstimator { start_us: now_us, pkts: 0, bytes: 0, fast_start: true, bps: 0.0 }
    }

    fn period_us(&self) -> u64 {
        if self.fast_start {
            INPUTRATE_FAST_START_US
        } else {
            INPUTRATE_RUNNING_US
        }
    }

    /// Records one packet of `payload_len` bytes at `now_us`. Samples whose
    /// timestamp precedes the window start are ignored (a failover reset
    /// would otherwise corrupt the running rate).
    pub fn update(&mut self, now_us: u64, payload_len: u32) {
        if now_us < self.start_us {
            return;
        }
        self.pkts += 1;
        self.bytes += payload_len as u64;

        let elapsed = now_us - self.start_us;
        let period = self.period_us();
        if elapsed >= period || (self.fast_start && self.pkts >= INPUTRATE_MAX_PACKETS) {
            self.recalculate(now_us, elapsed.max(1));
        }
    }

    fn recalculate(&mut self, now_us: u64, elapsed_us: u64) {
        let effective_bytes = self.bytes + self.pkts as u64 * FULL_HEADER_SIZE as u64;
        self.bps = effective_bytes as f64 * 1_000_000.0 / elapsed_us as f64;
        self.pkts = 0;
        self.bytes = 0;
        self.start_us = now_us;
        self.fast_start = false;
    }

    /// Current bandwidth estimate, in bytes per second.
    #[must_use]
    pub fn bps(&self) -> f64 {
        self.bps
    }
}

const SAMPLE_DURATION_MS: u64 = 50;
const NUM_PERIODS: usize = 16;

/// Sliding-window estimator of bytes actually placed on the wire.
pub struct SendRateEstimator {
    buckets: [u64; NUM_PERIODS],
    bucket_ts_ms: [u64; NUM_PERIODS],
}

impl SendRateEstimator {
    /// Builds an estimator with every bucket empty.
    #[must_use]
    pub fn new() -> Self {
        SendRateEstimator { buckets: [0; NUM_PERIODS], bucket_ts_ms: [0; NUM_PERIODS] }
    }

    fn index(ts_ms: u64) -> usize {
        ((ts_ms / SAMPLE_DURATION_MS) % NUM_PERIODS as u64) as usize
    }

    fn cleanup(&mut self, now_ms: u64) {
        let cur_bucket = now_ms / SAMPLE_DURATION_MS;
        for i in 0..NUM_PERIODS {
            let bucket_period = self.bucket_ts_ms[i] / SAMPLE_DURATION_MS;
            if self.bucket_ts_ms[i] != 0 && cur_bucket.saturating_sub(bucket_period) >= NUM_PERIODS as u64 {
                self.buckets[i] = 0;
                self.bucket_ts_ms[i] = 0;
            }
        }
    }

    /// Adds one sample of `bytes` sent at `ts_ms`.
    pub fn add_sample(&mut self, ts_ms: u64, bytes: u64) {
        self.cleanup(ts_ms);
        let idx = Self::index(ts_ms);
        let bucket_period = self.bucket_ts_ms[idx] / SAMPLE_DURATION_MS;
        if bucket_period != ts_ms / SAMPLE_DURATION_MS {
            self.buckets[idx] = 0;
        }
        self.buckets[idx] += bytes;
        self.bucket_ts_ms[idx] = ts_ms;
    }

    /// Average bytes-per-second across every non-empty bucket in the window.
    #[must_use]
    pub fn rate_bps(&self, now_ms: u64) -> f64 {
        let mut total = 0u64;
        let mut count = 0u32;
        for i in 0..NUM_PERIODS {
            let bucket_period = self.bucket_ts_ms[i] / SAMPLE_DURATION_MS;
            if self.bucket_ts_ms[i] != 0 && now_ms / SAMPLE_DURATION_MS >= bucket_period {
                total += self.buckets[i];
                count += 1;
            }
        }
        if count == 0 {
            0.0
        } else {
            total as f64 * 1000.0 / (count as f64 * SAMPLE_DURATION_MS as f64)
        }
    }
}

impl Default for SendRateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// RFC-6298-style smoothed RTT estimator, reused as the seam a
/// congestion-control collaborator would plug a retransmit-timeout policy
/// into (§9's open question on `RETRANSMITALGO`).
pub struct RttEstimator {
    rtt_ms: f64,
    rtt_var_ms: f64,
    default_ms: f64,
    alpha: f64,
    beta: f64,
    samples: u32,
}

impl RttEstimator {
    /// Builds an estimator with `default_ms` as the initial RTT before any
    /// sample has been observed.
    #[must_use]
    pub fn new(default_ms: f64) -> Self {
        RttEstimator { rtt_ms: default_ms, rtt_var_ms: default_ms / 2.0, default_ms, alpha: 0.125, beta: 0.25, samples: 0 }
    }

    /// Folds one round-trip sample (milliseconds) into the estimate.
    pub fn update(&mut self, sample_ms: f64) {
        if self.samples == 0 {
            self.rtt_ms = sample_ms;
            self.rtt_var_ms = sample_ms / 2.0;
        } else {
            let diff = sample_ms - self.rtt_ms;
            self.rtt_ms += self.alpha * diff;
            self.rtt_var_ms += self.beta * (diff.abs() - self.rtt_var_ms);
        }
        self.samples += 1;
    }

    /// Current smoothed RTT, in milliseconds.
    #[must_use]
    pub fn rtt_ms(&self) -> f64 {
        self.rtt_ms
    }

    /// `true` once at least three samples have been observed, matching the
    /// reliability threshold this crate's other RTT-consuming code uses.
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.samples >= 3
    }

    /// Retransmission timeout: `rtt + 4*var`, floored at 1 ms.
    #[must_use]
    pub fn rto_ms(&self) -> f64 {
        (self.rtt_ms + 4.0 * self.rtt_var_ms).max(1.0)
    }

    /// [`Self::rto_ms`] as a [`Duration`].
    #[must_use]
    pub fn rto(&self) -> Duration {
        Duration::from_micros((self.rto_ms() * 1000.0) as u64)
    }

    /// Minimum retransmit interval derived from the current RTT estimate,
    /// the value the send buffer's retransmission scheduling policy
    /// multiplies losses against (§4.D).
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        Duration::from_micros((self.rtt_ms.max(1.0) * 1000.0) as u64)
    }

    /// Resets to the configured default, discarding every sample.
    pub fn reset(&mut self) {
        self.rtt_ms = self.default_ms;
        self.rtt_var_ms = self.default_ms / 2.0;
        self.samples = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_rate_fast_start_then_running() {
        let mut est = InputRateEstimator::new(0);
        for i in 0..10 {
            est.update(i * 1000, 1000);
        }
        assert!(!est.fast_start);
        assert!(est.bps() > 0.0);
    }

    #[test]
    fn input_rate_ignores_samples_before_window_start() {
        let mut est = InputRateEstimator::new(1_000_000);
        est.update(500_000, 1000);
        assert_eq!(est.pkts, 0);
        assert_eq!(est.bytes, 0);
    }

    #[test]
    fn send_rate_averages_over_window() {
        let mut est = SendRateEstimator::new();
        for i in 0..10 {
            est.add_sample(i * SAMPLE_DURATION_MS, 1500);
        }
        let rate = est.rate_bps(9 * SAMPLE_DURATION_MS);
        assert!(rate > 0.0);
    }

    #[test]
    fn rtt_estimator_first_sample_sets_baseline() {
        let mut rtt = RttEstimator::new(100.0);
        rtt.update(40.0);
        assert_eq!(rtt.rtt_ms(), 40.0);
        assert!(!rtt.is_reliable());
    }

    #[test]
    fn rtt_estimator_becomes_reliable_after_three_samples() {
        let mut rtt = RttEstimator::new(100.0);
        rtt.update(40.0);
        rtt.update(42.0);
        rtt.update(38.0);
        assert!(rtt.is_reliable());
    }

    #[test]
    fn rto_never_below_one_ms() {
        let mut rtt = RttEstimator::new(0.0);
        rtt.update(0.0);
        assert!(rtt.rto_ms() >= 1.0);
    }

    #[test]
    fn reset_restores_default() {
        let mut rtt = RttEstimator::new(100.0);
        rtt.update(5.0);
        rtt.reset();
        assert_eq!(rtt.rtt_ms(), 100.0);
        assert!(!rtt.is_reliable());
    }
}
