// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport engine configuration - single source of truth for tunables.
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time defaults for every option in the
//!   configuration table, as associated constants.
//! - **Level 2 (Dynamic)**: [`RuntimeConfig`], a small `Copy` snapshot held
//!   behind an [`ArcSwap`] and swapped wholesale on every successful `set`,
//!   so concurrent readers never observe a half-applied option.
//!
//! Unlike the wider configuration layer this pattern is borrowed from, this
//! crate carries no `DashMap`-backed free-form QoS store: the option set is
//! the closed table from the external-interfaces section, so a plain struct
//! behind an `ArcSwap` is sufficient and keeps the dependency list minimal.

use crate::error::{Error, Result};
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Transport type preset, controlling the defaults [`RuntimeConfig::set_transtype`]
/// applies as a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransType {
    /// Live streaming preset: low latency, TLPKTDROP on, message-mode.
    Live,
    /// File-transfer preset: large buffers, TLPKTDROP off, stream-mode.
    File,
}

/// Compile-time defaults for every tunable named in the options table.
///
/// Level 1 of the configuration layer: these never change at runtime and
/// exist so call sites have a documented fallback even before a
/// [`RuntimeConfig`] has been constructed.
pub struct StaticConfig;

impl StaticConfig {
    /// Default maximum segment size, in bytes.
    pub const MSS: u32 = 1500;
    /// Default flow-control window, in packets.
    pub const FC: u32 = 25600;
    /// Minimum allowed flow-control window.
    pub const FC_MIN: u32 = 1;
    /// Hard cap on in-flight packets regardless of configured FC.
    pub const MAX_FLIGHT_PKT: u32 = 1 << 20;
    /// Default TSBPD latency, in milliseconds.
    pub const LATENCY_MS: u32 = 120;
    /// Default extra wait before TLPKTDROP on the send side, in milliseconds.
    pub const SNDDROPDELAY_MS: i32 = 0;
    /// Default user payload budget, in bytes (`MSS` minus header overhead).
    pub const PAYLOADSIZE: u32 = 1456;
    /// Default reorder-tolerance window, in packets, before a gap is
    /// reported as unrecoverable loss.
    pub const LOSSMAXTTL: u32 = 0;
    /// Default connection-attempt timeout, in milliseconds.
    pub const CONNTIMEO_MS: u32 = 3000;
    /// UDP/IP header overhead subtracted from MSS to obtain packet payload.
    pub const UDP_HDR: u32 = 28;
}

/// Runtime-tunable snapshot of the options table (§6).
///
/// Cheap to clone (`Copy`): every field is a plain scalar. A new value is
/// built by copying the current snapshot, validating and applying the
/// requested change, then swapped in atomically via [`RuntimeConfig::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub mss: u32,
    pub fc: u32,
    pub sndbuf_pkts: u32,
    pub rcvbuf_pkts: u32,
    pub latency_ms: u32,
    pub rcv_latency_ms: u32,
    pub peer_latency_ms: u32,
    pub tsbpdmode: bool,
    pub tlpktdrop: bool,
    pub snddropdelay_ms: i32,
    pub payloadsize: u32,
    pub pbkeylen: u8,
    pub km_refresh_rate: u32,
    pub km_preannounce: u32,
    pub nakreport: bool,
    pub lossmaxttl: u32,
    pub conntimeo_ms: u32,
    pub transtype: TransType,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            mss: StaticConfig::MSS,
            fc: StaticConfig::FC,
            sndbuf_pkts: StaticConfig::FC,
            rcvbuf_pkts: StaticConfig::FC,
            latency_ms: StaticConfig::LATENCY_MS,
            rcv_latency_ms: StaticConfig::LATENCY_MS,
            peer_latency_ms: StaticConfig::LATENCY_MS,
            tsbpdmode: true,
            tlpktdrop: true,
            snddropdelay_ms: StaticConfig::SNDDROPDELAY_MS,
            payloadsize: StaticConfig::PAYLOADSIZE,
            pbkeylen: 0,
            km_refresh_rate: 0,
            km_preannounce: 0,
            nakreport: true,
            lossmaxttl: StaticConfig::LOSSMAXTTL,
            conntimeo_ms: StaticConfig::CONNTIMEO_MS,
            transtype: TransType::Live,
        }
    }
}

impl Options {
    fn bytes_to_packets(&self, bytes: u32) -> u32 {
        let per_packet = self.mss.saturating_sub(StaticConfig::UDP_HDR).max(1);
        bytes.div_ceil(per_packet)
    }

    /// Applies the `TRANSTYPE` preset as a batch, matching the reference
    /// library's behavior of setting several dependent options together.
    fn apply_transtype(&mut self, tt: TransType) {
        self.transtype = tt;
        match tt {
            TransType::Live => {
                self.tlpktdrop = true;
                self.tsbpdmode = true;
                self.latency_ms = StaticConfig::LATENCY_MS;
            }
            TransType::File => {
                self.tlpktdrop = false;
                self.tsbpdmode = false;
                self.latency_ms = 0;
            }
        }
    }
}

/// Level 2 of the configuration layer: an atomically-swapped live
/// [`Options`] snapshot.
pub struct RuntimeConfig {
    current: ArcSwap<Options>,
}

impl RuntimeConfig {
    /// Builds a runtime configuration starting from [`Options::default`].
    #[must_use]
    pub fn new() -> Self {
        RuntimeConfig { current: ArcSwap::from_pointee(Options::default()) }
    }

    /// Returns a snapshot of the currently active options.
    #[must_use]
    pub fn snapshot(&self) -> Options {
        **self.current.load()
    }

    fn store(&self, next: Options) {
        self.current.store(Arc::new(next));
    }

    /// Sets `MSS`. Rejects values too small to carry the fixed header plus
    /// at least one payload byte.
    pub fn set_mss(&self, mss: u32) -> Result<()> {
        if mss <= HEADER_PLUS_UDP_MIN {
            return Err(Error::InvalidArgument(format!("MSS {mss} too small")));
        }
        let mut next = self.snapshot();
        next.mss = mss;
        next.payloadsize = next.mss - StaticConfig::UDP_HDR;
        self.store(next);
        Ok(())
    }

    /// Sets `FC`, the flow-control window in packets.
    pub fn set_fc(&self, fc: u32) -> Result<()> {
        if fc < StaticConfig::FC_MIN || fc > StaticConfig::MAX_FLIGHT_PKT {
            return Err(Error::InvalidArgument(format!("FC {fc} out of range")));
        }
        let mut next = self.snapshot();
        next.fc = fc;
        self.store(next);
        Ok(())
    }

    /// Sets `SNDBUF`/`RCVBUF` from a byte count, converting to packets using
    /// the current MSS.
    pub fn set_sndbuf_bytes(&self, bytes: u32) -> Result<()> {
        let mut next = self.snapshot();
        next.sndbuf_pkts = next.bytes_to_packets(bytes);
        self.store(next);
        Ok(())
    }

    /// See [`RuntimeConfig::set_sndbuf_bytes`].
    pub fn set_rcvbuf_bytes(&self, bytes: u32) -> Result<()> {
        let mut next = self.snapshot();
        next.rcvbuf_pkts = next.bytes_to_packets(bytes);
        self.store(next);
        Ok(())
    }

    /// Sets the TSBPD delivery latency, in milliseconds.
    pub fn set_latency_ms(&self, ms: u32) -> Result<()> {
        let mut next = self.snapshot();
        next.latency_ms = ms;
        next.rcv_latency_ms = ms;
        next.peer_latency_ms = ms;
        self.store(next);
        Ok(())
    }

    /// Enables/disables too-late-packet drop.
    pub fn set_tlpktdrop(&self, enabled: bool) -> Result<()> {
        let mut next = self.snapshot();
        next.tlpktdrop = enabled;
        self.store(next);
        Ok(())
    }

    /// Sets `PBKEYLEN`. Valid values are 0 (disabled), 16, 24, 32.
    pub fn set_pbkeylen(&self, len: u8) -> Result<()> {
        if !matches!(len, 0 | 16 | 24 | 32) {
            return Err(Error::InvalidArgument(format!("PBKEYLEN {len} must be 0, 16, 24 or 32")));
        }
        let mut next = self.snapshot();
        next.pbkeylen = len;
        self.store(next);
        Ok(())
    }

    /// Sets `KMREFRESHRATE`/`KMPREANNOUNCE` together; pre-announce must not
    /// exceed `(refresh - 1) / 2`.
    pub fn set_km_schedule(&self, refresh_rate: u32, preannounce: u32) -> Result<()> {
        if refresh_rate > 0 && preannounce > (refresh_rate.saturating_sub(1)) / 2 {
            return Err(Error::InvalidArgument(
                "KMPREANNOUNCE must be <= (KMREFRESHRATE-1)/2".into(),
            ));
        }
        let mut next = self.snapshot();
        next.km_refresh_rate = refresh_rate;
        next.km_preannounce = preannounce;
        self.store(next);
        Ok(())
    }

    /// Sets `LOSSMAXTTL`, the reorder-tolerance window in packets.
    pub fn set_lossmaxttl(&self, ttl: u32) -> Result<()> {
        let mut next = self.snapshot();
        next.lossmaxttl = ttl;
        self.store(next);
        Ok(())
    }

    /// Sets `CONNTIMEO`, in milliseconds.
    pub fn set_conntimeo_ms(&self, ms: u32) -> Result<()> {
        if ms == 0 {
            return Err(Error::InvalidArgument("CONNTIMEO must be > 0".into()));
        }
        let mut next = self.snapshot();
        next.conntimeo_ms = ms;
        self.store(next);
        Ok(())
    }

    /// Applies the `TRANSTYPE` preset, batching the dependent options.
    pub fn set_transtype(&self, tt: TransType) -> Result<()> {
        let mut next = self.snapshot();
        next.apply_transtype(tt);
        self.store(next);
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

const HEADER_PLUS_UDP_MIN: u32 = crate::packet::HEADER_SIZE as u32 + StaticConfig::UDP_HDR;
