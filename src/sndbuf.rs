// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Send buffer (component D): builds wire-ready packets from user data atop
//! the [`SndPktArray`], and owns message numbering, TTL expiry, and the
//! rate/origin-time bookkeeping the retransmission scheduling policy reads.
//!
//! Follows the same lock-around-whole-method discipline as
//! [`crate::sndarray`]: one [`Mutex`] guards everything this module owns
//! directly, while the array itself is reached through its own lock
//! (§5: "SndPktArray is accessed only via the send buffer and thus
//! inherits that lock").

use crate::clock::TimePoint;
use crate::error::{Error, Result};
use crate::rate::{InputRateEstimator, SendRateEstimator};
use crate::sndarray::SndPktArray;
use crate::seqno::{self, Boundary, EncryptionKeyFlag, MsgNoFlags, SeqNo};
use parking_lot::Mutex;
use std::time::Duration;

/// Sentinel TTL meaning "never expires", used by [`SndBuffer::add_buffer_from_file`]
/// and any caller that wants file-transfer semantics.
pub const TTL_INFINITE: i32 = -1;

/// Per-message framing parameters supplied by the caller of
/// [`SndBuffer::add_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct AddBufferCtrl {
    /// Copied verbatim into every fragment's INORDER bit.
    pub inorder: bool,
    /// Message TTL in milliseconds, or [`TTL_INFINITE`].
    pub ttl_ms: i32,
    /// Sender-supplied origin timestamp in microseconds since this buffer's
    /// construction; `0` means "use `now()`".
    pub srctime_us: u64,
    /// Caller-supplied message number; `None` lets the buffer assign the
    /// next monotonic one internally.
    pub msgno: Option<u32>,
}

impl Default for AddBufferCtrl {
    fn default() -> Self {
        AddBufferCtrl { inorder: true, ttl_ms: TTL_INFINITE, srctime_us: 0, msgno: None }
    }
}

/// A packet handed out by [`SndBuffer::extract_unique_packet`],
/// [`SndBuffer::read_old_packet`] or [`SndBuffer::extract_first_rexmit_packet`].
#[derive(Debug, Clone)]
pub struct ExtractedPacket {
    pub seq: SeqNo,
    pub msgno: MsgNoFlags,
    pub payload: Vec<u8>,
    pub origin_time: TimePoint,
}

/// Outcome of [`SndBuffer::read_old_packet`].
#[derive(Debug, Clone)]
pub enum ReadOldOutcome {
    /// No slot lives at the requested sequence.
    None,
    /// The slot's TTL has expired; the inclusive `[from, to]` message range
    /// should be reported to the peer as a DROP.
    Drop { from: SeqNo, to: SeqNo },
    /// A live packet, ready for retransmission.
    Packet(ExtractedPacket),
}

struct State {
    last_data_ack_seq: SeqNo,
    pending_update_ack_seq: Option<SeqNo>,
    next_msgno: u32,
    bytes_in_buffer: u64,
    /// Exponential moving average of buffer occupancy, in packets.
    avg_size_pkts: f64,
    input_rate: InputRateEstimator,
    send_rate: SendRateEstimator,
    origin_epoch: TimePoint,
}

/// Builds packets from user data, manages message numbering, TTL expiry,
/// rate estimation and retransmission extraction (component D of the core
/// protocol engine).
pub struct SndBuffer {
    array: SndPktArray,
    payload_cap: usize,
    state: Mutex<State>,
}

impl SndBuffer {
    /// Builds an empty send buffer. `payload_cap` is the maximum user-data
    /// bytes carried per packet (`MSS` minus header overhead); `first_seq`
    /// is the sequence number the first packet added will receive.
    #[must_use]
    pub fn new(payload_cap: usize, first_seq: SeqNo) -> Self {
        let now = TimePoint::now();
        SndBuffer {
            array: SndPktArray::new(),
            payload_cap: payload_cap.max(1),
            state: Mutex::new(State {
                last_data_ack_seq: first_seq,
                pending_update_ack_seq: None,
                next_msgno: 1,
                bytes_in_buffer: 0,
                avg_size_pkts: 0.0,
                input_rate: InputRateEstimator::new(0),
                send_rate: SendRateEstimator::new(),
                origin_epoch: now,
            }),
        }
    }

    /// Number of live packet slots currently held.
    #[must_use]
    pub fn size(&self) -> usize {
        self.array.len()
    }

    /// `true` if no slot is currently held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.array.is_empty()
    }

    /// Total payload bytes currently buffered.
    #[must_use]
    pub fn bytes_in_buffer(&self) -> u64 {
        self.state.lock().bytes_in_buffer
    }

    fn origin_time_for(&self, state: &State, srctime_us: u64) -> TimePoint {
        if srctime_us == 0 {
            TimePoint::now()
        } else {
            state.origin_epoch.add(Duration::from_micros(srctime_us))
        }
    }

    /// Microseconds elapsed since this buffer's construction, the same
    /// timebase `state.input_rate` was seeded with in [`Self::new`].
    fn elapsed_us(&self, state: &State) -> u64 {
        TimePoint::now().since(state.origin_epoch).as_micros() as u64
    }

    fn head_seq(&self) -> Option<SeqNo> {
        self.array.with_slot(0, |s| s.seq).ok()
    }

    fn seq_to_idx(&self, seq: SeqNo) -> Result<usize> {
        let head = self.head_seq().ok_or(Error::OutOfRange)?;
        let off = seqno::off(seq, head);
        if off < 0 {
            return Err(Error::OutOfRange);
        }
        Ok(off as usize)
    }

    /// Fragments `data` into `ceil(len / payload_cap)` packets starting at
    /// `seqno_start`, tagging boundary bits, TTL and origin time. Returns
    /// the number of packets created.
    ///
    /// # Errors
    /// Returns [`Error::NoResource`] only in the (currently unreachable in
    /// this in-memory implementation) case the array cannot allocate;
    /// callers are expected to have checked flight capacity beforehand.
    pub fn add_buffer(&self, data: &[u8], seqno_start: SeqNo, ctrl: AddBufferCtrl) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let n = data.len().div_ceil(self.payload_cap);
        let mut g = self.state.lock();

        let msgno = ctrl.msgno.unwrap_or_else(|| {
            let m = g.next_msgno;
            g.next_msgno = seqno::next_msgno(m);
            m
        });
        let origin_time = self.origin_time_for(&g, ctrl.srctime_us);
        let now_us = self.elapsed_us(&g);

        for (i, chunk) in data.chunks(self.payload_cap).enumerate() {
            let boundary = match (n, i) {
                (1, _) => Boundary::Solo,
                (_, 0) => Boundary::First,
                (len, idx) if idx == len - 1 => Boundary::Last,
                _ => Boundary::Subsequent,
            };
            let flags = MsgNoFlags {
                boundary,
                inorder: ctrl.inorder,
                enckey: EncryptionKeyFlag::NoEncryption,
                rexmit: false,
                msgno,
            };
            let seq = seqno::inc(seqno_start, i as u32);
            self.array.push(seq, flags.pack(), chunk.to_vec(), ctrl.ttl_ms, origin_time);
            g.input_rate.update(now_us, chunk.len() as u32);
        }

        g.bytes_in_buffer += data.len() as u64;
        g.avg_size_pkts = g.avg_size_pkts * 0.875 + self.array.len() as f64 * 0.125;
        Ok(n)
    }

    /// Same framing as [`Self::add_buffer`] but reads the payload from a
    /// stream, always INORDER with an infinite TTL (file-transfer mode).
    /// Returns the number of bytes actually read.
    ///
    /// # Errors
    /// Propagates any I/O error from `reader`.
    pub fn add_buffer_from_file(
        &self,
        reader: &mut impl std::io::Read,
        len: usize,
        seqno_start: SeqNo,
    ) -> Result<usize> {
        let mut buf = vec![0u8; len];
        let mut total = 0usize;
        while total < len {
            let n = reader.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        buf.truncate(total);
        self.add_buffer(
            &buf,
            seqno_start,
            AddBufferCtrl { inorder: true, ttl_ms: TTL_INFINITE, srctime_us: 0, msgno: None },
        )?;
        Ok(total)
    }

    /// Extracts the next never-before-sent packet, skipping any whose TTL
    /// has already expired (logged and counted but not surfaced as an
    /// error). `kflg` selects the encryption key specifier to stamp on the
    /// outgoing packet; `-1` fails closed (no key configured).
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if `kflg < 0`.
    pub fn extract_unique_packet(&self, kflg: i8) -> Result<Option<ExtractedPacket>> {
        let enckey = match kflg {
            0 => EncryptionKeyFlag::NoEncryption,
            1 => EncryptionKeyFlag::Even,
            2 => EncryptionKeyFlag::Odd,
            _ => return Err(Error::NotSupported),
        };
        let now = TimePoint::now();
        loop {
            let Some(idx) = self.array.extract_unique() else {
                return Ok(None);
            };
            let (seq, ttl_ms, origin_time) = self.array.with_slot(idx, |s| (s.seq, s.ttl_ms, s.origin_time))?;
            if ttl_ms >= 0 && now.since(origin_time) > Duration::from_millis(ttl_ms as u64) {
                log::debug!("[SndBuffer::extract_unique_packet] seq {seq} TTL-expired before send, dropping");
                continue;
            }
            self.array.mark_busy(idx)?;
            let (msgno_word, payload) = self.array.with_slot(idx, |s| (s.msgno, s.payload.clone()))?;
            let mut flags = MsgNoFlags::unpack(msgno_word);
            flags.enckey = enckey;
            return Ok(Some(ExtractedPacket { seq, msgno: flags, payload, origin_time }));
        }
    }

    /// Reads a specific already-sent packet back out for retransmission,
    /// or reports that its message has TTL-expired as a DROP range.
    pub fn read_old_packet(&self, seq: SeqNo, now: TimePoint) -> Result<ReadOldOutcome> {
        let idx = match self.seq_to_idx(seq) {
            Ok(i) => i,
            Err(Error::OutOfRange) => return Ok(ReadOldOutcome::None),
            Err(e) => return Err(e),
        };
        self.read_packet_internal(idx, now)
    }

    fn read_packet_internal(&self, idx: usize, now: TimePoint) -> Result<ReadOldOutcome> {
        let slot = match self.array.with_slot(idx, |s| {
            (s.seq, s.msgno, s.payload.clone(), s.ttl_ms, s.origin_time)
        }) {
            Ok(v) => v,
            Err(Error::OutOfRange) => return Ok(ReadOldOutcome::None),
            Err(e) => return Err(e),
        };
        let (seq, msgno_word, payload, ttl_ms, origin_time) = slot;
        if ttl_ms >= 0 && now.since(origin_time) > Duration::from_millis(ttl_ms as u64) {
            let msgno = MsgNoFlags::unpack(msgno_word).msgno;
            let mut last = seq;
            let mut probe = seqno::inc(seq, 1);
            while let Ok(next_idx) = self.seq_to_idx(probe) {
                match self.array.with_slot(next_idx, |s| s.msgno) {
                    Ok(word) if MsgNoFlags::unpack(word).msgno == msgno => {
                        last = probe;
                        probe = seqno::inc(probe, 1);
                    }
                    _ => break,
                }
            }
            log::debug!("[SndBuffer::read_packet_internal] message {msgno} TTL-expired, dropping [{seq},{last}]");
            return Ok(ReadOldOutcome::Drop { from: seq, to: last });
        }
        self.array.with_slot_mut(idx, |s| s.rexmit_time = Some(now))?;
        let mut flags = MsgNoFlags::unpack(msgno_word);
        flags.rexmit = true;
        Ok(ReadOldOutcome::Packet(ExtractedPacket { seq, msgno: flags, payload, origin_time }))
    }

    /// Repeatedly pulls the first retransmit-eligible loss cell, returning
    /// the first live packet found. DROP ranges encountered for TTL-expired
    /// messages along the way are appended to `drops`.
    pub fn extract_first_rexmit_packet(
        &self,
        min_interval_us: i64,
        drops: &mut Vec<(SeqNo, SeqNo)>,
    ) -> Result<Option<ExtractedPacket>> {
        loop {
            let now = TimePoint::now();
            let Some(idx) = self.array.extract_first_loss(now, min_interval_us) else {
                return Ok(None);
            };
            match self.read_packet_internal(idx, now)? {
                ReadOldOutcome::None => continue,
                ReadOldOutcome::Drop { from, to } => {
                    drops.push((from, to));
                    continue;
                }
                ReadOldOutcome::Packet(pkt) => return Ok(Some(pkt)),
            }
        }
    }

    /// Decrements the busy refcount for `seq`; if an earlier `revoke` was
    /// only partially applied because of busy slots, retries advancing
    /// `last_data_ack_seq` up to the remembered pending value.
    pub fn release_packet(&self, seq: SeqNo) -> Result<()> {
        let idx = self.seq_to_idx(seq)?;
        self.array.release_busy(idx)?;
        let pending = {
            let g = self.state.lock();
            g.pending_update_ack_seq
        };
        if let Some(ack) = pending {
            self.revoke(ack)?;
        }
        Ok(())
    }

    /// Pops every acknowledged slot up to and including `ack_seq`. Returns
    /// `true` if anything was revoked. If a still-busy slot blocks a full
    /// pop, advances `last_data_ack_seq` only by the count actually popped
    /// and remembers `ack_seq` for a later [`Self::release_packet`] retry.
    pub fn revoke(&self, ack_seq: SeqNo) -> Result<bool> {
        let mut g = self.state.lock();
        let Some(head) = self.head_seq() else {
            g.last_data_ack_seq = ack_seq;
            g.pending_update_ack_seq = None;
            return Ok(false);
        };
        let want = seqno::off(ack_seq, head) + 1;
        if want <= 0 {
            return Ok(false);
        }
        let removed = self.array.pop(want as usize);
        if removed as i32 == want {
            g.last_data_ack_seq = ack_seq;
            g.pending_update_ack_seq = None;
        } else {
            g.last_data_ack_seq = seqno::inc(g.last_data_ack_seq, removed as u32);
            g.pending_update_ack_seq = Some(ack_seq);
        }
        Ok(removed > 0)
    }

    /// Shortcut to [`SndPktArray::clear_loss`] at `seq`'s cell.
    pub fn cancel_lost_seq(&self, seq: SeqNo) -> Result<bool> {
        let idx = self.seq_to_idx(seq)?;
        self.array.clear_loss(idx)
    }

    /// Translates a sequence range `[lo, hi]` into cell indexes and installs
    /// the loss record; returns the number of cells the range covers.
    pub fn insert_loss(&self, lo: SeqNo, hi: SeqNo, next_rexmit_time: TimePoint) -> Result<usize> {
        let lo_idx = self.seq_to_idx(lo)?;
        let hi_idx = self.seq_to_idx(hi)?;
        self.array.insert_loss(lo_idx, hi_idx, next_rexmit_time)?;
        Ok(hi_idx - lo_idx + 1)
    }

    /// Drops head slots whose `origin_time` precedes `too_late_time` and
    /// are not busy. Advances `last_data_ack_seq` by the drop count
    /// (a "fake ACK", since the data will never be retransmitted). Returns
    /// `(dropped_count, dropped_bytes, first_msgno_remaining)`.
    pub fn drop_late_data(&self, too_late_time: TimePoint) -> Result<(usize, u64, u32)> {
        let mut count = 0usize;
        let mut bytes = 0u64;
        loop {
            let check = self.array.with_slot(0, |s| {
                (s.busy_refcount == 0 && s.origin_time < too_late_time, s.payload.len())
            });
            let Ok((eligible, slot_len)) = check else {
                break;
            };
            if !eligible || self.array.pop(1) == 0 {
                break;
            }
            count += 1;
            bytes += slot_len as u64;
        }
        let mut g = self.state.lock();
        g.last_data_ack_seq = seqno::inc(g.last_data_ack_seq, count as u32);
        g.bytes_in_buffer = g.bytes_in_buffer.saturating_sub(bytes);
        let first_msgno = self
            .array
            .with_slot(0, |s| MsgNoFlags::unpack(s.msgno).msgno)
            .unwrap_or(0);
        Ok((count, bytes, first_msgno))
    }

    /// Time the oldest buffered packet has been waiting to be sent, or
    /// zero if the buffer is empty.
    #[must_use]
    pub fn buffering_delay(&self, now: TimePoint) -> Duration {
        self.array.with_slot(0, |s| now.since(s.origin_time)).unwrap_or(Duration::ZERO)
    }

    /// Current send-side input-rate estimate, bytes per second.
    #[must_use]
    pub fn input_bps(&self) -> f64 {
        self.state.lock().input_rate.bps()
    }

    /// Records one packet placed on the wire for the send-rate estimator.
    pub fn record_sent(&self, now_ms: u64, bytes: u64) {
        self.state.lock().send_rate.add_sample(now_ms, bytes);
    }

    /// Current send-rate estimate, bytes per second.
    #[must_use]
    pub fn send_bps(&self, now_ms: u64) -> f64 {
        self.state.lock().send_rate.rate_bps(now_ms)
    }

    /// Last ACK sequence applied by [`Self::revoke`].
    #[must_use]
    pub fn last_data_ack_seq(&self) -> SeqNo {
        self.state.lock().last_data_ack_seq
    }
}
