// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ordered receive window and TSBPD release (component H).
//!
//! Holds an ordered window of received slots keyed by sequence, anchored at
//! `last_delivered_seq`, with the same lock-around-whole-method discipline
//! as this crate's send-side buffers: one `parking_lot::Mutex` guarding a
//! plain `VecDeque`-backed window, grown lazily as sequences arrive ahead of
//! it (mirroring the ring-buffer-with-FIFO-eviction shape of the reliability
//! history cache this crate's send path is built on, turned around to
//! accept out-of-order arrivals instead of evicting acknowledged entries).

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::TimePoint;
use crate::error::Result;
use crate::seqno::{self, Boundary, MsgNoFlags, SeqNo};

/// One received packet held in the window pending release.
#[derive(Debug, Clone)]
struct Slot {
    payload: Vec<u8>,
    msgno: MsgNoFlags,
    origin_time: TimePoint,
}

/// A packet handed to the application by [`RcvBuffer::release_ready`] or
/// skipped past by [`RcvBuffer::drop_too_late`].
#[derive(Debug, Clone)]
pub struct ReleasedPacket {
    pub seq: SeqNo,
    pub payload: Vec<u8>,
    pub msgno: MsgNoFlags,
    pub origin_time: TimePoint,
}

struct Inner {
    last_delivered_seq: SeqNo,
    /// `cells[i]` holds the packet at `seq = last_delivered_seq + 1 + i`.
    cells: VecDeque<Option<Slot>>,
    /// Parallel to `cells`: the instant an empty cell first entered the
    /// window, used to apply `LOSSMAXTTL` reorder tolerance in
    /// [`RcvBuffer::loss_list`] without a second keyed map.
    gap_since: VecDeque<Option<TimePoint>>,
}

/// Ordered receive window keyed by sequence number.
///
/// Accepts both wire-received and FEC-rebuilt packets through the same
/// acceptance path, reassembles message-mode fragments before release, and
/// exposes the loss-list / ack-point views the NAK and ACK generators
/// consume.
pub struct RcvBuffer {
    inner: Mutex<Inner>,
}

impl RcvBuffer {
    /// Builds a window anchored so that `first_seq` is the next sequence
    /// expected to arrive.
    #[must_use]
    pub fn new(first_seq: SeqNo) -> Self {
        RcvBuffer {
            inner: Mutex::new(Inner {
                last_delivered_seq: seqno::dec(first_seq, 1),
                cells: VecDeque::new(),
                gap_since: VecDeque::new(),
            }),
        }
    }

    /// Highest sequence delivered to the application so far.
    #[must_use]
    pub fn last_delivered_seq(&self) -> SeqNo {
        self.inner.lock().last_delivered_seq
    }

    /// Number of cells currently tracked (filled or empty) ahead of
    /// `last_delivered_seq`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn grow_to(inner: &mut Inner, idx: usize) {
        while inner.cells.len() <= idx {
            inner.cells.push_back(None);
            inner.gap_since.push_back(Some(TimePoint::now()));
        }
    }

    /// Places `seq` in its window slot if ahead of `last_delivered_seq` and
    /// the slot is still empty; stale or duplicate arrivals are logged and
    /// dropped without error, matching the reference semantics.
    pub fn insert(&self, seq: SeqNo, payload: Vec<u8>, msgno: MsgNoFlags, origin_time: TimePoint) -> Result<bool> {
        let mut g = self.inner.lock();
        let off = seqno::off(seq, g.last_delivered_seq);
        if off <= 0 {
            log::debug!("[RcvBuffer::insert] stale seq {seq} (off={off}), dropping");
            return Ok(false);
        }
        let idx = (off - 1) as usize;
        Self::grow_to(&mut g, idx);
        if g.cells[idx].is_some() {
            log::debug!("[RcvBuffer::insert] duplicate seq {seq}, dropping");
            return Ok(false);
        }
        g.cells[idx] = Some(Slot { payload, msgno, origin_time });
        g.gap_since[idx] = None;
        Ok(true)
    }

    /// Identical acceptance path to [`Self::insert`], used by the FEC
    /// rebuilt-packet provider list; a rebuilt packet is indistinguishable
    /// from a wire-received one once it lands in the window.
    pub fn insert_rebuilt(&self, seq: SeqNo, payload: Vec<u8>, msgno: MsgNoFlags, origin_time: TimePoint) -> Result<bool> {
        self.insert(seq, payload, msgno, origin_time)
    }

    /// Highest contiguous sequence received, for ACK generation: the
    /// largest `s` such that every cell in `(last_delivered_seq, s]` is
    /// filled.
    #[must_use]
    pub fn ack_point(&self) -> SeqNo {
        let g = self.inner.lock();
        let mut seq = g.last_delivered_seq;
        for cell in &g.cells {
            if cell.is_some() {
                seq = seqno::inc(seq, 1);
            } else {
                break;
            }
        }
        seq
    }

    /// Length, in fragments, of the message starting at cell `0` if every
    /// fragment through its `Last` boundary is already present; `None` if
    /// the chain is incomplete or breaks on a gap.
    fn complete_message_span(g: &Inner) -> Option<usize> {
        let first = g.cells.front()?.as_ref()?;
        if matches!(first.msgno.boundary, Boundary::Solo) {
            return Some(1);
        }
        let msgno = first.msgno.msgno;
        let mut span = 0usize;
        for cell in &g.cells {
            match cell {
                Some(s) if s.msgno.msgno == msgno => {
                    span += 1;
                    if matches!(s.msgno.boundary, Boundary::Last) {
                        return Some(span);
                    }
                }
                _ => return None,
            }
        }
        None
    }

    /// Releases every packet ready for delivery in sequence order.
    ///
    /// In TSBPD mode, a message is only popped once every fragment from
    /// `First` to `Last` is present and the leading fragment's
    /// `origin_time + latency <= now`; in non-TSBPD mode the time gate is
    /// skipped and complete messages release as soon as they are whole.
    pub fn release_ready(&self, now: TimePoint, latency: Duration, tsbpd: bool) -> Vec<ReleasedPacket> {
        let mut g = self.inner.lock();
        let mut out = Vec::new();
        loop {
            if tsbpd {
                let Some(Some(first)) = g.cells.front() else { break };
                if first.origin_time.add(latency) > now {
                    break;
                }
            }
            let Some(span) = Self::complete_message_span(&g) else { break };
            for _ in 0..span {
                let Some(slot) = g.cells.pop_front().and_then(|c| c) else {
                    unreachable!("complete_message_span verified these cells are filled")
                };
                g.gap_since.pop_front();
                let seq = seqno::inc(g.last_delivered_seq, 1);
                g.last_delivered_seq = seq;
                out.push(ReleasedPacket { seq, payload: slot.payload, msgno: slot.msgno, origin_time: slot.origin_time });
            }
        }
        out
    }

    /// When the oldest cell is still an unfilled gap and its arrival
    /// deadline has passed, skips over it and advances
    /// `last_delivered_seq`; `confirmed` gates this on the caller having
    /// already established (via a DROP control or a TTL-expired
    /// retransmission) that no more data for that gap is coming. Returns
    /// the number of sequences skipped.
    pub fn drop_too_late(&self, now: TimePoint, latency: Duration, confirmed: bool) -> usize {
        if !confirmed {
            return 0;
        }
        let mut g = self.inner.lock();
        let mut dropped = 0usize;
        loop {
            match g.cells.front() {
                Some(None) => {}
                _ => break,
            }
            let Some(since) = g.gap_since.front().copied().flatten() else { break };
            if since.add(latency) > now {
                break;
            }
            g.cells.pop_front();
            g.gap_since.pop_front();
            g.last_delivered_seq = seqno::inc(g.last_delivered_seq, 1);
            dropped += 1;
        }
        dropped
    }

    /// Empty cells between `last_delivered_seq` and the highest received
    /// sequence, for NAK generation, coalesced into inclusive ranges. A
    /// cell is omitted while still within `lossmaxttl` of its first
    /// appearance in the window (reorder tolerance).
    #[must_use]
    pub fn loss_list(&self, now: TimePoint, lossmaxttl: Duration) -> Vec<(SeqNo, SeqNo)> {
        let g = self.inner.lock();
        let mut ranges = Vec::new();
        let mut run: Option<(SeqNo, SeqNo)> = None;
        let mut seq = g.last_delivered_seq;
        for (cell, since) in g.cells.iter().zip(g.gap_since.iter()) {
            seq = seqno::inc(seq, 1);
            let eligible = cell.is_none() && since.is_some_and(|t| t.add(lossmaxttl) <= now);
            if eligible {
                run = Some(match run {
                    Some((start, _)) => (start, seq),
                    None => (seq, seq),
                });
            } else if let Some(r) = run.take() {
                ranges.push(r);
            }
        }
        if let Some(r) = run {
            ranges.push(r);
        }
        ranges
    }

    /// Discards every cell in the window, resetting `last_delivered_seq`
    /// to just before `seq`. Used on connection teardown.
    pub fn reset(&self, seq: SeqNo) {
        let mut g = self.inner.lock();
        g.cells.clear();
        g.gap_since.clear();
        g.last_delivered_seq = seqno::dec(seq, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solo(msgno: u32) -> MsgNoFlags {
        MsgNoFlags { boundary: Boundary::Solo, inorder: true, enckey: crate::seqno::EncryptionKeyFlag::NoEncryption, rexmit: false, msgno }
    }

    fn fragment(boundary: Boundary, msgno: u32) -> MsgNoFlags {
        MsgNoFlags { boundary, inorder: true, enckey: crate::seqno::EncryptionKeyFlag::NoEncryption, rexmit: false, msgno }
    }

    #[test]
    fn insert_rejects_stale_and_duplicate() {
        let buf = RcvBuffer::new(0);
        assert!(buf.insert(0, vec![1], solo(1), TimePoint::now()).unwrap());
        assert!(!buf.insert(0, vec![2], solo(1), TimePoint::now()).unwrap());
    }

    #[test]
    fn ack_point_tracks_contiguous_prefix_only() {
        let buf = RcvBuffer::new(0);
        buf.insert(0, vec![1], solo(1), TimePoint::now()).unwrap();
        buf.insert(2, vec![3], solo(2), TimePoint::now()).unwrap();
        assert_eq!(buf.ack_point(), 0);
        buf.insert(1, vec![2], solo(3), TimePoint::now()).unwrap();
        assert_eq!(buf.ack_point(), 2);
    }

    #[test]
    fn release_ready_non_tsbpd_pops_contiguous_prefix_immediately() {
        let buf = RcvBuffer::new(0);
        buf.insert(0, vec![1], solo(1), TimePoint::now()).unwrap();
        buf.insert(1, vec![2], solo(2), TimePoint::now()).unwrap();
        let out = buf.release_ready(TimePoint::now(), Duration::ZERO, false);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].seq, 0);
        assert_eq!(out[1].seq, 1);
        assert_eq!(buf.last_delivered_seq(), 1);
    }

    #[test]
    fn release_ready_tsbpd_waits_for_deadline() {
        let buf = RcvBuffer::new(0);
        let origin = TimePoint::now();
        buf.insert(0, vec![1], solo(1), origin).unwrap();
        let latency = Duration::from_millis(50);
        assert!(buf.release_ready(origin, latency, true).is_empty());
        let out = buf.release_ready(origin.add(latency), latency, true);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn release_ready_withholds_incomplete_message() {
        let buf = RcvBuffer::new(0);
        buf.insert(0, vec![1], fragment(Boundary::First, 7), TimePoint::now()).unwrap();
        buf.insert(1, vec![2], fragment(Boundary::Subsequent, 7), TimePoint::now()).unwrap();
        assert!(buf.release_ready(TimePoint::now(), Duration::ZERO, false).is_empty());
        buf.insert(2, vec![3], fragment(Boundary::Last, 7), TimePoint::now()).unwrap();
        let out = buf.release_ready(TimePoint::now(), Duration::ZERO, false);
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].seq, 2);
    }

    #[test]
    fn release_ready_stops_at_a_gap() {
        let buf = RcvBuffer::new(0);
        buf.insert(0, vec![1], solo(1), TimePoint::now()).unwrap();
        buf.insert(2, vec![3], solo(2), TimePoint::now()).unwrap();
        let out = buf.release_ready(TimePoint::now(), Duration::ZERO, false);
        assert_eq!(out.len(), 1);
        assert_eq!(buf.last_delivered_seq(), 0);
    }

    #[test]
    fn insert_rebuilt_shares_acceptance_path() {
        let buf = RcvBuffer::new(0);
        assert!(buf.insert_rebuilt(0, vec![9], solo(1), TimePoint::now()).unwrap());
        assert!(!buf.insert_rebuilt(0, vec![9], solo(1), TimePoint::now()).unwrap());
    }

    #[test]
    fn drop_too_late_requires_confirmation() {
        let buf = RcvBuffer::new(0);
        buf.insert(1, vec![1], solo(1), TimePoint::now()).unwrap();
        let now = TimePoint::now();
        assert_eq!(buf.drop_too_late(now, Duration::ZERO, false), 0);
        assert_eq!(buf.drop_too_late(now, Duration::ZERO, true), 1);
        assert_eq!(buf.last_delivered_seq(), 0);
    }

    #[test]
    fn drop_too_late_waits_for_deadline() {
        let buf = RcvBuffer::new(0);
        buf.insert(1, vec![1], solo(1), TimePoint::now()).unwrap();
        let now = TimePoint::now();
        let latency = Duration::from_millis(20);
        assert_eq!(buf.drop_too_late(now, latency, true), 0);
        assert_eq!(buf.drop_too_late(now.add(latency), latency, true), 1);
    }

    #[test]
    fn loss_list_reports_gaps_past_reorder_tolerance() {
        let buf = RcvBuffer::new(0);
        buf.insert(0, vec![1], solo(1), TimePoint::now()).unwrap();
        buf.insert(3, vec![2], solo(2), TimePoint::now()).unwrap();
        let ttl = Duration::from_millis(10);
        let now = TimePoint::now();
        assert!(buf.loss_list(now, ttl).is_empty());
        let later = now.add(ttl);
        assert_eq!(buf.loss_list(later, ttl), vec![(1, 2)]);
    }

    #[test]
    fn reset_clears_window() {
        let buf = RcvBuffer::new(0);
        buf.insert(0, vec![1], solo(1), TimePoint::now()).unwrap();
        buf.reset(5);
        assert!(buf.is_empty());
        assert_eq!(buf.last_delivered_seq(), 4);
    }
}
