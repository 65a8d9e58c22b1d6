// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Send-packet array (component C): the physical packet store behind the
//! send buffer, threading a loss linked list through its cells.
//!
//! Mirrors the ring-buffer-plus-lock-poisoning-recovery discipline used
//! throughout this crate's history/eviction structures: one [`Mutex`] guards
//! a [`VecDeque`] of slots, with every public method re-acquiring the lock
//! for its full duration (§5's single-mutex-per-subsystem model).

use crate::clock::TimePoint;
use crate::error::{Error, Result};
use crate::seqno::SeqNo;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// One packet slot owned by the array.
#[derive(Debug, Clone)]
pub struct Slot {
    pub seq: SeqNo,
    /// The packed MSGNO/flags word (§3's `msgno_flags`): boundary, inorder,
    /// key selector, rexmit bit and the 26-bit message number, as produced
    /// by [`crate::seqno::MsgNoFlags::pack`]. The send buffer owns the
    /// packing/unpacking; this array only stores the opaque word.
    pub msgno: u32,
    pub payload: Vec<u8>,
    pub ttl_ms: i32,
    pub origin_time: TimePoint,
    pub rexmit_time: Option<TimePoint>,
    pub next_rexmit_time: Option<TimePoint>,
    pub busy_refcount: u32,
    /// `true` once `extract_unique` has handed this slot out at least once.
    pub extracted: bool,
    /// Length of the loss range starting at this cell, `0` if this cell is
    /// not a loss-chain head.
    loss_length: u32,
    /// Distance in cells to the next loss-chain head, `0` if this is the
    /// last head (or not a head at all).
    next_loss_offset: u32,
}

impl Slot {
    fn new(seq: SeqNo, msgno: u32, payload: Vec<u8>, ttl_ms: i32, origin_time: TimePoint) -> Self {
        Slot {
            seq,
            msgno,
            payload,
            ttl_ms,
            origin_time,
            rexmit_time: None,
            next_rexmit_time: None,
            busy_refcount: 0,
            extracted: false,
            loss_length: 0,
            next_loss_offset: 0,
        }
    }

    fn is_loss_head(&self) -> bool {
        self.loss_length > 0
    }
}

struct Inner {
    cells: VecDeque<Slot>,
    /// Index (into `cells`) of the first loss-chain head, `None` if empty.
    first_rexmit: Option<usize>,
    /// Index of the last loss-chain head, `None` if empty.
    last_rexmit: Option<usize>,
    /// Number of cells still marked "newly queued" at the front, counted
    /// from the first unextracted slot onward. `extract_unique` always
    /// pulls from the oldest unextracted slot, so this is tracked as a
    /// cursor rather than a count.
    next_unique: usize,
    loss_length_cache: u64,
}

/// Threaded send-packet array: a deque of slots plus a loss linked list.
pub struct SndPktArray {
    inner: Mutex<Inner>,
}

impl SndPktArray {
    /// Builds an empty array.
    #[must_use]
    pub fn new() -> Self {
        SndPktArray {
            inner: Mutex::new(Inner {
                cells: VecDeque::new(),
                first_rexmit: None,
                last_rexmit: None,
                next_unique: 0,
                loss_length_cache: 0,
            }),
        }
    }

    fn lock(&self) -> parking_lot::MutexGuard<'_, Inner> {
        self.inner.lock()
    }

    /// Appends a new, not-yet-sent slot at the tail.
    pub fn push(&self, seq: SeqNo, msgno: u32, payload: Vec<u8>, ttl_ms: i32, origin_time: TimePoint) {
        let mut g = self.lock();
        g.cells.push_back(Slot::new(seq, msgno, payload, ttl_ms, origin_time));
    }

    /// Returns the oldest slot never yet extracted, marking it extracted.
    /// `None` if every slot has already been extracted at least once.
    pub fn extract_unique(&self) -> Option<usize> {
        let mut g = self.lock();
        while g.next_unique < g.cells.len() {
            let idx = g.next_unique;
            g.next_unique += 1;
            if !g.cells[idx].extracted {
                g.cells[idx].extracted = true;
                return Some(idx);
            }
        }
        None
    }

    /// Runs `f` against the slot at `idx`, or returns `Error::OutOfRange`.
    pub fn with_slot<T>(&self, idx: usize, f: impl FnOnce(&Slot) -> T) -> Result<T> {
        let g = self.lock();
        g.cells.get(idx).map(f).ok_or(Error::OutOfRange)
    }

    /// Runs `f` mutably against the slot at `idx`.
    pub fn with_slot_mut<T>(&self, idx: usize, f: impl FnOnce(&mut Slot) -> T) -> Result<T> {
        let mut g = self.lock();
        let len = g.cells.len();
        g.cells.get_mut(idx).map(f).ok_or(Error::OutOfRange).inspect_err(|_| {
            log::debug!("[SndPktArray::with_slot_mut] index {idx} out of range (len={len})");
        })
    }

    /// Number of live cells.
    pub fn len(&self) -> usize {
        self.lock().cells.len()
    }

    /// `true` if no cells remain.
    pub fn is_empty(&self) -> bool {
        self.lock().cells.is_empty()
    }

    /// Removes up to `n` slots from the head, stopping at the first slot
    /// still busy (`busy_refcount > 0`). Returns the count actually removed.
    pub fn pop(&self, n: usize) -> usize {
        let mut g = self.lock();
        let mut removed = 0;
        while removed < n {
            match g.cells.front() {
                Some(front) if front.busy_refcount == 0 => {
                    let was_head = front.is_loss_head();
                    if was_head {
                        let len = front.loss_length;
                        let next_off = front.next_loss_offset;
                        g.loss_length_cache = g.loss_length_cache.saturating_sub(len as u64);
                        // next_loss_offset is a distance from this (front, index 0)
                        // head to the next one, so the next head's absolute index
                        // in the pre-pop frame is simply that distance.
                        g.first_rexmit = if next_off == 0 { None } else { Some(next_off as usize) };
                        if g.first_rexmit.is_none() {
                            g.last_rexmit = None;
                        }
                    }
                    g.cells.pop_front();
                    removed += 1;
                    g.next_unique = g.next_unique.saturating_sub(1);
                    shift_loss_indices(&mut g, 1);
                }
                _ => break,
            }
        }
        removed
    }

    /// Installs (or merges) a loss range `[lo, hi]` (cell indexes,
    /// inclusive), due for retransmission no earlier than `next_rexmit_time`.
    pub fn insert_loss(&self, lo: usize, hi: usize, next_rexmit_time: TimePoint) -> Result<bool> {
        if hi < lo {
            return Err(Error::InvalidArgument("insert_loss: hi < lo".into()));
        }
        let mut g = self.lock();
        if hi >= g.cells.len() {
            return Err(Error::OutOfRange);
        }

        // Collect existing loss ranges as (start, len) pairs for simplicity;
        // the array is small enough in practice (bounded by FC) that
        // rebuilding the chain on each insert is acceptable and keeps the
        // merge/split logic easy to verify against the invariants in §3.
        let mut ranges = collect_ranges(&g);
        for s in &mut g.cells {
            s.loss_length = 0;
            s.next_loss_offset = 0;
        }

        // Merge [lo, hi] into the existing set, touching/overlapping ranges
        // merge into one.
        let mut merged_lo = lo;
        let mut merged_hi = hi;
        let mut kept = Vec::with_capacity(ranges.len() + 1);
        for (s, len) in ranges.drain(..) {
            let e = s + len - 1;
            if e + 1 < merged_lo || s > merged_hi + 1 {
                kept.push((s, len));
            } else {
                merged_lo = merged_lo.min(s);
                merged_hi = merged_hi.max(e);
            }
        }
        kept.push((merged_lo, merged_hi - merged_lo + 1));
        kept.sort_unstable_by_key(|&(s, _)| s);

        for w in kept.windows(2) {
            for (&(s0, l0), &(s1, _l1)) in [(w[0], w[1])].iter() {
                if s0 + l0 > s1 {
                    return Err(Error::IntegrityViolation("loss ranges overlap after merge".into()));
                }
            }
        }

        g.loss_length_cache = kept.iter().map(|&(_, l)| l as u64).sum();
        g.first_rexmit = kept.first().map(|&(s, _)| s);
        g.last_rexmit = kept.last().map(|&(s, _)| s);
        for (i, &(s, l)) in kept.iter().enumerate() {
            // Stored as a *distance* to the next head (not an absolute index)
            // so it stays valid across pop()'s uniform index shift.
            let next = kept.get(i + 1).map_or(0, |&(ns, _)| (ns - s) as u32);
            g.cells[s].loss_length = l as u32;
            g.cells[s].next_loss_offset = next;
            g.cells[s].next_rexmit_time = Some(next_rexmit_time);
        }
        Ok(true)
    }

    /// Clears loss records up to and including cell index `n`, splitting
    /// the straddling record if one covers `n`.
    pub fn remove_loss(&self, n: usize) -> Result<()> {
        let mut g = self.lock();
        let ranges = collect_ranges(&g);
        for s in &mut g.cells {
            s.loss_length = 0;
            s.next_loss_offset = 0;
        }
        let mut kept: Vec<(usize, usize)> = Vec::new();
        for (s, len) in ranges {
            let e = s + len - 1;
            if e <= n {
                continue;
            } else if s > n {
                kept.push((s, len));
            } else {
                kept.push((n + 1, e - n));
            }
        }
        kept.sort_unstable_by_key(|&(s, _)| s);
        g.loss_length_cache = kept.iter().map(|&(_, l)| l as u64).sum();
        g.first_rexmit = kept.first().map(|&(s, _)| s);
        g.last_rexmit = kept.last().map(|&(s, _)| s);
        for (i, &(s, l)) in kept.iter().enumerate() {
            let next = kept.get(i + 1).map_or(0, |&(ns, _)| (ns - s) as u32);
            if s < g.cells.len() {
                g.cells[s].loss_length = l as u32;
                g.cells[s].next_loss_offset = next;
            }
        }
        Ok(())
    }

    /// Clears the `next_rexmit_time` of cell `idx`. Returns `false` if it
    /// was already clear (not scheduled).
    pub fn clear_loss(&self, idx: usize) -> Result<bool> {
        let mut g = self.lock();
        let slot = g.cells.get_mut(idx).ok_or(Error::OutOfRange)?;
        if slot.next_rexmit_time.is_none() {
            Ok(false)
        } else {
            slot.next_rexmit_time = None;
            Ok(true)
        }
    }

    /// Finds the first loss-chain cell eligible for retransmission (its
    /// `next_rexmit_time <= now + min_interval`), dropping any cleared
    /// cells encountered along the way. Returns `None` if no eligible cell
    /// remains.
    pub fn extract_first_loss(&self, now: TimePoint, min_interval_us: i64) -> Option<usize> {
        let mut g = self.lock();
        loop {
            let head = g.first_rexmit?;
            let slot = &g.cells[head];
            match slot.next_rexmit_time {
                Some(t) if t.since(now) <= std::time::Duration::from_micros(min_interval_us.max(0) as u64) || now >= t => {
                    return Some(head);
                }
                Some(_) => return None,
                None => {
                    // Cleared head: drop it and continue.
                    drop(g);
                    let _ = self.remove_loss(head);
                    g = self.lock();
                }
            }
        }
    }

    /// Total number of cells currently covered by loss records.
    pub fn loss_length_cache(&self) -> u64 {
        self.lock().loss_length_cache
    }

    /// Increments the busy refcount for `idx`.
    pub fn mark_busy(&self, idx: usize) -> Result<()> {
        self.with_slot_mut(idx, |s| s.busy_refcount += 1)
    }

    /// Decrements the busy refcount for `idx`, saturating at zero.
    pub fn release_busy(&self, idx: usize) -> Result<()> {
        self.with_slot_mut(idx, |s| s.busy_refcount = s.busy_refcount.saturating_sub(1))
    }

    /// Verifies the invariants from §3: head/tail emptiness agreement,
    /// non-head cells zeroed, and the cache matching the true sum.
    pub fn validate_loss_integrity(&self) -> Result<()> {
        let g = self.lock();
        if (g.first_rexmit.is_none()) != (g.last_rexmit.is_none()) {
            return Err(Error::IntegrityViolation("first/last rexmit disagree on emptiness".into()));
        }
        let sum: u64 = g.cells.iter().map(|s| s.loss_length as u64).sum();
        if sum != g.loss_length_cache {
            return Err(Error::IntegrityViolation("loss_length_cache mismatch".into()));
        }
        Ok(())
    }
}

impl Default for SndPktArray {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_ranges(g: &Inner) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut idx = g.first_rexmit;
    while let Some(i) = idx {
        let s = &g.cells[i];
        out.push((i, s.loss_length as usize));
        // next_loss_offset is a distance from this head to the next one.
        idx = if s.next_loss_offset == 0 { None } else { Some(i + s.next_loss_offset as usize) };
    }
    out
}

fn shift_loss_indices(g: &mut Inner, by: usize) {
    g.first_rexmit = g.first_rexmit.map(|i| i.saturating_sub(by));
    g.last_rexmit = g.last_rexmit.map(|i| i.saturating_sub(by));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn push_n(arr: &SndPktArray, n: usize) {
        let t0 = TimePoint::now();
        for i in 0..n {
            arr.push(i as u32, 1, vec![0u8; 8], 1000, t0);
        }
    }

    #[test]
    fn extract_unique_returns_in_order_then_none() {
        let arr = SndPktArray::new();
        push_n(&arr, 3);
        assert_eq!(arr.extract_unique(), Some(0));
        assert_eq!(arr.extract_unique(), Some(1));
        assert_eq!(arr.extract_unique(), Some(2));
        assert_eq!(arr.extract_unique(), None);
    }

    #[test]
    fn insert_loss_merges_overlapping_and_adjacent_ranges() {
        // scenario 2 from the testable-properties section
        let arr = SndPktArray::new();
        push_n(&arr, 10);
        let t = TimePoint::now();
        arr.insert_loss(2, 4, t).unwrap();
        arr.insert_loss(7, 8, t).unwrap();
        arr.insert_loss(3, 7, t).unwrap();
        arr.validate_loss_integrity().unwrap();
        assert_eq!(arr.loss_length_cache(), 7);
        let g = arr.lock();
        assert_eq!(g.first_rexmit, Some(2));
        assert_eq!(g.last_rexmit, Some(2));
        assert_eq!(g.cells[2].loss_length, 7);
        assert_eq!(g.cells[2].next_loss_offset, 0);
    }

    #[test]
    fn remove_loss_splits_straddling_record() {
        let arr = SndPktArray::new();
        push_n(&arr, 10);
        let t = TimePoint::now();
        arr.insert_loss(2, 8, t).unwrap();
        arr.remove_loss(4).unwrap();
        arr.validate_loss_integrity().unwrap();
        let g = arr.lock();
        assert_eq!(g.first_rexmit, Some(5));
        assert_eq!(g.cells[5].loss_length, 4);
    }

    #[test]
    fn clear_loss_reports_previous_state() {
        let arr = SndPktArray::new();
        push_n(&arr, 5);
        let t = TimePoint::now();
        arr.insert_loss(1, 1, t).unwrap();
        assert!(arr.clear_loss(1).unwrap());
        assert!(!arr.clear_loss(1).unwrap());
    }

    #[test]
    fn extract_first_loss_skips_cleared_cells() {
        let arr = SndPktArray::new();
        push_n(&arr, 5);
        let past = TimePoint::now();
        arr.insert_loss(0, 0, past).unwrap();
        arr.insert_loss(2, 2, past).unwrap();
        arr.clear_loss(0).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let now = TimePoint::now();
        let found = arr.extract_first_loss(now, 0);
        assert_eq!(found, Some(2));
    }

    #[test]
    fn pop_stops_at_first_busy_slot() {
        let arr = SndPktArray::new();
        push_n(&arr, 4);
        arr.mark_busy(1).unwrap();
        let removed = arr.pop(4);
        assert_eq!(removed, 1);
        assert_eq!(arr.len(), 3);
    }

    #[test]
    fn pop_keeps_later_loss_head_index_correct_across_multiple_pops() {
        // Two disjoint loss records (head 2, len 3) and (head 6, len 2) over
        // 10 cells. Popping the first record's cells one at a time must not
        // desync the second record's tracked index: next_loss_offset is a
        // distance between heads, invariant under the uniform index shift
        // pop() applies, while first_rexmit/last_rexmit (absolute indexes)
        // shift by exactly one per pop.
        let arr = SndPktArray::new();
        push_n(&arr, 10);
        let t = TimePoint::now();
        arr.insert_loss(2, 4, t).unwrap();
        arr.insert_loss(6, 7, t).unwrap();
        arr.validate_loss_integrity().unwrap();

        assert_eq!(arr.pop(1), 1); // removes cell 0 (not a head)
        arr.validate_loss_integrity().unwrap();
        assert_eq!(arr.pop(1), 1); // removes cell 1 (not a head)
        arr.validate_loss_integrity().unwrap();
        assert_eq!(arr.pop(1), 1); // removes cell 2: first loss head, len 3
        arr.validate_loss_integrity().unwrap();

        let g = arr.lock();
        // Original cell 6 is now at index 6 - 3 = 3.
        assert_eq!(g.first_rexmit, Some(3));
        assert_eq!(g.last_rexmit, Some(3));
        assert_eq!(g.cells[3].loss_length, 2);
        assert_eq!(g.cells[3].next_loss_offset, 0);
        drop(g);
        assert_eq!(arr.loss_length_cache(), 2);
    }

    #[test]
    fn out_of_range_access_errors() {
        let arr = SndPktArray::new();
        push_n(&arr, 2);
        assert!(arr.with_slot(5, |_| ()).is_err());
    }

    #[test]
    fn concurrent_push_and_extract_is_consistent() {
        let arr = std::sync::Arc::new(SndPktArray::new());
        let writer = arr.clone();
        let handle = std::thread::spawn(move || {
            push_n(&writer, 200);
        });
        handle.join().unwrap();
        let mut extracted = 0;
        while arr.extract_unique().is_some() {
            extracted += 1;
        }
        assert_eq!(extracted, 200);
    }
}
