// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Row/column XOR-parity packet filter (component F).
//!
//! No direct counterpart exists elsewhere in this crate's ancestry — this
//! module is built fresh from §4.F, in the locking/logging/test idiom the
//! rest of this crate uses (a single [`Mutex`]-guarded inner state, explicit
//! `log::debug!`/`log::warn!` at the same kinds of call sites
//! [`crate::sndarray`] logs at: capacity-driven resets, duplicate/stale
//! input, integrity resets).
//!
//! Configuration string: `fec,cols:N[,rows:M][,layout:even|staircase][,arq:never|onreq|always]`.
//! `rows` defaults to 1 (row parity only, no columns). A magnitude greater
//! than 1 enables column parity sized to that magnitude; writing it negative
//! (`-M`) keeps the columns but suppresses row parity control packets.

use crate::error::{Error, Result};
use crate::packet::FilterControlPayload;
use crate::seqno::{self, SeqNo};
use parking_lot::Mutex;
use std::collections::HashSet;

/// Upper bound on how many historical series the receiver keeps before an
/// emergency shrink, matching `SRT_FEC_MAX_RCV_HISTORY`.
pub const SRT_FEC_MAX_RCV_HISTORY: usize = 10;

/// FEC matrix layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Columns aligned directly beneath their row.
    Even,
    /// Columns diagonally shifted by one row each step, improving
    /// burst-loss recovery.
    Staircase,
}

/// When irrecoverable losses are reported to the retransmission layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArqLevel {
    Never,
    OnRequest,
    Always,
}

/// Parsed `fec,...` filter configuration.
#[derive(Debug, Clone, Copy)]
pub struct FilterConfig {
    pub cols: usize,
    /// Column-group capacity (the `rows` magnitude). `1` means "no columns".
    pub rows: usize,
    /// Set when the config string wrote `rows` as a negative number: row
    /// parity is disabled but the column groups stay sized to `rows`.
    pub cols_only: bool,
    pub layout: Layout,
    pub arq: ArqLevel,
}

impl FilterConfig {
    /// Parses a configuration string of the form described at module level.
    ///
    /// # Errors
    /// Returns [`Error::FilterConfig`] if `cols` is missing or `< 2`, if
    /// `rows` is `0` or `-1` (neither enables nor meaningfully disables a
    /// dimension), or any key is malformed.
    pub fn parse(s: &str) -> Result<Self> {
        let mut cols = None;
        let mut rows = 1usize;
        let mut cols_only = false;
        let mut layout = Layout::Even;
        let mut arq = ArqLevel::OnRequest;

        for (i, tok) in s.split(',').enumerate() {
            if i == 0 {
                if tok != "fec" {
                    return Err(Error::FilterConfig(format!("expected 'fec', got '{tok}'")));
                }
                continue;
            }
            let (key, val) = tok.split_once(':').ok_or_else(|| {
                Error::FilterConfig(format!("malformed key:value pair '{tok}'"))
            })?;
            match key {
                "cols" => {
                    let n: usize = val
                        .parse()
                        .map_err(|_| Error::FilterConfig(format!("bad cols value '{val}'")))?;
                    if n < 2 {
                        return Err(Error::FilterConfig("cols must be > 1".into()));
                    }
                    cols = Some(n);
                }
                "rows" => {
                    let n: i64 = val
                        .parse()
                        .map_err(|_| Error::FilterConfig(format!("bad rows value '{val}'")))?;
                    if n == 0 || n == -1 {
                        return Err(Error::FilterConfig("rows must be >= 1 or <= -2".into()));
                    }
                    if n < 0 {
                        rows = (-n) as usize;
                        cols_only = true;
                    } else {
                        rows = n as usize;
                        cols_only = false;
                    }
                }
                "layout" => {
                    layout = match val {
                        "even" => Layout::Even,
                        "staircase" => Layout::Staircase,
                        other => return Err(Error::FilterConfig(format!("unknown layout '{other}'"))),
                    };
                }
                "arq" => {
                    arq = match val {
                        "never" => ArqLevel::Never,
                        "onreq" => ArqLevel::OnRequest,
                        "always" => ArqLevel::Always,
                        other => return Err(Error::FilterConfig(format!("unknown arq level '{other}'"))),
                    };
                }
                other => return Err(Error::FilterConfig(format!("unknown key '{other}'"))),
            }
        }

        Ok(FilterConfig { cols: cols.ok_or_else(|| Error::FilterConfig("missing 'cols'".into()))?, rows, cols_only, layout, arq })
    }

    /// Whether column groups are tracked at all (magnitude above 1).
    pub fn columns_enabled(&self) -> bool {
        self.rows > 1
    }

    /// Whether row control packets are emitted (false in `-M` / cols-only mode).
    pub fn row_enabled(&self) -> bool {
        !self.cols_only
    }

    fn min_series_history(&self) -> usize {
        match self.layout {
            Layout::Staircase => 4,
            Layout::Even => 2,
        }
    }

    fn matrix_size(&self) -> usize {
        self.cols * self.rows
    }
}

/// Starting sequence numbers for a full series of `cfg.cols` column groups,
/// given the series' own root sequence (the row-0 base of that series).
fn column_bases(cfg: &FilterConfig, series_base: SeqNo) -> Vec<SeqNo> {
    let mut result = Vec::with_capacity(cfg.cols);
    match cfg.layout {
        Layout::Even => {
            for i in 0..cfg.cols {
                result.push(seqno::inc(series_base, i as u32));
            }
        }
        Layout::Staircase => {
            let mut offset: u32 = 0;
            for col in 0..cfg.cols {
                result.push(seqno::inc(series_base, offset));
                if col % cfg.rows == cfg.rows - 1 {
                    offset = (col + 1) as u32;
                } else {
                    offset += 1 + cfg.cols as u32;
                }
            }
        }
    }
    result
}

#[derive(Debug, Clone)]
struct Group {
    base: SeqNo,
    collected: usize,
    capacity: usize,
    fec_received: bool,
    payload_xor: Vec<u8>,
    length_xor: u16,
    flag_xor: u8,
    timestamp_xor: u32,
    /// Per-member arrival bitmap, indexed by position within the group
    /// (cell `i` corresponds to `seqno::inc(base, i * step)`, `step` being
    /// `1` for a row and the row size for a column). Used to identify the
    /// single missing member when the group is one short of full, without
    /// depending on the receiver's separate cell bitmap staying in sync.
    received: Vec<bool>,
}

impl Group {
    fn new(base: SeqNo, capacity: usize, payload_cap: usize) -> Self {
        Group {
            base,
            collected: 0,
            capacity,
            fec_received: false,
            payload_xor: vec![0u8; payload_cap],
            length_xor: 0,
            flag_xor: 0,
            timestamp_xor: 0,
            received: vec![false; capacity],
        }
    }

    fn clip_data_at(&mut self, member_idx: usize, payload: &[u8], length: u16, flag: u8, timestamp: u32) {
        for (dst, src) in self.payload_xor.iter_mut().zip(payload.iter()) {
            *dst ^= src;
        }
        self.length_xor ^= length;
        self.flag_xor ^= flag;
        self.timestamp_xor ^= timestamp;
        self.collected += 1;
        if let Some(slot) = self.received.get_mut(member_idx) {
            *slot = true;
        }
    }

    /// The single member index not yet marked received, if exactly one is
    /// missing.
    fn missing_member(&self) -> Option<usize> {
        self.received.iter().position(|r| !r)
    }

    fn clip_control(&mut self, p: &FilterControlPayload, timestamp: u32) {
        for (dst, src) in self.payload_xor.iter_mut().zip(p.data_xor.iter()) {
            *dst ^= src;
        }
        self.length_xor ^= p.length_xor;
        self.flag_xor ^= p.encryption_flag_xor;
        self.timestamp_xor ^= timestamp;
        self.fec_received = true;
    }

    fn is_full(&self) -> bool {
        self.collected >= self.capacity
    }
}

/// A packet rebuilt by the receiver from row or column parity.
#[derive(Debug, Clone)]
pub struct RebuiltPacket {
    pub seq: SeqNo,
    pub payload: Vec<u8>,
    pub length: u16,
    pub encryption_flag: u8,
    pub timestamp: u32,
}

/// Sender-side state: one active row group plus (if configured) one active
/// group per column.
pub struct FecSender {
    cfg: FilterConfig,
    payload_cap: usize,
    row: Mutex<Group>,
    cols: Mutex<Vec<Group>>,
}

impl FecSender {
    /// Builds a sender starting its first row/column groups at `base`.
    #[must_use]
    pub fn new(cfg: FilterConfig, payload_cap: usize, base: SeqNo) -> Self {
        let cols = if cfg.columns_enabled() {
            column_bases(&cfg, base).into_iter().map(|b| Group::new(b, cfg.rows, payload_cap)).collect()
        } else {
            Vec::new()
        };
        FecSender { cfg, payload_cap, row: Mutex::new(Group::new(base, cfg.cols, payload_cap)), cols: Mutex::new(cols) }
    }

    /// Feeds one outgoing data packet into the row/column accumulators.
    ///
    /// Member positions are derived from `seq`'s real offset against each
    /// group's own base, not from arrival order: under [`Layout::Staircase`]
    /// a column's base can sit ahead of the very first packets of a stream
    /// (the diagonal shift makes those bases "from the future"), in which
    /// case this packet contributes to no column group at all and is only
    /// recoverable via the row. Mirrors the reference `feedSource`'s
    /// `vert_pos`/`<NO-COLUMN>` handling.
    pub fn feed_source(&self, seq: SeqNo, payload: &[u8], length: u16, enc_flag: u8, timestamp: u32) {
        let mut row = self.row.lock();
        let horiz_pos = seqno::off(seq, row.base).max(0) as usize;
        if horiz_pos >= row.capacity {
            *row = Group::new(seqno::inc(row.base, self.cfg.cols as u32), self.cfg.cols, self.payload_cap);
        }
        let row_pos = seqno::off(seq, row.base).max(0) as usize;
        row.clip_data_at(row_pos, payload, length, enc_flag, timestamp);
        drop(row);

        if !self.cfg.columns_enabled() {
            return;
        }
        let vert_gx = row_pos % self.cfg.cols;
        let mut cols = self.cols.lock();
        if let Some(g) = cols.get_mut(vert_gx) {
            let vert_off = seqno::off(seq, g.base);
            if vert_off >= 0 {
                let vert_pos = vert_off as usize / self.cfg.cols;
                if vert_pos >= g.capacity {
                    *g = Group::new(seqno::inc(g.base, self.cfg.matrix_size() as u32), self.cfg.rows, self.payload_cap);
                }
                let pos = seqno::off(seq, g.base).max(0) as usize / self.cfg.cols;
                g.clip_data_at(pos, payload, length, enc_flag, timestamp);
            }
            // else: this column's base is still ahead of `seq` (only possible
            // early in a staircase series) — no column covers this packet.
        }
    }

    /// Emits a control packet if either a column or the row group has just
    /// filled. Column groups are checked first, matching the priority in
    /// §4.F; a full row group always resets even when `rows` is negative
    /// (cols-only mode), it just doesn't produce a row control packet.
    pub fn pack_control_packet(&self) -> Option<FilterControlPayload> {
        if self.cfg.columns_enabled() {
            let mut cols = self.cols.lock();
            for (i, g) in cols.iter_mut().enumerate() {
                if g.is_full() {
                    let payload = FilterControlPayload {
                        column_index: i as i8,
                        encryption_flag_xor: g.flag_xor,
                        length_xor: g.length_xor,
                        data_xor: g.payload_xor.clone(),
                    };
                    *g = Group::new(seqno::inc(g.base, self.cfg.matrix_size() as u32), self.cfg.rows, self.payload_cap);
                    return Some(payload);
                }
            }
        }
        let mut row = self.row.lock();
        if row.is_full() {
            let emit = if self.cfg.row_enabled() {
                Some(FilterControlPayload {
                    column_index: crate::packet::FILTER_ROW,
                    encryption_flag_xor: row.flag_xor,
                    length_xor: row.length_xor,
                    data_xor: row.payload_xor.clone(),
                })
            } else {
                None
            };
            *row = Group::new(seqno::inc(row.base, self.cfg.cols as u32), self.cfg.cols, self.payload_cap);
            return emit;
        }
        None
    }
}

/// Receiver-side state: a cell bitmap, a growable row queue, and a
/// series-growable column queue.
pub struct FecReceiver {
    cfg: FilterConfig,
    payload_cap: usize,
    inner: Mutex<ReceiverInner>,
}

struct ReceiverInner {
    cell_base: SeqNo,
    cells: Vec<bool>,
    rowq: Vec<Group>,
    /// Column groups, laid out as whole series of `cfg.cols` groups each.
    colq: Vec<Group>,
    /// Row-0 base of the oldest (series 0) column series, used to locate
    /// which series an incoming sequence belongs to.
    colq_root: SeqNo,
    rebuilt: Vec<RebuiltPacket>,
    irrecoverable: Vec<(SeqNo, SeqNo)>,
    /// Row bases already reported via `irrecoverable`, so a slow-filling
    /// front row isn't reported again on every subsequent packet.
    reported_irrecoverable: HashSet<SeqNo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkMode {
    Received,
    Remove,
    Extend,
}

impl FecReceiver {
    /// Builds a receiver anchored at `base`.
    #[must_use]
    pub fn new(cfg: FilterConfig, payload_cap: usize, base: SeqNo) -> Self {
        let colq = if cfg.columns_enabled() {
            column_bases(&cfg, base).into_iter().map(|b| Group::new(b, cfg.rows, payload_cap)).collect()
        } else {
            Vec::new()
        };
        FecReceiver {
            cfg,
            payload_cap,
            inner: Mutex::new(ReceiverInner {
                cell_base: base,
                cells: Vec::new(),
                rowq: vec![Group::new(base, cfg.cols, payload_cap)],
                colq,
                colq_root: base,
                rebuilt: Vec::new(),
                irrecoverable: Vec::new(),
                reported_irrecoverable: HashSet::new(),
            }),
        }
    }

    fn cell_index(g: &ReceiverInner, seq: SeqNo) -> Option<usize> {
        let off = seqno::off(seq, g.cell_base);
        if off < 0 {
            None
        } else {
            Some(off as usize)
        }
    }

    /// Marks cell `seq` according to `mode`, extending the bitmap storage as
    /// needed; in [`MarkMode::Extend`], new cells default to unreceived.
    pub fn mark_cell_received(&self, seq: SeqNo, mode: MarkMode) {
        let mut g = self.inner.lock();
        let Some(idx) = Self::cell_index(&g, seq) else { return };
        if idx >= g.cells.len() {
            g.cells.resize(idx + 1, false);
        }
        match mode {
            MarkMode::Received => g.cells[idx] = true,
            MarkMode::Remove => g.cells[idx] = false,
            MarkMode::Extend => {}
        }
    }

    /// Detects a large gap in incoming sequence relative to the oldest row
    /// group and, if it exceeds the thresholds in §4.F, resets the row (and,
    /// if configured, column) queues to a new base so memory does not grow
    /// unbounded across an outage.
    pub fn check_large_drop(&self, seq: SeqNo) {
        let mut g = self.inner.lock();
        let Some(first) = g.rowq.first() else { return };
        let off = seqno::off(seq, first.base);
        let row_size = self.cfg.cols as i32;
        let threshold = 5 * row_size;
        if off > threshold {
            let new_base = seqno::inc(first.base, ((off / row_size) * row_size) as u32);
            log::warn!("[FecReceiver::check_large_drop] large gap detected, resetting row queue to base {new_base}");
            g.rowq = vec![Group::new(new_base, self.cfg.cols, self.payload_cap)];
            g.cell_base = new_base;
            g.cells.clear();
            g.reported_irrecoverable.clear();
            if self.cfg.columns_enabled() {
                g.colq = column_bases(&self.cfg, new_base).into_iter().map(|b| Group::new(b, self.cfg.rows, self.payload_cap)).collect();
                g.colq_root = new_base;
            }
        }
    }

    /// Enforces the emergency-shrink caps from §4.F, dropping the oldest
    /// series when any bound would otherwise be exceeded.
    fn enforce_shrink_caps(&self, g: &mut ReceiverInner, rcv_buffer_size: usize) {
        let n_series = g.rowq.len() / self.cfg.rows.max(1);
        let size_in_packets = g.cells.len();
        let min_hist = self.cfg.min_series_history();
        let too_many_series = n_series > min_hist.max(SRT_FEC_MAX_RCV_HISTORY);
        let too_big = size_in_packets > rcv_buffer_size / 2;
        let over_hard_cap = n_series > SRT_FEC_MAX_RCV_HISTORY;
        if too_many_series || too_big || over_hard_cap {
            log::debug!("[FecReceiver::enforce_shrink_caps] emergency shrink triggered (series={n_series}, size={size_in_packets})");
            let keep_rows = self.cfg.cols.max(1);
            let keep_from = g.rowq.len().saturating_sub(keep_rows);
            g.rowq.drain(0..keep_from);
            if let Some(first) = g.rowq.first() {
                g.cell_base = first.base;
            }
            g.cells.clear();
            g.reported_irrecoverable.clear();
            if self.cfg.columns_enabled() {
                g.colq = column_bases(&self.cfg, g.cell_base).into_iter().map(|b| Group::new(b, self.cfg.rows, self.payload_cap)).collect();
                g.colq_root = g.cell_base;
            }
        }
    }

    /// Locates (growing `rowq` as needed) the row group and in-row member
    /// position for `seq`.
    fn locate_row(&self, g: &mut ReceiverInner, seq: SeqNo) -> (usize, usize) {
        let cols = self.cfg.cols;
        let base = g.rowq.first().map(|r| r.base).unwrap_or(seq);
        let row_idx = (seqno::off(seq, base).max(0) as usize) / cols;
        while g.rowq.len() <= row_idx {
            let next_base = seqno::inc(g.rowq.last().map(|r| r.base).unwrap_or(seq), cols as u32);
            g.rowq.push(Group::new(next_base, cols, self.payload_cap));
        }
        let member = seqno::off(seq, g.rowq[row_idx].base).max(0) as usize;
        (row_idx, member)
    }

    fn clip_row(
        &self,
        g: &mut ReceiverInner,
        row_idx: usize,
        member: usize,
        seq: SeqNo,
        payload: Option<&[u8]>,
        control: Option<&FilterControlPayload>,
        length: u16,
        enc_flag: u8,
        timestamp: u32,
    ) {
        {
            let row = &mut g.rowq[row_idx];
            if let Some(p) = payload {
                if member < row.capacity {
                    row.clip_data_at(member, p, length, enc_flag, timestamp);
                }
            } else if let Some(c) = control {
                row.clip_control(c, timestamp);
            }
        }
        if payload.is_some() && member < g.rowq[row_idx].capacity {
            let cell_base = g.cell_base;
            Self::set_cell(&mut g.cells, cell_base, seq, true);
        }

        let row = &g.rowq[row_idx];
        if row.collected == self.cfg.cols.saturating_sub(1) && row.fec_received {
            if let Some(m) = row.missing_member() {
                let missing_seq = seqno::inc(row.base, m as u32);
                g.rebuilt.push(RebuiltPacket {
                    seq: missing_seq,
                    payload: row.payload_xor.clone(),
                    length: row.length_xor,
                    encryption_flag: row.flag_xor,
                    timestamp: row.timestamp_xor,
                });
            }
        }
    }

    /// Grows `colq` with whole new series (batches of `cfg.cols` groups)
    /// until series index `series_idx` exists.
    fn grow_colq_to_series(&self, g: &mut ReceiverInner, series_idx: usize) {
        let cols = self.cfg.cols;
        let matrix = self.cfg.matrix_size();
        let have_series = g.colq.len() / cols;
        for s in have_series..=series_idx {
            let series_base = seqno::inc(g.colq_root, (s * matrix) as u32);
            for b in column_bases(&self.cfg, series_base) {
                g.colq.push(Group::new(b, self.cfg.rows, self.payload_cap));
            }
        }
    }

    fn maybe_rebuild_column(&self, g: &mut ReceiverInner, global_idx: usize) {
        let Some(col) = g.colq.get(global_idx) else { return };
        if col.collected == self.cfg.rows.saturating_sub(1) && col.fec_received {
            if let Some(missing_pos) = col.missing_member() {
                let missing_seq = seqno::inc(col.base, (missing_pos * self.cfg.cols) as u32);
                g.rebuilt.push(RebuiltPacket {
                    seq: missing_seq,
                    payload: col.payload_xor.clone(),
                    length: col.length_xor,
                    encryption_flag: col.flag_xor,
                    timestamp: col.timestamp_xor,
                });
            }
        }
    }

    /// Column index of `seq`: its distance from the absolute column root
    /// (`colq[0].base`), modulo `cols`. Holds for both layouts: consecutive
    /// rows are always `cols` apart in sequence space, so the staircase
    /// diagonal shift between column bases (`col+1+cols`, see
    /// [`column_bases`]) is a multiple of `cols` plus one unit, leaving
    /// `offset % cols` the same straight-grid column index either way.
    fn column_index_of(&self, g: &ReceiverInner, seq: SeqNo) -> usize {
        let offset = seqno::off(seq, g.colq[0].base).max(0) as usize;
        offset % self.cfg.cols
    }

    /// Resolves (growing `colq` with whole series as needed) which group
    /// at column index `colx` actually covers `seq`, plus `seq`'s member
    /// position within that group — or `None` if `colq[colx]`'s base is
    /// still ahead of `seq` (the diagonal shift of [`Layout::Staircase`]
    /// leaves the very first stretch of a stream with no column covering
    /// it at all; the sender skips these the same way, see
    /// [`FecSender::feed_source`]).
    ///
    /// A column group's own base is diagonally shifted under
    /// [`Layout::Staircase`], so which series a given sequence number
    /// belongs to cannot be derived from the row grid alone (a row/column
    /// pair doesn't address the same group across every series the way it
    /// does for [`Layout::Even`]); this walks from `colq[colx]`'s own base
    /// the same way the reference column-group lookup does.
    fn locate_column(&self, g: &mut ReceiverInner, colx: usize, seq: SeqNo) -> Option<(usize, usize)> {
        let cols = self.cfg.cols;
        let matrix = self.cfg.matrix_size().max(1);
        let colbase = g.colq[colx].base;
        let coloff = seqno::off(seq, colbase);
        if coloff < 0 {
            return None;
        }
        let series_idx = coloff as usize / matrix;
        self.grow_colq_to_series(g, series_idx);
        let global_idx = colx + series_idx * cols;
        let member_off = g.colq.get(global_idx).map(|grp| seqno::off(seq, grp.base))?;
        if member_off < 0 {
            return None;
        }
        Some((global_idx, member_off as usize / cols))
    }

    fn clip_column_data(
        &self,
        g: &mut ReceiverInner,
        seq: SeqNo,
        payload: &[u8],
        length: u16,
        enc_flag: u8,
        timestamp: u32,
    ) {
        let colx = self.column_index_of(g, seq);
        let Some((global_idx, pos_in_col)) = self.locate_column(g, colx, seq) else { return };
        if let Some(col) = g.colq.get_mut(global_idx) {
            if pos_in_col < col.capacity {
                col.clip_data_at(pos_in_col, payload, length, enc_flag, timestamp);
            }
        }
        self.maybe_rebuild_column(g, global_idx);
    }

    fn clip_column_control(&self, g: &mut ReceiverInner, seq: SeqNo, control: &FilterControlPayload, timestamp: u32) {
        if control.is_row() {
            return;
        }
        let colx = control.column_index as usize;
        if colx >= self.cfg.cols {
            return;
        }
        let Some((global_idx, _)) = self.locate_column(g, colx, seq) else { return };
        if let Some(col) = g.colq.get_mut(global_idx) {
            col.clip_control(control, timestamp);
        }
        self.maybe_rebuild_column(g, global_idx);
    }

    /// Clips a data or FEC-control row packet into its row group; when the
    /// group fills and already has FEC parity, rebuilds the single missing
    /// packet. Does not touch column groups even when configured — use
    /// [`Self::receive`] to drive both axes together.
    pub fn hang_horizontal(
        &self,
        seq: SeqNo,
        payload: Option<&[u8]>,
        control: Option<&FilterControlPayload>,
        length: u16,
        enc_flag: u8,
        timestamp: u32,
        rcv_buffer_size: usize,
    ) {
        let mut g = self.inner.lock();
        self.enforce_shrink_caps(&mut g, rcv_buffer_size);
        let (row_idx, member) = self.locate_row(&mut g, seq);
        self.clip_row(&mut g, row_idx, member, seq, payload, control, length, enc_flag, timestamp);
        self.collect_irrecoverable(&mut g);
    }

    /// Column-side counterpart to [`Self::hang_horizontal`]. The column
    /// group is (re)located from `seq` itself, the same way for a data
    /// packet or a control packet — see [`Self::locate_column`].
    pub fn hang_vertical(
        &self,
        seq: SeqNo,
        payload: Option<&[u8]>,
        control: Option<&FilterControlPayload>,
        length: u16,
        enc_flag: u8,
        timestamp: u32,
        rcv_buffer_size: usize,
    ) {
        if !self.cfg.columns_enabled() {
            return;
        }
        let mut g = self.inner.lock();
        self.enforce_shrink_caps(&mut g, rcv_buffer_size);
        if let Some(p) = payload {
            self.clip_column_data(&mut g, seq, p, length, enc_flag, timestamp);
        } else if let Some(c) = control {
            self.clip_column_control(&mut g, seq, c, timestamp);
        }
    }

    /// Unified receive path: marks the cell, checks for a large drop,
    /// clips the packet into its row and (if configured) column group,
    /// recovering a missing member when either group is one short and has
    /// FEC parity, then checks for irrecoverable row losses and whole-series
    /// column dismissal.
    pub fn receive(
        &self,
        seq: SeqNo,
        payload: Option<&[u8]>,
        control: Option<&FilterControlPayload>,
        length: u16,
        enc_flag: u8,
        timestamp: u32,
        rcv_buffer_size: usize,
    ) {
        if payload.is_some() {
            self.mark_cell_received(seq, MarkMode::Received);
        }
        self.check_large_drop(seq);

        let mut g = self.inner.lock();
        self.enforce_shrink_caps(&mut g, rcv_buffer_size);

        match (payload, control) {
            (Some(p), _) => {
                let (row_idx, member) = self.locate_row(&mut g, seq);
                self.clip_row(&mut g, row_idx, member, seq, Some(p), None, length, enc_flag, timestamp);
                if self.cfg.columns_enabled() {
                    self.clip_column_data(&mut g, seq, p, length, enc_flag, timestamp);
                }
            }
            (None, Some(c)) if c.is_row() => {
                let (row_idx, member) = self.locate_row(&mut g, seq);
                self.clip_row(&mut g, row_idx, member, seq, None, Some(c), length, enc_flag, timestamp);
            }
            (None, Some(c)) => {
                if self.cfg.columns_enabled() {
                    self.clip_column_control(&mut g, seq, c, timestamp);
                }
            }
            (None, None) => {}
        }

        self.collect_irrecoverable(&mut g);
        self.maybe_dismiss_series(&mut g, seq);
    }

    /// Reports a row as irrecoverable (once) when it has slipped at least a
    /// third of a row size behind the newest row without completing or
    /// receiving its FEC parity.
    fn collect_irrecoverable(&self, g: &mut ReceiverInner) {
        if self.cfg.arq == ArqLevel::Never {
            return;
        }
        let cols = self.cfg.cols;
        let threshold = ((cols + 2) / 3).max(1);
        if g.rowq.len() <= threshold {
            return;
        }
        let base = g.rowq[0].base;
        if g.reported_irrecoverable.contains(&base) {
            return;
        }
        let row = &g.rowq[0];
        if row.is_full() || row.fec_received {
            return;
        }
        let mut ranges = Vec::new();
        let mut start: Option<usize> = None;
        for i in 0..cols {
            let received = row.received.get(i).copied().unwrap_or(true);
            if !received {
                if start.is_none() {
                    start = Some(i);
                }
            } else if let Some(s) = start.take() {
                ranges.push((s, i - 1));
            }
        }
        if let Some(s) = start {
            ranges.push((s, cols - 1));
        }
        for (s, e) in ranges {
            g.irrecoverable.push((seqno::inc(base, s as u32), seqno::inc(base, e as u32)));
        }
        g.reported_irrecoverable.insert(base);
    }

    /// Dismisses one full column series plus the corresponding cell-bitmap
    /// prefix once the incoming sequence has moved far enough past the
    /// oldest series and a full series exists in both queues. Falls back to
    /// a full reset if the row and column bases have drifted apart.
    fn maybe_dismiss_series(&self, g: &mut ReceiverInner, seq: SeqNo) {
        if !self.cfg.columns_enabled() || g.colq.is_empty() {
            return;
        }
        let matrix = self.cfg.matrix_size();
        let threshold = match self.cfg.layout {
            Layout::Even => matrix,
            Layout::Staircase => 2 * matrix,
        };
        let col_root_base = g.colq[0].base;
        let off = seqno::off(seq, col_root_base);
        if off < threshold as i32 {
            return;
        }
        if g.rowq.len() < self.cfg.rows || g.colq.len() < 2 * self.cfg.cols {
            return;
        }

        let row_root = g.rowq.first().map(|r| r.base);
        if row_root != Some(col_root_base) {
            log::warn!("[FecReceiver::maybe_dismiss_series] row/column base mismatch, safe reset");
            let new_base = seqno::inc(col_root_base, matrix as u32);
            g.rowq = vec![Group::new(new_base, self.cfg.cols, self.payload_cap)];
            g.colq = column_bases(&self.cfg, new_base).into_iter().map(|b| Group::new(b, self.cfg.rows, self.payload_cap)).collect();
            g.colq_root = new_base;
            g.cell_base = new_base;
            g.cells.clear();
            return;
        }

        let dismiss_rows = self.cfg.rows.min(g.rowq.len());
        g.rowq.drain(0..dismiss_rows);
        let dismiss_cols = self.cfg.cols.min(g.colq.len());
        g.colq.drain(0..dismiss_cols);
        g.colq_root = seqno::inc(g.colq_root, matrix as u32);
        let dismissed_cells = matrix.min(g.cells.len());
        g.cells.drain(0..dismissed_cells);
        if let Some(first) = g.rowq.first() {
            g.cell_base = first.base;
        }
    }

    fn set_cell(cells: &mut Vec<bool>, cell_base: SeqNo, seq: SeqNo, val: bool) {
        let off = seqno::off(seq, cell_base);
        if off < 0 {
            return;
        }
        let idx = off as usize;
        if idx >= cells.len() {
            cells.resize(idx + 1, false);
        }
        cells[idx] = val;
    }

    /// Drains packets rebuilt since the last call.
    pub fn take_rebuilt(&self) -> Vec<RebuiltPacket> {
        std::mem::take(&mut self.inner.lock().rebuilt)
    }

    /// Drains irrecoverable-loss ranges collected since the last call,
    /// reported to the retransmission layer when `arq != Never`.
    pub fn take_irrecoverable(&self) -> Vec<(SeqNo, SeqNo)> {
        if self.cfg.arq == ArqLevel::Never {
            return Vec::new();
        }
        std::mem::take(&mut self.inner.lock().irrecoverable)
    }

    /// Number of series currently retained, for tests/diagnostics.
    pub fn series_count(&self) -> usize {
        let g = self.inner.lock();
        g.rowq.len() / self.cfg.rows.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_config() {
        let cfg = FilterConfig::parse("fec,cols:10,rows:4,layout:even,arq:onreq").unwrap();
        assert_eq!(cfg.cols, 10);
        assert_eq!(cfg.rows, 4);
        assert!(!cfg.cols_only);
        assert!(cfg.columns_enabled());
        assert!(cfg.row_enabled());
        assert_eq!(cfg.layout, Layout::Even);
        assert_eq!(cfg.arq, ArqLevel::OnRequest);
    }

    #[test]
    fn parse_negative_rows_sets_cols_only() {
        let cfg = FilterConfig::parse("fec,cols:5,rows:-3").unwrap();
        assert_eq!(cfg.rows, 3);
        assert!(cfg.cols_only);
        assert!(cfg.columns_enabled());
        assert!(!cfg.row_enabled());
    }

    #[test]
    fn parse_rejects_rows_zero_or_minus_one() {
        assert!(FilterConfig::parse("fec,cols:5,rows:0").is_err());
        assert!(FilterConfig::parse("fec,cols:5,rows:-1").is_err());
    }

    #[test]
    fn parse_rejects_missing_cols() {
        assert!(FilterConfig::parse("fec,rows:4").is_err());
    }

    #[test]
    fn parse_rejects_cols_below_two() {
        assert!(FilterConfig::parse("fec,cols:1").is_err());
    }

    #[test]
    fn parse_rejects_unknown_key() {
        assert!(FilterConfig::parse("fec,cols:5,bogus:1").is_err());
    }

    #[test]
    fn row_only_default_fills_and_emits_row_control() {
        let cfg = FilterConfig::parse("fec,cols:4").unwrap();
        assert!(!cfg.columns_enabled());
        let sender = FecSender::new(cfg, 16, 100);
        for s in 100..103 {
            sender.feed_source(s, &[0xAA; 16], 16, 0, 1);
        }
        assert!(sender.pack_control_packet().is_none());
        sender.feed_source(103, &[0xAA; 16], 16, 0, 1);
        let ctrl = sender.pack_control_packet();
        assert!(ctrl.is_some());
        assert!(ctrl.unwrap().is_row());
    }

    #[test]
    fn xor_of_identical_payloads_is_zero() {
        let cfg = FilterConfig::parse("fec,cols:2").unwrap();
        let sender = FecSender::new(cfg, 4, 0);
        sender.feed_source(0, &[1, 2, 3, 4], 4, 0, 0);
        sender.feed_source(1, &[1, 2, 3, 4], 4, 0, 0);
        let ctrl = sender.pack_control_packet().unwrap();
        assert_eq!(ctrl.data_xor, vec![0, 0, 0, 0]);
        assert_eq!(ctrl.length_xor, 0);
    }

    #[test]
    fn cols_only_config_emits_column_control_not_row() {
        // cols:3, rows:-2 -> column groups of capacity 2, row parity disabled.
        let cfg = FilterConfig::parse("fec,cols:3,rows:-2").unwrap();
        let payload_cap = 8;
        let sender = FecSender::new(cfg, payload_cap, 0);
        let mut emitted = Vec::new();
        for seq in 0..6u32 {
            sender.feed_source(seq, &[seq as u8 + 1; 8], payload_cap as u16, 0, 0);
            if let Some(ctrl) = sender.pack_control_packet() {
                emitted.push((seq, ctrl));
            }
        }
        // Row groups fill at seq 2 and seq 5 but never emit (cols_only).
        assert!(emitted.iter().all(|(_, c)| !c.is_row()));
        // Column 0 (seq 0, seq 3) is the first column group to fill.
        assert_eq!(emitted[0].0, 3);
        assert_eq!(emitted[0].1.column_index, 0);
    }

    #[test]
    fn emergency_shrink_bounds_series_count() {
        let cfg = FilterConfig::parse("fec,cols:2,layout:even").unwrap();
        let recv = FecReceiver::new(cfg, 16, 0);
        for series in 0..50u32 {
            let seq = series * 2;
            recv.hang_horizontal(seq, Some(&[0u8; 16]), None, 16, 0, 0, 1000);
            recv.hang_horizontal(seq + 1, Some(&[0u8; 16]), None, 16, 0, 0, 1000);
        }
        assert!(recv.series_count() <= SRT_FEC_MAX_RCV_HISTORY + 2);
    }

    #[test]
    fn large_drop_resets_row_queue() {
        let cfg = FilterConfig::parse("fec,cols:6").unwrap();
        let recv = FecReceiver::new(cfg, 16, 1000);
        recv.check_large_drop(1200);
        let g = recv.inner.lock();
        assert_eq!(g.cell_base, 1198);
    }

    #[test]
    fn mark_cell_received_extends_bitmap() {
        let cfg = FilterConfig::parse("fec,cols:4").unwrap();
        let recv = FecReceiver::new(cfg, 16, 0);
        recv.mark_cell_received(10, MarkMode::Received);
        let g = recv.inner.lock();
        assert!(g.cells[10]);
        assert_eq!(g.cells.len(), 11);
    }

    #[test]
    fn row_rebuild_recovers_single_lost_packet_bit_for_bit() {
        // scenario 4 from the testable-properties section: cols=5, row-only
        // parity, packet at offset 2 (seq 102) is dropped on the wire.
        let cfg = FilterConfig::parse("fec,cols:5").unwrap();
        let payload_cap = 8;
        let sender = FecSender::new(cfg, payload_cap, 100);
        let payloads: Vec<Vec<u8>> = (0..5).map(|i| vec![i as u8 + 1; payload_cap]).collect();
        for (i, p) in payloads.iter().enumerate() {
            sender.feed_source(100 + i as u32, p, payload_cap as u16, 0, 1000 + i as u32);
        }
        let ctrl = sender.pack_control_packet().unwrap();
        assert!(ctrl.is_row());

        let recv = FecReceiver::new(cfg, payload_cap, 100);
        for (i, p) in payloads.iter().enumerate() {
            if i == 2 {
                continue; // seq 102 lost on the wire
            }
            recv.hang_horizontal(100 + i as u32, Some(p), None, payload_cap as u16, 0, 1000 + i as u32, 10_000);
        }
        recv.hang_horizontal(100, None, Some(&ctrl), 0, 0, 0, 10_000);

        let rebuilt = recv.take_rebuilt();
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].seq, 102);
        assert_eq!(rebuilt[0].payload, payloads[2]);
        assert_eq!(rebuilt[0].length, payload_cap as u16);
    }

    #[test]
    fn column_rebuild_recovers_single_lost_packet_via_receive() {
        // cols:3, rows:-2 -> column-only parity. seq 4 is lost on the wire;
        // its column's FEC control still arrives and should rebuild it.
        let cfg = FilterConfig::parse("fec,cols:3,rows:-2").unwrap();
        let payload_cap = 8;
        let payloads: Vec<Vec<u8>> = (0..6).map(|i| vec![i as u8 + 1; payload_cap]).collect();

        let sender = FecSender::new(cfg, payload_cap, 0);
        let mut controls = Vec::new();
        for (seq, p) in payloads.iter().enumerate() {
            sender.feed_source(seq as u32, p, payload_cap as u16, 0, 0);
            if let Some(ctrl) = sender.pack_control_packet() {
                controls.push(ctrl);
            }
        }
        assert_eq!(controls.len(), 3);

        let recv = FecReceiver::new(cfg, payload_cap, 0);
        for (seq, p) in payloads.iter().enumerate() {
            if seq == 4 {
                continue; // lost on the wire
            }
            recv.receive(seq as u32, Some(p), None, payload_cap as u16, 0, 0, 10_000);
            if seq == 3 {
                recv.receive(0, None, Some(&controls[0]), 0, 0, 0, 10_000);
            }
        }
        recv.receive(1, None, Some(&controls[1]), 0, 0, 0, 10_000);
        recv.receive(2, None, Some(&controls[2]), 0, 0, 0, 10_000);

        let rebuilt = recv.take_rebuilt();
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].seq, 4);
        assert_eq!(rebuilt[0].payload, payloads[4]);
    }

    #[test]
    fn staircase_column_rebuild_recovers_single_lost_packet_via_receive() {
        // cols:3, rows:-2, layout:staircase -> diagonally-shifted column
        // bases (0, 4, 2) rather than the straight-grid (0, 1, 2) of Even.
        // Column 1's own base (4) sits ahead of seq 1, so that packet
        // covers no column at all; column 1's real series-0 members are
        // seq 4 and seq 7. Seq 4 is lost on the wire.
        let cfg = FilterConfig::parse("fec,cols:3,rows:-2,layout:staircase").unwrap();
        let payload_cap = 8;
        let payloads: Vec<Vec<u8>> = (0..8).map(|i| vec![i as u8 + 1; payload_cap]).collect();

        let sender = FecSender::new(cfg, payload_cap, 0);
        let mut controls: [Option<FilterControlPayload>; 3] = [None, None, None];
        for (seq, p) in payloads.iter().enumerate() {
            sender.feed_source(seq as u32, p, payload_cap as u16, 0, 0);
            if let Some(ctrl) = sender.pack_control_packet() {
                controls[ctrl.column_index as usize] = Some(ctrl);
            }
        }
        assert!(controls.iter().all(Option::is_some), "all three column series should have completed by seq 7");

        let recv = FecReceiver::new(cfg, payload_cap, 0);
        for (seq, p) in payloads.iter().enumerate() {
            if seq == 4 {
                continue; // lost on the wire
            }
            recv.receive(seq as u32, Some(p), None, payload_cap as u16, 0, 0, 10_000);
        }
        // A column's own base is a valid "seq" for routing its control into
        // series 0, same as the Even-layout test above.
        recv.receive(0, None, Some(controls[0].as_ref().unwrap()), 0, 0, 0, 10_000);
        recv.receive(4, None, Some(controls[1].as_ref().unwrap()), 0, 0, 0, 10_000);
        recv.receive(2, None, Some(controls[2].as_ref().unwrap()), 0, 0, 0, 10_000);

        let rebuilt = recv.take_rebuilt();
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].seq, 4);
        assert_eq!(rebuilt[0].payload, payloads[4]);
    }

    #[test]
    fn irrecoverable_loss_collected_when_row_slips_past_threshold() {
        let cfg = FilterConfig::parse("fec,cols:4").unwrap();
        let recv = FecReceiver::new(cfg, 16, 0);
        // Row 0: only members 0 and 2 arrive (1 and 3 are lost).
        recv.receive(0, Some(&[0u8; 16]), None, 16, 0, 0, 100_000);
        recv.receive(2, Some(&[0u8; 16]), None, 16, 0, 0, 100_000);
        // Rows 1 and 2 fill completely, pushing row 0 well behind.
        for seq in 4..12u32 {
            recv.receive(seq, Some(&[0u8; 16]), None, 16, 0, 0, 100_000);
        }
        let missing = recv.take_irrecoverable();
        assert_eq!(missing, vec![(1, 1), (3, 3)]);
    }

    #[test]
    fn arq_never_suppresses_irrecoverable_reports() {
        let cfg = FilterConfig::parse("fec,cols:4,arq:never").unwrap();
        let recv = FecReceiver::new(cfg, 16, 0);
        recv.inner.lock().irrecoverable.push((0, 3));
        assert!(recv.take_irrecoverable().is_empty());
    }

    #[test]
    fn column_series_dismissal_advances_root_once_full_series_collected() {
        let cfg = FilterConfig::parse("fec,cols:2,rows:3").unwrap();
        let payload_cap = 8;
        let recv = FecReceiver::new(cfg, payload_cap, 0);
        for seq in 0..18u32 {
            recv.receive(seq, Some(&vec![0u8; payload_cap]), None, payload_cap as u16, 0, 0, 1_000_000);
        }
        let g = recv.inner.lock();
        assert!(g.colq_root > 0, "expected at least one whole-series dismissal to have advanced colq_root");
    }
}
