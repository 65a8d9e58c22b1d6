// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire header codec and the options table (component I: wire codec & options).
//!
//! The header is 16 bytes, network byte order, laid out as four big-endian
//! `u32` words. Encode/decode is done with `to_be_bytes`/`from_be_bytes`
//! rather than a bit-field macro, matching the explicit shift/mask guidance
//! for the rewrite.

use crate::error::{Error, Result};
use crate::seqno::{Boundary, EncryptionKeyFlag, MsgNoFlags, SeqNo};

/// Size of the fixed packet header, in bytes.
pub const HEADER_SIZE: usize = 16;

const CONTROL_FLAG: u32 = 1 << 31;
const SEQNO_MASK: u32 = (1 << 31) - 1;

/// A decoded wire header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// `true` if this is a control packet (the high bit of the SEQNO word).
    pub control: bool,
    /// Data sequence number (meaningless for control packets).
    pub seqno: SeqNo,
    /// Control message type (meaningless for data packets).
    pub control_type: u16,
    /// Extended control type (meaningless for data packets).
    pub control_ext_type: u16,
    /// Packed message-number word.
    pub msgno: MsgNoFlags,
    /// Sender timestamp in microseconds, truncated to 32 bits.
    pub timestamp: u32,
    /// Destination socket id.
    pub id: u32,
}

impl Header {
    /// Builds a data-packet header.
    #[must_use]
    pub fn data(seqno: SeqNo, msgno: MsgNoFlags, timestamp: u32, id: u32) -> Self {
        Header { control: false, seqno, control_type: 0, control_ext_type: 0, msgno, timestamp, id }
    }

    /// Builds a control-packet header with the given type/ext-type pair.
    #[must_use]
    pub fn control(control_type: u16, control_ext_type: u16, timestamp: u32, id: u32) -> Self {
        Header {
            control: true,
            seqno: 0,
            control_type,
            control_ext_type,
            msgno: MsgNoFlags::unpack(0),
            timestamp,
            id,
        }
    }

    /// Encodes this header into 16 bytes, network byte order.
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let word0 = if self.control {
            CONTROL_FLAG | ((self.control_type as u32 & 0x7fff) << 16) | self.control_ext_type as u32
        } else {
            self.seqno & SEQNO_MASK
        };
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&word0.to_be_bytes());
        out[4..8].copy_from_slice(&self.msgno.pack().to_be_bytes());
        out[8..12].copy_from_slice(&self.timestamp.to_be_bytes());
        out[12..16].copy_from_slice(&self.id.to_be_bytes());
        out
    }

    /// Decodes a header from a 16-byte slice.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `buf` is shorter than
    /// [`HEADER_SIZE`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::InvalidArgument(format!(
                "header requires {HEADER_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        let word0 = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let msgno = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let timestamp = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let id = u32::from_be_bytes(buf[12..16].try_into().unwrap());
        let control = word0 & CONTROL_FLAG != 0;
        Ok(if control {
            Header {
                control: true,
                seqno: 0,
                control_type: ((word0 >> 16) & 0x7fff) as u16,
                control_ext_type: (word0 & 0xffff) as u16,
                msgno: MsgNoFlags::unpack(msgno),
                timestamp,
                id,
            }
        } else {
            Header {
                control: false,
                seqno: word0 & SEQNO_MASK,
                control_type: 0,
                control_ext_type: 0,
                msgno: MsgNoFlags::unpack(msgno),
                timestamp,
                id,
            }
        })
    }
}

/// Reserved control-type value marking a packet-filter (FEC) control packet,
/// used by the sender/receiver in [`crate::fec`].
pub const CONTROL_TYPE_FILTER: u16 = 0x7fff;

/// Row indicator used in [`FilterControlPayload::column_index`]; any
/// non-negative value names a column.
pub const FILTER_ROW: i8 = -1;

/// Payload carried by a packet-filter (FEC) control packet, immediately
/// following the 16-byte header.
#[derive(Debug, Clone)]
pub struct FilterControlPayload {
    /// `FILTER_ROW` for a row-parity packet, else the column index.
    pub column_index: i8,
    /// XOR of the encryption-key-flag byte across the covered packets.
    pub encryption_flag_xor: u8,
    /// XOR of the big-endian length fields across the covered packets.
    pub length_xor: u16,
    /// XOR of the (zero-padded) payload bytes across the covered packets.
    pub data_xor: Vec<u8>,
}

impl FilterControlPayload {
    /// Number of header bytes preceding the XOR payload.
    pub const HEADER_SIZE: usize = 4;

    /// Encodes this payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_SIZE + self.data_xor.len());
        out.push(self.column_index as u8);
        out.push(self.encryption_flag_xor);
        out.extend_from_slice(&self.length_xor.to_be_bytes());
        out.extend_from_slice(&self.data_xor);
        out
    }

    /// Decodes a payload previously produced by [`encode`](Self::encode).
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `buf` is shorter than the
    /// 4-byte filter-control header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(Error::InvalidArgument("filter control payload truncated".into()));
        }
        Ok(FilterControlPayload {
            column_index: buf[0] as i8,
            encryption_flag_xor: buf[1],
            length_xor: u16::from_be_bytes([buf[2], buf[3]]),
            data_xor: buf[Self::HEADER_SIZE..].to_vec(),
        })
    }

    /// `true` when this payload describes row parity.
    #[must_use]
    pub fn is_row(&self) -> bool {
        self.column_index == FILTER_ROW
    }
}

pub use Boundary as PacketBoundary;
pub use EncryptionKeyFlag as PacketKeyFlag;
