/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Buffered stop-bit reader with a presence-map stack.
//!
//! All integer reads resume cleanly after a [`FastError::WouldBlock`]: the
//! partially accumulated value and byte count stay in the reader, and
//! repeating the same call continues where the source ran dry. Presence-map
//! and text reads keep equivalent partial state.
//!
//! A presence map is opened when entering a group and pushed on a stack;
//! nested groups stack their maps and pop them on close. Requesting more bits
//! than the catalog-computed maximum for the group is a protocol violation;
//! bits past the end of the wire bytes (a trimmed map) read as zero.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use ferrofast_core::{DecodeContext, FastError, Result};

use crate::io::{ByteSource, TransferError};

/// Outcome of a variable-length read on an optional field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextStatus {
    /// The wire carried the null marker.
    Null,
    /// The output buffer holds the value (possibly empty).
    Value,
}

#[derive(Debug, Clone, Copy)]
struct PmapFrame {
    /// Offset of this map's bytes in the shared byte stack.
    base: usize,
    /// Wire bytes the map occupied.
    len: usize,
    /// Next bit to pop, counted across 7-bit groups.
    bit_cursor: usize,
    /// Hard bound from the catalog; popping past it is a violation.
    max_bits: usize,
}

/// Buffered FAST primitive reader over a [`ByteSource`].
#[derive(Debug)]
pub struct StopBitReader<S> {
    source: S,
    buf: Vec<u8>,
    pos: usize,
    limit: usize,
    total_consumed: u64,
    eof: bool,

    // Partial-read state so WouldBlock can resume mid-field.
    pending_acc: u64,
    pending_count: u8,
    pending_active: bool,
    pending_text: bool,
    pending_text_skipped_zero: bool,
    pending_bytes: bool,
    pending_pmap: bool,

    pmap_bytes: SmallVec<[u8; 64]>,
    pmap_frames: SmallVec<[PmapFrame; 8]>,

    blocking: bool,
    shutdown: Option<Arc<AtomicBool>>,
}

impl<S: ByteSource> StopBitReader<S> {
    /// Creates a reader with the given internal buffer capacity.
    #[must_use]
    pub fn new(source: S, buffer_capacity: usize) -> Self {
        Self {
            source,
            buf: vec![0; buffer_capacity.max(16)],
            pos: 0,
            limit: 0,
            total_consumed: 0,
            eof: false,
            pending_acc: 0,
            pending_count: 0,
            pending_active: false,
            pending_text: false,
            pending_text_skipped_zero: false,
            pending_bytes: false,
            pending_pmap: false,
            pmap_bytes: SmallVec::new(),
            pmap_frames: SmallVec::new(),
            blocking: false,
            shutdown: None,
        }
    }

    /// Installs the cooperative shutdown flag polled at every refill.
    pub fn set_shutdown(&mut self, flag: Arc<AtomicBool>) {
        self.shutdown = Some(flag);
    }

    /// In blocking mode a stalled source is retried (with a scheduler yield)
    /// instead of surfacing [`FastError::WouldBlock`] mid-field.
    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    /// Total bytes consumed from the source so far.
    #[must_use]
    pub const fn total_consumed(&self) -> u64 {
        self.total_consumed
    }

    /// Gives back the source.
    pub fn into_source(self) -> S {
        self.source
    }

    /// Clears all buffered and partial state for a fresh stream.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.limit = 0;
        self.total_consumed = 0;
        self.eof = false;
        self.pending_active = false;
        self.pending_text = false;
        self.pending_text_skipped_zero = false;
        self.pending_bytes = false;
        self.pending_pmap = false;
        self.pmap_bytes.clear();
        self.pmap_frames.clear();
    }

    fn refill(&mut self) -> Result<()> {
        if self.eof {
            return Err(FastError::UnexpectedEndOfStream(DecodeContext::at_offset(
                self.total_consumed,
            )));
        }
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.limit, 0);
            self.limit -= self.pos;
            self.pos = 0;
        }
        loop {
            if let Some(flag) = &self.shutdown {
                if flag.load(Ordering::Relaxed) {
                    return Err(FastError::Shutdown);
                }
            }
            match self.source.read(&mut self.buf[self.limit..]) {
                Ok(n) => {
                    self.limit += n;
                    return Ok(());
                }
                Err(TransferError::EndOfStream) => {
                    self.eof = true;
                    return Err(FastError::UnexpectedEndOfStream(DecodeContext::at_offset(
                        self.total_consumed,
                    )));
                }
                Err(TransferError::WouldBlock) if self.blocking => {
                    std::thread::yield_now();
                }
                Err(other) => return Err(other.into_fast_error(self.total_consumed)),
            }
        }
    }

    #[inline]
    fn next_byte(&mut self) -> Result<u8> {
        while self.pos == self.limit {
            self.refill()?;
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        self.total_consumed += 1;
        Ok(b)
    }

    /// True once the source is exhausted and no buffered bytes remain.
    ///
    /// # Errors
    /// [`FastError::WouldBlock`] when the source cannot answer yet.
    pub fn is_at_end(&mut self) -> Result<bool> {
        if self.pos < self.limit {
            return Ok(false);
        }
        if self.eof {
            return Ok(true);
        }
        match self.refill() {
            Ok(()) => Ok(self.pos == self.limit && self.eof),
            Err(FastError::UnexpectedEndOfStream(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Reads an unsigned stop-bit integer.
    ///
    /// # Errors
    /// [`FastError::UnexpectedEndOfStream`] on truncation,
    /// [`FastError::ProtocolViolation`] when no stop bit appears within ten
    /// bytes, [`FastError::WouldBlock`] when the source stalls (resumable).
    pub fn read_u64(&mut self) -> Result<u64> {
        let (mut acc, mut count) = if self.pending_active {
            self.pending_active = false;
            (self.pending_acc, self.pending_count)
        } else {
            (0, 0)
        };
        loop {
            let b = match self.next_byte() {
                Ok(b) => b,
                Err(FastError::WouldBlock) => {
                    self.pending_acc = acc;
                    self.pending_count = count;
                    self.pending_active = true;
                    return Err(FastError::WouldBlock);
                }
                Err(e) => return Err(e),
            };
            count += 1;
            if count > 10 {
                return Err(FastError::violation(
                    "varint overflow: no stop bit within 10 bytes",
                    self.total_consumed,
                ));
            }
            acc = acc.wrapping_shl(7) | u64::from(b & 0x7F);
            if b & 0x80 != 0 {
                return Ok(acc);
            }
        }
    }

    /// Reads a signed stop-bit integer; bit 6 of the first byte is the sign.
    ///
    /// # Errors
    /// Same as [`StopBitReader::read_u64`].
    pub fn read_i64(&mut self) -> Result<i64> {
        let (mut acc, mut count) = if self.pending_active {
            self.pending_active = false;
            (self.pending_acc as i64, self.pending_count)
        } else {
            (0, 0)
        };
        loop {
            let b = match self.next_byte() {
                Ok(b) => b,
                Err(FastError::WouldBlock) => {
                    self.pending_acc = acc as u64;
                    self.pending_count = count;
                    self.pending_active = true;
                    return Err(FastError::WouldBlock);
                }
                Err(e) => return Err(e),
            };
            if count == 0 && b & 0x40 != 0 {
                acc = -1;
            }
            count += 1;
            if count > 10 {
                return Err(FastError::violation(
                    "varint overflow: no stop bit within 10 bytes",
                    self.total_consumed,
                ));
            }
            acc = acc.wrapping_shl(7) | i64::from(b & 0x7F);
            if b & 0x80 != 0 {
                return Ok(acc);
            }
        }
    }

    /// Reads an unsigned stop-bit integer narrowed to 32 bits.
    ///
    /// # Errors
    /// Same as [`StopBitReader::read_u64`].
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_u64()? as u32)
    }

    /// Reads a signed stop-bit integer narrowed to 32 bits.
    ///
    /// # Errors
    /// Same as [`StopBitReader::read_i64`].
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_i64()? as i32)
    }

    /// Reads a stop-bit ASCII string into `out`.
    ///
    /// Mandatory form: a lone `0x80` is the empty string. Optional form: a
    /// lone `0x80` is null and `0x00 0x80` is the empty string.
    ///
    /// # Errors
    /// Truncation, stall and shutdown errors as for the integer reads.
    pub fn read_ascii(&mut self, optional: bool, out: &mut Vec<u8>) -> Result<TextStatus> {
        if !self.pending_text {
            out.clear();
            self.pending_text_skipped_zero = false;
        }
        self.pending_text = false;
        loop {
            let b = match self.next_byte() {
                Ok(b) => b,
                Err(FastError::WouldBlock) => {
                    self.pending_text = true;
                    return Err(FastError::WouldBlock);
                }
                Err(e) => return Err(e),
            };
            let data = b & 0x7F;
            let stop = b & 0x80 != 0;
            if out.is_empty() && !self.pending_text_skipped_zero {
                if stop && data == 0 {
                    return Ok(if optional {
                        TextStatus::Null
                    } else {
                        TextStatus::Value
                    });
                }
                if optional && !stop && data == 0 {
                    // Null-shift prefix byte of a non-null optional string.
                    self.pending_text_skipped_zero = true;
                    continue;
                }
            }
            if self.pending_text_skipped_zero && out.is_empty() && stop && data == 0 {
                // 0x00 0x80: the optional empty string.
                return Ok(TextStatus::Value);
            }
            out.push(data);
            if stop {
                return Ok(TextStatus::Value);
            }
        }
    }

    /// Reads exactly `len` raw bytes into `out`.
    ///
    /// # Errors
    /// Truncation, stall and shutdown errors as for the integer reads.
    pub fn read_bytes_into(&mut self, len: usize, out: &mut Vec<u8>) -> Result<()> {
        if !self.pending_bytes {
            out.clear();
            out.reserve(len);
        }
        self.pending_bytes = false;
        while out.len() < len {
            if self.pos == self.limit {
                if let Err(e) = self.refill() {
                    if e == FastError::WouldBlock {
                        self.pending_bytes = true;
                    }
                    return Err(e);
                }
            }
            let take = (len - out.len()).min(self.limit - self.pos);
            out.extend_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            self.total_consumed += take as u64;
        }
        Ok(())
    }

    /// Reads a presence map of at most `max_bytes` wire bytes and pushes it
    /// on the stack.
    ///
    /// # Errors
    /// [`FastError::ProtocolViolation`] when no stop bit appears within the
    /// bound; truncation and stall errors as for the integer reads.
    pub fn open_pmap(&mut self, max_bytes: usize) -> Result<()> {
        let base = if self.pending_pmap {
            self.pending_pmap = false;
            // Bytes pushed before the stall belong to this map; it started
            // right after the previous frame's bytes.
            self.pmap_frames.last().map_or(0, |f| f.base + f.len)
        } else {
            self.pmap_bytes.len()
        };
        loop {
            let len = self.pmap_bytes.len() - base;
            let b = match self.next_byte() {
                Ok(b) => b,
                Err(FastError::WouldBlock) => {
                    self.pending_pmap = true;
                    return Err(FastError::WouldBlock);
                }
                Err(e) => return Err(e),
            };
            if len == max_bytes {
                return Err(FastError::violation(
                    format!("presence map exceeds {max_bytes} bytes"),
                    self.total_consumed,
                ));
            }
            self.pmap_bytes.push(b & 0x7F);
            if b & 0x80 != 0 {
                self.pmap_frames.push(PmapFrame {
                    base,
                    len: len + 1,
                    bit_cursor: 0,
                    max_bits: max_bytes * 7,
                });
                return Ok(());
            }
        }
    }

    /// Pops the next bit from the presence map on top of the stack.
    ///
    /// Bits beyond the wire bytes of a trimmed map read as zero; bits beyond
    /// the catalog maximum are a protocol violation.
    ///
    /// # Errors
    /// [`FastError::ProtocolViolation`] on an empty stack or exhausted map.
    pub fn pop_pmap_bit(&mut self) -> Result<u8> {
        let offset = self.total_consumed;
        let Some(frame) = self.pmap_frames.last_mut() else {
            return Err(FastError::violation("presence map stack empty", offset));
        };
        if frame.bit_cursor >= frame.max_bits {
            return Err(FastError::violation(
                "more presence bits requested than available",
                offset,
            ));
        }
        let bit = if frame.bit_cursor < frame.len * 7 {
            let byte = self.pmap_bytes[frame.base + frame.bit_cursor / 7];
            (byte >> (6 - frame.bit_cursor % 7)) & 1
        } else {
            0
        };
        frame.bit_cursor += 1;
        Ok(bit)
    }

    /// Pops the presence map pushed by the matching [`StopBitReader::open_pmap`].
    ///
    /// # Errors
    /// [`FastError::ProtocolViolation`] when no map is open.
    pub fn close_pmap(&mut self) -> Result<()> {
        match self.pmap_frames.pop() {
            Some(frame) => {
                self.pmap_bytes.truncate(frame.base);
                Ok(())
            }
            None => Err(FastError::violation(
                "close of unopened presence map",
                self.total_consumed,
            )),
        }
    }

    /// Current presence-map nesting depth.
    #[must_use]
    pub fn pmap_depth(&self) -> usize {
        self.pmap_frames.len()
    }
}
