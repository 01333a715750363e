/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Buffered stop-bit writer with a presence-map stack.
//!
//! Opening a presence map reserves its maximum byte count in the output
//! buffer; bits are set in place while the group's fields are appended after
//! the reservation. Closing the map trims trailing zero bytes, sets the stop
//! bit, and compacts the buffer. Closes are strictly LIFO, so compaction never
//! moves bytes belonging to an enclosing map.
//!
//! `flush` drains only the prefix of the buffer that precedes the oldest open
//! map; everything after it may still be rewritten.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use ferrofast_core::{FastError, Result};

use crate::io::{ByteSink, TransferError};

#[derive(Debug, Clone, Copy)]
struct WriteFrame {
    /// Start of the reserved presence-map bytes in the buffer.
    pos: usize,
    /// Reserved byte count (the catalog maximum for the group).
    reserved: usize,
    /// Byte currently receiving bits.
    byte_idx: usize,
    /// Mask of the next bit to write, starting at 0x40.
    bit_mask: u8,
}

/// Buffered FAST primitive writer over a [`ByteSink`].
#[derive(Debug)]
pub struct StopBitWriter<K> {
    sink: K,
    buf: Vec<u8>,
    flushed: u64,
    frames: SmallVec<[WriteFrame; 8]>,
    shutdown: Option<Arc<AtomicBool>>,
}

impl<K: ByteSink> StopBitWriter<K> {
    /// Creates a writer with the given initial buffer capacity.
    #[must_use]
    pub fn new(sink: K, buffer_capacity: usize) -> Self {
        Self {
            sink,
            buf: Vec::with_capacity(buffer_capacity),
            flushed: 0,
            frames: SmallVec::new(),
            shutdown: None,
        }
    }

    /// Installs the cooperative shutdown flag polled while flushing.
    pub fn set_shutdown(&mut self, flag: Arc<AtomicBool>) {
        self.shutdown = Some(flag);
    }

    /// Total bytes emitted, flushed or still buffered.
    #[must_use]
    pub fn total_written(&self) -> u64 {
        self.flushed + self.buf.len() as u64
    }

    /// Gives back the sink, discarding any unflushed bytes.
    pub fn into_sink(self) -> K {
        self.sink
    }

    /// Clears buffered bytes and open maps for a fresh stream.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.flushed = 0;
        self.frames.clear();
    }

    /// Writes an unsigned stop-bit integer (1..=10 bytes).
    pub fn write_u64(&mut self, value: u64) {
        let bits = 64 - value.leading_zeros();
        let n = (bits.max(1) as usize).div_ceil(7);
        for i in (1..n).rev() {
            self.buf.push((value >> (7 * i)) as u8 & 0x7F);
        }
        self.buf.push(value as u8 & 0x7F | 0x80);
    }

    /// Writes a signed stop-bit integer; bit 6 of the first byte carries the
    /// sign.
    pub fn write_i64(&mut self, value: i64) {
        // Smallest n where the sign-extended 7n-bit window reproduces value.
        let mut n = 1usize;
        while n < 10 {
            let shift = 64 - 7 * n as u32;
            if value.wrapping_shl(shift) >> shift == value {
                break;
            }
            n += 1;
        }
        for i in (1..n).rev() {
            self.buf.push((value >> (7 * i)) as u8 & 0x7F);
        }
        self.buf.push(value as u8 & 0x7F | 0x80);
    }

    /// Writes an unsigned 32-bit stop-bit integer.
    pub fn write_u32(&mut self, value: u32) {
        self.write_u64(u64::from(value));
    }

    /// Writes a signed 32-bit stop-bit integer.
    pub fn write_i32(&mut self, value: i32) {
        self.write_i64(i64::from(value));
    }

    /// Writes the one-byte null marker.
    pub fn write_null(&mut self) {
        self.buf.push(0x80);
    }

    /// Writes a stop-bit ASCII string.
    ///
    /// Empty values use the forms matching [`StopBitReader::read_ascii`]:
    /// `0x80` when mandatory, `0x00 0x80` when optional (whose lone `0x80` is
    /// the null marker).
    ///
    /// [`StopBitReader::read_ascii`]: crate::reader::StopBitReader::read_ascii
    pub fn write_ascii(&mut self, value: &[u8], optional: bool) {
        match value {
            [] if optional => self.buf.extend_from_slice(&[0x00, 0x80]),
            [] => self.buf.push(0x80),
            [head @ .., last] => {
                for &b in head {
                    self.buf.push(b & 0x7F);
                }
                self.buf.push(last & 0x7F | 0x80);
            }
        }
    }

    /// Appends raw bytes (for length-prefixed vectors; the length varint is
    /// written separately).
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Reserves a presence map of `max_bytes` and pushes it on the stack.
    pub fn open_pmap(&mut self, max_bytes: usize) {
        let max_bytes = max_bytes.max(1);
        self.frames.push(WriteFrame {
            pos: self.buf.len(),
            reserved: max_bytes,
            byte_idx: 0,
            bit_mask: 0x40,
        });
        self.buf.resize(self.buf.len() + max_bytes, 0);
    }

    /// Appends one bit to the open presence map.
    ///
    /// # Errors
    /// [`FastError::ProtocolViolation`] when no map is open or the reserved
    /// capacity is exhausted.
    pub fn write_pmap_bit(&mut self, bit: bool) -> Result<()> {
        let offset = self.total_written();
        let Some(frame) = self.frames.last_mut() else {
            return Err(FastError::violation("presence map stack empty", offset));
        };
        if frame.byte_idx == frame.reserved {
            return Err(FastError::violation(
                "presence map capacity exceeded",
                offset,
            ));
        }
        if bit {
            self.buf[frame.pos + frame.byte_idx] |= frame.bit_mask;
        }
        frame.bit_mask >>= 1;
        if frame.bit_mask == 0 {
            frame.byte_idx += 1;
            frame.bit_mask = 0x40;
        }
        Ok(())
    }

    /// Closes the innermost presence map: trims trailing zero bytes, sets the
    /// stop bit, and compacts the buffer.
    ///
    /// # Errors
    /// [`FastError::ProtocolViolation`] when no map is open.
    pub fn close_pmap(&mut self) -> Result<()> {
        let offset = self.total_written();
        let Some(frame) = self.frames.pop() else {
            return Err(FastError::violation(
                "close of unopened presence map",
                offset,
            ));
        };
        let region = &self.buf[frame.pos..frame.pos + frame.reserved];
        let used = region
            .iter()
            .rposition(|&b| b != 0)
            .map_or(1, |idx| idx + 1);
        self.buf[frame.pos + used - 1] |= 0x80;
        if used < frame.reserved {
            self.buf
                .copy_within(frame.pos + frame.reserved.., frame.pos + used);
            self.buf.truncate(self.buf.len() - (frame.reserved - used));
        }
        Ok(())
    }

    /// Current presence-map nesting depth.
    #[must_use]
    pub fn pmap_depth(&self) -> usize {
        self.frames.len()
    }

    /// Drains the completed prefix of the buffer into the sink.
    ///
    /// Bytes at or after the oldest open presence map stay buffered.
    ///
    /// # Errors
    /// [`FastError::WouldBlock`] when the sink stalls (progress is kept),
    /// [`FastError::Shutdown`] on cooperative cancel, [`FastError::Io`] on
    /// sink failure.
    pub fn flush(&mut self) -> Result<()> {
        let limit = self.frames.first().map_or(self.buf.len(), |f| f.pos);
        let mut written = 0;
        let result = loop {
            if written == limit {
                break Ok(());
            }
            if let Some(flag) = &self.shutdown {
                if flag.load(Ordering::Relaxed) {
                    break Err(FastError::Shutdown);
                }
            }
            match self.sink.write(&self.buf[written..limit]) {
                Ok(n) => written += n,
                Err(TransferError::WouldBlock) => break Err(FastError::WouldBlock),
                Err(other) => break Err(other.into_fast_error(self.flushed + written as u64)),
            }
        };
        if written > 0 {
            self.buf.copy_within(written.., 0);
            self.buf.truncate(self.buf.len() - written);
            self.flushed += written as u64;
            for frame in &mut self.frames {
                frame.pos -= written;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::VecSink;
    use crate::reader::StopBitReader;
    use crate::SliceSource;

    fn writer() -> StopBitWriter<VecSink> {
        StopBitWriter::new(VecSink::new(), 256)
    }

    fn finish(mut w: StopBitWriter<VecSink>) -> Vec<u8> {
        w.flush().unwrap();
        w.into_sink().into_inner()
    }

    #[test]
    fn test_write_u64_forms() {
        let mut w = writer();
        w.write_u64(0);
        w.write_u64(1);
        w.write_u64(942);
        assert_eq!(finish(w), vec![0x80, 0x81, 0x07, 0xAE]);
    }

    #[test]
    fn test_write_i64_small_values() {
        let mut w = writer();
        w.write_i64(1);
        w.write_i64(-1);
        w.write_i64(63);
        w.write_i64(-64);
        assert_eq!(finish(w), vec![0x81, 0xFF, 0xBF, 0xC0]);
    }

    #[test]
    fn test_write_i64_boundary_values() {
        // 64 needs a second byte: bit 6 of a single byte would read as sign.
        let mut w = writer();
        w.write_i64(64);
        w.write_i64(-65);
        assert_eq!(finish(w), vec![0x00, 0xC0, 0x7F, 0xBF]);
    }

    #[test]
    fn test_varint_round_trip_extremes() {
        let values = [
            0i64,
            1,
            -1,
            63,
            64,
            -64,
            -65,
            8191,
            8192,
            i64::from(i32::MAX),
            i64::from(i32::MIN),
            i64::MAX,
            i64::MIN,
        ];
        let mut w = writer();
        for &v in &values {
            w.write_i64(v);
        }
        let bytes = finish(w);
        let mut r = StopBitReader::new(SliceSource::new(&bytes), 64);
        for &v in &values {
            assert_eq!(r.read_i64().unwrap(), v);
        }

        let unsigned = [0u64, 1, 127, 128, 16383, 16384, u64::from(u32::MAX), u64::MAX];
        let mut w = writer();
        for &v in &unsigned {
            w.write_u64(v);
        }
        let bytes = finish(w);
        let mut r = StopBitReader::new(SliceSource::new(&bytes), 64);
        for &v in &unsigned {
            assert_eq!(r.read_u64().unwrap(), v);
        }
    }

    #[test]
    fn test_write_ascii_forms() {
        let mut w = writer();
        w.write_ascii(b"Hi!", false);
        w.write_ascii(b"", false);
        w.write_ascii(b"", true);
        w.write_null();
        assert_eq!(
            finish(w),
            vec![b'H', b'i', b'!' | 0x80, 0x80, 0x00, 0x80, 0x80]
        );
    }

    #[test]
    fn test_pmap_trims_trailing_zeros() {
        let mut w = writer();
        w.open_pmap(3);
        w.write_pmap_bit(true).unwrap();
        w.write_pmap_bit(false).unwrap();
        w.write_pmap_bit(true).unwrap();
        w.write_u64(5);
        w.close_pmap().unwrap();
        // Three reserved bytes collapse to one: 0b0101_0000 | stop.
        assert_eq!(finish(w), vec![0b1101_0000, 0x85]);
    }

    #[test]
    fn test_pmap_empty_map_keeps_one_byte() {
        let mut w = writer();
        w.open_pmap(2);
        w.write_pmap_bit(false).unwrap();
        w.close_pmap().unwrap();
        assert_eq!(finish(w), vec![0x80]);
    }

    #[test]
    fn test_pmap_multi_byte() {
        let mut w = writer();
        w.open_pmap(2);
        for _ in 0..7 {
            w.write_pmap_bit(false).unwrap();
        }
        w.write_pmap_bit(true).unwrap();
        w.close_pmap().unwrap();
        assert_eq!(finish(w), vec![0x00, 0b1100_0000]);
    }

    #[test]
    fn test_nested_pmaps_compact_independently() {
        let mut w = writer();
        w.open_pmap(2);
        w.write_pmap_bit(true).unwrap();
        w.write_u64(1);
        w.open_pmap(2);
        w.write_pmap_bit(true).unwrap();
        w.write_u64(2);
        w.close_pmap().unwrap();
        w.close_pmap().unwrap();
        assert_eq!(finish(w), vec![0b1100_0000, 0x81, 0b1100_0000, 0x82]);
    }

    #[test]
    fn test_pmap_capacity_enforced() {
        let mut w = writer();
        w.open_pmap(1);
        for _ in 0..7 {
            w.write_pmap_bit(false).unwrap();
        }
        assert!(w.write_pmap_bit(false).is_err());
        w.close_pmap().unwrap();
    }

    #[test]
    fn test_flush_stops_at_open_pmap() {
        let mut w = writer();
        w.write_u64(1);
        w.open_pmap(1);
        w.write_u64(2);
        w.flush().unwrap();
        assert_eq!(w.into_sink().as_bytes(), &[0x81]);
    }

    #[test]
    fn test_round_trip_through_reader_pmap() {
        let mut w = writer();
        w.open_pmap(2);
        let bits = [true, false, true, true, false, false, true, true, false];
        for &b in &bits {
            w.write_pmap_bit(b).unwrap();
        }
        w.close_pmap().unwrap();
        let bytes = finish(w);
        let mut r = StopBitReader::new(SliceSource::new(&bytes), 16);
        r.open_pmap(2).unwrap();
        for &b in &bits {
            assert_eq!(r.pop_pmap_bit().unwrap(), u8::from(b));
        }
        r.close_pmap().unwrap();
    }
}
