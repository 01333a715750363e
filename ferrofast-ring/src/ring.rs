/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! The dual-ring implementation.
//!
//! Ordering discipline: the producer publishes fragments with a release store
//! on the slab head (the blob head is stored first), and the consumer
//! observes them with an acquire load. The pairing makes every slab slot and
//! every blob byte of a published fragment visible before its header is.
//! Tails mirror the same discipline in the other direction.
//!
//! Cursors are monotonically increasing `u64` values; buffer indexes are the
//! cursor masked by `size - 1`. Both sizes are powers of two.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use ferrofast_core::{EngineConfig, FastError, Result, EOF_MESSAGE_IDX};

struct RingShared {
    slab: Box<[UnsafeCell<i32>]>,
    blob: Box<[UnsafeCell<u8>]>,
    slab_mask: u64,
    blob_mask: u64,
    slab_head: CachePadded<AtomicU64>,
    slab_tail: CachePadded<AtomicU64>,
    blob_head: CachePadded<AtomicU64>,
    blob_tail: CachePadded<AtomicU64>,
}

// One producer and one consumer access disjoint cursor ranges of the
// UnsafeCell buffers; the head/tail protocol is what makes this sound.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    #[inline]
    fn slab_write(&self, index: u64, value: i32) {
        unsafe {
            *self.slab[(index & self.slab_mask) as usize].get() = value;
        }
    }

    #[inline]
    fn slab_read(&self, index: u64) -> i32 {
        unsafe { *self.slab[(index & self.slab_mask) as usize].get() }
    }

    #[inline]
    fn blob_write(&self, index: u64, data: &[u8]) {
        let start = (index & self.blob_mask) as usize;
        let size = self.blob.len();
        let first = data.len().min(size - start);
        unsafe {
            for (i, &b) in data[..first].iter().enumerate() {
                *self.blob[start + i].get() = b;
            }
            for (i, &b) in data[first..].iter().enumerate() {
                *self.blob[i].get() = b;
            }
        }
    }

    #[inline]
    fn blob_read_into(&self, index: u64, len: usize, out: &mut Vec<u8>) {
        let start = (index & self.blob_mask) as usize;
        let size = self.blob.len();
        let first = len.min(size - start);
        unsafe {
            for i in 0..first {
                out.push(*self.blob[start + i].get());
            }
            for i in 0..len - first {
                out.push(*self.blob[i].get());
            }
        }
    }
}

/// Creates one dual ring and splits it into its two single-owner halves.
#[must_use]
pub fn dual_ring(config: &EngineConfig) -> (RingProducer, RingConsumer) {
    let slab_size = config.slab_size();
    let blob_size = config.blob_size();
    let shared = Arc::new(RingShared {
        slab: (0..slab_size).map(|_| UnsafeCell::new(0)).collect(),
        blob: (0..blob_size).map(|_| UnsafeCell::new(0)).collect(),
        slab_mask: slab_size as u64 - 1,
        blob_mask: blob_size as u64 - 1,
        slab_head: CachePadded::new(AtomicU64::new(0)),
        slab_tail: CachePadded::new(AtomicU64::new(0)),
        blob_head: CachePadded::new(AtomicU64::new(0)),
        blob_tail: CachePadded::new(AtomicU64::new(0)),
    });
    let shutdown = Arc::new(AtomicBool::new(false));
    let producer = RingProducer {
        shared: Arc::clone(&shared),
        shutdown: Arc::clone(&shutdown),
        slab_size: slab_size as u64,
        blob_size: blob_size as u64,
        working_head: 0,
        working_blob: 0,
        committed_head: 0,
        committed_blob: 0,
        blob_write_base: 0,
        cached_tail: 0,
        cached_blob_tail: 0,
        publish_batch: config.batch_publish_size,
        publish_countdown: config.batch_publish_size,
        non_blocking: config.non_blocking,
    };
    let consumer = RingConsumer {
        shared,
        shutdown,
        working_tail: 0,
        blob_read_base: 0,
        cached_head: 0,
        released_tail: 0,
        released_blob: 0,
        release_batch: config.batch_release_size,
        release_countdown: config.batch_release_size,
        mark: None,
    };
    (producer, consumer)
}

/// Largest safe publish/release batch: half of what the smaller ring can hold
/// in worst-case fragments.
#[must_use]
pub fn compute_max_batch_size(
    config: &EngineConfig,
    max_fragment_slots: usize,
    max_var_len: usize,
) -> u32 {
    let by_slab = config.slab_size() / max_fragment_slots.max(1);
    let by_blob = config.blob_size() / max_var_len.max(1);
    (by_slab.min(by_blob) / 2).max(1) as u32
}

/// The writing half of a dual ring. Owned by exactly one thread.
pub struct RingProducer {
    shared: Arc<RingShared>,
    shutdown: Arc<AtomicBool>,
    slab_size: u64,
    blob_size: u64,
    working_head: u64,
    working_blob: u64,
    committed_head: u64,
    committed_blob: u64,
    blob_write_base: u64,
    cached_tail: u64,
    cached_blob_tail: u64,
    publish_batch: u32,
    publish_countdown: u32,
    non_blocking: bool,
}

impl RingProducer {
    /// Attempts to reserve slab and blob space for one fragment.
    #[must_use]
    pub fn try_reserve(&mut self, slots: usize, blob_bytes: usize) -> bool {
        let slots = slots as u64;
        let blob_bytes = blob_bytes as u64;
        if self.working_head + slots - self.cached_tail > self.slab_size {
            self.cached_tail = self.shared.slab_tail.load(Ordering::Acquire);
            if self.working_head + slots - self.cached_tail > self.slab_size {
                return false;
            }
        }
        if self.working_blob + blob_bytes - self.cached_blob_tail > self.blob_size {
            self.cached_blob_tail = self.shared.blob_tail.load(Ordering::Acquire);
            if self.working_blob + blob_bytes - self.cached_blob_tail > self.blob_size {
                return false;
            }
        }
        true
    }

    /// Reserves space for one fragment, spinning until the consumer frees
    /// enough (blocking mode) or failing fast (non-blocking mode).
    ///
    /// Pending batched fragments are always published before blocking, so the
    /// consumer can make the space this call is waiting for.
    ///
    /// # Errors
    /// [`FastError::RingOverflow`] in non-blocking mode,
    /// [`FastError::Shutdown`] on cooperative cancel.
    pub fn reserve(&mut self, slots: usize, blob_bytes: usize) -> Result<()> {
        if self.try_reserve(slots, blob_bytes) {
            return Ok(());
        }
        self.publish();
        if self.non_blocking {
            let available = (self.slab_size - (self.working_head - self.cached_tail)) as usize;
            return Err(FastError::RingOverflow {
                needed: slots,
                available,
            });
        }
        while !self.try_reserve(slots, blob_bytes) {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(FastError::Shutdown);
            }
            std::thread::yield_now();
        }
        Ok(())
    }

    /// Opens a fragment by writing its header slot.
    pub fn begin_fragment(&mut self, msg_idx: i32) {
        self.write_int(msg_idx);
    }

    /// Writes one int slot.
    pub fn write_int(&mut self, value: i32) {
        self.shared.slab_write(self.working_head, value);
        self.working_head += 1;
    }

    /// Writes a long as two slots, most significant half first.
    pub fn write_long(&mut self, value: i64) {
        self.write_int((value >> 32) as i32);
        self.write_int(value as i32);
    }

    /// Writes a decimal as exponent slot plus mantissa slots.
    pub fn write_decimal(&mut self, exponent: i32, mantissa: i64) {
        self.write_int(exponent);
        self.write_long(mantissa);
    }

    /// Appends a variable-length field: bytes into the blob, then the
    /// `{meta, length}` slot pair.
    pub fn write_var_field(&mut self, data: &[u8]) {
        let meta = (self.working_blob - self.blob_write_base) as i32;
        self.shared.blob_write(self.working_blob, data);
        self.working_blob += data.len() as u64;
        self.write_int(meta);
        self.write_int(data.len() as i32);
    }

    /// Appends a constant-pool reference instead of blob bytes. The meta slot
    /// holds the negative constant index.
    pub fn write_const_field(&mut self, const_index: u32, len: i32) {
        self.write_int(-(const_index as i32) - 1);
        self.write_int(len);
    }

    /// Appends an absent variable-length field.
    pub fn write_null_var_field(&mut self, null_len: i32) {
        let meta = (self.working_blob - self.blob_write_base) as i32;
        self.write_int(meta);
        self.write_int(null_len);
    }

    /// Closes the current fragment: records the blob bytes it consumed and
    /// publishes when the batch countdown reaches zero.
    pub fn end_fragment(&mut self) {
        let consumed = (self.working_blob - self.blob_write_base) as i32;
        self.write_int(consumed);
        self.blob_write_base = self.working_blob;
        self.committed_head = self.working_head;
        self.committed_blob = self.working_blob;
        self.publish_countdown -= 1;
        if self.publish_countdown == 0 {
            self.publish_countdown = self.publish_batch;
            self.publish();
        }
    }

    /// Makes all closed fragments visible to the consumer.
    pub fn publish(&mut self) {
        self.shared
            .blob_head
            .store(self.committed_blob, Ordering::Release);
        self.shared
            .slab_head
            .store(self.committed_head, Ordering::Release);
    }

    /// Discards the slots and blob bytes of the fragment being built.
    pub fn abandon(&mut self) {
        self.working_head = self.committed_head;
        self.working_blob = self.committed_blob;
        self.blob_write_base = self.committed_blob;
    }

    /// Publishes the end-of-stream sentinel: a two-slot fragment whose header
    /// is [`EOF_MESSAGE_IDX`]. Published immediately, bypassing batching.
    ///
    /// # Errors
    /// Propagates [`RingProducer::reserve`] failures.
    pub fn publish_eof(&mut self) -> Result<()> {
        self.reserve(ferrofast_core::EOF_FRAGMENT_SIZE, 0)?;
        self.write_int(EOF_MESSAGE_IDX);
        self.write_int(0);
        self.committed_head = self.working_head;
        self.committed_blob = self.working_blob;
        self.publish();
        Ok(())
    }

    /// Raises the cooperative shutdown flag shared with the consumer.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// True when either side requested shutdown.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// The flag polled by byte sources and sinks at their refill points.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
}

/// The reading half of a dual ring. Owned by exactly one thread.
pub struct RingConsumer {
    shared: Arc<RingShared>,
    shutdown: Arc<AtomicBool>,
    working_tail: u64,
    blob_read_base: u64,
    cached_head: u64,
    released_tail: u64,
    released_blob: u64,
    release_batch: u32,
    release_countdown: u32,
    mark: Option<(u64, u64)>,
}

impl RingConsumer {
    /// Published slots not yet consumed by the working tail.
    pub fn available(&mut self) -> u64 {
        if self.cached_head == self.working_tail {
            self.cached_head = self.shared.slab_head.load(Ordering::Acquire);
        }
        self.cached_head - self.working_tail
    }

    /// True when at least `min_slots` published slots are waiting.
    pub fn try_read_fragment(&mut self, min_slots: usize) -> bool {
        if self.available() >= min_slots as u64 {
            return true;
        }
        self.cached_head = self.shared.slab_head.load(Ordering::Acquire);
        self.cached_head - self.working_tail >= min_slots as u64
    }

    /// Reads a published slot `offset` slots ahead without consuming it.
    #[must_use]
    pub fn peek_int(&self, offset: usize) -> i32 {
        self.shared.slab_read(self.working_tail + offset as u64)
    }

    /// Consumes one int slot.
    pub fn read_int(&mut self) -> i32 {
        let value = self.shared.slab_read(self.working_tail);
        self.working_tail += 1;
        value
    }

    /// Consumes two slots as a long, most significant half first.
    pub fn read_long(&mut self) -> i64 {
        let hi = self.read_int();
        let lo = self.read_int();
        (i64::from(hi) << 32) | i64::from(lo as u32)
    }

    /// Consumes three slots as a decimal.
    pub fn read_decimal(&mut self) -> (i32, i64) {
        let exponent = self.read_int();
        let mantissa = self.read_long();
        (exponent, mantissa)
    }

    /// Consumes a `{meta, length}` slot pair.
    pub fn read_var_meta(&mut self) -> (i32, i32) {
        let meta = self.read_int();
        let len = self.read_int();
        (meta, len)
    }

    /// Copies a variable-length field out of the blob. `meta` must come from
    /// the current fragment and be non-negative (constant references resolve
    /// through the catalog instead).
    pub fn read_bytes_into(&self, meta: i32, len: usize, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(len);
        self.shared
            .blob_read_into(self.blob_read_base + meta as u64, len, out);
    }

    /// Releases the fragment just consumed: reads the trailing bytes-consumed
    /// slot, advances the blob tail by it, and publishes the tails when the
    /// batch countdown reaches zero.
    pub fn release_read(&mut self) {
        let consumed = self.read_int();
        self.blob_read_base += consumed as u64;
        self.release_countdown -= 1;
        if self.release_countdown == 0 {
            self.release_countdown = self.release_batch;
            self.publish_tails();
        }
    }

    /// Publishes the release positions immediately.
    pub fn publish_tails(&mut self) {
        self.released_tail = self.working_tail;
        self.released_blob = self.blob_read_base;
        self.shared
            .blob_tail
            .store(self.released_blob, Ordering::Release);
        self.shared
            .slab_tail
            .store(self.released_tail, Ordering::Release);
        self.mark = None;
    }

    /// Snapshots the working positions so a peeked fragment can be re-read.
    pub fn mark(&mut self) {
        self.mark = Some((self.working_tail, self.blob_read_base));
    }

    /// Rewinds to the last [`RingConsumer::mark`]. No-op without a mark.
    pub fn reset_to_mark(&mut self) {
        if let Some((tail, blob)) = self.mark.take() {
            self.working_tail = tail;
            self.blob_read_base = blob;
        }
    }

    /// True while a mark is pending.
    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.mark.is_some()
    }

    /// Drops the pending mark, keeping the current positions.
    pub fn cancel_replay(&mut self) {
        self.mark = None;
    }

    /// True when the given fragment header is the end-of-stream sentinel.
    #[must_use]
    pub const fn is_eof_header(header: i32) -> bool {
        header == EOF_MESSAGE_IDX
    }

    /// Raises the cooperative shutdown flag shared with the producer.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// True when either side requested shutdown.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// The flag polled by byte sources and sinks at their refill points.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrofast_core::EngineConfigBuilder;

    fn small_ring() -> (RingProducer, RingConsumer) {
        let config = EngineConfigBuilder::new().rings(6, 6).build().unwrap();
        dual_ring(&config)
    }

    #[test]
    fn test_single_fragment_round_trip() {
        let (mut producer, mut consumer) = small_ring();
        assert!(producer.try_reserve(8, 5));
        producer.begin_fragment(3);
        producer.write_int(42);
        producer.write_long(-7);
        producer.write_var_field(b"hello");
        producer.end_fragment();

        assert!(consumer.try_read_fragment(8));
        assert_eq!(consumer.read_int(), 3);
        assert_eq!(consumer.read_int(), 42);
        assert_eq!(consumer.read_long(), -7);
        let (meta, len) = consumer.read_var_meta();
        assert_eq!(len, 5);
        let mut out = Vec::new();
        consumer.read_bytes_into(meta, len as usize, &mut out);
        assert_eq!(out, b"hello");
        consumer.release_read();
    }

    #[test]
    fn test_fragment_not_visible_before_end() {
        let (mut producer, mut consumer) = small_ring();
        producer.begin_fragment(0);
        producer.write_int(1);
        assert!(!consumer.try_read_fragment(1));
        producer.end_fragment();
        assert!(consumer.try_read_fragment(3));
    }

    #[test]
    fn test_long_msb_first_layout() {
        let (mut producer, mut consumer) = small_ring();
        producer.begin_fragment(0);
        producer.write_long(0x0102_0304_0506_0708);
        producer.end_fragment();
        assert!(consumer.try_read_fragment(4));
        consumer.read_int();
        assert_eq!(consumer.peek_int(0), 0x0102_0304);
        assert_eq!(consumer.peek_int(1), 0x0506_0708);
        assert_eq!(consumer.read_long(), 0x0102_0304_0506_0708);
        consumer.release_read();
    }

    #[test]
    fn test_blob_wraps_around() {
        let (mut producer, mut consumer) = small_ring();
        let chunk = [0xABu8; 24];
        let mut out = Vec::new();
        for _ in 0..16 {
            producer.reserve(4, 24).unwrap();
            producer.begin_fragment(0);
            producer.write_var_field(&chunk);
            producer.end_fragment();

            assert!(consumer.try_read_fragment(4));
            assert_eq!(consumer.read_int(), 0);
            let (meta, len) = consumer.read_var_meta();
            consumer.read_bytes_into(meta, len as usize, &mut out);
            assert_eq!(out, chunk);
            consumer.release_read();
        }
    }

    #[test]
    fn test_abandon_discards_open_fragment() {
        let (mut producer, mut consumer) = small_ring();
        producer.begin_fragment(0);
        producer.write_int(99);
        producer.write_var_field(b"junk");
        producer.abandon();

        producer.begin_fragment(1);
        producer.write_int(7);
        producer.end_fragment();
        assert!(consumer.try_read_fragment(3));
        assert_eq!(consumer.read_int(), 1);
        assert_eq!(consumer.read_int(), 7);
        consumer.release_read();
        assert!(!consumer.try_read_fragment(1));
    }

    #[test]
    fn test_non_blocking_overflow() {
        let config = EngineConfigBuilder::new()
            .rings(6, 6)
            .non_blocking(true)
            .build()
            .unwrap();
        let (mut producer, _consumer) = dual_ring(&config);
        for i in 0..32 {
            producer.reserve(2, 0).unwrap();
            producer.begin_fragment(i);
            producer.end_fragment();
        }
        assert!(matches!(
            producer.reserve(2, 0),
            Err(FastError::RingOverflow { .. })
        ));
    }

    #[test]
    fn test_batched_publish_flushes_before_blocking() {
        let config = EngineConfigBuilder::new()
            .rings(6, 6)
            .batching(8, 1)
            .non_blocking(true)
            .build()
            .unwrap();
        let (mut producer, mut consumer) = dual_ring(&config);
        for i in 0..3 {
            producer.reserve(2, 0).unwrap();
            producer.begin_fragment(i);
            producer.end_fragment();
        }
        // Not yet published: countdown is 8.
        assert!(!consumer.try_read_fragment(1));
        // An oversized reserve fails, but publishes the pending batch first.
        assert!(producer.reserve(64, 0).is_err());
        assert!(consumer.try_read_fragment(6));
    }

    #[test]
    fn test_eof_sentinel() {
        let (mut producer, mut consumer) = small_ring();
        producer.publish_eof().unwrap();
        assert!(consumer.try_read_fragment(2));
        let header = consumer.read_int();
        assert!(RingConsumer::is_eof_header(header));
        consumer.release_read();
    }

    #[test]
    fn test_mark_and_reset_replay() {
        let (mut producer, mut consumer) = small_ring();
        producer.begin_fragment(5);
        producer.write_var_field(b"abc");
        producer.end_fragment();

        assert!(consumer.try_read_fragment(4));
        consumer.mark();
        assert_eq!(consumer.read_int(), 5);
        let (meta, len) = consumer.read_var_meta();
        let mut out = Vec::new();
        consumer.read_bytes_into(meta, len as usize, &mut out);
        assert_eq!(out, b"abc");
        assert!(consumer.is_replaying());
        consumer.reset_to_mark();
        // Same fragment again from the top.
        assert_eq!(consumer.read_int(), 5);
        let (meta, len) = consumer.read_var_meta();
        consumer.read_bytes_into(meta, len as usize, &mut out);
        assert_eq!(out, b"abc");
        consumer.release_read();
    }

    #[test]
    fn test_shutdown_breaks_reserve_spin() {
        let (mut producer, _consumer) = small_ring();
        for i in 0..32 {
            producer.reserve(2, 0).unwrap();
            producer.begin_fragment(i);
            producer.end_fragment();
        }
        producer.shutdown();
        assert!(matches!(producer.reserve(2, 0), Err(FastError::Shutdown)));
    }

    #[test]
    fn test_max_batch_size_bound() {
        let config = EngineConfigBuilder::new().rings(10, 10).build().unwrap();
        assert_eq!(compute_max_batch_size(&config, 16, 32), 16);
        assert_eq!(compute_max_batch_size(&config, 1024, 1024), 1);
    }
}
