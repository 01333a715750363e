/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # FerroFast Ring
//!
//! The lock-free single-producer/single-consumer dual ring that carries
//! decoded fragments between the codec and its neighbors.
//!
//! One ring is an internal pair of buffers: a *slab* of int slots for the
//! fixed-size structured fields, and a *blob* of bytes backing the
//! variable-length fields. Exactly one thread owns the [`RingProducer`] and
//! exactly one the [`RingConsumer`]; the only shared state is the two buffers
//! and four cache-line-padded cursors.
//!
//! Slot layout per fragment: a header int (the message index), the field
//! slots (int = 1 slot, long = 2 slots MSB first, decimal = 3 slots,
//! variable-length = meta + length), and a trailing int recording the blob
//! bytes the fragment consumed. The trailing slot makes the read release O(1)
//! without re-walking the fields.

pub mod ring;

pub use ring::{dual_ring, compute_max_batch_size, RingConsumer, RingProducer};
