/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # FerroFast Codec
//!
//! The operator layer of the FAST engine: per-field state machines for every
//! `{type, operator, optionality}` combination, the byte heap backing string
//! operators, and the two script-driving state machines — [`DynamicReader`]
//! decodes a byte stream into ring fragments, [`DynamicWriter`] encodes ring
//! fragments back into bytes.
//!
//! Decode and encode paths are structurally symmetric and share one presence
//! map bit table; a disagreement between the two sides desynchronizes the
//! stream silently, so both are driven from the same packed-token dispatch
//! index.

pub mod decoder;
pub mod encoder;
pub mod heap;
pub mod reader;
pub mod writer;

pub use decoder::FieldDecoder;
pub use encoder::FieldEncoder;
pub use heap::LocalHeap;
pub use reader::{DynamicReader, ReadEvent};
pub use writer::{DynamicWriter, WriteEvent};
