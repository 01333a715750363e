/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # FerroFast
//!
//! A high-performance FAST (FIX Adapted for STreaming) codec engine for Rust.
//!
//! FAST compresses FIX-like financial messages with bit-packed presence maps,
//! operator-based field prediction and stop-bit variable-length integers.
//! From an XML template catalog, FerroFast builds a linear token script and
//! executes it against a byte stream, exchanging structured fragments with
//! surrounding stages through a lock-free single-producer/single-consumer
//! dual ring.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use ferrofast::prelude::*;
//! use std::sync::Arc;
//!
//! let catalog = Arc::new(build_catalog(&template_xml)?);
//! let config = EngineConfig::new(14, 16);
//! let (mut reader, mut fragments) =
//!     DynamicReader::new(catalog, &config, SliceSource::new(&bytes))?;
//! while reader.poll()? != ReadEvent::EndOfStream {
//!     // drain `fragments` on the consumer side
//! }
//! ```
//!
//! ## Crate organization
//!
//! - [`core`]: error hierarchy and engine configuration
//! - [`token`]: the packed 32-bit token model and size tables
//! - [`primitive`]: stop-bit varints, presence-map stacks, byte source/sink
//! - [`ring`]: the slab/blob SPSC dual ring
//! - [`catalog`]: XML loading, script compilation, catalog binary
//! - [`codec`]: operator dispatch, decode reactor, dynamic writer

pub mod core {
    //! Error hierarchy and engine configuration.
    pub use ferrofast_core::*;
}

pub mod token {
    //! The packed 32-bit token model and size tables.
    pub use ferrofast_token::*;
}

pub mod primitive {
    //! Stop-bit varints, presence-map stacks, byte source/sink adapters.
    pub use ferrofast_primitive::*;
}

pub mod ring {
    //! The slab/blob single-producer single-consumer dual ring.
    pub use ferrofast_ring::*;
}

pub mod catalog {
    //! XML loading, script compilation and the catalog binary form.
    pub use ferrofast_catalog::*;
}

pub mod codec {
    //! Operator dispatch, decode reactor and dynamic writer.
    pub use ferrofast_codec::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use ferrofast_catalog::{build_catalog, Catalog, DictionaryFactory, LongHashTable};
    pub use ferrofast_codec::{
        DynamicReader, DynamicWriter, FieldDecoder, FieldEncoder, LocalHeap, ReadEvent,
        WriteEvent,
    };
    pub use ferrofast_core::{
        CatalogError, DecodeContext, EngineConfig, EngineConfigBuilder, FastError, Result,
    };
    pub use ferrofast_primitive::{
        ByteSink, ByteSource, SliceSource, StopBitReader, StopBitWriter, VecSink,
    };
    pub use ferrofast_ring::{dual_ring, RingConsumer, RingProducer};
    pub use ferrofast_token::{OpTag, PackedToken, Token, TypeTag};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let config = EngineConfig::new(7, 6);
        let (_producer, _consumer) = dual_ring(&config);
        let token = Token::field(TypeTag::UInt32, OpTag::Copy, false, 1);
        assert_eq!(token.op_tag(), OpTag::Copy);
    }
}
