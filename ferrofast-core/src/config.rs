/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Engine configuration.
//!
//! One [`EngineConfig`] describes the sizing of a single codec pipe: the
//! dual-ring geometry, variable-length bounds, message preamble, and the
//! publish/release batching discipline.

use serde::{Deserialize, Serialize};

use crate::error::{FastError, Result};
use crate::{ABSENT_INT, ABSENT_LONG};

/// Smallest permitted slab ring size exponent.
pub const MIN_SLAB_BITS: u8 = 6;
/// Largest permitted slab ring size exponent.
pub const MAX_SLAB_BITS: u8 = 24;
/// Largest permitted blob ring size exponent.
pub const MAX_BLOB_BITS: u8 = 28;

/// Configuration for a single codec pipe.
///
/// Both halves of one pipe (the codec side and the consumer side) must be
/// built from the same configuration, otherwise the fragment size accounting
/// desynchronizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Slab ring holds `1 << slab_bits` int slots.
    pub slab_bits: u8,
    /// Blob ring holds `1 << blob_bits` bytes. Zero disables the blob side.
    pub blob_bits: u8,
    /// Fixed per-message header copied verbatim through the ring. Commonly
    /// 0 or 4.
    pub preamble_bytes: u8,
    /// Upper bound on decoded ASCII/UTF-8 text length.
    pub max_text_len: u32,
    /// Upper bound on decoded byte-vector length.
    pub max_byte_vector_len: u32,
    /// Fragments accumulated before the producer publishes its heads.
    pub batch_publish_size: u32,
    /// Fragments accumulated before the consumer publishes its tails.
    pub batch_release_size: u32,
    /// When true, ring exhaustion reports [`FastError::RingOverflow`] instead
    /// of spinning.
    pub non_blocking: bool,
    /// Sentinel written to an int slot for an absent optional int32.
    pub absent_int: i32,
    /// Sentinel written to long slots for an absent optional int64.
    pub absent_long: i64,
    /// Internal buffer capacity of the primitive reader and writer.
    pub io_buffer_capacity: usize,
    /// Extra tracing of script execution when enabled.
    pub debug_script: bool,
}

impl EngineConfig {
    /// Creates a configuration with the given ring geometry.
    ///
    /// # Arguments
    /// * `slab_bits` - log2 of the slab slot count, in `6..=24`
    /// * `blob_bits` - log2 of the blob byte count, in `0..=28`
    #[must_use]
    pub fn new(slab_bits: u8, blob_bits: u8) -> Self {
        Self {
            slab_bits,
            blob_bits,
            preamble_bytes: 0,
            max_text_len: 64,
            max_byte_vector_len: 64,
            batch_publish_size: 1,
            batch_release_size: 1,
            non_blocking: false,
            absent_int: ABSENT_INT,
            absent_long: ABSENT_LONG,
            io_buffer_capacity: 4096,
            debug_script: false,
        }
    }

    /// Validates the ranges of all sizing fields.
    ///
    /// # Errors
    /// Returns [`FastError::Configuration`] describing the first out-of-range
    /// field.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_SLAB_BITS..=MAX_SLAB_BITS).contains(&self.slab_bits) {
            return Err(FastError::Configuration(format!(
                "slab_bits {} outside {}..={}",
                self.slab_bits, MIN_SLAB_BITS, MAX_SLAB_BITS
            )));
        }
        if self.blob_bits > MAX_BLOB_BITS {
            return Err(FastError::Configuration(format!(
                "blob_bits {} exceeds {}",
                self.blob_bits, MAX_BLOB_BITS
            )));
        }
        if self.batch_publish_size == 0 || self.batch_release_size == 0 {
            return Err(FastError::Configuration("batch sizes must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Slab slot count.
    #[must_use]
    pub const fn slab_size(&self) -> usize {
        1 << self.slab_bits
    }

    /// Blob byte count.
    #[must_use]
    pub const fn blob_size(&self) -> usize {
        1 << self.blob_bits
    }

    /// Int slots needed to carry the preamble through the ring.
    #[must_use]
    pub const fn preamble_slots(&self) -> usize {
        self.preamble_bytes.div_ceil(4) as usize
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(14, 16)
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: Option<EngineConfig>,
}

impl EngineConfigBuilder {
    /// Creates a new builder with default sizing.
    #[must_use]
    pub fn new() -> Self {
        Self { config: None }
    }

    fn config(&mut self) -> &mut EngineConfig {
        self.config.get_or_insert_with(EngineConfig::default)
    }

    /// Sets the ring geometry.
    #[must_use]
    pub fn rings(mut self, slab_bits: u8, blob_bits: u8) -> Self {
        let c = self.config();
        c.slab_bits = slab_bits;
        c.blob_bits = blob_bits;
        self
    }

    /// Sets the verbatim message preamble size in bytes.
    #[must_use]
    pub fn preamble_bytes(mut self, bytes: u8) -> Self {
        self.config().preamble_bytes = bytes;
        self
    }

    /// Sets the maximum text length.
    #[must_use]
    pub fn max_text_len(mut self, len: u32) -> Self {
        self.config().max_text_len = len;
        self
    }

    /// Sets the maximum byte-vector length.
    #[must_use]
    pub fn max_byte_vector_len(mut self, len: u32) -> Self {
        self.config().max_byte_vector_len = len;
        self
    }

    /// Sets the publish and release batch sizes.
    #[must_use]
    pub fn batching(mut self, publish: u32, release: u32) -> Self {
        let c = self.config();
        c.batch_publish_size = publish;
        c.batch_release_size = release;
        self
    }

    /// Selects non-blocking ring reservation.
    #[must_use]
    pub fn non_blocking(mut self, enabled: bool) -> Self {
        self.config().non_blocking = enabled;
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    /// Returns the validation failure of [`EngineConfig::validate`].
    pub fn build(mut self) -> Result<EngineConfig> {
        let config = self.config().clone();
        config.validate()?;
        Ok(config)
    }
}
