/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # FerroFast Core
//!
//! Core error and configuration types for the FerroFast codec engine.
//!
//! FAST (FIX Adapted for STreaming) is a binary encoding protocol used for
//! high-performance market data feeds. This crate holds the pieces every other
//! FerroFast crate depends on:
//!
//! - [`FastError`]: the unified error hierarchy for decode, encode, catalog
//!   and ring operations
//! - [`EngineConfig`]: sizing and behavior configuration for one codec pipe
//! - Null sentinel constants for optional fields

pub mod config;
pub mod error;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use error::{CatalogError, DecodeContext, FastError, Result};

/// Value placed in a ring int slot when an optional int32 field is absent.
pub const ABSENT_INT: i32 = i32::MIN;

/// Value placed in ring long slots when an optional int64 field is absent.
pub const ABSENT_LONG: i64 = i64::MIN;

/// Length-slot value marking an absent variable-length field.
pub const ABSENT_LEN: i32 = -1;

/// Fragment header value used as the end-of-stream poison pill.
pub const EOF_MESSAGE_IDX: i32 = -1;

/// Slot count of the end-of-stream sentinel fragment (header + byte count).
pub const EOF_FRAGMENT_SIZE: usize = 2;
