/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! # FerroFast Token
//!
//! The packed token model executed by the FerroFast codec.
//!
//! A compiled template catalog is a linear script of 32-bit tokens. Each token
//! packs the field type, the compression operator, the optionality flag and a
//! 20-bit instance index (the dictionary slot, or for group tokens the
//! distance to the partner token). The packed form is what the hot dispatch
//! loop indexes with; [`Token`] is the unpacked view used everywhere else.

pub mod token;

pub use token::{group_flags, OpTag, PackedToken, Token, TypeTag, MAX_INSTANCE};
