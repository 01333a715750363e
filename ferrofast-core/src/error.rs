/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Error types for the FerroFast codec engine.
//!
//! This module provides a unified error hierarchy using `thiserror` for typed,
//! domain-specific errors across all FerroFast operations.
//!
//! The fatal kinds are exclusive: a failing operation reports exactly one of
//! [`FastError::UnexpectedEndOfStream`], [`FastError::ProtocolViolation`],
//! [`FastError::Catalog`], [`FastError::RingOverflow`] or
//! [`FastError::Shutdown`]. [`FastError::WouldBlock`] is transient: the caller
//! is expected to retry once its byte source has more data.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using [`FastError`] as the error type.
pub type Result<T> = std::result::Result<T, FastError>;

/// Position information attached to decode and encode failures.
///
/// Layers fill in what they know: the primitive codec records the byte
/// offset, the operator dispatch adds the field id, the reactor adds the
/// template id and script cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeContext {
    /// Template id of the message being processed, or -1 when unknown.
    pub template_id: i64,
    /// Script cursor position, or -1 when unknown.
    pub cursor: i32,
    /// Field id from the template definition, or -1 when unknown.
    pub field_id: i64,
    /// Byte offset into the source stream.
    pub byte_offset: u64,
}

impl DecodeContext {
    /// Creates a context carrying only a byte offset.
    #[must_use]
    pub const fn at_offset(byte_offset: u64) -> Self {
        Self {
            template_id: -1,
            cursor: -1,
            field_id: -1,
            byte_offset,
        }
    }

    /// Returns a copy with the template id and script cursor filled in.
    #[must_use]
    pub const fn with_position(mut self, template_id: i64, cursor: i32) -> Self {
        self.template_id = template_id;
        self.cursor = cursor;
        self
    }

    /// Returns a copy with the field id filled in.
    #[must_use]
    pub const fn with_field(mut self, field_id: i64) -> Self {
        self.field_id = field_id;
        self
    }
}

impl Default for DecodeContext {
    fn default() -> Self {
        Self::at_offset(0)
    }
}

impl fmt::Display for DecodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template={}", self.template_id)?;
        if self.cursor >= 0 {
            write!(f, " cursor={}", self.cursor)?;
        }
        if self.field_id >= 0 {
            write!(f, " field={}", self.field_id)?;
        }
        write!(f, " byte={}", self.byte_offset)
    }
}

/// Top-level error type for all FerroFast operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FastError {
    /// Source exhausted in the middle of a field.
    #[error("unexpected end of stream: {0}")]
    UnexpectedEndOfStream(DecodeContext),

    /// Varint overflow, PMap underflow, forbidden null, unknown template id.
    #[error("protocol violation: {reason}: {context}")]
    ProtocolViolation {
        /// What was wrong with the wire data.
        reason: String,
        /// Where in the stream it happened.
        context: DecodeContext,
    },

    /// Error while building or reloading a template catalog.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Ring space exhausted. Only reported in non-blocking mode; blocking
    /// mode spins instead.
    #[error("ring overflow: need {needed} slots, have {available}")]
    RingOverflow {
        /// Slots the fragment needs.
        needed: usize,
        /// Slots currently free.
        available: usize,
    },

    /// Cooperative cancellation was requested.
    #[error("shutdown requested")]
    Shutdown,

    /// The byte source or sink cannot make progress right now. Transient:
    /// pending varint state is retained and the call can be repeated.
    #[error("source would block")]
    WouldBlock,

    /// Underlying I/O failure from a byte source or sink.
    #[error("io error: {0}")]
    Io(String),

    /// Configuration value out of range.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl FastError {
    /// Builds a protocol violation at the given stream position.
    #[must_use]
    pub fn violation(reason: impl Into<String>, byte_offset: u64) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
            context: DecodeContext::at_offset(byte_offset),
        }
    }

    /// Returns true for errors that abandon the stream (everything except
    /// [`FastError::RingOverflow`], [`FastError::Shutdown`] and
    /// [`FastError::WouldBlock`]).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::RingOverflow { .. } | Self::Shutdown | Self::WouldBlock
        )
    }

    /// Adds reactor position information to decode errors that carry context.
    #[must_use]
    pub fn with_position(self, template_id: i64, cursor: i32) -> Self {
        match self {
            Self::UnexpectedEndOfStream(ctx) => {
                Self::UnexpectedEndOfStream(ctx.with_position(template_id, cursor))
            }
            Self::ProtocolViolation { reason, context } => Self::ProtocolViolation {
                reason,
                context: context.with_position(template_id, cursor),
            },
            other => other,
        }
    }
}

/// Errors raised while turning template XML into an executable catalog, or
/// while reloading a catalog from its binary form.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// The XML is not well-formed or uses an unknown element.
    #[error("malformed template xml: {0}")]
    MalformedXml(String),

    /// A field element is missing a required attribute.
    #[error("field '{name}' is missing attribute '{attribute}'")]
    MissingAttribute {
        /// Field name, or element name when the field is anonymous.
        name: String,
        /// The absent attribute.
        attribute: String,
    },

    /// A reference names a field that was never defined.
    #[error("undefined field reference: {name}")]
    UndefinedField {
        /// The unresolved name.
        name: String,
    },

    /// Two dictionaries resolve to the same name.
    #[error("dictionary name collision: {name}")]
    DictionaryCollision {
        /// The colliding dictionary name.
        name: String,
    },

    /// A decimal field lacks an exponent or mantissa subfield.
    #[error("decimal field '{name}' must declare both exponent and mantissa")]
    DecimalMissingSubfield {
        /// The decimal field name.
        name: String,
    },

    /// A mandatory default-operator field has no initial value.
    #[error("mandatory default field '{name}' requires an initial value")]
    DefaultWithoutValue {
        /// The field name.
        name: String,
    },

    /// An operator was applied to a type that does not support it.
    #[error("operator '{operator}' is not valid for field '{name}'")]
    InvalidOperator {
        /// The operator element name.
        operator: String,
        /// The field name.
        name: String,
    },

    /// Two templates share the same id.
    #[error("duplicate template id: {id}")]
    DuplicateTemplateId {
        /// The colliding template id.
        id: u32,
    },

    /// The catalog binary is truncated or has a bad magic/version.
    #[error("invalid catalog binary: {0}")]
    InvalidBinary(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display() {
        let ctx = DecodeContext::at_offset(42).with_position(3, 7).with_field(58);
        assert_eq!(ctx.to_string(), "template=3 cursor=7 field=58 byte=42");
    }

    #[test]
    fn test_violation_display() {
        let err = FastError::violation("stop bit missing after 10 bytes", 100);
        assert!(err.to_string().contains("stop bit missing"));
        assert!(err.to_string().contains("byte=100"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(FastError::violation("x", 0).is_fatal());
        assert!(FastError::UnexpectedEndOfStream(DecodeContext::at_offset(0)).is_fatal());
        assert!(!FastError::Shutdown.is_fatal());
        assert!(!FastError::WouldBlock.is_fatal());
        assert!(!FastError::RingOverflow {
            needed: 4,
            available: 0
        }
        .is_fatal());
    }

    #[test]
    fn test_catalog_error_conversion() {
        let err: FastError = CatalogError::DuplicateTemplateId { id: 2 }.into();
        assert!(matches!(err, FastError::Catalog(_)));
    }

    #[test]
    fn test_with_position_preserves_other_kinds() {
        let err = FastError::Shutdown.with_position(1, 2);
        assert_eq!(err, FastError::Shutdown);
    }
}
