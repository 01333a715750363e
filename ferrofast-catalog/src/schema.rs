/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Parsed template model.
//!
//! This is the XML-side view of a template set, produced by the loader's
//! event pass and consumed by the compile pass that emits the token script.
//! It deliberately mirrors the FAST template schema: templates own fields,
//! fields carry an operator, decimals split into exponent/mantissa operator
//! pairs, and sequences nest a length field plus a repeating body.

use serde::{Deserialize, Serialize};

use ferrofast_token::OpTag;

/// Dictionary scope a template's stateful operators resolve against.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DictionaryScope {
    /// One dictionary shared by every template in the stream.
    #[default]
    Global,
    /// A dictionary private to the template, reset on each message open.
    Template,
    /// A named dictionary shared by the templates naming it.
    Named(String),
}

/// Operator attached to one field or decimal subfield.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperatorDef {
    /// The compression rule.
    pub op: OpTag,
    /// Declared initial value, verbatim from the `value` attribute.
    pub value: Option<String>,
}

impl OperatorDef {
    /// An operator without an initial value.
    #[must_use]
    pub const fn plain(op: OpTag) -> Self {
        Self { op, value: None }
    }
}

/// Field payload kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// Unsigned 32-bit integer.
    UInt32,
    /// Signed 32-bit integer.
    Int32,
    /// Unsigned 64-bit integer.
    UInt64,
    /// Signed 64-bit integer.
    Int64,
    /// ASCII string (stop-bit encoded).
    Ascii,
    /// UTF-8 string (length-prefixed).
    Unicode,
    /// Raw bytes (length-prefixed).
    ByteVector,
    /// Exponent/mantissa pair, each with its own operator.
    Decimal {
        /// Operator of the int32 exponent subfield.
        exponent: OperatorDef,
        /// Operator of the int64 mantissa subfield.
        mantissa: OperatorDef,
    },
    /// Repeating group introduced by a length field.
    Sequence {
        /// Name of the uint32 length field.
        length_name: String,
        /// Field id of the length field.
        length_id: u64,
        /// Operator of the length field.
        length_op: OperatorDef,
        /// The repeating body.
        body: Vec<FieldDef>,
    },
    /// Non-repeating nested group.
    Group {
        /// The group body.
        body: Vec<FieldDef>,
    },
}

/// One field of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name; also the default dictionary key.
    pub name: String,
    /// Numeric field id from the `id` attribute, zero when absent.
    pub id: u64,
    /// Payload kind.
    pub kind: FieldKind,
    /// True when `presence="optional"`.
    pub optional: bool,
    /// Operator for scalar kinds; unused for decimal/sequence/group.
    pub operator: OperatorDef,
}

/// One template definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateDef {
    /// Template name.
    pub name: String,
    /// Wire template id.
    pub id: u32,
    /// Dictionary scope for the template's stateful operators.
    pub dictionary: DictionaryScope,
    /// Fields in document order.
    pub fields: Vec<FieldDef>,
}

/// A parsed template file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSet {
    /// Templates in document order.
    pub templates: Vec<TemplateDef>,
}

impl TemplateSet {
    /// Number of templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// True when no templates were defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_def_plain() {
        let op = OperatorDef::plain(OpTag::Copy);
        assert_eq!(op.op, OpTag::Copy);
        assert!(op.value.is_none());
    }

    #[test]
    fn test_default_scope_is_global() {
        assert_eq!(DictionaryScope::default(), DictionaryScope::Global);
    }
}
