/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Packed 32-bit token encoding.
//!
//! Layout, from the least significant bit:
//!
//! ```text
//! | 31    | 30..26 | 25       | 24..21   | 20       | 19..0    |
//! | extra | type   | optional | operator | absent   | instance |
//! ```
//!
//! For `Group` tokens the operator field is reinterpreted as the flag bitset
//! in [`group_flags`], and the instance field holds the token distance between
//! the open and close tokens of the group. Decimal fields occupy two script
//! positions: a [`TypeTag::DecimalExponent`] token followed by a
//! [`TypeTag::DecimalMantissa`] token, each with its own operator.

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest value the 20-bit instance field can hold.
pub const MAX_INSTANCE: u32 = 0x000F_FFFF;

const INSTANCE_MASK: u32 = MAX_INSTANCE;
const ABSENT_SHIFT: u32 = 20;
const OPERATOR_SHIFT: u32 = 21;
const OPERATOR_MASK: u32 = 0xF;
const OPTIONAL_SHIFT: u32 = 25;
const TYPE_SHIFT: u32 = 26;
const TYPE_MASK: u32 = 0x1F;

/// Flag bits carried in the operator field of `Group` tokens.
pub mod group_flags {
    /// Set on the token closing a group; clear on the opening token.
    pub const CLOSE: u32 = 1;
    /// The group reads/writes its own presence map.
    pub const PMAP: u32 = 2;
    /// The group is a template body.
    pub const TEMPLATE: u32 = 4;
    /// The group is the repeating body of a sequence.
    pub const SEQUENCE: u32 = 8;
}

/// Field type tag, 5 bits of the packed token.
///
/// Signedness is part of the tag: signed and unsigned integers use different
/// wire encodings (bit 6 of the first stop-bit byte is a sign bit only for
/// signed reads).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeTag {
    /// Signed 32-bit integer, one slab slot.
    Int32 = 0,
    /// Unsigned 32-bit integer, one slab slot.
    UInt32 = 1,
    /// Signed 64-bit integer, two slab slots MSB first.
    Int64 = 2,
    /// Unsigned 64-bit integer, two slab slots MSB first.
    UInt64 = 3,
    /// Decimal exponent subfield; int32 semantics.
    DecimalExponent = 4,
    /// Decimal mantissa subfield; int64 semantics.
    DecimalMantissa = 5,
    /// Stop-bit encoded 7-bit text.
    AsciiText = 6,
    /// Length-prefixed UTF-8 text.
    UnicodeText = 7,
    /// Length-prefixed raw bytes.
    ByteVector = 8,
    /// Group open/close marker; no slab slots.
    Group = 9,
    /// Sequence length field; uint32 semantics.
    GroupLength = 10,
    /// Dictionary selection marker; no slab slots.
    Dictionary = 11,
}

impl TypeTag {
    /// Slab slots one value of this type occupies.
    ///
    /// Variable-length types occupy two slots: the blob meta value and the
    /// byte length.
    #[must_use]
    pub const fn slot_count(self) -> usize {
        match self {
            Self::Int32 | Self::UInt32 | Self::DecimalExponent | Self::GroupLength => 1,
            Self::Int64 | Self::UInt64 | Self::DecimalMantissa => 2,
            Self::AsciiText | Self::UnicodeText | Self::ByteVector => 2,
            Self::Group | Self::Dictionary => 0,
        }
    }

    /// True for the integer-class tags stored in the int32 dictionary.
    #[must_use]
    pub const fn is_int_class(self) -> bool {
        matches!(
            self,
            Self::Int32 | Self::UInt32 | Self::DecimalExponent | Self::GroupLength
        )
    }

    /// True for the integer-class tags stored in the int64 dictionary.
    #[must_use]
    pub const fn is_long_class(self) -> bool {
        matches!(self, Self::Int64 | Self::UInt64 | Self::DecimalMantissa)
    }

    /// True for the variable-length tags backed by the byte heap.
    #[must_use]
    pub const fn is_bytes_class(self) -> bool {
        matches!(self, Self::AsciiText | Self::UnicodeText | Self::ByteVector)
    }

    /// True when the wire integer read sign-extends.
    #[must_use]
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Int32 | Self::Int64 | Self::DecimalExponent | Self::DecimalMantissa
        )
    }
}

/// Field operator tag, 4 bits of the packed token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpTag {
    /// Value is always present in the stream.
    #[default]
    None = 0,
    /// Value is never in the stream; the declared constant is used.
    Constant = 1,
    /// One PMap bit selects the declared default or a fresh value.
    Default = 2,
    /// One PMap bit selects the previous dictionary value or a fresh one.
    Copy = 3,
    /// One PMap bit selects previous-plus-one or a fresh value.
    Increment = 4,
    /// The stream carries a delta against the dictionary value.
    Delta = 5,
    /// One PMap bit selects reuse or a tail replacement (strings only).
    Tail = 6,
}

impl OpTag {
    /// Whether this operator consumes a presence-map bit.
    ///
    /// This table is fixed by FAST 1.1 and must match exactly between the
    /// encoder and the decoder: a single disagreement desynchronizes the
    /// stream without any detectable error until the next message.
    #[must_use]
    pub const fn consumes_pmap_bit(self, optional: bool) -> bool {
        match self {
            Self::None | Self::Delta => false,
            Self::Constant => optional,
            Self::Default | Self::Copy | Self::Increment | Self::Tail => true,
        }
    }

    /// True for the operators that read or write dictionary state.
    #[must_use]
    pub const fn uses_dictionary(self) -> bool {
        matches!(self, Self::Copy | Self::Increment | Self::Delta | Self::Tail)
    }
}

/// The packed wire-of-catalog form of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PackedToken(pub u32);

impl PackedToken {
    /// Instance field without unpacking the rest.
    #[inline]
    #[must_use]
    pub const fn instance(self) -> u32 {
        self.0 & INSTANCE_MASK
    }

    /// Raw operator bits; for group tokens this is the flag bitset.
    #[inline]
    #[must_use]
    pub const fn operator_bits(self) -> u32 {
        (self.0 >> OPERATOR_SHIFT) & OPERATOR_MASK
    }

    /// Raw type bits.
    #[inline]
    #[must_use]
    pub const fn type_bits(self) -> u32 {
        (self.0 >> TYPE_SHIFT) & TYPE_MASK
    }

    /// Optional flag.
    #[inline]
    #[must_use]
    pub const fn is_optional(self) -> bool {
        (self.0 >> OPTIONAL_SHIFT) & 1 != 0
    }

    /// Dispatch table index: `(type << 4 | operator) << 1 | optional`.
    #[inline]
    #[must_use]
    pub const fn dispatch_index(self) -> usize {
        ((self.type_bits() << 4 | self.operator_bits()) << 1 | (self.0 >> OPTIONAL_SHIFT) & 1)
            as usize
    }

    /// True when this packed token has the `Group` type.
    #[inline]
    #[must_use]
    pub const fn is_group(self) -> bool {
        self.type_bits() == TypeTag::Group as u32
    }

    /// True for a group token with the given flag set.
    #[inline]
    #[must_use]
    pub const fn has_group_flag(self, flag: u32) -> bool {
        self.is_group() && self.operator_bits() & flag != 0
    }
}

impl From<i32> for PackedToken {
    fn from(raw: i32) -> Self {
        Self(raw as u32)
    }
}

impl From<PackedToken> for i32 {
    fn from(token: PackedToken) -> Self {
        token.0 as i32
    }
}

/// Unpacked token, the API-boundary view of one script entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    /// Field type.
    pub kind: TypeTag,
    /// Field operator, or group flags for `Group` tokens.
    pub op: u32,
    /// Optional field flag.
    pub optional: bool,
    /// Absent-override flag (a per-field absent sentinel was declared).
    pub absent_override: bool,
    /// Dictionary slot, or open/close distance for group tokens.
    pub instance: u32,
}

impl Token {
    /// Creates a value-field token.
    #[must_use]
    pub const fn field(kind: TypeTag, op: OpTag, optional: bool, instance: u32) -> Self {
        Self {
            kind,
            op: op as u32,
            optional,
            absent_override: false,
            instance,
        }
    }

    /// Creates a group token with the given flag bitset and distance.
    #[must_use]
    pub const fn group(flags: u32, optional: bool, distance: u32) -> Self {
        Self {
            kind: TypeTag::Group,
            op: flags,
            optional,
            absent_override: false,
            instance: distance,
        }
    }

    /// The operator as a tag. Meaningless for group tokens.
    #[must_use]
    pub fn op_tag(&self) -> OpTag {
        OpTag::from_u32(self.op).unwrap_or(OpTag::None)
    }

    /// Packs into the 32-bit catalog form.
    #[must_use]
    pub const fn pack(&self) -> PackedToken {
        PackedToken(
            (self.instance & INSTANCE_MASK)
                | (self.absent_override as u32) << ABSENT_SHIFT
                | (self.op & OPERATOR_MASK) << OPERATOR_SHIFT
                | (self.optional as u32) << OPTIONAL_SHIFT
                | (self.kind as u32 & TYPE_MASK) << TYPE_SHIFT,
        )
    }

    /// Unpacks the 32-bit catalog form.
    ///
    /// Returns `None` when the type bits do not name a known [`TypeTag`].
    #[must_use]
    pub fn unpack(packed: PackedToken) -> Option<Self> {
        let kind = TypeTag::from_u32(packed.type_bits())?;
        Some(Self {
            kind,
            op: packed.operator_bits(),
            optional: packed.is_optional(),
            absent_override: (packed.0 >> ABSENT_SHIFT) & 1 != 0,
            instance: packed.instance(),
        })
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == TypeTag::Group {
            let mut flags = String::new();
            for (bit, name) in [
                (group_flags::CLOSE, "Close"),
                (group_flags::PMAP, "PMap"),
                (group_flags::TEMPLATE, "Templ"),
                (group_flags::SEQUENCE, "Seq"),
            ] {
                if self.op & bit != 0 {
                    if !flags.is_empty() {
                        flags.push('|');
                    }
                    flags.push_str(name);
                }
            }
            if flags.is_empty() {
                flags.push_str("Open");
            }
            return write!(f, "Group:{}:{}", flags, self.instance);
        }
        write!(
            f,
            "{:?}:{:?}{}:{}",
            self.kind,
            self.op_tag(),
            if self.optional { ":Opt" } else { "" },
            self.instance
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_round_trip() {
        let token = Token::field(TypeTag::DecimalMantissa, OpTag::Delta, true, 0x000A_BCDE);
        let unpacked = Token::unpack(token.pack()).unwrap();
        assert_eq!(token, unpacked);
    }

    #[test]
    fn test_group_token_flags() {
        let open = Token::group(group_flags::TEMPLATE | group_flags::PMAP, false, 53);
        let packed = open.pack();
        assert!(packed.is_group());
        assert!(packed.has_group_flag(group_flags::PMAP));
        assert!(!packed.has_group_flag(group_flags::CLOSE));
        assert_eq!(packed.instance(), 53);
    }

    #[test]
    fn test_instance_field_is_masked() {
        let token = Token::field(TypeTag::Int32, OpTag::Copy, false, MAX_INSTANCE);
        assert_eq!(Token::unpack(token.pack()).unwrap().instance, MAX_INSTANCE);
    }

    #[test]
    fn test_dispatch_index_distinguishes_optionality() {
        let mandatory = Token::field(TypeTag::Int32, OpTag::Copy, false, 0).pack();
        let optional = Token::field(TypeTag::Int32, OpTag::Copy, true, 0).pack();
        assert_eq!(optional.dispatch_index(), mandatory.dispatch_index() + 1);
    }

    #[test]
    fn test_pmap_bit_table() {
        assert!(!OpTag::None.consumes_pmap_bit(false));
        assert!(!OpTag::None.consumes_pmap_bit(true));
        assert!(!OpTag::Constant.consumes_pmap_bit(false));
        assert!(OpTag::Constant.consumes_pmap_bit(true));
        assert!(OpTag::Default.consumes_pmap_bit(false));
        assert!(OpTag::Copy.consumes_pmap_bit(true));
        assert!(OpTag::Increment.consumes_pmap_bit(false));
        assert!(!OpTag::Delta.consumes_pmap_bit(false));
        assert!(!OpTag::Delta.consumes_pmap_bit(true));
        assert!(OpTag::Tail.consumes_pmap_bit(true));
    }

    #[test]
    fn test_slot_counts() {
        assert_eq!(TypeTag::Int32.slot_count(), 1);
        assert_eq!(TypeTag::UInt64.slot_count(), 2);
        assert_eq!(TypeTag::DecimalExponent.slot_count(), 1);
        assert_eq!(TypeTag::DecimalMantissa.slot_count(), 2);
        assert_eq!(TypeTag::AsciiText.slot_count(), 2);
        assert_eq!(TypeTag::Group.slot_count(), 0);
    }

    #[test]
    fn test_display() {
        let token = Token::field(TypeTag::UInt32, OpTag::Increment, false, 3);
        assert_eq!(token.to_string(), "UInt32:Increment:3");
        let close = Token::group(group_flags::CLOSE | group_flags::SEQUENCE, false, 9);
        assert_eq!(close.to_string(), "Group:Close|Seq:9");
    }
}
