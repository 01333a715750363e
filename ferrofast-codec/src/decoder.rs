/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Decode-side operator dispatch.
//!
//! One function per `{type class, operator, optionality}` combination,
//! collected into a dense table indexed by the packed token's dispatch index.
//! Each function reads wire bytes through the primitive reader, consults or
//! updates its dictionary slot, and writes the field's slots into the ring
//! producer.
//!
//! Null wire encoding follows FAST: an optional integer's absent marker is
//! zero and concrete non-negative values shift up by one on the wire;
//! negative signed values pass through. An optional string's null marker is
//! a lone `0x80` byte.

use ferrofast_catalog::{Catalog, DictionaryFactory, ResetEntry, ResetKind};
use ferrofast_core::{EngineConfig, FastError, Result};
use ferrofast_primitive::{ByteSource, StopBitReader, TextStatus};
use ferrofast_ring::RingProducer;
use ferrofast_token::{OpTag, Token, TypeTag};

/// Lifecycle of one dictionary slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Never written; the declared initial value (if any) applies.
    Undefined,
    /// Holds a concrete value.
    Assigned,
    /// Known to be null.
    Null,
}

/// Decode-side dictionaries and scratch state.
#[derive(Debug)]
pub struct FieldDecoder {
    int_dict: Vec<i32>,
    int_state: Vec<SlotState>,
    long_dict: Vec<i64>,
    long_state: Vec<SlotState>,
    heap: crate::heap::LocalHeap,
    bytes_state: Vec<SlotState>,
    factory: DictionaryFactory,
    constants: Vec<Vec<u8>>,
    absent_int: i32,
    absent_long: i64,
    max_text_len: usize,
    max_byte_vector_len: usize,
    text_buf: Vec<u8>,
    diff_buf: Vec<u8>,
    last_int: Option<i64>,
    last_was_null: bool,
}

impl FieldDecoder {
    /// Builds decoder state sized and seeded from the catalog.
    #[must_use]
    pub fn new(catalog: &Catalog, config: &EngineConfig) -> Self {
        let factory = DictionaryFactory::new(catalog);
        let (ints, longs, bytes) = factory.sizes();
        let mut decoder = Self {
            int_dict: vec![0; ints],
            int_state: vec![SlotState::Undefined; ints],
            long_dict: vec![0; longs],
            long_state: vec![SlotState::Undefined; longs],
            heap: crate::heap::LocalHeap::new(bytes, bytes.max(1) * 32),
            bytes_state: vec![SlotState::Undefined; bytes],
            factory,
            constants: catalog.constants().to_vec(),
            absent_int: config.absent_int,
            absent_long: config.absent_long,
            max_text_len: catalog.max_text_len() as usize,
            max_byte_vector_len: catalog.max_byte_vector_len() as usize,
            text_buf: Vec::new(),
            diff_buf: Vec::new(),
            last_int: None,
            last_was_null: false,
        };
        decoder.reset();
        decoder
    }

    /// Re-seeds every dictionary slot from its declared initial value.
    pub fn reset(&mut self) {
        for slot in 0..self.int_dict.len() {
            self.reset_int(slot);
        }
        for slot in 0..self.long_dict.len() {
            self.reset_long(slot);
        }
        for slot in 0..self.bytes_state.len() {
            self.reset_bytes(slot);
        }
    }

    fn reset_int(&mut self, slot: usize) {
        if self.factory.int_has_initial(slot as u32) {
            self.int_dict[slot] = self.factory.int_initial(slot as u32);
            self.int_state[slot] = SlotState::Assigned;
        } else {
            self.int_dict[slot] = 0;
            self.int_state[slot] = SlotState::Undefined;
        }
    }

    fn reset_long(&mut self, slot: usize) {
        if self.factory.long_has_initial(slot as u32) {
            self.long_dict[slot] = self.factory.long_initial(slot as u32);
            self.long_state[slot] = SlotState::Assigned;
        } else {
            self.long_dict[slot] = 0;
            self.long_state[slot] = SlotState::Undefined;
        }
    }

    fn reset_bytes(&mut self, slot: usize) {
        match self.factory.bytes_initial(slot as u32) {
            Some(const_index) => {
                self.heap.set(slot, &self.constants[const_index as usize]);
                self.bytes_state[slot] = SlotState::Assigned;
            }
            None => {
                self.heap.clear_slot(slot);
                self.bytes_state[slot] = SlotState::Undefined;
            }
        }
    }

    /// Applies one reset-group entry (message-open dictionary reset).
    pub fn apply_reset(&mut self, entry: &ResetEntry) {
        match entry.kind {
            ResetKind::Int => self.reset_int(entry.slot as usize),
            ResetKind::Long => self.reset_long(entry.slot as usize),
            ResetKind::Bytes => self.reset_bytes(entry.slot as usize),
        }
    }

    /// Value produced by the most recent integer-class dispatch.
    #[must_use]
    pub fn last_int(&self) -> Option<i64> {
        self.last_int
    }

    /// True when the most recent dispatch produced a null.
    #[must_use]
    pub fn take_last_null(&mut self) -> bool {
        std::mem::take(&mut self.last_was_null)
    }

    /// Absent sentinel written for null int64 values.
    #[must_use]
    pub const fn absent_long(&self) -> i64 {
        self.absent_long
    }

    // Previous-value access. `Undefined` slots read as their type's zero for
    // mandatory operators and as null for optional ones; the bool is the
    // null-ness seen by optional operators.
    fn int_prev(&self, slot: usize) -> (i64, bool) {
        match self.int_state[slot] {
            SlotState::Assigned => (i64::from(self.int_dict[slot]), false),
            SlotState::Null => (0, true),
            SlotState::Undefined => (0, true),
        }
    }

    fn long_prev(&self, slot: usize) -> (i64, bool) {
        match self.long_state[slot] {
            SlotState::Assigned => (self.long_dict[slot], false),
            SlotState::Null => (0, true),
            SlotState::Undefined => (0, true),
        }
    }

    fn int_store(&mut self, slot: usize, value: i64) {
        self.int_dict[slot] = value as i32;
        self.int_state[slot] = SlotState::Assigned;
    }

    fn int_store_null(&mut self, slot: usize) {
        self.int_dict[slot] = 0;
        self.int_state[slot] = SlotState::Null;
    }

    fn long_store(&mut self, slot: usize, value: i64) {
        self.long_dict[slot] = value;
        self.long_state[slot] = SlotState::Assigned;
    }

    fn long_store_null(&mut self, slot: usize) {
        self.long_dict[slot] = 0;
        self.long_state[slot] = SlotState::Null;
    }

    fn emit_int(&mut self, producer: &mut RingProducer, value: Option<i64>) {
        match value {
            Some(v) => producer.write_int(v as i32),
            None => producer.write_int(self.absent_int),
        }
        self.last_int = value;
        self.last_was_null = value.is_none();
    }

    fn emit_long(&mut self, producer: &mut RingProducer, value: Option<i64>) {
        match value {
            Some(v) => producer.write_long(v),
            None => producer.write_long(self.absent_long),
        }
        self.last_int = value;
        self.last_was_null = value.is_none();
    }

    fn max_len(&self, kind: TypeTag) -> usize {
        if kind == TypeTag::ByteVector {
            self.max_byte_vector_len
        } else {
            self.max_text_len
        }
    }

    fn guard_len<S: ByteSource>(
        &self,
        kind: TypeTag,
        len: usize,
        reader: &StopBitReader<S>,
    ) -> Result<()> {
        if len > self.max_len(kind) {
            return Err(FastError::violation(
                format!("variable-length field of {len} bytes exceeds the configured maximum"),
                reader.total_consumed(),
            ));
        }
        Ok(())
    }

    fn const_bytes(&self, slot: usize, offset: u64) -> Result<u32> {
        self.factory.bytes_initial(slot as u32).ok_or_else(|| {
            FastError::violation("constant field without a declared value", offset)
        })
    }

    /// Makes a string slot usable as a delta/tail base. Slots with declared
    /// initial values are already materialized by reset; the rest start
    /// empty.
    fn materialize_bytes(&mut self, slot: usize) {
        if self.bytes_state[slot] != SlotState::Assigned {
            self.heap.clear_slot(slot);
            self.bytes_state[slot] = SlotState::Assigned;
        }
    }
}

// Wire-level helpers shared by the int32 and int64 classes.

fn read_mandatory<S: ByteSource>(
    kind: TypeTag,
    reader: &mut StopBitReader<S>,
) -> Result<i64> {
    if kind.is_signed() {
        reader.read_i64()
    } else {
        reader.read_u64().map(|v| v as i64)
    }
}

fn read_optional<S: ByteSource>(
    kind: TypeTag,
    reader: &mut StopBitReader<S>,
) -> Result<Option<i64>> {
    if kind.is_signed() {
        let raw = reader.read_i64()?;
        Ok(match raw {
            0 => None,
            v if v > 0 => Some(v - 1),
            v => Some(v),
        })
    } else {
        let raw = reader.read_u64()?;
        Ok(match raw {
            0 => None,
            v => Some((v - 1) as i64),
        })
    }
}

type DecodeFn<S> =
    fn(&mut FieldDecoder, Token, &mut StopBitReader<S>, &mut RingProducer) -> Result<()>;

/// Dense decode dispatch table, built once per decoder.
pub struct DecodeTable<S: ByteSource> {
    table: Vec<DecodeFn<S>>,
}

impl<S: ByteSource> DecodeTable<S> {
    /// Builds the full `{type, operator, optionality}` matrix.
    #[must_use]
    pub fn new() -> Self {
        let mut table: Vec<DecodeFn<S>> = vec![d_unsupported::<S>; 512];
        let int_tags = [
            TypeTag::Int32,
            TypeTag::UInt32,
            TypeTag::DecimalExponent,
            TypeTag::GroupLength,
        ];
        let long_tags = [TypeTag::Int64, TypeTag::UInt64, TypeTag::DecimalMantissa];
        let vec_tags = [TypeTag::UnicodeText, TypeTag::ByteVector];
        for kind in int_tags {
            set(&mut table, kind, OpTag::None, d_int_none, d_int_none_opt);
            set(&mut table, kind, OpTag::Constant, d_int_constant, d_int_constant_opt);
            set(&mut table, kind, OpTag::Default, d_int_default, d_int_default_opt);
            set(&mut table, kind, OpTag::Copy, d_int_copy, d_int_copy_opt);
            set(&mut table, kind, OpTag::Increment, d_int_increment, d_int_increment_opt);
            set(&mut table, kind, OpTag::Delta, d_int_delta, d_int_delta_opt);
        }
        for kind in long_tags {
            set(&mut table, kind, OpTag::None, d_long_none, d_long_none_opt);
            set(&mut table, kind, OpTag::Constant, d_long_constant, d_long_constant_opt);
            set(&mut table, kind, OpTag::Default, d_long_default, d_long_default_opt);
            set(&mut table, kind, OpTag::Copy, d_long_copy, d_long_copy_opt);
            set(&mut table, kind, OpTag::Increment, d_long_increment, d_long_increment_opt);
            set(&mut table, kind, OpTag::Delta, d_long_delta, d_long_delta_opt);
        }
        set(&mut table, TypeTag::AsciiText, OpTag::None, d_ascii_none, d_ascii_none_opt);
        set(&mut table, TypeTag::AsciiText, OpTag::Constant, d_bytes_constant, d_bytes_constant_opt);
        set(&mut table, TypeTag::AsciiText, OpTag::Default, d_ascii_default, d_ascii_default_opt);
        set(&mut table, TypeTag::AsciiText, OpTag::Copy, d_ascii_copy, d_ascii_copy_opt);
        set(&mut table, TypeTag::AsciiText, OpTag::Delta, d_ascii_delta, d_ascii_delta_opt);
        set(&mut table, TypeTag::AsciiText, OpTag::Tail, d_ascii_tail, d_ascii_tail_opt);
        for kind in vec_tags {
            set(&mut table, kind, OpTag::None, d_vec_none, d_vec_none_opt);
            set(&mut table, kind, OpTag::Constant, d_bytes_constant, d_bytes_constant_opt);
            set(&mut table, kind, OpTag::Default, d_vec_default, d_vec_default_opt);
            set(&mut table, kind, OpTag::Copy, d_vec_copy, d_vec_copy_opt);
            set(&mut table, kind, OpTag::Delta, d_vec_delta, d_vec_delta_opt);
            set(&mut table, kind, OpTag::Tail, d_vec_tail, d_vec_tail_opt);
        }
        Self { table }
    }

    /// Runs the dispatch function for one token.
    ///
    /// # Errors
    /// Whatever the operator function reports.
    pub fn dispatch(
        &self,
        decoder: &mut FieldDecoder,
        token: Token,
        reader: &mut StopBitReader<S>,
        producer: &mut RingProducer,
    ) -> Result<()> {
        (self.table[token.pack().dispatch_index()])(decoder, token, reader, producer)
    }
}

impl<S: ByteSource> Default for DecodeTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn set<S: ByteSource>(
    table: &mut [DecodeFn<S>],
    kind: TypeTag,
    op: OpTag,
    mandatory: DecodeFn<S>,
    optional: DecodeFn<S>,
) {
    table[Token::field(kind, op, false, 0).pack().dispatch_index()] = mandatory;
    table[Token::field(kind, op, true, 0).pack().dispatch_index()] = optional;
}

fn d_unsupported<S: ByteSource>(
    _this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    _producer: &mut RingProducer,
) -> Result<()> {
    Err(FastError::violation(
        format!("no decoder for token {token}"),
        reader.total_consumed(),
    ))
}

// --- int32 class ---------------------------------------------------------

fn d_int_none<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let value = read_mandatory(token.kind, reader)?;
    this.int_store(token.instance as usize, value);
    this.emit_int(producer, Some(value));
    Ok(())
}

fn d_int_none_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = read_optional(token.kind, reader)?;
    match value {
        Some(v) => this.int_store(slot, v),
        None => this.int_store_null(slot),
    }
    this.emit_int(producer, value);
    Ok(())
}

fn d_int_constant<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    _reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let value = i64::from(this.factory.int_initial(token.instance));
    this.emit_int(producer, Some(value));
    Ok(())
}

fn d_int_constant_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let value = if reader.pop_pmap_bit()? == 1 {
        Some(i64::from(this.factory.int_initial(token.instance)))
    } else {
        None
    };
    this.emit_int(producer, value);
    Ok(())
}

fn d_int_default<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let value = if reader.pop_pmap_bit()? == 0 {
        i64::from(this.factory.int_initial(token.instance))
    } else {
        read_mandatory(token.kind, reader)?
    };
    this.emit_int(producer, Some(value));
    Ok(())
}

fn d_int_default_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let value = if reader.pop_pmap_bit()? == 0 {
        if this.factory.int_has_initial(token.instance) {
            Some(i64::from(this.factory.int_initial(token.instance)))
        } else {
            None
        }
    } else {
        read_optional(token.kind, reader)?
    };
    this.emit_int(producer, value);
    Ok(())
}

fn d_int_copy<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = if reader.pop_pmap_bit()? == 0 {
        this.int_prev(slot).0
    } else {
        let v = read_mandatory(token.kind, reader)?;
        this.int_store(slot, v);
        v
    };
    this.emit_int(producer, Some(value));
    Ok(())
}

fn d_int_copy_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = if reader.pop_pmap_bit()? == 0 {
        let (v, null) = this.int_prev(slot);
        if null {
            None
        } else {
            Some(v)
        }
    } else {
        let value = read_optional(token.kind, reader)?;
        match value {
            Some(v) => this.int_store(slot, v),
            None => this.int_store_null(slot),
        }
        value
    };
    this.emit_int(producer, value);
    Ok(())
}

fn d_int_increment<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = if reader.pop_pmap_bit()? == 0 {
        this.int_prev(slot).0.wrapping_add(1)
    } else {
        read_mandatory(token.kind, reader)?
    };
    this.int_store(slot, value);
    this.emit_int(producer, Some(value));
    Ok(())
}

fn d_int_increment_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = if reader.pop_pmap_bit()? == 0 {
        let (v, null) = this.int_prev(slot);
        if null {
            None
        } else {
            let next = v.wrapping_add(1);
            this.int_store(slot, next);
            Some(next)
        }
    } else {
        let value = read_optional(token.kind, reader)?;
        match value {
            Some(v) => this.int_store(slot, v),
            None => this.int_store_null(slot),
        }
        value
    };
    this.emit_int(producer, value);
    Ok(())
}

fn d_int_delta<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let delta = reader.read_i64()?;
    let value = this.int_prev(slot).0.wrapping_add(delta);
    this.int_store(slot, value);
    this.emit_int(producer, Some(value));
    Ok(())
}

fn d_int_delta_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let raw = reader.read_i64()?;
    let value = if raw == 0 {
        this.int_store_null(slot);
        None
    } else {
        let delta = if raw > 0 { raw - 1 } else { raw };
        let value = this.int_prev(slot).0.wrapping_add(delta);
        this.int_store(slot, value);
        Some(value)
    };
    this.emit_int(producer, value);
    Ok(())
}

// --- int64 class ---------------------------------------------------------

fn d_long_none<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let value = read_mandatory(token.kind, reader)?;
    this.long_store(token.instance as usize, value);
    this.emit_long(producer, Some(value));
    Ok(())
}

fn d_long_none_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = read_optional(token.kind, reader)?;
    match value {
        Some(v) => this.long_store(slot, v),
        None => this.long_store_null(slot),
    }
    this.emit_long(producer, value);
    Ok(())
}

fn d_long_constant<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    _reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let value = this.factory.long_initial(token.instance);
    this.emit_long(producer, Some(value));
    Ok(())
}

fn d_long_constant_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let value = if reader.pop_pmap_bit()? == 1 {
        Some(this.factory.long_initial(token.instance))
    } else {
        None
    };
    this.emit_long(producer, value);
    Ok(())
}

fn d_long_default<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let value = if reader.pop_pmap_bit()? == 0 {
        this.factory.long_initial(token.instance)
    } else {
        read_mandatory(token.kind, reader)?
    };
    this.emit_long(producer, Some(value));
    Ok(())
}

fn d_long_default_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let value = if reader.pop_pmap_bit()? == 0 {
        if this.factory.long_has_initial(token.instance) {
            Some(this.factory.long_initial(token.instance))
        } else {
            None
        }
    } else {
        read_optional(token.kind, reader)?
    };
    this.emit_long(producer, value);
    Ok(())
}

fn d_long_copy<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = if reader.pop_pmap_bit()? == 0 {
        this.long_prev(slot).0
    } else {
        let v = read_mandatory(token.kind, reader)?;
        this.long_store(slot, v);
        v
    };
    this.emit_long(producer, Some(value));
    Ok(())
}

fn d_long_copy_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = if reader.pop_pmap_bit()? == 0 {
        let (v, null) = this.long_prev(slot);
        if null {
            None
        } else {
            Some(v)
        }
    } else {
        let value = read_optional(token.kind, reader)?;
        match value {
            Some(v) => this.long_store(slot, v),
            None => this.long_store_null(slot),
        }
        value
    };
    this.emit_long(producer, value);
    Ok(())
}

fn d_long_increment<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = if reader.pop_pmap_bit()? == 0 {
        this.long_prev(slot).0.wrapping_add(1)
    } else {
        read_mandatory(token.kind, reader)?
    };
    this.long_store(slot, value);
    this.emit_long(producer, Some(value));
    Ok(())
}

fn d_long_increment_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = if reader.pop_pmap_bit()? == 0 {
        let (v, null) = this.long_prev(slot);
        if null {
            None
        } else {
            let next = v.wrapping_add(1);
            this.long_store(slot, next);
            Some(next)
        }
    } else {
        let value = read_optional(token.kind, reader)?;
        match value {
            Some(v) => this.long_store(slot, v),
            None => this.long_store_null(slot),
        }
        value
    };
    this.emit_long(producer, value);
    Ok(())
}

fn d_long_delta<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let delta = reader.read_i64()?;
    let value = this.long_prev(slot).0.wrapping_add(delta);
    this.long_store(slot, value);
    this.emit_long(producer, Some(value));
    Ok(())
}

fn d_long_delta_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let raw = reader.read_i64()?;
    let value = if raw == 0 {
        this.long_store_null(slot);
        None
    } else {
        let delta = if raw > 0 { raw - 1 } else { raw };
        let value = this.long_prev(slot).0.wrapping_add(delta);
        this.long_store(slot, value);
        Some(value)
    };
    this.emit_long(producer, value);
    Ok(())
}

// --- ascii ---------------------------------------------------------------

fn d_ascii_none<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    reader.read_ascii(false, &mut this.text_buf)?;
    this.guard_len(token.kind, this.text_buf.len(), reader)?;
    producer.write_var_field(&this.text_buf);
    Ok(())
}

fn d_ascii_none_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    match reader.read_ascii(true, &mut this.text_buf)? {
        TextStatus::Null => producer.write_null_var_field(ferrofast_core::ABSENT_LEN),
        TextStatus::Value => {
            this.guard_len(token.kind, this.text_buf.len(), reader)?;
            producer.write_var_field(&this.text_buf);
        }
    }
    Ok(())
}

fn d_bytes_constant<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    let const_index = this.const_bytes(slot, reader.total_consumed())?;
    let len = this.constants[const_index as usize].len() as i32;
    producer.write_const_field(const_index, len);
    Ok(())
}

fn d_bytes_constant_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    if reader.pop_pmap_bit()? == 1 {
        d_bytes_constant(this, token, reader, producer)
    } else {
        producer.write_null_var_field(ferrofast_core::ABSENT_LEN);
        Ok(())
    }
}

fn d_ascii_default<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    if reader.pop_pmap_bit()? == 0 {
        d_bytes_constant(this, token, reader, producer)
    } else {
        d_ascii_none(this, token, reader, producer)
    }
}

fn d_ascii_default_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    if reader.pop_pmap_bit()? == 0 {
        let slot = token.instance as usize;
        match this.factory.bytes_initial(slot as u32) {
            Some(const_index) => {
                let len = this.constants[const_index as usize].len() as i32;
                producer.write_const_field(const_index, len);
            }
            None => producer.write_null_var_field(ferrofast_core::ABSENT_LEN),
        }
        Ok(())
    } else {
        d_ascii_none_opt(this, token, reader, producer)
    }
}

fn d_ascii_copy<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    if reader.pop_pmap_bit()? == 0 {
        this.materialize_bytes(slot);
        producer.write_var_field(this.heap.get(slot));
    } else {
        reader.read_ascii(false, &mut this.text_buf)?;
        this.guard_len(token.kind, this.text_buf.len(), reader)?;
        this.heap.set(slot, &this.text_buf);
        this.bytes_state[slot] = SlotState::Assigned;
        producer.write_var_field(&this.text_buf);
    }
    Ok(())
}

fn d_ascii_copy_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    if reader.pop_pmap_bit()? == 0 {
        d_string_reuse(this, token, producer)?;
    } else {
        match reader.read_ascii(true, &mut this.text_buf)? {
            TextStatus::Null => {
                this.heap.clear_slot(slot);
                this.bytes_state[slot] = SlotState::Null;
                producer.write_null_var_field(ferrofast_core::ABSENT_LEN);
            }
            TextStatus::Value => {
                this.guard_len(token.kind, this.text_buf.len(), reader)?;
                this.heap.set(slot, &this.text_buf);
                this.bytes_state[slot] = SlotState::Assigned;
                producer.write_var_field(&this.text_buf);
            }
        }
    }
    Ok(())
}

fn apply_string_delta<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    sub: i64,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    this.materialize_bytes(slot);
    let base_len = this.heap.len_of(slot);
    if sub >= 0 {
        let keep = base_len.saturating_sub(sub as usize);
        let diff = std::mem::take(&mut this.diff_buf);
        this.heap.append_tail(slot, &diff, keep);
        this.diff_buf = diff;
    } else {
        let removed = (-sub - 1) as usize;
        let keep = base_len.saturating_sub(removed);
        let diff = std::mem::take(&mut this.diff_buf);
        this.heap.prepend_head(slot, &diff, keep);
        this.diff_buf = diff;
    }
    this.bytes_state[slot] = SlotState::Assigned;
    this.guard_len(token.kind, this.heap.len_of(slot), reader)?;
    producer.write_var_field(this.heap.get(slot));
    Ok(())
}

fn d_ascii_delta<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let sub = reader.read_i64()?;
    let mut diff = std::mem::take(&mut this.diff_buf);
    reader.read_ascii(false, &mut diff)?;
    this.diff_buf = diff;
    apply_string_delta(this, token, sub, reader, producer)
}

fn d_ascii_delta_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let raw = reader.read_i64()?;
    if raw == 0 {
        let slot = token.instance as usize;
        this.heap.clear_slot(slot);
        this.bytes_state[slot] = SlotState::Null;
        producer.write_null_var_field(ferrofast_core::ABSENT_LEN);
        return Ok(());
    }
    let sub = if raw > 0 { raw - 1 } else { raw };
    let mut diff = std::mem::take(&mut this.diff_buf);
    reader.read_ascii(false, &mut diff)?;
    this.diff_buf = diff;
    apply_string_delta(this, token, sub, reader, producer)
}

fn apply_string_tail<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    this.materialize_bytes(slot);
    let keep = this.heap.len_of(slot).saturating_sub(this.text_buf.len());
    let tail = std::mem::take(&mut this.text_buf);
    this.heap.append_tail(slot, &tail, keep);
    this.text_buf = tail;
    this.bytes_state[slot] = SlotState::Assigned;
    this.guard_len(token.kind, this.heap.len_of(slot), reader)?;
    producer.write_var_field(this.heap.get(slot));
    Ok(())
}

fn d_ascii_tail<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    if reader.pop_pmap_bit()? == 0 {
        return d_string_reuse(this, token, producer);
    }
    reader.read_ascii(false, &mut this.text_buf)?;
    apply_string_tail(this, token, reader, producer)
}

fn d_ascii_tail_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    if reader.pop_pmap_bit()? == 0 {
        return d_string_reuse(this, token, producer);
    }
    match reader.read_ascii(true, &mut this.text_buf)? {
        TextStatus::Null => {
            this.heap.clear_slot(slot);
            this.bytes_state[slot] = SlotState::Null;
            producer.write_null_var_field(ferrofast_core::ABSENT_LEN);
            Ok(())
        }
        TextStatus::Value => apply_string_tail(this, token, reader, producer),
    }
}

/// Shared "presence bit clear" path for copy-like string reuse. Slots with
/// declared initial values were materialized at reset; a truly untouched slot
/// reads as null when optional and as the empty string otherwise.
fn d_string_reuse(
    this: &mut FieldDecoder,
    token: Token,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.bytes_state[slot] {
        SlotState::Null => producer.write_null_var_field(ferrofast_core::ABSENT_LEN),
        SlotState::Assigned => producer.write_var_field(this.heap.get(slot)),
        SlotState::Undefined if token.optional => {
            producer.write_null_var_field(ferrofast_core::ABSENT_LEN);
        }
        SlotState::Undefined => producer.write_var_field(&[]),
    }
    Ok(())
}

// --- length-prefixed (utf-8 and byte vector) ------------------------------

fn read_vec_mandatory<S: ByteSource>(
    this: &mut FieldDecoder,
    kind: TypeTag,
    reader: &mut StopBitReader<S>,
) -> Result<()> {
    let len = reader.read_u64()? as usize;
    this.guard_len(kind, len, reader)?;
    let mut buf = std::mem::take(&mut this.text_buf);
    let result = reader.read_bytes_into(len, &mut buf);
    this.text_buf = buf;
    result
}

fn read_vec_optional<S: ByteSource>(
    this: &mut FieldDecoder,
    kind: TypeTag,
    reader: &mut StopBitReader<S>,
) -> Result<bool> {
    let raw = reader.read_u64()?;
    if raw == 0 {
        return Ok(false);
    }
    let len = (raw - 1) as usize;
    this.guard_len(kind, len, reader)?;
    let mut buf = std::mem::take(&mut this.text_buf);
    let result = reader.read_bytes_into(len, &mut buf);
    this.text_buf = buf;
    result.map(|()| true)
}

fn d_vec_none<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    read_vec_mandatory(this, token.kind, reader)?;
    producer.write_var_field(&this.text_buf);
    Ok(())
}

fn d_vec_none_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    if read_vec_optional(this, token.kind, reader)? {
        producer.write_var_field(&this.text_buf);
    } else {
        producer.write_null_var_field(ferrofast_core::ABSENT_LEN);
    }
    Ok(())
}

fn d_vec_default<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    if reader.pop_pmap_bit()? == 0 {
        d_bytes_constant(this, token, reader, producer)
    } else {
        d_vec_none(this, token, reader, producer)
    }
}

fn d_vec_default_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    if reader.pop_pmap_bit()? == 0 {
        let slot = token.instance as usize;
        match this.factory.bytes_initial(slot as u32) {
            Some(const_index) => {
                let len = this.constants[const_index as usize].len() as i32;
                producer.write_const_field(const_index, len);
            }
            None => producer.write_null_var_field(ferrofast_core::ABSENT_LEN),
        }
        Ok(())
    } else {
        d_vec_none_opt(this, token, reader, producer)
    }
}

fn d_vec_copy<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    if reader.pop_pmap_bit()? == 0 {
        this.materialize_bytes(slot);
        producer.write_var_field(this.heap.get(slot));
    } else {
        read_vec_mandatory(this, token.kind, reader)?;
        this.heap.set(slot, &this.text_buf);
        this.bytes_state[slot] = SlotState::Assigned;
        producer.write_var_field(&this.text_buf);
    }
    Ok(())
}

fn d_vec_copy_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    if reader.pop_pmap_bit()? == 0 {
        return d_string_reuse(this, token, producer);
    }
    if read_vec_optional(this, token.kind, reader)? {
        this.heap.set(slot, &this.text_buf);
        this.bytes_state[slot] = SlotState::Assigned;
        producer.write_var_field(&this.text_buf);
    } else {
        this.heap.clear_slot(slot);
        this.bytes_state[slot] = SlotState::Null;
        producer.write_null_var_field(ferrofast_core::ABSENT_LEN);
    }
    Ok(())
}

fn d_vec_delta<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let sub = reader.read_i64()?;
    read_vec_mandatory(this, token.kind, reader)?;
    std::mem::swap(&mut this.text_buf, &mut this.diff_buf);
    apply_string_delta(this, token, sub, reader, producer)
}

fn d_vec_delta_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let raw = reader.read_i64()?;
    if raw == 0 {
        let slot = token.instance as usize;
        this.heap.clear_slot(slot);
        this.bytes_state[slot] = SlotState::Null;
        producer.write_null_var_field(ferrofast_core::ABSENT_LEN);
        return Ok(());
    }
    let sub = if raw > 0 { raw - 1 } else { raw };
    read_vec_mandatory(this, token.kind, reader)?;
    std::mem::swap(&mut this.text_buf, &mut this.diff_buf);
    apply_string_delta(this, token, sub, reader, producer)
}

fn d_vec_tail<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    if reader.pop_pmap_bit()? == 0 {
        return d_string_reuse(this, token, producer);
    }
    read_vec_mandatory(this, token.kind, reader)?;
    apply_string_tail(this, token, reader, producer)
}

fn d_vec_tail_opt<S: ByteSource>(
    this: &mut FieldDecoder,
    token: Token,
    reader: &mut StopBitReader<S>,
    producer: &mut RingProducer,
) -> Result<()> {
    let slot = token.instance as usize;
    if reader.pop_pmap_bit()? == 0 {
        return d_string_reuse(this, token, producer);
    }
    if read_vec_optional(this, token.kind, reader)? {
        apply_string_tail(this, token, reader, producer)
    } else {
        this.heap.clear_slot(slot);
        this.bytes_state[slot] = SlotState::Null;
        producer.write_null_var_field(ferrofast_core::ABSENT_LEN);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrofast_catalog::build_catalog;
    use ferrofast_primitive::SliceSource;
    use ferrofast_ring::dual_ring;

    const XML: &str = r#"
<templates>
  <template name="T" id="1">
    <uInt32 name="A"><copy/></uInt32>
    <uInt32 name="B" presence="optional"><delta/></uInt32>
    <int32 name="C"><increment value="10"/></int32>
    <string name="S"><copy value="init"/></string>
  </template>
</templates>
"#;

    fn setup() -> (FieldDecoder, Catalog, EngineConfig) {
        let catalog = build_catalog(XML).unwrap();
        let config = EngineConfig::new(8, 8);
        let decoder = FieldDecoder::new(&catalog, &config);
        (decoder, catalog, config)
    }

    fn field(catalog: &Catalog, pos: usize) -> Token {
        Token::unpack(catalog.full_script()[pos]).unwrap()
    }

    #[test]
    fn test_copy_bit_set_reads_and_stores() {
        let (mut decoder, catalog, config) = setup();
        let table = DecodeTable::new();
        let (mut producer, mut consumer) = dual_ring(&config);
        // pmap: copy bit set; wire value 7
        let bytes = [0b1100_0000, 0x87];
        let mut reader = StopBitReader::new(SliceSource::new(&bytes), 64);
        reader.open_pmap(1).unwrap();
        producer.begin_fragment(0);
        table
            .dispatch(&mut decoder, field(&catalog, 1), &mut reader, &mut producer)
            .unwrap();
        producer.end_fragment();
        assert!(consumer.try_read_fragment(3));
        consumer.read_int();
        assert_eq!(consumer.read_int(), 7);
        // Second message: bit clear reuses the stored value.
        let bytes = [0b1000_0000];
        let mut reader = StopBitReader::new(SliceSource::new(&bytes), 64);
        reader.open_pmap(1).unwrap();
        producer.begin_fragment(0);
        table
            .dispatch(&mut decoder, field(&catalog, 1), &mut reader, &mut producer)
            .unwrap();
        producer.end_fragment();
        consumer.release_read();
        assert!(consumer.try_read_fragment(3));
        consumer.read_int();
        assert_eq!(consumer.read_int(), 7);
    }

    #[test]
    fn test_optional_delta_null_shift() {
        let (mut decoder, catalog, config) = setup();
        let table = DecodeTable::new();
        let (mut producer, mut consumer) = dual_ring(&config);
        producer.begin_fragment(0);
        // wire 0x80 = raw 0 = null
        let mut reader = StopBitReader::new(SliceSource::new(&[0x80]), 64);
        table
            .dispatch(&mut decoder, field(&catalog, 2), &mut reader, &mut producer)
            .unwrap();
        // wire raw 3 -> delta 2 against null-reset base 0
        let mut reader = StopBitReader::new(SliceSource::new(&[0x83]), 64);
        table
            .dispatch(&mut decoder, field(&catalog, 2), &mut reader, &mut producer)
            .unwrap();
        producer.end_fragment();
        assert!(consumer.try_read_fragment(4));
        consumer.read_int();
        assert_eq!(consumer.read_int(), config.absent_int);
        assert_eq!(consumer.read_int(), 2);
    }

    #[test]
    fn test_increment_from_initial() {
        let (mut decoder, catalog, config) = setup();
        let table = DecodeTable::new();
        let (mut producer, mut consumer) = dual_ring(&config);
        producer.begin_fragment(0);
        // Three increments with the presence bit clear: 11, 12, 13.
        let bytes = [0b1000_0000];
        for _ in 0..3 {
            let mut reader = StopBitReader::new(SliceSource::new(&bytes), 64);
            reader.open_pmap(1).unwrap();
            table
                .dispatch(&mut decoder, field(&catalog, 3), &mut reader, &mut producer)
                .unwrap();
        }
        producer.end_fragment();
        assert!(consumer.try_read_fragment(5));
        consumer.read_int();
        assert_eq!(consumer.read_int(), 11);
        assert_eq!(consumer.read_int(), 12);
        assert_eq!(consumer.read_int(), 13);
    }

    #[test]
    fn test_string_copy_initial_value() {
        let (mut decoder, catalog, config) = setup();
        let table = DecodeTable::new();
        let (mut producer, mut consumer) = dual_ring(&config);
        producer.begin_fragment(0);
        // Presence bit clear: the declared initial "init" is reused via the
        // constant pool.
        let bytes = [0b1000_0000];
        let mut reader = StopBitReader::new(SliceSource::new(&bytes), 64);
        reader.open_pmap(1).unwrap();
        table
            .dispatch(&mut decoder, field(&catalog, 4), &mut reader, &mut producer)
            .unwrap();
        producer.end_fragment();
        assert!(consumer.try_read_fragment(4));
        consumer.read_int();
        let (meta, len) = consumer.read_var_meta();
        assert_eq!(len, 4);
        let mut out = Vec::new();
        consumer.read_bytes_into(meta, len as usize, &mut out);
        assert_eq!(out, b"init");
    }
}
