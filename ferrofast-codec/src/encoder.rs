/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Encode-side operator dispatch, the structural mirror of the decoder.
//!
//! Each function consumes a field's slots from the ring, compares against the
//! same dictionary state the decoder would hold, and emits presence-map bits
//! and wire bytes. Because both sides derive their presence-map consumption
//! from the shared token table, re-encoding a decoded stream reproduces the
//! original bytes.

use ferrofast_catalog::{Catalog, DictionaryFactory, ResetEntry, ResetKind};
use ferrofast_core::{EngineConfig, FastError, Result};
use ferrofast_primitive::{ByteSink, StopBitWriter};
use ferrofast_ring::RingConsumer;
use ferrofast_token::{OpTag, Token, TypeTag};

use crate::decoder::SlotState;
use crate::heap::LocalHeap;

/// Ring value of one variable-length field.
enum RingBytes {
    Null,
    Value,
}

/// Encode-side dictionaries and scratch state.
#[derive(Debug)]
pub struct FieldEncoder {
    int_dict: Vec<i32>,
    int_state: Vec<SlotState>,
    long_dict: Vec<i64>,
    long_state: Vec<SlotState>,
    heap: LocalHeap,
    bytes_state: Vec<SlotState>,
    factory: DictionaryFactory,
    constants: Vec<Vec<u8>>,
    absent_int: i32,
    absent_long: i64,
    value_buf: Vec<u8>,
    last_was_null: bool,
}

impl FieldEncoder {
    /// Builds encoder state sized and seeded from the catalog.
    #[must_use]
    pub fn new(catalog: &Catalog, config: &EngineConfig) -> Self {
        let factory = DictionaryFactory::new(catalog);
        let (ints, longs, bytes) = factory.sizes();
        let mut encoder = Self {
            int_dict: vec![0; ints],
            int_state: vec![SlotState::Undefined; ints],
            long_dict: vec![0; longs],
            long_state: vec![SlotState::Undefined; longs],
            heap: LocalHeap::new(bytes, bytes.max(1) * 32),
            bytes_state: vec![SlotState::Undefined; bytes],
            factory,
            constants: catalog.constants().to_vec(),
            absent_int: config.absent_int,
            absent_long: config.absent_long,
            value_buf: Vec::new(),
            last_was_null: false,
        };
        encoder.reset();
        encoder
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

    /// True when the most recent dispatch encoded a null.
    #[must_use]
    pub fn take_last_null(&mut self) -> bool {
        std::mem::take(&mut self.last_was_null)
    }

    fn int_prev(&self, slot: usize) -> (i64, bool) {
        match self.int_state[slot] {
            SlotState::Assigned => (i64::from(self.int_dict[slot]), false),
            _ => (0, true),
        }
    }

    fn long_prev(&self, slot: usize) -> (i64, bool) {
        match self.long_state[slot] {
            SlotState::Assigned => (self.long_dict[slot], false),
            _ => (0, true),
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

    /// Pulls an int-class slot off the ring; `None` is the absent sentinel.
    fn ring_int(&mut self, kind: TypeTag, consumer: &mut RingConsumer) -> Option<i64> {
        let raw = consumer.read_int();
        let value = if raw == self.absent_int {
            None
        } else if kind.is_signed() {
            Some(i64::from(raw))
        } else {
            Some(i64::from(raw as u32))
        };
        self.last_was_null = value.is_none();
        value
    }

    /// Pulls a long-class slot pair off the ring.
    fn ring_long(&mut self, consumer: &mut RingConsumer) -> Option<i64> {
        let raw = consumer.read_long();
        let value = if raw == self.absent_long { None } else { Some(raw) };
        self.last_was_null = value.is_none();
        value
    }

    /// Pulls a variable-length field off the ring into `value_buf`.
    fn ring_bytes(&mut self, consumer: &mut RingConsumer) -> RingBytes {
        let (meta, len) = consumer.read_var_meta();
        if len < 0 {
            self.last_was_null = true;
            return RingBytes::Null;
        }
        self.last_was_null = false;
        if meta < 0 {
            let const_index = (-meta - 1) as usize;
            self.value_buf.clear();
            self.value_buf.extend_from_slice(&self.constants[const_index]);
        } else {
            let mut buf = std::mem::take(&mut self.value_buf);
            consumer.read_bytes_into(meta, len as usize, &mut buf);
            self.value_buf = buf;
        }
        RingBytes::Value
    }

    fn string_prev(&self, slot: usize) -> Option<&[u8]> {
        match self.bytes_state[slot] {
            SlotState::Assigned => Some(self.heap.get(slot)),
            _ => None,
        }
    }
}

fn write_mandatory<K: ByteSink>(kind: TypeTag, writer: &mut StopBitWriter<K>, value: i64) {
    if kind.is_signed() {
        writer.write_i64(value);
    } else {
        writer.write_u64(value as u64);
    }
}

fn write_optional<K: ByteSink>(kind: TypeTag, writer: &mut StopBitWriter<K>, value: i64) {
    if kind.is_signed() {
        if value >= 0 {
            writer.write_i64(value + 1);
        } else {
            writer.write_i64(value);
        }
    } else {
        writer.write_u64((value as u64).wrapping_add(1));
    }
}

type EncodeFn<K> =
    fn(&mut FieldEncoder, Token, &mut RingConsumer, &mut StopBitWriter<K>) -> Result<()>;

/// Dense encode dispatch table, built once per encoder.
pub struct EncodeTable<K: ByteSink> {
    table: Vec<EncodeFn<K>>,
}

impl<K: ByteSink> EncodeTable<K> {
    /// Builds the full `{type, operator, optionality}` matrix.
    #[must_use]
    pub fn new() -> Self {
        let mut table: Vec<EncodeFn<K>> = vec![e_unsupported::<K>; 512];
        let int_tags = [
            TypeTag::Int32,
            TypeTag::UInt32,
            TypeTag::DecimalExponent,
            TypeTag::GroupLength,
        ];
        let long_tags = [TypeTag::Int64, TypeTag::UInt64, TypeTag::DecimalMantissa];
        let string_tags = [TypeTag::AsciiText, TypeTag::UnicodeText, TypeTag::ByteVector];
        for kind in int_tags {
            set(&mut table, kind, OpTag::None, e_int_none, e_int_none_opt);
            set(&mut table, kind, OpTag::Constant, e_int_constant, e_int_constant_opt);
            set(&mut table, kind, OpTag::Default, e_int_default, e_int_default_opt);
            set(&mut table, kind, OpTag::Copy, e_int_copy, e_int_copy_opt);
            set(&mut table, kind, OpTag::Increment, e_int_increment, e_int_increment_opt);
            set(&mut table, kind, OpTag::Delta, e_int_delta, e_int_delta_opt);
        }
        for kind in long_tags {
            set(&mut table, kind, OpTag::None, e_long_none, e_long_none_opt);
            set(&mut table, kind, OpTag::Constant, e_long_constant, e_long_constant_opt);
            set(&mut table, kind, OpTag::Default, e_long_default, e_long_default_opt);
            set(&mut table, kind, OpTag::Copy, e_long_copy, e_long_copy_opt);
            set(&mut table, kind, OpTag::Increment, e_long_increment, e_long_increment_opt);
            set(&mut table, kind, OpTag::Delta, e_long_delta, e_long_delta_opt);
        }
        for kind in string_tags {
            set(&mut table, kind, OpTag::None, e_string_none, e_string_none_opt);
            set(&mut table, kind, OpTag::Constant, e_string_constant, e_string_constant_opt);
            set(&mut table, kind, OpTag::Default, e_string_default, e_string_default_opt);
            set(&mut table, kind, OpTag::Copy, e_string_copy, e_string_copy_opt);
            set(&mut table, kind, OpTag::Delta, e_string_delta, e_string_delta_opt);
            set(&mut table, kind, OpTag::Tail, e_string_tail, e_string_tail_opt);
        }
        Self { table }
    }

    /// Runs the dispatch function for one token.
    ///
    /// # Errors
    /// Whatever the operator function reports.
    pub fn dispatch(
        &self,
        encoder: &mut FieldEncoder,
        token: Token,
        consumer: &mut RingConsumer,
        writer: &mut StopBitWriter<K>,
    ) -> Result<()> {
        (self.table[token.pack().dispatch_index()])(encoder, token, consumer, writer)
    }
}

impl<K: ByteSink> Default for EncodeTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn set<K: ByteSink>(
    table: &mut [EncodeFn<K>],
    kind: TypeTag,
    op: OpTag,
    mandatory: EncodeFn<K>,
    optional: EncodeFn<K>,
) {
    table[Token::field(kind, op, false, 0).pack().dispatch_index()] = mandatory;
    table[Token::field(kind, op, true, 0).pack().dispatch_index()] = optional;
}

fn e_unsupported<K: ByteSink>(
    _this: &mut FieldEncoder,
    token: Token,
    _consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    Err(FastError::violation(
        format!("no encoder for token {token}"),
        writer.total_written(),
    ))
}

fn mandatory_null<K: ByteSink>(token: Token, writer: &StopBitWriter<K>) -> FastError {
    FastError::violation(
        format!("null value for mandatory field {token}"),
        writer.total_written(),
    )
}

// --- int32 class ---------------------------------------------------------

fn e_int_none<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let value = this
        .ring_int(token.kind, consumer)
        .ok_or_else(|| mandatory_null(token, writer))?;
    write_mandatory(token.kind, writer, value);
    this.int_store(token.instance as usize, value);
    Ok(())
}

fn e_int_none_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.ring_int(token.kind, consumer) {
        Some(value) => {
            write_optional(token.kind, writer, value);
            this.int_store(slot, value);
        }
        None => {
            writer.write_null();
            this.int_store_null(slot);
        }
    }
    Ok(())
}

fn e_int_constant<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    _writer: &mut StopBitWriter<K>,
) -> Result<()> {
    this.ring_int(token.kind, consumer);
    Ok(())
}

fn e_int_constant_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let present = this.ring_int(token.kind, consumer).is_some();
    writer.write_pmap_bit(present)
}

fn e_int_default<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let value = this
        .ring_int(token.kind, consumer)
        .ok_or_else(|| mandatory_null(token, writer))?;
    let initial = i64::from(this.factory.int_initial(token.instance));
    if this.factory.int_has_initial(token.instance) && value == initial {
        writer.write_pmap_bit(false)
    } else {
        writer.write_pmap_bit(true)?;
        write_mandatory(token.kind, writer, value);
        Ok(())
    }
}

fn e_int_default_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let has_initial = this.factory.int_has_initial(token.instance);
    match this.ring_int(token.kind, consumer) {
        None if !has_initial => writer.write_pmap_bit(false),
        None => {
            writer.write_pmap_bit(true)?;
            writer.write_null();
            Ok(())
        }
        Some(value) => {
            if has_initial && value == i64::from(this.factory.int_initial(token.instance)) {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                write_optional(token.kind, writer, value);
                Ok(())
            }
        }
    }
}

fn e_int_copy<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = this
        .ring_int(token.kind, consumer)
        .ok_or_else(|| mandatory_null(token, writer))?;
    // An untouched slot reads as zero on the decode side too.
    if value == this.int_prev(slot).0 {
        writer.write_pmap_bit(false)
    } else {
        writer.write_pmap_bit(true)?;
        write_mandatory(token.kind, writer, value);
        this.int_store(slot, value);
        Ok(())
    }
}

fn e_int_copy_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.ring_int(token.kind, consumer) {
        None => {
            let (_, prev_null) = this.int_prev(slot);
            if prev_null {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                writer.write_null();
                this.int_store_null(slot);
                Ok(())
            }
        }
        Some(value) => {
            let (prev, prev_null) = this.int_prev(slot);
            if !prev_null && value == prev {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                write_optional(token.kind, writer, value);
                this.int_store(slot, value);
                Ok(())
            }
        }
    }
}

fn e_int_increment<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = this
        .ring_int(token.kind, consumer)
        .ok_or_else(|| mandatory_null(token, writer))?;
    if value == this.int_prev(slot).0.wrapping_add(1) {
        this.int_store(slot, value);
        writer.write_pmap_bit(false)
    } else {
        writer.write_pmap_bit(true)?;
        write_mandatory(token.kind, writer, value);
        this.int_store(slot, value);
        Ok(())
    }
}

fn e_int_increment_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.ring_int(token.kind, consumer) {
        None => {
            let (_, prev_null) = this.int_prev(slot);
            if prev_null {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                writer.write_null();
                this.int_store_null(slot);
                Ok(())
            }
        }
        Some(value) => {
            let (prev, prev_null) = this.int_prev(slot);
            if !prev_null && value == prev.wrapping_add(1) {
                this.int_store(slot, value);
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                write_optional(token.kind, writer, value);
                this.int_store(slot, value);
                Ok(())
            }
        }
    }
}

fn e_int_delta<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = this
        .ring_int(token.kind, consumer)
        .ok_or_else(|| mandatory_null(token, writer))?;
    let delta = value.wrapping_sub(this.int_prev(slot).0);
    writer.write_i64(delta);
    this.int_store(slot, value);
    Ok(())
}

fn e_int_delta_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.ring_int(token.kind, consumer) {
        None => {
            writer.write_null();
            this.int_store_null(slot);
        }
        Some(value) => {
            let delta = value.wrapping_sub(this.int_prev(slot).0);
            if delta >= 0 {
                writer.write_i64(delta + 1);
            } else {
                writer.write_i64(delta);
            }
            this.int_store(slot, value);
        }
    }
    Ok(())
}

// --- int64 class ---------------------------------------------------------

fn e_long_none<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let value = this
        .ring_long(consumer)
        .ok_or_else(|| mandatory_null(token, writer))?;
    write_mandatory(token.kind, writer, value);
    this.long_store(token.instance as usize, value);
    Ok(())
}

fn e_long_none_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.ring_long(consumer) {
        Some(value) => {
            write_optional(token.kind, writer, value);
            this.long_store(slot, value);
        }
        None => {
            writer.write_null();
            this.long_store_null(slot);
        }
    }
    Ok(())
}

fn e_long_constant<K: ByteSink>(
    this: &mut FieldEncoder,
    _token: Token,
    consumer: &mut RingConsumer,
    _writer: &mut StopBitWriter<K>,
) -> Result<()> {
    this.ring_long(consumer);
    Ok(())
}

fn e_long_constant_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    _token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let present = this.ring_long(consumer).is_some();
    writer.write_pmap_bit(present)
}

fn e_long_default<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let value = this
        .ring_long(consumer)
        .ok_or_else(|| mandatory_null(token, writer))?;
    if this.factory.long_has_initial(token.instance)
        && value == this.factory.long_initial(token.instance)
    {
        writer.write_pmap_bit(false)
    } else {
        writer.write_pmap_bit(true)?;
        write_mandatory(token.kind, writer, value);
        Ok(())
    }
}

fn e_long_default_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let has_initial = this.factory.long_has_initial(token.instance);
    match this.ring_long(consumer) {
        None if !has_initial => writer.write_pmap_bit(false),
        None => {
            writer.write_pmap_bit(true)?;
            writer.write_null();
            Ok(())
        }
        Some(value) => {
            if has_initial && value == this.factory.long_initial(token.instance) {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                write_optional(token.kind, writer, value);
                Ok(())
            }
        }
    }
}

fn e_long_copy<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = this
        .ring_long(consumer)
        .ok_or_else(|| mandatory_null(token, writer))?;
    if value == this.long_prev(slot).0 {
        writer.write_pmap_bit(false)
    } else {
        writer.write_pmap_bit(true)?;
        write_mandatory(token.kind, writer, value);
        this.long_store(slot, value);
        Ok(())
    }
}

fn e_long_copy_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.ring_long(consumer) {
        None => {
            let (_, prev_null) = this.long_prev(slot);
            if prev_null {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                writer.write_null();
                this.long_store_null(slot);
                Ok(())
            }
        }
        Some(value) => {
            let (prev, prev_null) = this.long_prev(slot);
            if !prev_null && value == prev {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                write_optional(token.kind, writer, value);
                this.long_store(slot, value);
                Ok(())
            }
        }
    }
}

fn e_long_increment<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = this
        .ring_long(consumer)
        .ok_or_else(|| mandatory_null(token, writer))?;
    if value == this.long_prev(slot).0.wrapping_add(1) {
        this.long_store(slot, value);
        writer.write_pmap_bit(false)
    } else {
        writer.write_pmap_bit(true)?;
        write_mandatory(token.kind, writer, value);
        this.long_store(slot, value);
        Ok(())
    }
}

fn e_long_increment_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.ring_long(consumer) {
        None => {
            let (_, prev_null) = this.long_prev(slot);
            if prev_null {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                writer.write_null();
                this.long_store_null(slot);
                Ok(())
            }
        }
        Some(value) => {
            let (prev, prev_null) = this.long_prev(slot);
            if !prev_null && value == prev.wrapping_add(1) {
                this.long_store(slot, value);
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                write_optional(token.kind, writer, value);
                this.long_store(slot, value);
                Ok(())
            }
        }
    }
}

fn e_long_delta<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    let value = this
        .ring_long(consumer)
        .ok_or_else(|| mandatory_null(token, writer))?;
    let delta = value.wrapping_sub(this.long_prev(slot).0);
    writer.write_i64(delta);
    this.long_store(slot, value);
    Ok(())
}

fn e_long_delta_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.ring_long(consumer) {
        None => {
            writer.write_null();
            this.long_store_null(slot);
        }
        Some(value) => {
            let delta = value.wrapping_sub(this.long_prev(slot).0);
            if delta >= 0 {
                writer.write_i64(delta + 1);
            } else {
                writer.write_i64(delta);
            }
            this.long_store(slot, value);
        }
    }
    Ok(())
}

// --- strings (ascii, utf-8, byte vector) ----------------------------------

/// Writes the value in `value_buf` in the type's mandatory wire form.
fn write_string_mandatory<K: ByteSink>(
    kind: TypeTag,
    writer: &mut StopBitWriter<K>,
    value: &[u8],
) {
    if kind == TypeTag::AsciiText {
        writer.write_ascii(value, false);
    } else {
        writer.write_u64(value.len() as u64);
        writer.write_bytes(value);
    }
}

/// Writes the value in the type's optional (null-shifted) wire form.
fn write_string_optional<K: ByteSink>(
    kind: TypeTag,
    writer: &mut StopBitWriter<K>,
    value: &[u8],
) {
    if kind == TypeTag::AsciiText {
        writer.write_ascii(value, true);
    } else {
        writer.write_u64(value.len() as u64 + 1);
        writer.write_bytes(value);
    }
}

fn e_string_none<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    match this.ring_bytes(consumer) {
        RingBytes::Null => Err(mandatory_null(token, writer)),
        RingBytes::Value => {
            write_string_mandatory(token.kind, writer, &this.value_buf);
            Ok(())
        }
    }
}

fn e_string_none_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    match this.ring_bytes(consumer) {
        RingBytes::Null => {
            writer.write_null();
            Ok(())
        }
        RingBytes::Value => {
            write_string_optional(token.kind, writer, &this.value_buf);
            Ok(())
        }
    }
}

fn e_string_constant<K: ByteSink>(
    this: &mut FieldEncoder,
    _token: Token,
    consumer: &mut RingConsumer,
    _writer: &mut StopBitWriter<K>,
) -> Result<()> {
    this.ring_bytes(consumer);
    Ok(())
}

fn e_string_constant_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    _token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let present = matches!(this.ring_bytes(consumer), RingBytes::Value);
    writer.write_pmap_bit(present)
}

fn e_string_default<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    match this.ring_bytes(consumer) {
        RingBytes::Null => Err(mandatory_null(token, writer)),
        RingBytes::Value => {
            let initial = this
                .factory
                .bytes_initial(token.instance)
                .map(|idx| this.constants[idx as usize].as_slice());
            if initial == Some(this.value_buf.as_slice()) {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                write_string_mandatory(token.kind, writer, &this.value_buf);
                Ok(())
            }
        }
    }
}

fn e_string_default_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let has_initial = this.factory.bytes_initial(token.instance).is_some();
    match this.ring_bytes(consumer) {
        RingBytes::Null if !has_initial => writer.write_pmap_bit(false),
        RingBytes::Null => {
            writer.write_pmap_bit(true)?;
            writer.write_null();
            Ok(())
        }
        RingBytes::Value => {
            let initial = this
                .factory
                .bytes_initial(token.instance)
                .map(|idx| this.constants[idx as usize].as_slice());
            if initial == Some(this.value_buf.as_slice()) {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                write_string_optional(token.kind, writer, &this.value_buf);
                Ok(())
            }
        }
    }
}

fn e_string_copy<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.ring_bytes(consumer) {
        RingBytes::Null => Err(mandatory_null(token, writer)),
        RingBytes::Value => {
            // An untouched slot reads as the empty string on the decode side.
            let prev_matches = match this.bytes_state[slot] {
                SlotState::Assigned => this.heap.equals(slot, &this.value_buf),
                _ => this.value_buf.is_empty(),
            };
            if prev_matches {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                write_string_mandatory(token.kind, writer, &this.value_buf);
                this.heap.set(slot, &this.value_buf);
                this.bytes_state[slot] = SlotState::Assigned;
                Ok(())
            }
        }
    }
}

fn e_string_copy_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.ring_bytes(consumer) {
        RingBytes::Null => {
            if this.string_prev(slot).is_none() {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                writer.write_null();
                this.heap.clear_slot(slot);
                this.bytes_state[slot] = SlotState::Null;
                Ok(())
            }
        }
        RingBytes::Value => {
            if this
                .string_prev(slot)
                .is_some_and(|prev| prev == this.value_buf.as_slice())
            {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                write_string_optional(token.kind, writer, &this.value_buf);
                this.heap.set(slot, &this.value_buf);
                this.bytes_state[slot] = SlotState::Assigned;
                Ok(())
            }
        }
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

fn e_string_delta_value<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    writer: &mut StopBitWriter<K>,
    optional: bool,
) -> Result<()> {
    let slot = token.instance as usize;
    let base_is_value = this.bytes_state[slot] == SlotState::Assigned;
    let (prefix, suffix, base_len) = {
        let base: &[u8] = if base_is_value { this.heap.get(slot) } else { &[] };
        (
            common_prefix(base, &this.value_buf),
            common_suffix(base, &this.value_buf),
            base.len(),
        )
    };
    let value_len = this.value_buf.len();
    // Prefer replacing the shorter end; ties replace the tail.
    if value_len - prefix <= value_len - suffix {
        let sub = (base_len - prefix) as i64;
        if optional {
            writer.write_i64(sub + 1);
        } else {
            writer.write_i64(sub);
        }
        let diff_start = prefix;
        let diff = &this.value_buf[diff_start..];
        write_string_mandatory(token.kind, writer, diff);
        this.heap.append_tail(slot, diff, prefix);
    } else {
        let removed = (base_len - suffix) as i64;
        // Negative subtraction lengths address the front; -1 removes zero.
        writer.write_i64(-removed - 1);
        let diff = &this.value_buf[..value_len - suffix];
        write_string_mandatory(token.kind, writer, diff);
        let keep = suffix;
        this.heap.prepend_head(slot, diff, keep);
    }
    this.bytes_state[slot] = SlotState::Assigned;
    Ok(())
}

fn e_string_delta<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    match this.ring_bytes(consumer) {
        RingBytes::Null => Err(mandatory_null(token, writer)),
        RingBytes::Value => e_string_delta_value(this, token, writer, false),
    }
}

fn e_string_delta_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.ring_bytes(consumer) {
        RingBytes::Null => {
            writer.write_null();
            this.heap.clear_slot(slot);
            this.bytes_state[slot] = SlotState::Null;
            Ok(())
        }
        RingBytes::Value => e_string_delta_value(this, token, writer, true),
    }
}

fn e_string_tail_value<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    writer: &mut StopBitWriter<K>,
    optional: bool,
) -> Result<()> {
    let slot = token.instance as usize;
    let (prev_equal, prefix, base_len) = match this.string_prev(slot) {
        Some(prev) => (
            prev == this.value_buf.as_slice(),
            common_prefix(prev, &this.value_buf),
            prev.len(),
        ),
        None => (false, 0, 0),
    };
    if prev_equal {
        return writer.write_pmap_bit(false);
    }
    let value_len = this.value_buf.len();
    if value_len < base_len {
        return Err(FastError::violation(
            "tail operator cannot shorten the previous value",
            writer.total_written(),
        ));
    }
    writer.write_pmap_bit(true)?;
    // The decoder keeps `base_len - tail_len` head bytes: a same-length value
    // sends the suffix past the common prefix, a longer one sends itself.
    let keep = if value_len == base_len { prefix } else { 0 };
    let diff = &this.value_buf[keep..];
    if optional {
        write_string_optional(token.kind, writer, diff);
    } else {
        write_string_mandatory(token.kind, writer, diff);
    }
    this.heap.append_tail(slot, diff, keep);
    this.bytes_state[slot] = SlotState::Assigned;
    Ok(())
}

fn e_string_tail<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    match this.ring_bytes(consumer) {
        RingBytes::Null => Err(mandatory_null(token, writer)),
        RingBytes::Value => e_string_tail_value(this, token, writer, false),
    }
}

fn e_string_tail_opt<K: ByteSink>(
    this: &mut FieldEncoder,
    token: Token,
    consumer: &mut RingConsumer,
    writer: &mut StopBitWriter<K>,
) -> Result<()> {
    let slot = token.instance as usize;
    match this.ring_bytes(consumer) {
        RingBytes::Null => {
            if this.bytes_state[slot] == SlotState::Null {
                writer.write_pmap_bit(false)
            } else {
                writer.write_pmap_bit(true)?;
                writer.write_null();
                this.heap.clear_slot(slot);
                this.bytes_state[slot] = SlotState::Null;
                Ok(())
            }
        }
        RingBytes::Value => e_string_tail_value(this, token, writer, true),
    }
}
