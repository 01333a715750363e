/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! The compiled catalog and its binary form.
//!
//! Binary layout (all multi-byte fields little-endian):
//!
//! ```text
//! magic "FASTCAT0" | version u32 | templateCount u32 | scriptLength u32
//! | maxPMapBytes u32
//! | tokens:            scriptLength x i32
//! | template table:    count x { id u32, start u32, limit u32 }
//! | reset table:       groupCount u32, per group:
//!                        entryCount u32, entries x { kind u8, slot u32, value i64 }
//! | constant pool:     count u32, entries x { len u32, bytes }
//! | maxTextLen u32 | maxByteVectorLen u32 | preambleBytes u32
//! | int defaults:      count u32, entries x { slot u32, value i32 }
//! | long defaults:     count u32, entries x { slot u32, value i64 }
//! | bytes initials:    count u32, entries x { slot u32, constIndex u32 }
//! ```
//!
//! Tables derivable from the script (fragment sizes, presence-map bounds,
//! dictionary sizes, template-start lookup) are recomputed on load.

use std::collections::HashMap;

use ferrofast_core::{CatalogError, Result};
use ferrofast_token::{group_flags, OpTag, PackedToken, Token, TypeTag};

use crate::hash::LongHashTable;

/// Catalog binary magic.
pub const CATALOG_MAGIC: &[u8; 8] = b"FASTCAT0";

/// Catalog binary version (the revised token scheme).
pub const CATALOG_VERSION: u32 = 2;

/// Kind discriminant of a reset entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetKind {
    /// Int32 dictionary slot; value is the initial value.
    Int = 0,
    /// Int64 dictionary slot; value is the initial value.
    Long = 1,
    /// Byte-heap slot; value is the constant-pool index or -1.
    Bytes = 2,
}

/// One dictionary slot reset executed on message open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetEntry {
    /// Which dictionary the slot belongs to.
    pub kind: ResetKind,
    /// Slot index.
    pub slot: u32,
    /// Initial value, or constant-pool index / -1 for byte slots.
    pub value: i64,
}

/// Template location in the flattened script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateEntry {
    /// Wire template id.
    pub id: u32,
    /// Script position of the opening group token.
    pub start: u32,
    /// Script position one past the closing group token.
    pub limit: u32,
}

/// A compiled, executable template catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    script: Vec<PackedToken>,
    templates: Vec<TemplateEntry>,
    resets: Vec<Vec<ResetEntry>>,
    constants: Vec<Vec<u8>>,
    int_defaults: Vec<(u32, i32)>,
    long_defaults: Vec<(u32, i64)>,
    bytes_initials: Vec<(u32, u32)>,
    max_pmap_bytes: u32,
    max_text_len: u32,
    max_byte_vector_len: u32,
    preamble_bytes: u32,

    // Derived, never serialized.
    template_lookup: LongHashTable,
    template_index_of_start: HashMap<u32, usize>,
    group_pmap_bytes: Vec<u16>,
    fragment_slots: Vec<u16>,
    fragment_script_len: Vec<u16>,
    fragment_var_fields: Vec<u16>,
    max_template_pmap_bytes: u32,
    int_dict_size: u32,
    long_dict_size: u32,
    bytes_dict_size: u32,
}

impl Catalog {
    /// Assembles a catalog from compiled parts and derives the runtime
    /// tables.
    ///
    /// # Errors
    /// [`CatalogError`] when the script or template table is inconsistent.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        script: Vec<PackedToken>,
        templates: Vec<TemplateEntry>,
        resets: Vec<Vec<ResetEntry>>,
        constants: Vec<Vec<u8>>,
        int_defaults: Vec<(u32, i32)>,
        long_defaults: Vec<(u32, i64)>,
        bytes_initials: Vec<(u32, u32)>,
        max_text_len: u32,
        max_byte_vector_len: u32,
        preamble_bytes: u32,
    ) -> Result<Self> {
        let mut catalog = Self {
            script,
            templates,
            resets,
            constants,
            int_defaults,
            long_defaults,
            bytes_initials,
            max_pmap_bytes: 0,
            max_text_len,
            max_byte_vector_len,
            preamble_bytes,
            template_lookup: LongHashTable::new(1),
            template_index_of_start: HashMap::new(),
            group_pmap_bytes: Vec::new(),
            fragment_slots: Vec::new(),
            fragment_script_len: Vec::new(),
            fragment_var_fields: Vec::new(),
            max_template_pmap_bytes: 0,
            int_dict_size: 0,
            long_dict_size: 0,
            bytes_dict_size: 0,
        };
        catalog.derive_tables()?;
        Ok(catalog)
    }

    /// Number of templates.
    #[must_use]
    pub fn templates_count(&self) -> usize {
        self.templates.len()
    }

    /// The full flattened token script.
    #[must_use]
    pub fn full_script(&self) -> &[PackedToken] {
        &self.script
    }

    /// Template table in document order.
    #[must_use]
    pub fn templates(&self) -> &[TemplateEntry] {
        &self.templates
    }

    /// Script start of the given template id.
    #[must_use]
    pub fn template_start(&self, template_id: u32) -> Option<u32> {
        self.template_lookup
            .get_item(i64::from(template_id) + 1)
            .map(|start| start as u32)
    }

    /// Script limit (one past the close token) of the given template id.
    #[must_use]
    pub fn template_limit(&self, template_id: u32) -> Option<u32> {
        self.template_index_of_start
            .get(&self.template_start(template_id)?)
            .map(|&idx| self.templates[idx].limit)
    }

    /// Template entry whose body starts at `start`, if any.
    #[must_use]
    pub fn template_at_start(&self, start: u32) -> Option<&TemplateEntry> {
        self.template_index_of_start
            .get(&start)
            .map(|&idx| &self.templates[idx])
    }

    /// Reset entries of the template at document index `idx`.
    #[must_use]
    pub fn resets_of(&self, idx: usize) -> &[ResetEntry] {
        &self.resets[idx]
    }

    /// Document index of a template id.
    #[must_use]
    pub fn template_index(&self, template_id: u32) -> Option<usize> {
        self.templates.iter().position(|t| t.id == template_id)
    }

    /// The byte-constant pool.
    #[must_use]
    pub fn constants(&self) -> &[Vec<u8>] {
        &self.constants
    }

    /// Initial int32 dictionary values as `(slot, value)` pairs.
    #[must_use]
    pub fn int_defaults(&self) -> &[(u32, i32)] {
        &self.int_defaults
    }

    /// Initial int64 dictionary values as `(slot, value)` pairs.
    #[must_use]
    pub fn long_defaults(&self) -> &[(u32, i64)] {
        &self.long_defaults
    }

    /// Initial byte-heap values as `(slot, constant index)` pairs.
    #[must_use]
    pub fn bytes_initials(&self) -> &[(u32, u32)] {
        &self.bytes_initials
    }

    /// Worst-case stacked presence-map bytes of any message.
    #[must_use]
    pub const fn max_pmap_bytes(&self) -> u32 {
        self.max_pmap_bytes
    }

    /// Byte bound of the message-open presence map.
    #[must_use]
    pub const fn max_template_pmap_bytes(&self) -> u32 {
        self.max_template_pmap_bytes
    }

    /// Presence-map byte bound of the group opening at script position `pos`.
    #[must_use]
    pub fn group_pmap_bytes(&self, pos: usize) -> u32 {
        u32::from(self.group_pmap_bytes[pos])
    }

    /// Slab slots (header and trailing slot included, preamble excluded) of
    /// the fragment starting at script position `pos`, or 0 when no fragment
    /// starts there.
    #[must_use]
    pub fn fragment_slots(&self, pos: usize) -> usize {
        usize::from(self.fragment_slots[pos])
    }

    /// Script tokens consumed by the fragment starting at `pos`.
    #[must_use]
    pub fn fragment_script_len(&self, pos: usize) -> usize {
        usize::from(self.fragment_script_len[pos])
    }

    /// Variable-length fields carried by the fragment starting at `pos`.
    #[must_use]
    pub fn fragment_var_fields(&self, pos: usize) -> usize {
        usize::from(self.fragment_var_fields[pos])
    }

    /// Int32 dictionary slot count.
    #[must_use]
    pub const fn int_dict_size(&self) -> u32 {
        self.int_dict_size
    }

    /// Int64 dictionary slot count.
    #[must_use]
    pub const fn long_dict_size(&self) -> u32 {
        self.long_dict_size
    }

    /// Byte-heap slot count.
    #[must_use]
    pub const fn bytes_dict_size(&self) -> u32 {
        self.bytes_dict_size
    }

    /// Upper bound on text field length.
    #[must_use]
    pub const fn max_text_len(&self) -> u32 {
        self.max_text_len
    }

    /// Sets the text length bound (decode-side guard).
    pub fn set_max_text_len(&mut self, len: u32) {
        self.max_text_len = len;
    }

    /// Upper bound on byte-vector field length.
    #[must_use]
    pub const fn max_byte_vector_len(&self) -> u32 {
        self.max_byte_vector_len
    }

    /// Sets the byte-vector length bound (decode-side guard).
    pub fn set_max_byte_vector_len(&mut self, len: u32) {
        self.max_byte_vector_len = len;
    }

    /// Verbatim per-message preamble size in bytes.
    #[must_use]
    pub const fn preamble_bytes(&self) -> u32 {
        self.preamble_bytes
    }

    /// Sets the per-message preamble size.
    pub fn set_preamble_bytes(&mut self, bytes: u32) {
        self.preamble_bytes = bytes;
    }

    /// Int slots the preamble occupies in message-open fragments.
    #[must_use]
    pub const fn preamble_slots(&self) -> usize {
        self.preamble_bytes.div_ceil(4) as usize
    }

    fn derive_tables(&mut self) -> Result<()> {
        let len = self.script.len();
        self.group_pmap_bytes = vec![0; len];
        self.fragment_slots = vec![0; len];
        self.fragment_script_len = vec![0; len];
        self.fragment_var_fields = vec![0; len];

        let mut lookup_bits = 1u8;
        while (1usize << lookup_bits) < (self.templates.len() + 2) * 2 {
            lookup_bits += 1;
        }
        self.template_lookup = LongHashTable::new(lookup_bits);
        self.template_index_of_start = HashMap::new();
        for (idx, template) in self.templates.iter().enumerate() {
            // Shift ids by one so id zero stays usable as a key.
            if !self
                .template_lookup
                .set_item(i64::from(template.id) + 1, i64::from(template.start))
            {
                return Err(CatalogError::DuplicateTemplateId { id: template.id }.into());
            }
            self.template_index_of_start
                .insert(template.start, idx);
        }

        let mut max_int = 0i64;
        let mut max_long = 0i64;
        let mut max_bytes = 0i64;
        for &packed in &self.script {
            let token = Token::unpack(packed).ok_or_else(|| {
                CatalogError::InvalidBinary(format!("unknown token type bits {:#x}", packed.0))
            })?;
            if token.kind.is_int_class() {
                max_int = max_int.max(i64::from(token.instance) + 1);
            } else if token.kind.is_long_class() {
                max_long = max_long.max(i64::from(token.instance) + 1);
            } else if token.kind.is_bytes_class() {
                max_bytes = max_bytes.max(i64::from(token.instance) + 1);
            }
        }
        self.int_dict_size = max_int as u32;
        self.long_dict_size = max_long as u32;
        self.bytes_dict_size = max_bytes as u32;

        self.max_pmap_bytes = 0;
        self.max_template_pmap_bytes = 0;
        let template_ranges: Vec<(u32, u32)> = self
            .templates
            .iter()
            .map(|t| (t.start, t.limit))
            .collect();
        for (start, limit) in template_ranges {
            self.derive_template(start as usize, limit as usize)?;
        }
        Ok(())
    }

    /// Walks one template: presence-map bit counts per group and fragment
    /// boundaries at every sequence edge.
    fn derive_template(&mut self, start: usize, limit: usize) -> Result<()> {
        if start >= limit || limit > self.script.len() {
            return Err(
                CatalogError::InvalidBinary(format!("template range {start}..{limit}")).into(),
            );
        }
        // Bit counts per open group, template body at the bottom. The
        // template map always carries the template-id bit.
        let mut group_stack: Vec<(usize, u32)> = vec![(start, 1)];
        // Current fragment accounting.
        let mut frag_start = start;
        let mut frag_slots = 2usize; // header + trailing bytes-consumed slot
        let mut frag_vars = 0usize;
        let mut pos = start + 1;

        let close_fragment = |this: &mut Self,
                              frag_start: usize,
                              slots: usize,
                              vars: usize,
                              end_pos: usize| {
            this.fragment_slots[frag_start] = slots as u16;
            this.fragment_script_len[frag_start] = (end_pos - frag_start) as u16;
            this.fragment_var_fields[frag_start] = vars as u16;
        };

        while pos < limit {
            let packed = self.script[pos];
            let token = Token::unpack(packed).ok_or_else(|| {
                CatalogError::InvalidBinary(format!("unknown token type bits {:#x}", packed.0))
            })?;
            match token.kind {
                TypeTag::Group if token.op & group_flags::CLOSE == 0 => {
                    if token.op & group_flags::SEQUENCE != 0 {
                        // Sequence body opens: close the fragment before it
                        // and start the per-iteration fragment.
                        close_fragment(self, frag_start, frag_slots, frag_vars, pos);
                        frag_start = pos;
                        frag_slots = 2;
                        frag_vars = 0;
                    }
                    group_stack.push((pos, 0));
                }
                TypeTag::Group => {
                    let (open_pos, bits) = group_stack.pop().ok_or_else(|| {
                        CatalogError::InvalidBinary("unbalanced group close".to_string())
                    })?;
                    let is_template_close = group_stack.is_empty();
                    let bytes = if is_template_close {
                        bits.div_ceil(7).max(1)
                    } else if bits > 0 {
                        bits.div_ceil(7)
                    } else {
                        0
                    };
                    self.group_pmap_bytes[open_pos] = bytes as u16;
                    self.group_pmap_bytes[pos] = bytes as u16;
                    if is_template_close {
                        self.max_template_pmap_bytes = self.max_template_pmap_bytes.max(bytes);
                        close_fragment(self, frag_start, frag_slots, frag_vars, pos + 1);
                    } else if token.op & group_flags::SEQUENCE != 0 {
                        // Iteration fragment ends here; outer content resumes
                        // as a fresh fragment.
                        close_fragment(self, frag_start, frag_slots, frag_vars, pos + 1);
                        frag_start = pos + 1;
                        frag_slots = 2;
                        frag_vars = 0;
                    }
                }
                kind => {
                    let Some(top) = group_stack.last_mut() else {
                        return Err(CatalogError::InvalidBinary(
                            "field token outside any group".to_string(),
                        )
                        .into());
                    };
                    if token.op_tag().consumes_pmap_bit(token.optional) {
                        top.1 += 1;
                    }
                    frag_slots += kind.slot_count();
                    if kind.is_bytes_class() {
                        frag_vars += 1;
                    }
                }
            }
            pos += 1;
        }
        if !group_stack.is_empty() {
            return Err(CatalogError::InvalidBinary(
                "template body not closed by a group token".to_string(),
            )
            .into());
        }
        // Second walk: worst-case stacked presence-map bytes along any
        // nesting path of this template.
        let mut stacked = 0u32;
        let mut open_bytes: Vec<u32> = Vec::new();
        for pos in start..limit {
            let packed = self.script[pos];
            if packed.is_group() {
                if packed.has_group_flag(group_flags::CLOSE) {
                    stacked -= open_bytes.pop().unwrap_or(0);
                } else {
                    let bytes = u32::from(self.group_pmap_bytes[pos]);
                    open_bytes.push(bytes);
                    stacked += bytes;
                    self.max_pmap_bytes = self.max_pmap_bytes.max(stacked);
                }
            }
        }
        Ok(())
    }

    /// Serializes the catalog to its binary form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1024);
        out.extend_from_slice(CATALOG_MAGIC);
        put_u32(&mut out, CATALOG_VERSION);
        put_u32(&mut out, self.templates.len() as u32);
        put_u32(&mut out, self.script.len() as u32);
        put_u32(&mut out, self.max_pmap_bytes);

        for &token in &self.script {
            put_u32(&mut out, token.0);
        }
        for template in &self.templates {
            put_u32(&mut out, template.id);
            put_u32(&mut out, template.start);
            put_u32(&mut out, template.limit);
        }
        put_u32(&mut out, self.resets.len() as u32);
        for group in &self.resets {
            put_u32(&mut out, group.len() as u32);
            for entry in group {
                out.push(entry.kind as u8);
                put_u32(&mut out, entry.slot);
                put_u64(&mut out, entry.value as u64);
            }
        }
        put_u32(&mut out, self.constants.len() as u32);
        for constant in &self.constants {
            put_u32(&mut out, constant.len() as u32);
            out.extend_from_slice(constant);
        }
        put_u32(&mut out, self.max_text_len);
        put_u32(&mut out, self.max_byte_vector_len);
        put_u32(&mut out, self.preamble_bytes);
        put_u32(&mut out, self.int_defaults.len() as u32);
        for &(slot, value) in &self.int_defaults {
            put_u32(&mut out, slot);
            put_u32(&mut out, value as u32);
        }
        put_u32(&mut out, self.long_defaults.len() as u32);
        for &(slot, value) in &self.long_defaults {
            put_u32(&mut out, slot);
            put_u64(&mut out, value as u64);
        }
        put_u32(&mut out, self.bytes_initials.len() as u32);
        for &(slot, const_index) in &self.bytes_initials {
            put_u32(&mut out, slot);
            put_u32(&mut out, const_index);
        }
        out
    }

    /// Rebuilds a catalog from its binary form.
    ///
    /// # Errors
    /// [`CatalogError::InvalidBinary`] on truncation or bad magic/version.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { data, pos: 0 };
        let magic = cursor.take(8)?;
        if magic != CATALOG_MAGIC {
            return Err(CatalogError::InvalidBinary("bad magic".to_string()).into());
        }
        let version = cursor.u32()?;
        if version != CATALOG_VERSION {
            return Err(
                CatalogError::InvalidBinary(format!("unsupported version {version}")).into(),
            );
        }
        let template_count = cursor.u32()? as usize;
        let script_len = cursor.u32()? as usize;
        let _max_pmap_bytes = cursor.u32()?;

        let mut script = Vec::with_capacity(script_len);
        for _ in 0..script_len {
            script.push(PackedToken(cursor.u32()?));
        }
        let mut templates = Vec::with_capacity(template_count);
        for _ in 0..template_count {
            templates.push(TemplateEntry {
                id: cursor.u32()?,
                start: cursor.u32()?,
                limit: cursor.u32()?,
            });
        }
        let reset_groups = cursor.u32()? as usize;
        let mut resets = Vec::with_capacity(reset_groups);
        for _ in 0..reset_groups {
            let entries = cursor.u32()? as usize;
            let mut group = Vec::with_capacity(entries);
            for _ in 0..entries {
                let kind = match cursor.u8()? {
                    0 => ResetKind::Int,
                    1 => ResetKind::Long,
                    2 => ResetKind::Bytes,
                    other => {
                        return Err(CatalogError::InvalidBinary(format!(
                            "unknown reset kind {other}"
                        ))
                        .into())
                    }
                };
                group.push(ResetEntry {
                    kind,
                    slot: cursor.u32()?,
                    value: cursor.u64()? as i64,
                });
            }
            resets.push(group);
        }
        let const_count = cursor.u32()? as usize;
        let mut constants = Vec::with_capacity(const_count);
        for _ in 0..const_count {
            let len = cursor.u32()? as usize;
            constants.push(cursor.take(len)?.to_vec());
        }
        let max_text_len = cursor.u32()?;
        let max_byte_vector_len = cursor.u32()?;
        let preamble_bytes = cursor.u32()?;
        let int_count = cursor.u32()? as usize;
        let mut int_defaults = Vec::with_capacity(int_count);
        for _ in 0..int_count {
            int_defaults.push((cursor.u32()?, cursor.u32()? as i32));
        }
        let long_count = cursor.u32()? as usize;
        let mut long_defaults = Vec::with_capacity(long_count);
        for _ in 0..long_count {
            long_defaults.push((cursor.u32()?, cursor.u64()? as i64));
        }
        let bytes_count = cursor.u32()? as usize;
        let mut bytes_initials = Vec::with_capacity(bytes_count);
        for _ in 0..bytes_count {
            bytes_initials.push((cursor.u32()?, cursor.u32()?));
        }

        Self::assemble(
            script,
            templates,
            resets,
            constants,
            int_defaults,
            long_defaults,
            bytes_initials,
            max_text_len,
            max_byte_vector_len,
            preamble_bytes,
        )
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err(CatalogError::InvalidBinary("truncated catalog".to_string()).into());
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrofast_token::Token;

    /// One template: open, a copy int, a sequence of one delta long, close.
    fn tiny_catalog() -> Catalog {
        let script = vec![
            Token::group(group_flags::TEMPLATE | group_flags::PMAP, false, 6).pack(),
            Token::field(TypeTag::UInt32, OpTag::Copy, false, 0).pack(),
            Token::field(TypeTag::GroupLength, OpTag::None, false, 1).pack(),
            Token::group(group_flags::SEQUENCE, false, 2).pack(),
            Token::field(TypeTag::UInt64, OpTag::Delta, false, 0).pack(),
            Token::group(group_flags::SEQUENCE | group_flags::CLOSE, false, 2).pack(),
            Token::group(
                group_flags::TEMPLATE | group_flags::PMAP | group_flags::CLOSE,
                false,
                6,
            )
            .pack(),
        ];
        let templates = vec![TemplateEntry {
            id: 7,
            start: 0,
            limit: 7,
        }];
        Catalog::assemble(
            script,
            templates,
            vec![vec![]],
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            32,
            32,
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_derived_dictionary_sizes() {
        let catalog = tiny_catalog();
        assert_eq!(catalog.int_dict_size(), 2);
        assert_eq!(catalog.long_dict_size(), 1);
        assert_eq!(catalog.bytes_dict_size(), 0);
    }

    #[test]
    fn test_template_lookup() {
        let catalog = tiny_catalog();
        assert_eq!(catalog.template_start(7), Some(0));
        assert_eq!(catalog.template_limit(7), Some(7));
        assert_eq!(catalog.template_start(8), None);
        assert_eq!(catalog.template_at_start(0).unwrap().id, 7);
    }

    #[test]
    fn test_fragment_tables() {
        let catalog = tiny_catalog();
        // Head fragment: header + copy int + length + trailing.
        assert_eq!(catalog.fragment_slots(0), 4);
        assert_eq!(catalog.fragment_script_len(0), 3);
        // Iteration fragment: header + long + trailing.
        assert_eq!(catalog.fragment_slots(3), 4);
        assert_eq!(catalog.fragment_script_len(3), 3);
        // Tail fragment: header + trailing only.
        assert_eq!(catalog.fragment_slots(6), 2);
        assert_eq!(catalog.fragment_script_len(6), 1);
    }

    #[test]
    fn test_pmap_bounds() {
        let catalog = tiny_catalog();
        // Template map: template-id bit + copy bit = 1 byte.
        assert_eq!(catalog.group_pmap_bytes(0), 1);
        // Sequence body has no pmap-consuming field.
        assert_eq!(catalog.group_pmap_bytes(3), 0);
        assert_eq!(catalog.max_template_pmap_bytes(), 1);
        assert_eq!(catalog.max_pmap_bytes(), 1);
    }

    #[test]
    fn test_binary_round_trip() {
        let catalog = tiny_catalog();
        let bytes = catalog.to_bytes();
        let reloaded = Catalog::from_bytes(&bytes).unwrap();
        assert_eq!(reloaded.to_bytes(), bytes);
        assert_eq!(reloaded.templates_count(), 1);
        assert_eq!(reloaded.full_script(), catalog.full_script());
        assert_eq!(reloaded.fragment_slots(0), catalog.fragment_slots(0));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = tiny_catalog().to_bytes();
        bytes[0] = b'X';
        assert!(Catalog::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = tiny_catalog().to_bytes();
        assert!(Catalog::from_bytes(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_duplicate_template_id_rejected() {
        let script = tiny_catalog().full_script().to_vec();
        let templates = vec![
            TemplateEntry {
                id: 7,
                start: 0,
                limit: 7,
            },
            TemplateEntry {
                id: 7,
                start: 0,
                limit: 7,
            },
        ];
        let result = Catalog::assemble(
            script,
            templates,
            vec![vec![], vec![]],
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            32,
            32,
            0,
        );
        assert!(result.is_err());
    }
}
