/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Template XML loading and script compilation.
//!
//! Loading is two passes. The event pass walks the `quick_xml` stream and
//! builds the [`TemplateSet`] model; the compile pass assigns dictionary
//! slots in document order, resolves initial values into the default tables
//! and the byte-constant pool, and emits the flat token script. Slot
//! assignment never iterates a hash container, so identical template text
//! yields identical catalog bytes on every load.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::debug;

use ferrofast_core::{CatalogError, Result};
use ferrofast_token::{group_flags, OpTag, PackedToken, Token, TypeTag};

use crate::catalog::{Catalog, ResetEntry, ResetKind, TemplateEntry};
use crate::schema::{
    DictionaryScope, FieldDef, FieldKind, OperatorDef, TemplateDef, TemplateSet,
};

/// Parses template XML and compiles it into an executable catalog.
///
/// # Errors
/// [`CatalogError`] for malformed XML or inconsistent template definitions.
pub fn build_catalog(xml: &str) -> Result<Catalog> {
    let set = parse_templates(xml)?;
    compile(&set)
}

/// Parses template XML into the [`TemplateSet`] model.
///
/// # Errors
/// [`CatalogError::MalformedXml`] and friends on structural problems.
pub fn parse_templates(xml: &str) -> Result<TemplateSet> {
    let mut reader = Reader::from_str(xml);
    let mut parser = Parser::default();
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => parser.open(e, false)?,
            Ok(Event::Empty(ref e)) => parser.open(e, true)?,
            Ok(Event::End(ref e)) => parser.close(&local_name(e.name().as_ref()))?,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(CatalogError::MalformedXml(e.to_string()).into()),
        }
    }
    parser.finish()
}

fn local_name(qname: &[u8]) -> String {
    let name = qname.rsplit(|&b| b == b':').next().unwrap_or(qname);
    String::from_utf8_lossy(name).into_owned()
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok())
        .map(|v| v.into_owned())
}

#[derive(Debug)]
enum Frame {
    Template(TemplateDef),
    Scalar(FieldDef),
    Decimal {
        field: FieldDef,
        exponent: Option<OperatorDef>,
        mantissa: Option<OperatorDef>,
    },
    DecimalSub {
        is_exponent: bool,
        op: OperatorDef,
    },
    Sequence {
        field: FieldDef,
        length: Option<(String, u64, OperatorDef)>,
        body: Vec<FieldDef>,
    },
    Length {
        name: String,
        id: u64,
        op: OperatorDef,
    },
    Group {
        field: FieldDef,
        body: Vec<FieldDef>,
    },
}

#[derive(Debug, Default)]
struct Parser {
    stack: Vec<Frame>,
    set: TemplateSet,
}

impl Parser {
    fn open(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<()> {
        let name = local_name(e.name().as_ref());
        match name.as_str() {
            "templates" | "typeRef" => {}
            "template" => {
                let template_name = attr(e, "name").unwrap_or_default();
                let id = attr(e, "id")
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| CatalogError::MissingAttribute {
                        name: template_name.clone(),
                        attribute: "id".to_string(),
                    })?;
                let dictionary = match attr(e, "dictionary").as_deref() {
                    None | Some("global") => DictionaryScope::Global,
                    Some("template") => DictionaryScope::Template,
                    Some(other) => DictionaryScope::Named(other.to_string()),
                };
                self.stack.push(Frame::Template(TemplateDef {
                    name: template_name,
                    id,
                    dictionary,
                    fields: Vec::new(),
                }));
                if empty {
                    self.close("template")?;
                }
            }
            "uInt32" | "int32" | "uInt64" | "int64" | "string" | "byteVector" => {
                let kind = match name.as_str() {
                    "uInt32" => FieldKind::UInt32,
                    "int32" => FieldKind::Int32,
                    "uInt64" => FieldKind::UInt64,
                    "int64" => FieldKind::Int64,
                    "byteVector" => FieldKind::ByteVector,
                    _ => match attr(e, "charset").as_deref() {
                        Some("unicode") => FieldKind::Unicode,
                        _ => FieldKind::Ascii,
                    },
                };
                let field = self.field_shell(e, kind)?;
                self.stack.push(Frame::Scalar(field));
                if empty {
                    self.close(&name)?;
                }
            }
            "decimal" => {
                let field = self.field_shell(
                    e,
                    FieldKind::Decimal {
                        exponent: OperatorDef::default(),
                        mantissa: OperatorDef::default(),
                    },
                )?;
                self.stack.push(Frame::Decimal {
                    field,
                    exponent: None,
                    mantissa: None,
                });
                if empty {
                    self.close("decimal")?;
                }
            }
            "exponent" | "mantissa" => {
                self.stack.push(Frame::DecimalSub {
                    is_exponent: name == "exponent",
                    op: OperatorDef::default(),
                });
                if empty {
                    self.close(&name)?;
                }
            }
            "sequence" => {
                let field = self.field_shell(e, FieldKind::Group { body: Vec::new() })?;
                self.stack.push(Frame::Sequence {
                    field,
                    length: None,
                    body: Vec::new(),
                });
                if empty {
                    self.close("sequence")?;
                }
            }
            "length" => {
                let length_name = attr(e, "name").unwrap_or_default();
                let id = attr(e, "id").and_then(|v| v.parse().ok()).unwrap_or(0);
                self.stack.push(Frame::Length {
                    name: length_name,
                    id,
                    op: OperatorDef::default(),
                });
                if empty {
                    self.close("length")?;
                }
            }
            "group" => {
                let field = self.field_shell(e, FieldKind::Group { body: Vec::new() })?;
                self.stack.push(Frame::Group {
                    field,
                    body: Vec::new(),
                });
                if empty {
                    self.close("group")?;
                }
            }
            "constant" | "default" | "copy" | "increment" | "delta" | "tail" => {
                let op = match name.as_str() {
                    "constant" => OpTag::Constant,
                    "default" => OpTag::Default,
                    "copy" => OpTag::Copy,
                    "increment" => OpTag::Increment,
                    "delta" => OpTag::Delta,
                    _ => OpTag::Tail,
                };
                let def = OperatorDef {
                    op,
                    value: attr(e, "value"),
                };
                self.apply_operator(def)?;
            }
            other => {
                return Err(
                    CatalogError::MalformedXml(format!("unknown element <{other}>")).into(),
                )
            }
        }
        Ok(())
    }

    fn apply_operator(&mut self, def: OperatorDef) -> Result<()> {
        match self.stack.last_mut() {
            Some(Frame::Scalar(field)) => field.operator = def,
            Some(Frame::DecimalSub { op, .. }) | Some(Frame::Length { op, .. }) => *op = def,
            _ => {
                return Err(CatalogError::MalformedXml(
                    "operator element outside a field".to_string(),
                )
                .into())
            }
        }
        Ok(())
    }

    fn field_shell(&self, e: &BytesStart<'_>, kind: FieldKind) -> Result<FieldDef> {
        Ok(FieldDef {
            name: attr(e, "name").unwrap_or_default(),
            id: attr(e, "id").and_then(|v| v.parse().ok()).unwrap_or(0),
            kind,
            optional: attr(e, "presence").as_deref() == Some("optional"),
            operator: OperatorDef::default(),
        })
    }

    fn close(&mut self, name: &str) -> Result<()> {
        match name {
            "templates" | "typeRef" | "constant" | "default" | "copy" | "increment" | "delta"
            | "tail" => return Ok(()),
            _ => {}
        }
        let frame = self.stack.pop().ok_or_else(|| {
            CatalogError::MalformedXml(format!("unbalanced </{name}>"))
        })?;
        match frame {
            Frame::Template(template) => self.set.templates.push(template),
            Frame::Scalar(field) => self.attach(field)?,
            Frame::Decimal {
                mut field,
                exponent,
                mantissa,
            } => {
                let (Some(exponent), Some(mantissa)) = (exponent, mantissa) else {
                    return Err(CatalogError::DecimalMissingSubfield { name: field.name }.into());
                };
                field.kind = FieldKind::Decimal { exponent, mantissa };
                self.attach(field)?;
            }
            Frame::DecimalSub { is_exponent, op } => match self.stack.last_mut() {
                Some(Frame::Decimal {
                    exponent, mantissa, ..
                }) => {
                    if is_exponent {
                        *exponent = Some(op);
                    } else {
                        *mantissa = Some(op);
                    }
                }
                _ => {
                    return Err(CatalogError::MalformedXml(
                        "exponent/mantissa outside a decimal".to_string(),
                    )
                    .into())
                }
            },
            Frame::Sequence {
                mut field,
                length,
                body,
            } => {
                let Some((length_name, length_id, length_op)) = length else {
                    return Err(CatalogError::UndefinedField {
                        name: format!("{}/length", field.name),
                    }
                    .into());
                };
                field.kind = FieldKind::Sequence {
                    length_name,
                    length_id,
                    length_op,
                    body,
                };
                self.attach(field)?;
            }
            Frame::Length { name, id, op } => match self.stack.last_mut() {
                Some(Frame::Sequence { length, .. }) => *length = Some((name, id, op)),
                _ => {
                    return Err(CatalogError::MalformedXml(
                        "length element outside a sequence".to_string(),
                    )
                    .into())
                }
            },
            Frame::Group { mut field, body } => {
                field.kind = FieldKind::Group { body };
                self.attach(field)?;
            }
        }
        Ok(())
    }

    fn attach(&mut self, field: FieldDef) -> Result<()> {
        match self.stack.last_mut() {
            Some(Frame::Template(template)) => template.fields.push(field),
            Some(Frame::Sequence { body, .. }) | Some(Frame::Group { body, .. }) => {
                body.push(field);
            }
            _ => {
                return Err(CatalogError::MalformedXml(format!(
                    "field '{}' outside a template",
                    field.name
                ))
                .into())
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<TemplateSet> {
        if !self.stack.is_empty() {
            return Err(CatalogError::MalformedXml("unclosed elements".to_string()).into());
        }
        Ok(self.set)
    }
}

/// Compiles a parsed template set into an executable catalog.
///
/// # Errors
/// [`CatalogError`] on slot or operator inconsistencies.
pub fn compile(set: &TemplateSet) -> Result<Catalog> {
    let mut compiler = Compiler::default();
    for template in &set.templates {
        compiler.compile_template(template)?;
    }
    debug!(
        templates = set.templates.len(),
        script_tokens = compiler.script.len(),
        "catalog compiled"
    );
    Catalog::assemble(
        compiler.script,
        compiler.templates,
        compiler.resets,
        compiler.constants,
        compiler.int_defaults,
        compiler.long_defaults,
        compiler.bytes_initials,
        64,
        64,
        0,
    )
}

#[derive(Default)]
struct Compiler {
    script: Vec<PackedToken>,
    templates: Vec<TemplateEntry>,
    resets: Vec<Vec<ResetEntry>>,
    constants: Vec<Vec<u8>>,
    int_defaults: Vec<(u32, i32)>,
    long_defaults: Vec<(u32, i64)>,
    bytes_initials: Vec<(u32, u32)>,
    int_slots: HashMap<(String, String), u32>,
    long_slots: HashMap<(String, String), u32>,
    bytes_slots: HashMap<(String, String), u32>,
    const_lookup: HashMap<Vec<u8>, u32>,
}

impl Compiler {
    fn compile_template(&mut self, template: &TemplateDef) -> Result<()> {
        let dict = match &template.dictionary {
            DictionaryScope::Global => "global".to_string(),
            DictionaryScope::Template => format!("template:{}", template.name),
            DictionaryScope::Named(name) => {
                if name == "global" || name.starts_with("template:") {
                    return Err(CatalogError::DictionaryCollision { name: name.clone() }.into());
                }
                name.clone()
            }
        };
        let collect_resets = template.dictionary == DictionaryScope::Template;
        let start = self.script.len() as u32;
        let mut resets = Vec::new();

        let open_pos = self.script.len();
        self.script
            .push(Token::group(group_flags::TEMPLATE | group_flags::PMAP, false, 0).pack());
        let mut ctx = TemplateContext {
            dict,
            collect_resets,
            resets: &mut resets,
        };
        for field in &template.fields {
            self.compile_field(field, &mut ctx)?;
        }
        let close_pos = self.script.len();
        let distance = (close_pos - open_pos) as u32;
        self.script.push(
            Token::group(
                group_flags::TEMPLATE | group_flags::PMAP | group_flags::CLOSE,
                false,
                distance,
            )
            .pack(),
        );
        self.script[open_pos] =
            Token::group(group_flags::TEMPLATE | group_flags::PMAP, false, distance).pack();

        self.templates.push(TemplateEntry {
            id: template.id,
            start,
            limit: self.script.len() as u32,
        });
        self.resets.push(resets);
        Ok(())
    }

    fn compile_field(&mut self, field: &FieldDef, ctx: &mut TemplateContext<'_>) -> Result<()> {
        match &field.kind {
            FieldKind::UInt32 => self.scalar(field, TypeTag::UInt32, &field.operator, ctx),
            FieldKind::Int32 => self.scalar(field, TypeTag::Int32, &field.operator, ctx),
            FieldKind::UInt64 => self.scalar(field, TypeTag::UInt64, &field.operator, ctx),
            FieldKind::Int64 => self.scalar(field, TypeTag::Int64, &field.operator, ctx),
            FieldKind::Ascii => self.text(field, TypeTag::AsciiText, ctx),
            FieldKind::Unicode => self.text(field, TypeTag::UnicodeText, ctx),
            FieldKind::ByteVector => self.text(field, TypeTag::ByteVector, ctx),
            FieldKind::Decimal { exponent, mantissa } => {
                validate_int_operator(&field.name, exponent)?;
                validate_int_operator(&field.name, mantissa)?;
                if exponent.op == OpTag::Default && !field.optional && exponent.value.is_none() {
                    return Err(CatalogError::DefaultWithoutValue {
                        name: field.name.clone(),
                    }
                    .into());
                }
                let exp_slot = self.int_slot(
                    ctx,
                    &field.name,
                    parse_i64(exponent.value.as_deref()).map(|v| v as i32),
                )?;
                self.script.push(
                    Token::field(TypeTag::DecimalExponent, exponent.op, field.optional, exp_slot)
                        .pack(),
                );
                let mant_slot = self.long_slot(
                    ctx,
                    &field.name,
                    parse_i64(mantissa.value.as_deref()),
                )?;
                self.script.push(
                    Token::field(TypeTag::DecimalMantissa, mantissa.op, false, mant_slot).pack(),
                );
                Ok(())
            }
            FieldKind::Sequence {
                length_name,
                length_op,
                body,
                ..
            } => {
                validate_int_operator(length_name, length_op)?;
                let length_slot = self.int_slot(
                    ctx,
                    length_name,
                    parse_i64(length_op.value.as_deref()).map(|v| v as i32),
                )?;
                self.script.push(
                    Token::field(TypeTag::GroupLength, length_op.op, field.optional, length_slot)
                        .pack(),
                );
                let flags = if body_pmap_bits(body) > 0 {
                    group_flags::SEQUENCE | group_flags::PMAP
                } else {
                    group_flags::SEQUENCE
                };
                self.nested_group(flags, body, ctx)
            }
            FieldKind::Group { body } => {
                let flags = if body_pmap_bits(body) > 0 {
                    group_flags::PMAP
                } else {
                    0
                };
                self.nested_group(flags, body, ctx)
            }
        }
    }

    fn nested_group(
        &mut self,
        flags: u32,
        body: &[FieldDef],
        ctx: &mut TemplateContext<'_>,
    ) -> Result<()> {
        let open_pos = self.script.len();
        self.script.push(Token::group(flags, false, 0).pack());
        for field in body {
            self.compile_field(field, ctx)?;
        }
        let distance = (self.script.len() - open_pos) as u32;
        self.script
            .push(Token::group(flags | group_flags::CLOSE, false, distance).pack());
        self.script[open_pos] = Token::group(flags, false, distance).pack();
        Ok(())
    }

    fn scalar(
        &mut self,
        field: &FieldDef,
        tag: TypeTag,
        op: &OperatorDef,
        ctx: &mut TemplateContext<'_>,
    ) -> Result<()> {
        validate_int_operator(&field.name, op)?;
        if op.op == OpTag::Constant && op.value.is_none() {
            return Err(CatalogError::MissingAttribute {
                name: field.name.clone(),
                attribute: "value".to_string(),
            }
            .into());
        }
        if op.op == OpTag::Default && !field.optional && op.value.is_none() {
            return Err(CatalogError::DefaultWithoutValue {
                name: field.name.clone(),
            }
            .into());
        }
        let initial = parse_i64(op.value.as_deref());
        let slot = if tag.is_long_class() {
            self.long_slot(ctx, &field.name, initial)?
        } else {
            self.int_slot(ctx, &field.name, initial.map(|v| v as i32))?
        };
        self.script
            .push(Token::field(tag, op.op, field.optional, slot).pack());
        Ok(())
    }

    fn text(
        &mut self,
        field: &FieldDef,
        tag: TypeTag,
        ctx: &mut TemplateContext<'_>,
    ) -> Result<()> {
        let op = &field.operator;
        if op.op == OpTag::Increment {
            return Err(CatalogError::InvalidOperator {
                operator: "increment".to_string(),
                name: field.name.clone(),
            }
            .into());
        }
        if op.op == OpTag::Constant && op.value.is_none() {
            return Err(CatalogError::MissingAttribute {
                name: field.name.clone(),
                attribute: "value".to_string(),
            }
            .into());
        }
        if op.op == OpTag::Default && !field.optional && op.value.is_none() {
            return Err(CatalogError::DefaultWithoutValue {
                name: field.name.clone(),
            }
            .into());
        }
        let initial = op.value.as_ref().map(|v| self.intern_constant(v.as_bytes()));
        let slot = self.bytes_slot(ctx, &field.name, initial)?;
        self.script
            .push(Token::field(tag, op.op, field.optional, slot).pack());
        Ok(())
    }

    fn intern_constant(&mut self, bytes: &[u8]) -> u32 {
        if let Some(&idx) = self.const_lookup.get(bytes) {
            return idx;
        }
        let idx = self.constants.len() as u32;
        self.constants.push(bytes.to_vec());
        self.const_lookup.insert(bytes.to_vec(), idx);
        idx
    }

    fn int_slot(
        &mut self,
        ctx: &mut TemplateContext<'_>,
        key: &str,
        initial: Option<i32>,
    ) -> Result<u32> {
        let map_key = (ctx.dict.clone(), key.to_string());
        if let Some(&slot) = self.int_slots.get(&map_key) {
            return Ok(slot);
        }
        let slot = self.int_slots.len() as u32;
        self.int_slots.insert(map_key, slot);
        if let Some(value) = initial {
            self.int_defaults.push((slot, value));
        }
        if ctx.collect_resets {
            ctx.resets.push(ResetEntry {
                kind: ResetKind::Int,
                slot,
                value: i64::from(initial.unwrap_or(0)),
            });
        }
        Ok(slot)
    }

    fn long_slot(
        &mut self,
        ctx: &mut TemplateContext<'_>,
        key: &str,
        initial: Option<i64>,
    ) -> Result<u32> {
        let map_key = (ctx.dict.clone(), key.to_string());
        if let Some(&slot) = self.long_slots.get(&map_key) {
            return Ok(slot);
        }
        let slot = self.long_slots.len() as u32;
        self.long_slots.insert(map_key, slot);
        if let Some(value) = initial {
            self.long_defaults.push((slot, value));
        }
        if ctx.collect_resets {
            ctx.resets.push(ResetEntry {
                kind: ResetKind::Long,
                slot,
                value: initial.unwrap_or(0),
            });
        }
        Ok(slot)
    }

    fn bytes_slot(
        &mut self,
        ctx: &mut TemplateContext<'_>,
        key: &str,
        initial: Option<u32>,
    ) -> Result<u32> {
        let map_key = (ctx.dict.clone(), key.to_string());
        if let Some(&slot) = self.bytes_slots.get(&map_key) {
            return Ok(slot);
        }
        let slot = self.bytes_slots.len() as u32;
        self.bytes_slots.insert(map_key, slot);
        if let Some(const_index) = initial {
            self.bytes_initials.push((slot, const_index));
        }
        if ctx.collect_resets {
            ctx.resets.push(ResetEntry {
                kind: ResetKind::Bytes,
                slot,
                value: initial.map_or(-1, i64::from),
            });
        }
        Ok(slot)
    }
}

struct TemplateContext<'a> {
    dict: String,
    collect_resets: bool,
    resets: &'a mut Vec<ResetEntry>,
}

fn parse_i64(value: Option<&str>) -> Option<i64> {
    value.and_then(|v| v.trim().parse().ok())
}

fn validate_int_operator(name: &str, op: &OperatorDef) -> Result<()> {
    if op.op == OpTag::Tail {
        return Err(CatalogError::InvalidOperator {
            operator: "tail".to_string(),
            name: name.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Direct presence-map bits a group body consumes (nested groups keep their
/// own maps; a sequence's length bit belongs to the enclosing group).
fn body_pmap_bits(body: &[FieldDef]) -> u32 {
    let mut bits = 0;
    for field in body {
        match &field.kind {
            FieldKind::Decimal { exponent, mantissa } => {
                bits += u32::from(exponent.op.consumes_pmap_bit(field.optional));
                bits += u32::from(mantissa.op.consumes_pmap_bit(false));
            }
            FieldKind::Sequence { length_op, .. } => {
                bits += u32::from(length_op.op.consumes_pmap_bit(field.optional));
            }
            FieldKind::Group { .. } => {}
            _ => bits += u32::from(field.operator.op.consumes_pmap_bit(field.optional)),
        }
    }
    bits
}
