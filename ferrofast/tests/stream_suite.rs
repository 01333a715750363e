/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! End-to-end stream tests over the example catalog.
//!
//! A deterministic generator fills the ring with messages across all three
//! templates; the dynamic writer encodes them to bytes. The suite then checks
//! that decoding counts the same messages with the expected message indexes,
//! that decode-then-reencode reproduces the byte stream exactly, and that a
//! truncated stream is diagnosed with the template being decoded.

use std::sync::Arc;

use ferrofast::catalog::Catalog;
use ferrofast::prelude::*;
use ferrofast::token::group_flags;

const EXAMPLE_XML: &str = include_str!("fixtures/example_templates.xml");
const MESSAGE_COUNT: usize = 60;

fn config() -> EngineConfig {
    EngineConfigBuilder::new().rings(14, 16).build().unwrap()
}

/// Splitmix-style deterministic generator.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }

    fn chance(&mut self, one_in: u64) -> bool {
        self.below(one_in) == 0
    }

    fn text(&mut self, len: usize, out: &mut Vec<u8>) {
        out.clear();
        for _ in 0..len {
            out.push(b'A' + (self.below(26) as u8));
        }
    }
}

/// Writes one message's fragments the way the decode reactor lays them out:
/// header = fragment script position, fields in script order, sequences
/// split at their group boundaries.
struct Generator {
    catalog: Arc<Catalog>,
    config: EngineConfig,
    rng: Rng,
    text: Vec<u8>,
    max_var: usize,
}

impl Generator {
    fn new(catalog: Arc<Catalog>, config: EngineConfig) -> Self {
        let max_var = catalog.max_text_len().max(catalog.max_byte_vector_len()) as usize;
        Self {
            catalog,
            config,
            rng: Rng(0x5EED_CAFE),
            text: Vec::new(),
            max_var,
        }
    }

    fn reserve_and_begin(&self, producer: &mut RingProducer, pos: usize) {
        let slots = self.catalog.fragment_slots(pos);
        let blob = self.catalog.fragment_var_fields(pos) * self.max_var;
        producer.reserve(slots, blob).unwrap();
        producer.begin_fragment(pos as i32);
    }

    fn generate_message(&mut self, producer: &mut RingProducer, template_id: u32) {
        let start = self.catalog.template_start(template_id).unwrap() as usize;
        let script = self.catalog.full_script().to_vec();
        self.reserve_and_begin(producer, start);
        let mut fragment_open = true;
        let mut cursor = start + 1;
        let mut stack: Vec<(usize, u32)> = Vec::new();
        loop {
            if !fragment_open {
                self.reserve_and_begin(producer, cursor);
                fragment_open = true;
            }
            let token = Token::unpack(script[cursor]).unwrap();
            match token.kind {
                TypeTag::Group => {
                    if token.op & group_flags::CLOSE == 0 {
                        cursor += 1;
                    } else if token.op & group_flags::TEMPLATE != 0 {
                        producer.end_fragment();
                        return;
                    } else if token.op & group_flags::SEQUENCE != 0 {
                        producer.end_fragment();
                        fragment_open = false;
                        let top = stack.last_mut().unwrap();
                        top.1 -= 1;
                        if top.1 > 0 {
                            cursor = top.0;
                        } else {
                            stack.pop();
                            cursor += 1;
                        }
                    } else {
                        cursor += 1;
                    }
                }
                TypeTag::GroupLength => {
                    let count = self.rng.below(4) as u32;
                    producer.write_int(count as i32);
                    producer.end_fragment();
                    fragment_open = false;
                    cursor += 1;
                    if count == 0 {
                        cursor += script[cursor].instance() as usize + 1;
                    } else {
                        stack.push((cursor, count));
                    }
                }
                TypeTag::DecimalExponent => {
                    if token.optional && self.rng.chance(4) {
                        producer.write_int(self.config.absent_int);
                        producer.write_long(self.config.absent_long);
                        cursor += 2;
                    } else {
                        producer.write_int(self.rng.below(7) as i32 - 3);
                        cursor += 1;
                    }
                }
                TypeTag::DecimalMantissa => {
                    producer.write_long(self.rng.below(1 << 40) as i64);
                    cursor += 1;
                }
                TypeTag::Int32 | TypeTag::UInt32 => {
                    if token.optional && self.rng.chance(4) {
                        producer.write_int(self.config.absent_int);
                    } else {
                        producer.write_int(self.rng.below(1 << 24) as i32);
                    }
                    cursor += 1;
                }
                TypeTag::Int64 | TypeTag::UInt64 => {
                    if token.optional && self.rng.chance(4) {
                        producer.write_long(self.config.absent_long);
                    } else {
                        producer.write_long(self.rng.below(1 << 48) as i64);
                    }
                    cursor += 1;
                }
                TypeTag::AsciiText | TypeTag::UnicodeText | TypeTag::ByteVector => {
                    if token.op_tag() == OpTag::Constant {
                        // The declared constant is the only legal value.
                        let slot = token.instance;
                        let const_index = self
                            .catalog
                            .bytes_initials()
                            .iter()
                            .find(|&&(s, _)| s == slot)
                            .map(|&(_, idx)| idx)
                            .unwrap();
                        let len = self.catalog.constants()[const_index as usize].len();
                        producer.write_const_field(const_index, len as i32);
                    } else if token.optional && self.rng.chance(4) {
                        producer.write_null_var_field(-1);
                    } else {
                        // Tail-operator values keep a fixed length so the
                        // suffix replacement stays well-formed.
                        let len = if token.op_tag() == OpTag::Tail {
                            6
                        } else {
                            1 + self.rng.below(8) as usize
                        };
                        let mut text = std::mem::take(&mut self.text);
                        self.rng.text(len, &mut text);
                        producer.write_var_field(&text);
                        self.text = text;
                    }
                    cursor += 1;
                }
                TypeTag::Dictionary => unreachable!("the loader never emits dictionary tokens"),
            }
        }
    }
}

/// Encodes a deterministic multi-template stream; returns the bytes, the
/// template rotation, and each message's end offset in the stream.
fn build_stream() -> (Arc<Catalog>, Vec<u8>, Vec<u32>, Vec<u64>) {
    let catalog = Arc::new(build_catalog(EXAMPLE_XML).unwrap());
    let config = config();
    let (mut producer, consumer) = dual_ring(&config);
    let mut writer =
        DynamicWriter::new(Arc::clone(&catalog), &config, consumer, VecSink::new()).unwrap();
    let mut generator = Generator::new(Arc::clone(&catalog), config);

    // Rotation ends on the refresh template so truncation tests can cut into
    // a message guaranteed to span several bytes.
    let rotation = [2u32, 1, 99, 2, 99, 2, 1, 2, 2, 99, 1, 2];
    let mut templates = Vec::new();
    let mut offsets = Vec::new();
    for i in 0..MESSAGE_COUNT {
        let template_id = rotation[i % rotation.len()];
        templates.push(template_id);
        generator.generate_message(&mut producer, template_id);
        loop {
            match writer.poll().unwrap() {
                WriteEvent::MessageComplete => break,
                WriteEvent::Fragment => {}
                WriteEvent::Idle => {}
                WriteEvent::EndOfStream => panic!("premature end of stream"),
            }
        }
        offsets.push(writer.bytes_written());
    }
    producer.publish_eof().unwrap();
    loop {
        if writer.poll().unwrap() == WriteEvent::EndOfStream {
            break;
        }
    }
    let bytes = writer.into_sink().unwrap().into_inner();
    (catalog, bytes, templates, offsets)
}

/// Consumes every published fragment, returning the headers seen.
fn drain(consumer: &mut RingConsumer, catalog: &Catalog) -> Vec<i32> {
    let mut headers = Vec::new();
    while consumer.try_read_fragment(1) {
        let header = consumer.peek_int(0);
        if RingConsumer::is_eof_header(header) {
            consumer.read_int();
            consumer.release_read();
            headers.push(header);
            break;
        }
        let slots = catalog.fragment_slots(header as usize);
        if !consumer.try_read_fragment(slots) {
            break;
        }
        for _ in 0..slots - 1 {
            consumer.read_int();
        }
        consumer.release_read();
        headers.push(header);
    }
    headers
}

#[test]
fn test_stream_decode_counts_and_message_indexes() {
    let (catalog, bytes, templates, _offsets) = build_stream();
    let config = config();
    let (mut reader, mut consumer) =
        DynamicReader::new(Arc::clone(&catalog), &config, SliceSource::new(&bytes)).unwrap();

    let mut messages = 0usize;
    let mut headers = Vec::new();
    loop {
        let event = reader.poll().unwrap();
        headers.extend(drain(&mut consumer, &catalog));
        match event {
            ReadEvent::MessageComplete => messages += 1,
            ReadEvent::EndOfStream => break,
            ReadEvent::Fragment => {}
        }
    }
    assert_eq!(messages, templates.len());
    assert_eq!(reader.messages_decoded() as usize, templates.len());

    // Message-open fragment headers are the template script starts.
    let starts: Vec<i32> = headers
        .iter()
        .copied()
        .filter(|&h| h >= 0 && catalog.template_at_start(h as u32).is_some())
        .collect();
    assert_eq!(starts.len(), templates.len());
    for (header, template_id) in starts.iter().zip(&templates) {
        assert!([0, 3, 36].contains(header));
        assert_eq!(
            catalog.template_at_start(*header as u32).unwrap().id,
            *template_id
        );
    }

    // Decoding the same stream twice observes the same message count.
    let (mut reader2, mut consumer2) =
        DynamicReader::new(Arc::clone(&catalog), &config, SliceSource::new(&bytes)).unwrap();
    loop {
        let event = reader2.poll().unwrap();
        drain(&mut consumer2, &catalog);
        if event == ReadEvent::EndOfStream {
            break;
        }
    }
    assert_eq!(reader2.messages_decoded(), reader.messages_decoded());
}

#[test]
fn test_stream_reencode_is_byte_identical() {
    let (catalog, bytes, _templates, _offsets) = build_stream();
    let config = config();
    let (mut reader, consumer) =
        DynamicReader::new(Arc::clone(&catalog), &config, SliceSource::new(&bytes)).unwrap();
    let mut writer =
        DynamicWriter::new(Arc::clone(&catalog), &config, consumer, VecSink::new()).unwrap();

    loop {
        let event = reader.poll().unwrap();
        loop {
            match writer.poll().unwrap() {
                WriteEvent::Idle | WriteEvent::EndOfStream => break,
                _ => {}
            }
        }
        if event == ReadEvent::EndOfStream {
            break;
        }
    }
    loop {
        if writer.poll().unwrap() == WriteEvent::EndOfStream {
            break;
        }
    }
    let reencoded = writer.into_sink().unwrap().into_inner();
    assert_eq!(reencoded.len(), bytes.len());
    assert_eq!(reencoded, bytes);
}

#[test]
fn test_truncated_stream_reports_last_template() {
    let (catalog, bytes, templates, offsets) = build_stream();
    let config = config();
    // Cut three bytes into the final message, mid-field by construction.
    let cut = offsets[offsets.len() - 2] as usize + 3;
    let truncated = &bytes[..cut];
    let (mut reader, mut consumer) =
        DynamicReader::new(Arc::clone(&catalog), &config, SliceSource::new(truncated)).unwrap();

    let error = loop {
        match reader.poll() {
            Ok(ReadEvent::EndOfStream) => panic!("truncation was not detected"),
            Ok(_) => {
                drain(&mut consumer, &catalog);
            }
            Err(error) => break error,
        }
    };
    match error {
        FastError::UnexpectedEndOfStream(ctx) => {
            assert_eq!(ctx.template_id, i64::from(*templates.last().unwrap()));
        }
        other => panic!("expected truncation diagnosis, got {other:?}"),
    }
    assert_eq!(reader.messages_decoded() as usize, templates.len() - 1);
}
