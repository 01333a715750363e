/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! The decode reactor.
//!
//! Drives the catalog script against a byte source: open-message, fields,
//! sequences, close-message. Fragments are reserved from the ring before any
//! field of the fragment executes and published when the fragment's last
//! token completes, so the reactor only ever suspends at fragment boundaries.
//!
//! Fragment headers carry the fragment's script position; the message-open
//! fragment's header is therefore the template's script start, which doubles
//! as the message index observed by the consumer.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use ferrofast_catalog::Catalog;
use ferrofast_core::{EngineConfig, FastError, Result};
use ferrofast_primitive::{ByteSource, StopBitReader};
use ferrofast_ring::{dual_ring, RingConsumer, RingProducer};
use ferrofast_token::{group_flags, Token, TypeTag};

use crate::decoder::{DecodeTable, FieldDecoder};

/// Outcome of one reactor poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    /// A fragment (message head, sequence iteration, or message tail) was
    /// published to the ring.
    Fragment,
    /// The fragment completing the current message was published.
    MessageComplete,
    /// The source is exhausted; the EOF sentinel was published.
    EndOfStream,
}

#[derive(Debug, Clone, Copy)]
struct SeqFrame {
    open_pos: usize,
    remaining: u32,
}

/// Script-driven decoder: bytes in, ring fragments out.
pub struct DynamicReader<S: ByteSource> {
    catalog: Arc<Catalog>,
    reader: StopBitReader<S>,
    producer: RingProducer,
    decoder: FieldDecoder,
    table: DecodeTable<S>,
    max_var_len: usize,

    cursor: usize,
    limit: usize,
    seq_stack: SmallVec<[SeqFrame; 8]>,
    need_template: bool,
    fragment_open: bool,
    last_template_id: Option<u32>,
    current_template_id: i64,
    message_count: u64,
    preamble: Vec<u8>,
    eof_published: bool,
}

impl<S: ByteSource> DynamicReader<S> {
    /// Creates a reader and the consumer half of its ring.
    ///
    /// # Errors
    /// Configuration validation failures.
    pub fn new(
        catalog: Arc<Catalog>,
        config: &EngineConfig,
        source: S,
    ) -> Result<(Self, RingConsumer)> {
        config.validate()?;
        let (producer, consumer) = dual_ring(config);
        let mut reader = StopBitReader::new(source, config.io_buffer_capacity);
        reader.set_blocking(!config.non_blocking);
        reader.set_shutdown(producer.shutdown_flag());
        let decoder = FieldDecoder::new(&catalog, config);
        let max_var_len = catalog.max_text_len().max(catalog.max_byte_vector_len()) as usize;
        Ok((
            Self {
                catalog,
                reader,
                producer,
                decoder,
                table: DecodeTable::new(),
                max_var_len,
                cursor: 0,
                limit: 0,
                seq_stack: SmallVec::new(),
                need_template: true,
                fragment_open: false,
                last_template_id: None,
                current_template_id: -1,
                message_count: 0,
                preamble: Vec::new(),
                eof_published: false,
            },
            consumer,
        ))
    }

    /// Messages fully decoded so far.
    #[must_use]
    pub const fn messages_decoded(&self) -> u64 {
        self.message_count
    }

    /// The last preamble read, when the catalog declares one.
    #[must_use]
    pub fn preamble(&self) -> &[u8] {
        &self.preamble
    }

    /// Template id of the message currently being decoded, or -1.
    #[must_use]
    pub const fn current_template_id(&self) -> i64 {
        self.current_template_id
    }

    /// Requests cooperative shutdown of both ring sides.
    pub fn shutdown(&self) {
        self.producer.shutdown();
    }

    /// Prepares the reader for a fresh stream on a reset source.
    pub fn reset(&mut self) {
        self.reader.reset();
        self.decoder.reset();
        self.seq_stack.clear();
        self.need_template = true;
        self.fragment_open = false;
        self.last_template_id = None;
        self.current_template_id = -1;
        self.message_count = 0;
        self.eof_published = false;
    }

    /// Decodes until the next fragment boundary.
    ///
    /// # Errors
    /// Fatal protocol errors abandon the open fragment, publish the EOF
    /// sentinel downstream, and carry the template id and script cursor.
    pub fn poll(&mut self) -> Result<ReadEvent> {
        if self.eof_published {
            return Ok(ReadEvent::EndOfStream);
        }
        let result = self.poll_inner();
        if let Err(error) = &result {
            if error.is_fatal() {
                self.producer.abandon();
                let _ = self.producer.publish_eof();
                self.eof_published = true;
            }
            return Err(error
                .clone()
                .with_position(self.current_template_id, self.cursor as i32));
        }
        result
    }

    fn poll_inner(&mut self) -> Result<ReadEvent> {
        if self.need_template {
            if self.producer.is_shutdown() {
                self.producer.abandon();
                self.producer.publish_eof()?;
                self.eof_published = true;
                return Err(FastError::Shutdown);
            }
            if self.reader.is_at_end()? {
                self.producer.publish_eof()?;
                self.eof_published = true;
                debug!(messages = self.message_count, "source exhausted");
                return Ok(ReadEvent::EndOfStream);
            }
            self.open_message()?;
        }
        self.step()
    }

    /// Reads the preamble and template id, resets dictionaries, and opens the
    /// message fragment.
    fn open_message(&mut self) -> Result<()> {
        let preamble_bytes = self.catalog.preamble_bytes() as usize;
        if preamble_bytes > 0 {
            let mut preamble = std::mem::take(&mut self.preamble);
            self.reader.read_bytes_into(preamble_bytes, &mut preamble)?;
            self.preamble = preamble;
        }
        self.reader
            .open_pmap(self.catalog.max_template_pmap_bytes() as usize)?;
        let template_id = if self.reader.pop_pmap_bit()? == 1 {
            self.reader.read_u64()? as u32
        } else {
            self.last_template_id.ok_or_else(|| {
                FastError::violation(
                    "template id presence bit clear with no previous template",
                    self.reader.total_consumed(),
                )
            })?
        };
        let start = self.catalog.template_start(template_id).ok_or_else(|| {
            FastError::violation(
                format!("unknown template id {template_id}"),
                self.reader.total_consumed(),
            )
        })? as usize;
        let limit = self
            .catalog
            .template_limit(template_id)
            .unwrap_or(start as u32) as usize;

        if let Some(index) = self.catalog.template_index(template_id) {
            let resets: Vec<_> = self.catalog.resets_of(index).to_vec();
            for entry in &resets {
                self.decoder.apply_reset(entry);
            }
        }

        self.current_template_id = i64::from(template_id);
        self.last_template_id = Some(template_id);
        self.cursor = start;
        self.limit = limit;
        trace!(template_id, start, limit, "message open");

        self.reserve_and_begin(start, true)?;
        self.cursor = start + 1;
        self.need_template = false;
        Ok(())
    }

    fn reserve_and_begin(&mut self, pos: usize, with_preamble: bool) -> Result<()> {
        let preamble_slots = if with_preamble {
            self.catalog.preamble_slots()
        } else {
            0
        };
        let slots = self.catalog.fragment_slots(pos) + preamble_slots;
        let blob = self.catalog.fragment_var_fields(pos) * self.max_var_len;
        self.producer.reserve(slots, blob)?;
        self.producer.begin_fragment(pos as i32);
        if with_preamble {
            for chunk in self.preamble.chunks(4) {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                self.producer.write_int(i32::from_le_bytes(word));
            }
        }
        self.fragment_open = true;
        Ok(())
    }

    /// Executes tokens until the current fragment closes.
    fn step(&mut self) -> Result<ReadEvent> {
        loop {
            if !self.fragment_open {
                self.reserve_and_begin(self.cursor, false)?;
            }
            let packed = self.catalog.full_script()[self.cursor];
            let token = Token::unpack(packed).ok_or_else(|| {
                FastError::violation("corrupt script token", self.reader.total_consumed())
            })?;
            match token.kind {
                TypeTag::Group => {
                    if let Some(event) = self.group_token(token)? {
                        return Ok(event);
                    }
                }
                TypeTag::GroupLength => {
                    self.table.dispatch(
                        &mut self.decoder,
                        token,
                        &mut self.reader,
                        &mut self.producer,
                    )?;
                    let count = self.decoder.last_int().unwrap_or(0) as u32;
                    self.producer.end_fragment();
                    self.fragment_open = false;
                    self.cursor += 1; // the sequence-open group token
                    if count == 0 {
                        let distance =
                            self.catalog.full_script()[self.cursor].instance() as usize;
                        self.cursor += distance + 1;
                    } else {
                        self.seq_stack.push(SeqFrame {
                            open_pos: self.cursor,
                            remaining: count,
                        });
                    }
                    return Ok(ReadEvent::Fragment);
                }
                TypeTag::DecimalExponent => {
                    self.table.dispatch(
                        &mut self.decoder,
                        token,
                        &mut self.reader,
                        &mut self.producer,
                    )?;
                    if self.decoder.take_last_null() {
                        // Null decimal: the mantissa subfield is skipped.
                        self.producer.write_long(self.decoder.absent_long());
                        self.cursor += 2;
                    } else {
                        self.cursor += 1;
                    }
                }
                TypeTag::Dictionary => {
                    self.cursor += 1;
                }
                _ => {
                    self.table.dispatch(
                        &mut self.decoder,
                        token,
                        &mut self.reader,
                        &mut self.producer,
                    )?;
                    self.cursor += 1;
                }
            }
        }
    }

    /// Handles one group token; returns the event that ends this poll, if
    /// any.
    fn group_token(&mut self, token: Token) -> Result<Option<ReadEvent>> {
        let pos = self.cursor;
        let pmap_bytes = self.catalog.group_pmap_bytes(pos) as usize;
        if token.op & group_flags::CLOSE == 0 {
            // Open: message-open is handled by open_message, so this is a
            // sequence iteration or a static group.
            if pmap_bytes > 0 {
                self.reader.open_pmap(pmap_bytes)?;
            }
            self.cursor += 1;
            return Ok(None);
        }
        if token.op & group_flags::TEMPLATE != 0 {
            self.reader.close_pmap()?;
            self.producer.end_fragment();
            self.fragment_open = false;
            self.need_template = true;
            self.message_count += 1;
            self.current_template_id = -1;
            return Ok(Some(ReadEvent::MessageComplete));
        }
        if token.op & group_flags::SEQUENCE != 0 {
            if pmap_bytes > 0 {
                self.reader.close_pmap()?;
            }
            self.producer.end_fragment();
            self.fragment_open = false;
            let frame = self.seq_stack.last_mut().ok_or_else(|| {
                FastError::violation(
                    "sequence close without an open sequence",
                    self.reader.total_consumed(),
                )
            })?;
            frame.remaining -= 1;
            if frame.remaining > 0 {
                self.cursor = frame.open_pos;
            } else {
                self.seq_stack.pop();
                self.cursor += 1;
            }
            return Ok(Some(ReadEvent::Fragment));
        }
        // Static group close.
        if pmap_bytes > 0 {
            self.reader.close_pmap()?;
        }
        self.cursor += 1;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrofast_catalog::build_catalog;
    use ferrofast_primitive::SliceSource;

    const XML: &str = r#"
<templates>
  <template name="Tick" id="3">
    <uInt32 name="Seq"><increment value="1"/></uInt32>
    <uInt64 name="Px"><delta/></uInt64>
  </template>
</templates>
"#;

    /// Hand-encoded stream: two Tick messages.
    ///
    /// Message pmap bits: template-id, Seq-increment. Message one carries the
    /// id and a fresh Seq; message two reuses both.
    fn stream() -> Vec<u8> {
        vec![
            0b1110_0000, // msg 1 pmap: id present, seq present
            0x83,        // template id 3
            0x85,        // Seq = 5
            0x87,        // Px delta +7 -> 7
            // msg 2: id reused, seq incremented
            0b1000_0000, // pmap: both clear
            0xFE,        // Px delta -2 -> 5
        ]
    }

    #[test]
    fn test_decode_two_messages() {
        let catalog = Arc::new(build_catalog(XML).unwrap());
        let config = EngineConfig::new(8, 8);
        let bytes = stream();
        let (mut reader, mut consumer) =
            DynamicReader::new(catalog, &config, SliceSource::new(&bytes)).unwrap();

        assert_eq!(reader.poll().unwrap(), ReadEvent::MessageComplete);
        assert_eq!(reader.poll().unwrap(), ReadEvent::MessageComplete);
        assert_eq!(reader.poll().unwrap(), ReadEvent::EndOfStream);
        assert_eq!(reader.messages_decoded(), 2);

        // msg 1: header 0, Seq 5, Px 7
        assert!(consumer.try_read_fragment(5));
        assert_eq!(consumer.read_int(), 0);
        assert_eq!(consumer.read_int(), 5);
        assert_eq!(consumer.read_long(), 7);
        consumer.release_read();
        // msg 2: Seq 6, Px 5
        assert!(consumer.try_read_fragment(5));
        assert_eq!(consumer.read_int(), 0);
        assert_eq!(consumer.read_int(), 6);
        assert_eq!(consumer.read_long(), 5);
        consumer.release_read();
        // EOF sentinel
        assert!(consumer.try_read_fragment(2));
        assert!(RingConsumer::is_eof_header(consumer.read_int()));
    }

    #[test]
    fn test_truncated_stream_reports_position() {
        let catalog = Arc::new(build_catalog(XML).unwrap());
        let config = EngineConfig::new(8, 8);
        let bytes = &stream()[..3];
        let (mut reader, _consumer) =
            DynamicReader::new(catalog, &config, SliceSource::new(bytes)).unwrap();
        let error = reader.poll().unwrap_err();
        match error {
            FastError::UnexpectedEndOfStream(ctx) => {
                assert_eq!(ctx.template_id, 3);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_template_id() {
        let catalog = Arc::new(build_catalog(XML).unwrap());
        let config = EngineConfig::new(8, 8);
        let bytes = [0b1100_0000u8, 0x99 | 0x80];
        let (mut reader, _consumer) =
            DynamicReader::new(catalog, &config, SliceSource::new(&bytes)).unwrap();
        assert!(matches!(
            reader.poll(),
            Err(FastError::ProtocolViolation { .. })
        ));
    }
}
