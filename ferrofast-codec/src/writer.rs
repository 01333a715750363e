/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! The encode-side script driver, mirror of the decode reactor.
//!
//! Consumes ring fragments tagged with their script position and re-encodes
//! them through the operator dispatch. The message presence map opens with
//! the message-open fragment and closes (and is emitted) at the template
//! close, so a message's bytes reach the sink only when it completes.

use std::sync::Arc;

use tracing::{debug, trace};

use ferrofast_catalog::Catalog;
use ferrofast_core::{EngineConfig, FastError, Result};
use ferrofast_primitive::{ByteSink, StopBitWriter};
use ferrofast_ring::RingConsumer;
use ferrofast_token::{group_flags, Token, TypeTag};

use crate::encoder::{EncodeTable, FieldEncoder};

/// Outcome of one writer poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEvent {
    /// Nothing published in the ring yet.
    Idle,
    /// One fragment was encoded.
    Fragment,
    /// A message was completed and flushed.
    MessageComplete,
    /// The EOF sentinel was consumed; the stream is finished.
    EndOfStream,
}

/// Script-driven encoder: ring fragments in, bytes out.
pub struct DynamicWriter<K: ByteSink> {
    catalog: Arc<Catalog>,
    writer: StopBitWriter<K>,
    consumer: RingConsumer,
    encoder: FieldEncoder,
    table: EncodeTable<K>,
    last_template_id: Option<u32>,
    message_count: u64,
    preamble: Vec<u8>,
    finished: bool,
}

impl<K: ByteSink> DynamicWriter<K> {
    /// Creates a writer over the consumer half of a codec ring.
    ///
    /// # Errors
    /// Configuration validation failures.
    pub fn new(
        catalog: Arc<Catalog>,
        config: &EngineConfig,
        consumer: RingConsumer,
        sink: K,
    ) -> Result<Self> {
        config.validate()?;
        let mut writer = StopBitWriter::new(sink, config.io_buffer_capacity);
        writer.set_shutdown(consumer.shutdown_flag());
        let encoder = FieldEncoder::new(&catalog, config);
        Ok(Self {
            catalog,
            writer,
            consumer,
            encoder,
            table: EncodeTable::new(),
            last_template_id: None,
            message_count: 0,
            preamble: Vec::new(),
            finished: false,
        })
    }

    /// Messages fully encoded so far.
    #[must_use]
    pub const fn messages_encoded(&self) -> u64 {
        self.message_count
    }

    /// Total bytes emitted.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.writer.total_written()
    }

    /// Gives back the sink after flushing.
    ///
    /// # Errors
    /// Flush failures.
    pub fn into_sink(mut self) -> Result<K> {
        self.writer.flush()?;
        Ok(self.writer.into_sink())
    }

    /// Prepares the writer for a fresh stream on a fresh ring.
    pub fn reset(&mut self) {
        self.writer.reset();
        self.encoder.reset();
        self.last_template_id = None;
        self.message_count = 0;
        self.finished = false;
    }

    /// Encodes the next available fragment.
    ///
    /// # Errors
    /// Fatal protocol errors; [`FastError::Shutdown`] on cooperative cancel.
    pub fn poll(&mut self) -> Result<WriteEvent> {
        if self.finished {
            return Ok(WriteEvent::EndOfStream);
        }
        if self.consumer.is_shutdown() {
            return Err(FastError::Shutdown);
        }
        if !self.consumer.try_read_fragment(1) {
            return Ok(WriteEvent::Idle);
        }
        let header = self.consumer.peek_int(0);
        if RingConsumer::is_eof_header(header) {
            self.consumer.read_int();
            self.consumer.release_read();
            self.writer.flush()?;
            self.finished = true;
            debug!(messages = self.message_count, "stream complete");
            return Ok(WriteEvent::EndOfStream);
        }

        let pos = header as usize;
        if pos >= self.catalog.full_script().len() {
            return Err(FastError::violation(
                format!("fragment header {pos} outside the script"),
                self.writer.total_written(),
            ));
        }
        let is_message_open = self.catalog.template_at_start(pos as u32).is_some();
        let mut slots = self.catalog.fragment_slots(pos);
        if is_message_open {
            slots += self.catalog.preamble_slots();
        }
        if !self.consumer.try_read_fragment(slots) {
            return Ok(WriteEvent::Idle);
        }

        self.consumer.read_int();
        if is_message_open {
            self.open_message(pos)?;
        }
        let event = self.encode_fragment(pos, is_message_open);
        match event {
            Ok(event) => {
                self.consumer.release_read();
                Ok(event)
            }
            Err(error) => Err(error.with_position(
                self.last_template_id.map_or(-1, i64::from),
                pos as i32,
            )),
        }
    }

    /// Reads the preamble slots and encodes the message prologue.
    fn open_message(&mut self, start: usize) -> Result<()> {
        let preamble_bytes = self.catalog.preamble_bytes() as usize;
        if preamble_bytes > 0 {
            self.preamble.clear();
            for _ in 0..self.catalog.preamble_slots() {
                let word = self.consumer.read_int().to_le_bytes();
                self.preamble.extend_from_slice(&word);
            }
            self.preamble.truncate(preamble_bytes);
            let preamble = std::mem::take(&mut self.preamble);
            self.writer.write_bytes(&preamble);
            self.preamble = preamble;
        }

        let template = self
            .catalog
            .template_at_start(start as u32)
            .ok_or_else(|| {
                FastError::violation(
                    "message-open fragment without a template",
                    self.writer.total_written(),
                )
            })?;
        let template_id = template.id;
        self.writer
            .open_pmap(self.catalog.max_template_pmap_bytes() as usize);
        if self.last_template_id == Some(template_id) {
            self.writer.write_pmap_bit(false)?;
        } else {
            self.writer.write_pmap_bit(true)?;
            self.writer.write_u64(u64::from(template_id));
        }
        if let Some(index) = self.catalog.template_index(template_id) {
            let resets: Vec<_> = self.catalog.resets_of(index).to_vec();
            for entry in &resets {
                self.encoder.apply_reset(entry);
            }
        }
        self.last_template_id = Some(template_id);
        trace!(template_id, start, "message open");
        Ok(())
    }

    /// Encodes the tokens of one fragment.
    fn encode_fragment(&mut self, pos: usize, is_message_open: bool) -> Result<WriteEvent> {
        let len = self.catalog.fragment_script_len(pos);
        let first = if is_message_open { pos + 1 } else { pos };
        let mut cursor = first;
        let end = pos + len;
        let mut event = WriteEvent::Fragment;
        while cursor < end {
            let packed = self.catalog.full_script()[cursor];
            let token = Token::unpack(packed).ok_or_else(|| {
                FastError::violation("corrupt script token", self.writer.total_written())
            })?;
            match token.kind {
                TypeTag::Group => {
                    let pmap_bytes = self.catalog.group_pmap_bytes(cursor) as usize;
                    if token.op & group_flags::CLOSE == 0 {
                        if pmap_bytes > 0 {
                            self.writer.open_pmap(pmap_bytes);
                        }
                    } else if token.op & group_flags::TEMPLATE != 0 {
                        self.writer.close_pmap()?;
                        self.writer.flush()?;
                        self.message_count += 1;
                        event = WriteEvent::MessageComplete;
                    } else if pmap_bytes > 0 {
                        self.writer.close_pmap()?;
                    }
                    cursor += 1;
                }
                TypeTag::DecimalExponent => {
                    self.table.dispatch(
                        &mut self.encoder,
                        token,
                        &mut self.consumer,
                        &mut self.writer,
                    )?;
                    if self.encoder.take_last_null() {
                        // Null decimal: consume the mantissa slots unsent.
                        self.consumer.read_long();
                        cursor += 2;
                    } else {
                        cursor += 1;
                    }
                }
                TypeTag::Dictionary => {
                    cursor += 1;
                }
                _ => {
                    self.table.dispatch(
                        &mut self.encoder,
                        token,
                        &mut self.consumer,
                        &mut self.writer,
                    )?;
                    cursor += 1;
                }
            }
        }
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{DynamicReader, ReadEvent};
    use ferrofast_catalog::build_catalog;
    use ferrofast_primitive::{SliceSource, VecSink};

    const XML: &str = r#"
<templates>
  <template name="Tick" id="3">
    <uInt32 name="Seq"><increment value="1"/></uInt32>
    <uInt64 name="Px"><delta/></uInt64>
    <string name="Sym"><copy/></string>
  </template>
</templates>
"#;

    fn encode_stream(bytes: &[u8]) -> Vec<u8> {
        let catalog = Arc::new(build_catalog(XML).unwrap());
        let config = EngineConfig::new(10, 10);
        let (mut reader, consumer) =
            DynamicReader::new(Arc::clone(&catalog), &config, SliceSource::new(bytes)).unwrap();
        let mut writer = DynamicWriter::new(catalog, &config, consumer, VecSink::new()).unwrap();
        loop {
            match reader.poll().unwrap() {
                ReadEvent::EndOfStream => break,
                _ => {
                    while !matches!(
                        writer.poll().unwrap(),
                        WriteEvent::Fragment | WriteEvent::MessageComplete
                    ) {}
                }
            }
        }
        loop {
            match writer.poll().unwrap() {
                WriteEvent::EndOfStream => break,
                _ => {}
            }
        }
        writer.into_sink().unwrap().into_inner()
    }

    #[test]
    fn test_reencode_reproduces_bytes() {
        // Two messages exercising increment, delta and copy.
        let original: Vec<u8> = vec![
            // msg 1: pmap [id][seq][sym], all fresh
            0b1111_0000,
            0x83, // id 3
            0x85, // Seq 5
            0x87, // Px +7
            b'A',
            b'B' | 0x80, // Sym "AB"
            // msg 2: reuse id, increment seq, delta px, copy sym
            0b1000_0000,
            0xFE, // Px -2
        ];
        let reencoded = encode_stream(&original);
        assert_eq!(reencoded, original);
    }
}
