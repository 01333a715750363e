/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Value-level round-trip tests: decode(encode(M)) == M.
//!
//! Messages are written into the producer ring field by field, encoded to
//! bytes, decoded back, and every slot compared against the original values.

use std::sync::Arc;

use ferrofast::catalog::Catalog;
use ferrofast::prelude::*;

const XML: &str = r#"
<templates>
  <template name="Trade" id="5">
    <uInt32 name="Seq"><increment value="1"/></uInt32>
    <uInt32 name="Flags" presence="optional"><copy/></uInt32>
    <uInt64 name="OrderId"><delta/></uInt64>
    <decimal name="Price">
      <exponent><default value="-2"/></exponent>
      <mantissa><delta/></mantissa>
    </decimal>
    <decimal name="Yield" presence="optional">
      <exponent><default value="-4"/></exponent>
      <mantissa><delta/></mantissa>
    </decimal>
    <string name="Symbol"><copy/></string>
    <string name="Venue" presence="optional"><default value="XNAS"/></string>
    <byteVector name="Memo" presence="optional"/>
  </template>
</templates>
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Trade {
    seq: i32,
    flags: Option<i32>,
    order_id: i64,
    price: (i32, i64),
    yield_: Option<(i32, i64)>,
    symbol: Vec<u8>,
    venue: Option<Vec<u8>>,
    memo: Option<Vec<u8>>,
}

fn sample_messages() -> Vec<Trade> {
    vec![
        Trade {
            seq: 1,
            flags: Some(3),
            order_id: 9000,
            price: (-2, 1250),
            yield_: None,
            symbol: b"ACME".to_vec(),
            venue: Some(b"XNAS".to_vec()),
            memo: Some(b"first".to_vec()),
        },
        Trade {
            seq: 2,
            flags: Some(3),
            order_id: 9007,
            price: (-2, 1249),
            yield_: Some((-4, 41250)),
            symbol: b"ACME".to_vec(),
            venue: None,
            memo: None,
        },
        Trade {
            seq: 7,
            flags: None,
            order_id: 8999,
            price: (0, 13),
            yield_: Some((-4, 41300)),
            symbol: b"WIDGET".to_vec(),
            venue: Some(b"ARCX".to_vec()),
            memo: Some(b"".to_vec()),
        },
    ]
}

fn write_message(producer: &mut RingProducer, config: &EngineConfig, start: i32, m: &Trade) {
    producer.reserve(32, 64).unwrap();
    producer.begin_fragment(start);
    producer.write_int(m.seq);
    producer.write_int(m.flags.unwrap_or(config.absent_int));
    producer.write_long(m.order_id);
    producer.write_decimal(m.price.0, m.price.1);
    match m.yield_ {
        Some((exp, mant)) => producer.write_decimal(exp, mant),
        None => producer.write_decimal(config.absent_int, config.absent_long),
    }
    producer.write_var_field(&m.symbol);
    match &m.venue {
        Some(venue) => producer.write_var_field(venue),
        None => producer.write_null_var_field(-1),
    }
    match &m.memo {
        Some(memo) => producer.write_var_field(memo),
        None => producer.write_null_var_field(-1),
    }
    producer.end_fragment();
}

fn read_message(
    consumer: &mut RingConsumer,
    catalog: &Catalog,
    config: &EngineConfig,
) -> Trade {
    let bytes = |consumer: &mut RingConsumer| -> Option<Vec<u8>> {
        let (meta, len) = consumer.read_var_meta();
        if len < 0 {
            return None;
        }
        let mut out = Vec::new();
        if meta < 0 {
            out.extend_from_slice(&catalog.constants()[(-meta - 1) as usize]);
        } else {
            consumer.read_bytes_into(meta, len as usize, &mut out);
        }
        Some(out)
    };
    let header = consumer.read_int();
    assert_eq!(header, 0);
    let seq = consumer.read_int();
    let flags = match consumer.read_int() {
        v if v == config.absent_int => None,
        v => Some(v),
    };
    let order_id = consumer.read_long();
    let price = consumer.read_decimal();
    let yield_ = match consumer.read_decimal() {
        (exp, _) if exp == config.absent_int => None,
        pair => Some(pair),
    };
    let symbol = bytes(consumer).expect("symbol is mandatory");
    let venue = bytes(consumer);
    let memo = bytes(consumer);
    consumer.release_read();
    Trade {
        seq,
        flags,
        order_id,
        price,
        yield_,
        symbol,
        venue,
        memo,
    }
}

#[test]
fn test_value_round_trip() {
    let catalog = Arc::new(build_catalog(XML).unwrap());
    let config = EngineConfig::new(10, 10);
    let messages = sample_messages();
    let start = catalog.template_start(5).unwrap() as i32;

    // Encode.
    let (mut producer, consumer) = dual_ring(&config);
    let mut writer =
        DynamicWriter::new(Arc::clone(&catalog), &config, consumer, VecSink::new()).unwrap();
    for message in &messages {
        write_message(&mut producer, &config, start, message);
        loop {
            if writer.poll().unwrap() == WriteEvent::MessageComplete {
                break;
            }
        }
    }
    producer.publish_eof().unwrap();
    while writer.poll().unwrap() != WriteEvent::EndOfStream {}
    let bytes = writer.into_sink().unwrap().into_inner();

    // Decode and compare.
    let (mut reader, mut consumer) =
        DynamicReader::new(Arc::clone(&catalog), &config, SliceSource::new(&bytes)).unwrap();
    let mut decoded = Vec::new();
    loop {
        match reader.poll().unwrap() {
            ReadEvent::MessageComplete => {
                decoded.push(read_message(&mut consumer, &catalog, &config));
            }
            ReadEvent::EndOfStream => break,
            ReadEvent::Fragment => {}
        }
    }
    assert_eq!(decoded, messages);
}

#[test]
fn test_round_trip_twice_is_stable() {
    let catalog = Arc::new(build_catalog(XML).unwrap());
    let config = EngineConfig::new(10, 10);
    let messages = sample_messages();
    let start = catalog.template_start(5).unwrap() as i32;

    let encode = |messages: &[Trade]| -> Vec<u8> {
        let (mut producer, consumer) = dual_ring(&config);
        let mut writer =
            DynamicWriter::new(Arc::clone(&catalog), &config, consumer, VecSink::new()).unwrap();
        for message in messages {
            write_message(&mut producer, &config, start, message);
            loop {
                if writer.poll().unwrap() == WriteEvent::MessageComplete {
                    break;
                }
            }
        }
        producer.publish_eof().unwrap();
        while writer.poll().unwrap() != WriteEvent::EndOfStream {}
        writer.into_sink().unwrap().into_inner()
    };

    let first = encode(&messages);
    let second = encode(&messages);
    assert_eq!(first, second);
}

#[test]
fn test_preamble_passes_through_verbatim() {
    const TICK_XML: &str = r#"
<templates>
  <template name="Tick" id="3">
    <uInt32 name="Seq"><increment value="1"/></uInt32>
    <uInt64 name="Px"><delta/></uInt64>
  </template>
</templates>
"#;
    let mut catalog = build_catalog(TICK_XML).unwrap();
    catalog.set_preamble_bytes(4);
    let catalog = Arc::new(catalog);
    let mut config = EngineConfig::new(10, 10);
    config.preamble_bytes = 4;

    // Two messages, each prefixed by a four-byte preamble.
    let bytes: Vec<u8> = vec![
        b'S', b'E', b'Q', 0x01, // preamble
        0b1110_0000, // pmap: template id and Seq present
        0x83, // template id 3
        0x85, // Seq = 5
        0x87, // Px delta +7
        b'S', b'E', b'Q', 0x02, // preamble
        0b1000_0000, // pmap: both reused
        0xFE, // Px delta -2
    ];

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
    while writer.poll().unwrap() != WriteEvent::EndOfStream {}
    let reencoded = writer.into_sink().unwrap().into_inner();
    assert_eq!(reencoded, bytes);
}
