/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 27/1/26
******************************************************************************/

//! Cross-thread FIFO tests for the dual ring.

use std::thread;

use ferrofast::prelude::*;

/// One producer and one consumer on separate threads: a million minimal
/// fragments arrive complete, in order, with no lost slots.
#[test]
fn test_spsc_million_fragments_in_order() {
    const COUNT: i32 = 1_000_000;
    let config = EngineConfigBuilder::new().rings(7, 6).build().unwrap();
    let (mut producer, mut consumer) = dual_ring(&config);

    let handle = thread::spawn(move || {
        for i in 0..COUNT {
            producer.reserve(3, 0).unwrap();
            producer.begin_fragment(i & 0x3FFF);
            producer.write_int(i);
            producer.end_fragment();
        }
        producer.publish_eof().unwrap();
    });

    let mut received = 0i32;
    loop {
        if !consumer.try_read_fragment(2) {
            std::thread::yield_now();
            continue;
        }
        let header = consumer.read_int();
        if RingConsumer::is_eof_header(header) {
            consumer.release_read();
            break;
        }
        assert_eq!(header, received & 0x3FFF);
        assert_eq!(consumer.read_int(), received);
        consumer.release_read();
        received += 1;
    }
    assert_eq!(received, COUNT);
    handle.join().unwrap();
}

/// Batched publish/release across threads still delivers every fragment.
#[test]
fn test_spsc_batched_publish_delivers_all() {
    const COUNT: i32 = 100_000;
    let config = EngineConfigBuilder::new()
        .rings(9, 6)
        .batching(8, 4)
        .build()
        .unwrap();
    let (mut producer, mut consumer) = dual_ring(&config);

    let handle = thread::spawn(move || {
        for i in 0..COUNT {
            producer.reserve(3, 0).unwrap();
            producer.begin_fragment(7);
            producer.write_int(i);
            producer.end_fragment();
        }
        producer.publish_eof().unwrap();
    });

    let mut received = 0i32;
    loop {
        if !consumer.try_read_fragment(2) {
            std::thread::yield_now();
            continue;
        }
        let header = consumer.read_int();
        if RingConsumer::is_eof_header(header) {
            consumer.release_read();
            break;
        }
        assert_eq!(header, 7);
        assert_eq!(consumer.read_int(), received);
        consumer.release_read();
        received += 1;
    }
    assert_eq!(received, COUNT);
    handle.join().unwrap();
}

/// Variable-length payloads cross threads intact, in order.
#[test]
fn test_spsc_blob_payloads() {
    const COUNT: i32 = 50_000;
    let config = EngineConfigBuilder::new().rings(8, 10).build().unwrap();
    let (mut producer, mut consumer) = dual_ring(&config);

    let handle = thread::spawn(move || {
        let mut payload = [0u8; 16];
        for i in 0..COUNT {
            payload[..4].copy_from_slice(&i.to_le_bytes());
            let len = 4 + (i as usize % 13);
            producer.reserve(4, len).unwrap();
            producer.begin_fragment(1);
            producer.write_var_field(&payload[..len]);
            producer.end_fragment();
        }
        producer.publish_eof().unwrap();
    });

    let mut out = Vec::new();
    let mut received = 0i32;
    loop {
        if !consumer.try_read_fragment(2) {
            std::thread::yield_now();
            continue;
        }
        let header = consumer.read_int();
        if RingConsumer::is_eof_header(header) {
            consumer.release_read();
            break;
        }
        let (meta, len) = consumer.read_var_meta();
        assert_eq!(len as usize, 4 + (received as usize % 13));
        consumer.read_bytes_into(meta, len as usize, &mut out);
        assert_eq!(&out[..4], &received.to_le_bytes());
        consumer.release_read();
        received += 1;
    }
    assert_eq!(received, COUNT);
    handle.join().unwrap();
}
