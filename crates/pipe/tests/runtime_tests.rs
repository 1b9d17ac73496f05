//! Integration tests for the pipe runtime
//!
//! Exercises the runtime through its public API with separate producer and
//! consumer threads, the way a transfer completion path and a protocol client
//! use it.
//!
//! Run with: `cargo test -p pipe --test runtime_tests`

use pipe::{INFINITE, PipeConfig, PipeError, PipeOptions, QueueStats, Timeout, UsbPipe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn config(options: PipeOptions) -> PipeConfig {
    PipeConfig {
        buffer_size: 64,
        queue_capacity: 8,
        element_size: 4,
        options,
    }
}

#[test]
fn test_byte_stream_accumulates_short_deliveries() {
    let pipe = Arc::new(UsbPipe::new(config(PipeOptions::BYTE_STREAM)).unwrap());

    let producer = {
        let pipe = pipe.clone();
        thread::spawn(move || {
            pipe.write_packet(&[1, 2, 3]).unwrap();
            thread::sleep(Duration::from_millis(20));
            pipe.write_packet(&[4, 5, 6, 7, 8]).unwrap();
        })
    };

    let mut packet = [0u8; 8];
    pipe.read_packet(&mut packet, Timeout::from(INFINITE)).unwrap();
    assert_eq!(packet, [1, 2, 3, 4, 5, 6, 7, 8]);
    producer.join().unwrap();
}

#[test]
fn test_byte_stream_immediate_read_on_empty() {
    let pipe = UsbPipe::new(config(PipeOptions::BYTE_STREAM)).unwrap();

    let mut packet = [0u8; 4];
    let start = Instant::now();
    let result = pipe.read_packet(&mut packet, Timeout::from(0u16));
    assert!(matches!(result, Err(PipeError::Empty)));
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_byte_stream_timeout_then_resume() {
    let pipe = UsbPipe::new(config(PipeOptions::BYTE_STREAM)).unwrap();
    pipe.write_packet(&[9, 8]).unwrap();

    let mut packet = [0u8; 4];
    let result = pipe.read_packet(&mut packet, Timeout::millis(20));
    assert!(matches!(result, Err(PipeError::Empty)));

    pipe.write_packet(&[7, 6]).unwrap();
    pipe.read_packet(&mut packet, Timeout::millis(1000)).unwrap();
    assert_eq!(packet, [9, 8, 7, 6]);
}

#[test]
fn test_queue_runtime_consumer_thread() {
    let pipe = Arc::new(UsbPipe::new(config(PipeOptions::RX_QUEUE)).unwrap());

    let consumer = {
        let pipe = pipe.clone();
        thread::spawn(move || {
            (0..4u8)
                .map(|_| pipe.dequeue_element(Timeout::Infinite).unwrap())
                .collect::<Vec<_>>()
        })
    };

    // One completed transfer carrying four elements
    let transfer: Vec<u8> = (0..16u8).collect();
    assert_eq!(pipe.deliver(&transfer).unwrap(), 4);

    let elements = consumer.join().unwrap();
    assert_eq!(elements[0], vec![0, 1, 2, 3]);
    assert_eq!(elements[3], vec![12, 13, 14, 15]);
    assert_eq!(pipe.queue_len(), 0);
}

#[test]
fn test_outbound_runtime_stages_messages() {
    let mut pipe = UsbPipe::new(config(PipeOptions::TX_QUEUE)).unwrap();
    pipe.configure(2).unwrap();
    assert!(pipe.is_tx());
    assert!(!pipe.uses_byte_stream());

    pipe.enqueue(&[0xAA; 4]).unwrap();
    let mut out = [0u8; 4];
    pipe.dequeue(&mut out, Timeout::Immediate).unwrap();
    assert_eq!(out, [0xAA; 4]);
}

#[test]
fn test_queue_stats_snapshot() {
    let pipe = UsbPipe::new(config(PipeOptions::RX_QUEUE)).unwrap();
    for n in 0..10u8 {
        let _ = pipe.enqueue(&[n; 4]);
    }

    assert_eq!(
        pipe.queue_stats(),
        QueueStats {
            capacity: 8,
            element_size: 4,
            used: 8,
            overflow: true,
            overflow_counter: 2,
        }
    );

    pipe.reset_queue().unwrap();
    let stats = pipe.queue_stats();
    assert_eq!(stats.used, 0);
    assert!(!stats.overflow);
    assert_eq!(stats.overflow_counter, 0);
}

#[test]
fn test_invalid_geometry_rejected() {
    let zero_queue = UsbPipe::new(PipeConfig {
        queue_capacity: 0,
        ..config(PipeOptions::RX_QUEUE)
    });
    assert!(matches!(zero_queue, Err(PipeError::IllegalParameter(_))));

    let zero_buffer = UsbPipe::new(PipeConfig {
        buffer_size: 0,
        ..config(PipeOptions::RX_QUEUE)
    });
    assert!(matches!(zero_buffer, Err(PipeError::IllegalParameter(_))));

    let huge = UsbPipe::new(PipeConfig {
        queue_capacity: usize::MAX,
        element_size: 2,
        ..config(PipeOptions::RX_QUEUE)
    });
    assert!(matches!(huge, Err(PipeError::Resource(_))));
}

#[test]
fn test_wrong_element_size_rejected() {
    let pipe = UsbPipe::new(config(PipeOptions::RX_QUEUE)).unwrap();
    assert!(matches!(
        pipe.enqueue(&[1, 2, 3]),
        Err(PipeError::IllegalParameter(_))
    ));
    let mut short = [0u8; 2];
    assert!(matches!(
        pipe.dequeue(&mut short, Timeout::Immediate),
        Err(PipeError::IllegalParameter(_))
    ));
    assert_eq!(pipe.overflow_counter(), 0);
}
