//! Benchmarks for the pipe data path
//!
//! Measures the cost of staging received data:
//! - Single element enqueue/dequeue
//! - Delivery of a full bulk transfer into the queue
//! - Byte stream write/read of CAN-sized packets

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use pipe::{MessageQueue, PipeConfig, PipeOptions, Timeout, UsbPipe};

fn benchmark_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    for element_size in [8usize, 16, 64] {
        let queue = MessageQueue::new(1024, element_size).unwrap();
        let element = vec![0xA5u8; element_size];
        let mut out = vec![0u8; element_size];

        group.throughput(Throughput::Bytes(element_size as u64));
        group.bench_with_input(
            BenchmarkId::new("enqueue_dequeue", element_size),
            &element,
            |b, element| {
                b.iter(|| {
                    queue.enqueue(black_box(element)).unwrap();
                    queue.dequeue(&mut out, Timeout::Immediate).unwrap();
                })
            },
        );
    }

    group.finish();
}

fn benchmark_deliver(c: &mut Criterion) {
    let mut group = c.benchmark_group("deliver");

    // One high-speed bulk packet of 8-byte CAN frames
    let transfer = vec![0x5Au8; 512];
    let pipe = UsbPipe::new(PipeConfig {
        buffer_size: 512,
        queue_capacity: 256,
        element_size: 8,
        options: PipeOptions::RX_QUEUE,
    })
    .unwrap();

    group.throughput(Throughput::Bytes(transfer.len() as u64));
    group.bench_function("queue_512_bytes", |b| {
        b.iter(|| {
            pipe.deliver(black_box(&transfer)).unwrap();
            pipe.reset_queue().unwrap();
        })
    });

    group.finish();
}

fn benchmark_byte_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("byte_stream");

    let pipe = UsbPipe::new(PipeConfig {
        buffer_size: 64,
        queue_capacity: 1,
        element_size: 1,
        options: PipeOptions::BYTE_STREAM,
    })
    .unwrap();
    let packet = [0x11u8; 16];
    let mut out = [0u8; 16];

    group.throughput(Throughput::Bytes(packet.len() as u64));
    group.bench_function("write_read_16_bytes", |b| {
        b.iter(|| {
            pipe.write_packet(black_box(&packet)).unwrap();
            pipe.read_packet(&mut out, Timeout::Immediate).unwrap();
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_queue,
    benchmark_deliver,
    benchmark_byte_stream
);
criterion_main!(benches);
