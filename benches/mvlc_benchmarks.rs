// ABOUTME: Throughput microbenchmarks for the frame codec, readout parser, and ETH
// ABOUTME: throttle curve — the hot paths a background reader/worker thread runs continuously.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use mvlc_core::eth_throttle::{throttle_exponential, EthThrottleConfig};
use mvlc_core::frame::{self, FrameFlags, FrameType};
use mvlc_core::readout_parser::{
    GroupReadoutStructure, ReadoutParserCallbacks, ReadoutParserCounters, ReadoutParserState,
};

fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    group.bench_function("encode_stack_frame", |b| {
        b.iter(|| {
            black_box(frame::encode(
                black_box(FrameType::StackFrame),
                black_box(FrameFlags::default()),
                black_box(3),
                black_box(0),
                black_box(64),
            ))
        })
    });

    let header = frame::encode(FrameType::StackFrame, FrameFlags::default(), 3, 0, 64);
    group.bench_function("decode_stack_frame", |b| {
        b.iter(|| black_box(frame::decode(black_box(header))))
    });

    group.bench_function("is_known_header", |b| {
        b.iter(|| black_box(frame::is_known_header(black_box(header))))
    });

    group.finish();
}

struct NullCallbacks;
impl ReadoutParserCallbacks for NullCallbacks {}

/// One stack, two groups: a small fixed-length module followed by a
/// block-transfer module, each producing one complete event per stack frame.
fn single_stack_two_group_structure() -> Vec<Vec<GroupReadoutStructure>> {
    vec![vec![
        GroupReadoutStructure {
            prefix_len: 2,
            has_dynamic: false,
            suffix_len: 0,
        },
        GroupReadoutStructure {
            prefix_len: 0,
            has_dynamic: true,
            suffix_len: 1,
        },
    ]]
}

/// Builds a USB readout buffer containing `event_count` complete stack
/// frames matching `single_stack_two_group_structure`: 2 prefix words, a
/// nested `BlockRead` frame of 16 words, then 1 suffix word.
fn build_usb_buffer(event_count: usize) -> Vec<u32> {
    let mut words = Vec::new();
    for _ in 0..event_count {
        let block_len = 16u16;
        let stack_len = 2 /* prefix */ + 1 /* block header */ + block_len + 1 /* suffix */;
        words.push(frame::encode(FrameType::StackFrame, FrameFlags::default(), 1, 0, stack_len));
        words.push(0xAAAA_0001);
        words.push(0xAAAA_0002);
        words.push(frame::encode(FrameType::BlockRead, FrameFlags::default(), 1, 0, block_len));
        for i in 0..block_len {
            words.push(0xBBBB_0000 | i as u32);
        }
        words.push(0xCCCC_0001);
    }
    words
}

fn bench_readout_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("readout_parser");
    let buffer = build_usb_buffer(64);

    group.throughput(criterion::Throughput::Elements(64));
    group.bench_function("parse_readout_buffer_usb_64_events", |b| {
        b.iter_batched(
            || ReadoutParserState::new(single_stack_two_group_structure()),
            |mut state| {
                let mut callbacks = NullCallbacks;
                let mut counters = ReadoutParserCounters::default();
                let _ = mvlc_core::readout_parser::parse_readout_buffer_usb(
                    &mut state,
                    &mut callbacks,
                    &mut counters,
                    1,
                    black_box(&buffer),
                );
                black_box(counters);
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_eth_throttle_curve(c: &mut Criterion) {
    let config = EthThrottleConfig::default();
    c.bench_function("eth_throttle_exponential_curve", |b| {
        b.iter(|| {
            for i in 0..=100u32 {
                black_box(throttle_exponential(&config, black_box(i as f64 / 100.0)));
            }
        })
    });
}

criterion_group!(benches, bench_frame_codec, bench_readout_parser, bench_eth_throttle_curve);
criterion_main!(benches);
