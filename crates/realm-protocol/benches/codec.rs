//! Codec benchmarks for realm-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use realm_protocol::codec::{decode_all, encode_into};
use realm_protocol::{Frame, OpcodeTable};

fn table() -> OpcodeTable {
    OpcodeTable::new().fixed(1, 4).u8_prefixed(5).u16_prefixed(6)
}

fn bench_encode_small(c: &mut Criterion) {
    let table = table();
    let frame = Frame::outbound(5, vec![0u8; 64]);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("u8_64B", |b| {
        let mut buf = BytesMut::with_capacity(128);
        b.iter(|| {
            buf.clear();
            encode_into(&table, black_box(&frame), &mut buf).unwrap();
        })
    });
    group.finish();
}

fn bench_decode_stream(c: &mut Criterion) {
    let table = table();
    let mut stream = BytesMut::new();
    for i in 0..256u32 {
        let frame = match i % 3 {
            0 => Frame::outbound(1, vec![0u8; 4]),
            1 => Frame::outbound(5, vec![0u8; 32]),
            _ => Frame::outbound(6, vec![0u8; 512]),
        };
        encode_into(&table, &frame, &mut stream).unwrap();
    }
    let stream = stream.freeze();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("mixed_256_frames", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&stream[..]);
            decode_all(&table, black_box(&mut buf)).unwrap()
        })
    });
    group.bench_function("mixed_256_frames_fragmented", |b| {
        b.iter(|| {
            let mut buf = BytesMut::new();
            let mut count = 0;
            for chunk in stream.chunks(61) {
                buf.extend_from_slice(chunk);
                count += decode_all(&table, black_box(&mut buf)).unwrap().len();
            }
            count
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode_small, bench_decode_stream);
criterion_main!(benches);
