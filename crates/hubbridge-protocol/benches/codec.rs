//! Codec benchmarks for hubbridge-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use hubbridge_protocol::{codec, Command, Frame, Value};

fn pushed_message(size: usize) -> Frame {
    Frame::new_message("bench", "ReceiveMessage", Value::from("x".repeat(size)))
}

fn bench_encode_event(c: &mut Criterion) {
    let frame = pushed_message(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("new_message_64B", |b| {
        b.iter(|| codec::encode(black_box(&frame)))
    });
    group.finish();
}

fn bench_decode_request(c: &mut Criterion) {
    let command = Command::InvokeServerMethod {
        id: "bench".to_string(),
        method: "Send".to_string(),
        arguments: vec![Value::from("hello"), Value::Int(42)],
    };
    let encoded = codec::encode(&Frame::request(1, &command)).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("invoke_request", |b| {
        b.iter(|| codec::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_parse_command(c: &mut Criterion) {
    let arguments = Value::map([
        ("Id", Value::from("bench")),
        ("baseUrl", Value::from("http://localhost:5000")),
        ("hubName", Value::from("Chat")),
        (
            "hubMethods",
            Value::List(vec![Value::from("ReceiveMessage"), Value::from("Typing")]),
        ),
    ]);

    c.bench_function("parse_connect", |b| {
        b.iter(|| Command::parse(black_box("connectToServer"), black_box(&arguments)))
    });
}

criterion_group!(
    benches,
    bench_encode_event,
    bench_decode_request,
    bench_parse_command
);
criterion_main!(benches);
