use criterion::{black_box, criterion_group, criterion_main, Criterion};
use magnetar::commands::buffer::Buffer;
use magnetar::operations::OperationType;
use magnetar::{Bin, Bins, Key, ReadPolicy, Value, WritePolicy};

fn bench_key_digest(c: &mut Criterion) {
    c.bench_function("key_digest", |b| {
        b.iter(|| Key::new("bench", "set", black_box("user-1234567890")).unwrap())
    });
}

fn bench_set_read(c: &mut Criterion) {
    let policy = ReadPolicy::default();
    let key = Key::new("bench", "set", "user-1234567890").unwrap();
    let mut buffer = Buffer::new();

    c.bench_function("frame_read", |b| {
        b.iter(|| {
            buffer.set_read(&policy, black_box(&key), &Bins::All).unwrap();
            buffer.data_offset
        })
    });
}

fn bench_set_write(c: &mut Criterion) {
    let policy = WritePolicy::default();
    let key = Key::new("bench", "set", "user-1234567890").unwrap();
    let bins = vec![
        Bin::new("counter", 12345i64),
        Bin::new("name", "a moderately sized string value"),
        Bin::new("tags", Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])),
    ];
    let mut buffer = Buffer::new();

    c.bench_function("frame_write", |b| {
        b.iter(|| {
            buffer
                .set_write(&policy, OperationType::Write, black_box(&key), &bins)
                .unwrap();
            buffer.data_offset
        })
    });
}

criterion_group!(benches, bench_key_digest, bench_set_read, bench_set_write);
criterion_main!(benches);
