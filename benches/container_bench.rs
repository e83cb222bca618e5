use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mixlib::id::{hash, KeyScheme};
use mixlib::{Container, Generation, OpenOptions, Protection};
use std::io::Cursor;

fn bench_hash(c: &mut Criterion) {
    let names: Vec<String> = (0..1000).map(|i| format!("unit{i:04}.shp")).collect();

    c.bench_function("hash_classic_1000_names", |b| {
        b.iter(|| names.iter().map(|n| hash(black_box(n), KeyScheme::Classic)).fold(0u32, |a, h| a ^ h))
    });
    c.bench_function("hash_crc_1000_names", |b| {
        b.iter(|| names.iter().map(|n| hash(black_box(n), KeyScheme::Crc)).fold(0u32, |a, h| a ^ h))
    });
}

fn packed(protection: Protection, count: usize, size: usize) -> Vec<u8> {
    let mut c = Container::create(Cursor::new(Vec::new()), Generation::TiberianSun, protection).unwrap();
    for i in 0..count {
        c.insert(&format!("file{i}.bin"), &vec![i as u8; size]).unwrap();
    }
    c.close().unwrap().into_inner()
}

fn bench_pack(c: &mut Criterion) {
    let data = vec![42u8; 64 * 1024];

    c.bench_function("pack_100x64k_plain", |b| {
        b.iter(|| {
            let mut ct = Container::create(Cursor::new(Vec::new()), Generation::RedAlert, Protection::None).unwrap();
            for i in 0..100 {
                ct.insert(&format!("file{i}.bin"), black_box(&data)).unwrap();
            }
            ct.close().unwrap();
        })
    });

    c.bench_function("pack_100x64k_checksummed_encrypted", |b| {
        b.iter(|| {
            let mut ct = Container::create(
                Cursor::new(Vec::new()),
                Generation::RedAlert,
                Protection::ChecksummedEncrypted,
            )
            .unwrap();
            for i in 0..100 {
                ct.insert(&format!("file{i}.bin"), black_box(&data)).unwrap();
            }
            ct.close().unwrap();
        })
    });
}

fn bench_open_and_edit(c: &mut Criterion) {
    let bytes = packed(Protection::Checksummed, 500, 4096);

    c.bench_function("open_verify_500_entries", |b| {
        b.iter(|| Container::open(Cursor::new(black_box(bytes.clone())), OpenOptions::read_only()).unwrap())
    });

    c.bench_function("replace_and_flush_one_entry", |b| {
        b.iter(|| {
            let mut ct = Container::open(Cursor::new(bytes.clone()), OpenOptions::read_write()).unwrap();
            let id = ct.resolve("file250.bin").unwrap();
            ct.replace(id, black_box(&[7u8; 8192])).unwrap();
            ct.close().unwrap();
        })
    });
}

criterion_group!(benches, bench_hash, bench_pack, bench_open_and_edit);
criterion_main!(benches);
