use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use pmtx_pmem::{Key, Region, TableId, CACHE_LINE};
use pmtx_wal::{LogManager, PageCursor};

const PAGE: usize = 48 * 1024;

fn append_update(c: &mut Criterion) {
    let region = Region::anonymous(CACHE_LINE + 64 * PAGE).unwrap();
    let wal = LogManager::create(region.span(), PAGE).unwrap();
    let mut cursor = PageCursor::seeded(0);
    let key = Key::new(TableId(0), 99);
    let payload = vec![7u8; 128];

    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("update_128b", |b| {
        let mut page = wal.try_alloc(&mut cursor).unwrap();
        b.iter(|| {
            if !page.fits(pmtx_wal::update_len(128)) {
                let full = std::mem::replace(&mut page, loop {
                    if let Some(p) = wal.try_alloc(&mut cursor) {
                        break p;
                    }
                });
                wal.release(full);
            }
            page.append_update(1, black_box(key), 0, black_box(&payload));
        })
    });
    group.finish();
}

criterion_group!(benches, append_update);
criterion_main!(benches);
