use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rastercube::prelude::*;
use std::sync::Arc;

fn view(chunk: ChunkShape) -> CubeView {
    let start = NaiveDate::from_ymd_opt(2020, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let end = NaiveDate::from_ymd_opt(2020, 2, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    CubeView::new(
        "EPSG:32632",
        SpatialExtent::new(0.0, 2560.0, 0.0, 2560.0),
        (10.0, 10.0),
        TemporalExtent::new(start, end),
        TimeStep::days(1),
        chunk,
    )
    .unwrap()
}

fn ndvi_median() -> CubeRef {
    let dummy: CubeRef = Arc::new(DummyCube::new(view(ChunkShape::new(31, 64, 64)), 2, 0.3).unwrap());
    let ndvi: CubeRef = Arc::new(
        ApplyPixelCube::new(dummy, &["(band2 - band1) / (band2 + band1)"], &["ndvi"], false).unwrap(),
    );
    Arc::new(ReduceTimeCube::single(ndvi, Reducer::Median).unwrap())
}

fn bench_read_chunk(c: &mut Criterion) {
    let cube = ndvi_median();
    c.bench_function("read_chunk_ndvi_median", |b| {
        b.iter(|| cube.read_chunk(black_box(ChunkId(0))).unwrap())
    });
}

fn bench_scheduler(c: &mut Criterion) {
    let cube = ndvi_median();
    for threads in [1, 4] {
        let engine = Engine::init(EngineConfig::default().with_threads(threads)).unwrap();
        c.bench_function(&format!("evaluate_ndvi_median_{}_threads", threads), |b| {
            b.iter(|| {
                let mut sink = MemorySink::new();
                engine
                    .scheduler()
                    .run(&cube, ChunkSelection::All, &mut sink)
                    .unwrap()
            })
        });
    }
}

criterion_group!(benches, bench_read_chunk, bench_scheduler);
criterion_main!(benches);
