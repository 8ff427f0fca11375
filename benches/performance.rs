//! Performance benchmarks for dump generation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pod_harvest::dumps::{delta, OaiIdentity, PublishedSet, XmlPager};
use pod_harvest::{
    OaiConfig, OaiEngine, RecordInput, Repository, RepositoryConfig, StreamId, Timestamp,
    UploadInput, Window,
};
use std::sync::Arc;
use tempfile::TempDir;

fn ts(secs: i64) -> Timestamp {
    Timestamp(secs * 1_000_000)
}

fn marc(i: usize) -> RecordInput {
    RecordInput::new(
        format!("r{i:07}"),
        format!(
            "<record><leader>00000nam a2200000 a 4500</leader>\
             <controlfield tag=\"001\">r{i:07}</controlfield>\
             <datafield tag=\"245\" ind1=\"1\" ind2=\"0\">\
             <subfield code=\"a\">Title number {i}</subfield></datafield></record>"
        ),
    )
}

/// A repository holding one stream with `count` records uploaded at t=10s.
fn populated(dir: &TempDir, count: usize) -> (Arc<Repository>, StreamId) {
    let repo = Repository::create(RepositoryConfig {
        path: dir.path().join("repo"),
        max_records_per_page: 1000,
        ..Default::default()
    })
    .unwrap();
    let stream = repo.create_stream_at("bench-org", "", ts(0)).unwrap().id;
    repo.ingest_at(stream, UploadInput::records((0..count).map(marc)), ts(10))
        .unwrap();
    (Arc::new(repo), stream)
}

/// Benchmark delta planning against an empty published set
fn bench_delta_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_plan");

    for count in [1_000, 10_000, 50_000] {
        group.bench_with_input(BenchmarkId::new("records", count), &count, |b, &count| {
            let dir = TempDir::new().unwrap();
            let (repo, stream) = populated(&dir, count);
            let live = repo.live_records_at(stream, ts(100));
            let published = PublishedSet::new();

            b.iter(|| {
                black_box(delta::plan(
                    &published,
                    &live,
                    Window::new(Timestamp::EPOCH, ts(100)),
                ))
            });
        });
    }

    group.finish();
}

/// Benchmark rendering and compressing pages
fn bench_paginate(c: &mut Criterion) {
    let mut group = c.benchmark_group("paginate");
    group.sample_size(20);

    for count in [1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("records", count), &count, |b, &count| {
            let dir = TempDir::new().unwrap();
            let (repo, stream) = populated(&dir, count);
            let plan = delta::plan_full(&repo.live_records_at(stream, ts(100)));
            let pager = XmlPager::new(1000).unwrap();
            let identity = OaiIdentity {
                namespace: "pod.example.org".to_string(),
                organization: "bench-org".to_string(),
                stream,
            };

            b.iter(|| black_box(pager.paginate(&plan, &identity, ts(100)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark serving one ListRecords page, which reads a stored page
fn bench_list_records(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let (repo, stream) = populated(&dir, 5_000);
    repo.generate_full_dump_at(stream, ts(100)).unwrap();
    let engine = OaiEngine::new(Arc::clone(&repo), OaiConfig::default());
    let params = vec![
        ("verb".to_string(), "ListRecords".to_string()),
        ("metadataPrefix".to_string(), "marc21".to_string()),
    ];

    c.bench_function("list_records_first_page", |b| {
        b.iter(|| black_box(engine.respond(&params).unwrap()));
    });
}

criterion_group!(benches, bench_delta_plan, bench_paginate, bench_list_records);
criterion_main!(benches);
