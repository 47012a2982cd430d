// benches/pipeline.rs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fibre_stream::{Channel, MergeAllConfig, Source};
use tokio::runtime::Runtime;

type Ints = Source<String, u64, ()>;
type Stage = Channel<(), String, u64, (), String, u64, ()>;

const ITEM_COUNTS: [u64; 2] = [1_000, 10_000];

fn runtime() -> Runtime {
  tokio::runtime::Builder::new_multi_thread()
    .worker_threads(4)
    .enable_all()
    .build()
    .unwrap()
}

fn pipe_throughput(c: &mut Criterion) {
  let rt = runtime();
  let mut group = c.benchmark_group("pipe");
  for &items in &ITEM_COUNTS {
    group.throughput(Throughput::Elements(items));
    group.bench_with_input(BenchmarkId::new("map_through_two_stages", items), &items, |b, &items| {
      let channel = Ints::write_all(0..items)
        .pipe_to(Stage::identity().map_out(|v| v + 1))
        .pipe_to(Stage::identity().map_out(|v| v * 2));
      b.to_async(&rt).iter(|| async {
        let exit = channel.run_drain().await;
        black_box(exit).unwrap();
      });
    });
  }
  group.finish();
}

fn concat_map_throughput(c: &mut Criterion) {
  let rt = runtime();
  let mut group = c.benchmark_group("concat_map");
  for &items in &ITEM_COUNTS {
    group.throughput(Throughput::Elements(items));
    group.bench_with_input(BenchmarkId::new("ten_per_child", items), &items, |b, &items| {
      let channel = Ints::write_all(0..items / 10).concat_map(|v| Ints::write_all(v * 10..v * 10 + 10));
      b.to_async(&rt).iter(|| async {
        let exit = channel.run_drain().await;
        black_box(exit).unwrap();
      });
    });
  }
  group.finish();
}

fn merge_all_throughput(c: &mut Criterion) {
  let rt = runtime();
  let mut group = c.benchmark_group("merge_all");
  for concurrency in [1usize, 4, 16] {
    let items = 10_000u64;
    group.throughput(Throughput::Elements(items));
    group.bench_with_input(BenchmarkId::new("concurrency", concurrency), &concurrency, |b, &n| {
      let config = MergeAllConfig::builder().concurrency(n).build().unwrap();
      let children = Source::<String, Ints, ()>::write_all((0..100).map(|c| Ints::write_all(c * 100..c * 100 + 100)));
      let channel = Ints::merge_all(children, config);
      b.to_async(&rt).iter(|| async {
        let exit = channel.run_drain().await;
        black_box(exit).unwrap();
      });
    });
  }
  group.finish();
}

criterion_group!(benches, pipe_throughput, concat_map_throughput, merge_all_throughput);
criterion_main!(benches);
