//! Criterion benchmarks for packing and the tile kernels.
//!
//! Kernel benchmarks need AMX and are skipped elsewhere; packing always runs.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tilemm::blocked::{PackOrder, PackedB};
use tilemm::kernels::{BlockShape, Kernel, KernelOptions, Origin, TilingPolicy};
use tilemm::matrix::Tensor2D;
use tilemm::tile::{Amx, TileScope};

fn bench_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_b");

    for size in [128, 512, 1024] {
        let b = Tensor2D::random_small_ints(size, size, 7);
        group.throughput(Throughput::Bytes((size * size * 2) as u64));

        for order in [PackOrder::KMajor, PackOrder::NMajor] {
            group.bench_with_input(BenchmarkId::new(format!("{order:?}"), size), &b, |bench, b| {
                bench.iter(|| black_box(PackedB::pack(b, order)));
            });
        }
    }

    group.finish();
}

fn bench_kernels(c: &mut Criterion) {
    if let Err(err) = Amx::detect() {
        println!("Skipping kernel benchmarks - {err}");
        return;
    }

    let mut group = c.benchmark_group("amx_kernel");
    let cases = [
        (BlockShape::new(32, 32, 128), TilingPolicy::FixedK),
        (BlockShape::new(32, 32, 1024), TilingPolicy::FixedK),
        (BlockShape::new(32, 256, 256), TilingPolicy::OuterN),
        (BlockShape::new(32, 256, 256), TilingPolicy::OuterK),
        (BlockShape::new(31, 31, 30), TilingPolicy::Tail),
    ];

    for (shape, policy) in cases {
        for prefetch in [false, true] {
            let Ok(kernel) = Kernel::generate(shape, policy, KernelOptions { prefetch }) else {
                continue;
            };
            let a = Tensor2D::random_small_ints(shape.m, shape.k, 1);
            let b = PackedB::pack(&Tensor2D::random_small_ints(shape.k, shape.n, 2), policy.pack_order());
            let mut out = Tensor2D::new(shape.m, shape.n);
            let Ok(scope) = TileScope::<Amx>::activate(kernel.config()) else {
                continue;
            };

            group.throughput(Throughput::Elements(shape.ops()));
            let id = format!("{policy}{}", if prefetch { "+swpf" } else { "" });
            group.bench_function(BenchmarkId::new(id, shape), |bench| {
                bench.iter(|| kernel.run_at(&scope, &a, &b, &mut out, Origin::ZERO));
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_pack, bench_kernels);
criterion_main!(benches);
