//! Benchmark runner for the tile kernels.
//!
//! Runs every kernel policy on its characteristic shapes, checks each result
//! against the reference product and prints one timing line per case.
//! Environment switches are listed in `tilemm::config`.
//!
//! The library reports through the `log` facade and this runner installs no
//! logger, so calibration, section timings and mismatches are printed here
//! directly.

use std::process;

use half::bf16;

use tilemm::blocked::PackedB;
use tilemm::harness::clock::CALIBRATION_INTERVAL;
use tilemm::harness::{Bench, CounterSpec, Iterations, Report, Stopwatch, TscClock, Workload, peak};
use tilemm::kernels::{BlockShape, Kernel, Origin, TilingPolicy};
use tilemm::matrix::{Tensor2D, Verdict, compare, matmul_reference};
use tilemm::threaded::{Partition, parallel_matmul};
use tilemm::tile::{Amx, Emulated, TileScope, TileUnit};
use tilemm::{Result, RunConfig};

fn main() {
    let config = RunConfig::from_env();

    let result = if config.emulate {
        println!("Tile unit: emulated (EMULATE set)\n");
        run::<Emulated>(&config, Iterations::Count(3))
    } else {
        match Amx::detect() {
            Ok(()) => {
                println!("Tile unit: AMX\n");
                run::<Amx>(&config, Iterations::default())
            }
            Err(err) => Err(err),
        }
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn run<U: TileUnit>(config: &RunConfig, iterations: Iterations) -> Result<()> {
    let clock = *TscClock::global();
    println!(
        "TSC: {:.3} GHz (calibrated over {:?})",
        clock.ticks_per_second() as f64 / 1e9,
        CALIBRATION_INTERVAL
    );
    println!(
        "Peak per core: AMX-BF16 {:.1} GOps/s @ {} GHz ({:.1} @ {} GHz turbo), AVX-512 FP32 {:.1} GOps/s\n",
        peak::amx_bf16_peak(peak::AMX_BF16_FREQ_GHZ) / 1e9,
        peak::AMX_BF16_FREQ_GHZ,
        peak::amx_bf16_peak(peak::AMX_BF16_TURBO_FREQ_GHZ) / 1e9,
        peak::AMX_BF16_TURBO_FREQ_GHZ,
        peak::fp32_peak(peak::AVX512_FREQ_GHZ) / 1e9
    );

    let mut bench = Bench::with_clock(clock, config);
    if !config.emulate {
        bench = bench.with_counters(&[CounterSpec::hardware_cycles(), CounterSpec::instructions()])?;
    }
    let peak = peak::amx_bf16_peak(peak::AMX_BF16_FREQ_GHZ);
    let mut sections = Stopwatch::new(clock);

    sections.start("single block");
    println!("=== Single block ===");
    println!("{}", "-".repeat(50));
    single_block::<U>(&mut bench, config, iterations, peak, BlockShape::new(32, 32, 128), TilingPolicy::FixedK)?;
    single_block::<U>(&mut bench, config, iterations, peak, BlockShape::new(32, 256, 256), TilingPolicy::OuterN)?;
    single_block::<U>(&mut bench, config, iterations, peak, BlockShape::new(32, 64, 32), TilingPolicy::OuterK)?;

    sections.start("tail blocks");
    println!("\n=== Tail blocks ===");
    println!("{}", "-".repeat(50));
    for m in 17..31 {
        for n in 17..=31 {
            for k in (2..32).step_by(2) {
                single_block::<U>(&mut bench, config, Iterations::Count(1), peak, BlockShape::new(m, n, k), TilingPolicy::Tail)?;
            }
        }
    }

    sections.start("k-blocked");
    println!("\n=== K-blocked ===");
    println!("{}", "-".repeat(50));
    k_blocked::<U>(&mut bench, config, iterations, peak, 32, 256, 1024, 256)?;

    sections.start("parallel");
    println!("\n=== Parallel ===");
    println!("{}", "-".repeat(50));
    let k = if config.emulate { 32 } else { 256 };
    for workers in [2, 3] {
        parallel::<U>(&mut bench, config, iterations, 1024, 1024, k, workers)?;
    }
    sections.end();

    println!();
    for (name, seconds) in sections.laps() {
        println!("[RDTSC] {name} took {:.2} us", seconds * 1e6);
    }
    Ok(())
}

fn single_block<U: TileUnit>(
    bench: &mut Bench,
    config: &RunConfig,
    iterations: Iterations,
    peak: f64,
    shape: BlockShape,
    policy: TilingPolicy,
) -> Result<()> {
    let kernel = Kernel::generate(shape, policy, config.kernel_options())?;
    let a = Tensor2D::random_small_ints(shape.m, shape.k, 1);
    let b = Tensor2D::random_small_ints(shape.k, shape.n, 2);
    let packed = PackedB::pack(&b, policy.pack_order());
    let mut c = Tensor2D::new(shape.m, shape.n);

    let scope = TileScope::<U>::activate(kernel.config())?;
    kernel.run_at(&scope, &a, &packed, &mut c, Origin::ZERO);
    let verdict = compare(&matmul_reference(&a, &b), &c);
    if !verdict.is_pass() && config.show_errors {
        dump(&a, &b, &c);
    }

    let workload = Workload::new(format!("{policy} {shape}"))
        .ops_per_call(shape.ops() as f64)
        .peak(peak);
    let report = bench.run(&workload, iterations, || {
        kernel.run_at(&scope, &a, &packed, &mut c, Origin::ZERO)
    });

    print_result(&verdict, &report);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn k_blocked<U: TileUnit>(
    bench: &mut Bench,
    config: &RunConfig,
    iterations: Iterations,
    peak: f64,
    m: usize,
    n: usize,
    k: usize,
    k_block: usize,
) -> Result<()> {
    let shape = BlockShape::new(m, n, k_block);
    let kernel = Kernel::generate(shape, TilingPolicy::OuterK, config.kernel_options())?;
    let a = Tensor2D::random_small_ints(m, k, 3);
    let b = Tensor2D::random_small_ints(k, n, 4);
    let packed = PackedB::pack(&b, TilingPolicy::OuterK.pack_order());
    let mut c = Tensor2D::new(m, n);

    let scope = TileScope::<U>::activate(kernel.config())?;
    let product = |c: &mut Tensor2D<f32>| {
        c.fill(0.0);
        for k0 in (0..k).step_by(k_block) {
            kernel.run_at(&scope, &a, &packed, c, Origin::new(0, 0, k0));
        }
    };
    product(&mut c);
    let verdict = compare(&matmul_reference(&a, &b), &c);
    if !verdict.is_pass() && config.show_errors {
        dump(&a, &b, &c);
    }

    let workload = Workload::new(format!("OuterK M={m},N={n},K={k} (K-block {k_block})"))
        .ops_per_call(2.0 * (m * n * k) as f64)
        .peak(peak);
    let report = bench.run(&workload, iterations, || product(&mut c));

    print_result(&verdict, &report);
    Ok(())
}

fn parallel<U: TileUnit>(
    bench: &mut Bench,
    config: &RunConfig,
    iterations: Iterations,
    m: usize,
    n: usize,
    k: usize,
    workers: usize,
) -> Result<()> {
    let shape = BlockShape::new(32, 32, k);
    let kernel = Kernel::generate(shape, TilingPolicy::FixedK, config.kernel_options())?;
    let a = Tensor2D::random_small_ints(m, k, 5);
    let b = Tensor2D::random_small_ints(k, n, 6);
    let packed = PackedB::pack(&b, TilingPolicy::FixedK.pack_order());
    let mut c = Tensor2D::new(m, n);

    let owned = parallel_matmul::<U>(&kernel, &a, &packed, &mut c, workers, Partition::Grid)?;
    let verdict = compare(&matmul_reference(&a, &b), &c);
    if !verdict.is_pass() && config.show_errors {
        dump(&a, &b, &c);
    }
    let blocks: Vec<usize> = owned.iter().map(Vec::len).collect();

    let workload = Workload::new(format!("FixedK x{workers} M={m},N={n},K={k} blocks/worker {blocks:?}"))
        .ops_per_call(2.0 * (m * n * k) as f64)
        .peak(peak::amx_bf16_peak(peak::AMX_BF16_FREQ_GHZ) * workers as f64);

    let mut failure = None;
    let report = bench.run(&workload, iterations, || {
        if let Err(err) = parallel_matmul::<U>(&kernel, &a, &packed, &mut c, workers, Partition::Grid) {
            failure.get_or_insert(err);
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }

    print_result(&verdict, &report);
    Ok(())
}

fn print_result(verdict: &Verdict, report: &Report) {
    println!("{} {report}", verdict.label());
    if let Verdict::Fail { .. } = verdict {
        log::error!("{}: {verdict}", report.label);
        println!("       {verdict}");
    }
}

fn dump(a: &Tensor2D<bf16>, b: &Tensor2D<bf16>, c: &Tensor2D<f32>) {
    eprintln!("A = {a}");
    eprintln!("B = {b}");
    eprintln!("C = {c}");
    eprintln!("C_ref = {}", matmul_reference(a, b));
}
