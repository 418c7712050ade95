//! Matrix-tile (Intel AMX) BF16 matmul kernels and the harness that measures them.
//!
//! Kernels are generated at run time for one fixed block shape and one
//! tiling policy, together with the tile configuration they need. The
//! harness times them against a calibrated cycle counter, optionally with
//! Linux perf counters and cache eviction between calls.
//!
//! ## Usage
//!
//! ```
//! use tilemm::kernels::{BlockShape, Kernel, KernelOptions, Origin, TilingPolicy};
//! use tilemm::blocked::PackedB;
//! use tilemm::matrix::{Tensor2D, compare, matmul_reference};
//! use tilemm::tile::{Emulated, TileScope};
//!
//! let a = Tensor2D::random_small_ints(32, 128, 1);
//! let b = Tensor2D::random_small_ints(128, 32, 2);
//!
//! let kernel = Kernel::generate(BlockShape::new(32, 32, 128), TilingPolicy::FixedK, KernelOptions::default()).unwrap();
//! let packed = PackedB::pack(&b, TilingPolicy::FixedK.pack_order());
//! let mut c = Tensor2D::new(32, 32);
//!
//! let scope = TileScope::<Emulated>::activate(kernel.config()).unwrap();
//! kernel.run_at(&scope, &a, &packed, &mut c, Origin::ZERO);
//!
//! assert!(compare(&matmul_reference(&a, &b), &c).is_pass());
//! ```
//!
//! Swap [`tile::Emulated`] for [`tile::Amx`] to run on the hardware; on a
//! CPU without AMX, activating the scope fails with
//! [`Error::HardwareUnsupported`].
//!
//! ## What's inside
//!
//! - `tile`: tile registers, configuration, hardware and emulated units
//! - `blocked`: B packing into the pair-interleaved block layout
//! - `kernels`: FixedK, OuterN, OuterK and Tail kernels over one 2x2 primitive
//! - `threaded`: fork-join driver over the output block grid
//! - `harness`: TSC clock, perf counters, cache flushing, reports
//! - `matrix`: operands, the reference product, result comparison

pub mod blocked;
pub mod config;
pub mod error;
pub mod harness;
pub mod kernels;
pub mod matrix;
pub mod threaded;
pub mod tile;

use half::bf16;

pub use config::RunConfig;
pub use error::{Error, Result};
pub use matrix::matmul_reference;

use blocked::PackedB;
use kernels::{BlockShape, Kernel, KernelOptions, TilingPolicy};
use matrix::Tensor2D;
use threaded::Partition;
use tile::TileUnit;

/// Matrix multiply `C = A × B` on tile unit `U`.
///
/// Every 32-row block of C is one `OuterN` kernel call over all of N and K,
/// spread over `workers` threads. M, N and K must be multiples of 32.
///
/// ```
/// use tilemm::matrix::{Tensor2D, compare};
/// use tilemm::tile::Emulated;
///
/// let a = Tensor2D::random_small_ints(64, 64, 1);
/// let b = Tensor2D::random_small_ints(64, 96, 2);
/// let c = tilemm::multiply::<Emulated>(&a, &b, 2).unwrap();
///
/// assert!(compare(&tilemm::matmul_reference(&a, &b), &c).is_pass());
/// ```
///
/// # Errors
///
/// `ShapeConfiguration` if a dimension is not a multiple of 32, and whatever
/// activating the tile unit returns on each worker.
pub fn multiply<U: TileUnit>(a: &Tensor2D<bf16>, b: &Tensor2D<bf16>, workers: usize) -> Result<Tensor2D<f32>> {
    assert_eq!(a.cols(), b.rows(), "A: {}x{}, B: {}x{}", a.rows(), a.cols(), b.rows(), b.cols());

    let shape = BlockShape::new(kernels::BLOCK_M, b.cols(), a.cols());
    let kernel = Kernel::generate(shape, TilingPolicy::OuterN, KernelOptions::default())?;
    let packed = PackedB::pack(b, TilingPolicy::OuterN.pack_order());
    let mut c = Tensor2D::new(a.rows(), b.cols());
    threaded::parallel_matmul::<U>(&kernel, a, &packed, &mut c, workers, Partition::Rows)?;
    Ok(c)
}
