//! Fork-join driver that spreads kernel invocations over the output block grid.

use std::panic;
use std::thread;

use half::bf16;

use super::partition::Partition;
use crate::blocked::PackedB;
use crate::error::{Error, Result};
use crate::kernels::{Kernel, TilingPolicy};
use crate::matrix::Tensor2D;
use crate::tile::{TileScope, TileUnit};

/// Base pointer of C shared by the workers, each of which writes only the
/// blocks it was assigned.
#[derive(Clone, Copy)]
struct SharedOut(*mut f32);

// SAFETY: workers write disjoint blocks and the scope joins them before C is
// used again.
unsafe impl Send for SharedOut {}

impl SharedOut {
    fn at(self, offset: usize) -> *mut f32 {
        self.0.wrapping_add(offset)
    }
}

/// Computes `C = A × B` by running `kernel` on every block of C.
///
/// C is split into `shape.m × shape.n` blocks that `partition` hands out to
/// `workers` threads. Every worker activates its own tile configuration
/// before its first invocation. With `OuterK`, a worker zeroes each of its
/// blocks and then applies every K-block to it in order, so one thread owns
/// each output block for the whole reduction. Other policies need the
/// kernel's K to be all of K.
///
/// Returns, per worker, the `(row, col)` origins of the blocks it wrote.
///
/// # Errors
///
/// `ShapeConfiguration` when the problem does not divide into whole blocks
/// or the policy is `Tail`; any error from activating a worker's tile scope.
///
/// # Panics
///
/// Panics if the operands do not form one product the kernel can walk (see
/// [`Kernel::run_at`]), and re-raises a panic from any worker.
pub fn parallel_matmul<U: TileUnit>(
    kernel: &Kernel,
    a: &Tensor2D<bf16>,
    b: &PackedB,
    c: &mut Tensor2D<f32>,
    workers: usize,
    partition: Partition,
) -> Result<Vec<Vec<(usize, usize)>>> {
    let shape = kernel.shape();
    let policy = kernel.policy();
    let (m, n, k) = (a.rows(), b.n(), a.cols());
    let unsupported = |reason: String| Error::ShapeConfiguration { policy, shape, reason };

    if policy == TilingPolicy::Tail {
        return Err(unsupported("Tail kernels only cover a single boundary block".into()));
    }
    if m % shape.m != 0 || n % shape.n != 0 || k % shape.k != 0 {
        return Err(unsupported(format!("problem M={m},N={n},K={k} is not a whole number of blocks")));
    }
    if policy != TilingPolicy::OuterK && shape.k != k {
        return Err(unsupported(format!("{policy} overwrites C, so its K must be the full K={k}")));
    }
    kernel.check_operands(a, b, c);

    let row_blocks = m / shape.m;
    let col_blocks = n / shape.n;
    let team = workers.max(1);
    let lda = a.stride_bytes();
    let ldc = c.stride_bytes();
    let c_stride = c.stride();
    let out = SharedOut(c.ptr_at_mut(0, 0));

    log::debug!(
        "parallel {policy} over {row_blocks}x{col_blocks} blocks of {shape}, {team} workers, {partition:?}"
    );

    thread::scope(|s| {
        let handles: Vec<_> = (0..team)
            .map(|tid| {
                let origins: Vec<(usize, usize)> = partition
                    .blocks(row_blocks, col_blocks, team, tid)
                    .into_iter()
                    .map(|(row, col)| (row * shape.m, col * shape.n))
                    .collect();

                s.spawn(move || -> Result<Vec<(usize, usize)>> {
                    if origins.is_empty() {
                        return Ok(origins);
                    }
                    let scope = TileScope::<U>::activate(kernel.config())?;

                    for &(row, col) in &origins {
                        let c_block = out.at(row * c_stride + col);
                        if policy == TilingPolicy::OuterK {
                            for r in 0..shape.m {
                                // SAFETY: row `row + r` of this block belongs to this worker only.
                                unsafe { std::slice::from_raw_parts_mut(c_block.add(r * c_stride), shape.n) }
                                    .fill(0.0);
                            }
                        }
                        for k0 in (0..k).step_by(shape.k) {
                            let b_block = b.as_slice()[b.block_offset(k0, col)..].as_ptr();
                            // SAFETY: the block lies inside C (whole-block grid checked
                            // above) and no other worker writes it.
                            unsafe { kernel.invoke(&scope, a.ptr_at(row, k0), lda, b_block, c_block, ldc) };
                        }
                    }
                    Ok(origins)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|payload| panic::resume_unwind(payload)))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocked::PackedB;
    use crate::kernels::{BlockShape, KernelOptions};
    use crate::matrix::{compare, matmul_reference};
    use crate::tile::Emulated;

    fn problem(m: usize, n: usize, k: usize, policy: TilingPolicy) -> (Tensor2D<bf16>, Tensor2D<bf16>, PackedB) {
        let a = Tensor2D::random_small_ints(m, k, 5);
        let b = Tensor2D::random_small_ints(k, n, 6);
        let packed = PackedB::pack(&b, policy.pack_order());
        (a, b, packed)
    }

    #[test]
    fn test_outer_k_reduces_across_k_blocks() {
        let (a, b, packed) = problem(64, 64, 128, TilingPolicy::OuterK);
        let kernel = Kernel::generate(BlockShape::new(32, 64, 32), TilingPolicy::OuterK, KernelOptions::default()).unwrap();
        let mut c = Tensor2D::new(64, 64);
        c.fill(f32::NAN);

        let owned = parallel_matmul::<Emulated>(&kernel, &a, &packed, &mut c, 2, Partition::Rows).unwrap();

        assert_eq!(owned, vec![vec![(0, 0)], vec![(32, 0)]]);
        assert!(compare(&matmul_reference(&a, &b), &c).is_pass());
    }

    #[test]
    fn test_more_workers_than_blocks() {
        let (a, b, packed) = problem(32, 64, 32, TilingPolicy::FixedK);
        let kernel = Kernel::generate(BlockShape::new(32, 32, 32), TilingPolicy::FixedK, KernelOptions::default()).unwrap();
        let mut c = Tensor2D::new(32, 64);

        let owned = parallel_matmul::<Emulated>(&kernel, &a, &packed, &mut c, 4, Partition::Grid).unwrap();

        assert_eq!(owned.iter().filter(|blocks| !blocks.is_empty()).count(), 2);
        assert!(compare(&matmul_reference(&a, &b), &c).is_pass());
    }

    #[test]
    fn test_rejects_partial_blocks_and_tail() {
        let (a, _, packed) = problem(48, 32, 32, TilingPolicy::FixedK);
        let kernel = Kernel::generate(BlockShape::new(32, 32, 32), TilingPolicy::FixedK, KernelOptions::default()).unwrap();
        let mut c = Tensor2D::new(48, 32);
        let result = parallel_matmul::<Emulated>(&kernel, &a, &packed, &mut c, 2, Partition::Grid);
        assert!(matches!(result, Err(Error::ShapeConfiguration { .. })));

        let (a, _, packed) = problem(20, 20, 8, TilingPolicy::Tail);
        let tail = Kernel::generate(BlockShape::new(20, 20, 8), TilingPolicy::Tail, KernelOptions::default()).unwrap();
        let mut c = Tensor2D::new(20, 20);
        let result = parallel_matmul::<Emulated>(&tail, &a, &packed, &mut c, 1, Partition::Rows);
        assert!(matches!(result, Err(Error::ShapeConfiguration { .. })));
    }
}
