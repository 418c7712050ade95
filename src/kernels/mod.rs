//! Tile matmul kernels.
//!
//! A [`Kernel`] computes one output block `C[m × n] (+)= A[m × k] × B[k × n]`
//! with BF16 operands and FP32 accumulation. It is built once by
//! [`Kernel::generate`] for a fixed [`BlockShape`] and [`TilingPolicy`], which
//! also derive the [`TileConfig`] the calling thread must activate, and is then
//! invoked any number of times with operand pointers.
//!
//! Every policy is a different loop around the same 2x2 accumulate primitive
//! in [`block_2x2`]:
//! - `FixedK`: one 32×32 block over all of K
//! - `OuterN`: a row of 32×32 blocks, B contiguous across column groups
//! - `OuterK`: one K-block for a row of column groups, C read-modify-write
//! - `Tail`: a single reduced-shape step for boundary blocks

pub mod block_2x2;

use std::fmt;

use half::bf16;

use crate::blocked::{BLOCK_K, BLOCK_N, PackOrder, PackedB};
use crate::error::{Error, Result};
use crate::matrix::Tensor2D;
use crate::tile::{MAX_ROWS, Tile, TileConfig, TileScope, TileShape, TileUnit};

use block_2x2::{A_STEP, B_STEP, C_GROUP};

/// Rows of a full block (two 16-row tiles).
pub const BLOCK_M: usize = 2 * MAX_ROWS;
/// Columns of a full column group (two 16-column tiles).
pub const GROUP_N: usize = 2 * BLOCK_N;

/// Logical extent of the block a kernel computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl BlockShape {
    pub const fn new(m: usize, n: usize, k: usize) -> Self {
        BlockShape { m, n, k }
    }

    /// Multiply-add operations per invocation, counted as two ops each.
    pub fn ops(&self) -> u64 {
        2 * (self.m * self.n * self.k) as u64
    }
}

impl fmt::Display for BlockShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M={},N={},K={}", self.m, self.n, self.k)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TilingPolicy {
    FixedK,
    OuterN,
    OuterK,
    Tail,
}

impl TilingPolicy {
    pub const ALL: [TilingPolicy; 4] = [
        TilingPolicy::FixedK,
        TilingPolicy::OuterN,
        TilingPolicy::OuterK,
        TilingPolicy::Tail,
    ];

    /// Layout of packed B this policy walks.
    pub fn pack_order(self) -> PackOrder {
        match self {
            TilingPolicy::FixedK | TilingPolicy::OuterN => PackOrder::NMajor,
            TilingPolicy::OuterK | TilingPolicy::Tail => PackOrder::KMajor,
        }
    }

    fn check(self, shape: BlockShape) -> std::result::Result<(), String> {
        let k_unit = |k: usize| k > 0 && k % BLOCK_K == 0;
        let n_unit = |n: usize| n > 0 && n % GROUP_N == 0;
        match self {
            TilingPolicy::FixedK => {
                if shape.m != BLOCK_M || shape.n != GROUP_N {
                    return Err(format!("M and N must both be {BLOCK_M}"));
                }
                if !k_unit(shape.k) {
                    return Err(format!("K must be a positive multiple of {BLOCK_K}"));
                }
            }
            TilingPolicy::OuterN | TilingPolicy::OuterK => {
                if shape.m != BLOCK_M {
                    return Err(format!("M must be {BLOCK_M}"));
                }
                if !n_unit(shape.n) {
                    return Err(format!("N must be a positive multiple of {GROUP_N}"));
                }
                if !k_unit(shape.k) {
                    return Err(format!("K must be a positive multiple of {BLOCK_K}"));
                }
            }
            TilingPolicy::Tail => {
                let edge = MAX_ROWS + 1..=BLOCK_M;
                if !edge.contains(&shape.m) || !edge.contains(&shape.n) {
                    return Err(format!("M and N must lie in {}..={}", edge.start(), edge.end()));
                }
                if shape.k % 2 != 0 || !(2..=BLOCK_K).contains(&shape.k) {
                    return Err(format!("K must be even and in 2..={BLOCK_K}"));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for TilingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TilingPolicy::FixedK => "FixedK",
            TilingPolicy::OuterN => "OuterN",
            TilingPolicy::OuterK => "OuterK",
            TilingPolicy::Tail => "Tail",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelOptions {
    /// Issue T0 software prefetches for the next K step (FixedK and OuterN).
    pub prefetch: bool,
}

/// Position of a block inside the full operands: the C row and column of its
/// top-left element, and the first K index it consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Origin {
    pub row: usize,
    pub col: usize,
    pub k: usize,
}

impl Origin {
    pub const ZERO: Origin = Origin { row: 0, col: 0, k: 0 };

    pub const fn new(row: usize, col: usize, k: usize) -> Self {
        Origin { row, col, k }
    }
}

/// A generated, immutable kernel bound to one shape and policy.
#[derive(Debug, Clone)]
pub struct Kernel {
    shape: BlockShape,
    policy: TilingPolicy,
    config: TileConfig,
    prefetch: bool,
    k_steps: usize,
    n_groups: usize,
    /// Rows held by the upper tiles (A0, C00, C01).
    upper_rows: usize,
}

impl Kernel {
    /// Validates `shape` for `policy` and derives the tile configuration.
    pub fn generate(shape: BlockShape, policy: TilingPolicy, options: KernelOptions) -> Result<Kernel> {
        policy.check(shape).map_err(|reason| Error::ShapeConfiguration {
            policy,
            shape,
            reason,
        })?;

        let kernel = match policy {
            TilingPolicy::Tail => Kernel {
                shape,
                policy,
                config: tail_config(shape)?,
                prefetch: false,
                k_steps: 1,
                n_groups: 1,
                upper_rows: shape.m.div_ceil(2),
            },
            _ => Kernel {
                shape,
                policy,
                config: TileConfig::from_shapes(&[TileShape::FULL; 8]),
                prefetch: options.prefetch && policy != TilingPolicy::OuterK,
                k_steps: shape.k / BLOCK_K,
                n_groups: shape.n / GROUP_N,
                upper_rows: MAX_ROWS,
            },
        };

        log::debug!(
            "generated {} kernel for {} ({} k-steps, {} column groups, prefetch {}): {}",
            policy,
            shape,
            kernel.k_steps,
            kernel.n_groups,
            kernel.prefetch,
            kernel.config
        );
        Ok(kernel)
    }

    pub fn shape(&self) -> BlockShape {
        self.shape
    }

    pub fn policy(&self) -> TilingPolicy {
        self.policy
    }

    /// Configuration the invoking thread must have active.
    pub fn config(&self) -> &TileConfig {
        &self.config
    }

    pub fn prefetch(&self) -> bool {
        self.prefetch
    }

    /// Runs the kernel on raw operands.
    ///
    /// # Arguments
    ///
    /// * `a` - first A element of the block, rows `lda` bytes apart
    /// * `b` - first packed-B block for this block's K offset and column
    /// * `c` - first C element of the block, rows `ldc` bytes apart
    ///
    /// # Safety
    ///
    /// - `a` must cover `m` rows of `k` BF16 values at stride `lda`
    /// - `b` must cover every packed block the policy walks (see [`Kernel::run_at`])
    /// - `c` must cover `m` rows of `n` FP32 values at stride `ldc`, and for
    ///   `OuterK` hold the partial sums to accumulate into
    /// - For `OuterK`, no other thread may touch the same C block until every
    ///   K-block for it has been applied
    ///
    /// # Panics
    ///
    /// Panics if `scope` was activated with a different configuration.
    pub unsafe fn invoke<U: TileUnit>(
        &self,
        scope: &TileScope<U>,
        a: *const bf16,
        lda: usize,
        b: *const bf16,
        c: *mut f32,
        ldc: usize,
    ) {
        assert_eq!(
            scope.config(),
            &self.config,
            "active tile configuration does not match the {} kernel for {}",
            self.policy,
            self.shape
        );

        let a = a as *const u8;
        let b = b as *const u8;
        let c = c as *mut u8;
        let a_lower = self.upper_rows * lda;
        let c_lower = self.upper_rows * ldc;

        unsafe {
            match self.policy {
                TilingPolicy::FixedK | TilingPolicy::OuterN => {
                    for group in 0..self.n_groups {
                        let b_group = b.add(group * self.k_steps * B_STEP);
                        let c_group = c.add(group * C_GROUP);
                        block_2x2::zero_c::<U>();
                        block_2x2::accumulate_k::<U>(a, lda, a_lower, b_group, self.k_steps, self.prefetch);
                        block_2x2::store_c::<U>(c_group, ldc, c_lower);
                    }
                }
                TilingPolicy::OuterK => {
                    for step in 0..self.k_steps {
                        block_2x2::load_a::<U>(a.add(step * A_STEP), lda, a_lower);
                        for group in 0..self.n_groups {
                            let c_group = c.add(group * C_GROUP);
                            block_2x2::load_c::<U>(c_group, ldc, c_lower);
                            block_2x2::multiply_b::<U>(b.add((step * self.n_groups + group) * B_STEP));
                            block_2x2::store_c::<U>(c_group, ldc, c_lower);
                        }
                    }
                }
                TilingPolicy::Tail => {
                    block_2x2::zero_c::<U>();
                    block_2x2::load_a::<U>(a, lda, a_lower);
                    block_2x2::multiply_b::<U>(b);
                    block_2x2::store_c::<U>(c, ldc, c_lower);
                }
            }
        }
    }

    /// Runs the kernel on the block of `c` at `at`, reading A rows from
    /// `at.row` and K from `at.k`.
    ///
    /// `FixedK`, `OuterN` and `Tail` overwrite the block; `OuterK` adds the
    /// product of its K-block to what `c` already holds.
    ///
    /// # Panics
    ///
    /// Panics if the operands do not fit the kernel: wrong packing order,
    /// mismatched K, a block that leaves any operand, an origin off the
    /// column-group or K-step grid, or a packed B that the policy cannot walk
    /// contiguously (`OuterN` needs all of K, `OuterK` all of N).
    pub fn run_at<U: TileUnit>(
        &self,
        scope: &TileScope<U>,
        a: &Tensor2D<bf16>,
        b: &PackedB,
        c: &mut Tensor2D<f32>,
        at: Origin,
    ) {
        self.check_operands(a, b, c);
        self.check_origin(a, c, at);

        let a_ptr = a.ptr_at(at.row, at.k);
        let b_ptr = b.as_slice()[b.block_offset(at.k, at.col)..].as_ptr();
        let lda = a.stride_bytes();
        let ldc = c.stride_bytes();
        let c_ptr = c.ptr_at_mut(at.row, at.col);

        // SAFETY: the checks above keep every tile access inside the operands.
        unsafe { self.invoke(scope, a_ptr, lda, b_ptr, c_ptr, ldc) };
    }

    /// Panics unless `a`, `b` and `c` form one product this kernel can walk.
    pub(crate) fn check_operands(&self, a: &Tensor2D<bf16>, b: &PackedB, c: &Tensor2D<f32>) {
        assert_eq!(
            b.order(),
            self.policy.pack_order(),
            "{} kernel needs B packed {:?}",
            self.policy,
            self.policy.pack_order()
        );
        assert_eq!(a.cols(), b.k(), "A has K={} but B has K={}", a.cols(), b.k());
        assert_eq!(
            (a.rows(), b.n()),
            (c.rows(), c.cols()),
            "C is {}x{}, expected {}x{}",
            c.rows(),
            c.cols(),
            a.rows(),
            b.n()
        );
        match self.policy {
            TilingPolicy::OuterN => assert_eq!(self.shape.k, b.k_padded(), "OuterN walks all of packed K"),
            TilingPolicy::OuterK => assert_eq!(self.shape.n, b.n_padded(), "OuterK walks all of packed N"),
            _ => {}
        }
    }

    /// Panics unless the block at `at` lies inside the operands and on the block grid.
    pub(crate) fn check_origin(&self, a: &Tensor2D<bf16>, c: &Tensor2D<f32>, at: Origin) {
        let BlockShape { m, n, k } = self.shape;
        let col_align = if self.policy == TilingPolicy::Tail { BLOCK_N } else { GROUP_N };
        assert!(
            at.row + m <= c.rows() && at.col + n <= c.cols() && at.k + k <= a.cols(),
            "{} block at {:?} exceeds operands M={},N={},K={}",
            self.shape,
            at,
            c.rows(),
            c.cols(),
            a.cols()
        );
        assert!(
            at.col % col_align == 0 && at.k % BLOCK_K == 0,
            "origin {at:?} is not on the {col_align}-column / {BLOCK_K}-K grid"
        );
    }
}

/// Reduced configuration covering exactly the valid extent of a boundary block.
fn tail_config(shape: BlockShape) -> Result<TileConfig> {
    let upper = shape.m.div_ceil(2);
    let lower = shape.m / 2;
    let tail_n = shape.n - BLOCK_N;
    let a_colsb = shape.k * std::mem::size_of::<bf16>();
    let b_rows = shape.k / 2;

    let f32_bytes = std::mem::size_of::<f32>();
    let shapes = [
        (block_2x2::C00, upper, BLOCK_N * f32_bytes),
        (block_2x2::C10, lower, BLOCK_N * f32_bytes),
        (block_2x2::C01, upper, tail_n * f32_bytes),
        (block_2x2::C11, lower, tail_n * f32_bytes),
        (block_2x2::A0, upper, a_colsb),
        (block_2x2::A1, lower, a_colsb),
        (block_2x2::B0, b_rows, BLOCK_N * f32_bytes),
        (block_2x2::B1, b_rows, tail_n * f32_bytes),
    ];

    let mut config = TileConfig::new();
    for (tile, rows, colsb) in shapes {
        config.set(tile, tile_shape(shape, tile, rows, colsb)?);
    }
    Ok(config)
}

fn tile_shape(shape: BlockShape, tile: Tile, rows: usize, colsb: usize) -> Result<TileShape> {
    TileShape::new(rows, colsb).ok_or_else(|| Error::ShapeConfiguration {
        policy: TilingPolicy::Tail,
        shape,
        reason: format!("{tile} would be {rows}x{colsb}B"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocked::PackedB;
    use crate::matrix::{compare, matmul_reference};
    use crate::tile::Emulated;

    fn run(shape: BlockShape, policy: TilingPolicy, options: KernelOptions) -> (Tensor2D<f32>, Tensor2D<f32>) {
        let a = Tensor2D::random_small_ints(shape.m, shape.k, 11);
        let b = Tensor2D::random_small_ints(shape.k, shape.n, 12);
        let packed = PackedB::pack(&b, policy.pack_order());
        let mut c = Tensor2D::new(shape.m, shape.n);

        let kernel = Kernel::generate(shape, policy, options).unwrap();
        let scope = TileScope::<Emulated>::activate(kernel.config()).unwrap();
        kernel.run_at(&scope, &a, &packed, &mut c, Origin::ZERO);
        (matmul_reference(&a, &b), c)
    }

    #[test]
    fn test_fixed_k_matches_reference() {
        let (expected, actual) = run(BlockShape::new(32, 32, 128), TilingPolicy::FixedK, KernelOptions::default());
        assert!(compare(&expected, &actual).is_pass());
    }

    #[test]
    fn test_prefetch_does_not_change_result() {
        let options = KernelOptions { prefetch: true };
        let (expected, actual) = run(BlockShape::new(32, 96, 64), TilingPolicy::OuterN, options);
        assert!(compare(&expected, &actual).is_pass());
    }

    #[test]
    fn test_outer_k_single_block() {
        let (expected, actual) = run(BlockShape::new(32, 64, 32), TilingPolicy::OuterK, KernelOptions::default());
        assert!(compare(&expected, &actual).is_pass());
    }

    #[test]
    fn test_tail_odd_rows() {
        let (expected, actual) = run(BlockShape::new(19, 27, 10), TilingPolicy::Tail, KernelOptions::default());
        assert!(compare(&expected, &actual).is_pass());
    }

    #[test]
    fn test_tail_config_extents() {
        let kernel = Kernel::generate(BlockShape::new(23, 20, 6), TilingPolicy::Tail, KernelOptions::default()).unwrap();
        let config = kernel.config();
        assert_eq!(config.shape(block_2x2::C00), TileShape::new(12, 64).unwrap());
        assert_eq!(config.shape(block_2x2::C11), TileShape::new(11, 16).unwrap());
        assert_eq!(config.shape(block_2x2::A1), TileShape::new(11, 12).unwrap());
        assert_eq!(config.shape(block_2x2::B0), TileShape::new(3, 64).unwrap());
        assert_eq!(config.shape(block_2x2::B1), TileShape::new(3, 16).unwrap());
    }

    #[test]
    fn test_rejects_unsupported_shapes() {
        let cases = [
            (BlockShape::new(16, 32, 32), TilingPolicy::FixedK),
            (BlockShape::new(32, 32, 48), TilingPolicy::FixedK),
            (BlockShape::new(32, 48, 32), TilingPolicy::OuterN),
            (BlockShape::new(32, 0, 32), TilingPolicy::OuterK),
            (BlockShape::new(16, 20, 8), TilingPolicy::Tail),
            (BlockShape::new(20, 33, 8), TilingPolicy::Tail),
            (BlockShape::new(20, 20, 7), TilingPolicy::Tail),
            (BlockShape::new(20, 20, 34), TilingPolicy::Tail),
        ];
        for (shape, policy) in cases {
            let result = Kernel::generate(shape, policy, KernelOptions::default());
            assert!(
                matches!(result, Err(Error::ShapeConfiguration { .. })),
                "{policy} accepted {shape}"
            );
        }
    }

    #[test]
    #[should_panic(expected = "active tile configuration does not match")]
    fn test_invoke_checks_active_config() {
        let full = Kernel::generate(BlockShape::new(32, 32, 32), TilingPolicy::FixedK, KernelOptions::default()).unwrap();
        let tail = Kernel::generate(BlockShape::new(20, 20, 8), TilingPolicy::Tail, KernelOptions::default()).unwrap();

        let a = Tensor2D::random_small_ints(20, 8, 1);
        let b = PackedB::pack(&Tensor2D::random_small_ints(8, 20, 2), PackOrder::KMajor);
        let mut c = Tensor2D::new(20, 20);

        let scope = TileScope::<Emulated>::activate(full.config()).unwrap();
        tail.run_at(&scope, &a, &b, &mut c, Origin::ZERO);
    }
}
