//! Reorders operand B into the blocked layout read by the tile kernels.
//!
//! A B tile holds 16 rows of 64 bytes: row `p` carries the BF16 pairs
//! `(B[2p][n], B[2p+1][n])` for 16 consecutive columns `n`. One packed block
//! is therefore 32 K-values × 16 columns = 512 elements (1 KiB), laid out as
//! `[16 k-pairs][16 n][2 k]`. Blocks follow one of two traversal orders:
//!
//! - [`PackOrder::KMajor`]: for each 32-deep K step, every 16-column block
//!   left to right (`KN16k16n2k`)
//! - [`PackOrder::NMajor`]: for each 32-column group, for each K step, the
//!   left then the right 16-column block (`NK2n16k16n2k`)
//!
//! Both orders put the two halves of a 32-column group for one K step next to
//! each other, which is what the kernels' `B0`/`B0 + 1 KiB` loads assume.

use half::bf16;

use crate::matrix::Tensor2D;

/// K values per packed block (one 64-byte A-tile row of BF16).
pub const BLOCK_K: usize = 32;
/// Columns per packed block (one 64-byte C-tile row of FP32).
pub const BLOCK_N: usize = 16;
/// Elements per packed block.
pub const BLOCK_ELEMS: usize = BLOCK_K * BLOCK_N;
/// Bytes per packed block.
pub const BLOCK_BYTES: usize = BLOCK_ELEMS * std::mem::size_of::<bf16>();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackOrder {
    KMajor,
    NMajor,
}

impl PackOrder {
    /// Column padding granularity.
    pub fn n_align(self) -> usize {
        match self {
            PackOrder::KMajor => BLOCK_N,
            PackOrder::NMajor => 2 * BLOCK_N,
        }
    }
}

/// Operand B in blocked layout.
///
/// K is padded to a multiple of [`BLOCK_K`] and N to [`PackOrder::n_align`].
/// Padding elements hold no meaning: tile configurations for boundary shapes
/// exclude them from every load.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedB {
    order: PackOrder,
    k: usize,
    n: usize,
    k_padded: usize,
    n_padded: usize,
    data: Vec<bf16>,
}

impl PackedB {
    /// Packs a row-major `K × N` matrix.
    pub fn pack(src: &Tensor2D<bf16>, order: PackOrder) -> PackedB {
        let (k, n) = (src.rows(), src.cols());
        let k_padded = k.div_ceil(BLOCK_K) * BLOCK_K;
        let n_padded = n.div_ceil(order.n_align()) * order.n_align();

        let mut packed = PackedB {
            order,
            k,
            n,
            k_padded,
            n_padded,
            data: vec![bf16::ZERO; k_padded * n_padded],
        };

        for k0 in (0..k).step_by(BLOCK_K) {
            for n0 in (0..n).step_by(BLOCK_N) {
                let offset = packed.block_offset(k0, n0);
                reorder_block(src, k0, n0, &mut packed.data[offset..offset + BLOCK_ELEMS]);
            }
        }
        packed
    }

    /// Element offset of the block holding `(k0, n0)`.
    ///
    /// `k0` must be a multiple of [`BLOCK_K`] and `n0` of [`BLOCK_N`].
    pub fn block_offset(&self, k0: usize, n0: usize) -> usize {
        debug_assert!(k0 % BLOCK_K == 0 && n0 % BLOCK_N == 0);
        let k_step = k0 / BLOCK_K;
        let block = match self.order {
            PackOrder::KMajor => k_step * (self.n_padded / BLOCK_N) + n0 / BLOCK_N,
            PackOrder::NMajor => {
                let group = n0 / (2 * BLOCK_N);
                let half = (n0 / BLOCK_N) % 2;
                (group * (self.k_padded / BLOCK_K) + k_step) * 2 + half
            }
        };
        block * BLOCK_ELEMS
    }

    /// Maps a buffer offset back to the `(k, n)` element it holds, or `None`
    /// for padding.
    pub fn logical_index(&self, offset: usize) -> Option<(usize, usize)> {
        if offset >= self.data.len() {
            return None;
        }
        let block = offset / BLOCK_ELEMS;
        let within = offset % BLOCK_ELEMS;
        let pair_row = within / (2 * BLOCK_N);
        let col = (within % (2 * BLOCK_N)) / 2;
        let lane = within % 2;

        let (k_step, n_block) = match self.order {
            PackOrder::KMajor => {
                let per_step = self.n_padded / BLOCK_N;
                (block / per_step, block % per_step)
            }
            PackOrder::NMajor => {
                let steps = self.k_padded / BLOCK_K;
                let half = block % 2;
                let rest = block / 2;
                (rest % steps, (rest / steps) * 2 + half)
            }
        };

        let k = k_step * BLOCK_K + pair_row * 2 + lane;
        let n = n_block * BLOCK_N + col;
        (k < self.k && n < self.n).then_some((k, n))
    }

    /// Restores the row-major `K × N` matrix.
    pub fn unpack(&self) -> Tensor2D<bf16> {
        let mut out = Tensor2D::new(self.k, self.n);
        for (offset, value) in self.data.iter().enumerate() {
            if let Some(index) = self.logical_index(offset) {
                out[index] = *value;
            }
        }
        out
    }

    /// Overwrites every padding element. Kernels never read padding, so the
    /// result of a kernel must not change.
    pub fn fill_padding(&mut self, value: bf16) {
        for offset in 0..self.data.len() {
            if self.logical_index(offset).is_none() {
                self.data[offset] = value;
            }
        }
    }

    pub fn order(&self) -> PackOrder {
        self.order
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn k_padded(&self) -> usize {
        self.k_padded
    }

    pub fn n_padded(&self) -> usize {
        self.n_padded
    }

    /// Required buffer size in elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[bf16] {
        &self.data
    }

    pub fn as_ptr(&self) -> *const bf16 {
        self.data.as_ptr()
    }
}

/// Reorders the valid part of one `32 × 16` region into `[16][16][2]` order.
fn reorder_block(src: &Tensor2D<bf16>, k0: usize, n0: usize, dst: &mut [bf16]) {
    let k_valid = BLOCK_K.min(src.rows() - k0);
    let n_valid = BLOCK_N.min(src.cols() - n0);
    for kk in 0..k_valid {
        let src_row = &src.row(k0 + kk)[n0..n0 + n_valid];
        for (nn, value) in src_row.iter().enumerate() {
            dst[(kk / 2) * 2 * BLOCK_N + nn * 2 + kk % 2] = *value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_layout_pairs_k() {
        // k * 8 + n % 8 stays below 256, so every value is exact in BF16.
        let b = Tensor2D::from_fn(32, 16, |k, n| bf16::from_f32((k * 8 + n % 8) as f32));
        let packed = PackedB::pack(&b, PackOrder::KMajor);
        let data = packed.as_slice();

        assert_eq!(packed.size(), 512);
        // Row p of the tile: (B[2p][n], B[2p+1][n]) for n = 0..16
        assert_eq!(data[0].to_f32(), 0.0);
        assert_eq!(data[1].to_f32(), 8.0);
        assert_eq!(data[2].to_f32(), 1.0);
        assert_eq!(data[3].to_f32(), 9.0);
        assert_eq!(data[32].to_f32(), 16.0);
        // (k=30, n=15) and (k=31, n=15)
        assert_eq!(data[32 * 15 + 2 * 15].to_f32(), 247.0);
        assert_eq!(data[32 * 15 + 2 * 15 + 1].to_f32(), 255.0);
    }

    #[test]
    fn test_orders_agree_on_one_column_group() {
        let b = Tensor2D::random_small_ints(64, 32, 7);
        let k_major = PackedB::pack(&b, PackOrder::KMajor);
        let n_major = PackedB::pack(&b, PackOrder::NMajor);
        assert_eq!(k_major.as_slice(), n_major.as_slice());
    }

    #[test]
    fn test_block_offsets() {
        let b = Tensor2D::<bf16>::new(96, 64);

        let k_major = PackedB::pack(&b, PackOrder::KMajor);
        assert_eq!(k_major.block_offset(0, 16), 512);
        assert_eq!(k_major.block_offset(32, 0), 4 * 512);

        let n_major = PackedB::pack(&b, PackOrder::NMajor);
        assert_eq!(n_major.block_offset(0, 16), 512);
        assert_eq!(n_major.block_offset(32, 0), 2 * 512);
        // Column group 1 starts after all 3 K steps of group 0.
        assert_eq!(n_major.block_offset(0, 32), 96 * 32);
    }

    #[test]
    fn test_padding_sizes() {
        let b = Tensor2D::<bf16>::new(28, 21);
        let k_major = PackedB::pack(&b, PackOrder::KMajor);
        assert_eq!((k_major.k_padded(), k_major.n_padded()), (32, 32));
        assert_eq!(k_major.size(), 32 * 32);

        let b = Tensor2D::<bf16>::new(40, 40);
        let n_major = PackedB::pack(&b, PackOrder::NMajor);
        assert_eq!((n_major.k_padded(), n_major.n_padded()), (64, 64));
    }

    #[test]
    fn test_unpack_restores_source() {
        for order in [PackOrder::KMajor, PackOrder::NMajor] {
            for (k, n) in [(32, 32), (28, 21), (2, 17), (64, 96), (96, 48), (33, 31), (1, 1)] {
                let b = Tensor2D::random_small_ints(k, n, (k * 1000 + n) as u64);
                let packed = PackedB::pack(&b, order);
                assert_eq!(packed.unpack(), b, "{order:?} K={k} N={n}");
            }
        }
    }

    #[test]
    fn test_padding_is_not_logical() {
        let b = Tensor2D::random_small_ints(18, 20, 3);
        let mut packed = PackedB::pack(&b, PackOrder::KMajor);
        packed.fill_padding(bf16::NAN);

        let logical = (0..packed.size())
            .filter(|offset| packed.logical_index(*offset).is_some())
            .count();
        assert_eq!(logical, 18 * 20);
        assert_eq!(packed.unpack(), b);
    }
}
