//! Row-major 2-D buffer with a cache-line aligned row stride.

use std::fmt;
use std::ops::{Index, IndexMut};

use half::bf16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Bytes per cache line.
pub const CACHE_LINE: usize = 64;

/// Row-major matrix whose row stride is a whole number of cache lines.
///
/// The logical width (`cols`) is independent of the stride; elements between
/// `cols` and `stride` are padding and never part of the matrix.
#[derive(Clone, PartialEq)]
pub struct Tensor2D<T> {
    rows: usize,
    cols: usize,
    stride: usize,
    data: Vec<T>,
}

fn aligned_stride<T>(cols: usize) -> usize {
    let per_line = (CACHE_LINE / std::mem::size_of::<T>().max(1)).max(1);
    cols.div_ceil(per_line) * per_line
}

impl<T: Copy + Default> Tensor2D<T> {
    /// Zero-initialized (`T::default()`) matrix.
    pub fn new(rows: usize, cols: usize) -> Self {
        let stride = aligned_stride::<T>(cols);
        Tensor2D {
            rows,
            cols,
            stride,
            data: vec![T::default(); rows * stride],
        }
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut tensor = Self::new(rows, cols);
        for r in 0..rows {
            for c in 0..cols {
                tensor[(r, c)] = f(r, c);
            }
        }
        tensor
    }

    pub fn fill(&mut self, value: T) {
        for r in 0..self.rows {
            self.row_mut(r).fill(value);
        }
    }
}

impl<T> Tensor2D<T> {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Row stride in elements.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Row stride in bytes, always a multiple of [`CACHE_LINE`].
    pub fn stride_bytes(&self) -> usize {
        self.stride * std::mem::size_of::<T>()
    }

    pub fn row(&self, r: usize) -> &[T] {
        &self.data[r * self.stride..r * self.stride + self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [T] {
        &mut self.data[r * self.stride..r * self.stride + self.cols]
    }

    /// Pointer to element `(r, c)`; `r == rows` or `c == cols` yields a one-past pointer.
    pub fn ptr_at(&self, r: usize, c: usize) -> *const T {
        assert!(r <= self.rows && c <= self.cols, "({r}, {c}) outside {}x{}", self.rows, self.cols);
        self.data.as_ptr().wrapping_add(r * self.stride + c)
    }

    pub fn ptr_at_mut(&mut self, r: usize, c: usize) -> *mut T {
        assert!(r <= self.rows && c <= self.cols, "({r}, {c}) outside {}x{}", self.rows, self.cols);
        self.data.as_mut_ptr().wrapping_add(r * self.stride + c)
    }

    /// Iterates `((row, col), &value)` over the logical elements.
    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize), &T)> + '_ {
        (0..self.rows).flat_map(move |r| self.row(r).iter().enumerate().map(move |(c, v)| ((r, c), v)))
    }
}

impl Tensor2D<bf16> {
    /// Random small integers in `[-4, 4]`, exactly representable in BF16 so
    /// that every product and partial sum of a moderate-size matmul is exact in FP32.
    pub fn random_small_ints(rows: usize, cols: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::from_fn(rows, cols, |_, _| bf16::from_f32(rng.gen_range(-4i32..=4) as f32))
    }
}

impl<T> Index<(usize, usize)> for Tensor2D<T> {
    type Output = T;

    fn index(&self, (r, c): (usize, usize)) -> &T {
        debug_assert!(r < self.rows && c < self.cols);
        &self.data[r * self.stride + c]
    }
}

impl<T> IndexMut<(usize, usize)> for Tensor2D<T> {
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut T {
        debug_assert!(r < self.rows && c < self.cols);
        &mut self.data[r * self.stride + c]
    }
}

impl<T: fmt::Display> fmt::Display for Tensor2D<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}x{}, stride {}]", self.rows, self.cols, self.stride)?;
        for r in 0..self.rows {
            for (c, value) in self.row(r).iter().enumerate() {
                if c > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{value:>6}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl<T> fmt::Debug for Tensor2D<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor2D")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}
