use half::bf16;

use super::tensor::Tensor2D;

/// Reference product `C = A × B` in FP32, i-k-j loop order.
///
/// Inputs are widened from BF16 and accumulated in FP32 along K in order.
/// With small-integer operands every intermediate is exact, so the tile
/// kernels must reproduce this result bit for bit.
///
/// # Panics
///
/// Panics if `a.cols() != b.rows()`.
pub fn matmul_reference(a: &Tensor2D<bf16>, b: &Tensor2D<bf16>) -> Tensor2D<f32> {
    assert_eq!(
        a.cols(),
        b.rows(),
        "A is {}x{} but B is {}x{}",
        a.rows(),
        a.cols(),
        b.rows(),
        b.cols()
    );

    let (m, k, n) = (a.rows(), a.cols(), b.cols());
    let mut c = Tensor2D::<f32>::new(m, n);
    for i in 0..m {
        for p in 0..k {
            let a_ip = a[(i, p)].to_f32();
            let b_row = b.row(p);
            let c_row = c.row_mut(i);
            for j in 0..n {
                c_row[j] += a_ip * b_row[j].to_f32();
            }
        }
    }
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_2x3_times_3x2() {
        let a = Tensor2D::from_fn(2, 3, |r, c| bf16::from_f32((r * 3 + c + 1) as f32));
        let b = Tensor2D::from_fn(3, 2, |r, c| bf16::from_f32((r * 2 + c + 7) as f32));

        let c = matmul_reference(&a, &b);

        assert_eq!(c.row(0), &[58.0, 64.0]);
        assert_eq!(c.row(1), &[139.0, 154.0]);
    }

    #[test]
    #[should_panic(expected = "A is 2x3")]
    fn test_dimension_mismatch() {
        let a = Tensor2D::<bf16>::new(2, 3);
        let b = Tensor2D::<bf16>::new(4, 2);
        matmul_reference(&a, &b);
    }
}
