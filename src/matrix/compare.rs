//! Exact comparison of a kernel result against the reference product.

use std::fmt;

use super::tensor::Tensor2D;
use crate::error::{Error, Result};

/// Outcome of a correctness check.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    Fail {
        row: usize,
        col: usize,
        expected: f32,
        actual: f32,
        mismatches: usize,
    },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    /// `[PASS]` or `[FAIL]`, for tagging benchmark lines.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Pass => "[PASS]",
            Verdict::Fail { .. } => "[FAIL]",
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Verdict::Pass => Ok(()),
            Verdict::Fail {
                row,
                col,
                expected,
                actual,
                mismatches,
            } => Err(Error::CorrectnessMismatch {
                row,
                col,
                expected,
                actual,
                mismatches,
            }),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "[PASS]"),
            Verdict::Fail {
                row,
                col,
                expected,
                actual,
                mismatches,
            } => write!(
                f,
                "[FAIL] first mismatch at ({row}, {col}): expected {expected}, got {actual}; {mismatches} total"
            ),
        }
    }
}

/// Compares the logical elements of two matrices for exact equality.
///
/// # Panics
///
/// Panics if the shapes differ.
pub fn compare(expected: &Tensor2D<f32>, actual: &Tensor2D<f32>) -> Verdict {
    assert_eq!(
        (expected.rows(), expected.cols()),
        (actual.rows(), actual.cols()),
        "shape mismatch"
    );

    let mut first = None;
    let mut mismatches = 0;
    for ((r, c), want) in expected.iter() {
        let got = actual[(r, c)];
        // Bitwise equality would reject -0.0 == 0.0; NaN must not compare equal.
        if got != *want {
            mismatches += 1;
            first.get_or_insert((r, c, *want, got));
        }
    }

    match first {
        None => Verdict::Pass,
        Some((row, col, expected, actual)) => Verdict::Fail {
            row,
            col,
            expected,
            actual,
            mismatches,
        },
    }
}
