//! Operand buffers, the reference product, and correctness checks.
//!
//! These provide the correctness baseline that every generated tile kernel
//! is compared against.

pub mod compare;
pub mod reference;
pub mod tensor;

pub use compare::{Verdict, compare};
pub use reference::matmul_reference;
pub use tensor::Tensor2D;
