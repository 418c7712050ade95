//! Blocked operand layouts.
//!
//! The tile-load instruction reads 16 rows of 64 bytes, so operand B has to
//! be reordered into 1 KiB blocks of BF16 pairs before any kernel can use it.
//! The packing is done once per B matrix and shared by every invocation.

pub mod pack;

pub use pack::{BLOCK_BYTES, BLOCK_ELEMS, BLOCK_K, BLOCK_N, PackOrder, PackedB};
