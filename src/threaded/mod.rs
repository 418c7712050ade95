//! Multi-threaded driver for the tile kernels.
//!
//! Output blocks are distributed statically across a fork-join team. Tile
//! state is per thread, so each worker configures its own tile registers
//! before running any kernel and releases them when it finishes.
//!
//! - `partition`: balanced block assignment (`balance211`, rows or grid)
//! - `parallel`: the scoped-thread driver

pub mod parallel;
pub mod partition;

pub use parallel::parallel_matmul;
pub use partition::{Partition, balance211};
