//! 2x2 tile accumulate primitive shared by every tiling policy.
//!
//! Register roles:
//! ```text
//!            B0 (tmm6)   B1 (tmm7)
//! A0 (tmm4)  C00 (tmm0)  C01 (tmm2)
//! A1 (tmm5)  C10 (tmm1)  C11 (tmm3)
//! ```
//! A0/A1 cover the upper and lower row halves of a 32-row block, B0/B1 the
//! left and right 16-column halves of a 32-column group.
//!
//! All functions take byte pointers and byte strides, and all are `unsafe`:
//! the caller must hold a [`TileScope`](crate::tile::TileScope) whose
//! configuration matches the role shapes, and every pointer must cover the
//! configured extent of the tile it feeds.

use crate::blocked::BLOCK_BYTES;
use crate::tile::{Tile, TileUnit};

pub const C00: Tile = Tile::TMM0;
pub const C10: Tile = Tile::TMM1;
pub const C01: Tile = Tile::TMM2;
pub const C11: Tile = Tile::TMM3;
pub const A0: Tile = Tile::TMM4;
pub const A1: Tile = Tile::TMM5;
pub const B0: Tile = Tile::TMM6;
pub const B1: Tile = Tile::TMM7;

/// A bytes consumed per K step (32 BF16 values).
pub const A_STEP: usize = 64;
/// Packed-B bytes consumed per K step of one 32-column group.
pub const B_STEP: usize = 2 * BLOCK_BYTES;
/// Offset of the right-hand 16-column block.
pub const B_RIGHT: usize = BLOCK_BYTES;
/// Row stride of a packed-B tile.
pub const B_STRIDE: usize = 64;
/// Offset of the right-hand C tiles (16 FP32 columns).
pub const C_RIGHT: usize = 64;
/// C bytes between adjacent 32-column groups.
pub const C_GROUP: usize = 2 * C_RIGHT;

pub unsafe fn zero_c<U: TileUnit>() {
    unsafe {
        U::zero(C00);
        U::zero(C01);
        U::zero(C10);
        U::zero(C11);
    }
}

/// Loads the four accumulators. `lower` is the byte offset of the C10 row.
pub unsafe fn load_c<U: TileUnit>(c: *const u8, ldc: usize, lower: usize) {
    unsafe {
        U::load(C00, c, ldc);
        U::load(C01, c.add(C_RIGHT), ldc);
        U::load(C10, c.add(lower), ldc);
        U::load(C11, c.add(lower + C_RIGHT), ldc);
    }
}

pub unsafe fn store_c<U: TileUnit>(c: *mut u8, ldc: usize, lower: usize) {
    unsafe {
        U::store(c, ldc, C00);
        U::store(c.add(C_RIGHT), ldc, C01);
        U::store(c.add(lower), ldc, C10);
        U::store(c.add(lower + C_RIGHT), ldc, C11);
    }
}

pub unsafe fn load_a<U: TileUnit>(a: *const u8, lda: usize, lower: usize) {
    unsafe {
        U::load(A0, a, lda);
        U::load(A1, a.add(lower), lda);
    }
}

/// Loads B0/B1 from one packed K step and issues the four dot products.
pub unsafe fn multiply_b<U: TileUnit>(b: *const u8) {
    unsafe {
        U::load(B0, b, B_STRIDE);
        U::load(B1, b.add(B_RIGHT), B_STRIDE);
        U::dot_bf16(C00, A0, B0);
        U::dot_bf16(C01, A0, B1);
        U::dot_bf16(C10, A1, B0);
        U::dot_bf16(C11, A1, B1);
    }
}

/// Runs `k_steps` consecutive K steps into the live accumulators.
///
/// With `prefetch`, the next step's A rows and B blocks are requested into L1
/// before the current step's loads.
pub unsafe fn accumulate_k<U: TileUnit>(
    a: *const u8,
    lda: usize,
    lower: usize,
    b: *const u8,
    k_steps: usize,
    prefetch: bool,
) {
    for step in 0..k_steps {
        let a_step = a.wrapping_add(step * A_STEP);
        let b_step = b.wrapping_add(step * B_STEP);
        if prefetch && step + 1 < k_steps {
            prefetch_step(a_step.wrapping_add(A_STEP), lda, lower, b_step.wrapping_add(B_STEP));
        }
        unsafe {
            load_a::<U>(a_step, lda, lower);
            multiply_b::<U>(b_step);
        }
    }
}

fn prefetch_step(a: *const u8, lda: usize, lower: usize, b: *const u8) {
    let a_rows = lower / lda.max(1);
    for row in 0..2 * a_rows {
        prefetch_line(a.wrapping_add(row * lda));
    }
    for line in (0..B_STEP).step_by(64) {
        prefetch_line(b.wrapping_add(line));
    }
}

#[inline(always)]
fn prefetch_line(ptr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    {
        use std::arch::x86_64::{_MM_HINT_T0, _mm_prefetch};
        // SAFETY: prefetch is a hint and never faults, whatever the address.
        #[allow(unused_unsafe)]
        unsafe {
            _mm_prefetch::<_MM_HINT_T0>(ptr as *const i8)
        };
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{Emulated, TileConfig, TileScope, TileShape};

    #[test]
    fn test_one_step_of_ones() {
        let config = TileConfig::from_shapes(&[TileShape::FULL; 8]);
        let _scope = TileScope::<Emulated>::activate(&config).unwrap();

        // A: 32 rows x 32 ones (BF16 1.0 = 0x3f80), B: two 1 KiB blocks of ones.
        let one = half::bf16::ONE.to_bits().to_le_bytes();
        let a: Vec<u8> = one.iter().copied().cycle().take(32 * 64).collect();
        let b: Vec<u8> = one.iter().copied().cycle().take(B_STEP).collect();
        let mut c = vec![0f32; 32 * 32];
        let ldc = 32 * 4;

        unsafe {
            zero_c::<Emulated>();
            accumulate_k::<Emulated>(a.as_ptr(), 64, 16 * 64, b.as_ptr(), 1, true);
            store_c::<Emulated>(c.as_mut_ptr() as *mut u8, ldc, 16 * ldc);
        }
        assert!(c.iter().all(|v| *v == 32.0));
    }
}
