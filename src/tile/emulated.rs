//! Software model of the tile register file.
//!
//! Mirrors the architectural behaviour of the AMX-BF16 instructions closely
//! enough to validate kernels bit-for-bit on machines without the hardware:
//! loads and stores touch exactly `rows × colsb` bytes, bytes past the
//! configured extent read back as zero, and `dot_bf16` rejects operand shapes
//! and register triples the hardware would fault on. Faults are panics here.
//!
//! `dot_bf16` follows the instruction's arithmetic: both products of a pair
//! are added to the accumulator in turn with round-to-nearest-even, and
//! denormal inputs and results are flushed to zero.

use std::cell::RefCell;

use half::bf16;

use super::{MAX_COLSB, MAX_ROWS, TILE_COUNT, Tile, TileConfig, TileUnit};
use crate::error::Result;

const TILE_BYTES: usize = MAX_ROWS * MAX_COLSB;

struct RegisterFile {
    config: TileConfig,
    tiles: [[u8; TILE_BYTES]; TILE_COUNT],
}

thread_local! {
    static REGISTERS: RefCell<Option<Box<RegisterFile>>> = const { RefCell::new(None) };
}

fn with_registers<R>(f: impl FnOnce(&mut RegisterFile) -> R) -> R {
    REGISTERS.with(|cell| {
        let mut registers = cell.borrow_mut();
        let file = registers
            .as_mut()
            .expect("tile instruction executed before a tile configuration was loaded on this thread");
        f(file)
    })
}

fn configured_shape(file: &RegisterFile, tile: Tile) -> (usize, usize) {
    let shape = file.config.shape(tile);
    assert!(shape.is_configured(), "{tile} is not configured");
    (shape.rows(), shape.colsb())
}

/// Denormals read and written by `tdpbf16ps` are treated as signed zero.
fn flush_denormal(value: f32) -> f32 {
    if value.is_subnormal() {
        0.0f32.copysign(value)
    } else {
        value
    }
}

fn read_bf16(tile: &[u8; TILE_BYTES], offset: usize) -> f32 {
    flush_denormal(bf16::from_bits(u16::from_le_bytes([tile[offset], tile[offset + 1]])).to_f32())
}

fn read_f32(tile: &[u8; TILE_BYTES], offset: usize) -> f32 {
    f32::from_le_bytes([
        tile[offset],
        tile[offset + 1],
        tile[offset + 2],
        tile[offset + 3],
    ])
}

/// Emulated tile unit, one register file per thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Emulated;

impl TileUnit for Emulated {
    const NAME: &'static str = "emulated";

    fn configure(config: &TileConfig) -> Result<()> {
        REGISTERS.with(|cell| {
            *cell.borrow_mut() = Some(Box::new(RegisterFile {
                config: *config,
                tiles: [[0; TILE_BYTES]; TILE_COUNT],
            }));
        });
        Ok(())
    }

    fn release() {
        REGISTERS.with(|cell| *cell.borrow_mut() = None);
    }

    unsafe fn zero(tile: Tile) {
        with_registers(|file| {
            configured_shape(file, tile);
            file.tiles[tile.index()] = [0; TILE_BYTES];
        });
    }

    unsafe fn load(tile: Tile, src: *const u8, stride: usize) {
        with_registers(|file| {
            let (rows, colsb) = configured_shape(file, tile);
            let dst = &mut file.tiles[tile.index()];
            dst.fill(0);
            for row in 0..rows {
                // SAFETY: the caller guarantees `colsb` readable bytes per configured row.
                let src_row = unsafe { std::slice::from_raw_parts(src.add(row * stride), colsb) };
                dst[row * MAX_COLSB..row * MAX_COLSB + colsb].copy_from_slice(src_row);
            }
        });
    }

    unsafe fn store(dst: *mut u8, stride: usize, tile: Tile) {
        with_registers(|file| {
            let (rows, colsb) = configured_shape(file, tile);
            let src = &file.tiles[tile.index()];
            for row in 0..rows {
                // SAFETY: the caller guarantees `colsb` writable bytes per configured row.
                let dst_row =
                    unsafe { std::slice::from_raw_parts_mut(dst.add(row * stride), colsb) };
                dst_row.copy_from_slice(&src[row * MAX_COLSB..row * MAX_COLSB + colsb]);
            }
        });
    }

    unsafe fn dot_bf16(dst: Tile, a: Tile, b: Tile) {
        assert!(
            dst != a && dst != b && a != b,
            "tdpbf16ps needs three distinct tiles, got {dst}, {a}, {b}"
        );
        with_registers(|file| {
            let (c_rows, c_colsb) = configured_shape(file, dst);
            let (a_rows, a_colsb) = configured_shape(file, a);
            let (b_rows, b_colsb) = configured_shape(file, b);
            assert!(
                a_colsb % 4 == 0 && b_rows == a_colsb / 4,
                "tdpbf16ps: {a} is {a_rows}x{a_colsb}B but {b} has {b_rows} rows"
            );
            assert!(
                c_rows == a_rows && c_colsb == b_colsb && c_colsb % 4 == 0,
                "tdpbf16ps: {dst} is {c_rows}x{c_colsb}B, operands give {a_rows}x{b_colsb}B"
            );

            let pairs = a_colsb / 4;
            let cols = c_colsb / 4;
            let a_tile = file.tiles[a.index()];
            let b_tile = file.tiles[b.index()];
            let c_tile = &mut file.tiles[dst.index()];

            for m in 0..c_rows {
                for n in 0..cols {
                    let c_offset = m * MAX_COLSB + n * 4;
                    let mut acc = flush_denormal(read_f32(c_tile, c_offset));
                    for p in 0..pairs {
                        let a_offset = m * MAX_COLSB + p * 4;
                        let b_offset = p * MAX_COLSB + n * 4;
                        // Each product is exact in FP32; the two lanes round into
                        // the accumulator one after the other.
                        for lane in [0, 2] {
                            let product = read_bf16(&a_tile, a_offset + lane) * read_bf16(&b_tile, b_offset + lane);
                            acc = flush_denormal(acc + product);
                        }
                    }
                    c_tile[c_offset..c_offset + 4].copy_from_slice(&acc.to_le_bytes());
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{TileScope, TileShape};

    fn bf16_bytes(values: &[f32]) -> Vec<u8> {
        values
            .iter()
            .flat_map(|v| bf16::from_f32(*v).to_bits().to_le_bytes())
            .collect()
    }

    #[test]
    fn test_load_store_respects_shape() {
        let config = TileConfig::from_shapes(&[TileShape::new(3, 8).unwrap()]);
        let _scope = TileScope::<Emulated>::activate(&config).unwrap();

        let src: Vec<u8> = (0..64).collect();
        let mut dst = vec![0xAAu8; 64];
        unsafe {
            Emulated::load(Tile::TMM0, src.as_ptr(), 16);
            Emulated::store(dst.as_mut_ptr(), 16, Tile::TMM0);
        }

        for row in 0..4 {
            for col in 0..16 {
                let i = row * 16 + col;
                if row < 3 && col < 8 {
                    assert_eq!(dst[i], src[i], "byte {i} should be copied");
                } else {
                    assert_eq!(dst[i], 0xAA, "byte {i} is outside the tile");
                }
            }
        }
    }

    #[test]
    fn test_dot_bf16_pairs() {
        // A: 1 row x 4 values, B: 2 pair-rows x 1 column -> C: 1x1
        let config = TileConfig::from_shapes(&[
            TileShape::new(1, 4).unwrap(),
            TileShape::new(1, 8).unwrap(),
            TileShape::new(2, 4).unwrap(),
        ]);
        let _scope = TileScope::<Emulated>::activate(&config).unwrap();

        let a = bf16_bytes(&[1.0, 2.0, 3.0, 4.0]);
        // B column is (5, 6, 7, 8) stored as pairs (5,6) and (7,8)
        let b = bf16_bytes(&[5.0, 6.0, 7.0, 8.0]);
        let mut c = [0u8; 4];
        unsafe {
            Emulated::zero(Tile::TMM0);
            Emulated::load(Tile::TMM1, a.as_ptr(), 8);
            Emulated::load(Tile::TMM2, b.as_ptr(), 4);
            Emulated::dot_bf16(Tile::TMM0, Tile::TMM1, Tile::TMM2);
            Emulated::dot_bf16(Tile::TMM0, Tile::TMM1, Tile::TMM2);
            Emulated::store(c.as_mut_ptr(), 4, Tile::TMM0);
        }

        assert_eq!(f32::from_le_bytes(c), 2.0 * (5.0 + 12.0 + 21.0 + 32.0));
    }

    #[test]
    #[should_panic(expected = "tdpbf16ps")]
    fn test_dot_rejects_mismatched_shapes() {
        let config = TileConfig::from_shapes(&[
            TileShape::FULL,
            TileShape::FULL,
            TileShape::new(8, 64).unwrap(),
        ]);
        let _scope = TileScope::<Emulated>::activate(&config).unwrap();
        unsafe { Emulated::dot_bf16(Tile::TMM0, Tile::TMM1, Tile::TMM2) };
    }

    fn dot_one_pair(a: [f32; 2], b: [f32; 2], c: f32) -> f32 {
        let config = TileConfig::from_shapes(&[
            TileShape::new(1, 4).unwrap(),
            TileShape::new(1, 4).unwrap(),
            TileShape::new(1, 4).unwrap(),
        ]);
        let _scope = TileScope::<Emulated>::activate(&config).unwrap();

        let a = bf16_bytes(&a);
        let b = bf16_bytes(&b);
        let mut out = c.to_le_bytes();
        unsafe {
            Emulated::load(Tile::TMM0, out.as_ptr(), 4);
            Emulated::load(Tile::TMM1, a.as_ptr(), 4);
            Emulated::load(Tile::TMM2, b.as_ptr(), 4);
            Emulated::dot_bf16(Tile::TMM0, Tile::TMM1, Tile::TMM2);
            Emulated::store(out.as_mut_ptr(), 4, Tile::TMM0);
        }
        f32::from_le_bytes(out)
    }

    #[test]
    fn test_dot_rounds_each_product_into_accumulator() {
        let tiny = 2f32.powi(-24);
        // 1 + 2^-24 rounds back to 1 twice; summing the pair first would give 1 + 2^-23.
        assert_eq!(dot_one_pair([tiny, tiny], [1.0, 1.0], 1.0), 1.0);
    }

    #[test]
    fn test_dot_flushes_denormals() {
        let denormal = 2f32.powi(-130);
        assert!(denormal.is_subnormal());
        // Denormal input is read as zero, so the large factor does not rescue it.
        assert_eq!(dot_one_pair([denormal, 0.0], [2f32.powi(100), 0.0], 0.0), 0.0);
        // A denormal result is written as zero.
        let small = 2f32.powi(-70);
        assert_eq!(dot_one_pair([small, 0.0], [small, 0.0], 0.0), 0.0);
    }

    #[test]
    #[should_panic(expected = "three distinct tiles")]
    fn test_dot_rejects_repeated_tiles() {
        let config = TileConfig::from_shapes(&[TileShape::FULL; 8]);
        let _scope = TileScope::<Emulated>::activate(&config).unwrap();
        unsafe { Emulated::dot_bf16(Tile::TMM0, Tile::TMM1, Tile::TMM0) };
    }

    #[test]
    #[should_panic(expected = "before a tile configuration")]
    fn test_unconfigured_thread_faults() {
        unsafe { Emulated::zero(Tile::TMM0) };
    }
}
