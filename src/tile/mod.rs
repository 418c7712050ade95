//! Tile-register file abstraction.
//!
//! A tile unit holds eight 2-D registers (`tmm0`..`tmm7`), each up to 16 rows
//! of 64 bytes. Before any tile instruction runs, the calling thread must load
//! a [`TileConfig`] that gives every register its row count and row width.
//! That configuration is per-thread hardware state, so it is modelled here as
//! a scoped resource ([`TileScope`]) rather than as shared memory.
//!
//! Two units implement [`TileUnit`]:
//! - [`Amx`]: the real Intel AMX instructions through inline assembly
//! - [`Emulated`]: a bit-exact software model of the same register file
//!
//! Kernels are written once against the trait and run on either unit.

pub mod amx;
pub mod emulated;

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use crate::error::{Error, Result};

pub use amx::Amx;
pub use emulated::Emulated;

/// Number of tile registers.
pub const TILE_COUNT: usize = 8;
/// Maximum rows of one tile register.
pub const MAX_ROWS: usize = 16;
/// Maximum bytes per tile row.
pub const MAX_COLSB: usize = 64;

/// Index of one tile register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tile(u8);

impl Tile {
    pub const TMM0: Tile = Tile(0);
    pub const TMM1: Tile = Tile(1);
    pub const TMM2: Tile = Tile(2);
    pub const TMM3: Tile = Tile(3);
    pub const TMM4: Tile = Tile(4);
    pub const TMM5: Tile = Tile(5);
    pub const TMM6: Tile = Tile(6);
    pub const TMM7: Tile = Tile(7);

    pub fn new(index: usize) -> Option<Tile> {
        (index < TILE_COUNT).then_some(Tile(index as u8))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmm{}", self.0)
    }
}

/// Shape of one tile register: valid rows and bytes per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TileShape {
    rows: u8,
    colsb: u16,
}

impl TileShape {
    /// Full 16 × 64-byte tile.
    pub const FULL: TileShape = TileShape {
        rows: MAX_ROWS as u8,
        colsb: MAX_COLSB as u16,
    };

    /// Returns `None` unless `1 <= rows <= 16` and `1 <= colsb <= 64`.
    pub fn new(rows: usize, colsb: usize) -> Option<TileShape> {
        if (1..=MAX_ROWS).contains(&rows) && (1..=MAX_COLSB).contains(&colsb) {
            Some(TileShape {
                rows: rows as u8,
                colsb: colsb as u16,
            })
        } else {
            None
        }
    }

    pub fn rows(&self) -> usize {
        self.rows as usize
    }

    pub fn colsb(&self) -> usize {
        self.colsb as usize
    }

    pub fn is_configured(&self) -> bool {
        self.rows != 0 && self.colsb != 0
    }
}

/// The 64-byte tile configuration block consumed by `ldtilecfg`.
///
/// Layout (palette 1): byte 0 palette id, byte 1 start row, bytes 16..48 the
/// per-tile `colsb` words, bytes 48..64 the per-tile row counts. Only the
/// first [`TILE_COUNT`] slots of each array are meaningful.
#[repr(C, align(64))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TileConfig {
    palette_id: u8,
    start_row: u8,
    reserved: [u8; 14],
    colsb: [u16; 16],
    rows: [u8; 16],
}

impl TileConfig {
    /// Palette-1 configuration with every tile unconfigured.
    pub fn new() -> Self {
        TileConfig {
            palette_id: 1,
            start_row: 0,
            reserved: [0; 14],
            colsb: [0; 16],
            rows: [0; 16],
        }
    }

    /// Builds a configuration from the shapes of `tmm0`, `tmm1`, ... in order.
    pub fn from_shapes(shapes: &[TileShape]) -> Self {
        assert!(shapes.len() <= TILE_COUNT, "at most {TILE_COUNT} tiles");
        let mut config = TileConfig::new();
        for (index, shape) in shapes.iter().enumerate() {
            config.set(Tile(index as u8), *shape);
        }
        config
    }

    pub fn set(&mut self, tile: Tile, shape: TileShape) {
        self.rows[tile.index()] = shape.rows;
        self.colsb[tile.index()] = shape.colsb;
    }

    pub fn shape(&self, tile: Tile) -> TileShape {
        TileShape {
            rows: self.rows[tile.index()],
            colsb: self.colsb[tile.index()],
        }
    }

    pub fn palette(&self) -> u8 {
        self.palette_id
    }

    /// Raw view of the 64-byte block.
    pub fn as_bytes(&self) -> &[u8; 64] {
        // SAFETY: repr(C) with only integer fields, size 64, no padding.
        unsafe { &*(self as *const TileConfig as *const [u8; 64]) }
    }
}

impl Default for TileConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileConfig")
            .field("palette", &self.palette_id)
            .field("rows", &&self.rows[..TILE_COUNT])
            .field("colsb", &&self.colsb[..TILE_COUNT])
            .finish()
    }
}

impl fmt::Display for TileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for tile in (0..TILE_COUNT).filter_map(Tile::new) {
            let shape = self.shape(tile);
            if tile != Tile::TMM0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}x{}B", tile, shape.rows(), shape.colsb())?;
        }
        Ok(())
    }
}

/// Operations of a tile-register unit.
///
/// Every operation acts on the calling thread's tile state. The primitives
/// are `unsafe` because on real hardware running them without a matching
/// configuration, or with pointers that do not cover `rows × colsb` bytes at
/// the given stride, is undefined behaviour.
pub trait TileUnit: 'static {
    const NAME: &'static str;

    /// Installs `config` for the calling thread.
    fn configure(config: &TileConfig) -> Result<()>;

    /// Returns the calling thread's tile state to its initial, unconfigured state.
    fn release();

    /// Sets every configured element of `tile` to zero.
    ///
    /// # Safety
    /// The calling thread must hold an active configuration.
    unsafe fn zero(tile: Tile);

    /// Loads `rows` rows of `colsb` bytes starting at `src`, `stride` bytes apart.
    ///
    /// # Safety
    /// `src + r * stride .. + colsb` must be readable for every configured row `r`.
    unsafe fn load(tile: Tile, src: *const u8, stride: usize);

    /// Stores the configured extent of `tile` to `dst`, `stride` bytes between rows.
    ///
    /// # Safety
    /// `dst + r * stride .. + colsb` must be writable for every configured row `r`.
    unsafe fn store(dst: *mut u8, stride: usize, tile: Tile);

    /// `dst += a · b` with BF16 inputs and FP32 accumulation.
    ///
    /// `a` holds `rows × K` BF16 values; `b` holds `K/2` rows of interleaved
    /// pairs, so element `(p, n)` of `b` is the pair `(B[2p][n], B[2p+1][n])`.
    ///
    /// # Safety
    /// The shapes of `dst`, `a` and `b` in the active configuration must agree.
    unsafe fn dot_bf16(dst: Tile, a: Tile, b: Tile);
}

thread_local! {
    static SCOPE_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Active tile configuration on the current thread.
///
/// Created with [`TileScope::activate`] and released on drop. The scope is
/// neither `Send` nor `Sync`: tile state belongs to the thread that loaded
/// it, and every worker thread has to activate its own scope.
pub struct TileScope<U: TileUnit> {
    config: TileConfig,
    _unit: PhantomData<U>,
    _thread_bound: PhantomData<*const ()>,
}

impl<U: TileUnit> TileScope<U> {
    pub fn activate(config: &TileConfig) -> Result<Self> {
        if SCOPE_ACTIVE.with(Cell::get) {
            return Err(Error::TileScopeActive);
        }
        U::configure(config)?;
        SCOPE_ACTIVE.with(|active| active.set(true));
        Ok(TileScope {
            config: *config,
            _unit: PhantomData,
            _thread_bound: PhantomData,
        })
    }

    pub fn config(&self) -> &TileConfig {
        &self.config
    }
}

impl<U: TileUnit> Drop for TileScope<U> {
    fn drop(&mut self) {
        U::release();
        SCOPE_ACTIVE.with(|active| active.set(false));
    }
}

impl<U: TileUnit> fmt::Debug for TileScope<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileScope")
            .field("unit", &U::NAME)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_layout() {
        assert_eq!(std::mem::size_of::<TileConfig>(), 64);
        assert_eq!(std::mem::align_of::<TileConfig>(), 64);

        let mut config = TileConfig::new();
        config.set(Tile::TMM2, TileShape::new(7, 20).unwrap());

        let bytes = config.as_bytes();
        assert_eq!(bytes[0], 1, "palette id");
        assert_eq!(u16::from_le_bytes([bytes[16 + 4], bytes[16 + 5]]), 20);
        assert_eq!(bytes[48 + 2], 7);
    }

    #[test]
    fn test_config_display_lists_every_tile() {
        let mut config = TileConfig::new();
        config.set(Tile::TMM0, TileShape::new(16, 64).unwrap());
        config.set(Tile::TMM7, TileShape::new(3, 8).unwrap());

        let text = config.to_string();
        assert!(text.starts_with("tmm0=16x64B, tmm1=0x0B"));
        assert!(text.ends_with(", tmm7=3x8B"));
        assert_eq!(text.matches("tmm").count(), TILE_COUNT);
    }

    #[test]
    fn test_tile_shape_bounds() {
        assert!(TileShape::new(16, 64).is_some());
        assert!(TileShape::new(1, 4).is_some());
        assert!(TileShape::new(17, 64).is_none());
        assert!(TileShape::new(16, 65).is_none());
        assert!(TileShape::new(0, 64).is_none());
        assert!(Tile::new(8).is_none());
    }

    #[test]
    fn test_scope_is_exclusive_per_thread() {
        let config = TileConfig::from_shapes(&[TileShape::FULL; 8]);
        let scope = TileScope::<Emulated>::activate(&config).unwrap();
        assert!(matches!(
            TileScope::<Emulated>::activate(&config),
            Err(Error::TileScopeActive)
        ));

        // Another thread has its own tile state.
        std::thread::spawn(move || {
            let other = TileScope::<Emulated>::activate(&config);
            assert!(other.is_ok());
        })
        .join()
        .unwrap();

        drop(scope);
        assert!(TileScope::<Emulated>::activate(&config).is_ok());
    }
}
