//! Intel AMX tile unit.
//!
//! Tile registers are named in the instruction encoding, so every operation
//! dispatches the runtime tile index to one of eight fixed `asm!` blocks.
//! `tdpbf16ps` dispatches to one block per ordered triple of distinct tiles;
//! any other triple is rejected before reaching the hardware.

use crate::error::{Error, Result};
use crate::tile::{Tile, TileConfig, TileUnit};

/// Hardware tile unit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Amx;

#[cfg(target_arch = "x86_64")]
mod hw {
    use std::arch::asm;
    use std::sync::OnceLock;

    use crate::tile::{Tile, TileConfig};

    const ARCH_REQ_XCOMP_PERM: libc::c_long = 0x1023;
    const XFEATURE_XTILEDATA: libc::c_long = 18;

    const CPUID_EDX_AMX_BF16: u32 = 1 << 22;
    const CPUID_EDX_AMX_TILE: u32 = 1 << 24;

    static SUPPORT: OnceLock<Result<(), String>> = OnceLock::new();

    /// CPUID check plus the one-time per-process XTILEDATA permission request.
    pub fn support() -> Result<(), String> {
        SUPPORT.get_or_init(probe).clone()
    }

    fn probe() -> Result<(), String> {
        use std::arch::x86_64::{__cpuid_count, __get_cpuid_max};

        #[allow(unused_unsafe)]
        let (max_leaf, _) = unsafe { __get_cpuid_max(0) };
        if max_leaf < 7 {
            return Err("CPUID leaf 7 not available".into());
        }
        #[allow(unused_unsafe)]
        let leaf7 = unsafe { __cpuid_count(7, 0) };
        if leaf7.edx & CPUID_EDX_AMX_TILE == 0 {
            return Err("CPU does not report AMX-TILE".into());
        }
        if leaf7.edx & CPUID_EDX_AMX_BF16 == 0 {
            return Err("CPU does not report AMX-BF16".into());
        }
        request_tile_permission()?;
        log::info!("AMX tile data permission granted");
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn request_tile_permission() -> Result<(), String> {
        // SAFETY: arch_prctl with ARCH_REQ_XCOMP_PERM takes two integer arguments.
        let ret = unsafe {
            libc::syscall(libc::SYS_arch_prctl, ARCH_REQ_XCOMP_PERM, XFEATURE_XTILEDATA)
        };
        if ret != 0 {
            return Err(format!(
                "arch_prctl(ARCH_REQ_XCOMP_PERM, XTILEDATA) failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn request_tile_permission() -> Result<(), String> {
        Ok(())
    }

    macro_rules! with_tmm {
        ($tile:expr => $emit:ident!($($args:tt)*)) => {
            match $tile.index() {
                0 => $emit!($($args)* "0"),
                1 => $emit!($($args)* "1"),
                2 => $emit!($($args)* "2"),
                3 => $emit!($($args)* "3"),
                4 => $emit!($($args)* "4"),
                5 => $emit!($($args)* "5"),
                6 => $emit!($($args)* "6"),
                7 => $emit!($($args)* "7"),
                _ => unreachable!("tile index out of range"),
            }
        };
    }

    macro_rules! tilezero {
        ($t:literal) => {
            asm!(concat!("tilezero tmm", $t), options(nostack, nomem, preserves_flags))
        };
    }

    macro_rules! tileloadd {
        ($src:expr, $stride:expr, $t:literal) => {
            asm!(
                concat!("tileloadd tmm", $t, ", [{base} + {stride}*1]"),
                base = in(reg) $src,
                stride = in(reg) $stride,
                options(nostack, readonly, preserves_flags)
            )
        };
    }

    macro_rules! tilestored {
        ($dst:expr, $stride:expr, $t:literal) => {
            asm!(
                concat!("tilestored [{base} + {stride}*1], tmm", $t),
                base = in(reg) $dst,
                stride = in(reg) $stride,
                options(nostack, preserves_flags)
            )
        };
    }

    // Walks `[picked] [before] [rest]`, calling `$cb!` once for every element
    // of `rest` with that element appended to `picked` and all other elements
    // as the remaining list.
    macro_rules! for_each_pick {
        ($cb:ident $vars:tt [$($picked:tt)*] [$($before:tt)*] []) => {};
        ($cb:ident $vars:tt [$($picked:tt)*] [$($before:tt)*] [$x:tt $($rest:tt)*]) => {
            $cb!($vars [$($picked)* $x] [$($before)* $($rest)*]);
            for_each_pick!($cb $vars [$($picked)*] [$($before)* $x] [$($rest)*]);
        };
    }

    macro_rules! pick_a {
        ($vars:tt [$d:tt] [$($rest:tt)*]) => {
            for_each_pick!(pick_b $vars [$d] [] [$($rest)*]);
        };
    }

    macro_rules! pick_b {
        ($vars:tt [$d:tt $a:tt] [$($rest:tt)*]) => {
            for_each_pick!(emit_tdpbf16ps $vars [$d $a] [] [$($rest)*]);
        };
    }

    macro_rules! emit_tdpbf16ps {
        (($dst:ident, $src1:ident, $src2:ident) [$d:tt $a:tt $b:tt] [$($rest:tt)*]) => {
            if $dst == $d && $src1 == $a && $src2 == $b {
                asm!(
                    concat!("tdpbf16ps tmm", $d, ", tmm", $a, ", tmm", $b),
                    options(nostack, nomem, preserves_flags)
                );
                return;
            }
        };
    }

    pub unsafe fn load_config(config: &TileConfig) {
        let ptr = config as *const TileConfig;
        // SAFETY: `ptr` is a 64-byte aligned, 64-byte configuration block.
        unsafe { asm!("ldtilecfg [{}]", in(reg) ptr, options(nostack, readonly, preserves_flags)) };
    }

    pub unsafe fn release() {
        // SAFETY: tilerelease only resets this thread's tile state.
        unsafe { asm!("tilerelease", options(nostack, nomem, preserves_flags)) };
    }

    pub unsafe fn zero(tile: Tile) {
        unsafe { with_tmm!(tile => tilezero!()) }
    }

    pub unsafe fn load(tile: Tile, src: *const u8, stride: usize) {
        unsafe { with_tmm!(tile => tileloadd!(src, stride,)) }
    }

    pub unsafe fn store(dst: *mut u8, stride: usize, tile: Tile) {
        unsafe { with_tmm!(tile => tilestored!(dst, stride,)) }
    }

    /// Only the 336 forms with three distinct registers are encodable.
    pub unsafe fn dot_bf16(dst: Tile, a: Tile, b: Tile) {
        let (d, x, y) = (dst.index(), a.index(), b.index());
        unsafe {
            for_each_pick!(pick_a (d, x, y) [] [] [0 1 2 3 4 5 6 7]);
        }
        panic!("tdpbf16ps needs three distinct tiles, got {dst}, {a}, {b}");
    }
}

impl Amx {
    /// Checks that this CPU and OS can run AMX-BF16 tile instructions.
    pub fn detect() -> Result<()> {
        #[cfg(target_arch = "x86_64")]
        {
            hw::support().map_err(Error::HardwareUnsupported)
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Err(Error::HardwareUnsupported(
                "AMX requires an x86-64 CPU".to_string(),
            ))
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl TileUnit for Amx {
    const NAME: &'static str = "amx";

    fn configure(config: &TileConfig) -> Result<()> {
        Amx::detect()?;
        // SAFETY: support was verified above.
        unsafe { hw::load_config(config) };
        Ok(())
    }

    fn release() {
        if hw::support().is_ok() {
            // SAFETY: the instruction set is present.
            unsafe { hw::release() };
        }
    }

    unsafe fn zero(tile: Tile) {
        unsafe { hw::zero(tile) }
    }

    unsafe fn load(tile: Tile, src: *const u8, stride: usize) {
        unsafe { hw::load(tile, src, stride) }
    }

    unsafe fn store(dst: *mut u8, stride: usize, tile: Tile) {
        unsafe { hw::store(dst, stride, tile) }
    }

    unsafe fn dot_bf16(dst: Tile, a: Tile, b: Tile) {
        unsafe { hw::dot_bf16(dst, a, b) }
    }
}

#[cfg(not(target_arch = "x86_64"))]
impl TileUnit for Amx {
    const NAME: &'static str = "amx";

    fn configure(_config: &TileConfig) -> Result<()> {
        Amx::detect()
    }

    fn release() {}

    unsafe fn zero(_tile: Tile) {
        unreachable!("AMX cannot be configured on this target")
    }

    unsafe fn load(_tile: Tile, _src: *const u8, _stride: usize) {
        unreachable!("AMX cannot be configured on this target")
    }

    unsafe fn store(_dst: *mut u8, _stride: usize, _tile: Tile) {
        unreachable!("AMX cannot be configured on this target")
    }

    unsafe fn dot_bf16(_dst: Tile, _a: Tile, _b: Tile) {
        unreachable!("AMX cannot be configured on this target")
    }
}
