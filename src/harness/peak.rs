//! Theoretical per-core peak rates. A multiply-add counts as two ops.

/// Ops of one `tdpbf16ps` on full 16×16 FP32 / 16×32 BF16 tiles.
pub const AMX_BF16_OPS_PER_TDP: f64 = (16 * 16 * 32 * 2) as f64;
/// Cycles between back-to-back `tdpbf16ps` on one core.
pub const AMX_BF16_TDP_THROUGHPUT: f64 = 16.0;
pub const AMX_BF16_OPS_PER_CYCLE: f64 = AMX_BF16_OPS_PER_TDP / AMX_BF16_TDP_THROUGHPUT;
/// All-core AMX frequency of the reference part.
pub const AMX_BF16_FREQ_GHZ: f64 = 2.05;
/// Single-core turbo frequency of the reference part.
pub const AMX_BF16_TURBO_FREQ_GHZ: f64 = 3.0;

/// Two AVX-512 FMAs per cycle: 2 × (16 + 16).
pub const FP32_OPS_PER_CYCLE: f64 = 64.0;
pub const AVX512_FREQ_GHZ: f64 = 3.0;

/// AMX-BF16 ops per second on one core at `freq_ghz`.
pub fn amx_bf16_peak(freq_ghz: f64) -> f64 {
    AMX_BF16_OPS_PER_CYCLE * freq_ghz * 1e9
}

/// AVX-512 FP32 ops per second on one core at `freq_ghz`.
pub fn fp32_peak(freq_ghz: f64) -> f64 {
    FP32_OPS_PER_CYCLE * freq_ghz * 1e9
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn test_peak_rates() {
        assert_eq!(AMX_BF16_OPS_PER_CYCLE, 1024.0);
        assert_relative_eq!(amx_bf16_peak(AMX_BF16_FREQ_GHZ), 2099.2e9, max_relative = 1e-12);
        assert_relative_eq!(fp32_peak(AVX512_FREQ_GHZ), 192e9, max_relative = 1e-12);
    }
}
