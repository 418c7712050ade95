//! Cache eviction between measured calls.

use std::hint::black_box;

/// Size of each scratch buffer, well above any last-level cache.
pub const DEFAULT_FLUSH_BYTES: usize = 256 << 20;

/// Evicts the caches by streaming through two large scratch buffers, or by
/// calling a caller-provided hook instead.
pub struct CacheFlusher {
    bytes: usize,
    src: Vec<u8>,
    dst: Vec<u8>,
    value: u8,
    hook: Option<Box<dyn FnMut()>>,
    passes: u64,
}

impl CacheFlusher {
    /// Scratch buffers are allocated on the first flush.
    pub fn new(bytes: usize) -> Self {
        CacheFlusher {
            bytes,
            src: Vec::new(),
            dst: Vec::new(),
            value: 0,
            hook: None,
            passes: 0,
        }
    }

    /// Replaces the buffer walk with `hook`.
    pub fn with_hook(hook: impl FnMut() + 'static) -> Self {
        CacheFlusher {
            hook: Some(Box::new(hook)),
            ..CacheFlusher::new(0)
        }
    }

    pub fn flush(&mut self) {
        self.passes += 1;
        if let Some(hook) = self.hook.as_mut() {
            hook();
            return;
        }
        if self.src.len() < self.bytes {
            self.src.resize(self.bytes, 0);
            self.dst.resize(self.bytes, 0);
        }
        for _ in 0..2 {
            self.src.fill(self.value);
            self.value = self.value.wrapping_add(1);
            self.dst.copy_from_slice(&self.src);
        }
        black_box(&self.dst);
    }

    /// Number of flushes performed.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Default for CacheFlusher {
    fn default() -> Self {
        CacheFlusher::new(DEFAULT_FLUSH_BYTES)
    }
}

impl std::fmt::Debug for CacheFlusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFlusher")
            .field("bytes", &self.bytes)
            .field("hook", &self.hook.is_some())
            .field("passes", &self.passes)
            .finish()
    }
}
