//! Run-time switches for the benchmark driver.
//!
//! Defaults are overridden from the environment:
//!
//! | variable     | effect                                                  |
//! |--------------|---------------------------------------------------------|
//! | `TIMES`      | iteration override: `N > 0` calls, `-N` an N ms budget  |
//! | `CLFLUSH`    | evict caches before every measured call                 |
//! | `CLFLUSH_MB` | size of each eviction buffer in MiB                     |
//! | `SWPF`       | generate kernels with software prefetch                 |
//! | `SHOW_ERR`   | dump operands when a result does not match              |
//! | `EMULATE`    | run kernels on the software tile unit                   |
//!
//! Flags are on for any non-zero integer or `true`/`yes`/`on`.

use crate::harness::{DEFAULT_FLUSH_BYTES, Iterations};
use crate::kernels::KernelOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Replaces the iteration count or budget every benchmark asks for.
    pub iterations: Option<Iterations>,
    pub clear_cache: bool,
    pub flush_bytes: usize,
    pub prefetch: bool,
    pub show_errors: bool,
    pub emulate: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            iterations: None,
            clear_cache: false,
            flush_bytes: DEFAULT_FLUSH_BYTES,
            prefetch: false,
            show_errors: false,
            emulate: false,
        }
    }
}

impl RunConfig {
    /// Defaults with the process environment applied.
    pub fn from_env() -> Self {
        RunConfig::default().override_from_env()
    }

    pub fn override_from_env(self) -> Self {
        self.override_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides read through `lookup`, which maps a variable name to
    /// its value.
    pub fn override_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(val) = lookup("TIMES") {
            match val.trim().parse::<i64>() {
                Ok(raw) => self.iterations = Iterations::from_raw(raw),
                Err(_) => log::warn!("ignoring TIMES={val:?}: not an integer"),
            }
        }

        if let Some(val) = lookup("CLFLUSH") {
            self.clear_cache = parse_flag(&val);
        }

        if let Some(val) = lookup("CLFLUSH_MB") {
            match val.trim().parse::<usize>() {
                Ok(mb) if mb > 0 => self.flush_bytes = mb << 20,
                _ => log::warn!("ignoring CLFLUSH_MB={val:?}: not a positive integer"),
            }
        }

        if let Some(val) = lookup("SWPF") {
            self.prefetch = parse_flag(&val);
        }

        if let Some(val) = lookup("SHOW_ERR") {
            self.show_errors = parse_flag(&val);
        }

        if let Some(val) = lookup("EMULATE") {
            self.emulate = parse_flag(&val);
        }

        self
    }

    pub fn kernel_options(&self) -> KernelOptions {
        KernelOptions {
            prefetch: self.prefetch,
        }
    }
}

fn parse_flag(val: &str) -> bool {
    let val = val.trim();
    match val.parse::<i64>() {
        Ok(n) => n != 0,
        Err(_) => matches!(val.to_ascii_lowercase().as_str(), "true" | "yes" | "on"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;

    fn with(vars: &[(&str, &str)]) -> RunConfig {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RunConfig::default().override_from(|name| env.get(name).cloned())
    }

    #[test]
    fn test_defaults_without_environment() {
        assert_eq!(with(&[]), RunConfig::default());
        assert_eq!(RunConfig::default().flush_bytes, 256 << 20);
    }

    #[test]
    fn test_times_encoding() {
        assert_eq!(with(&[("TIMES", "40")]).iterations, Some(Iterations::Count(40)));
        assert_eq!(
            with(&[("TIMES", "-250")]).iterations,
            Some(Iterations::Budget(Duration::from_millis(250)))
        );
        assert_eq!(with(&[("TIMES", "0")]).iterations, None);
        assert_eq!(with(&[("TIMES", "lots")]).iterations, None);
    }

    #[test]
    fn test_flags() {
        let config = with(&[
            ("CLFLUSH", "1"),
            ("SWPF", "true"),
            ("SHOW_ERR", "0"),
            ("EMULATE", " yes "),
            ("CLFLUSH_MB", "64"),
        ]);
        assert!(config.clear_cache);
        assert!(config.prefetch);
        assert!(config.kernel_options().prefetch);
        assert!(!config.show_errors);
        assert!(config.emulate);
        assert_eq!(config.flush_bytes, 64 << 20);
    }
}
