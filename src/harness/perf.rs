//! User-space reads of Linux hardware performance counters.
//!
//! Each counter is opened with `perf_event_open` for the calling process on
//! any CPU, excluding kernel time, and its metadata page is mapped so the
//! value can be read with `rdpmc` without a system call. The page is guarded
//! by a sequence lock: a read is retried until the `lock` word is unchanged
//! around it.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
use std::io;

use crate::error::{Error, Result};

pub const PERF_TYPE_HARDWARE: u32 = 0;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;

/// Counters are 48 bits wide; raw sums and differences wrap at this mask.
pub const COUNTER_MASK: u64 = (1 << 48) - 1;

/// Name under which a report derives Ops/cycle.
pub const HW_CYCLES: &str = "HW_CYCLES";

/// Which event to count and how to label it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSpec {
    pub kind: u32,
    pub config: u64,
    pub name: String,
}

impl CounterSpec {
    pub fn new(kind: u32, config: u64, name: impl Into<String>) -> Self {
        CounterSpec {
            kind,
            config,
            name: name.into(),
        }
    }

    pub fn hardware_cycles() -> Self {
        CounterSpec::new(PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES, HW_CYCLES)
    }

    pub fn instructions() -> Self {
        CounterSpec::new(PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS, "HW_INSTRUCTIONS")
    }
}

/// An open counter.
#[derive(Debug)]
pub struct PerfCounter {
    spec: CounterSpec,
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    mapping: sys::Mapping,
}

impl PerfCounter {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    pub fn open(spec: CounterSpec) -> Result<PerfCounter> {
        let mapping = sys::Mapping::open(spec.kind, spec.config).map_err(|source| {
            Error::PerformanceCounterUnavailable {
                name: spec.name.clone(),
                source,
            }
        })?;
        log::info!(
            "perf event {} (type={:#x}, config={:#x}) opened",
            spec.name,
            spec.kind,
            spec.config
        );
        Ok(PerfCounter { spec, mapping })
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    pub fn open(spec: CounterSpec) -> Result<PerfCounter> {
        Err(Error::PerformanceCounterUnavailable {
            name: spec.name,
            source: io::Error::new(
                io::ErrorKind::Unsupported,
                "user-space counter reads need Linux on x86-64",
            ),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &CounterSpec {
        &self.spec
    }

    /// Current counter value, masked to [`COUNTER_MASK`].
    ///
    /// Falls back to `read(2)` when the kernel does not allow `rdpmc` for
    /// this event (the page reports index 0).
    pub fn read(&self) -> u64 {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        {
            match self.mapping.read_user() {
                Some(value) => value,
                None => match self.mapping.read_syscall() {
                    Ok(value) => value & COUNTER_MASK,
                    Err(err) => {
                        log::warn!("perf event {}: read failed: {err}", self.spec.name);
                        0
                    }
                },
            }
        }
        #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
        {
            0
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod sys {
    use std::arch::asm;
    use std::cell::Cell;
    use std::io;
    use std::ptr;
    use std::sync::atomic::{Ordering, fence};

    use super::COUNTER_MASK;

    const PERF_ATTR_SIZE_VER0: u32 = 64;
    const PERF_SAMPLE_READ: u64 = 1 << 4;
    const EXCLUDE_KERNEL: u64 = 1 << 5;

    /// `struct perf_event_attr`, first published (64-byte) revision.
    #[repr(C)]
    #[derive(Default)]
    #[allow(dead_code)]
    struct EventAttr {
        kind: u32,
        size: u32,
        config: u64,
        sample_period: u64,
        sample_type: u64,
        read_format: u64,
        flags: u64,
        wakeup_events: u32,
        bp_type: u32,
        config1: u64,
    }

    /// Leading fields of `struct perf_event_mmap_page`.
    #[repr(C)]
    #[allow(dead_code)]
    struct PageHeader {
        version: u32,
        compat_version: u32,
        lock: u32,
        index: u32,
        offset: i64,
    }

    #[derive(Debug)]
    pub struct Mapping {
        fd: libc::c_int,
        page: *const PageHeader,
        page_size: usize,
        warned: Cell<bool>,
    }

    impl Mapping {
        pub fn open(kind: u32, config: u64) -> io::Result<Mapping> {
            let attr = EventAttr {
                kind,
                size: PERF_ATTR_SIZE_VER0,
                config,
                sample_type: PERF_SAMPLE_READ,
                flags: EXCLUDE_KERNEL,
                ..Default::default()
            };

            // SAFETY: `attr` is a valid VER0 attribute block for the duration of the call.
            let fd = unsafe {
                libc::syscall(
                    libc::SYS_perf_event_open,
                    &attr as *const EventAttr,
                    0 as libc::pid_t,
                    -1 as libc::c_int,
                    -1 as libc::c_int,
                    0 as libc::c_ulong,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let fd = fd as libc::c_int;

            // SAFETY: sysconf has no preconditions.
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
            // SAFETY: mapping one read-only page of a perf fd.
            let page = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    page_size,
                    libc::PROT_READ,
                    libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            if page == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                // SAFETY: `fd` was opened above and is not shared.
                unsafe { libc::close(fd) };
                return Err(err);
            }

            Ok(Mapping {
                fd,
                page: page as *const PageHeader,
                page_size,
                warned: Cell::new(false),
            })
        }

        /// `rdpmc` read under the page's sequence lock; `None` if the kernel
        /// reports no user-readable counter index.
        pub fn read_user(&self) -> Option<u64> {
            loop {
                // SAFETY: `page` is a live mapping; the kernel updates it concurrently,
                // hence volatile reads.
                let seq = unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).lock)) };
                fence(Ordering::Acquire);
                let index = unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).index)) };
                let offset = unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).offset)) };
                if index == 0 {
                    if !self.warned.replace(true) {
                        log::warn!("rdpmc not permitted for this event, reading through the file descriptor");
                    }
                    return None;
                }
                let value = rdpmc(index - 1);
                fence(Ordering::Acquire);
                if unsafe { ptr::read_volatile(ptr::addr_of!((*self.page).lock)) } == seq {
                    return Some(value.wrapping_add(offset as u64) & COUNTER_MASK);
                }
            }
        }

        pub fn read_syscall(&self) -> io::Result<u64> {
            let mut value = 0u64;
            // SAFETY: reading 8 bytes into a local u64.
            let n = unsafe {
                libc::read(
                    self.fd,
                    &mut value as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(value)
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            // SAFETY: both resources were created in `open` and are released once.
            unsafe {
                libc::munmap(self.page as *mut libc::c_void, self.page_size);
                libc::close(self.fd);
            }
        }
    }

    fn rdpmc(counter: u32) -> u64 {
        let (lo, hi): (u32, u32);
        // SAFETY: the kernel published `counter` as readable from user space.
        unsafe {
            asm!(
                "rdpmc",
                in("ecx") counter,
                out("eax") lo,
                out("edx") hi,
                options(nostack, nomem, preserves_flags)
            );
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }
}
