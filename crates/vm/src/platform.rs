//! Host services the runtime calls into.
//!
//! Everything here is narrow, synchronous and non-blocking. Embedders on
//! other targets provide their own [`Platform`].

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// OS glue needed by the runtime core.
pub trait Platform: Send + Sync {
    /// Microseconds on a monotonic clock.
    fn monotonic_micros(&self) -> u64;

    /// Milliseconds since the Unix epoch.
    fn wall_clock_millis(&self) -> u64;

    /// Largest stack, in slots, a process may grow to.
    fn max_stack_size_in_words(&self) -> usize;

    /// Current value of the thread's `errno`.
    fn errno(&self) -> i32;

    fn set_errno(&self, value: i32);

    /// Terminate the whole VM after a fatal runtime error.
    fn abort(&self, message: &str) -> ! {
        log::error!("fatal: {}", message);
        std::process::abort()
    }

    /// Leave the VM with an exit code.
    fn exit(&self, code: i32) -> ! {
        std::process::exit(code)
    }
}

/// Stack ceiling used when the host does not say otherwise: 128K slots.
pub const DEFAULT_MAX_STACK_SIZE_IN_WORDS: usize = 128 * 1024;

/// [`Platform`] backed by the standard library and libc.
pub struct HostPlatform {
    start: Instant,
    max_stack_size_in_words: usize,
}

impl HostPlatform {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            max_stack_size_in_words: DEFAULT_MAX_STACK_SIZE_IN_WORDS,
        }
    }

    pub fn with_max_stack_size(max_stack_size_in_words: usize) -> Self {
        Self {
            max_stack_size_in_words,
            ..Self::new()
        }
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for HostPlatform {
    fn monotonic_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn wall_clock_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn max_stack_size_in_words(&self) -> usize {
        self.max_stack_size_in_words
    }

    fn errno(&self) -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn set_errno(&self, value: i32) {
        // SAFETY: __errno_location returns a valid pointer to this thread's errno.
        unsafe { *libc::__errno_location() = value }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn set_errno(&self, value: i32) {
        // SAFETY: __error returns a valid pointer to this thread's errno.
        unsafe { *libc::__error() = value }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios"
    )))]
    fn set_errno(&self, _value: i32) {}
}
