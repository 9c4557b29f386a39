//! Runtime configuration.
//!
//! Configuration can come from three places, applied in this order:
//! defaults, a TOML file, and `-X` flags on the command line.
//!
//! ```toml
//! [gc]
//! process_heap_budget_bytes = 65536
//! debug = true
//!
//! [scheduler]
//! workers = 4
//!
//! [flags]
//! validate_heaps = true
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::error::RuntimeError;

/// Bytes per page. Chunk sizes are rounded up to this.
pub const PAGE_SIZE: usize = 4 * 1024;

/// Configuration for heaps and collectors.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GcConfig {
    /// Size of the first chunk of a process heap.
    pub process_heap_initial_bytes: usize,
    /// Bytes a process heap may allocate in new chunks before it asks for a
    /// collection.
    pub process_heap_budget_bytes: usize,
    /// Allocation budget of each shared heap part handed to a running process.
    pub shared_heap_part_bytes: usize,
    /// Shared heap usage above which a shared collection is requested.
    pub shared_heap_limit_bytes: usize,
    /// Size of the first chunk of the program heap.
    pub program_heap_initial_bytes: usize,
    /// Maximum stack size in slots. `None` uses the platform ceiling.
    pub max_stack_slots: Option<usize>,
    /// Print `[GC]` reports to stderr.
    pub debug: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            process_heap_initial_bytes: 4 * 1024,
            process_heap_budget_bytes: 64 * 1024,
            shared_heap_part_bytes: 32 * 1024,
            shared_heap_limit_bytes: 1024 * 1024,
            program_heap_initial_bytes: 64 * 1024,
            max_stack_slots: None,
            debug: false,
        }
    }
}

/// Configuration for the scheduler's worker threads.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads. 0 means one per CPU.
    pub workers: usize,
    /// How long an idle worker sleeps before checking for work again.
    pub idle_timeout_ms: u64,
    /// Interval between profile interrupts when profiling is enabled.
    pub profile_interval_us: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            idle_timeout_ms: 10,
            profile_interval_us: 1000,
        }
    }
}

impl SchedulerConfig {
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Boolean runtime flags, settable with `-Xname`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Flags {
    /// Check every heap pointer after each collection.
    pub validate_heaps: bool,
    /// Report heap usage before and after each collection.
    pub print_heap_statistics: bool,
    /// Report program heap object counts after program collections.
    pub print_program_statistics: bool,
    /// Collect the shared heap whenever a process is deleted.
    pub gc_on_delete: bool,
    /// Allow programs to request collections explicitly.
    pub expose_gc: bool,
    pub verbose: bool,
    /// Deliver profile interrupts to running processes.
    pub profile: bool,
}

impl Flags {
    fn set(&mut self, name: &str, value: bool) -> Result<(), RuntimeError> {
        let slot = match name {
            "validate_heaps" => &mut self.validate_heaps,
            "print_heap_statistics" => &mut self.print_heap_statistics,
            "print_program_statistics" => &mut self.print_program_statistics,
            "gc_on_delete" => &mut self.gc_on_delete,
            "expose_gc" => &mut self.expose_gc,
            "verbose" => &mut self.verbose,
            "profile" => &mut self.profile,
            _ => return Err(RuntimeError::Config(format!("unknown flag '{}'", name))),
        };
        *slot = value;
        Ok(())
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub gc: GcConfig,
    pub scheduler: SchedulerConfig,
    pub flags: Flags,
}

impl RuntimeConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, RuntimeError> {
        toml::from_str(source).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let source = std::fs::read_to_string(path).map_err(|source| RuntimeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Consume `-X` flags from `args`, leaving everything else in place.
    ///
    /// Accepted forms are `-Xname`, `-Xno-name`, and `-Xname=true|false`.
    /// `-Xprofile_interval=N` sets the profile interval in microseconds.
    pub fn extract_flags(&mut self, args: &mut Vec<String>) -> Result<(), RuntimeError> {
        let mut rest = Vec::with_capacity(args.len());
        for arg in args.drain(..) {
            let Some(flag) = arg.strip_prefix("-X") else {
                rest.push(arg);
                continue;
            };
            match flag.split_once('=') {
                Some(("profile_interval", value)) => {
                    self.scheduler.profile_interval_us = value.parse().map_err(|_| {
                        RuntimeError::Config(format!("bad profile interval '{}'", value))
                    })?;
                }
                Some((name, "true")) => self.flags.set(name, true)?,
                Some((name, "false")) => self.flags.set(name, false)?,
                Some((name, value)) => {
                    return Err(RuntimeError::Config(format!(
                        "flag '{}' expects a boolean, got '{}'",
                        name, value
                    )))
                }
                None => match flag.strip_prefix("no-") {
                    Some(name) => self.flags.set(name, false)?,
                    None => self.flags.set(flag, true)?,
                },
            }
        }
        *args = rest;
        Ok(())
    }
}
