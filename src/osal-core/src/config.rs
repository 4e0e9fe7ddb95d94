//! Compile-time configuration, translated from the original's
//! `osconfig.h`-style preprocessor constants into a runtime [`Config`]
//! struct consulted when [`crate::Osal::new`] sizes its per-kind tables.
//!
//! Rust has no portable way to bake a constant like `OS_MAX_TASKS` into a
//! fixed-size array length without forcing every caller to thread a const
//! generic through every public type in the crate, so "fixed capacity at
//! build time" becomes "fixed capacity at construction time" here: each
//! manager still refuses the `N+1`-th allocation once its table fills, the
//! original's actual guarantee, just sized from a value instead of a macro.

use osal_error::BugCheckPolicy;

/// Mirrors the original's recognized `osconfig.h` options.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_tasks: usize,
    pub max_queues: usize,
    pub max_count_semaphores: usize,
    pub max_bin_semaphores: usize,
    pub max_mutexes: usize,
    pub max_timebases: usize,
    pub max_timers: usize,
    pub max_modules: usize,
    pub max_num_open_files: usize,
    pub max_num_open_dirs: usize,
    pub max_file_systems: usize,
    pub max_consoles: usize,

    pub max_api_name: usize,
    pub max_path_len: usize,
    pub max_file_name: usize,
    pub fs_dev_name_len: usize,
    pub fs_phys_name_len: usize,
    pub fs_vol_name_len: usize,

    pub queue_max_depth: u32,

    /// When set, over-large queue depths are silently truncated to
    /// [`Config::queue_max_depth`] instead of failing `QUEUE_INVALID_SIZE`.
    pub debug_permissive_mode: bool,

    pub bugcheck_policy: BugCheckPolicy,
}

impl Default for Config {
    /// Values mirror the original's typical example `osconfig.h` for a
    /// small flight-software build, not an attempt at "maximum" sizing.
    fn default() -> Self {
        Config {
            max_tasks: 32,
            max_queues: 64,
            max_count_semaphores: 32,
            max_bin_semaphores: 32,
            max_mutexes: 32,
            max_timebases: 8,
            max_timers: 8,
            max_modules: 8,
            max_num_open_files: 32,
            max_num_open_dirs: 32,
            max_file_systems: 8,
            max_consoles: 4,

            max_api_name: 32,
            max_path_len: 64,
            max_file_name: 20,
            fs_dev_name_len: 32,
            fs_phys_name_len: 64,
            fs_vol_name_len: 32,

            queue_max_depth: 512,

            debug_permissive_mode: false,
            bugcheck_policy: BugCheckPolicy::Permissive,
        }
    }
}
