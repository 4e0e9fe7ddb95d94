//! Facade tying every OSAL component to one [`Config`]-sized instance.
//!
//! Each component crate in this workspace is independently usable (and
//! independently tested); `Osal` exists only to size and hold one instance
//! of each from a single [`Config`], the way a real integration's
//! `OS_API_Init()` walks `osconfig.h` once at startup.

mod config;
mod module;
mod task;

pub use config::Config;
pub use module::ModuleManager;
pub use task::{TaskContext, TaskInfo, TaskManager};

pub use osal_console::ConsoleManager;
pub use osal_dir::DirManager;
pub use osal_error::{bugcheck, BugCheckPolicy, OsalError, OsalResult};
pub use osal_queue::QueueManager;
pub use osal_registry::ObjectId;
pub use osal_sem::{BinSemManager, CountSemManager};
pub use osal_timebase::{timed_receive, TimeBaseManager, TryOnce, WouldBlock};
pub use osal_vfs::{PathLimits, VirtualFileSystem};

/// The ticks a freshly constructed [`Osal`]'s timebases wake up on, absent a
/// caller-supplied value per timebase (`TimeBaseManager::create` still takes
/// its own explicit tick; this only covers table sizing).
const DEFAULT_TIMER_TICK_MS: u64 = 10;

/// One process's worth of OSAL state, sized from a [`Config`].
pub struct Osal {
    pub config: Config,
    pub tasks: TaskManager,
    pub modules: ModuleManager,
    pub queues: QueueManager,
    pub count_sems: CountSemManager,
    pub bin_sems: BinSemManager,
    pub timebases: TimeBaseManager,
    pub consoles: ConsoleManager,
    pub dirs: DirManager,
    pub vfs: VirtualFileSystem,
}

impl Osal {
    pub fn new(config: Config) -> Self {
        let path_limits = PathLimits {
            max_path_len: config.max_path_len,
            max_local_path_len: config.max_path_len,
            max_file_name: config.max_file_name,
            dev_name_len: config.fs_dev_name_len,
            vol_name_len: config.fs_vol_name_len,
        };

        Osal {
            tasks: TaskManager::new(config.max_tasks, config.max_api_name),
            modules: ModuleManager::new(config.max_modules, config.max_api_name),
            queues: QueueManager::with_depth_policy(
                config.max_queues,
                config.max_api_name,
                config.queue_max_depth,
                config.debug_permissive_mode,
            ),
            count_sems: CountSemManager::new(config.max_count_semaphores, config.max_api_name),
            bin_sems: BinSemManager::new(config.max_bin_semaphores, config.max_api_name),
            timebases: TimeBaseManager::new(config.max_timebases, config.max_api_name, config.max_timers),
            consoles: ConsoleManager::new(config.max_consoles, config.max_api_name),
            dirs: DirManager::new(config.max_num_open_dirs, config.max_api_name),
            vfs: VirtualFileSystem::new(config.max_file_systems, path_limits),
            config,
        }
    }

    /// Convenience for a timebase sized to this instance's default tick.
    pub fn create_timebase(&self, name: &str) -> OsalResult<ObjectId> {
        self.timebases
            .create(name, std::time::Duration::from_millis(DEFAULT_TIMER_TICK_MS))
    }
}

impl Default for Osal {
    fn default() -> Self {
        Osal::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_instance_wires_every_component() {
        let osal = Osal::default();
        assert_eq!(osal.tasks.find_by_name("nope"), Err(OsalError::NameNotFound));
        assert_eq!(osal.config.max_tasks, 32);
    }

    #[test]
    fn task_lifecycle_through_the_facade() {
        let osal = Osal::default();
        let id = osal
            .tasks
            .spawn("via-facade", 0, ObjectId::UNDEFINED, |_ctx| {})
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(osal.tasks.get_info(id).unwrap().name, "via-facade");
        osal.tasks.delete(id).unwrap();
    }

    #[test]
    fn timebase_convenience_constructor_uses_default_tick() {
        let osal = Osal::default();
        let id = osal.create_timebase("heartbeat").unwrap();
        osal.timebases.delete(id).unwrap();
    }
}
