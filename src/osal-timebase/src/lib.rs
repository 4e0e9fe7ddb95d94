//! Timebases and the timed-receive adapter.
//!
//! The distilled interface only ever describes TIMEBASE/TIMECB as kinds in
//! the object identifier enumeration; the operations below are specified at
//! the interface level, same as the rest of this module -- there is no
//! dedicated per-kernel source in the retrieval pack to ground the exact
//! field layout on, so the design follows the shape every other component
//! in this crate already uses: a dedicated worker thread owned by the
//! registry record, shut down cooperatively via [`gruel::ShutdownSignal`]
//! rather than killed.
//!
//! The [`timed_receive`] adapter is grounded on `mq_timedreceive.c`'s
//! EINTR-retry loop against a bounded poll: the host's blocking primitive
//! (`pthread_cond_timedwait` in the emulated queue's own case) only accepts
//! a wall-clock absolute deadline everywhere this runs, so this adapter
//! recomputes its remaining budget from a monotonic [`Instant`] on every
//! retry instead of trusting one wall-clock deadline to still be correct
//! after an arbitrarily long wait. `osal-queue`'s own blocking wait already
//! applies the identical technique internally (see its module doc comment)
//! since its primitive is the same `pthread_cond_timedwait`; this adapter
//! exists so any *other* resource exposing only a "try once, non-blocking"
//! interface -- the case the original C adapter was written for -- gets
//! the same monotonic-safety for free instead of every call site
//! reimplementing the retry loop by hand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use gruel::ShutdownSignal;
use osal_error::{OsalError, OsalResult};
use osal_registry::{ObjectId, ObjectKind, ObjectTable};
use parking_lot::Mutex;

/// Bounded chunk used between deadline recomputations, matching the
/// `osal-queue` wait loop's `POLL_QUANTUM`.
const POLL_QUANTUM: Duration = Duration::from_millis(20);

/// A resource that can report "would this call block?" and attempt a
/// single non-blocking operation. `osal-queue`'s `Timeout::Check` path
/// already implements this shape; anything with a similar non-blocking
/// fast path can adapt to it.
pub trait TryOnce<T> {
    fn try_once(&self) -> Result<T, WouldBlock>;
}

/// Returned by [`TryOnce::try_once`] when the operation would have to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WouldBlock;

/// Repeatedly calls `resource.try_once()` until it succeeds or `timeout`
/// elapses, sleeping in [`POLL_QUANTUM`]-sized increments measured against
/// a monotonic deadline rather than blocking on the resource's own native
/// wait (which this adapter assumes is unavailable or unsuitable).
pub fn timed_receive<T>(resource: &impl TryOnce<T>, timeout: Duration) -> OsalResult<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match resource.try_once() {
            Ok(value) => return Ok(value),
            Err(WouldBlock) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(OsalError::QueueTimeout);
                }
                std::thread::sleep((deadline - now).min(POLL_QUANTUM));
            }
        }
    }
}

struct TimerEntry {
    name: String,
    interval: Duration,
    next_fire: Instant,
    armed: bool,
    callback: Box<dyn FnMut() + Send>,
}

struct TimeBaseState {
    timers: Vec<TimerEntry>,
}

struct TimeBaseHandle {
    state: Arc<Mutex<TimeBaseState>>,
    shutdown: ShutdownSignal,
    stopped: Arc<AtomicBool>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Clone for TimeBaseHandle {
    fn clone(&self) -> Self {
        TimeBaseHandle {
            state: self.state.clone(),
            shutdown: self.shutdown.clone(),
            stopped: self.stopped.clone(),
            join: Mutex::new(None),
        }
    }
}

/// Snapshot returned by [`TimeBaseManager::get_info`].
#[derive(Debug, Clone)]
pub struct TimeBaseInfo {
    pub name: String,
    pub creator: ObjectId,
    pub armed_timer_count: usize,
}

pub struct TimeBaseManager {
    table: ObjectTable<TimeBaseHandle>,
    max_timers_per_base: usize,
}

impl TimeBaseManager {
    pub fn new(capacity: usize, max_name_len: usize, max_timers_per_base: usize) -> Self {
        TimeBaseManager {
            table: ObjectTable::new(ObjectKind::TimeBase, capacity, max_name_len),
            max_timers_per_base,
        }
    }

    /// Spawns the timebase's background thread, which wakes every `tick`
    /// and fires any armed timer whose deadline has passed.
    pub fn create(&self, name: &str, tick: Duration) -> OsalResult<ObjectId> {
        let pending = self.table.allocate_new(Some(name), ObjectId::UNDEFINED)?;

        let state = Arc::new(Mutex::new(TimeBaseState { timers: Vec::new() }));
        let shutdown = ShutdownSignal::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let worker_state = state.clone();
        let worker_stopped = stopped.clone();
        let worker_shutdown = shutdown.clone();
        let thread_name = format!("osal-timebase-{name}");
        let join = std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let task = worker_shutdown.spawn(|| {}).ok();
                while !worker_stopped.load(Ordering::Acquire) {
                    std::thread::sleep(tick);
                    let now = Instant::now();
                    let mut guard = worker_state.lock();
                    for timer in guard.timers.iter_mut() {
                        if timer.armed && now >= timer.next_fire {
                            (timer.callback)();
                            timer.next_fire = now + timer.interval;
                        }
                    }
                }
                drop(task);
            })
            .expect("failed to spawn timebase thread");

        Ok(pending.finalize(TimeBaseHandle {
            state,
            shutdown,
            stopped,
            join: Mutex::new(Some(join)),
        }))
    }

    pub fn delete(&self, id: ObjectId) -> OsalResult<()> {
        let excl = self.table.get_exclusive(id)?;
        excl.get().stopped.store(true, Ordering::Release);
        excl.get().shutdown.shutdown();
        if let Some(join) = excl.get().join.lock().take() {
            let _ = join.join();
        }
        excl.finalize_delete()
    }

    /// `TimerAdd`: registers a named, initially disarmed timer callback.
    /// Returns an opaque index used by [`TimeBaseManager::timer_set`].
    pub fn timer_add(
        &self,
        id: ObjectId,
        name: &str,
        callback: impl FnMut() + Send + 'static,
    ) -> OsalResult<usize> {
        let record = self.table.get_none(id)?;
        let mut guard = record.state.lock();
        if guard.timers.len() >= self.max_timers_per_base {
            return Err(OsalError::NoFreeIds);
        }
        guard.timers.push(TimerEntry {
            name: name.to_string(),
            interval: Duration::ZERO,
            next_fire: Instant::now(),
            armed: false,
            callback: Box::new(callback),
        });
        Ok(guard.timers.len() - 1)
    }

    /// `TimerSet`: arms (or disarms, with `interval == Duration::ZERO`) a
    /// previously registered timer to fire every `interval` starting after
    /// `start`.
    pub fn timer_set(
        &self,
        id: ObjectId,
        timer_index: usize,
        start: Duration,
        interval: Duration,
    ) -> OsalResult<()> {
        let record = self.table.get_none(id)?;
        let mut guard = record.state.lock();
        let timer = guard
            .timers
            .get_mut(timer_index)
            .ok_or(OsalError::InvalidId)?;

        if interval.is_zero() {
            timer.armed = false;
            return Ok(());
        }

        timer.interval = interval;
        timer.next_fire = Instant::now() + start;
        timer.armed = true;
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> OsalResult<ObjectId> {
        self.table.find_by_name(name)
    }

    pub fn get_info(&self, id: ObjectId) -> OsalResult<TimeBaseInfo> {
        let token = self.table.get_global(id)?;
        let record = token.get();
        let armed_timer_count = record.state.lock().timers.iter().filter(|t| t.armed).count();
        Ok(TimeBaseInfo {
            name: token.name().unwrap_or_default().to_string(),
            creator: token.creator(),
            armed_timer_count,
        })
    }
}

impl Default for TimeBaseManager {
    fn default() -> Self {
        TimeBaseManager::new(8, 32, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Counter(Arc<AtomicU32>, u32);

    impl TryOnce<()> for Counter {
        fn try_once(&self) -> Result<(), WouldBlock> {
            if self.0.load(Ordering::SeqCst) >= self.1 {
                Ok(())
            } else {
                Err(WouldBlock)
            }
        }
    }

    #[test]
    fn timed_receive_succeeds_once_the_condition_becomes_true() {
        let count = Arc::new(AtomicU32::new(0));
        let target = count.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(80));
            target.store(5, Ordering::SeqCst);
        });

        let resource = Counter(count, 5);
        assert!(timed_receive(&resource, Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn timed_receive_times_out_when_the_condition_never_becomes_true() {
        let resource = Counter(Arc::new(AtomicU32::new(0)), 5);
        assert_eq!(
            timed_receive(&resource, Duration::from_millis(60)).unwrap_err(),
            OsalError::QueueTimeout
        );
    }

    #[test]
    fn timebase_fires_armed_timer_periodically() {
        let mgr = TimeBaseManager::new(4, 32, 8);
        let id = mgr.create("/timebase-a", Duration::from_millis(10)).unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        let timer = mgr
            .timer_add(id, "heartbeat", move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        mgr.timer_set(id, timer, Duration::from_millis(10), Duration::from_millis(20))
            .unwrap();

        std::thread::sleep(Duration::from_millis(150));
        assert!(fired.load(Ordering::SeqCst) >= 3, "fired={}", fired.load(Ordering::SeqCst));

        mgr.delete(id).unwrap();
    }

    #[test]
    fn disarmed_timer_never_fires() {
        let mgr = TimeBaseManager::new(4, 32, 8);
        let id = mgr.create("/timebase-b", Duration::from_millis(10)).unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = fired.clone();
        mgr.timer_add(id, "idle", move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        mgr.delete(id).unwrap();
    }
}
