//! Counting semaphore, grounded on the POSIX backend's direct use of
//! `sem_init`/`sem_post`/`sem_wait`/`sem_timedwait`: a `parking_lot`
//! mutex/condvar pair stands in for the native semaphore object, since it
//! reproduces the same contract -- `give` never blocks and never fails for
//! a reason other than a corrupt object, `take` wakes at most one waiter
//! per `give`, and the count saturates well below where it could wrap.

use std::time::{Duration, Instant};

use osal_error::{OsalError, OsalResult};
use osal_registry::{ObjectId, ObjectKind, ObjectTable};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Mirrors `SEM_VALUE_MAX` on backends lacking a native wide counting
/// semaphore: half of `u32::MAX`, so `give` can never approach overflow.
pub const SEM_VALUE_MAX: u32 = u32::MAX / 2;

struct Inner {
    count: u32,
}

struct CountingSemaphore {
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl CountingSemaphore {
    fn new(initial: u32) -> OsalResult<Self> {
        if initial > SEM_VALUE_MAX {
            return Err(OsalError::ErrInvalidSize);
        }
        Ok(CountingSemaphore {
            inner: Mutex::new(Inner { count: initial }),
            condvar: Condvar::new(),
        })
    }

    fn give(&self) {
        let mut guard = self.inner.lock();
        if guard.count < SEM_VALUE_MAX {
            guard.count += 1;
        }
        self.condvar.notify_one();
    }

    fn take(&self) {
        let mut guard = self.inner.lock();
        while guard.count == 0 {
            self.condvar.wait(&mut guard);
        }
        guard.count -= 1;
    }

    fn timed_wait(&self, timeout: Duration) -> OsalResult<()> {
        let mut guard = self.inner.lock();
        let deadline = Instant::now() + timeout;
        loop {
            if guard.count > 0 {
                guard.count -= 1;
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OsalError::SemTimeout);
            }
            let _ = self.condvar.wait_for(&mut guard, remaining);
        }
    }

    fn value(&self) -> u32 {
        self.inner.lock().count
    }
}

#[derive(Clone)]
struct CountSemRecord {
    name: String,
    sem: Arc<CountingSemaphore>,
}

/// Snapshot returned by [`CountSemManager::get_info`].
#[derive(Debug, Clone)]
pub struct CountSemInfo {
    pub name: String,
    pub creator: ObjectId,
    pub value: u32,
}

pub struct CountSemManager {
    table: ObjectTable<CountSemRecord>,
}

impl CountSemManager {
    pub fn new(capacity: usize, max_name_len: usize) -> Self {
        CountSemManager {
            table: ObjectTable::new(ObjectKind::CountSem, capacity, max_name_len),
        }
    }

    pub fn create(&self, name: &str, initial_value: u32) -> OsalResult<ObjectId> {
        let pending = self.table.allocate_new(Some(name), ObjectId::UNDEFINED)?;

        let sem = match CountingSemaphore::new(initial_value) {
            Ok(s) => s,
            Err(e) => return Err(pending.abort(e)),
        };

        Ok(pending.finalize(CountSemRecord {
            name: name.to_string(),
            sem: Arc::new(sem),
        }))
    }

    pub fn delete(&self, id: ObjectId) -> OsalResult<()> {
        self.table.get_exclusive(id)?.finalize_delete()
    }

    pub fn give(&self, id: ObjectId) -> OsalResult<()> {
        let record = self.table.get_none(id)?;
        record.sem.give();
        Ok(())
    }

    pub fn take(&self, id: ObjectId) -> OsalResult<()> {
        let record = self.table.get_none(id)?;
        record.sem.take();
        Ok(())
    }

    pub fn timed_wait(&self, id: ObjectId, timeout: Duration) -> OsalResult<()> {
        let record = self.table.get_none(id)?;
        record.sem.timed_wait(timeout)
    }

    pub fn find_by_name(&self, name: &str) -> OsalResult<ObjectId> {
        self.table.find_by_name(name)
    }

    pub fn get_info(&self, id: ObjectId) -> OsalResult<CountSemInfo> {
        let token = self.table.get_global(id)?;
        let record = token.get();
        Ok(CountSemInfo {
            name: record.name.clone(),
            creator: token.creator(),
            value: record.sem.value(),
        })
    }
}

impl Default for CountSemManager {
    fn default() -> Self {
        CountSemManager::new(64, 32)
    }
}

/// Binary semaphore: a [`CountingSemaphore`] clamped to `{0, 1}`, matching
/// the original's `OS_BinSemCreate`/`OS_BinSemGive`/`OS_BinSemTake` family.
/// Distinct from the counting semaphore at the registry level (its own
/// `ObjectKind`) even though the two share an implementation, the same way
/// the original keeps separate `OS_BinSemTable`/`OS_CountSemTable`s despite
/// both backends bottoming out in a mutex+condvar+counter on POSIX.
struct BinarySemaphore {
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl BinarySemaphore {
    fn new(initial: bool) -> Self {
        BinarySemaphore {
            inner: Mutex::new(Inner {
                count: initial as u32,
            }),
            condvar: Condvar::new(),
        }
    }

    fn give(&self) {
        let mut guard = self.inner.lock();
        guard.count = 1;
        self.condvar.notify_one();
    }

    /// `OS_BinSemFlush`: releases every waiter without leaving the
    /// semaphore signaled for a future, unrelated `take`.
    fn flush(&self) {
        let mut guard = self.inner.lock();
        guard.count = 0;
        self.condvar.notify_all();
    }

    fn take(&self) {
        let mut guard = self.inner.lock();
        while guard.count == 0 {
            self.condvar.wait(&mut guard);
        }
        guard.count = 0;
    }

    fn timed_wait(&self, timeout: Duration) -> OsalResult<()> {
        let mut guard = self.inner.lock();
        let deadline = Instant::now() + timeout;
        loop {
            if guard.count > 0 {
                guard.count = 0;
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OsalError::SemTimeout);
            }
            let _ = self.condvar.wait_for(&mut guard, remaining);
        }
    }

    fn value(&self) -> u32 {
        self.inner.lock().count
    }
}

#[derive(Clone)]
struct BinSemRecord {
    name: String,
    sem: Arc<BinarySemaphore>,
}

/// Snapshot returned by [`BinSemManager::get_info`].
#[derive(Debug, Clone)]
pub struct BinSemInfo {
    pub name: String,
    pub creator: ObjectId,
    pub value: u32,
}

pub struct BinSemManager {
    table: ObjectTable<BinSemRecord>,
}

impl BinSemManager {
    pub fn new(capacity: usize, max_name_len: usize) -> Self {
        BinSemManager {
            table: ObjectTable::new(ObjectKind::BinSem, capacity, max_name_len),
        }
    }

    pub fn create(&self, name: &str, initial_value: bool) -> OsalResult<ObjectId> {
        let pending = self.table.allocate_new(Some(name), ObjectId::UNDEFINED)?;
        Ok(pending.finalize(BinSemRecord {
            name: name.to_string(),
            sem: Arc::new(BinarySemaphore::new(initial_value)),
        }))
    }

    pub fn delete(&self, id: ObjectId) -> OsalResult<()> {
        self.table.get_exclusive(id)?.finalize_delete()
    }

    pub fn give(&self, id: ObjectId) -> OsalResult<()> {
        self.table.get_none(id)?.sem.give();
        Ok(())
    }

    pub fn flush(&self, id: ObjectId) -> OsalResult<()> {
        self.table.get_none(id)?.sem.flush();
        Ok(())
    }

    pub fn take(&self, id: ObjectId) -> OsalResult<()> {
        self.table.get_none(id)?.sem.take();
        Ok(())
    }

    pub fn timed_wait(&self, id: ObjectId, timeout: Duration) -> OsalResult<()> {
        self.table.get_none(id)?.sem.timed_wait(timeout)
    }

    pub fn find_by_name(&self, name: &str) -> OsalResult<ObjectId> {
        self.table.find_by_name(name)
    }

    pub fn get_info(&self, id: ObjectId) -> OsalResult<BinSemInfo> {
        let token = self.table.get_global(id)?;
        let record = token.get();
        Ok(BinSemInfo {
            name: record.name.clone(),
            creator: token.creator(),
            value: record.sem.value(),
        })
    }
}

impl Default for BinSemManager {
    fn default() -> Self {
        BinSemManager::new(64, 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::thread;

    #[test]
    fn give_then_take_does_not_block() {
        let mgr = CountSemManager::new(8, 32);
        let id = mgr.create("/sem-a", 0).unwrap();
        mgr.give(id).unwrap();
        mgr.take(id).unwrap();
        mgr.delete(id).unwrap();
    }

    #[test]
    fn take_blocks_until_a_concurrent_give() {
        let mgr = StdArc::new(CountSemManager::new(8, 32));
        let id = mgr.create("/sem-b", 0).unwrap();

        let giver = {
            let mgr = mgr.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                mgr.give(id).unwrap();
            })
        };

        let start = Instant::now();
        mgr.take(id).unwrap();
        giver.join().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(90));

        mgr.delete(id).unwrap();
    }

    #[test]
    fn timed_wait_reports_timeout_on_a_never_given_semaphore() {
        let mgr = CountSemManager::new(8, 32);
        let id = mgr.create("/sem-c", 0).unwrap();
        assert_eq!(
            mgr.timed_wait(id, Duration::from_millis(50)).unwrap_err(),
            OsalError::SemTimeout
        );
        mgr.delete(id).unwrap();
    }

    #[test]
    fn oscillating_give_take_preserves_value() {
        let mgr = CountSemManager::new(8, 32);
        let id = mgr.create("/sem-d", 2).unwrap();
        assert_eq!(mgr.get_info(id).unwrap().value, 2);

        mgr.take(id).unwrap();
        mgr.take(id).unwrap();
        assert_eq!(mgr.get_info(id).unwrap().value, 0);

        mgr.give(id).unwrap();
        assert_eq!(mgr.get_info(id).unwrap().value, 1);

        mgr.delete(id).unwrap();
    }

    #[test]
    fn initial_value_above_max_is_rejected() {
        let mgr = CountSemManager::new(8, 32);
        assert_eq!(
            mgr.create("/sem-e", SEM_VALUE_MAX + 1).unwrap_err(),
            OsalError::ErrInvalidSize
        );
    }

    #[test]
    fn binsem_give_then_take_does_not_block() {
        let mgr = BinSemManager::new(8, 32);
        let id = mgr.create("/binsem-a", false).unwrap();
        mgr.give(id).unwrap();
        mgr.take(id).unwrap();
        mgr.delete(id).unwrap();
    }

    #[test]
    fn binsem_repeated_give_does_not_accumulate() {
        let mgr = BinSemManager::new(8, 32);
        let id = mgr.create("/binsem-b", false).unwrap();
        mgr.give(id).unwrap();
        mgr.give(id).unwrap();
        assert_eq!(mgr.get_info(id).unwrap().value, 1);
        mgr.take(id).unwrap();
        assert_eq!(mgr.get_info(id).unwrap().value, 0);
        mgr.delete(id).unwrap();
    }

    #[test]
    fn binsem_flush_releases_waiters_without_leaving_it_signaled() {
        let mgr = StdArc::new(BinSemManager::new(8, 32));
        let id = mgr.create("/binsem-c", false).unwrap();

        let flusher = {
            let mgr = mgr.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(80));
                mgr.flush(id).unwrap();
            })
        };

        assert_eq!(
            mgr.timed_wait(id, Duration::from_millis(300)).unwrap_err(),
            OsalError::SemTimeout
        );
        flusher.join().unwrap();
        assert_eq!(mgr.get_info(id).unwrap().value, 0);
        mgr.delete(id).unwrap();
    }
}
