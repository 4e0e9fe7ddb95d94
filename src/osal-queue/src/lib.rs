//! Message queue emulation built on a named, mmap-backed shared-memory
//! segment -- the same approach the macOS POSIX layer uses to emulate
//! `mqueue` on top of a filesystem that lacks native message queues.
//!
//! Queue records are registered under [`osal_registry::ObjectKind::Queue`]
//! but accessed in `NONE` lock mode: the shared segment carries its own
//! process-shared mutex and condvar, so the registry only needs to protect
//! the record's existence, not its contents, matching the shared layer's
//! own use of `OS_LOCK_MODE_NONE` for `OS_QueueGet`/`OS_QueuePut`.

mod shm;

use std::sync::Arc;

pub use shm::{QueueAttributes, Timeout};

use osal_error::{OsalError, OsalResult};
use osal_registry::{ObjectId, ObjectKind, ObjectTable};

/// Creation-time parameters for a queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueAttr {
    pub max_depth: u32,
    pub max_size: u32,
}

#[derive(Clone)]
struct QueueRecord {
    name: String,
    shared: Arc<shm::SharedQueue>,
}

/// Snapshot returned by [`QueueManager::get_info`].
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub name: String,
    pub creator: ObjectId,
    pub max_depth: u32,
    pub max_size: usize,
    pub current_depth: u32,
}

pub struct QueueManager {
    table: ObjectTable<QueueRecord>,
    queue_max_depth: u32,
    debug_permissive_mode: bool,
}

impl QueueManager {
    pub fn new(capacity: usize, max_name_len: usize) -> Self {
        Self::with_depth_policy(capacity, max_name_len, 256, false)
    }

    /// `queue_max_depth` is the `OS_QUEUE_MAX_DEPTH` ceiling every queue's
    /// `max_depth` is checked against at creation time; when
    /// `debug_permissive_mode` is set, a depth above the ceiling is
    /// silently truncated to it instead of failing `QUEUE_INVALID_SIZE`.
    pub fn with_depth_policy(
        capacity: usize,
        max_name_len: usize,
        queue_max_depth: u32,
        debug_permissive_mode: bool,
    ) -> Self {
        QueueManager {
            table: ObjectTable::new(ObjectKind::Queue, capacity, max_name_len),
            queue_max_depth,
            debug_permissive_mode,
        }
    }

    pub fn create(&self, name: &str, attr: QueueAttr) -> OsalResult<ObjectId> {
        if attr.max_size == 0 {
            return Err(OsalError::QueueInvalidSize);
        }

        let mut max_depth = attr.max_depth;
        if max_depth == 0 || max_depth > self.queue_max_depth {
            if max_depth > self.queue_max_depth && self.debug_permissive_mode {
                tracing::warn!(
                    name,
                    requested = attr.max_depth,
                    ceiling = self.queue_max_depth,
                    "queue depth truncated under DEBUG_PERMISSIVE_MODE"
                );
                max_depth = self.queue_max_depth;
            } else {
                return Err(OsalError::QueueInvalidSize);
            }
        }

        let pending = self.table.allocate_new(Some(name), ObjectId::UNDEFINED)?;

        let shared = match shm::SharedQueue::create(name, max_depth, attr.max_size) {
            Ok(q) => q,
            Err(e) => {
                tracing::error!(name, ?e, "queue creation failed");
                return Err(pending.abort(e));
            }
        };

        let id = pending.finalize(QueueRecord {
            name: name.to_string(),
            shared: Arc::new(shared),
        });
        tracing::debug!(name, ?id, max_depth, "queue created");
        Ok(id)
    }

    /// Deletes the registry record and, if no other holder of the shared
    /// mapping remains, unlinks the backing file. The file is removed by
    /// name regardless, since an in-flight `send`/`receive` elsewhere may
    /// still hold a clone of the mapping and unlinking its name is always
    /// safe once no new callers can look the id back up.
    pub fn delete(&self, id: ObjectId) -> OsalResult<()> {
        let excl = self.table.get_exclusive(id)?;
        let name = excl.get().name.clone();
        excl.finalize_delete()?;
        tracing::debug!(name, ?id, "queue deleted");
        shm::SharedQueue::unlink_by_name(&name);
        Ok(())
    }

    pub fn send(&self, id: ObjectId, payload: &[u8], priority: u32, timeout: Timeout) -> OsalResult<()> {
        let record = self.table.get_none(id)?;
        let result = record.shared.send(payload, priority, timeout);
        if let Err(e) = &result {
            tracing::trace!(?id, priority, bytes = payload.len(), ?e, "queue send failed");
        }
        result
    }

    pub fn receive(&self, id: ObjectId, buf: &mut [u8], timeout: Timeout) -> OsalResult<(usize, u32)> {
        let record = self.table.get_none(id)?;
        let result = record.shared.receive(buf, timeout);
        if let Err(e) = &result {
            tracing::trace!(?id, ?e, "queue receive failed");
        }
        result
    }

    /// Registers (`signal != 0`) or clears (`signal == 0`) the one-shot
    /// empty-to-nonempty notification for this queue.
    pub fn notify(&self, id: ObjectId, pid: libc::pid_t, signal: i32) -> OsalResult<()> {
        let record = self.table.get_none(id)?;
        record.shared.notify(pid, signal);
        Ok(())
    }

    /// `mq_getattr`.
    pub fn attributes(&self, id: ObjectId) -> OsalResult<QueueAttributes> {
        Ok(self.table.get_none(id)?.shared.attributes())
    }

    /// `mq_setattr`, restricted to the `O_NONBLOCK`-equivalent flag (the
    /// only field the original's `mq_setattr` actually allows changing
    /// post-creation).
    pub fn set_nonblocking(&self, id: ObjectId, nonblocking: bool) -> OsalResult<()> {
        self.table.get_none(id)?.shared.set_nonblocking(nonblocking);
        Ok(())
    }

    pub fn find_by_name(&self, name: &str) -> OsalResult<ObjectId> {
        self.table.find_by_name(name)
    }

    pub fn get_info(&self, id: ObjectId) -> OsalResult<QueueInfo> {
        let token = self.table.get_global(id)?;
        let record = token.get();
        Ok(QueueInfo {
            name: record.name.clone(),
            creator: token.creator(),
            max_depth: record.shared.max_depth(),
            max_size: record.shared.max_size(),
            current_depth: record.shared.current_depth(),
        })
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        // Matches the shared layer's default table sizing story: a modest
        // fixed capacity sized for flight-software style static allocation.
        QueueManager::new(64, 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(depth: u32, size: u32) -> QueueAttr {
        QueueAttr {
            max_depth: depth,
            max_size: size,
        }
    }

    #[test]
    fn create_send_receive_delete_roundtrip() {
        let mgr = QueueManager::new(8, 32);
        let name = format!("/osal-lib-test-{}-a", std::process::id());
        let id = mgr.create(&name, attr(4, 16)).unwrap();

        mgr.send(id, b"payload", 1, Timeout::Check).unwrap();
        let mut buf = [0u8; 16];
        let (len, prio) = mgr.receive(id, &mut buf, Timeout::Check).unwrap();
        assert_eq!(&buf[..len], b"payload");
        assert_eq!(prio, 1);

        mgr.delete(id).unwrap();
        assert!(mgr.send(id, b"x", 0, Timeout::Check).is_err());
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mgr = QueueManager::new(8, 32);
        let name = format!("/osal-lib-test-{}-b", std::process::id());
        let id = mgr.create(&name, attr(2, 8)).unwrap();
        assert_eq!(mgr.create(&name, attr(2, 8)).unwrap_err(), OsalError::NameTaken);
        mgr.delete(id).unwrap();
    }

    #[test]
    fn get_info_reports_live_depth() {
        let mgr = QueueManager::new(8, 32);
        let name = format!("/osal-lib-test-{}-c", std::process::id());
        let id = mgr.create(&name, attr(4, 8)).unwrap();

        mgr.send(id, b"1", 0, Timeout::Check).unwrap();
        mgr.send(id, b"2", 0, Timeout::Check).unwrap();

        let info = mgr.get_info(id).unwrap();
        assert_eq!(info.name, name);
        assert_eq!(info.max_depth, 4);
        assert_eq!(info.current_depth, 2);

        mgr.delete(id).unwrap();
    }

    #[test]
    fn find_by_name_resolves_live_queues() {
        let mgr = QueueManager::new(8, 32);
        let name = format!("/osal-lib-test-{}-d", std::process::id());
        let id = mgr.create(&name, attr(2, 8)).unwrap();
        assert_eq!(mgr.find_by_name(&name).unwrap(), id);
        mgr.delete(id).unwrap();
        assert!(mgr.find_by_name(&name).is_err());
    }

    #[test]
    fn attributes_and_set_nonblocking_round_trip_through_the_manager() {
        let mgr = QueueManager::new(8, 32);
        let name = format!("/osal-lib-test-{}-e", std::process::id());
        let id = mgr.create(&name, attr(1, 8)).unwrap();

        assert!(!mgr.attributes(id).unwrap().nonblocking);
        mgr.set_nonblocking(id, true).unwrap();
        assert!(mgr.attributes(id).unwrap().nonblocking);

        mgr.send(id, b"fill", 0, Timeout::Pend).unwrap();
        assert_eq!(
            mgr.send(id, b"overflow", 0, Timeout::Pend).unwrap_err(),
            OsalError::QueueFull
        );

        mgr.delete(id).unwrap();
    }

    #[test]
    fn depth_zero_and_above_ceiling_are_rejected_by_default() {
        let mgr = QueueManager::with_depth_policy(8, 32, 16, false);
        assert_eq!(
            mgr.create("/osal-depth-zero", attr(0, 8)).unwrap_err(),
            OsalError::QueueInvalidSize
        );
        assert_eq!(
            mgr.create("/osal-depth-over", attr(17, 8)).unwrap_err(),
            OsalError::QueueInvalidSize
        );
    }

    #[test]
    fn permissive_mode_truncates_over_ceiling_depth_instead_of_failing() {
        let mgr = QueueManager::with_depth_policy(8, 32, 16, true);
        let id = mgr.create("/osal-depth-truncated", attr(64, 8)).unwrap();
        assert_eq!(mgr.get_info(id).unwrap().max_depth, 16);
        mgr.delete(id).unwrap();
    }
}
