//! Shared-memory bounded priority queue, grounded directly on the macOS
//! `posix-macos-addons/mqueue` shim: a memory-mapped file beginning with a
//! header (process-shared mutex + condvar, head/free list indices) followed
//! by `max_depth` fixed-size slots threaded into two singly-linked lists.
//!
//! The host primitive this emulates (`pthread_cond_timedwait`) only accepts
//! a wall-clock absolute deadline on every target this shim runs on, so
//! every blocking wait here recomputes a short, bounded wall-clock deadline
//! from a monotonic [`Instant`] each time it loops -- the same fix the
//! dedicated timed-receive adapter (see `osal-timebase`) applies to queues
//! that use a *native* blocking primitive instead of this emulation.

use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    mem,
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::PathBuf,
    ptr, slice,
    time::{Duration, Instant},
};

use osal_error::{OsalError, OsalResult};

const MAX_TRIES: u32 = 10;
const POLL_QUANTUM: Duration = Duration::from_millis(50);

#[repr(C)]
struct Header {
    mutex: libc::pthread_mutex_t,
    condvar: libc::pthread_cond_t,
    max_depth: u32,
    max_size: u32,
    curmsgs: u32,
    head_index: u32,
    free_index: u32,
    waiter_count: u32,
    notify_pid: libc::pid_t,
    notify_signal: i32,
}

#[repr(C)]
struct SlotHeader {
    next_index: u32,
    payload_length: u32,
    priority: u32,
}

fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

fn slot_stride(max_size: usize) -> usize {
    align_up(mem::size_of::<SlotHeader>() + max_size, mem::align_of::<u64>())
}

fn segment_size(max_depth: usize, max_size: usize) -> usize {
    mem::size_of::<Header>() + max_depth * slot_stride(max_size)
}

fn backing_path(name: &str) -> PathBuf {
    PathBuf::from("/tmp").join(name.trim_start_matches('/'))
}

/// Outcome of [`SharedQueue::send`]/[`SharedQueue::receive`] blocking.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Block indefinitely.
    Pend,
    /// Return immediately if the operation cannot proceed.
    Check,
    /// Block for at most this long.
    Relative(Duration),
}

pub struct SharedQueue {
    base: *mut u8,
    size: usize,
    max_size: usize,
    slot_stride: usize,
    owns_file: bool,
    path: PathBuf,
    nonblocking: std::sync::atomic::AtomicBool,
}

/// Mirrors `struct mq_attr`: the handful of fields `mq_getattr` reports.
/// `nonblocking` is per-opener (like `O_NONBLOCK` on a descriptor), not
/// part of the shared segment -- two openers of the same queue may
/// disagree on it, exactly as two processes' descriptors for the same
/// POSIX queue can.
#[derive(Debug, Clone, Copy)]
pub struct QueueAttributes {
    pub max_depth: u32,
    pub max_size: u32,
    pub curmsgs: u32,
    pub nonblocking: bool,
}

unsafe impl Send for SharedQueue {}
unsafe impl Sync for SharedQueue {}

impl SharedQueue {
    /// Creates a new named queue, or attaches to one already created by
    /// another opener in this process if `create` is false.
    pub fn create(name: &str, max_depth: u32, max_size: u32) -> OsalResult<Self> {
        let path = backing_path(name);
        let size = segment_size(max_depth as usize, max_size as usize);

        let mut open_opts = OpenOptions::new();
        open_opts.read(true).write(true).create_new(true).mode(0o600 | libc::S_IXUSR as u32);

        let file = match open_opts.open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Self::attach(name, max_size);
            }
            Err(e) => return Err(e.into()),
        };

        file.set_len(size as u64)?;

        let base = Self::map(&file, size)?;

        unsafe {
            ptr::write_bytes(base, 0, size);

            let header = &mut *(base as *mut Header);
            header.max_depth = max_depth;
            header.max_size = max_size;

            let stride = slot_stride(max_size as usize);
            let first_slot = mem::size_of::<Header>() as u32;

            let mut offset = first_slot;
            for _ in 0..max_depth {
                let slot = &mut *(base.add(offset as usize) as *mut SlotHeader);
                let next = offset + stride as u32;
                slot.next_index = if next < size as u32 { next } else { 0 };
                offset = next;
            }
            // terminate the free list explicitly at the last slot
            if max_depth > 0 {
                let last_offset = first_slot + (max_depth - 1) * stride as u32;
                (&mut *(base.add(last_offset as usize) as *mut SlotHeader)).next_index = 0;
            }
            header.free_index = if max_depth > 0 { first_slot } else { 0 };
            header.head_index = 0;

            init_process_shared_mutex(&mut header.mutex)?;
            init_process_shared_condvar(&mut header.condvar)?;
        }

        // Initialization complete: clear the user-execute bit so that
        // concurrent openers waiting in `attach` see readiness.
        let mode = file.metadata()?.permissions();
        let _ = mode; // silence unused warning on some targets
        unsafe {
            let c_path = CString::new(path.as_os_str().to_string_lossy().into_owned()).unwrap();
            libc::chmod(c_path.as_ptr(), 0o600);
        }

        Ok(SharedQueue {
            base,
            size,
            max_size: max_size as usize,
            slot_stride: slot_stride(max_size as usize),
            owns_file: true,
            path,
            nonblocking: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn attach(name: &str, max_size: u32) -> OsalResult<Self> {
        let path = backing_path(name);

        let mut file: Option<File> = None;
        for _ in 0..MAX_TRIES {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(OsalError::from)?;
            let meta = f.metadata()?;
            let ready = meta.permissions().mode() & libc::S_IXUSR as u32 == 0;
            if ready {
                file = Some(f);
                break;
            }
            drop(f);
            std::thread::sleep(Duration::from_secs(1));
        }

        let file = file.ok_or(OsalError::QueueTimeout)?;
        let size = file.metadata()?.len() as usize;
        let base = Self::map(&file, size)?;

        Ok(SharedQueue {
            base,
            size,
            max_size: max_size as usize,
            slot_stride: slot_stride(max_size as usize),
            owns_file: false,
            path,
            nonblocking: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn map(file: &File, size: usize) -> OsalResult<*mut u8> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(addr as *mut u8)
    }

    fn header(&self) -> &mut Header {
        unsafe { &mut *(self.base as *mut Header) }
    }

    fn slot_header(&self, offset: u32) -> &mut SlotHeader {
        unsafe { &mut *(self.base.add(offset as usize) as *mut SlotHeader) }
    }

    fn slot_payload(&self, offset: u32) -> &mut [u8] {
        unsafe {
            let ptr = self.base.add(offset as usize + mem::size_of::<SlotHeader>());
            slice::from_raw_parts_mut(ptr, self.max_size)
        }
    }

    fn lock(&self) {
        unsafe {
            libc::pthread_mutex_lock(&mut self.header().mutex);
        }
    }

    fn unlock(&self) {
        unsafe {
            libc::pthread_mutex_unlock(&mut self.header().mutex);
        }
    }

    fn signal(&self) {
        unsafe {
            libc::pthread_cond_signal(&mut self.header().condvar);
        }
    }

    /// Waits in short, monotonic-bounded chunks rather than passing a
    /// single long wall-clock deadline to `pthread_cond_timedwait` --
    /// see the module doc comment. Returns `false` once `deadline` has
    /// passed (as measured by the monotonic clock); the caller must
    /// re-check its predicate regardless of the return value since
    /// waking does not imply the predicate is now true.
    fn wait_bounded(&self, deadline: Option<Instant>) -> bool {
        let now = Instant::now();
        if let Some(d) = deadline {
            if now >= d {
                return false;
            }
        }

        let chunk = match deadline {
            None => POLL_QUANTUM,
            Some(d) => (d - now).min(POLL_QUANTUM),
        };

        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        let nanos = ts.tv_nsec as i64 + chunk.subsec_nanos() as i64;
        ts.tv_sec += chunk.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t;
        ts.tv_nsec = nanos % 1_000_000_000;

        let header = self.header();
        unsafe { libc::pthread_cond_timedwait(&mut header.condvar, &mut header.mutex, &ts) == 0 }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn max_depth(&self) -> u32 {
        self.header().max_depth
    }

    pub fn current_depth(&self) -> u32 {
        self.lock();
        let n = self.header().curmsgs;
        self.unlock();
        n
    }

    /// `mq_getattr`: snapshots the attributes `original_source` reports
    /// (`mq_maxmsg`/`mq_msgsize`/`mq_curmsgs`/`mq_flags`). Dropped by the
    /// distillation along with `mq_setattr`; reinstated as a supplement
    /// since both are present in `original_source`.
    pub fn attributes(&self) -> QueueAttributes {
        self.lock();
        let header = self.header();
        let attrs = QueueAttributes {
            max_depth: header.max_depth,
            max_size: header.max_size,
            curmsgs: header.curmsgs,
            nonblocking: self.nonblocking.load(std::sync::atomic::Ordering::Acquire),
        };
        self.unlock();
        attrs
    }

    /// `mq_setattr`: toggles this opener's `O_NONBLOCK`-equivalent flag.
    /// Per-opener, like the POSIX descriptor flag it mirrors -- it does
    /// not live in the shared segment, so two openers of the same queue
    /// may disagree on it.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, std::sync::atomic::Ordering::Release);
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Resolves `Timeout::Pend` against this opener's nonblocking flag,
    /// the way a real `mq_send`/`mq_receive` implicitly treats a blocking
    /// call as non-blocking once `O_NONBLOCK` is set on the descriptor.
    fn resolve_timeout(&self, timeout: Timeout) -> Timeout {
        match timeout {
            Timeout::Pend if self.is_nonblocking() => Timeout::Check,
            other => other,
        }
    }

    /// Registers (or, with `signal == 0`, clears) a one-shot notification
    /// delivered the next time a `send` transitions the queue from empty
    /// to non-empty while no receiver is waiting.
    pub fn notify(&self, pid: libc::pid_t, signal: i32) {
        self.lock();
        let header = self.header();
        header.notify_pid = if signal == 0 { 0 } else { pid };
        header.notify_signal = signal;
        self.unlock();
    }

    pub fn send(&self, payload: &[u8], priority: u32, timeout: Timeout) -> OsalResult<()> {
        if payload.len() > self.max_size {
            return Err(OsalError::QueueInvalidSize);
        }
        let timeout = self.resolve_timeout(timeout);

        self.lock();
        let header = self.header();

        if header.curmsgs == 0 && header.notify_pid != 0 && header.waiter_count == 0 {
            unsafe {
                libc::kill(header.notify_pid, header.notify_signal);
            }
            header.notify_pid = 0;
        } else if header.curmsgs >= header.max_depth {
            match timeout {
                Timeout::Check => {
                    self.unlock();
                    return Err(OsalError::QueueFull);
                }
                Timeout::Pend | Timeout::Relative(_) => {
                    let deadline = match timeout {
                        Timeout::Relative(d) => Some(Instant::now() + d),
                        _ => None,
                    };
                    while self.header().curmsgs >= self.header().max_depth {
                        if !self.wait_bounded(deadline) {
                            if let Some(d) = deadline {
                                if Instant::now() >= d {
                                    self.unlock();
                                    return Err(OsalError::QueueTimeout);
                                }
                            }
                        }
                    }
                }
            }
        }

        let header = self.header();
        let free_index = header.free_index;
        debug_assert_ne!(free_index, 0, "free list exhausted despite curmsgs < max_depth");

        let new_slot_next = self.slot_header(free_index).next_index;
        header.free_index = new_slot_next;

        {
            let slot = self.slot_header(free_index);
            slot.payload_length = payload.len() as u32;
            slot.priority = priority;
        }
        self.slot_payload(free_index)[..payload.len()].copy_from_slice(payload);

        // Splice into the priority-ordered list: insert before the first
        // node with strictly lower priority, else append at the tail.
        // Equal-priority nodes are therefore never reordered relative to
        // each other (stable FIFO within a priority class).
        let header = self.header();
        let mut prev_offset: u32 = 0; // 0 sentinel means "the head pointer itself"
        let mut cursor = header.head_index;
        loop {
            if cursor == 0 {
                if prev_offset == 0 {
                    self.header().head_index = free_index;
                } else {
                    self.slot_header(prev_offset).next_index = free_index;
                }
                self.slot_header(free_index).next_index = 0;
                break;
            }
            let cursor_priority = self.slot_header(cursor).priority;
            if priority > cursor_priority {
                if prev_offset == 0 {
                    self.header().head_index = free_index;
                } else {
                    self.slot_header(prev_offset).next_index = free_index;
                }
                self.slot_header(free_index).next_index = cursor;
                break;
            }
            prev_offset = cursor;
            cursor = self.slot_header(cursor).next_index;
        }

        let header = self.header();
        let was_empty = header.curmsgs == 0;
        header.curmsgs += 1;
        if was_empty {
            self.signal();
        }

        self.unlock();
        Ok(())
    }

    pub fn receive(&self, buf: &mut [u8], timeout: Timeout) -> OsalResult<(usize, u32)> {
        if buf.len() < self.max_size {
            return Err(OsalError::QueueInvalidSize);
        }
        let timeout = self.resolve_timeout(timeout);

        self.lock();

        if self.header().curmsgs == 0 {
            match timeout {
                Timeout::Check => {
                    self.unlock();
                    return Err(OsalError::QueueEmpty);
                }
                Timeout::Pend | Timeout::Relative(_) => {
                    let deadline = match timeout {
                        Timeout::Relative(d) => Some(Instant::now() + d),
                        _ => None,
                    };
                    self.header().waiter_count += 1;
                    while self.header().curmsgs == 0 {
                        if !self.wait_bounded(deadline) {
                            if let Some(d) = deadline {
                                if Instant::now() >= d {
                                    self.header().waiter_count -= 1;
                                    self.unlock();
                                    return Err(OsalError::QueueTimeout);
                                }
                            }
                        }
                    }
                    self.header().waiter_count -= 1;
                }
            }
        }

        let header = self.header();
        let head = header.head_index;
        debug_assert_ne!(head, 0, "head list empty despite curmsgs > 0");

        header.head_index = self.slot_header(head).next_index;

        let (len, priority) = {
            let slot = self.slot_header(head);
            (slot.payload_length as usize, slot.priority)
        };
        buf[..len].copy_from_slice(&self.slot_payload(head)[..len]);

        // Return the slot to the front of the free list.
        let header = self.header();
        self.slot_header(head).next_index = header.free_index;
        header.free_index = head;

        let was_full = header.curmsgs == header.max_depth;
        header.curmsgs -= 1;
        if was_full {
            self.signal();
        }

        self.unlock();
        Ok((len, priority))
    }

    pub fn unlink(self) {
        let path = self.path.clone();
        drop(self);
        let _ = std::fs::remove_file(path);
    }

    /// Removes the backing file by name without requiring ownership of a
    /// live mapping, for the case where another thread may still hold a
    /// clone of the `Arc` wrapping this queue.
    pub fn unlink_by_name(name: &str) {
        let _ = std::fs::remove_file(backing_path(name));
    }
}

impl Drop for SharedQueue {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
        let _ = self.owns_file;
    }
}

fn init_process_shared_mutex(mutex: *mut libc::pthread_mutex_t) -> OsalResult<()> {
    unsafe {
        let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
        libc::pthread_mutexattr_init(&mut attr);
        libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        let rc = libc::pthread_mutex_init(mutex, &attr);
        libc::pthread_mutexattr_destroy(&mut attr);
        if rc != 0 {
            return Err(OsalError::SemFailure);
        }
    }
    Ok(())
}

fn init_process_shared_condvar(cond: *mut libc::pthread_cond_t) -> OsalResult<()> {
    unsafe {
        let mut attr: libc::pthread_condattr_t = mem::zeroed();
        libc::pthread_condattr_init(&mut attr);
        libc::pthread_condattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        let rc = libc::pthread_cond_init(cond, &attr);
        libc::pthread_condattr_destroy(&mut attr);
        if rc != 0 {
            return Err(OsalError::SemFailure);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_queue(tag: &str, depth: u32, size: u32) -> SharedQueue {
        let name = format!("/osal-queue-test-{tag}-{}", std::process::id());
        let _ = std::fs::remove_file(backing_path(&name));
        SharedQueue::create(&name, depth, size).unwrap()
    }

    #[test]
    fn put_then_get_is_bit_identical() {
        let q = fresh_queue("roundtrip", 4, 16);
        q.send(b"hello", 0, Timeout::Check).unwrap();

        let mut buf = [0u8; 16];
        let (len, prio) = q.receive(&mut buf, Timeout::Check).unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(prio, 0);
        q.unlink();
    }

    #[test]
    fn priority_ordering_is_stable_for_ties() {
        let q = fresh_queue("priority", 8, 16);
        q.send(b"a", 5, Timeout::Check).unwrap();
        q.send(b"b", 10, Timeout::Check).unwrap();
        q.send(b"c", 5, Timeout::Check).unwrap();

        let mut buf = [0u8; 16];
        let mut out = Vec::new();
        for _ in 0..3 {
            let (len, _) = q.receive(&mut buf, Timeout::Check).unwrap();
            out.push(buf[..len].to_vec());
        }
        assert_eq!(out, vec![b"b".to_vec(), b"a".to_vec(), b"c".to_vec()]);
        q.unlink();
    }

    #[test]
    fn full_queue_rejects_check_timeout_then_accepts_after_drain() {
        let q = fresh_queue("full", 2, 8);
        q.send(b"1", 0, Timeout::Check).unwrap();
        q.send(b"2", 0, Timeout::Check).unwrap();
        assert_eq!(
            q.send(b"3", 0, Timeout::Check).unwrap_err(),
            OsalError::QueueFull
        );

        let mut buf = [0u8; 8];
        q.receive(&mut buf, Timeout::Check).unwrap();
        assert!(q.send(b"3", 0, Timeout::Check).is_ok());
        q.unlink();
    }

    #[test]
    fn empty_queue_check_receive_is_immediate() {
        let q = fresh_queue("empty", 2, 8);
        let mut buf = [0u8; 8];
        assert_eq!(
            q.receive(&mut buf, Timeout::Check).unwrap_err(),
            OsalError::QueueEmpty
        );
        q.unlink();
    }

    #[test]
    fn attributes_report_live_counts() {
        let q = fresh_queue("attrs", 4, 8);
        q.send(b"x", 0, Timeout::Check).unwrap();

        let attrs = q.attributes();
        assert_eq!(attrs.max_depth, 4);
        assert_eq!(attrs.max_size, 8);
        assert_eq!(attrs.curmsgs, 1);
        assert!(!attrs.nonblocking);
        q.unlink();
    }

    #[test]
    fn nonblocking_flag_turns_a_pend_into_a_check() {
        let q = fresh_queue("nonblocking", 1, 8);
        q.send(b"fill", 0, Timeout::Check).unwrap();
        q.set_nonblocking(true);

        // A full queue with a `Pend` timeout would normally block forever;
        // the nonblocking flag must downgrade it to an immediate failure.
        assert_eq!(
            q.send(b"overflow", 0, Timeout::Pend).unwrap_err(),
            OsalError::QueueFull
        );
        q.unlink();
    }

    #[test]
    fn oversized_message_is_rejected() {
        let q = fresh_queue("oversize", 2, 4);
        assert_eq!(
            q.send(b"toolong", 0, Timeout::Check).unwrap_err(),
            OsalError::QueueInvalidSize
        );
        q.unlink();
    }

    #[test]
    fn undersized_receive_buffer_is_rejected() {
        let q = fresh_queue("undersize", 2, 8);
        q.send(b"hi", 0, Timeout::Check).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            q.receive(&mut buf, Timeout::Check).unwrap_err(),
            OsalError::QueueInvalidSize
        );
        q.unlink();
    }

    #[test]
    fn timed_receive_wakes_promptly_after_a_concurrent_send() {
        use std::sync::Arc;
        use std::thread;

        let name = format!("/osal-queue-test-timed-{}", std::process::id());
        let _ = std::fs::remove_file(backing_path(&name));
        let q = Arc::new(SharedQueue::create(&name, 2, 8).unwrap());

        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(150));
                q.send(b"late", 3, Timeout::Check).unwrap();
            })
        };

        let start = Instant::now();
        let mut buf = [0u8; 8];
        let (len, prio) = q
            .receive(&mut buf, Timeout::Relative(Duration::from_secs(2)))
            .unwrap();
        let elapsed = start.elapsed();

        producer.join().unwrap();
        assert_eq!(&buf[..len], b"late");
        assert_eq!(prio, 3);
        assert!(elapsed < Duration::from_millis(500), "elapsed={elapsed:?}");

        let q = Arc::try_unwrap(q).ok().unwrap();
        q.unlink();
    }
}
