//! Console ring buffer, grounded on the shared console record (`BufBase`,
//! `BufSize`, `ReadPos`, `WritePos`, `OverflowEvents`) and the portable BSP
//! flush routine that walks it from `ReadPos` up to `WritePos`, splitting
//! the copy in two when the range wraps around the end of the buffer.
//!
//! The byte storage itself is a [`crossbeam_queue::ArrayQueue`] rather than
//! a hand-rolled index pair: pushing past capacity is exactly the "ring
//! buffer overflow" case the original counts, so popping the oldest byte
//! to make room on a full push reproduces the original's overwrite-the-
//! tail behavior using a primitive already safe to share across threads
//! without an external lock.

use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_queue::ArrayQueue;
use osal_error::OsalResult;
use osal_registry::{ObjectId, ObjectKind, ObjectTable};
use parking_lot::Mutex;
use std::sync::Arc;

/// A single flush-time sink invocation receives one contiguous chunk of
/// buffered bytes; the flush splits at the wrap point rather than handing
/// the sink a byte at a time, matching the BSP routine's two write calls.
pub type FlushSink = dyn Fn(&[u8]) + Send + Sync;

struct RingBuffer {
    queue: ArrayQueue<u8>,
    overflow_events: AtomicU32,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        RingBuffer {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_events: AtomicU32::new(0),
        }
    }

    fn write(&self, bytes: &[u8]) {
        let mut overflowed = false;
        for &b in bytes {
            if self.queue.push(b).is_err() {
                // Buffer is full: drop the oldest unread byte to make room,
                // matching WritePos overtaking ReadPos in the original.
                let _ = self.queue.pop();
                overflowed = overflowed || self.queue.push(b).is_err();
            }
        }
        if overflowed {
            self.overflow_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drains everything currently buffered to `sink` as one contiguous
    /// chunk and returns the number of bytes flushed.
    fn flush(&self, sink: &FlushSink) -> usize {
        let mut chunk = Vec::with_capacity(self.queue.len());
        while let Some(b) = self.queue.pop() {
            chunk.push(b);
        }
        if !chunk.is_empty() {
            sink(&chunk);
        }
        chunk.len()
    }

    fn overflow_events(&self) -> u32 {
        self.overflow_events.load(Ordering::Relaxed)
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }
}

struct ConsoleRecord {
    name: String,
    buffer: Arc<RingBuffer>,
    sink: Arc<Mutex<Option<Box<FlushSink>>>>,
}

impl Clone for ConsoleRecord {
    fn clone(&self) -> Self {
        ConsoleRecord {
            name: self.name.clone(),
            buffer: self.buffer.clone(),
            sink: self.sink.clone(),
        }
    }
}

/// Snapshot returned by [`ConsoleManager::get_info`].
#[derive(Debug, Clone)]
pub struct ConsoleInfo {
    pub name: String,
    pub creator: ObjectId,
    pub pending_bytes: usize,
    pub overflow_events: u32,
}

pub struct ConsoleManager {
    table: ObjectTable<ConsoleRecord>,
}

impl ConsoleManager {
    pub fn new(capacity: usize, max_name_len: usize) -> Self {
        ConsoleManager {
            table: ObjectTable::new(ObjectKind::Console, capacity, max_name_len),
        }
    }

    pub fn create(&self, name: &str, buffer_size: usize) -> OsalResult<ObjectId> {
        let pending = self.table.allocate_new(Some(name), ObjectId::UNDEFINED)?;
        Ok(pending.finalize(ConsoleRecord {
            name: name.to_string(),
            buffer: Arc::new(RingBuffer::new(buffer_size)),
            sink: Arc::new(Mutex::new(None)),
        }))
    }

    pub fn delete(&self, id: ObjectId) -> OsalResult<()> {
        self.table.get_exclusive(id)?.finalize_delete()
    }

    /// Installs (or clears, with `None`) the function invoked on flush.
    /// Takes the place of the BSP's compiled-in console write routine.
    pub fn set_sink(&self, id: ObjectId, sink: Option<Box<FlushSink>>) -> OsalResult<()> {
        let record = self.table.get_none(id)?;
        *record.sink.lock() = sink;
        Ok(())
    }

    pub fn write(&self, id: ObjectId, bytes: &[u8]) -> OsalResult<()> {
        let record = self.table.get_none(id)?;
        record.buffer.write(bytes);
        Ok(())
    }

    /// Equivalent of `OS_ConsoleOutput_Impl`: drains whatever is currently
    /// buffered to the installed sink, if any, and returns the byte count
    /// flushed.
    pub fn flush(&self, id: ObjectId) -> OsalResult<usize> {
        let record = self.table.get_none(id)?;
        let sink_guard = record.sink.lock();
        Ok(match sink_guard.as_deref() {
            Some(sink) => record.buffer.flush(sink),
            None => 0,
        })
    }

    pub fn find_by_name(&self, name: &str) -> OsalResult<ObjectId> {
        self.table.find_by_name(name)
    }

    pub fn get_info(&self, id: ObjectId) -> OsalResult<ConsoleInfo> {
        let token = self.table.get_global(id)?;
        let record = token.get();
        Ok(ConsoleInfo {
            name: record.name.clone(),
            creator: token.creator(),
            pending_bytes: record.buffer.pending(),
            overflow_events: record.buffer.overflow_events(),
        })
    }
}

impl Default for ConsoleManager {
    fn default() -> Self {
        ConsoleManager::new(4, 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn write_then_flush_delivers_bytes_in_order() {
        let mgr = ConsoleManager::new(4, 32);
        let id = mgr.create("/console-a", 64).unwrap();

        let received: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        mgr.set_sink(id, Some(Box::new(move |chunk| {
            received_clone.lock().unwrap().extend_from_slice(chunk);
        })))
        .unwrap();

        mgr.write(id, b"hello ").unwrap();
        mgr.write(id, b"world").unwrap();
        let n = mgr.flush(id).unwrap();

        assert_eq!(n, 11);
        assert_eq!(&received.lock().unwrap()[..], b"hello world");
        mgr.delete(id).unwrap();
    }

    #[test]
    fn overflowing_the_buffer_drops_oldest_bytes_and_counts_one_event() {
        let mgr = ConsoleManager::new(4, 32);
        let id = mgr.create("/console-b", 4).unwrap();

        mgr.write(id, b"abcd").unwrap(); // exactly fills
        mgr.write(id, b"ef").unwrap(); // overflows by 2 bytes

        let info = mgr.get_info(id).unwrap();
        assert_eq!(info.overflow_events, 1);
        assert_eq!(info.pending_bytes, 4);

        let received: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        mgr.set_sink(id, Some(Box::new(move |chunk| {
            received_clone.lock().unwrap().extend_from_slice(chunk);
        })))
        .unwrap();
        mgr.flush(id).unwrap();

        // "ab" were the oldest bytes and should have been evicted first.
        assert_eq!(&received.lock().unwrap()[..], b"cdef");
        mgr.delete(id).unwrap();
    }

    #[test]
    fn flush_with_no_sink_drains_silently_and_reports_zero() {
        let mgr = ConsoleManager::new(4, 32);
        let id = mgr.create("/console-c", 16).unwrap();
        mgr.write(id, b"unsent").unwrap();
        assert_eq!(mgr.flush(id).unwrap(), 0);
        mgr.delete(id).unwrap();
    }
}
