use parking_lot::{Mutex, MutexGuard};

use osal_error::{OsalError, OsalResult};

use crate::id::{normalize_generation, ObjectId, ObjectKind, MAX_INDEX};

struct Slot<T> {
    active: bool,
    generation: u32,
    name: Option<String>,
    creator: ObjectId,
    refcount: u32,
    pending_delete: bool,
    // Boxed so each record sits at a stable heap address: `RefcountToken`
    // reads through a raw pointer after releasing the table lock, and a
    // `Vec<Slot<T>>` growth (`find_free_slot` pushing a new slot) may
    // relocate every `Slot` without this indirection, dangling that
    // pointer.
    data: Option<Box<T>>,
}

impl<T> Slot<T> {
    fn free() -> Self {
        Slot {
            active: false,
            generation: 0,
            name: None,
            creator: ObjectId::UNDEFINED,
            refcount: 0,
            pending_delete: false,
            data: None,
        }
    }

    /// Frees the slot while preserving its generation counter, so the next
    /// allocation at this index still produces an id distinct from every
    /// id ever handed out at this index before.
    fn vacate(&mut self) {
        let generation = self.generation;
        *self = Slot::free();
        self.generation = generation;
    }
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    capacity: usize,
}

impl<T> Inner<T> {
    fn find_free_slot(&mut self) -> Option<usize> {
        if let Some(idx) = self.slots.iter().position(|s| !s.active) {
            return Some(idx);
        }

        if self.slots.len() < self.capacity {
            self.slots.push(Slot::free());
            Some(self.slots.len() - 1)
        } else {
            None
        }
    }

    fn find_by_name(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.active && s.name.as_deref() == Some(name))
    }

    fn validate(&self, kind: ObjectKind, id: ObjectId) -> OsalResult<usize> {
        if id.kind() != Some(kind) {
            return Err(OsalError::InvalidId);
        }

        let index = id.index();
        let slot = self.slots.get(index).ok_or(OsalError::InvalidId)?;

        if !slot.active || normalize_generation(slot.generation) != id.generation() {
            return Err(OsalError::InvalidId);
        }

        Ok(index)
    }
}

/// A fixed-capacity, name-indexed table of a single object kind.
///
/// One `ObjectTable` exists per [`ObjectKind`] in a running [`crate::Registry`]
/// and is itself the "per-kind lock" the spec describes: every operation
/// that consults or mutates a slot acquires `inner` for the duration the
/// spec's lock-mode semantics require, then releases it per the token's
/// contract.
pub struct ObjectTable<T> {
    kind: ObjectKind,
    max_name_len: usize,
    inner: Mutex<Inner<T>>,
}

impl<T> ObjectTable<T> {
    pub fn new(kind: ObjectKind, capacity: usize, max_name_len: usize) -> Self {
        assert!(capacity <= MAX_INDEX + 1, "capacity exceeds 16-bit index space");

        ObjectTable {
            kind,
            max_name_len,
            inner: Mutex::new(Inner {
                slots: Vec::with_capacity(capacity.min(64)),
                capacity,
            }),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// `AllocateNew`: reserves a slot and, if `name` is given, checks it for
    /// both length and uniqueness within this kind. The kind lock is held
    /// across the returned [`PendingAllocation`] until the caller commits
    /// or aborts it, exactly as the shared layer's `OS_ObjectIdAllocateNew`
    /// leaves its global lock held for `OS_ObjectIdFinalizeNew` to release.
    pub fn allocate_new(
        &self,
        name: Option<&str>,
        creator: ObjectId,
    ) -> OsalResult<PendingAllocation<'_, T>> {
        if let Some(name) = name {
            if name.len() >= self.max_name_len {
                return Err(OsalError::NameTooLong);
            }
        }

        let mut guard = self.inner.lock();

        if let Some(name) = name {
            if guard.find_by_name(name).is_some() {
                return Err(OsalError::NameTaken);
            }
        }

        let index = guard.find_free_slot().ok_or(OsalError::NoFreeIds)?;

        Ok(PendingAllocation {
            table: self,
            guard: Some(guard),
            index,
            name: name.map(str::to_owned),
            creator,
        })
    }

    /// `GetById(EXCLUSIVE, ...)`.
    pub fn get_exclusive(&self, id: ObjectId) -> OsalResult<ExclusiveToken<'_, T>> {
        let mut guard = self.inner.lock();
        let index = guard.validate(self.kind, id)?;
        guard.slots[index].pending_delete = false;

        Ok(ExclusiveToken {
            guard: Some(guard),
            index,
            id,
        })
    }

    /// `GetById(GLOBAL, ...)`: a short read-only inspection of the common
    /// record, lock held for the token's lifetime.
    pub fn get_global(&self, id: ObjectId) -> OsalResult<GlobalToken<'_, T>> {
        let guard = self.inner.lock();
        let index = guard.validate(self.kind, id)?;
        Ok(GlobalToken { guard, index, id })
    }

    /// `GetById(REFCOUNT, ...)`: increments the slot's refcount and releases
    /// the kind lock immediately so the caller's operation runs
    /// concurrently with others.
    pub fn get_refcount(&self, id: ObjectId) -> OsalResult<RefcountToken<'_, T>> {
        let mut guard = self.inner.lock();
        let index = guard.validate(self.kind, id)?;
        guard.slots[index].refcount += 1;
        drop(guard);

        Ok(RefcountToken {
            table: self,
            index,
            id,
        })
    }

    /// `GetById(NONE, ...)`: validates the id, releases the lock, and hands
    /// back a cheap clone of the payload for kinds whose impl layer is
    /// internally thread-safe (typically an `Arc<...>` wrapping the real
    /// resource, e.g. a queue or console's shared state).
    pub fn get_none(&self, id: ObjectId) -> OsalResult<T>
    where
        T: Clone,
    {
        let guard = self.inner.lock();
        let index = guard.validate(self.kind, id)?;
        Ok(*guard.slots[index]
            .data
            .clone()
            .expect("active slot always has data"))
    }

    pub fn find_by_name(&self, name: &str) -> OsalResult<ObjectId> {
        let guard = self.inner.lock();
        let index = guard.find_by_name(name).ok_or(OsalError::NameNotFound)?;
        let slot = &guard.slots[index];
        Ok(ObjectId::new(self.kind, slot.generation, index))
    }

    /// Snapshot of every currently-active id, taken under the kind lock and
    /// then released -- this is `IteratorGetNext`'s "avoid long-held
    /// locking" requirement expressed as a one-shot copy instead of a
    /// held-open cursor.
    pub fn snapshot(&self) -> Vec<ObjectId> {
        let guard = self.inner.lock();
        guard
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active)
            .map(|(idx, s)| ObjectId::new(self.kind, s.generation, idx))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.active).count()
    }
}

/// The slot reserved by [`ObjectTable::allocate_new`], not yet visible to
/// `find_by_name`/`get_*` until [`PendingAllocation::finalize`] commits it.
pub struct PendingAllocation<'a, T> {
    table: &'a ObjectTable<T>,
    guard: Option<MutexGuard<'a, Inner<T>>>,
    index: usize,
    name: Option<String>,
    creator: ObjectId,
}

impl<'a, T> PendingAllocation<'a, T> {
    /// `FinalizeNew(SUCCESS, ...)`: commits the allocation, assigning a new
    /// id with an incremented generation, and releases the kind lock.
    pub fn finalize(mut self, data: T) -> ObjectId {
        let mut guard = self.guard.take().unwrap();
        let slot = &mut guard.slots[self.index];

        slot.active = true;
        slot.generation = slot.generation.wrapping_add(1);
        slot.name = self.name.take();
        slot.creator = self.creator;
        slot.refcount = 0;
        slot.pending_delete = false;
        slot.data = Some(Box::new(data));

        let id = ObjectId::new(self.table.kind, slot.generation, self.index);
        tracing::debug!(kind = %self.table.kind, ?id, "object allocated");
        id
    }

    /// `FinalizeNew(error, ...)`: reverts the tentative allocation and
    /// releases the kind lock, propagating `err`.
    pub fn abort(mut self, err: OsalError) -> OsalError {
        drop(self.guard.take());
        err
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl<'a, T> Drop for PendingAllocation<'a, T> {
    fn drop(&mut self) {
        // Dropping without finalizing (e.g. via `?` early-return) aborts
        // the allocation just like an explicit `abort` would.
    }
}

/// `EXCLUSIVE` token: the kind lock is held for the token's entire
/// lifetime, so at most one such token can exist per table at a time.
pub struct ExclusiveToken<'a, T> {
    guard: Option<MutexGuard<'a, Inner<T>>>,
    index: usize,
    id: ObjectId,
}

impl<'a, T> ExclusiveToken<'a, T> {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn get(&self) -> &T {
        self.guard.as_ref().unwrap().slots[self.index]
            .data
            .as_deref()
            .unwrap()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap().slots[self.index]
            .data
            .as_deref_mut()
            .unwrap()
    }

    pub fn refcount(&self) -> u32 {
        self.guard.as_ref().unwrap().slots[self.index].refcount
    }

    pub fn name(&self) -> Option<&str> {
        self.guard.as_ref().unwrap().slots[self.index]
            .name
            .as_deref()
    }

    pub fn creator(&self) -> ObjectId {
        self.guard.as_ref().unwrap().slots[self.index].creator
    }

    /// `FinalizeDelete(SUCCESS, ...)`: refuses to free a record while any
    /// concurrent refcounted access is outstanding -- the spec's Open
    /// Question on queue deletion is resolved this way uniformly for every
    /// kind (see DESIGN.md).
    pub fn finalize_delete(mut self) -> OsalResult<()> {
        let guard = self.guard.as_mut().unwrap();
        let slot = &mut guard.slots[self.index];

        if slot.refcount > 0 {
            slot.pending_delete = true;
            tracing::debug!(id = ?self.id, refcount = slot.refcount, "delete deferred: refcount outstanding");
            return Err(OsalError::IncorrectObjState);
        }

        slot.vacate();
        tracing::debug!(id = ?self.id, "object deleted");
        Ok(())
    }

    pub fn release(self) {
        // Dropping releases the lock.
    }
}

/// `GLOBAL` token: a short-lived read-only hold of the kind lock.
pub struct GlobalToken<'a, T> {
    guard: MutexGuard<'a, Inner<T>>,
    index: usize,
    id: ObjectId,
}

impl<'a, T> GlobalToken<'a, T> {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn get(&self) -> &T {
        self.guard.slots[self.index].data.as_deref().unwrap()
    }

    pub fn name(&self) -> Option<&str> {
        self.guard.slots[self.index].name.as_deref()
    }

    pub fn creator(&self) -> ObjectId {
        self.guard.slots[self.index].creator
    }

    pub fn refcount(&self) -> u32 {
        self.guard.slots[self.index].refcount
    }

    pub fn release(self) {}
}

/// `REFCOUNT` token: the kind lock was released as soon as the refcount was
/// incremented; dropping the token re-acquires the lock just long enough to
/// decrement it again.
pub struct RefcountToken<'a, T> {
    table: &'a ObjectTable<T>,
    index: usize,
    id: ObjectId,
}

impl<'a, T> RefcountToken<'a, T> {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Safe because `T` here is expected to be internally synchronized
    /// (the registry only hands out shared references under this mode).
    pub fn get(&self) -> &T
    where
        T: 'static,
    {
        // SAFETY: the slot cannot be freed while refcount > 0 (see
        // `ExclusiveToken::finalize_delete`), and we hold a live refcount,
        // so the slot's `data` remains `Some` for as long as this token
        // exists, even though we aren't holding the mutex right now.
        // `data` is `Box<T>`, not an inline `T`, specifically so that this
        // pointer survives the table's backing `Vec<Slot<T>>` growing and
        // relocating every `Slot` while the token is alive -- a `Vec`
        // reallocation moves the `Box`'s pointer, never the heap
        // allocation it points to. We still have to go through the lock to
        // read the pointer out since the `Vec` itself isn't `Sync` without
        // it.
        let guard = self.table.inner.lock();
        let ptr: *const T = &**guard.slots[self.index].data.as_ref().unwrap();
        drop(guard);
        unsafe { &*ptr }
    }
}

impl<'a, T> Drop for RefcountToken<'a, T> {
    fn drop(&mut self) {
        let mut guard = self.table.inner.lock();
        let slot = &mut guard.slots[self.index];
        slot.refcount = slot.refcount.saturating_sub(1);

        if slot.refcount == 0 && slot.pending_delete {
            slot.vacate();
            tracing::debug!(id = ?self.id, "deferred object deletion completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ObjectTable<i32> {
        ObjectTable::new(ObjectKind::Queue, 4, 32)
    }

    #[test]
    fn allocate_find_delete_roundtrip() {
        let t = table();
        let pending = t.allocate_new(Some("alpha"), ObjectId::UNDEFINED).unwrap();
        let id = pending.finalize(7);

        assert_eq!(t.find_by_name("alpha").unwrap(), id);

        let excl = t.get_exclusive(id).unwrap();
        assert_eq!(*excl.get(), 7);
        excl.finalize_delete().unwrap();

        assert_eq!(t.find_by_name("alpha"), Err(OsalError::NameNotFound));
    }

    #[test]
    fn duplicate_name_rejected() {
        let t = table();
        t.allocate_new(Some("dup"), ObjectId::UNDEFINED)
            .unwrap()
            .finalize(1);

        assert_eq!(
            t.allocate_new(Some("dup"), ObjectId::UNDEFINED).unwrap_err(),
            OsalError::NameTaken
        );
    }

    #[test]
    fn capacity_exhaustion_then_recovery() {
        let t = table();
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(t.allocate_new(None, ObjectId::UNDEFINED).unwrap().finalize(i));
        }

        assert_eq!(
            t.allocate_new(None, ObjectId::UNDEFINED).unwrap_err(),
            OsalError::NoFreeIds
        );

        t.get_exclusive(ids[0]).unwrap().finalize_delete().unwrap();
        assert!(t.allocate_new(None, ObjectId::UNDEFINED).is_ok());
    }

    #[test]
    fn stale_id_after_delete_is_invalid() {
        let t = table();
        let id = t
            .allocate_new(Some("x"), ObjectId::UNDEFINED)
            .unwrap()
            .finalize(1);
        t.get_exclusive(id).unwrap().finalize_delete().unwrap();

        assert_eq!(t.get_global(id).err(), Some(OsalError::InvalidId));
    }

    #[test]
    fn delete_refused_while_refcount_outstanding() {
        let t = table();
        let id = t
            .allocate_new(Some("busy"), ObjectId::UNDEFINED)
            .unwrap()
            .finalize(1);

        let refc = t.get_refcount(id).unwrap();
        let excl = t.get_exclusive(id).unwrap();
        assert_eq!(excl.finalize_delete(), Err(OsalError::IncorrectObjState));

        drop(refc);
        // pending_delete flag caused the slot to free itself on last release
        assert_eq!(t.get_global(id).err(), Some(OsalError::InvalidId));
    }

    #[test]
    fn name_too_long_rejected() {
        let t = ObjectTable::<i32>::new(ObjectKind::Task, 4, 4);
        let name = "abcd"; // len == max_name_len
        assert_eq!(
            t.allocate_new(Some(name), ObjectId::UNDEFINED).unwrap_err(),
            OsalError::NameTooLong
        );
        let short = "abc"; // len == max_name_len - 1
        assert!(t.allocate_new(Some(short), ObjectId::UNDEFINED).is_ok());
    }
}
