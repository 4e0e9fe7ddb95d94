//! Loadable modules, described at the interface level only.
//!
//! `MODULE` exists as an [`osal_registry::ObjectKind`] so the id space
//! reserves a slot for it, but dynamic loading is explicitly out of scope:
//! this port does not provide dynamic loader functionality beyond a thin
//! wrapper. `ModuleLoad` is a stub that always fails; a real integration
//! backs this with a host-specific loader crate (e.g. `libloading`) behind
//! the same [`ModuleManager`] interface.

use osal_error::{OsalError, OsalResult};
use osal_registry::{ObjectId, ObjectKind, ObjectTable};

struct ModuleRecord {
    path: String,
}

pub struct ModuleManager {
    table: ObjectTable<ModuleRecord>,
}

impl ModuleManager {
    pub fn new(capacity: usize, max_name_len: usize) -> Self {
        ModuleManager {
            table: ObjectTable::new(ObjectKind::Module, capacity, max_name_len),
        }
    }

    /// `ModuleLoad`: always returns [`OsalError::ErrNotImplemented`]. A host
    /// integration replaces this with a `libloading::Library::new` (or
    /// platform equivalent) behind the same signature.
    pub fn load(&self, _name: &str, path: &str) -> OsalResult<ObjectId> {
        tracing::warn!(path, "module load requested but no loader backend is linked in");
        Err(OsalError::ErrNotImplemented)
    }

    pub fn unload(&self, id: ObjectId) -> OsalResult<()> {
        self.table.get_exclusive(id)?.finalize_delete()
    }

    pub fn find_by_name(&self, name: &str) -> OsalResult<ObjectId> {
        self.table.find_by_name(name)
    }
}

impl Default for ModuleManager {
    fn default() -> Self {
        ModuleManager::new(8, 32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_is_not_implemented() {
        let mgr = ModuleManager::new(4, 32);
        assert_eq!(
            mgr.load("demo", "/lib/demo.so").unwrap_err(),
            OsalError::ErrNotImplemented
        );
    }

    #[test]
    fn unload_of_unknown_id_is_invalid() {
        let mgr = ModuleManager::new(4, 32);
        assert_eq!(mgr.unload(ObjectId::UNDEFINED).unwrap_err(), OsalError::InvalidId);
    }
}
