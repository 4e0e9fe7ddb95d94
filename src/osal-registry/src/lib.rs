//! The object registry: a unified identity/lifecycle manager for every
//! OSAL resource kind.
//!
//! Every operation that consults a record goes through a *token* acquired
//! from the [`ObjectTable`] belonging to that record's [`ObjectKind`]. The
//! lock-mode semantics (`EXCLUSIVE`/`GLOBAL`/`REFCOUNT`/`NONE`) are encoded
//! as distinct token types rather than a runtime enum field, so using the
//! wrong kind of access for an operation is a compile error.

mod id;
mod table;

pub use id::{ObjectId, ObjectKind, MAX_INDEX};
pub use table::{ExclusiveToken, GlobalToken, ObjectTable, PendingAllocation, RefcountToken};

pub use osal_error::{OsalError, OsalResult};
