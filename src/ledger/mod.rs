/// Task registry persistence
///
/// The task manager depends only on the [`TaskRegistry`] trait:
/// insert-if-absent, get, merge, status-guarded merge, delete, search by owner/status and lookup
/// by arbitrary field equality.
///
/// - [`FjallRegistry`] stores tasks in an embedded Fjall keyspace with an
///   owner index for searches.
/// - [`UnitOfWork`] defers writes against any registry until the enclosing
///   request commits.
///
/// ## Usage
///
/// ```rust,ignore
/// use geobatch::ledger::{FjallRegistry, TaskRegistry, UnitOfWork};
///
/// let registry = FjallRegistry::open("data/registry")?;
/// let uow = UnitOfWork::new(&registry);
/// uow.insert_if_absent(&task)?;
/// uow.commit()?;
/// ```

pub mod error;
pub mod partitions;
pub mod registry;
pub mod store;
pub mod unit_of_work;

pub use error::{RegistryError, Result};
pub use registry::{GuardedMerge, TaskRegistry};
pub use store::FjallRegistry;
pub use unit_of_work::UnitOfWork;
