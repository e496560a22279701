//! The trash bin: reversible deletes layered over an `ObjectStore`.
//!
//! Deleted objects are relocated under a reserved prefix of the same bucket
//! (see `layout`) and can be listed, restored or purged through
//! `TrashCoordinator`.

pub mod clock;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod layout;
pub mod locks;
pub mod report;

pub use clock::{Clock, SystemClock};
pub use context::TrashContext;
pub use coordinator::TrashCoordinator;
pub use error::{TrashError, TrashResult};
pub use layout::{DEFAULT_TRASH_PREFIX, MAX_PREFIX_LEN, TrashLayout};
pub use report::{BatchFailure, BatchReport};
