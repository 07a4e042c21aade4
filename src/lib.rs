//! Lazily materialized virtual memory objects.
//!
//! An object is a large virtual array whose contents are produced on demand:
//! the first access to an unpopulated chunk raises a page fault, a dedicated
//! worker thread asks the object's populate callback for the chunk's
//! elements, and installs them atomically. Resident chunks are tracked
//! against a memory budget and the oldest are discarded when it runs out;
//! they are repopulated on the next access.
//!
//! Linux only: faults are delivered through `userfaultfd(2)`.

#[cfg(not(target_os = "linux"))]
compile_error!("ufo requires Linux userfaultfd support");

pub mod engine;
pub mod primitives;
pub mod types;

pub use engine::{
    Instance, InstanceOptions, MemoryLimits, ObjectCallbacks, ObjectConfig, ObjectHandle,
    StatsSnapshot,
};
pub use types::{ObjectId, PopulateError, Result, UfoError};
