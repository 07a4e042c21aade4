//! Object engine: instances, objects and the worker that materializes them.

/// Object geometry and chunk arithmetic.
pub mod config;
mod instance;
/// Object handles and the callbacks that back them.
pub mod object;
/// Instance options and memory limits.
pub mod options;
/// Counters exposed by a running instance.
pub mod stats;
mod worker;

pub use config::{ChunkSpan, ObjectConfig, DEFAULT_LOAD_BYTES};
pub use instance::Instance;
pub use object::{Destructor, ObjectCallbacks, ObjectHandle, Populate, WriteBack};
pub use options::{InstanceOptions, MemoryLimits};
pub use stats::{EngineStats, StatsSnapshot};
