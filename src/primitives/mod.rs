//! Building blocks for the engine.
//!
//! Includes geometry arithmetic, the eviction ring, the address registry,
//! the control channel, readiness polling, and the kernel paging seam.

/// Integer helpers for page and chunk geometry.
pub mod arith;

/// Request channel between caller threads and the worker.
///
/// Provides FIFO delivery and per-request blocking rendezvous.
pub mod channel;

/// Kernel-facing paging operations.
///
/// The [`paging::PageIo`] trait and its userfaultfd implementation.
pub mod paging;

/// Readiness multiplexing and wakeup descriptors.
pub mod poll;

/// Address-interval index of live objects.
pub mod registry;

/// FIFO log of populated chunks used for eviction.
pub mod ring;
