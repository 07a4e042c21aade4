#![forbid(unsafe_code)]

//! The worker thread: sole owner of the registry, the eviction ring, the
//! scratch buffer and the memory accounting.
//!
//! Callers never touch these structures. They reach the worker through the
//! control channel, and the kernel reaches it through fault notifications.

use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};

use super::instance::Shared;
use super::object::Object;
use super::options::{InstanceOptions, MemoryLimits};
use crate::primitives::channel::Completion;
use crate::primitives::paging::PageIo;
use crate::primitives::poll::{EventSource, Readiness};
use crate::primitives::registry::ObjectRegistry;
use crate::primitives::ring::{ChunkRecord, EvictionRing};
use crate::types::{ObjectId, Result, UfoError};

pub(crate) const FAULT_TOKEN: u64 = 0;
pub(crate) const CONTROL_TOKEN: u64 = 1;

/// Requests served by the worker, in submission order.
pub(crate) enum ControlMessage {
    /// Reserve and register memory for an object. Answers with its start.
    Allocate {
        object: Box<Object>,
        done: Arc<Completion<Result<usize>>>,
    },
    Free {
        id: ObjectId,
        start: usize,
        done: Arc<Completion<Result<()>>>,
    },
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Worker<P: PageIo> {
    io: P,
    registry: ObjectRegistry<Object>,
    ring: EvictionRing,
    ring_growable: bool,
    used_memory: usize,
    limits: MemoryLimits,
    scratch: Vec<u8>,
    spill: Vec<u8>,
    state: WorkerState,
    shared: Arc<Shared>,
}

impl<P: PageIo> Worker<P> {
    pub(crate) fn new(
        io: P,
        shared: Arc<Shared>,
        limits: MemoryLimits,
        options: &InstanceOptions,
    ) -> Self {
        let scratch = vec![0; io.page_size() * options.initial_scratch_pages];
        Self {
            io,
            registry: ObjectRegistry::new(),
            ring: EvictionRing::with_capacity(options.ring_capacity),
            ring_growable: options.ring_growable,
            used_memory: 0,
            limits,
            scratch,
            spill: Vec::new(),
            state: WorkerState::Running,
            shared,
        }
    }

    /// Resolves a missing-page fault at `addr` by populating and installing
    /// the chunk that contains it.
    pub(crate) fn handle_fault(&mut self, addr: usize) -> Result<()> {
        self.shared.stats.record_fault();
        let (id, body_start, span, stride) = {
            let (start, _, object) = self
                .registry
                .find(addr)
                .ok_or(UfoError::UnknownAddress(addr))?;
            let body_start = start + object.config.header_size_with_padding();
            if addr < body_start {
                return Err(UfoError::UnknownAddress(addr));
            }
            let span = object
                .config
                .locate((addr - body_start) as u64)
                .ok_or(UfoError::UnknownAddress(addr))?;
            (object.id, body_start, span, object.config.stride())
        };
        let fill = span.size_bytes as usize;
        if fill > self.limits.high {
            return Err(UfoError::ChunkTooLarge {
                chunk: fill,
                high_water: self.limits.high,
            });
        }
        if self.scratch.len() < fill {
            self.scratch.resize(fill, 0);
        }

        self.evict_for(fill)?;

        let populated = span.fill_count as usize * stride;
        self.registry
            .lookup_mut(addr)?
            .populate(span.index, span.end(), &mut self.scratch[..populated])?;
        self.shared.stats.record_populate();
        self.scratch[populated..fill].fill(0);

        let boundary = body_start + span.boundary_offset as usize;
        if !self.io.install(boundary, &self.scratch[..fill])? {
            // another thread's fault on the same chunk was resolved first
            self.shared.stats.record_duplicate_fault();
            debug!(addr, boundary, "ufo.worker.duplicate_fault");
            return Ok(());
        }
        self.ring.push(
            ChunkRecord {
                address: boundary,
                size: fill,
                owner: id,
            },
            self.ring_growable,
        )?;
        self.used_memory += fill;
        self.shared.stats.record_install();
        trace!(
            id = id.0,
            addr,
            boundary,
            index = span.index,
            count = span.fill_count,
            bytes = fill,
            used = self.used_memory,
            "ufo.worker.fault"
        );
        self.check_totals();
        Ok(())
    }

    /// Makes room for `fill` more bytes. Nothing happens unless the chunk
    /// would cross the high water mark; then the oldest chunks go until it
    /// fits under the low one.
    fn evict_for(&mut self, fill: usize) -> Result<()> {
        if self.used_memory + fill <= self.limits.high {
            return Ok(());
        }
        let before = self.used_memory;
        while self.used_memory > 0 && self.used_memory + fill > self.limits.low {
            let record = self.ring.pop()?;
            if !record.is_live() {
                continue;
            }
            self.write_back_chunk(record.address)?;
            self.used_memory -= record.size;
            self.io.discard(record.address, record.size)?;
            self.shared.stats.record_eviction(record.size);
            self.check_totals();
        }
        debug!(
            before,
            after = self.used_memory,
            incoming = fill,
            "ufo.worker.evict"
        );
        Ok(())
    }

    /// Hands the resident chunk at `address` to its owner's write-back hook.
    /// Read-only objects are skipped.
    fn write_back_chunk(&mut self, address: usize) -> Result<()> {
        let (body_start, span, stride) = {
            let (start, _, object) = self
                .registry
                .find(address)
                .ok_or(UfoError::UnknownAddress(address))?;
            if !object.wants_write_back() {
                return Ok(());
            }
            let body_start = start + object.config.header_size_with_padding();
            let span = object
                .config
                .locate((address - body_start) as u64)
                .ok_or(UfoError::UnknownAddress(address))?;
            (body_start, span, object.config.stride())
        };
        debug_assert_eq!(body_start + span.boundary_offset as usize, address);
        let len = span.fill_count as usize * stride;
        if self.spill.len() < len {
            self.spill.resize(len, 0);
        }
        self.io.read_resident(address, &mut self.spill[..len])?;
        self.registry
            .lookup_mut(address)?
            .write_back(span.index, span.end(), &self.spill[..len]);
        self.shared.stats.record_write_back();
        Ok(())
    }

    /// Reserves, registers and indexes a new object.
    ///
    /// Failures unwind whatever was already done and are reported to the
    /// requester only.
    pub(crate) fn allocate(&mut self, object: Box<Object>) -> Result<usize> {
        let config = &object.config;
        if config.page_size() != self.io.page_size() {
            return Err(UfoError::InvalidConfig("object page size differs from host"));
        }
        let chunk = config.chunk_bytes();
        if chunk > self.limits.high {
            return Err(UfoError::ChunkTooLarge {
                chunk,
                high_water: self.limits.high,
            });
        }
        let len = config.true_size();
        let header = config.header_size_with_padding();
        let start = self.io.reserve(len, header, !config.read_only())?;
        if let Err(err) = self.io.register(start, len) {
            let _ = self.io.release(start, len);
            return Err(err);
        }
        if header > 0 {
            if let Err(err) = self.io.zero(start, header) {
                self.unwind_reservation(start, len);
                return Err(err);
            }
        }
        let id = object.id;
        if let Err(err) = self.registry.insert(start, len, *object) {
            self.unwind_reservation(start, len);
            return Err(err);
        }
        self.shared.stats.record_allocate();
        debug!(id = id.0, start, len, "ufo.worker.allocate");
        Ok(start)
    }

    fn unwind_reservation(&mut self, start: usize, len: usize) {
        if let Err(err) = self.io.unregister(start, len) {
            warn!(start, error = %err, "ufo.worker.unwind_unregister");
        }
        if let Err(err) = self.io.release(start, len) {
            warn!(start, error = %err, "ufo.worker.unwind_release");
        }
    }

    /// Releases the object `id` starting at `start`.
    ///
    /// Unregistering wakes every thread blocked on a fault in the range, so
    /// waiting for in-flight accesses afterwards cannot deadlock, and the
    /// memory is unmapped only once none remain.
    pub(crate) fn free(&mut self, id: ObjectId, start: usize) -> Result<()> {
        let (len, writes_back, liveness) = match self.registry.find(start) {
            Some((found, len, object)) if found == start && object.id == id => {
                (len, object.wants_write_back(), Arc::clone(object.liveness()))
            }
            _ => return Err(UfoError::UnknownAddress(start)),
        };
        if writes_back {
            let resident: Vec<usize> = self
                .ring
                .iter()
                .filter(|record| record.owner == id && record.is_live())
                .map(|record| record.address)
                .collect();
            for address in resident {
                self.write_back_chunk(address)?;
            }
        }
        liveness.begin_unmap();
        if let Err(err) = self.io.unregister(start, len) {
            liveness.abort_unmap();
            return Err(err);
        }
        liveness.retire();
        let object = self.registry.remove(start)?;
        self.used_memory -= self.ring.retire_owner(id);
        if let Err(err) = self.io.release(start, len) {
            // the object is gone either way; only the address space leaks
            warn!(id = id.0, start, len, error = %err, "ufo.worker.release");
        }
        object.finish();
        self.shared.stats.record_free();
        debug!(id = id.0, start, len, used = self.used_memory, "ufo.worker.free");
        self.check_totals();
        Ok(())
    }

    /// Serves queued control messages until the queue is empty or a
    /// shutdown request arrives.
    pub(crate) fn drain_control(&mut self) -> Flow {
        while let Some(msg) = self.shared.channel.next() {
            if self.process_control(msg) == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn process_control(&mut self, msg: ControlMessage) -> Flow {
        match msg {
            ControlMessage::Allocate { object, done } => {
                done.finish(self.allocate(object));
                Flow::Continue
            }
            ControlMessage::Free { id, start, done } => {
                done.finish(self.free(id, start));
                Flow::Continue
            }
            ControlMessage::Shutdown => {
                self.state = WorkerState::ShuttingDown;
                Flow::Stop
            }
        }
    }

    /// Releases every object, answers every queued request and drops the
    /// worker's buffers. Runs on normal shutdown and after fatal errors.
    pub(crate) fn shutdown(&mut self) {
        self.state = WorkerState::ShuttingDown;
        self.shared.begin_stopping();

        let live: Vec<(usize, ObjectId)> = self
            .registry
            .iter()
            .map(|(start, _, object)| (start, object.id))
            .collect();
        let mut released = 0;
        for (start, id) in live {
            if let Err(err) = self.free(id, start) {
                warn!(id = id.0, start, error = %err, "ufo.worker.shutdown_free");
            }
            released += 1;
        }
        // anything free() could not remove still holds a mapping
        for (start, len, object) in self.registry.drain() {
            let liveness = object.liveness();
            liveness.begin_unmap();
            match self.io.unregister(start, len) {
                Ok(()) => {
                    liveness.retire();
                    if let Err(err) = self.io.release(start, len) {
                        warn!(start, error = %err, "ufo.worker.shutdown_release");
                    }
                }
                // a thread may still be parked on a fault here: leak the range
                Err(err) => warn!(start, error = %err, "ufo.worker.shutdown_leak"),
            }
            object.finish();
        }
        self.shared.handles.write().clear();
        self.ring = EvictionRing::with_capacity(1);
        self.used_memory = 0;

        let mut cancelled = 0;
        for msg in self.shared.channel.close_and_drain() {
            match msg {
                ControlMessage::Allocate { done, .. } => {
                    done.finish(Err(UfoError::ShuttingDown));
                    cancelled += 1;
                }
                // the object's memory is gone already
                ControlMessage::Free { done, .. } => done.finish(Ok(())),
                ControlMessage::Shutdown => {}
            }
        }
        self.scratch = Vec::new();
        self.spill = Vec::new();
        self.state = WorkerState::Terminated;
        info!(released, cancelled, "ufo.worker.shutdown");
    }

    fn check_totals(&self) {
        debug_assert_eq!(self.used_memory, self.ring.live_bytes());
        debug_assert!(self.used_memory <= self.limits.high);
    }

    #[cfg(test)]
    pub(crate) fn used_memory(&self) -> usize {
        self.used_memory
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }
}

impl<P: PageIo> Worker<P> {
    /// Runs the event loop until shutdown or a fatal error, then tears down.
    pub(crate) fn run(mut self, mut events: impl EventSource, options: &InstanceOptions) -> Result<()> {
        info!(
            high = self.limits.high,
            low = self.limits.low,
            page_size = self.io.page_size(),
            "ufo.worker.start"
        );
        self.serve(&mut events, options)
    }

    pub(crate) fn serve(
        &mut self,
        events: &mut impl EventSource,
        options: &InstanceOptions,
    ) -> Result<()> {
        let outcome = self.event_loop(events, options);
        if let Err(err) = &outcome {
            error!(error = %err, "ufo.worker.fatal");
        }
        if let Err(err) = events.forget(FAULT_TOKEN) {
            warn!(error = %err, "ufo.worker.forget_faults");
        }
        self.shutdown();
        outcome
    }

    pub(crate) fn event_loop(
        &mut self,
        events: &mut impl EventSource,
        options: &InstanceOptions,
    ) -> Result<()> {
        let mut tokens = Vec::with_capacity(2);
        let mut faults = Vec::new();
        let mut interrupts = 0u32;
        while self.state == WorkerState::Running {
            match events.wait(options.poll_timeout(), &mut tokens)? {
                Readiness::Interrupted => {
                    interrupts += 1;
                    if interrupts > options.max_consecutive_interrupts {
                        return Err(UfoError::InterruptStorm(interrupts));
                    }
                    warn!(interrupts, "ufo.worker.interrupted");
                    continue;
                }
                Readiness::TimedOut => {
                    interrupts = 0;
                    // sweep in case a doorbell wakeup was missed
                    if self.drain_control() == Flow::Stop {
                        break;
                    }
                    continue;
                }
                Readiness::Ready(_) => interrupts = 0,
            }
            for &token in &tokens {
                match token {
                    FAULT_TOKEN => {
                        faults.clear();
                        let open = self.io.read_faults(&mut faults)?;
                        for &addr in &faults {
                            self.handle_fault(addr)?;
                        }
                        if !open {
                            return Err(UfoError::Unsupported("userfaultfd closed"));
                        }
                    }
                    CONTROL_TOKEN => {
                        self.shared.channel.doorbell().drain()?;
                        if self.drain_control() == Flow::Stop {
                            break;
                        }
                    }
                    other => trace!(token = other, "ufo.worker.stray_token"),
                }
            }
        }
        Ok(())
    }
}
