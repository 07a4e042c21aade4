#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::RwLock;
use tracing::{debug, info};

use super::config::ObjectConfig;
use super::object::{Object, ObjectCallbacks, ObjectHandle};
use super::options::{InstanceOptions, MemoryLimits};
use super::stats::{EngineStats, StatsSnapshot};
use super::worker::{ControlMessage, Worker, CONTROL_TOKEN, FAULT_TOKEN};
use crate::primitives::channel::ControlChannel;
use crate::primitives::paging::UserfaultIo;
use crate::primitives::poll::Poller;
use crate::primitives::registry::ObjectRegistry;
use crate::types::{ObjectId, Result, UfoError};

/// State reachable from both callers and the worker.
pub(crate) struct Shared {
    pub(crate) channel: ControlChannel<ControlMessage>,
    pub(crate) stats: EngineStats,
    /// Caller-side index of live handles, for address lookups.
    pub(crate) handles: RwLock<ObjectRegistry<ObjectHandle>>,
    next_id: AtomicU64,
    // raised before any teardown; handles indexed afterwards are refused
    stopping: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            channel: ControlChannel::new()?,
            stats: EngineStats::default(),
            handles: RwLock::new(ObjectRegistry::new()),
            next_id: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
        }))
    }

    fn next_id(&self) -> ObjectId {
        ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn begin_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }
}

/// An engine instance: one worker thread serving every object created
/// through it.
///
/// ```no_run
/// use ufo::{Instance, InstanceOptions, ObjectCallbacks, ObjectConfig};
///
/// # fn main() -> ufo::Result<()> {
/// let mut instance = Instance::new(InstanceOptions::default())?;
/// instance.set_memory_limits(256 << 20, 128 << 20)?;
/// instance.start()?;
///
/// let config = ObjectConfig::new(0, 1_000_000, 8, None)?;
/// let squares = instance.create_object(
///     &config,
///     ObjectCallbacks::new(|start, end, target| {
///         for (i, slot) in (start..end).zip(target.chunks_mut(8)) {
///             slot.copy_from_slice(&(i * i).to_le_bytes());
///         }
///         Ok(())
///     }),
/// )?;
/// let mut value = [0u8; 8];
/// squares.read_at(999_999 * 8, &mut value)?;
/// squares.destroy()?;
/// instance.shutdown(true)
/// # }
/// ```
pub struct Instance {
    options: InstanceOptions,
    limits: Option<MemoryLimits>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<Result<()>>>,
    started: bool,
}

impl Instance {
    /// Creates an instance that is not yet running.
    ///
    /// Water marks present in `options` are applied as if by
    /// [`Instance::set_memory_limits`].
    pub fn new(options: InstanceOptions) -> Result<Self> {
        let options = options.normalize();
        let limits = options.memory_limits()?;
        Ok(Self {
            limits,
            shared: Shared::new()?,
            worker: None,
            started: false,
            options,
        })
    }

    /// Sets the resident-memory budget. Allowed once, before
    /// [`Instance::start`].
    pub fn set_memory_limits(&mut self, high: usize, low: usize) -> Result<()> {
        if self.limits.is_some() {
            return Err(UfoError::LimitsAlreadySet);
        }
        if self.started {
            return Err(UfoError::AlreadyStarted);
        }
        self.limits = Some(MemoryLimits::new(high, low)?);
        Ok(())
    }

    /// Opens the paging handle and spawns the worker thread.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(UfoError::AlreadyStarted);
        }
        let limits = self.limits.ok_or(UfoError::InvalidConfig(
            "memory limits must be set before start",
        ))?;
        let io = UserfaultIo::open()?;
        let mut poller = Poller::new(2)?;
        poller.add(io.as_raw_fd(), FAULT_TOKEN)?;
        poller.add(self.shared.channel.doorbell().as_raw_fd(), CONTROL_TOKEN)?;

        let worker = Worker::new(io, Arc::clone(&self.shared), limits, &self.options);
        let options = self.options.clone();
        let handle = thread::Builder::new()
            .name("ufo-worker".into())
            .spawn(move || worker.run(poller, &options))?;
        self.worker = Some(handle);
        self.started = true;
        info!(
            high = limits.high,
            low = limits.low,
            concurrency = self.options.concurrency,
            "ufo.instance.start"
        );
        Ok(())
    }

    /// Allocates a new object and blocks until the worker has mapped it.
    pub fn create_object(
        &self,
        config: &ObjectConfig,
        callbacks: ObjectCallbacks,
    ) -> Result<ObjectHandle> {
        if !self.started {
            return Err(UfoError::NotStarted);
        }
        let id = self.shared.next_id();
        let object = Box::new(Object::new(id, config.clone(), callbacks));
        let liveness = Arc::clone(object.liveness());
        let start = self
            .shared
            .channel
            .request(|done| ControlMessage::Allocate { object, done })?;
        let handle = ObjectHandle::new(
            id,
            start,
            config.clone(),
            liveness,
            Arc::downgrade(&self.shared),
        );
        self.shared
            .handles
            .write()
            .insert(start, config.true_size(), handle.clone())?;
        if self.shared.is_stopping() {
            // shutdown may have drained the index before the insert; the
            // worker releases the object itself
            if self.shared.handles.write().remove(start).is_err() {
                debug!(id = id.0, start, "ufo.instance.create_after_drain");
            }
            handle.retire();
            return Err(UfoError::ShuttingDown);
        }
        debug!(id = id.0, start, "ufo.instance.create_object");
        Ok(handle)
    }

    /// Same as [`ObjectHandle::destroy`].
    pub fn destroy_object(&self, handle: &ObjectHandle) -> Result<()> {
        handle.destroy()
    }

    /// Returns the live object whose reservation contains `address`.
    pub fn lookup(&self, address: usize) -> Option<ObjectHandle> {
        self.shared
            .handles
            .read()
            .find(address)
            .map(|(_, _, handle)| handle.clone())
    }

    /// True if `address` belongs to a live object of this instance.
    pub fn is_object_address(&self, address: usize) -> bool {
        self.shared.handles.read().find(address).is_some()
    }

    /// Point-in-time copy of the engine counters. Counters are updated by
    /// the worker after it wakes the faulting thread, so a reader may see
    /// them trail its own access briefly.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Normalized options the instance was created with.
    pub fn options(&self) -> &InstanceOptions {
        &self.options
    }

    /// The resident-memory budget, once set.
    pub fn memory_limits(&self) -> Option<MemoryLimits> {
        self.limits
    }

    /// True while the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Asks the worker to stop. Every live handle is retired first, so no
    /// caller reads memory the worker is about to unmap. Requests already
    /// queued behind the shutdown are answered with
    /// [`UfoError::ShuttingDown`].
    pub fn request_shutdown(&self) {
        self.shared.begin_stopping();
        let handles: Vec<ObjectHandle> = self
            .shared
            .handles
            .write()
            .drain()
            .map(|(_, _, handle)| handle)
            .collect();
        for handle in &handles {
            handle.retire();
        }
        if self.shared.channel.submit(ControlMessage::Shutdown).is_err() {
            debug!("ufo.instance.already_shutting_down");
        }
        self.shared.channel.close();
    }

    /// Stops the instance. With `wait`, blocks until the worker exits and
    /// returns its outcome; otherwise the worker finishes on its own.
    pub fn shutdown(mut self, wait: bool) -> Result<()> {
        self.request_shutdown();
        if wait {
            self.join()
        } else {
            drop(self.worker.take());
            Ok(())
        }
    }

    /// Waits for the worker to exit after [`Instance::request_shutdown`] or
    /// a fatal error, returning the error that stopped it, if any.
    pub fn await_shutdown(mut self) -> Result<()> {
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        match self.worker.take() {
            Some(handle) => handle.join().map_err(|_| UfoError::WorkerPanicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.request_shutdown();
            let _ = self.join();
        }
    }
}
