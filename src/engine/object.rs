#![allow(unsafe_code)]

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::config::ObjectConfig;
use super::instance::Shared;
use super::worker::ControlMessage;
use crate::types::{ObjectId, PopulateError, Result, UfoError};

/// Fills elements `[start, end)` into `target`.
///
/// `target` is exactly `(end - start) * stride` bytes. The same range may be
/// requested again after its chunk was evicted, so implementations must
/// produce the same bytes for the same indices.
pub trait Populate: Send + 'static {
    /// Produces elements `[start, end)`.
    fn populate(&mut self, start: u64, end: u64, target: &mut [u8])
        -> std::result::Result<(), PopulateError>;
}

impl<F> Populate for F
where
    F: FnMut(u64, u64, &mut [u8]) -> std::result::Result<(), PopulateError> + Send + 'static,
{
    fn populate(
        &mut self,
        start: u64,
        end: u64,
        target: &mut [u8],
    ) -> std::result::Result<(), PopulateError> {
        self(start, end, target)
    }
}

/// Receives `(start, end, bytes)` for elements of a writable object before
/// their pages are dropped.
pub type WriteBack = Box<dyn FnMut(u64, u64, &[u8]) + Send>;

/// Runs once after the object's memory has been released.
pub type Destructor = Box<dyn FnOnce() + Send>;

/// Caller-supplied behavior of an object.
pub struct ObjectCallbacks {
    populate: Box<dyn Populate>,
    write_back: Option<WriteBack>,
    destructor: Option<Destructor>,
}

impl ObjectCallbacks {
    /// Wraps a population closure.
    pub fn new<F>(populate: F) -> Self
    where
        F: FnMut(u64, u64, &mut [u8]) -> std::result::Result<(), PopulateError> + Send + 'static,
    {
        Self::with_populator(populate)
    }

    /// Wraps any [`Populate`] implementation.
    pub fn with_populator(populate: impl Populate) -> Self {
        Self {
            populate: Box::new(populate),
            write_back: None,
            destructor: None,
        }
    }

    /// Installs the hook that receives modified elements of a writable
    /// object before their pages are dropped.
    pub fn with_write_back(mut self, hook: impl FnMut(u64, u64, &[u8]) + Send + 'static) -> Self {
        self.write_back = Some(Box::new(hook));
        self
    }

    /// Installs a hook that runs once the object's memory is released.
    pub fn with_destructor(mut self, destructor: impl FnOnce() + Send + 'static) -> Self {
        self.destructor = Some(Box::new(destructor));
        self
    }
}

impl fmt::Debug for ObjectCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCallbacks")
            .field("write_back", &self.write_back.is_some())
            .field("destructor", &self.destructor.is_some())
            .finish_non_exhaustive()
    }
}

/// Access gate shared by every handle to an object and the worker's record
/// of it.
///
/// Accessors hold `alive` for reading across raw memory access, so retiring
/// waits for them. The worker raises `unmapping` before it unregisters the
/// range; an access that overlapped the teardown may have read zero pages
/// and must not report success.
#[derive(Debug)]
pub(crate) struct Liveness {
    alive: RwLock<bool>,
    unmapping: AtomicBool,
}

impl Liveness {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            alive: RwLock::new(true),
            unmapping: AtomicBool::new(false),
        })
    }

    /// Marks the object dead, waiting for in-flight accesses to finish.
    /// Returns false if it was already dead.
    pub(crate) fn retire(&self) -> bool {
        let mut alive = self.alive.write();
        std::mem::replace(&mut *alive, false)
    }

    /// Undoes [`Liveness::retire`] after a release the worker refused.
    pub(crate) fn revive(&self) {
        *self.alive.write() = true;
    }

    pub(crate) fn is_alive(&self) -> bool {
        *self.alive.read()
    }

    pub(crate) fn begin_unmap(&self) {
        self.unmapping.store(true, Ordering::SeqCst);
    }

    pub(crate) fn abort_unmap(&self) {
        self.unmapping.store(false, Ordering::SeqCst);
    }

    pub(crate) fn is_unmapping(&self) -> bool {
        self.unmapping.load(Ordering::SeqCst)
    }

    /// Runs `copy` while the object is guaranteed to stay mapped.
    fn access(&self, id: ObjectId, copy: impl FnOnce()) -> Result<()> {
        let alive = self.alive.read();
        if !*alive {
            return Err(UfoError::Destroyed(id));
        }
        copy();
        // the worker stopped serving faults while we were copying
        if self.is_unmapping() {
            return Err(UfoError::ShuttingDown);
        }
        Ok(())
    }
}

/// Worker-side record of an allocated object.
#[derive(Debug)]
pub(crate) struct Object {
    pub(crate) id: ObjectId,
    pub(crate) config: ObjectConfig,
    callbacks: ObjectCallbacks,
    liveness: Arc<Liveness>,
}

impl Object {
    pub(crate) fn new(id: ObjectId, config: ObjectConfig, callbacks: ObjectCallbacks) -> Self {
        Self {
            id,
            config,
            callbacks,
            liveness: Liveness::new(),
        }
    }

    pub(crate) fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    pub(crate) fn populate(&mut self, start: u64, end: u64, target: &mut [u8]) -> Result<()> {
        self.callbacks.populate.populate(start, end, target)?;
        Ok(())
    }

    /// True when evicted bytes must be handed to the write-back hook.
    pub(crate) fn wants_write_back(&self) -> bool {
        !self.config.read_only() && self.callbacks.write_back.is_some()
    }

    pub(crate) fn write_back(&mut self, start: u64, end: u64, bytes: &[u8]) {
        if let Some(hook) = self.callbacks.write_back.as_mut() {
            hook(start, end, bytes);
        }
    }

    /// Consumes the record, running its destructor.
    pub(crate) fn finish(self) {
        if let Some(destructor) = self.callbacks.destructor {
            destructor();
        }
    }
}

struct HandleInner {
    id: ObjectId,
    start: usize,
    config: ObjectConfig,
    liveness: Arc<Liveness>,
    shared: Weak<Shared>,
}

/// Caller-side handle to a live object.
///
/// Handles are cheap to clone; every clone refers to the same object.
/// Reading body memory through [`ObjectHandle::body_ptr`] faults the
/// requested chunk in on demand.
#[derive(Clone)]
pub struct ObjectHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("id", &self.inner.id)
            .field("start", &format_args!("{:#x}", self.inner.start))
            .field("true_size", &self.true_size())
            .finish()
    }
}

impl ObjectHandle {
    pub(crate) fn new(
        id: ObjectId,
        start: usize,
        config: ObjectConfig,
        liveness: Arc<Liveness>,
        shared: Weak<Shared>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                start,
                config,
                liveness,
                shared,
            }),
        }
    }

    /// Identifier assigned at creation; unique within the instance.
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Geometry the object was created with.
    pub fn config(&self) -> &ObjectConfig {
        &self.inner.config
    }

    /// Start of the reservation, including header padding.
    pub fn start(&self) -> usize {
        self.inner.start
    }

    /// Bytes reserved for the object: padded header plus page-rounded body.
    pub fn true_size(&self) -> usize {
        self.inner.config.true_size()
    }

    /// The header sits directly before the body, at the end of its padding.
    pub fn header_ptr(&self) -> *mut u8 {
        let cfg = &self.inner.config;
        (self.inner.start + cfg.header_size_with_padding() - cfg.header_size()) as *mut u8
    }

    /// First body byte. Writing through it is only valid for writable objects.
    pub fn body_ptr(&self) -> *mut u8 {
        (self.inner.start + self.inner.config.header_size_with_padding()) as *mut u8
    }

    /// True if `address` lies inside the reservation.
    pub fn contains(&self, address: usize) -> bool {
        address >= self.inner.start && address - self.inner.start < self.true_size()
    }

    /// False once the object was destroyed or its instance shut down.
    pub fn is_alive(&self) -> bool {
        self.inner.liveness.is_alive()
    }

    /// Copies body bytes starting at `offset` into `dst`.
    ///
    /// Faults the touched chunks in. Fails with [`UfoError::ShuttingDown`]
    /// if the worker stopped while the copy was in flight, in which case
    /// `dst` holds unspecified bytes.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, dst.len(), self.inner.config.body_len())?;
        let src = self.body_ptr().wrapping_add(offset);
        self.inner.liveness.access(self.inner.id, || unsafe {
            ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len())
        })
    }

    /// Copies `src` into the body at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> Result<()> {
        if self.inner.config.read_only() {
            return Err(UfoError::ReadOnly(self.inner.id));
        }
        self.check_bounds(offset, src.len(), self.inner.config.body_len())?;
        let dst = self.body_ptr().wrapping_add(offset);
        self.inner.liveness.access(self.inner.id, || unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len())
        })
    }

    /// Copies header bytes starting at `offset` into `dst`.
    pub fn read_header(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, dst.len(), self.inner.config.header_size())?;
        let src = self.header_ptr().wrapping_add(offset);
        self.inner.liveness.access(self.inner.id, || unsafe {
            ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len())
        })
    }

    /// Copies `src` into the header at `offset`. Headers are writable even
    /// for read-only objects.
    pub fn write_header(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_bounds(offset, src.len(), self.inner.config.header_size())?;
        let dst = self.header_ptr().wrapping_add(offset);
        self.inner.liveness.access(self.inner.id, || unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len())
        })
    }

    /// Releases the object. Destroying twice, or after the instance has
    /// gone away, is a no-op.
    ///
    /// If the worker refuses the release, the handle stays usable and the
    /// call may be retried.
    pub fn destroy(&self) -> Result<()> {
        if !self.retire() {
            return Ok(());
        }
        let Some(shared) = self.inner.shared.upgrade() else {
            return Ok(());
        };
        let (id, start) = (self.inner.id, self.inner.start);
        // absent once shutdown has drained the index
        let indexed = shared.handles.write().remove(start).is_ok();
        debug!(id = id.0, start, indexed, "ufo.object.destroy");
        match shared
            .channel
            .request(|done| ControlMessage::Free { id, start, done })
        {
            Ok(()) | Err(UfoError::ShuttingDown) => Ok(()),
            Err(err) => {
                self.inner.liveness.revive();
                if indexed {
                    if let Err(index_err) =
                        shared.handles.write().insert(start, self.true_size(), self.clone())
                    {
                        warn!(id = id.0, start, error = %index_err, "ufo.object.reindex");
                    }
                }
                Err(err)
            }
        }
    }

    /// Marks the handle dead, waiting for in-flight accesses to finish.
    /// Returns false if it was already dead.
    pub(crate) fn retire(&self) -> bool {
        self.inner.liveness.retire()
    }

    fn check_bounds(&self, offset: usize, len: usize, limit: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= limit => Ok(()),
            _ => Err(UfoError::OutOfBounds { offset, len }),
        }
    }
}
