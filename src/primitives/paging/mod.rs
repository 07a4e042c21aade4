//! Kernel-facing paging operations.
//!
//! Everything the worker does to virtual memory goes through [`PageIo`]. The
//! production implementation is [`UserfaultIo`]; tests substitute an
//! in-memory implementation so the fault-resolution and eviction algorithms
//! can run without kernel support.

pub(crate) mod sys;
mod userfault;

pub use userfault::{page_size, UserfaultIo};

use crate::types::Result;

/// Paging operations performed on behalf of the worker thread.
///
/// Addresses are plain `usize` values. Implementations are owned by exactly
/// one worker and never shared between threads concurrently.
pub trait PageIo: Send + 'static {
    /// Host page granularity in bytes.
    fn page_size(&self) -> usize;

    /// Reserves `len` bytes of private address space and returns its start.
    ///
    /// The first `header_len` bytes are readable and writable; the rest is
    /// read-only unless `writable` is set.
    fn reserve(&mut self, len: usize, header_len: usize, writable: bool) -> Result<usize>;

    /// Releases a reservation made by [`PageIo::reserve`].
    fn release(&mut self, start: usize, len: usize) -> Result<()>;

    /// Registers a range for missing-page notifications.
    fn register(&mut self, start: usize, len: usize) -> Result<()>;

    /// Stops missing-page notifications for a range.
    fn unregister(&mut self, start: usize, len: usize) -> Result<()>;

    /// Backs a registered range with zero pages so it never faults.
    fn zero(&mut self, start: usize, len: usize) -> Result<()>;

    /// Installs `src` as the content of `[dst, dst + src.len())` and wakes
    /// any thread blocked on a fault in that range.
    ///
    /// Returns `false` if the range was already populated, which happens
    /// when several threads fault on the same chunk before it is resolved.
    fn install(&mut self, dst: usize, src: &[u8]) -> Result<bool>;

    /// Drops the physical pages behind a range. The mapping stays valid and
    /// the next access faults again.
    fn discard(&mut self, start: usize, len: usize) -> Result<()>;

    /// Copies resident bytes starting at `start` into `dst`.
    ///
    /// Only called for ranges that are known to be populated.
    fn read_resident(&self, start: usize, dst: &mut [u8]) -> Result<()>;

    /// Appends the address of every queued missing-page notification to
    /// `out`. Returns `Ok(false)` once the notification source is closed.
    fn read_faults(&mut self, out: &mut Vec<usize>) -> Result<bool>;
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory [`PageIo`] that hands out synthetic addresses.

    use std::collections::{BTreeMap, VecDeque};

    use super::PageIo;
    use crate::types::{Result, UfoError};

    #[derive(Debug, Default, Clone)]
    pub(crate) struct Reservation {
        pub len: usize,
        pub header_len: usize,
        pub writable: bool,
        pub registered: bool,
    }

    #[derive(Debug)]
    pub(crate) struct MemoryPageIo {
        page_size: usize,
        next_addr: usize,
        pub reservations: BTreeMap<usize, Reservation>,
        pub pages: BTreeMap<usize, Vec<u8>>,
        pub installs: Vec<(usize, usize)>,
        pub discards: Vec<(usize, usize)>,
        /// Fault addresses handed out by the next `read_faults`.
        pub faults: VecDeque<usize>,
        pub closed: bool,
        pub fail_register: bool,
        pub fail_unregister: bool,
    }

    impl MemoryPageIo {
        pub fn new(page_size: usize) -> Self {
            Self {
                page_size,
                next_addr: 0x1000_0000,
                reservations: BTreeMap::new(),
                pages: BTreeMap::new(),
                installs: Vec::new(),
                discards: Vec::new(),
                faults: VecDeque::new(),
                closed: false,
                fail_register: false,
                fail_unregister: false,
            }
        }

        pub fn resident(&self, addr: usize) -> bool {
            let page = addr - addr % self.page_size;
            self.pages.contains_key(&page)
        }

        pub fn byte_at(&self, addr: usize) -> Option<u8> {
            let page = addr - addr % self.page_size;
            self.pages.get(&page).map(|bytes| bytes[addr - page])
        }

        fn drop_pages(&mut self, start: usize, len: usize) {
            let doomed: Vec<usize> = self.pages.range(start..start + len).map(|(&k, _)| k).collect();
            for page in doomed {
                self.pages.remove(&page);
            }
        }
    }

    impl PageIo for MemoryPageIo {
        fn page_size(&self) -> usize {
            self.page_size
        }

        fn reserve(&mut self, len: usize, header_len: usize, writable: bool) -> Result<usize> {
            let start = self.next_addr;
            // leave a guard page between reservations
            self.next_addr += len + self.page_size;
            self.reservations.insert(
                start,
                Reservation {
                    len,
                    header_len,
                    writable,
                    registered: false,
                },
            );
            Ok(start)
        }

        fn release(&mut self, start: usize, len: usize) -> Result<()> {
            self.reservations
                .remove(&start)
                .ok_or(UfoError::UnknownAddress(start))?;
            self.drop_pages(start, len);
            Ok(())
        }

        fn register(&mut self, start: usize, _len: usize) -> Result<()> {
            if self.fail_register {
                return Err(UfoError::Io(std::io::Error::from_raw_os_error(libc::EINVAL)));
            }
            let res = self
                .reservations
                .get_mut(&start)
                .ok_or(UfoError::UnknownAddress(start))?;
            res.registered = true;
            Ok(())
        }

        fn unregister(&mut self, start: usize, _len: usize) -> Result<()> {
            if self.fail_unregister {
                return Err(UfoError::Io(std::io::Error::from_raw_os_error(libc::EINVAL)));
            }
            let res = self
                .reservations
                .get_mut(&start)
                .ok_or(UfoError::UnknownAddress(start))?;
            res.registered = false;
            Ok(())
        }

        fn zero(&mut self, start: usize, len: usize) -> Result<()> {
            for page in (start..start + len).step_by(self.page_size) {
                self.pages.insert(page, vec![0; self.page_size]);
            }
            Ok(())
        }

        fn install(&mut self, dst: usize, src: &[u8]) -> Result<bool> {
            if self.pages.contains_key(&dst) {
                return Ok(false);
            }
            for (i, chunk) in src.chunks(self.page_size).enumerate() {
                let mut page = vec![0; self.page_size];
                page[..chunk.len()].copy_from_slice(chunk);
                self.pages.insert(dst + i * self.page_size, page);
            }
            self.installs.push((dst, src.len()));
            Ok(true)
        }

        fn discard(&mut self, start: usize, len: usize) -> Result<()> {
            self.drop_pages(start, len);
            self.discards.push((start, len));
            Ok(())
        }

        fn read_resident(&self, start: usize, dst: &mut [u8]) -> Result<()> {
            for (i, byte) in dst.iter_mut().enumerate() {
                *byte = self
                    .byte_at(start + i)
                    .ok_or(UfoError::UnknownAddress(start + i))?;
            }
            Ok(())
        }

        fn read_faults(&mut self, out: &mut Vec<usize>) -> Result<bool> {
            out.extend(self.faults.drain(..));
            Ok(!self.closed)
        }
    }
}
