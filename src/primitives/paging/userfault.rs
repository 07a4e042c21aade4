#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::OnceLock;

use tracing::{debug, trace};

use super::sys::{
    UffdMsg, UffdioApi, UffdioCopy, UffdioRange, UffdioRegister, UffdioZeropage, UFFDIO_API,
    UFFDIO_COPY, UFFDIO_REGISTER, UFFDIO_REGISTER_MODE_MISSING, UFFDIO_UNREGISTER, UFFDIO_WAKE,
    UFFDIO_ZEROPAGE, UFFD_API, UFFD_API_RANGE_IOCTLS, UFFD_EVENT_PAGEFAULT, UFFD_USER_MODE_ONLY,
};
use super::PageIo;
use crate::types::{Result, UfoError};

/// Host page size, queried once per process.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 {
            4096
        } else {
            size as usize
        }
    })
}

/// [`PageIo`] backed by a userfaultfd handle and anonymous mappings.
#[derive(Debug)]
pub struct UserfaultIo {
    fd: OwnedFd,
    page_size: usize,
}

impl UserfaultIo {
    /// Opens a non-blocking userfaultfd handle and performs the API handshake.
    ///
    /// User-mode-only faults are requested first so unprivileged processes
    /// can use the handle; kernels that predate the flag get the plain open.
    pub fn open() -> Result<Self> {
        let base = libc::O_CLOEXEC | libc::O_NONBLOCK;
        let fd = match open_uffd(base | UFFD_USER_MODE_ONLY) {
            Ok(fd) => fd,
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
                open_uffd(base).map_err(map_open_error)?
            }
            Err(err) => return Err(map_open_error(err)),
        };
        let mut api = UffdioApi {
            api: UFFD_API,
            features: 0,
            ioctls: 0,
        };
        uffd_ioctl(fd.as_raw_fd(), UFFDIO_API, &mut api)?;
        if api.api != UFFD_API {
            return Err(UfoError::Unsupported("userfaultfd api version"));
        }
        debug!(fd = fd.as_raw_fd(), ioctls = api.ioctls, "ufo.paging.open");
        Ok(Self {
            fd,
            page_size: page_size(),
        })
    }

    /// Raw descriptor, for readiness polling.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn wake(&self, start: usize, len: usize) -> Result<()> {
        let mut range = UffdioRange {
            start: start as u64,
            len: len as u64,
        };
        uffd_ioctl(self.fd.as_raw_fd(), UFFDIO_WAKE, &mut range)
    }
}

impl PageIo for UserfaultIo {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&mut self, len: usize, header_len: usize, writable: bool) -> Result<usize> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        if header_len > 0 && !writable {
            let res =
                unsafe { libc::mprotect(addr, header_len, libc::PROT_READ | libc::PROT_WRITE) };
            if res != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::munmap(addr, len) };
                return Err(err.into());
            }
        }
        Ok(addr as usize)
    }

    fn release(&mut self, start: usize, len: usize) -> Result<()> {
        let res = unsafe { libc::munmap(start as *mut libc::c_void, len) };
        if res != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn register(&mut self, start: usize, len: usize) -> Result<()> {
        let mut reg = UffdioRegister {
            range: UffdioRange {
                start: start as u64,
                len: len as u64,
            },
            mode: UFFDIO_REGISTER_MODE_MISSING,
            ioctls: 0,
        };
        uffd_ioctl(self.fd.as_raw_fd(), UFFDIO_REGISTER, &mut reg)?;
        if reg.ioctls & UFFD_API_RANGE_IOCTLS != UFFD_API_RANGE_IOCTLS {
            let _ = self.unregister(start, len);
            return Err(UfoError::Unsupported("userfaultfd range ioctls"));
        }
        Ok(())
    }

    fn unregister(&mut self, start: usize, len: usize) -> Result<()> {
        let mut range = UffdioRange {
            start: start as u64,
            len: len as u64,
        };
        uffd_ioctl(self.fd.as_raw_fd(), UFFDIO_UNREGISTER, &mut range)
    }

    fn zero(&mut self, start: usize, len: usize) -> Result<()> {
        let mut zero = UffdioZeropage {
            range: UffdioRange {
                start: start as u64,
                len: len as u64,
            },
            mode: 0,
            zeropage: 0,
        };
        uffd_ioctl(self.fd.as_raw_fd(), UFFDIO_ZEROPAGE, &mut zero)
    }

    fn install(&mut self, dst: usize, src: &[u8]) -> Result<bool> {
        let mut copy = UffdioCopy {
            dst: dst as u64,
            src: src.as_ptr() as u64,
            len: src.len() as u64,
            mode: 0,
            copy: 0,
        };
        loop {
            let res = unsafe { libc::ioctl(self.fd.as_raw_fd(), UFFDIO_COPY as _, &mut copy) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                // partial copy: advance past what landed and retry the rest
                Some(libc::EAGAIN) if copy.copy > 0 => {
                    let copied = copy.copy as u64;
                    trace!(
                        dst = copy.dst,
                        copied,
                        remaining = copy.len - copied,
                        "ufo.paging.partial_copy"
                    );
                    copy.dst += copied;
                    copy.src += copied;
                    copy.len -= copied;
                    copy.copy = 0;
                }
                Some(libc::EAGAIN) => copy.copy = 0,
                Some(libc::EEXIST) => {
                    self.wake(dst, src.len())?;
                    return Ok(false);
                }
                _ => return Err(err.into()),
            }
        }
    }

    fn discard(&mut self, start: usize, len: usize) -> Result<()> {
        let res = unsafe { libc::madvise(start as *mut libc::c_void, len, libc::MADV_DONTNEED) };
        if res != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn read_resident(&self, start: usize, dst: &mut [u8]) -> Result<()> {
        // Safety: callers only pass ranges recorded as resident in the
        // eviction ring, so the copy cannot fault back into this worker.
        unsafe { ptr::copy_nonoverlapping(start as *const u8, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn read_faults(&mut self, out: &mut Vec<usize>) -> Result<bool> {
        let mut msgs = [UffdMsg::default(); 16];
        let msg_len = std::mem::size_of::<UffdMsg>();
        loop {
            let read = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    msgs.as_mut_ptr().cast(),
                    msgs.len() * msg_len,
                )
            };
            if read < 0 {
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(libc::EAGAIN) => Ok(true),
                    Some(libc::EINTR) => continue,
                    _ => Err(err.into()),
                };
            }
            if read == 0 {
                return Ok(false);
            }
            let count = read as usize / msg_len;
            for msg in &msgs[..count] {
                if msg.event != UFFD_EVENT_PAGEFAULT {
                    trace!(event = msg.event, "ufo.paging.unexpected_event");
                    continue;
                }
                out.push(msg.pagefault_address as usize);
            }
            if count < msgs.len() {
                return Ok(true);
            }
        }
    }
}

fn open_uffd(flags: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_userfaultfd, flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

fn map_open_error(err: io::Error) -> UfoError {
    match err.raw_os_error() {
        Some(libc::ENOSYS) => UfoError::Unsupported("kernel without userfaultfd"),
        Some(libc::EPERM) => UfoError::Unsupported("userfaultfd not permitted"),
        _ => UfoError::Io(err),
    }
}

fn uffd_ioctl<T>(fd: RawFd, request: u64, arg: &mut T) -> Result<()> {
    let res = unsafe { libc::ioctl(fd, request as _, arg as *mut T) };
    if res != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}
