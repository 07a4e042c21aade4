#![allow(unsafe_code)]

//! Readiness multiplexing (`epoll`) and the `eventfd` doorbell.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Non-blocking `eventfd` used to wake a poller from another thread.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    /// Creates a doorbell with its counter at zero.
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Increments the counter, making the descriptor readable.
    pub fn notify(&self) -> io::Result<()> {
        let one: u64 = 1;
        loop {
            let written = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    (&one as *const u64).cast(),
                    std::mem::size_of::<u64>(),
                )
            };
            if written >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                // counter saturated: the reader has a wakeup pending anyway
                Some(libc::EAGAIN) => return Ok(()),
                _ => return Err(err),
            }
        }
    }

    /// Resets the counter. Returns the number of notifications consumed.
    pub fn drain(&self) -> io::Result<u64> {
        let mut value: u64 = 0;
        let read = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&mut value as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if read < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) => Ok(0),
                _ => Err(err),
            };
        }
        Ok(value)
    }

    /// Raw descriptor, for readiness polling.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Outcome of one bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// `n` descriptors became ready; their tokens are in the caller's buffer.
    Ready(usize),
    /// Nothing became ready within the timeout.
    TimedOut,
    /// A signal interrupted the wait.
    Interrupted,
}

/// A source of readiness events keyed by `u64` tokens.
pub trait EventSource {
    /// Waits up to `timeout` and writes ready tokens into `tokens`.
    fn wait(&mut self, timeout: Duration, tokens: &mut Vec<u64>) -> io::Result<Readiness>;

    /// Stops reporting `token`. Unknown tokens are ignored.
    fn forget(&mut self, token: u64) -> io::Result<()>;
}

/// Thin owner of an `epoll` instance keyed by `u64` tokens.
#[derive(Debug)]
pub struct Poller {
    fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    watched: Vec<(u64, RawFd)>,
}

impl Poller {
    /// Creates an epoll instance reporting up to `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            watched: Vec::new(),
        })
    }

    /// Watches `fd` for readability, reporting it as `token`.
    pub fn add(&mut self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: token,
        };
        let res = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        self.watched.push((token, fd));
        Ok(())
    }

    /// Stops watching `fd`.
    pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let res = unsafe {
            libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if res != 0 {
            return Err(io::Error::last_os_error());
        }
        self.watched.retain(|&(_, watched)| watched != fd);
        Ok(())
    }
}

impl EventSource for Poller {
    fn wait(&mut self, timeout: Duration, tokens: &mut Vec<u64>) -> io::Result<Readiness> {
        tokens.clear();
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ready = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                millis,
            )
        };
        if ready < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EINTR) => Ok(Readiness::Interrupted),
                _ => Err(err),
            };
        }
        if ready == 0 {
            return Ok(Readiness::TimedOut);
        }
        tokens.extend(self.events[..ready as usize].iter().map(|event| event.u64));
        Ok(Readiness::Ready(ready as usize))
    }

    fn forget(&mut self, token: u64) -> io::Result<()> {
        let fds: Vec<RawFd> = self
            .watched
            .iter()
            .filter(|&&(watched, _)| watched == token)
            .map(|&(_, fd)| fd)
            .collect();
        for fd in fds {
            self.remove(fd)?;
        }
        Ok(())
    }
}
