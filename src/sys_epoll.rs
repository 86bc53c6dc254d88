//! Linux readiness backend: epoll plus an eventfd wakeup.
//!
//! Peer-close notification (`EPOLLHUP`/`EPOLLRDHUP`/`EPOLLERR`) is
//! implicit here: it is delivered for any registered descriptor no matter
//! which interest was requested. The kqueue and poll backends do not share
//! this property — see their module docs.

use std::io;
use std::os::unix::io::RawFd;

use crate::event::{Event, EventKind, Interest, RegisterFlags};
use crate::poller::{timeout_to_ms, Wait};

/// Sentinel carried in `epoll_data` by the wakeup eventfd registration.
const WAKE_DATA: u64 = u64::MAX;

#[derive(Debug)]
pub struct Epoll {
    ep: RawFd,
    wake_fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let ep = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if ep < 0 {
            return Err(io::Error::last_os_error());
        }
        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(ep) };
            return Err(err);
        }
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_DATA,
        };
        let rc = unsafe { libc::epoll_ctl(ep, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(ep);
            }
            return Err(err);
        }
        Ok(Epoll { ep, wake_fd })
    }

    /// Register or replace interest for `fd`.
    pub fn set(&self, fd: RawFd, interest: Interest, flags: RegisterFlags) -> io::Result<()> {
        let mut events = libc::EPOLLRDHUP as u32;
        if interest.is_readable() {
            events |= libc::EPOLLIN as u32;
        }
        if interest.is_writable() {
            events |= libc::EPOLLOUT as u32;
        }
        if flags.is_edge() {
            events |= libc::EPOLLET as u32;
        }
        if flags.is_once() {
            events |= libc::EPOLLONESHOT as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // Replace-on-duplicate: try MOD first, fall back to ADD for a
        // descriptor we have not seen.
        let rc = unsafe { libc::epoll_ctl(self.ep, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(err);
        }
        let rc = unsafe { libc::epoll_ctl(self.ep, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Remove all interest for `fd`. Unknown or already-closed
    /// descriptors are a no-op.
    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        let rc =
            unsafe { libc::epoll_ctl(self.ep, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EBADF) => return Ok(()),
                _ => return Err(err),
            }
        }
        Ok(())
    }

    /// Unblock a concurrent `wait` from another thread.
    pub fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        let rc = unsafe {
            libc::write(
                self.wake_fd,
                &one as *const u64 as _,
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: a wake is already pending.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn wait(&self, max_events: usize, timeout: f64) -> io::Result<Wait> {
        let cap = max_events.max(1) + 1; // room for the wakeup slot
        let mut raw: Vec<libc::epoll_event> = Vec::with_capacity(cap);
        let n = unsafe {
            libc::epoll_wait(
                self.ep,
                raw.as_mut_ptr(),
                cap as i32,
                timeout_to_ms(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Wait::Interrupted);
            }
            return Err(err);
        }
        // SAFETY: the kernel fully initialised the first `n` entries.
        unsafe { raw.set_len(n as usize) };
        if raw.is_empty() {
            return Ok(Wait::TimedOut);
        }

        if raw.iter().any(|ev| ev.u64 == WAKE_DATA) {
            self.drain_wake();
            return Ok(Wait::Wakeup);
        }

        let mut out = Vec::with_capacity(raw.len());
        for ev in &raw {
            let mut kind = EventKind::empty();
            if ev.events & (libc::EPOLLIN as u32 | libc::EPOLLPRI as u32) != 0 {
                kind |= EventKind::READABLE;
            }
            if ev.events & libc::EPOLLOUT as u32 != 0 {
                kind |= EventKind::WRITABLE;
            }
            if ev.events
                & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32 | libc::EPOLLERR as u32)
                != 0
            {
                kind |= EventKind::CLOSED;
            }
            if !kind.is_empty() {
                out.push(Event::new(ev.u64 as RawFd, kind));
            }
        }
        if out.is_empty() {
            return Ok(Wait::TimedOut);
        }
        Ok(Wait::Ready(out))
    }

    fn drain_wake(&self) {
        let mut counter: u64 = 0;
        unsafe {
            // One read resets the eventfd counter; EAGAIN means another
            // waiter already consumed it.
            libc::read(
                self.wake_fd,
                &mut counter as *mut u64 as _,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.ep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw;

    #[test]
    fn wait_times_out_when_idle() {
        let ep = Epoll::new().unwrap();
        assert!(matches!(ep.wait(8, 0.0).unwrap(), Wait::TimedOut));
    }

    #[test]
    fn wake_interrupts_wait() {
        let ep = Epoll::new().unwrap();
        ep.wake().unwrap();
        assert!(matches!(ep.wait(8, -1.0).unwrap(), Wait::Wakeup));
        // Wake consumed: the next immediate wait sees nothing.
        assert!(matches!(ep.wait(8, 0.0).unwrap(), Wait::TimedOut));
    }

    #[test]
    fn pipe_read_readiness() {
        let ep = Epoll::new().unwrap();
        let (r, w) = raw::pipe_nonblocking().unwrap();
        ep.set(r, Interest::READ, RegisterFlags::empty()).unwrap();

        assert!(matches!(ep.wait(8, 0.0).unwrap(), Wait::TimedOut));
        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as _, 1) }, 1);

        match ep.wait(8, 1.0).unwrap() {
            Wait::Ready(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].fd, r);
                assert!(events[0].kind.is_readable());
            }
            other => panic!("expected readiness, got {other:?}"),
        }

        ep.del(r).unwrap();
        ep.del(r).unwrap(); // idempotent
        raw::close(r);
        raw::close(w);
    }

    #[test]
    fn set_replaces_registration() {
        let ep = Epoll::new().unwrap();
        let (r, w) = raw::pipe_nonblocking().unwrap();
        ep.set(r, Interest::READ, RegisterFlags::empty()).unwrap();
        // Re-register the same descriptor; must not error.
        ep.set(r, Interest::READ, RegisterFlags::ONCE).unwrap();
        raw::close(r);
        raw::close(w);
    }
}
