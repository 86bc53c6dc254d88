//! BSD-family readiness backend: kqueue plus an `EVFILT_USER` wakeup.
//!
//! kqueue reports read- and write-readiness as separate kevents for the
//! same descriptor; `wait` merges them so one descriptor yields at most
//! one [`Event`] per cycle. Peer close (`EV_EOF`) is only observable
//! through a registered read filter — callers that want close
//! notification must keep read interest, unlike the epoll backend where
//! HUP is implicit.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use crate::event::{Event, EventKind, Interest, RegisterFlags};
use crate::poller::{timeout_to_ms, Wait};

/// Ident of the user filter reserved for cross-thread wakeup.
const WAKE_IDENT: libc::uintptr_t = libc::uintptr_t::MAX;

#[derive(Debug)]
pub struct Kqueue {
    kq: RawFd,
}

impl Kqueue {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            if libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) != 0 {
                let err = io::Error::last_os_error();
                libc::close(kq);
                return Err(err);
            }
        }
        let this = Kqueue { kq };
        // Arm the wakeup filter once; EV_CLEAR resets it after delivery.
        let change = kevent_change(
            WAKE_IDENT,
            libc::EVFILT_USER,
            (libc::EV_ADD | libc::EV_CLEAR) as _,
            0,
        );
        this.submit(&[change])?;
        Ok(this)
    }

    /// Register or replace interest for `fd`.
    ///
    /// Replace semantics: the filters not requested are deleted so a
    /// re-registration cannot leave stale interest behind.
    pub fn set(&self, fd: RawFd, interest: Interest, flags: RegisterFlags) -> io::Result<()> {
        let mut kflags = libc::EV_ADD;
        if flags.is_edge() {
            kflags |= libc::EV_CLEAR;
        }
        if flags.is_once() {
            kflags |= libc::EV_ONESHOT;
        }

        // Drop whichever filters the new interest does not carry.
        if !interest.is_readable() {
            let _ = self.submit(&[kevent_change(
                fd as _,
                libc::EVFILT_READ,
                libc::EV_DELETE as _,
                0,
            )]);
        }
        if !interest.is_writable() {
            let _ = self.submit(&[kevent_change(
                fd as _,
                libc::EVFILT_WRITE,
                libc::EV_DELETE as _,
                0,
            )]);
        }

        let mut changes = Vec::with_capacity(2);
        if interest.is_readable() {
            changes.push(kevent_change(fd as _, libc::EVFILT_READ, kflags as _, 0));
        }
        if interest.is_writable() {
            changes.push(kevent_change(fd as _, libc::EVFILT_WRITE, kflags as _, 0));
        }
        self.submit(&changes)
    }

    /// Remove all interest for `fd`. Unknown descriptors are a no-op.
    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        let _ = self.submit(&[kevent_change(
            fd as _,
            libc::EVFILT_READ,
            libc::EV_DELETE as _,
            0,
        )]);
        let _ = self.submit(&[kevent_change(
            fd as _,
            libc::EVFILT_WRITE,
            libc::EV_DELETE as _,
            0,
        )]);
        Ok(())
    }

    /// Unblock a concurrent `wait` from another thread.
    pub fn wake(&self) -> io::Result<()> {
        self.submit(&[kevent_change(
            WAKE_IDENT,
            libc::EVFILT_USER,
            0,
            libc::NOTE_TRIGGER,
        )])
    }

    pub fn wait(&self, max_events: usize, timeout: f64) -> io::Result<Wait> {
        let cap = max_events.max(1) + 1; // room for the wakeup slot
        let mut raw: Vec<libc::kevent> = Vec::with_capacity(cap);

        let ms = timeout_to_ms(timeout);
        let ts = libc::timespec {
            tv_sec: (ms / 1000) as _,
            tv_nsec: ((ms % 1000) * 1_000_000) as _,
        };
        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                raw.as_mut_ptr(),
                cap as i32,
                if ms >= 0 { &ts } else { std::ptr::null() },
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

        if raw
            .iter()
            .any(|ev| ev.filter == libc::EVFILT_USER && ev.ident == WAKE_IDENT)
        {
            // EV_CLEAR already reset the filter.
            return Ok(Wait::Wakeup);
        }

        // Merge the per-filter kevents into one notification per fd.
        let mut out: Vec<Event> = Vec::with_capacity(raw.len());
        let mut index: HashMap<RawFd, usize> = HashMap::with_capacity(raw.len());
        for ev in &raw {
            let fd = ev.ident as RawFd;
            let mut kind = EventKind::empty();
            if ev.filter == libc::EVFILT_READ {
                kind |= EventKind::READABLE;
            } else if ev.filter == libc::EVFILT_WRITE {
                kind |= EventKind::WRITABLE;
            } else {
                continue;
            }
            if ev.flags & libc::EV_EOF != 0 {
                kind |= EventKind::CLOSED;
            }
            match index.get(&fd) {
                Some(&i) => out[i].kind |= kind,
                None => {
                    index.insert(fd, out.len());
                    out.push(Event::new(fd, kind));
                }
            }
        }
        if out.is_empty() {
            return Ok(Wait::TimedOut);
        }
        Ok(Wait::Ready(out))
    }

    fn submit(&self, changes: &[libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

// Built from a zeroed struct: the kevent layout grows extra fields on
// some BSDs (FreeBSD's `ext`), so a full literal is not portable.
fn kevent_change(
    ident: libc::uintptr_t,
    filter: i16,
    flags: u16,
    fflags: u32,
) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = ident;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.fflags = fflags as _;
    ev
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw;

    #[test]
    fn wait_times_out_when_idle() {
        let kq = Kqueue::new().unwrap();
        assert!(matches!(kq.wait(8, 0.0).unwrap(), Wait::TimedOut));
    }

    #[test]
    fn wake_interrupts_wait() {
        let kq = Kqueue::new().unwrap();
        kq.wake().unwrap();
        assert!(matches!(kq.wait(8, -1.0).unwrap(), Wait::Wakeup));
        assert!(matches!(kq.wait(8, 0.0).unwrap(), Wait::TimedOut));
    }

    #[test]
    fn pipe_read_readiness() {
        let kq = Kqueue::new().unwrap();
        let (r, w) = raw::pipe_nonblocking().unwrap();
        kq.set(r, Interest::READ, RegisterFlags::empty()).unwrap();

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as _, 1) }, 1);
        match kq.wait(8, 1.0).unwrap() {
            Wait::Ready(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].fd, r);
                assert!(events[0].kind.is_readable());
            }
            other => panic!("expected readiness, got {other:?}"),
        }

        kq.del(r).unwrap();
        kq.del(r).unwrap(); // idempotent
        raw::close(r);
        raw::close(w);
    }
}
