//! Portable readiness backend: `poll(2)` over a mutexed interest table,
//! with a self-pipe wakeup.
//!
//! This backend is compiled on every Unix target and is the fallback
//! where neither epoll nor kqueue exists. Limitations compared to the
//! native backends, all inherent to `poll(2)`:
//!
//! - level-triggered only; the EDGE flag is accepted and ignored
//! - the interest table is snapshotted per wait, so a registration made
//!   while another thread is blocked in `wait` takes effect at the next
//!   wait cycle
//! - peer close (`POLLHUP`) is reported through whichever interest is
//!   registered; as with kqueue, a descriptor with no read interest may
//!   not observe an orderly close promptly

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::event::{Event, EventKind, Interest, RegisterFlags};
use crate::poller::{timeout_to_ms, Wait};
use crate::raw;

#[derive(Debug)]
pub struct PollSet {
    table: Mutex<HashMap<RawFd, Interest>>,
    wake_r: RawFd,
    wake_w: RawFd,
}

impl PollSet {
    pub fn new() -> io::Result<Self> {
        let (wake_r, wake_w) = raw::pipe_nonblocking()?;
        Ok(PollSet {
            table: Mutex::new(HashMap::new()),
            wake_r,
            wake_w,
        })
    }

    /// Register or replace interest for `fd`.
    pub fn set(&self, fd: RawFd, interest: Interest, _flags: RegisterFlags) -> io::Result<()> {
        self.table.lock().unwrap().insert(fd, interest);
        Ok(())
    }

    /// Remove all interest for `fd`. Unknown descriptors are a no-op.
    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        self.table.lock().unwrap().remove(&fd);
        Ok(())
    }

    /// Unblock a concurrent `wait` from another thread.
    pub fn wake(&self) -> io::Result<()> {
        let rc = unsafe { libc::write(self.wake_w, b"!".as_ptr() as _, 1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Pipe full: a wake is already pending.
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn wait(&self, max_events: usize, timeout: f64) -> io::Result<Wait> {
        let mut fds: Vec<libc::pollfd> = Vec::new();
        fds.push(libc::pollfd {
            fd: self.wake_r,
            events: libc::POLLIN,
            revents: 0,
        });
        {
            let table = self.table.lock().unwrap();
            fds.reserve(table.len());
            for (&fd, &interest) in table.iter() {
                let mut events: libc::c_short = 0;
                if interest.is_readable() {
                    events |= libc::POLLIN;
                }
                if interest.is_writable() {
                    events |= libc::POLLOUT;
                }
                fds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
            }
        }

        let n = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
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
        if n == 0 {
            return Ok(Wait::TimedOut);
        }

        if fds[0].revents != 0 {
            self.drain_wake();
            return Ok(Wait::Wakeup);
        }

        let mut out = Vec::with_capacity(n as usize);
        for pfd in &fds[1..] {
            if pfd.revents == 0 {
                continue;
            }
            let mut kind = EventKind::empty();
            if pfd.revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                kind |= EventKind::READABLE;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                kind |= EventKind::WRITABLE;
            }
            if pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                kind |= EventKind::CLOSED;
            }
            if !kind.is_empty() {
                out.push(Event::new(pfd.fd, kind));
            }
            if out.len() == max_events {
                break;
            }
        }
        if out.is_empty() {
            return Ok(Wait::TimedOut);
        }
        Ok(Wait::Ready(out))
    }

    fn drain_wake(&self) {
        let mut scratch = [0u8; 64];
        loop {
            let rc =
                unsafe { libc::read(self.wake_r, scratch.as_mut_ptr() as _, scratch.len()) };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl Drop for PollSet {
    fn drop(&mut self) {
        raw::close(self.wake_r);
        raw::close(self.wake_w);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_times_out_when_idle() {
        let ps = PollSet::new().unwrap();
        assert!(matches!(ps.wait(8, 0.0).unwrap(), Wait::TimedOut));
    }

    #[test]
    fn wake_interrupts_wait_and_drains() {
        let ps = PollSet::new().unwrap();
        ps.wake().unwrap();
        ps.wake().unwrap(); // coalesces with the first
        assert!(matches!(ps.wait(8, -1.0).unwrap(), Wait::Wakeup));
        assert!(matches!(ps.wait(8, 0.0).unwrap(), Wait::TimedOut));
    }

    #[test]
    fn pipe_read_readiness() {
        let ps = PollSet::new().unwrap();
        let (r, w) = raw::pipe_nonblocking().unwrap();
        ps.set(r, Interest::READ, RegisterFlags::empty()).unwrap();

        assert!(matches!(ps.wait(8, 0.0).unwrap(), Wait::TimedOut));
        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as _, 1) }, 1);

        match ps.wait(8, 1.0).unwrap() {
            Wait::Ready(events) => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].fd, r);
                assert!(events[0].kind.is_readable());
            }
            other => panic!("expected readiness, got {other:?}"),
        }

        ps.del(r).unwrap();
        ps.del(r).unwrap(); // idempotent
        raw::close(r);
        raw::close(w);
    }

    #[test]
    fn closed_write_end_reports_hangup() {
        let ps = PollSet::new().unwrap();
        let (r, w) = raw::pipe_nonblocking().unwrap();
        ps.set(r, Interest::READ, RegisterFlags::empty()).unwrap();
        raw::close(w);

        match ps.wait(8, 1.0).unwrap() {
            Wait::Ready(events) => {
                assert_eq!(events[0].fd, r);
                assert!(events[0].kind.is_closed());
            }
            other => panic!("expected hangup, got {other:?}"),
        }
        raw::close(r);
    }
}
