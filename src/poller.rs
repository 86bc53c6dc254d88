//! The backend adapter surface: one closed enum over the readiness
//! facilities compiled for this target, selected once when a reactor is
//! constructed.
//!
//! Every variant implements the same four-operation contract:
//! `set` (register or replace interest), `del` (idempotent removal),
//! `wait` (block up to a timeout for readiness, with an internal wakeup
//! descriptor always part of the wait set), and `wake` (unblock a
//! concurrent `wait` from another thread). Timeouts are `f64` seconds:
//! negative blocks forever, zero polls, positive waits up to that long.
//!
//! What is deliberately *not* unified here:
//!
//! - **Close visibility**: epoll reports peer close for any registered
//!   interest; kqueue and poll(2) only surface it through read interest.
//! - **Edge-triggered WRITABLE cadence**: kqueue re-reports writability
//!   after every successful send while buffer space remains, epoll only
//!   on a full→available transition. Callers must tolerate redundant
//!   WRITABLE notifications.

use std::io;
use std::os::unix::io::RawFd;

use crate::event::{Event, Interest, RegisterFlags};
use crate::sys_poll::PollSet;

#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::sys_epoll::Epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
use crate::sys_kqueue::Kqueue;

/// Outcome of one backend `wait`.
#[derive(Debug)]
pub enum Wait {
    /// At least one descriptor became ready; one entry per descriptor.
    Ready(Vec<Event>),
    /// The internal wakeup primitive fired (someone called `wake`).
    Wakeup,
    /// The timeout elapsed with nothing ready.
    TimedOut,
    /// The wait was interrupted by a signal; retry.
    Interrupted,
}

/// A readiness backend, chosen once at construction.
#[derive(Debug)]
pub enum Poller {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    Epoll(Epoll),
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    Kqueue(Kqueue),
    Poll(PollSet),
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn native_poller() -> io::Result<Poller> {
            Ok(Poller::Epoll(Epoll::new()?))
        }
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))] {
        fn native_poller() -> io::Result<Poller> {
            Ok(Poller::Kqueue(Kqueue::new()?))
        }
    } else {
        fn native_poller() -> io::Result<Poller> {
            Poller::fallback()
        }
    }
}

impl Poller {
    /// The best facility this target offers: epoll on Linux, kqueue on
    /// the BSD family, poll(2) elsewhere.
    pub fn native() -> io::Result<Poller> {
        native_poller()
    }

    /// The portable poll(2) backend, available on every Unix.
    pub fn fallback() -> io::Result<Poller> {
        Ok(Poller::Poll(PollSet::new()?))
    }

    /// Name of the underlying facility, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(_) => "epoll",
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(_) => "kqueue",
            Poller::Poll(_) => "poll",
        }
    }

    /// Register or replace interest for `fd`.
    pub fn set(&self, fd: RawFd, interest: Interest, flags: RegisterFlags) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(p) => p.set(fd, interest, flags),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(p) => p.set(fd, interest, flags),
            Poller::Poll(p) => p.set(fd, interest, flags),
        }
    }

    /// Remove all interest for `fd`; never an error for unknown fds.
    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(p) => p.del(fd),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(p) => p.del(fd),
            Poller::Poll(p) => p.del(fd),
        }
    }

    /// Block up to `timeout` seconds for readiness.
    pub fn wait(&self, max_events: usize, timeout: f64) -> io::Result<Wait> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(p) => p.wait(max_events, timeout),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(p) => p.wait(max_events, timeout),
            Poller::Poll(p) => p.wait(max_events, timeout),
        }
    }

    /// Unblock a concurrent `wait` from another thread.
    pub fn wake(&self) -> io::Result<()> {
        match self {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Poller::Epoll(p) => p.wake(),
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd",
                target_os = "dragonfly"
            ))]
            Poller::Kqueue(p) => p.wake(),
            Poller::Poll(p) => p.wake(),
        }
    }
}

/// Convert an `f64`-seconds timeout to the milliseconds the OS wait calls
/// take. Negative means forever (-1), zero polls, and positive values
/// round *up* so a 0.4 ms timeout does not busy-spin as 0.
pub(crate) fn timeout_to_ms(timeout: f64) -> i32 {
    if timeout < 0.0 {
        return -1;
    }
    if timeout == 0.0 {
        return 0;
    }
    let ms = (timeout * 1000.0).ceil();
    if ms >= i32::MAX as f64 {
        i32::MAX
    } else {
        (ms as i32).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_conversion() {
        assert_eq!(timeout_to_ms(-1.0), -1);
        assert_eq!(timeout_to_ms(-0.001), -1);
        assert_eq!(timeout_to_ms(0.0), 0);
        assert_eq!(timeout_to_ms(0.0004), 1); // rounds up, never spins
        assert_eq!(timeout_to_ms(1.5), 1500);
        assert_eq!(timeout_to_ms(f64::MAX), i32::MAX);
    }

    #[test]
    fn native_and_fallback_construct() {
        let native = Poller::native().unwrap();
        let fallback = Poller::fallback().unwrap();
        assert!(!native.name().is_empty());
        assert_eq!(fallback.name(), "poll");
    }

    #[test]
    fn wakeup_is_distinguished_on_both() {
        for poller in [Poller::native().unwrap(), Poller::fallback().unwrap()] {
            poller.wake().unwrap();
            assert!(matches!(poller.wait(8, -1.0).unwrap(), Wait::Wakeup));
            assert!(matches!(poller.wait(8, 0.0).unwrap(), Wait::TimedOut));
        }
    }
}
