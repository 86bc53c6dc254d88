//! The reactor: a registration table of descriptor → callback driven by
//! one readiness backend.
//!
//! Exactly one thread at a time is expected inside [`Reactor::poll`] /
//! [`Reactor::run`] for a given instance (concurrent pollers are safe —
//! the table lock and per-registration mutexes keep dispatch coherent —
//! but buy nothing). All callbacks run synchronously on the polling
//! thread; there is no internal dispatch queue.
//!
//! # Callback lifecycle
//!
//! Ownership of a callback transfers to the reactor on [`Reactor::set`]
//! and ends on [`Reactor::del`], after delivery of a `ONCE` registration,
//! or when a `CLOSED` event is dispatched — in the latter two cases the
//! registration is gone *before* the callback runs, so a descriptor never
//! hears anything after its terminal event. Re-registering a descriptor
//! replaces the previous entry atomically.
//!
//! # Cancellation
//!
//! [`Reactor::stop`] is edge-triggered and callable from any thread, with
//! or without a poller blocked: it sets a pending flag and fires the
//! backend wakeup, and the next (or current) `poll` returns
//! [`PollOutcome::Cancelled`]. A backend wakeup with no pending stop is
//! reported as [`PollOutcome::Interrupted`], so stray wakes retry instead
//! of cancelling.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, trace};

use crate::config::NetConfig;
use crate::event::{Event, EventKind, Interest, RegisterFlags};
use crate::poller::{Poller, Wait};

/// Owned event handler for one registered descriptor.
pub type Callback = Box<dyn FnMut(EventKind) + Send>;

struct Registration {
    callback: Arc<Mutex<Callback>>,
    flags: RegisterFlags,
}

/// Result of a single [`Reactor::poll`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// The wait returned readiness; `n` callbacks were invoked.
    Dispatched(usize),
    /// The timeout elapsed with nothing ready.
    TimedOut,
    /// [`Reactor::stop`] was observed.
    Cancelled,
    /// A signal or stray wakeup interrupted the wait; retry.
    Interrupted,
}

/// Readiness-event dispatcher over one OS backend.
pub struct Reactor {
    poller: Poller,
    table: Mutex<HashMap<RawFd, Registration>>,
    stop_pending: AtomicBool,
    max_events: usize,
}

impl Reactor {
    /// Reactor over the target's native readiness facility.
    pub fn new() -> io::Result<Reactor> {
        Self::with_poller(Poller::native()?)
    }

    /// Reactor over an explicitly chosen backend.
    pub fn with_poller(poller: Poller) -> io::Result<Reactor> {
        info!("reactor using {} backend", poller.name());
        Ok(Reactor {
            poller,
            table: Mutex::new(HashMap::new()),
            stop_pending: AtomicBool::new(false),
            max_events: 1024,
        })
    }

    /// Reactor over the native backend, sized per `cfg.max_events`.
    pub fn with_config(cfg: &NetConfig) -> io::Result<Reactor> {
        let mut r = Self::new()?;
        r.max_events = cfg.max_events.max(1);
        Ok(r)
    }

    /// Name of the backend in use, for logs.
    pub fn backend_name(&self) -> &'static str {
        self.poller.name()
    }

    /// Register `callback` for readiness of `fd`, replacing any previous
    /// registration for the same descriptor.
    ///
    /// An empty interest is rejected with `InvalidInput`. Note that on
    /// the kqueue and poll backends a peer close is only observable while
    /// read interest is registered; register `Interest::READ` if close
    /// notification matters (the epoll backend reports it regardless).
    pub fn set<F>(
        &self,
        fd: RawFd,
        interest: Interest,
        flags: RegisterFlags,
        callback: F,
    ) -> io::Result<()>
    where
        F: FnMut(EventKind) + Send + 'static,
    {
        if interest.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "registration needs read or write interest",
            ));
        }
        let mut table = self.table.lock().unwrap();
        self.poller.set(fd, interest, flags)?;
        debug!("register fd={fd} interest={interest:?} flags={flags:?}");
        table.insert(
            fd,
            Registration {
                callback: Arc::new(Mutex::new(Box::new(callback))),
                flags,
            },
        );
        Ok(())
    }

    /// Drop the registration for `fd`. Idempotent; safe to call from
    /// inside a callback running on the polling thread.
    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        let mut table = self.table.lock().unwrap();
        self.poller.del(fd)?;
        if table.remove(&fd).is_some() {
            debug!("deregister fd={fd}");
        }
        Ok(())
    }

    /// Wait up to `timeout` seconds (negative = forever, zero = poll) and
    /// dispatch whatever readiness the backend reports.
    pub fn poll(&self, timeout: f64) -> io::Result<PollOutcome> {
        if self.stop_pending.swap(false, Ordering::AcqRel) {
            return Ok(PollOutcome::Cancelled);
        }
        match self.poller.wait(self.max_events, timeout)? {
            Wait::Wakeup => {
                if self.stop_pending.swap(false, Ordering::AcqRel) {
                    Ok(PollOutcome::Cancelled)
                } else {
                    Ok(PollOutcome::Interrupted)
                }
            }
            Wait::TimedOut => Ok(PollOutcome::TimedOut),
            Wait::Interrupted => Ok(PollOutcome::Interrupted),
            Wait::Ready(events) => Ok(PollOutcome::Dispatched(self.dispatch(events))),
        }
    }

    /// Poll until cancelled. Interruptions and timeouts retry silently;
    /// backend errors and anything a callback raises propagate.
    pub fn run(&self) -> io::Result<()> {
        loop {
            if let PollOutcome::Cancelled = self.poll(-1.0)? {
                return Ok(());
            }
        }
    }

    /// Cancel the current (or next) `poll`. Edge-triggered: a stop issued
    /// with no thread waiting is consumed by the next poll; repeated
    /// stops coalesce.
    pub fn stop(&self) -> io::Result<()> {
        self.stop_pending.store(true, Ordering::Release);
        self.poller.wake()
    }

    fn dispatch(&self, events: Vec<Event>) -> usize {
        // One notification per descriptor per cycle: merge kinds for
        // backends that report read and write readiness separately.
        let mut merged: Vec<Event> = Vec::with_capacity(events.len());
        let mut index: HashMap<RawFd, usize> = HashMap::with_capacity(events.len());
        for ev in events {
            match index.get(&ev.fd) {
                Some(&i) => merged[i].kind |= ev.kind,
                None => {
                    index.insert(ev.fd, merged.len());
                    merged.push(ev);
                }
            }
        }

        let mut delivered = 0;
        for ev in merged {
            let cell = {
                let mut table = self.table.lock().unwrap();
                let terminal = match table.get(&ev.fd) {
                    // Raced with `del`; the event is stale.
                    None => continue,
                    Some(reg) => reg.flags.is_once() || ev.kind.is_closed(),
                };
                if terminal {
                    // Terminal for this registration: tear it down
                    // before the callback can observe it.
                    let reg = table.remove(&ev.fd).expect("present under lock");
                    let _ = self.poller.del(ev.fd);
                    reg.callback
                } else {
                    Arc::clone(&table[&ev.fd].callback)
                }
            };
            trace!("dispatch fd={} kind={:?}", ev.fd, ev.kind);
            // Table lock released; per-descriptor mutex serializes the
            // callback without blocking unrelated descriptors.
            let mut cb = cell.lock().unwrap();
            (*cb)(ev.kind);
            delivered += 1;
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn reactors() -> Vec<Reactor> {
        vec![
            Reactor::new().unwrap(),
            Reactor::with_poller(Poller::fallback().unwrap()).unwrap(),
        ]
    }

    fn write_byte(fd: RawFd) {
        assert_eq!(unsafe { libc::write(fd, b"x".as_ptr() as _, 1) }, 1);
    }

    #[test]
    fn empty_poll_times_out_immediately() {
        for reactor in reactors() {
            let started = Instant::now();
            assert_eq!(reactor.poll(0.0).unwrap(), PollOutcome::TimedOut);
            assert!(started.elapsed() < Duration::from_secs(1));
        }
    }

    #[test]
    fn set_requires_interest() {
        let reactor = Reactor::new().unwrap();
        let err = reactor
            .set(0, Interest::empty(), RegisterFlags::empty(), |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn dispatches_readable_until_deleted() {
        for reactor in reactors() {
            let (r, w) = raw::pipe_nonblocking().unwrap();
            let hits = Arc::new(AtomicUsize::new(0));
            let hits2 = Arc::clone(&hits);
            reactor
                .set(r, Interest::READ, RegisterFlags::empty(), move |kind| {
                    assert!(kind.is_readable());
                    hits2.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();

            write_byte(w);
            assert_eq!(reactor.poll(1.0).unwrap(), PollOutcome::Dispatched(1));
            assert_eq!(hits.load(Ordering::SeqCst), 1);

            reactor.del(r).unwrap();
            reactor.del(r).unwrap(); // idempotent
            write_byte(w);
            assert_eq!(reactor.poll(0.05).unwrap(), PollOutcome::TimedOut);
            assert_eq!(hits.load(Ordering::SeqCst), 1);

            raw::close(r);
            raw::close(w);
        }
    }

    #[test]
    fn once_fires_a_single_time() {
        for reactor in reactors() {
            let (r, w) = raw::pipe_nonblocking().unwrap();
            let hits = Arc::new(AtomicUsize::new(0));
            let hits2 = Arc::clone(&hits);
            reactor
                .set(r, Interest::READ, RegisterFlags::ONCE, move |_| {
                    hits2.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();

            write_byte(w);
            assert_eq!(reactor.poll(1.0).unwrap(), PollOutcome::Dispatched(1));
            // Data still buffered, but the registration is gone.
            assert_eq!(reactor.poll(0.05).unwrap(), PollOutcome::TimedOut);
            assert_eq!(hits.load(Ordering::SeqCst), 1);

            raw::close(r);
            raw::close(w);
        }
    }

    #[test]
    fn reregistration_replaces_callback() {
        for reactor in reactors() {
            let (r, w) = raw::pipe_nonblocking().unwrap();
            let first = Arc::new(AtomicUsize::new(0));
            let second = Arc::new(AtomicUsize::new(0));

            let f = Arc::clone(&first);
            reactor
                .set(r, Interest::READ, RegisterFlags::empty(), move |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            let s = Arc::clone(&second);
            reactor
                .set(r, Interest::READ, RegisterFlags::empty(), move |_| {
                    s.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();

            write_byte(w);
            assert_eq!(reactor.poll(1.0).unwrap(), PollOutcome::Dispatched(1));
            assert_eq!(first.load(Ordering::SeqCst), 0);
            assert_eq!(second.load(Ordering::SeqCst), 1);

            reactor.del(r).unwrap();
            raw::close(r);
            raw::close(w);
        }
    }

    #[test]
    fn closed_event_is_terminal() {
        for reactor in reactors() {
            let (r, w) = raw::pipe_nonblocking().unwrap();
            let saw_close = Arc::new(AtomicUsize::new(0));
            let sc = Arc::clone(&saw_close);
            reactor
                .set(r, Interest::READ, RegisterFlags::empty(), move |kind| {
                    if kind.is_closed() {
                        sc.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();

            raw::close(w);
            assert_eq!(reactor.poll(1.0).unwrap(), PollOutcome::Dispatched(1));
            assert_eq!(saw_close.load(Ordering::SeqCst), 1);
            // Registration died with the CLOSED event.
            assert_eq!(reactor.poll(0.05).unwrap(), PollOutcome::TimedOut);

            raw::close(r);
        }
    }

    #[test]
    fn pending_stop_cancels_next_poll_once() {
        for reactor in reactors() {
            reactor.stop().unwrap();
            reactor.stop().unwrap(); // coalesces
            assert_eq!(reactor.poll(0.0).unwrap(), PollOutcome::Cancelled);
            assert_eq!(reactor.poll(0.0).unwrap(), PollOutcome::TimedOut);
        }
    }

    #[test]
    fn stop_unblocks_poller_on_other_thread() {
        for reactor in reactors() {
            let reactor = Arc::new(reactor);
            let stopper = Arc::clone(&reactor);
            let handle = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                stopper.stop().unwrap();
            });

            let started = Instant::now();
            // Retry stray interruptions the way `run` would.
            let outcome = loop {
                match reactor.poll(10.0).unwrap() {
                    PollOutcome::Interrupted => continue,
                    other => break other,
                }
            };
            assert_eq!(outcome, PollOutcome::Cancelled);
            assert!(started.elapsed() < Duration::from_secs(5));
            handle.join().unwrap();
        }
    }

    #[test]
    fn del_from_inside_callback_does_not_deadlock() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let (r, w) = raw::pipe_nonblocking().unwrap();
        let inner = Arc::clone(&reactor);
        reactor
            .set(r, Interest::READ, RegisterFlags::empty(), move |_| {
                inner.del(r).unwrap();
            })
            .unwrap();

        write_byte(w);
        assert_eq!(reactor.poll(1.0).unwrap(), PollOutcome::Dispatched(1));
        write_byte(w);
        assert_eq!(reactor.poll(0.05).unwrap(), PollOutcome::TimedOut);

        raw::close(r);
        raw::close(w);
    }
}
