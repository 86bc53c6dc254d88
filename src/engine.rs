//! Buffered non-blocking connection I/O engine
//!
//! [`IoEngine`] owns a raw non-blocking socket together with an inbound
//! byte buffer, an outbound FIFO of pending writes, and at most one
//! active [`ReadPolicy`] deciding when enough bytes have accumulated to
//! hand a chunk back to the caller. It is driven by the readiness
//! notifications a reactor delivers for its descriptor: `on_readable`
//! drains the socket and re-evaluates the policy, `on_writable` flushes
//! the queue, `on_ended` runs one final drain-and-evaluate pass so bytes
//! racing the peer's close are not lost.
//!
//! Nothing here blocks: the socket is non-blocking by contract, and every
//! recv/send loop stops at `WouldBlock`. Write completions report the
//! bytes flushed *by that operation*, never cumulative totals.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;

use log::trace;

use crate::buffer_pool::BufferPool;
use crate::raw;

/// When should buffered inbound bytes be delivered?
///
/// `Line` and `Until` carry a scan cursor while active, so re-evaluating
/// a growing buffer never rescans bytes already proven clean — repeated
/// evaluation is amortized linear in the stream length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Deliver as soon as anything is buffered: the whole buffer if its
    /// length is at most the cap, otherwise the first `cap` bytes.
    /// Never waits to accumulate a full cap.
    AtMost(usize),
    /// Deliver the entire buffer whenever it is non-empty.
    All,
    /// Deliver one line: bytes before `\n`, with one optional preceding
    /// `\r` stripped, the delimiter consumed. At stream end the
    /// unterminated remainder is delivered as a final chunk.
    Line,
    /// Deliver exactly this many bytes, waiting until they are buffered;
    /// excess stays buffered.
    Exact(usize),
    /// Deliver the bytes before the delimiter, consuming through it.
    /// An empty delimiter matches at offset zero and delivers an empty
    /// chunk.
    Until(Vec<u8>),
}

struct ActiveRead {
    policy: ReadPolicy,
    /// Byte offset already proven not to contain (or start) the
    /// delimiter. Never exceeds the buffer length; reset to 0 whenever
    /// delivered bytes are trimmed from the buffer.
    cursor: usize,
}

/// Connection lifecycle as the engine sees it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// Non-blocking connect still in flight.
    Connecting,
    /// Established; reads and immediate writes allowed.
    Connected,
    /// Terminal. No further signals are raised.
    Disconnected,
}

/// The buffered-read/partial-write state machine for one socket.
pub struct IoEngine {
    fd: RawFd,
    state: ConnState,
    inbound: Vec<u8>,
    outbound: VecDeque<Vec<u8>>,
    active: Option<ActiveRead>,
    eof: bool,
    pool: BufferPool,
}

impl IoEngine {
    pub fn new(fd: RawFd, state: ConnState) -> IoEngine {
        IoEngine {
            fd,
            state,
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            active: None,
            eof: false,
            pool: BufferPool::default(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Promote a `Connecting` engine once the handshake completed.
    pub fn mark_connected(&mut self) {
        if self.state == ConnState::Connecting {
            self.state = ConnState::Connected;
        }
    }

    /// True while queued writes are waiting for the socket to accept
    /// them; the owner keeps write interest registered while this holds.
    pub fn has_queued_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// True while a read policy is installed and undelivered.
    pub fn has_active_read(&self) -> bool {
        self.active.is_some()
    }

    /// True once a drain has observed end-of-stream (`recv` returned 0).
    /// The owner should run [`IoEngine::on_ended`] and tear down: an
    /// EOF descriptor stays readable forever under level-triggered
    /// polling.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Install `policy`, drain whatever the socket holds right now, and
    /// evaluate once. `Ok(Some(chunk))` delivers immediately and clears
    /// the policy; `Ok(None)` leaves it armed for the next readability
    /// notification.
    pub fn read(&mut self, policy: ReadPolicy) -> io::Result<Option<Vec<u8>>> {
        self.active = Some(ActiveRead { policy, cursor: 0 });
        self.drain()?;
        Ok(self.evaluate())
    }

    /// Readability notification: drain and re-evaluate the active
    /// policy. No-op when no read is outstanding.
    pub fn on_readable(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.active.is_none() {
            return Ok(None);
        }
        self.drain()?;
        Ok(self.evaluate())
    }

    /// Send `bytes`, queueing whatever the socket does not accept.
    ///
    /// Returns the number of bytes flushed by *this* call: zero when the
    /// engine is not connected yet or older writes are still queued (the
    /// payload is appended behind them), the accepted prefix length when
    /// the socket took part of it.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }
        if self.state != ConnState::Connected || !self.outbound.is_empty() {
            self.outbound.push_back(bytes.to_vec());
            return Ok(0);
        }
        let fd = self.fd;
        let sent = send_slice(&mut |b| raw::send(fd, b), bytes)?;
        if sent < bytes.len() {
            self.outbound.push_back(bytes[sent..].to_vec());
        }
        Ok(sent)
    }

    /// Writability notification: flush from the head of the queue,
    /// returning the bytes accepted in this pass. Only the head item is
    /// ever partially sent.
    pub fn on_writable(&mut self) -> io::Result<usize> {
        if self.state != ConnState::Connected {
            return Ok(0);
        }
        let fd = self.fd;
        self.flush_with(&mut |b| raw::send(fd, b))
    }

    /// Close notification: one final drain-and-evaluate pass so data that
    /// arrived together with the FIN is still delivered, then the engine
    /// goes terminal. Returns the final chunk, if the active policy
    /// yields one.
    pub fn on_ended(&mut self) -> Option<Vec<u8>> {
        if self.state == ConnState::Disconnected {
            return None;
        }
        // The descriptor may already be half-dead; drain what it yields.
        let _ = self.drain();
        self.finish()
    }

    /// Terminal transition without touching the socket (used on I/O
    /// error): evaluate once with end-of-stream semantics and mark the
    /// engine disconnected. Returns any last deliverable chunk.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.state == ConnState::Disconnected {
            return None;
        }
        self.eof = true;
        let out = self.evaluate();
        self.state = ConnState::Disconnected;
        out
    }

    /// Non-blocking recv loop into scratch buffers until the socket runs
    /// dry or reports end-of-stream. A policy armed before the connect
    /// completes simply waits: there is nothing to recv from a socket
    /// still in its handshake.
    fn drain(&mut self) -> io::Result<()> {
        if self.eof || self.state != ConnState::Connected {
            return Ok(());
        }
        loop {
            let mut buf = self.pool.acquire();
            buf.resize(self.pool.chunk_size(), 0);
            match raw::recv(self.fd, &mut buf) {
                Ok(0) => {
                    self.pool.release(buf);
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&buf[..n]);
                    self.pool.release(buf);
                    trace!("fd={} drained {n} bytes ({} buffered)", self.fd, self.inbound.len());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.pool.release(buf);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.pool.release(buf);
                }
                Err(e) => {
                    self.pool.release(buf);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Run the active policy over the buffer; a delivery clears the
    /// policy and trims the consumed prefix.
    fn evaluate(&mut self) -> Option<Vec<u8>> {
        let out = {
            let active = self.active.as_mut()?;
            eval_policy(&active.policy, &mut active.cursor, &mut self.inbound, self.eof)
        };
        if out.is_some() {
            self.active = None;
        }
        out
    }

    /// Flush the outbound queue through `sender`. Split out from
    /// [`IoEngine::on_writable`] so the back-pressure behavior is
    /// testable against an arbitrary sink.
    fn flush_with<F>(&mut self, sender: &mut F) -> io::Result<usize>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        let mut flushed = 0;
        while let Some(head) = self.outbound.front_mut() {
            let n = send_slice(sender, head)?;
            flushed += n;
            if n == head.len() {
                self.outbound.pop_front();
            } else {
                // Partial acceptance: trim the sent prefix and keep the
                // head as the only partially-sent item.
                head.drain(..n);
                break;
            }
        }
        Ok(flushed)
    }
}

/// Push as much of `bytes` as the sink accepts, stopping cleanly at
/// back-pressure. Returns the accepted prefix length.
fn send_slice<F>(sender: &mut F, bytes: &[u8]) -> io::Result<usize>
where
    F: FnMut(&[u8]) -> io::Result<usize>,
{
    let mut sent = 0;
    while sent < bytes.len() {
        match sender(&bytes[sent..]) {
            Ok(0) => break,
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(sent)
}

fn eval_policy(
    policy: &ReadPolicy,
    cursor: &mut usize,
    inbound: &mut Vec<u8>,
    eof: bool,
) -> Option<Vec<u8>> {
    match policy {
        ReadPolicy::AtMost(cap) => {
            if inbound.is_empty() {
                None
            } else if inbound.len() <= *cap {
                Some(std::mem::take(inbound))
            } else {
                let rest = inbound.split_off(*cap);
                Some(std::mem::replace(inbound, rest))
            }
        }
        ReadPolicy::All => {
            if inbound.is_empty() {
                None
            } else {
                Some(std::mem::take(inbound))
            }
        }
        ReadPolicy::Exact(n) => {
            if inbound.len() >= *n {
                let rest = inbound.split_off(*n);
                Some(std::mem::replace(inbound, rest))
            } else {
                None
            }
        }
        ReadPolicy::Line => {
            match inbound[*cursor..].iter().position(|&b| b == b'\n') {
                Some(rel) => {
                    let at = *cursor + rel;
                    let mut line = inbound[..at].to_vec();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    inbound.drain(..=at);
                    *cursor = 0;
                    Some(line)
                }
                None => {
                    // Everything so far is delimiter-free; never rescan.
                    *cursor = inbound.len();
                    if eof && !inbound.is_empty() {
                        *cursor = 0;
                        Some(std::mem::take(inbound))
                    } else {
                        None
                    }
                }
            }
        }
        ReadPolicy::Until(delim) => {
            if delim.is_empty() {
                return Some(Vec::new());
            }
            let dlen = delim.len();
            if inbound.len() >= dlen {
                let last_start = inbound.len() - dlen;
                let mut at = None;
                let mut i = *cursor;
                while i <= last_start {
                    if inbound[i..i + dlen] == delim[..] {
                        at = Some(i);
                        break;
                    }
                    i += 1;
                }
                match at {
                    Some(i) => {
                        let out = inbound[..i].to_vec();
                        inbound.drain(..i + dlen);
                        *cursor = 0;
                        return Some(out);
                    }
                    None => {
                        // Offsets below this were proven not to start a
                        // match; rescan stays bounded by the delimiter
                        // length.
                        *cursor = last_start + 1;
                    }
                }
            }
            None
        }
    }
}
