//! TCP sockets and the event-driven connection layer
//!
//! Two halves live here. [`TcpListener`] and [`TcpStream`] are thin
//! wrappers over the standard library types, built through [`crate::raw`]
//! so the socket options from [`NetConfig`] are applied before the
//! descriptor is ever used; both are non-blocking from birth.
//!
//! On top of them, [`Connection`] wires an [`IoEngine`] to a
//! [`Reactor`]: readiness notifications drive the engine, and results
//! surface through the owner's [`Handlers`]. [`TcpServer`] accepts
//! connections into a slab roster; [`connect`] performs the non-blocking
//! client handshake (register for write-readiness, confirm via
//! `SO_ERROR`, then flush anything queued while connecting).
//!
//! # Error and completion reporting
//!
//! Caller-initiated operations report synchronously through their return
//! value: [`Connection::read`] hands back an immediately decodable chunk,
//! [`Connection::write`] the number of bytes the socket accepted in that
//! call. Reactor-driven progress reports through the handlers:
//! `on_data` for decoded chunks, `on_sent` for later queue flushes,
//! `on_close` exactly once when the connection ends — with the error, if
//! one caused it. Connection I/O errors never propagate through the
//! reactor's dispatch loop.

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};
use slab::Slab;

use crate::config::{apply_socket_options, NetConfig};
use crate::engine::{ConnState, IoEngine, ReadPolicy};
use crate::event::{EventKind, Interest, RegisterFlags};
use crate::raw;
use crate::reactor::Reactor;

/// Non-blocking TCP listener with the crate's socket tuning applied.
///
/// Accept readiness is meant to be observed through a [`Reactor`]
/// registration on [`TcpListener::fd`]; [`TcpServer`] does exactly that.
#[derive(Debug)]
pub struct TcpListener {
    inner: StdTcpListener,
}

impl TcpListener {
    /// Bind to `addr` with the options from `cfg` applied before the
    /// socket enters the listen state.
    pub fn bind(addr: SocketAddr, cfg: &NetConfig) -> io::Result<TcpListener> {
        let (domain, sa, len) = raw::to_sockaddr(addr);
        let os = raw::socket_stream(domain)?;
        raw::set_nonblocking(os, true)?;
        raw::set_reuse_addr(os, true)?;
        apply_socket_options(os, domain, cfg)?;
        unsafe {
            raw::bind_raw(os, &sa, len)?;
        }
        raw::listen_raw(os, cfg.tcp_backlog.unwrap_or(1024))?;
        Ok(TcpListener {
            inner: unsafe { raw::tcp_listener_from_os(os) },
        })
    }

    /// Accept one pending connection.
    ///
    /// Returns `WouldBlock` when the queue is empty; the accepted stream
    /// comes back non-blocking with `TCP_NODELAY` set.
    pub fn accept_nonblocking(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (s, a) = self.inner.accept()?;
        s.set_nonblocking(true)?;
        s.set_nodelay(true)?;
        Ok((TcpStream { inner: s }, a))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// Access to the underlying standard library listener.
    pub fn as_std(&self) -> &StdTcpListener {
        &self.inner
    }
}

/// Non-blocking TCP stream with the crate's socket tuning applied.
#[derive(Debug)]
pub struct TcpStream {
    inner: StdTcpStream,
}

impl TcpStream {
    /// Start a non-blocking connect to `addr`.
    ///
    /// The second return value is `true` when the handshake completed
    /// immediately (common on loopback); `false` means it is in flight
    /// and completion arrives as write-readiness on [`TcpStream::fd`].
    pub fn connect_nonblocking(addr: SocketAddr, cfg: &NetConfig) -> io::Result<(TcpStream, bool)> {
        let (domain, sa, len) = raw::to_sockaddr(addr);
        let os = raw::socket_stream(domain)?;
        raw::set_nonblocking(os, true)?;
        apply_socket_options(os, domain, cfg)?;
        let connected = raw::connect_raw(os, &sa, len)?;
        Ok((
            TcpStream {
                inner: unsafe { raw::tcp_stream_from_os(os) },
            },
            connected,
        ))
    }

    /// Adopt an existing stream, switching it to non-blocking mode and
    /// applying the latency options from `cfg`.
    pub fn from_std(s: StdTcpStream, cfg: &NetConfig) -> io::Result<TcpStream> {
        s.set_nonblocking(true)?;
        s.set_nodelay(cfg.tcp_nodelay)?;
        Ok(TcpStream { inner: s })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Access to the underlying standard library stream.
    pub fn as_std(&self) -> &StdTcpStream {
        &self.inner
    }
}

/// Event handlers for one [`Connection`]. Every callback receives the
/// connection itself, so re-arming a read or writing a reply needs no
/// extra locking.
pub struct Handlers {
    /// Connect handshake completed (client side).
    pub on_connect: Box<dyn FnMut(&mut Connection) + Send>,
    /// A read policy produced a chunk.
    pub on_data: Box<dyn FnMut(&mut Connection, Vec<u8>) + Send>,
    /// Queued bytes were flushed; the count is this flush only.
    pub on_sent: Box<dyn FnMut(&mut Connection, usize) + Send>,
    /// Terminal signal, raised exactly once. `Some` carries the I/O
    /// error that ended the connection; `None` is an orderly peer close.
    pub on_close: Box<dyn FnMut(&mut Connection, Option<io::Error>) + Send>,
}

impl Handlers {
    /// All handlers default to doing nothing.
    pub fn new() -> Handlers {
        Handlers {
            on_connect: Box::new(|_| {}),
            on_data: Box::new(|_, _| {}),
            on_sent: Box::new(|_, _| {}),
            on_close: Box::new(|_, _| {}),
        }
    }
}

impl Default for Handlers {
    fn default() -> Handlers {
        Handlers::new()
    }
}

/// One established (or connecting) TCP connection driven by a reactor.
///
/// Owns the stream and its [`IoEngine`]; lives behind `Arc<Mutex<..>>` so
/// the reactor callback and the application can both reach it. Interest
/// is re-armed automatically: write interest exists only while the
/// connect is in flight or queued writes are waiting.
pub struct Connection {
    stream: TcpStream,
    engine: IoEngine,
    reactor: Arc<Reactor>,
    handlers: Option<Handlers>,
    self_ref: Weak<Mutex<Connection>>,
    interest: Interest,
    closed: bool,
}

impl Connection {
    fn new(stream: TcpStream, state: ConnState, reactor: Arc<Reactor>) -> Connection {
        let fd = stream.fd();
        Connection {
            stream,
            engine: IoEngine::new(fd, state),
            reactor,
            handlers: Some(Handlers::new()),
            self_ref: Weak::new(),
            interest: Interest::empty(),
            closed: false,
        }
    }

    /// Register `conn` with its reactor. Registration failures propagate
    /// to the caller and are never retried.
    fn attach(conn: &Arc<Mutex<Connection>>) -> io::Result<()> {
        let mut c = conn.lock().unwrap();
        c.self_ref = Arc::downgrade(conn);
        let desired = c.desired_interest();
        let fd = c.engine.fd();
        let strong = Arc::clone(conn);
        c.reactor
            .set(fd, desired, RegisterFlags::empty(), move |kind| {
                strong.lock().unwrap().handle_event(kind);
            })?;
        c.interest = desired;
        Ok(())
    }

    /// Replace the handler set.
    pub fn set_handlers(&mut self, handlers: Handlers) {
        self.handlers = Some(handlers);
    }

    pub fn state(&self) -> ConnState {
        self.engine.state()
    }

    pub fn fd(&self) -> RawFd {
        self.engine.fd()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Install a read policy. A chunk the buffer can already satisfy is
    /// returned directly; otherwise the policy stays armed and later
    /// chunks arrive through `on_data`. I/O failures are routed to
    /// `on_close`, not returned.
    pub fn read(&mut self, policy: ReadPolicy) -> Option<Vec<u8>> {
        match self.engine.read(policy) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.fail(e);
                None
            }
        }
    }

    /// Send `bytes`, returning how many this call flushed. Anything not
    /// accepted is queued and reported through `on_sent` as the queue
    /// drains. I/O failures are routed to `on_close`, not returned.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        match self.engine.write(bytes) {
            Ok(n) => {
                self.rearm();
                n
            }
            Err(e) => {
                self.fail(e);
                0
            }
        }
    }

    /// Locally initiated teardown: deregister, shut the socket down and
    /// go terminal silently — no `on_close` is raised, the caller already
    /// knows.
    pub fn close(&mut self) {
        if self.engine.state() == ConnState::Disconnected {
            return;
        }
        let fd = self.engine.fd();
        if let Err(e) = self.reactor.del(fd) {
            warn!("fd={fd} deregister on close failed: {e}");
        }
        let _ = raw::shutdown_both(fd);
        self.closed = true;
        let _ = self.engine.finish();
    }

    fn desired_interest(&self) -> Interest {
        if self.engine.state() == ConnState::Connecting || self.engine.has_queued_writes() {
            Interest::READ | Interest::WRITE
        } else {
            // READ also keeps peer-close visible on the kqueue and poll
            // backends.
            Interest::READ
        }
    }

    /// Re-register when the wanted interest changed (queue filled or
    /// drained, connect completed).
    fn rearm(&mut self) {
        if self.closed || self.engine.state() == ConnState::Disconnected {
            return;
        }
        let desired = self.desired_interest();
        if desired == self.interest {
            return;
        }
        let Some(strong) = self.self_ref.upgrade() else {
            return;
        };
        let fd = self.engine.fd();
        match self
            .reactor
            .set(fd, desired, RegisterFlags::empty(), move |kind| {
                strong.lock().unwrap().handle_event(kind);
            }) {
            Ok(()) => self.interest = desired,
            Err(e) => warn!("fd={fd} rearm failed: {e}"),
        }
    }

    fn handle_event(&mut self, kind: EventKind) {
        if self.closed || self.engine.state() == ConnState::Disconnected {
            return;
        }
        if kind.is_writable() {
            if self.engine.state() == ConnState::Connecting {
                self.complete_connect();
            } else {
                self.drive_flush();
            }
            if self.closed {
                return;
            }
        }
        if kind.is_readable() && !kind.is_closed() {
            self.drive_read();
            if self.closed {
                return;
            }
        }
        if kind.is_closed() {
            self.handle_closed();
            return;
        }
        self.rearm();
    }

    fn complete_connect(&mut self) {
        let fd = self.engine.fd();
        match raw::take_socket_error(fd) {
            Ok(None) => {
                debug!("fd={fd} connect completed");
                self.engine.mark_connected();
                self.emit_connect();
                if !self.closed {
                    self.drive_flush();
                }
            }
            Ok(Some(err)) | Err(err) => self.fail(err),
        }
    }

    fn drive_read(&mut self) {
        loop {
            match self.engine.on_readable() {
                Ok(Some(chunk)) => {
                    self.emit_data(chunk);
                    if self.closed {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }
        // A FIN can surface as a zero-length recv with no CLOSED event
        // (poll(2) reports a half-closed socket as merely readable).
        if self.engine.is_eof() {
            self.finish_stream();
        }
    }

    fn drive_flush(&mut self) {
        match self.engine.on_writable() {
            Ok(0) => {}
            Ok(n) => self.emit_sent(n),
            Err(e) => self.fail(e),
        }
    }

    /// Peer closed. The reactor already dropped the registration; drain
    /// what raced the FIN, deliver it, then raise the single terminal
    /// signal.
    fn handle_closed(&mut self) {
        self.interest = Interest::empty();
        if self.engine.state() == ConnState::Connecting {
            // Hangup before the handshake finished is a failed connect,
            // not an orderly close.
            let err = raw::take_socket_error(self.engine.fd())
                .ok()
                .flatten()
                .unwrap_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "connection closed during handshake",
                    )
                });
            let _ = self.engine.finish();
            self.emit_close(Some(err));
            return;
        }
        loop {
            match self.engine.on_readable() {
                Ok(Some(chunk)) => {
                    self.emit_data(chunk);
                    if self.closed {
                        return;
                    }
                }
                Ok(None) => break,
                // The stream is ending either way; stop draining.
                Err(_) => break,
            }
        }
        self.finish_stream();
    }

    /// Deliver the final drain-and-evaluate result, then raise the single
    /// terminal signal.
    fn finish_stream(&mut self) {
        let _ = self.reactor.del(self.engine.fd());
        self.interest = Interest::empty();
        if let Some(chunk) = self.engine.on_ended() {
            self.emit_data(chunk);
            if self.closed {
                return;
            }
        }
        self.emit_close(None);
    }

    /// Contain an I/O error at the connection boundary: deregister,
    /// deliver anything already decodable, then signal once.
    fn fail(&mut self, err: io::Error) {
        if self.closed {
            return;
        }
        let fd = self.engine.fd();
        let _ = self.reactor.del(fd);
        self.interest = Interest::empty();
        if let Some(chunk) = self.engine.finish() {
            self.emit_data(chunk);
        }
        self.emit_close(Some(err));
    }

    fn emit_connect(&mut self) {
        if let Some(mut hs) = self.handlers.take() {
            (hs.on_connect)(self);
            if self.handlers.is_none() {
                self.handlers = Some(hs);
            }
        }
    }

    fn emit_data(&mut self, chunk: Vec<u8>) {
        if let Some(mut hs) = self.handlers.take() {
            (hs.on_data)(self, chunk);
            if self.handlers.is_none() {
                self.handlers = Some(hs);
            }
        }
    }

    fn emit_sent(&mut self, n: usize) {
        if let Some(mut hs) = self.handlers.take() {
            (hs.on_sent)(self, n);
            if self.handlers.is_none() {
                self.handlers = Some(hs);
            }
        }
    }

    fn emit_close(&mut self, err: Option<io::Error>) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(mut hs) = self.handlers.take() {
            (hs.on_close)(self, err);
            if self.handlers.is_none() {
                self.handlers = Some(hs);
            }
        }
    }
}

/// Accepting side: a listener registered with a reactor, plus a slab
/// roster of the live connections it produced.
pub struct TcpServer {
    listener: Arc<TcpListener>,
    reactor: Arc<Reactor>,
    conns: Arc<Mutex<Slab<Arc<Mutex<Connection>>>>>,
}

impl TcpServer {
    /// Bind `addr` and prepare to serve through `reactor`. Call
    /// [`TcpServer::start`] to begin accepting; drive the reactor with
    /// `run`/`poll` as usual.
    pub fn bind(addr: SocketAddr, cfg: &NetConfig, reactor: Arc<Reactor>) -> io::Result<TcpServer> {
        let listener = TcpListener::bind(addr, cfg)?;
        Ok(TcpServer {
            listener: Arc::new(listener),
            reactor,
            conns: Arc::new(Mutex::new(Slab::new())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of connections currently in the roster.
    pub fn connection_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    /// Register the listener and start accepting. `on_accept` runs for
    /// every new connection, before its first event, to install handlers
    /// and arm an initial read.
    pub fn start<F>(&self, mut on_accept: F) -> io::Result<()>
    where
        F: FnMut(&mut Connection) + Send + 'static,
    {
        let listener = Arc::clone(&self.listener);
        let reactor = Arc::clone(&self.reactor);
        let conns = Arc::clone(&self.conns);
        self.reactor.set(
            self.listener.fd(),
            Interest::READ,
            RegisterFlags::empty(),
            move |kind| {
                if !kind.is_readable() {
                    return;
                }
                loop {
                    match listener.accept_nonblocking() {
                        Ok((stream, peer)) => {
                            debug!("accepted connection from {peer}");
                            if let Err(e) =
                                admit(&reactor, &conns, stream, &mut on_accept)
                            {
                                warn!("failed to admit connection from {peer}: {e}");
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            break;
                        }
                    }
                }
            },
        )
    }

    /// Stop accepting: deregister the listener. Existing connections are
    /// untouched.
    pub fn stop_accepting(&self) -> io::Result<()> {
        self.reactor.del(self.listener.fd())
    }
}

/// Wire one accepted stream into the reactor and the roster.
fn admit<F>(
    reactor: &Arc<Reactor>,
    conns: &Arc<Mutex<Slab<Arc<Mutex<Connection>>>>>,
    stream: TcpStream,
    on_accept: &mut F,
) -> io::Result<()>
where
    F: FnMut(&mut Connection) + Send + 'static,
{
    let conn = Arc::new(Mutex::new(Connection::new(
        stream,
        ConnState::Connected,
        Arc::clone(reactor),
    )));
    let key = conns.lock().unwrap().insert(Arc::clone(&conn));
    {
        let mut c = conn.lock().unwrap();
        on_accept(&mut c);
        // Chain roster cleanup onto whatever close handler the
        // application installed.
        if let Some(mut hs) = c.handlers.take() {
            let roster = Arc::clone(conns);
            let mut app_close = std::mem::replace(&mut hs.on_close, Box::new(|_, _| {}));
            hs.on_close = Box::new(move |conn: &mut Connection, err: Option<io::Error>| {
                roster.lock().unwrap().try_remove(key);
                app_close(conn, err);
            });
            c.handlers = Some(hs);
        }
    }
    Connection::attach(&conn)
}

/// Connecting side: start a non-blocking connect to `addr` and hand the
/// connection to `reactor`.
///
/// `on_connect` fires once the handshake completes (immediately, if
/// loopback finished it synchronously); writes issued before that are
/// queued and flushed on completion. Handshake failure arrives as
/// `on_close(Some(err))`.
pub fn connect(
    addr: SocketAddr,
    cfg: &NetConfig,
    reactor: &Arc<Reactor>,
    handlers: Handlers,
) -> io::Result<Arc<Mutex<Connection>>> {
    let (stream, connected) = TcpStream::connect_nonblocking(addr, cfg)?;
    let state = if connected {
        ConnState::Connected
    } else {
        ConnState::Connecting
    };
    let conn = Arc::new(Mutex::new(Connection::new(
        stream,
        state,
        Arc::clone(reactor),
    )));
    conn.lock().unwrap().handlers = Some(handlers);
    Connection::attach(&conn)?;
    if connected {
        conn.lock().unwrap().emit_connect();
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::PollOutcome;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn pump(reactor: &Reactor, until: impl Fn() -> bool) {
        let start = Instant::now();
        while !until() && start.elapsed() < Duration::from_secs(10) {
            match reactor.poll(0.02) {
                Ok(PollOutcome::Dispatched(_))
                | Ok(PollOutcome::TimedOut)
                | Ok(PollOutcome::Interrupted) => {}
                Ok(PollOutcome::Cancelled) => break,
                Err(e) => panic!("poll failed: {e}"),
            }
        }
        assert!(until(), "condition not reached within deadline");
    }

    #[test]
    fn listener_accept_would_block_when_idle() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0".parse()?, &NetConfig::default())?;
        let err = listener.accept_nonblocking().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        Ok(())
    }

    #[test]
    fn server_reassembles_split_line_and_echoes() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let server = TcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            &NetConfig::default(),
            Arc::clone(&reactor),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();

        fn echo(conn: &mut Connection, line: Vec<u8>) {
            let mut reply = line;
            reply.push(b'\n');
            conn.write(&reply);
            // A further line may already be buffered; echo it too.
            while let Some(next) = conn.read(ReadPolicy::Line) {
                let mut reply = next;
                reply.push(b'\n');
                conn.write(&reply);
            }
        }

        server
            .start(|conn| {
                let mut handlers = Handlers::new();
                handlers.on_data = Box::new(echo);
                conn.set_handlers(handlers);
                if let Some(line) = conn.read(ReadPolicy::Line) {
                    echo(conn, line);
                }
            })
            .unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        let client = std::thread::spawn(move || {
            let mut s = StdTcpStream::connect(addr).unwrap();
            s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            // The line arrives in two chunks; the server must merge them
            // before delimiter detection.
            s.write_all(b"he").unwrap();
            std::thread::sleep(Duration::from_millis(30));
            s.write_all(b"llo\n").unwrap();

            let mut echoed = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                s.read_exact(&mut byte).unwrap();
                if byte[0] == b'\n' {
                    break;
                }
                echoed.push(byte[0]);
            }
            assert_eq!(echoed, b"hello");
            done2.store(true, Ordering::SeqCst);
        });

        pump(&reactor, || done.load(Ordering::SeqCst));
        client.join().unwrap();
    }

    #[test]
    fn client_reads_then_observes_single_close() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            s.write_all(b"ready\n").unwrap();
            // Dropping the stream sends the FIN.
        });

        let reactor = Arc::new(Reactor::new().unwrap());
        let lines: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(AtomicUsize::new(0));

        let mut handlers = Handlers::new();
        let lines_connect = Arc::clone(&lines);
        handlers.on_connect = Box::new(move |conn: &mut Connection| {
            // The payload may already be buffered by the time the
            // handshake completes.
            while let Some(chunk) = conn.read(ReadPolicy::Line) {
                lines_connect.lock().unwrap().push(chunk);
            }
        });
        let lines2 = Arc::clone(&lines);
        handlers.on_data = Box::new(move |conn: &mut Connection, chunk: Vec<u8>| {
            lines2.lock().unwrap().push(chunk);
            while let Some(more) = conn.read(ReadPolicy::Line) {
                lines2.lock().unwrap().push(more);
            }
        });
        let closes2 = Arc::clone(&closes);
        handlers.on_close = Box::new(move |_: &mut Connection, err: Option<io::Error>| {
            assert!(err.is_none(), "orderly close must not carry an error");
            closes2.fetch_add(1, Ordering::SeqCst);
        });

        let _conn = connect(addr, &NetConfig::default(), &reactor, handlers).unwrap();
        pump(&reactor, || closes.load(Ordering::SeqCst) == 1);
        peer.join().unwrap();

        assert_eq!(lines.lock().unwrap().as_slice(), &[b"ready".to_vec()]);
        assert_eq!(closes.load(Ordering::SeqCst), 1); // never signalled twice
    }

    #[test]
    fn refused_connect_reports_error_through_close() {
        // Grab a port that nothing listens on.
        let addr = {
            let l = StdTcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };

        let reactor = Arc::new(Reactor::new().unwrap());
        let failed = Arc::new(AtomicUsize::new(0));
        let mut handlers = Handlers::new();
        let failed2 = Arc::clone(&failed);
        handlers.on_close = Box::new(move |_: &mut Connection, err: Option<io::Error>| {
            assert!(err.is_some(), "refused connect must carry its error");
            failed2.fetch_add(1, Ordering::SeqCst);
        });

        match connect(addr, &NetConfig::default(), &reactor, handlers) {
            // Some platforms fail the connect call synchronously.
            Err(_) => {}
            Ok(_conn) => {
                pump(&reactor, || failed.load(Ordering::SeqCst) == 1);
                assert_eq!(failed.load(Ordering::SeqCst), 1);
            }
        }
    }

    #[test]
    fn roster_tracks_connection_lifecycle() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let server = TcpServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            &NetConfig::default(),
            Arc::clone(&reactor),
        )
        .unwrap();
        let addr = server.local_addr().unwrap();
        let closed = Arc::new(AtomicBool::new(false));
        let closed2 = Arc::clone(&closed);

        server
            .start(move |conn| {
                let mut handlers = Handlers::new();
                let flag = Arc::clone(&closed2);
                handlers.on_close = Box::new(move |_: &mut Connection, _| {
                    flag.store(true, Ordering::SeqCst);
                });
                conn.set_handlers(handlers);
                let _ = conn.read(ReadPolicy::All);
            })
            .unwrap();

        let client = StdTcpStream::connect(addr).unwrap();
        pump(&reactor, || server.connection_count() == 1);
        drop(client); // FIN
        pump(&reactor, || closed.load(Ordering::SeqCst));
        pump(&reactor, || server.connection_count() == 0);
    }
}
