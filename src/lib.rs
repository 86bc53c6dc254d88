#![deny(unsafe_op_in_unsafe_fn)]

//! Event-driven socket toolkit built directly on the OS readiness
//! facilities: epoll on Linux, kqueue on the BSD family, and a `poll(2)`
//! fallback everywhere else on Unix.
//!
//! The crate has three layers:
//!
//! - [`poller`]: one backend adapter per OS facility behind a closed enum,
//!   each with a cross-thread wakeup primitive.
//! - [`reactor`]: a registration table of descriptor → callback driven by
//!   one backend, with `run`/`poll`/`stop`.
//! - [`engine`] + [`tcp`]: a buffered non-blocking connection state
//!   machine with pluggable read policies, and the TCP listener/stream/
//!   server/client plumbing that wires it to the reactor.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod buffer_pool;
        pub mod config;
        pub mod engine;
        pub mod event;
        pub mod poller;
        pub mod raw; // OS-level socket helpers
        pub mod reactor;
        pub mod tcp;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        mod sys_epoll;
        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly"
        ))]
        mod sys_kqueue;
        mod sys_poll;
    } else {
        compile_error!("zenith_sockets only supports Unix targets (epoll, kqueue or poll)");
    }
}

/// Convenience re-exports
pub use config::{apply_socket_options, NetConfig};
pub use engine::{ConnState, IoEngine, ReadPolicy};
pub use event::{Event, EventKind, Interest, RegisterFlags};
pub use poller::{Poller, Wait};
pub use reactor::{PollOutcome, Reactor};
pub use tcp::{connect, Connection, Handlers, TcpListener, TcpServer, TcpStream};
