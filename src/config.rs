//! Network configuration and performance tuning
//!
//! [`NetConfig`] collects the socket and event-loop knobs the rest of the
//! crate applies: TCP latency options, buffer sizes, dual-stack behavior,
//! listen backlog, and the reactor's wait batch size and default timeout.
//! All parameters are optional where the kernel has a sensible default;
//! platform-specific options are silently skipped on unsupported targets.
//!
//! # Examples
//!
//! ```rust
//! use zenith_sockets::NetConfig;
//!
//! // Latency-sensitive request/response service
//! let cfg = NetConfig {
//!     tcp_nodelay: true,
//!     recv_buf: Some(256 * 1024),
//!     send_buf: Some(256 * 1024),
//!     poll_timeout: 0.001,
//!     ..Default::default()
//! };
//! ```

use crate::raw;
use std::io;

/// Socket and event-loop tuning parameters.
///
/// Different combinations suit different workloads:
///
/// - **Low latency**: small buffers, TCP_NODELAY, short poll timeout
/// - **High throughput**: large buffers, SO_REUSEPORT, longer timeout
#[derive(Clone, Debug, PartialEq)]
pub struct NetConfig {
    /// Enable TCP_NODELAY to disable Nagle's algorithm.
    ///
    /// When `true`, segments are sent immediately rather than being
    /// coalesced. Essential for request/response latency.
    ///
    /// **Default**: `true`
    pub tcp_nodelay: bool,

    /// Enable TCP_QUICKACK for faster ACK responses (Linux only).
    ///
    /// **Default**: `true`
    pub tcp_quickack: bool,

    /// Enable SO_REUSEPORT so multiple listeners can share a port
    /// (Linux/BSD).
    ///
    /// **Default**: `false`
    pub reuse_port: bool,

    /// Socket receive buffer size in bytes, or `None` for the kernel
    /// default. Larger buffers favor throughput over latency.
    ///
    /// **Default**: `Some(1 MiB)`
    pub recv_buf: Option<usize>,

    /// Socket send buffer size in bytes, or `None` for the kernel default.
    ///
    /// **Default**: `Some(1 MiB)`
    pub send_buf: Option<usize>,

    /// IPv6-only socket configuration.
    ///
    /// - `Some(true)`: IPv6 only, reject IPv4
    /// - `Some(false)`: dual-stack
    /// - `None`: system default
    ///
    /// **Default**: `Some(false)` (dual-stack)
    pub ipv6_only: Option<bool>,

    /// TCP listen backlog size.
    ///
    /// **Default**: `Some(1024)`
    pub tcp_backlog: Option<i32>,

    /// Maximum readiness events fetched per backend wait.
    ///
    /// **Default**: `1024`
    pub max_events: usize,

    /// Default timeout in seconds for driving loops that poll repeatedly
    /// (negative blocks forever, zero polls without blocking).
    ///
    /// **Default**: `0.01`
    pub poll_timeout: f64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_quickack: true,
            reuse_port: false,
            recv_buf: Some(1 << 20), // 1 MiB
            send_buf: Some(1 << 20),
            ipv6_only: Some(false),
            tcp_backlog: Some(1024),
            max_events: 1024,
            poll_timeout: 0.01,
        }
    }
}

impl NetConfig {
    /// Configuration optimized for request/response latency.
    ///
    /// Small socket buffers keep queuing delay down, all TCP latency
    /// options are on, and the poll timeout is aggressive. Trades peak
    /// throughput and some CPU for responsiveness.
    pub fn low_latency() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_quickack: true,
            reuse_port: false,
            recv_buf: Some(256 * 1024),
            send_buf: Some(256 * 1024),
            ipv6_only: Some(false),
            tcp_backlog: Some(512),
            max_events: 256,
            poll_timeout: 0.001,
        }
    }

    /// Configuration optimized for bulk transfer throughput.
    ///
    /// Large socket buffers, Nagle left on so small writes coalesce,
    /// SO_REUSEPORT for multi-listener scaling, and a relaxed poll
    /// timeout.
    pub fn high_throughput() -> Self {
        Self {
            tcp_nodelay: false,
            tcp_quickack: false,
            reuse_port: true,
            recv_buf: Some(8 << 20), // 8 MiB
            send_buf: Some(8 << 20),
            ipv6_only: Some(false),
            tcp_backlog: Some(2048),
            max_events: 4096,
            poll_timeout: 0.05,
        }
    }
}

/// Apply the socket-level options from `cfg` to a raw TCP socket.
///
/// Must be called before the descriptor is handed to a std wrapper or
/// registered with a reactor. Options the platform does not support are
/// skipped rather than reported as errors.
pub fn apply_socket_options(
    os: raw::OsSocket,
    domain: raw::Domain,
    cfg: &NetConfig,
) -> io::Result<()> {
    if let Some(sz) = cfg.recv_buf {
        raw::set_recv_buffer(os, sz as i32)?;
    }
    if let Some(sz) = cfg.send_buf {
        raw::set_send_buffer(os, sz as i32)?;
    }

    if let raw::Domain::Ipv6 = domain {
        if let Some(only) = cfg.ipv6_only {
            raw::set_ipv6_only(os, only)?;
        }
    }

    if cfg.reuse_port {
        raw::set_reuse_port(os, true)?;
    }
    if cfg.tcp_quickack {
        // Best-effort; only Linux honors it.
        let _ = raw::set_tcp_quickack(os, true);
    }
    if cfg.tcp_nodelay {
        raw::set_tcp_nodelay(os, true)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = NetConfig::default();
        assert!(cfg.tcp_nodelay);
        assert_eq!(cfg.recv_buf, Some(1 << 20));
        assert_eq!(cfg.ipv6_only, Some(false));
        assert_eq!(cfg.max_events, 1024);
    }

    #[test]
    fn low_latency_config() {
        let cfg = NetConfig::low_latency();
        assert!(cfg.tcp_nodelay);
        assert_eq!(cfg.recv_buf, Some(256 * 1024));
        assert!(cfg.poll_timeout < 0.01);
    }

    #[test]
    fn high_throughput_config() {
        let cfg = NetConfig::high_throughput();
        assert!(!cfg.tcp_nodelay); // Nagle left on for coalescing
        assert_eq!(cfg.recv_buf, Some(8 << 20));
        assert!(cfg.reuse_port);
    }

    #[test]
    fn options_apply_to_live_socket() -> anyhow::Result<()> {
        let os = raw::socket_stream(raw::Domain::Ipv4)?;
        apply_socket_options(os, raw::Domain::Ipv4, &NetConfig::default())?;
        raw::close(os);
        Ok(())
    }
}
