//! Readiness vocabulary shared by the backends, the reactor and the
//! connection layer: what a registration asks for ([`Interest`]), how it
//! is armed ([`RegisterFlags`]), and what the kernel reported
//! ([`EventKind`] inside an [`Event`]).
//!
//! All three are thin bitmasks. A descriptor never receives more than one
//! [`Event`] per poll cycle: backends that report read- and
//! write-readiness separately (kqueue) have their per-descriptor events
//! merged before dispatch.

use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;

/// What a registration wants to be told about.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    /// Readiness for reading (also required to observe peer close on the
    /// kqueue and poll backends).
    pub const READ: Interest = Interest(0b01);
    /// Readiness for writing.
    pub const WRITE: Interest = Interest(0b10);

    /// An interest asking for nothing; rejected by `Reactor::set`.
    pub const fn empty() -> Interest {
        Interest(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

impl BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// How a registration is armed.
///
/// `EDGE` requests one notification per readiness transition instead of
/// one per poll while the condition holds. The poll(2) backend is
/// level-triggered only and accepts but ignores it. `ONCE` deregisters
/// the descriptor automatically after the first delivered event.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterFlags(u8);

impl RegisterFlags {
    pub const EDGE: RegisterFlags = RegisterFlags(0b01);
    pub const ONCE: RegisterFlags = RegisterFlags(0b10);

    pub const fn empty() -> RegisterFlags {
        RegisterFlags(0)
    }

    pub const fn is_edge(self) -> bool {
        self.0 & Self::EDGE.0 != 0
    }

    pub const fn is_once(self) -> bool {
        self.0 & Self::ONCE.0 != 0
    }
}

impl BitOr for RegisterFlags {
    type Output = RegisterFlags;
    fn bitor(self, rhs: RegisterFlags) -> RegisterFlags {
        RegisterFlags(self.0 | rhs.0)
    }
}

/// What the kernel reported for a descriptor in one poll cycle.
///
/// `CLOSED` is terminal: once a dispatched event carries it, the reactor
/// has already dropped the registration and nothing further is delivered
/// for that descriptor.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct EventKind(u8);

impl EventKind {
    pub const READABLE: EventKind = EventKind(0b001);
    pub const WRITABLE: EventKind = EventKind(0b010);
    pub const CLOSED: EventKind = EventKind(0b100);

    pub const fn empty() -> EventKind {
        EventKind(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub const fn is_closed(self) -> bool {
        self.0 & Self::CLOSED.0 != 0
    }
}

impl BitOr for EventKind {
    type Output = EventKind;
    fn bitor(self, rhs: EventKind) -> EventKind {
        EventKind(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventKind {
    fn bitor_assign(&mut self, rhs: EventKind) {
        self.0 |= rhs.0;
    }
}

/// One readiness notification: descriptor plus merged kinds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub kind: EventKind,
}

impl Event {
    pub const fn new(fd: RawFd, kind: EventKind) -> Event {
        Event { fd, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_combinations() {
        let both = Interest::READ | Interest::WRITE;
        assert!(both.is_readable());
        assert!(both.is_writable());
        assert!(!Interest::READ.is_writable());
        assert!(Interest::empty().is_empty());
        assert!(!both.is_empty());
    }

    #[test]
    fn flags_combinations() {
        let f = RegisterFlags::EDGE | RegisterFlags::ONCE;
        assert!(f.is_edge());
        assert!(f.is_once());
        assert!(!RegisterFlags::empty().is_once());
        assert_eq!(RegisterFlags::default(), RegisterFlags::empty());
    }

    #[test]
    fn event_kind_merge() {
        let mut k = EventKind::READABLE;
        k |= EventKind::WRITABLE;
        assert!(k.is_readable());
        assert!(k.is_writable());
        assert!(!k.is_closed());
        k |= EventKind::CLOSED;
        assert!(k.is_closed());
    }
}
