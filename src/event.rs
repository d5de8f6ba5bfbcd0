use std::fmt;

use mio::{event::Event, Token};

/// Readiness snapshot for one channel, decoupled from the backend's event
/// type so an active-channel list can outlive the poll call that produced
/// it (within the same loop iteration).
#[derive(Clone, Copy)]
pub struct PollEvent {
    token: Token,
    readable: bool,
    writable: bool,
    error: bool,
    read_closed: bool,
    priority: bool,
}

impl fmt::Debug for PollEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollEvent")
            .field("token", &self.token)
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("error", &self.error)
            .field("read_closed", &self.read_closed)
            .finish()
    }
}

impl PollEvent {
    /// Builds a synthetic readiness event, used when a still-ready channel
    /// is carried over into the next iteration.
    pub(crate) fn synthetic(token: Token, readable: bool, writable: bool) -> Self {
        PollEvent {
            token,
            readable,
            writable,
            error: false,
            read_closed: false,
            priority: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_read_closed(&self) -> bool {
        self.read_closed
    }

    pub fn is_priority(&self) -> bool {
        self.priority
    }
}

impl From<&Event> for PollEvent {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            priority: event.is_priority(),
        }
    }
}
