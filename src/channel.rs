use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};

use mio::{Interest, Token};

use crate::event::PollEvent;

/// Callback invoked on the loop thread when a readiness condition fires.
pub type EventCallback = Box<dyn Fn() + Send + Sync + 'static>;

const INTEREST_READ: u8 = 0b01;
const INTEREST_WRITE: u8 = 0b10;

fn interest_to_bits(interest: Option<Interest>) -> u8 {
    match interest {
        None => 0,
        Some(i) => {
            let mut bits = 0;
            if i.is_readable() {
                bits |= INTEREST_READ;
            }
            if i.is_writable() {
                bits |= INTEREST_WRITE;
            }
            bits
        }
    }
}

fn bits_to_interest(bits: u8) -> Option<Interest> {
    match bits & (INTEREST_READ | INTEREST_WRITE) {
        INTEREST_READ => Some(Interest::READABLE),
        INTEREST_WRITE => Some(Interest::WRITABLE),
        0b11 => Some(Interest::READABLE | Interest::WRITABLE),
        _ => None,
    }
}

/// Binds one descriptor to an interest mask and up to four callbacks
/// (readable, writable, error, close).
///
/// A channel belongs to exactly one loop. It is built by the owning
/// subsystem, handed to [`EventLoop::update_channel`], and from then on
/// mutated only from the loop thread.
///
/// [`EventLoop::update_channel`]: crate::EventLoop::update_channel
pub struct Channel {
    token: Token,
    fd: RawFd,
    interest: Option<Interest>,
    read_callback: Option<EventCallback>,
    write_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("token", &self.token)
            .field("fd", &self.fd)
            .field("interest", &self.interest)
            .finish()
    }
}

impl Channel {
    pub fn new(token: Token, fd: RawFd) -> Self {
        Channel {
            token,
            fd,
            interest: None,
            read_callback: None,
            write_callback: None,
            error_callback: None,
            close_callback: None,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Option<Interest> {
        self.interest
    }

    pub fn set_read_callback<F>(&mut self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.read_callback = Some(Box::new(f));
    }

    pub fn set_write_callback<F>(&mut self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.write_callback = Some(Box::new(f));
    }

    pub fn set_error_callback<F>(&mut self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.error_callback = Some(Box::new(f));
    }

    pub fn set_close_callback<F>(&mut self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.close_callback = Some(Box::new(f));
    }

    pub fn enable_reading(&mut self) {
        self.interest = Some(match self.interest {
            Some(i) => i | Interest::READABLE,
            None => Interest::READABLE,
        });
    }

    pub fn enable_writing(&mut self) {
        self.interest = Some(match self.interest {
            Some(i) => i | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }

    pub fn disable_all(&mut self) {
        self.interest = None;
    }
}

/// A registered channel as the dispatcher sees it. Interest lives in an
/// atomic so the loop thread can retune it while the registry entry stays
/// shared.
pub(crate) struct ChannelEntry {
    token: Token,
    fd: RawFd,
    interest: AtomicU8,
    read_callback: Option<EventCallback>,
    write_callback: Option<EventCallback>,
    error_callback: Option<EventCallback>,
    close_callback: Option<EventCallback>,
}

impl ChannelEntry {
    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn interest(&self) -> Option<Interest> {
        bits_to_interest(self.interest.load(Ordering::Acquire))
    }

    pub(crate) fn set_interest(&self, interest: Option<Interest>) {
        self.interest
            .store(interest_to_bits(interest), Ordering::Release);
    }

    /// Dispatches one readiness event to the matching callbacks.
    ///
    /// Hang-up without pending data maps to the close callback; errors go
    /// to the error callback; read and write conditions are gated by the
    /// current interest mask.
    pub(crate) fn handle_event(&self, event: &PollEvent) {
        if event.is_read_closed() && !event.is_readable() {
            if let Some(cb) = &self.close_callback {
                cb();
            }
            return;
        }
        if event.is_error() {
            if let Some(cb) = &self.error_callback {
                cb();
            }
        }
        let interest = self.interest();
        let readable = interest.map(|i| i.is_readable()).unwrap_or(false);
        let writable = interest.map(|i| i.is_writable()).unwrap_or(false);
        if (event.is_readable() || event.is_priority()) && readable {
            if let Some(cb) = &self.read_callback {
                cb();
            }
        }
        if event.is_writable() && writable {
            if let Some(cb) = &self.write_callback {
                cb();
            }
        }
    }
}

impl From<Channel> for ChannelEntry {
    fn from(ch: Channel) -> Self {
        ChannelEntry {
            token: ch.token,
            fd: ch.fd,
            interest: AtomicU8::new(interest_to_bits(ch.interest)),
            read_callback: ch.read_callback,
            write_callback: ch.write_callback,
            error_callback: ch.error_callback,
            close_callback: ch.close_callback,
        }
    }
}
