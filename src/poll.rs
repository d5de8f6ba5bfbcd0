use std::os::unix::io::RawFd;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use lockfree::map::Map;
use log::trace;
use mio::unix::SourceFd;
use mio::{event::Source, Events, Interest, Poll, Token, Waker};

use crate::channel::{Channel, ChannelEntry};
use crate::error::{CoreError, Result};
use crate::event::PollEvent;

/// Token reserved for the loop's internal wake-up channel.
pub const WAKER_TOKEN: Token = Token(0);

/// Readiness multiplexer over a set of registered channels.
///
/// One instance per loop. Everything except [`wake`](Poller::wake) must be
/// called from the loop thread.
pub struct Poller {
    poll: RwLock<Poll>,
    waker: RwLock<Waker>,
    registry: Map<usize, Arc<ChannelEntry>>,
}

impl Poller {
    pub(crate) fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Poller {
            poll: RwLock::new(poll),
            waker: RwLock::new(waker),
            registry: Map::new(),
        })
    }

    /// Adds a channel, or updates the registration of an existing one to
    /// the channel's interest mask.
    pub(crate) fn update_channel(&self, channel: Channel) -> Result<()> {
        let token = channel.token();
        if token == WAKER_TOKEN {
            return Err(CoreError::ReservedToken(token));
        }
        let entry: ChannelEntry = channel.into();
        let previous = self
            .registry
            .get(&token.0)
            .map(|g| (g.val().fd(), g.val().interest()));

        match previous {
            // Token reused for a different descriptor: detach the old one
            // before arming the new.
            Some((old_fd, old_interest)) if old_fd != entry.fd() => {
                if old_interest.is_some() {
                    let poll = self.poll.read()?;
                    let _ = SourceFd(&old_fd).deregister(poll.registry());
                }
                self.rearm(entry.fd(), token, None, entry.interest())?;
            }
            Some((_, old_interest)) => {
                self.rearm(entry.fd(), token, old_interest, entry.interest())?;
            }
            None => {
                self.rearm(entry.fd(), token, None, entry.interest())?;
            }
        }
        self.registry.insert(token.0, Arc::new(entry));
        Ok(())
    }

    /// Retunes the interest mask of a registered channel. Unknown tokens
    /// are ignored.
    pub(crate) fn set_interest(&self, token: Token, interest: Option<Interest>) -> Result<()> {
        if token == WAKER_TOKEN {
            return Err(CoreError::ReservedToken(token));
        }
        let entry = match self.registry.get(&token.0) {
            Some(guard) => Arc::clone(guard.val()),
            None => return Ok(()),
        };
        self.rearm(entry.fd(), token, entry.interest(), interest)?;
        entry.set_interest(interest);
        Ok(())
    }

    /// Detaches a channel. Idempotent; after return no further callbacks
    /// for the token fire.
    pub(crate) fn remove_channel(&self, token: Token) -> Result<()> {
        if token == WAKER_TOKEN {
            return Err(CoreError::ReservedToken(token));
        }
        if let Some(removed) = self.registry.remove(&token.0) {
            let entry = removed.val();
            if entry.interest().is_some() {
                let poll = self.poll.read()?;
                let _ = SourceFd(&entry.fd()).deregister(poll.registry());
            }
        }
        Ok(())
    }

    pub(crate) fn get(&self, token: Token) -> Option<Arc<ChannelEntry>> {
        self.registry.get(&token.0).map(|g| Arc::clone(g.val()))
    }

    /// Blocks for up to `timeout` (`None` = indefinite, zero =
    /// non-blocking) and fills `active` with the readiness snapshots of the
    /// channels that have pending conditions. The wake-up token is drained
    /// internally and never surfaced.
    pub(crate) fn poll(
        &self,
        events: &mut Events,
        timeout: Option<Duration>,
        active: &mut Vec<PollEvent>,
    ) -> Result<usize> {
        {
            let mut poll = self.poll.write()?;
            match poll.poll(events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    trace!("poll interrupted, returning to the loop");
                    return Ok(0);
                }
                Err(e) => return Err(e.into()),
            }
        }
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                trace!("woken up");
                continue;
            }
            active.push(PollEvent::from(event));
        }
        Ok(active.len())
    }

    /// Unblocks a concurrent or future [`poll`](Poller::poll) call. The
    /// only operation callable from any thread.
    pub(crate) fn wake(&self) -> Result<()> {
        self.waker.read()?.wake()?;
        Ok(())
    }

    /// Rebuilds the kernel-side state after a fork: fresh poll instance and
    /// waker, every armed channel re-registered through its stored
    /// descriptor.
    pub(crate) fn reset_after_fork(&self) -> Result<()> {
        let new_poll = Poll::new()?;
        let new_waker = Waker::new(new_poll.registry(), WAKER_TOKEN)?;
        for guard in self.registry.iter() {
            let entry = guard.val();
            if let Some(interest) = entry.interest() {
                SourceFd(&entry.fd()).register(
                    new_poll.registry(),
                    entry.token(),
                    interest,
                )?;
            }
        }
        *self.poll.write()? = new_poll;
        *self.waker.write()? = new_waker;
        Ok(())
    }

    fn rearm(
        &self,
        fd: RawFd,
        token: Token,
        old: Option<Interest>,
        new: Option<Interest>,
    ) -> Result<()> {
        let poll = self.poll.read()?;
        match (old, new) {
            (None, Some(interest)) => {
                SourceFd(&fd).register(poll.registry(), token, interest)?;
            }
            (Some(_), Some(interest)) => {
                SourceFd(&fd).reregister(poll.registry(), token, interest)?;
            }
            (Some(_), None) => {
                let _ = SourceFd(&fd).deregister(poll.registry());
            }
            (None, None) => {}
        }
        Ok(())
    }
}

/// Zero-timeout readiness probe for one descriptor.
///
/// The backend reports edge-triggered events; the loop uses this probe
/// after dispatch to keep the level-triggered contract: a descriptor still
/// ready when a callback returns is carried into the next iteration.
pub(crate) fn probe_ready(fd: RawFd, interest: Interest) -> (bool, bool) {
    let mut mask: libc::c_short = 0;
    if interest.is_readable() {
        mask |= libc::POLLIN;
    }
    if interest.is_writable() {
        mask |= libc::POLLOUT;
    }
    if mask == 0 {
        return (false, false);
    }
    let mut pfd = libc::pollfd {
        fd,
        events: mask,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pfd, 1, 0) };
    if n <= 0 {
        return (false, false);
    }
    (
        pfd.revents & libc::POLLIN != 0,
        pfd.revents & libc::POLLOUT != 0,
    )
}
