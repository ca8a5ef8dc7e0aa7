//! Thin wrapper around the OS readiness selector (`mio`/epoll).
//!
//! [`Poller`] owns the selector and the readiness event buffer; it does not
//! own sockets or application state. Callers register their own
//! `mio::event::Source` under a `Token` and look the token back up in their
//! own table when [`Poller::tick`] reports it ready, rather than the poller
//! storing a callback or connection table itself.

use std::{io, time::Duration};

use mio::{Events, Interest, Poll, Token, event::Source};

/// One readiness notification for a registered token.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        Ok(Self { poll: Poll::new()?, events: Events::with_capacity(events_capacity) })
    }

    pub fn register<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    pub fn reregister<S: Source + ?Sized>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Polls once and invokes `dispatch` for every ready key, exactly once
    /// per tick. Returns the sum of `dispatch`'s return values (work units,
    /// used by the worker for load metering), or an I/O error if the
    /// underlying `poll(2)`/`epoll_wait(2)` call failed for a reason other
    /// than `EINTR` (which `mio` already retries internally).
    pub fn tick<F>(&mut self, timeout: Option<Duration>, mut dispatch: F) -> io::Result<usize>
    where
        F: FnMut(Readiness) -> usize,
    {
        self.poll.poll(&mut self.events, timeout)?;
        let mut work = 0;
        for ev in self.events.iter() {
            work += dispatch(Readiness {
                token: ev.token(),
                readable: ev.is_readable(),
                writable: ev.is_writable(),
                read_closed: ev.is_read_closed(),
                write_closed: ev.is_write_closed(),
                error: ev.is_error(),
            });
        }
        Ok(work)
    }
}
