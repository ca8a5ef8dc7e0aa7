//! Listening sockets and the connection-cap/rebind policy around them
//! (§4.4). One `mio::net::TcpListener` per bound local address, a flat
//! `Vec<(Token, TcpListener)>` rather than a map, and `Interest::READABLE`
//! registered/deregistered as the single lever for "accepting" vs
//! "saturated".

use std::{io, net::SocketAddr};

use mio::{Interest, Token, net::TcpListener};
use tracing::{debug, warn};

use crate::poller::Poller;

struct Listener {
    token: Token,
    addr: SocketAddr,
    listener: TcpListener,
    /// Whether `OP_ACCEPT` (in mio terms, `READABLE`) is currently armed.
    /// Disarmed while the connection cap is saturated.
    armed: bool,
}

/// Owns every listening socket bound across all server-role routes and
/// enforces `maxConnections` by disarming/rearming their read interest.
pub struct Acceptor {
    listeners: Vec<Listener>,
    next_token: usize,
    token_base: usize,
}

impl Acceptor {
    pub fn new(token_base: usize) -> Self {
        Self { listeners: Vec::new(), next_token: token_base, token_base }
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Binds a new listener, or returns its existing token if one is already
    /// bound at `addr` (multiple server routes may share a listener, per
    /// §3's `Route` lifecycle). Returns the token plus the OS-assigned bound
    /// address, which differs from `addr` whenever the route asked for an
    /// ephemeral port (port 0, §3): the caller must record that address, not
    /// `addr`, as the route's `local_address`, or accepted connections will
    /// never match it. A port-0 request is never deduplicated against an
    /// existing listener, since it can't name one in advance.
    pub fn bind(&mut self, poller: &Poller, addr: SocketAddr, saturated: bool) -> io::Result<(Token, SocketAddr)> {
        if let Some(existing) = self.listeners.iter().find(|l| l.addr == addr) {
            return Ok((existing.token, existing.addr));
        }
        let mut listener = TcpListener::bind(addr)?;
        let bound_addr = listener.local_addr()?;
        let token = self.alloc_token();
        if !saturated {
            poller.register(&mut listener, token, Interest::READABLE)?;
        }
        self.listeners.push(Listener { token, addr: bound_addr, listener, armed: !saturated });
        Ok((token, bound_addr))
    }

    /// Drops the listener once the last route referencing it unroutes.
    pub fn unbind(&mut self, poller: &Poller, addr: SocketAddr) {
        if let Some(idx) = self.listeners.iter().position(|l| l.addr == addr) {
            let mut entry = self.listeners.swap_remove(idx);
            let _ = poller.deregister(&mut entry.listener);
        }
    }

    pub fn listener_token_at(&self, addr: SocketAddr) -> Option<Token> {
        self.listeners.iter().find(|l| l.addr == addr).map(|l| l.token)
    }

    /// Accepts at most one connection per listener per tick (cooperative
    /// fairness, §4.4), and hands each back to `on_accept` for route
    /// matching and stream-factory handoff. Returns the number of
    /// connections accepted this tick.
    pub fn accept_ready<F>(&mut self, token: Token, mut on_accept: F) -> usize
    where
        F: FnMut(mio::net::TcpStream, SocketAddr, SocketAddr),
    {
        let Some(listener) = self.listeners.iter_mut().find(|l| l.token == token) else {
            warn!(?token, "tcp: accept event for unknown listener");
            return 0;
        };
        match listener.listener.accept() {
            Ok((stream, peer_addr)) => {
                let local_addr = stream.local_addr().unwrap_or(listener.addr);
                debug!(?peer_addr, ?local_addr, "tcp: accepted connection");
                on_accept(stream, local_addr, peer_addr);
                1
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(err) => {
                warn!(?err, addr = ?listener.addr, "tcp: accept failed");
                0
            }
        }
    }

    /// Disarms `OP_ACCEPT` on every listener once `openConnections` hits
    /// `maxConnections`. Idempotent.
    pub fn saturate(&mut self, poller: &Poller) {
        for l in &mut self.listeners {
            if l.armed {
                if poller.deregister(&mut l.listener).is_ok() {
                    l.armed = false;
                }
            }
        }
    }

    /// Rearms `OP_ACCEPT` on every listener once a connection closes and the
    /// cap has headroom again.
    pub fn rearm(&mut self, poller: &Poller) {
        for l in &mut self.listeners {
            if !l.armed {
                if poller.register(&mut l.listener, l.token, Interest::READABLE).is_ok() {
                    l.armed = true;
                }
            }
        }
    }

    pub fn is_listener(&self, token: Token) -> bool {
        token.0 >= self.token_base && self.listeners.iter().any(|l| l.token == token)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[test]
    fn bind_is_idempotent_per_address() {
        let poller = Poller::new(8).unwrap();
        let mut acceptor = Acceptor::new(100);
        let (token_a, bound_addr) = acceptor.bind(&poller, loopback(), false).unwrap();
        let (token_b, _) = acceptor.bind(&poller, bound_addr, false).unwrap();
        assert_eq!(token_a, token_b);
    }

    #[test]
    fn bind_on_port_zero_never_dedupes_against_a_prior_ephemeral_bind() {
        let poller = Poller::new(8).unwrap();
        let mut acceptor = Acceptor::new(100);
        let (token_a, addr_a) = acceptor.bind(&poller, loopback(), false).unwrap();
        let (token_b, addr_b) = acceptor.bind(&poller, loopback(), false).unwrap();
        assert_ne!(token_a, token_b);
        assert_ne!(addr_a.port(), addr_b.port());
    }

    #[test]
    fn saturate_then_rearm_toggles_armed_flag() {
        let poller = Poller::new(8).unwrap();
        let mut acceptor = Acceptor::new(100);
        acceptor.bind(&poller, loopback(), false).unwrap();
        assert!(acceptor.listeners[0].armed);
        acceptor.saturate(&poller);
        assert!(!acceptor.listeners[0].armed);
        acceptor.rearm(&poller);
        assert!(acceptor.listeners[0].armed);
    }
}
