//! Outbound connection establishment for client-role streams (§4.5).
//!
//! A pending-connect list is drained on a `Repeater` cadence, `take_error()`
//! distinguishes a completed connect from a still-in-flight one, and
//! registration under `Interest::WRITABLE` stands in for `OP_CONNECT` (mio
//! has no distinct connect readiness on Unix; writability is the signal
//! `connect(2)` uses).

use std::{io, net::SocketAddr};

use mio::{Interest, Token, net::TcpStream};
use nukleus_timing::{Duration, Repeater};
use tracing::{debug, warn};

use crate::poller::Poller;

/// A connect attempt that hasn't yet resolved to success or permanent
/// failure.
struct Pending {
    token: Token,
    addr: SocketAddr,
    correlation_id: u64,
    stream: Option<TcpStream>,
    attempts_left: u32,
}

pub enum ConnectOutcome {
    Established { token: Token, correlation_id: u64, stream: TcpStream, local_addr: SocketAddr },
    /// Retry budget exhausted; the initial throttle should be RESET.
    Failed { correlation_id: u64 },
}

/// Drives non-blocking `connect()`s and their retry cadence. One per worker.
pub struct Connector {
    pending: Vec<Pending>,
    retrying: Vec<Pending>,
    retry_interval: Repeater,
    retry_budget: u32,
    next_token: usize,
    token_base: usize,
}

impl Connector {
    pub fn new(token_base: usize, reconnect_interval: Duration, retry_budget: u32) -> Self {
        Self {
            pending: Vec::new(),
            retrying: Vec::new(),
            retry_interval: Repeater::every(reconnect_interval),
            retry_budget,
            next_token: token_base,
            token_base,
        }
    }

    /// Begins a connect for a client-role BEGIN frame. Returns the token
    /// assigned to the eventual socket.
    pub fn connect(&mut self, poller: &Poller, addr: SocketAddr, correlation_id: u64) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.start_attempt(poller, token, addr, correlation_id, self.retry_budget);
        Ok(token)
    }

    fn start_attempt(
        &mut self,
        poller: &Poller,
        token: Token,
        addr: SocketAddr,
        correlation_id: u64,
        attempts_left: u32,
    ) {
        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                if poller.register(&mut stream, token, Interest::WRITABLE).is_ok() {
                    self.pending.push(Pending { token, addr, correlation_id, stream: Some(stream), attempts_left });
                } else {
                    self.retrying.push(Pending { token, addr, correlation_id, stream: None, attempts_left });
                }
            }
            Err(err) => {
                warn!(?err, ?addr, "tcp: connect() failed synchronously");
                self.retrying.push(Pending { token, addr, correlation_id, stream: None, attempts_left });
            }
        }
    }

    pub fn is_pending(&self, token: Token) -> bool {
        token.0 >= self.token_base && self.pending.iter().any(|p| p.token == token)
    }

    /// Called when `OP_WRITE`/`OP_CONNECT` readiness fires for a pending
    /// connect. Resolves success/failure via `take_error`, matching the
    /// teacher's `stream.take_error()` check in `maybe_reconnect`.
    pub fn finish_connect(&mut self, token: Token) -> Option<ConnectOutcome> {
        let idx = self.pending.iter().position(|p| p.token == token)?;
        let mut entry = self.pending.swap_remove(idx);
        let stream = entry.stream.take()?;
        match stream.take_error() {
            Ok(None) => {
                let local_addr = stream.local_addr().ok()?;
                debug!(addr = ?entry.addr, "tcp: outbound connect completed");
                Some(ConnectOutcome::Established {
                    token,
                    correlation_id: entry.correlation_id,
                    stream,
                    local_addr,
                })
            }
            Ok(Some(err)) | Err(err) => {
                warn!(?err, addr = ?entry.addr, "tcp: outbound connect failed");
                if entry.attempts_left == 0 {
                    return Some(ConnectOutcome::Failed { correlation_id: entry.correlation_id });
                }
                self.schedule_retry(entry);
                None
            }
        }
    }

    fn schedule_retry(&mut self, mut entry: Pending) {
        entry.stream = None;
        entry.attempts_left -= 1;
        self.retrying.push(entry);
    }

    /// Retries every connect whose budget isn't exhausted, on the configured
    /// cadence. Returns terminal failures (budget exhausted on this pass).
    pub fn retry_due(&mut self, poller: &Poller) -> Vec<ConnectOutcome> {
        if !self.retry_interval.fired() {
            return Vec::new();
        }
        let mut failed = Vec::new();
        let due = std::mem::take(&mut self.retrying);
        for entry in due {
            if entry.attempts_left == 0 {
                failed.push(ConnectOutcome::Failed { correlation_id: entry.correlation_id });
                continue;
            }
            let remaining = entry.attempts_left - 1;
            self.start_attempt(poller, entry.token, entry.addr, entry.correlation_id, remaining);
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use mio::net::TcpListener;

    use super::*;

    #[test]
    fn connect_completes_against_a_live_listener() {
        let poller = Poller::new(8).unwrap();
        let mut listener =
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        poller.register(&mut listener, Token(0), Interest::READABLE).unwrap();

        let mut connector = Connector::new(1, Duration::from_secs(2), 3);
        let token = connector.connect(&poller, addr, 42).unwrap();
        assert!(connector.is_pending(token));

        // Give the kernel a moment to complete the loopback handshake.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let _ = listener.accept();

        match connector.finish_connect(token) {
            Some(ConnectOutcome::Established { correlation_id, .. }) => assert_eq!(correlation_id, 42),
            _ => panic!("expected a completed connect"),
        }
    }
}
