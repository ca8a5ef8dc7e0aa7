//! One TCP connection: the socket, its read/write credit bookkeeping
//! ([`ReadStream`]/[`WriteStream`]), and the four ring endpoints that carry
//! frames to and from the peer nukleus (forward direction + throttle
//! direction, once per stream of the pair).
//!
//! A length-bounded backlog buffer absorbs writes that would otherwise
//! block, with armed/disarmed `OP_WRITE` interest tracking an empty/non-empty
//! backlog invariant, and a read loop that keeps pulling frames until the
//! kernel says `WouldBlock`. The socket carries raw application bytes,
//! credited against a WINDOW/RESET throttle protocol.

use std::{
    io::{self, Read, Write},
    net::SocketAddr,
};

use mio::{Interest, Token, net::TcpStream};
use tracing::{debug, warn};

use crate::{
    counters::{CounterKind, TcpCounters},
    messages::StreamMessage,
    poller::Poller,
    read_stream::ReadStream,
    rings::{StreamSink, StreamSource},
    write_stream::WriteStream,
};

/// What the worker should do with a connection after an I/O or ring event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnOutcome {
    Alive,
    /// Both directions terminated (or the socket was closed abortively).
    /// The worker must drop the connection and decrement `openConnections`.
    Closed,
}

pub struct Connection {
    pub token: Token,
    pub route_id: u64,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,

    stream: TcpStream,
    read: ReadStream,
    write: WriteStream,

    write_backlog: Vec<u8>,
    /// Credit from a direct partial write that hasn't been regranted yet
    /// (§4.3 step 2: deferred to the next `OP_WRITE` drain).
    write_pending_regrant: usize,
    write_armed: bool,
    read_armed: bool,
    interest_dirty: bool,

    input_shutdown: bool,
    output_shutdown: bool,
    read_terminated: bool,
    write_terminated: bool,
    /// Whether the application's reply BEGIN has been observed on
    /// `write_forward` (§4.6). Server-accepted connections start
    /// uncorrelated; client connections start correlated, since the
    /// application already supplied the initiating BEGIN before the connect.
    correlated: bool,

    /// Emits BEGIN/DATA/END/ABORT for the stream driven by this socket's
    /// read half.
    read_forward: Box<dyn StreamSink>,
    /// Receives WINDOW/RESET for that same stream.
    read_throttle: Box<dyn StreamSource>,
    /// Receives BEGIN/DATA/END/ABORT for the stream driven by this socket's
    /// write half.
    write_forward: Box<dyn StreamSource>,
    /// Emits WINDOW/RESET for that same stream.
    write_throttle: Box<dyn StreamSink>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        token: Token,
        route_id: u64,
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        read_stream_id: u64,
        write_stream_id: u64,
        initial_read_credit: i32,
        read_padding: i32,
        initial_write_credit: i32,
        write_padding: u16,
        correlated: bool,
        read_forward: Box<dyn StreamSink>,
        read_throttle: Box<dyn StreamSource>,
        write_forward: Box<dyn StreamSource>,
        write_throttle: Box<dyn StreamSink>,
    ) -> Self {
        let mut read = ReadStream::new(read_stream_id);
        read.grant_window(initial_read_credit, read_padding, 0);
        Self {
            token,
            route_id,
            local_addr,
            peer_addr,
            stream,
            read,
            write: WriteStream::with_padding(write_stream_id, initial_write_credit, write_padding, 0),
            write_backlog: Vec::new(),
            write_pending_regrant: 0,
            write_armed: false,
            read_armed: true,
            interest_dirty: false,
            input_shutdown: false,
            output_shutdown: false,
            read_terminated: false,
            write_terminated: false,
            correlated,
            read_forward,
            read_throttle,
            write_forward,
            write_throttle,
        }
    }

    pub fn register(&mut self, poller: &Poller) -> io::Result<()> {
        poller.register(&mut self.stream, self.token, Interest::READABLE)
    }

    /// Reregisters the socket if read/write interest changed since the last
    /// call. The worker calls this after every method below that might have
    /// armed or disarmed an interest.
    pub fn sync_interest(&mut self, poller: &Poller) -> io::Result<()> {
        if !self.interest_dirty || self.closed() {
            return Ok(());
        }
        self.interest_dirty = false;
        poller.reregister(&mut self.stream, self.token, self.interest())
    }

    pub fn interest(&self) -> Interest {
        match (self.read_armed, self.write_armed) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => Interest::READABLE, // never fully disarmed; re-armed lazily on WINDOW
        }
    }

    pub fn closed(&self) -> bool {
        self.input_shutdown && self.output_shutdown
    }

    // ---- network -> application -------------------------------------------------

    /// Drains the socket's read half into `scratch`, the worker's shared
    /// per-tick buffer (§9, zero-copy discipline: no slice of it is retained
    /// past this call). Emits one DATA frame per non-empty read, stopping at
    /// `WouldBlock`, EOF, or an I/O error.
    pub fn on_readable(&mut self, scratch: &mut [u8], counters: &mut TcpCounters) -> ConnOutcome {
        loop {
            if self.read.is_eof() || self.read_terminated {
                return self.outcome();
            }
            let avail = self.read.available_to_read().min(scratch.len());
            if avail == 0 {
                self.clear_read_interest();
                return self.outcome();
            }
            match self.stream.read(&mut scratch[..avail]) {
                Ok(0) => {
                    self.on_eof(counters);
                    return self.outcome();
                }
                Ok(n) => {
                    let padding = self.read.padding();
                    let group_id = self.read.group_id();
                    let stream_id = self.read.stream_id;
                    if self
                        .read_forward
                        .send(&StreamMessage::Data {
                            stream_id,
                            authorization: 0,
                            flags: 0,
                            group_id,
                            padding,
                            payload: scratch[..n].to_vec(),
                            extension: Vec::new(),
                        })
                        .is_err()
                    {
                        warn!(token = ?self.token, "tcp: failed to encode DATA frame, aborting");
                        self.abort_inbound(counters);
                        return self.outcome();
                    }
                    self.read.on_data_dispatched(n);
                    counters.incr(self.route_id, CounterKind::FramesRead, 1);
                    counters.incr(self.route_id, CounterKind::BytesRead, n as u64);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return self.outcome();
                }
                Err(err) => {
                    debug!(?err, token = ?self.token, "tcp: read error");
                    self.abort_inbound(counters);
                    return self.outcome();
                }
            }
        }
    }

    fn on_eof(&mut self, counters: &mut TcpCounters) {
        self.read.on_eof();
        self.read_terminated = true;
        let stream_id = self.read.stream_id;
        let _ = self.read_forward.send(&StreamMessage::End {
            stream_id,
            authorization: 0,
            extension: Vec::new(),
        });
        self.clear_read_interest();
        let _ = self.stream.shutdown(std::net::Shutdown::Read);
        self.input_shutdown = true;
        if self.output_shutdown {
            counters.incr_connections_closed();
        }
    }

    fn abort_inbound(&mut self, counters: &mut TcpCounters) {
        if self.read_terminated {
            return;
        }
        self.read_terminated = true;
        let stream_id = self.read.stream_id;
        let _ = self.read_forward.send(&StreamMessage::Abort {
            stream_id,
            authorization: 0,
            extension: Vec::new(),
        });
        if self.correlated {
            let _ = self.write_throttle.send(&StreamMessage::Reset { stream_id });
        } else {
            self.read.latch_reset_required();
        }
        self.close_abortive(counters);
    }

    fn clear_read_interest(&mut self) {
        if self.read_armed {
            self.read_armed = false;
            self.interest_dirty = true;
        }
    }

    fn arm_read_interest(&mut self) {
        if !self.read_armed {
            self.read_armed = true;
            self.interest_dirty = true;
        }
    }

    // ---- throttle for the read (inbound) direction: WINDOW/RESET from the consumer --

    /// Drains WINDOW/RESET frames destined for the read stream. Returns
    /// whether the connection is still alive.
    pub fn pump_read_throttle(
        &mut self,
        scratch: &mut [u8],
        counters: &mut TcpCounters,
    ) -> ConnOutcome {
        loop {
            match self.read_throttle.try_recv() {
                Ok(Some(StreamMessage::Window { credit, padding, group_id, .. })) => {
                    self.read.grant_window(credit, padding, group_id);
                    if self.read.is_eof() {
                        continue;
                    }
                    if self.read.available_to_read() > 0 {
                        self.arm_read_interest();
                        if self.on_readable(scratch, counters) == ConnOutcome::Closed {
                            return ConnOutcome::Closed;
                        }
                    } else {
                        self.clear_read_interest();
                    }
                }
                Ok(Some(StreamMessage::Reset { .. })) => {
                    self.close_abortive(counters);
                    return ConnOutcome::Closed;
                }
                Ok(Some(_)) => {
                    // Only WINDOW/RESET are valid on a throttle channel; ignore anything else.
                }
                Ok(None) => return self.outcome(),
                Err(err) => {
                    warn!(?err, token = ?self.token, "tcp: malformed throttle frame");
                    return self.outcome();
                }
            }
        }
    }

    /// Resolves this connection's correlation once the application's reply
    /// BEGIN arrives on `write_forward` (§4.6). If a RESET was latched while
    /// uncorrelated, it is sent immediately.
    fn mark_correlated(&mut self, stream_id: u64) {
        if self.correlated {
            return;
        }
        if stream_id != self.write.stream_id {
            warn!(
                token = ?self.token,
                expected = self.write.stream_id,
                got = stream_id,
                "tcp: reply BEGIN stream id mismatch"
            );
            return;
        }
        self.correlated = true;
        if self.read.take_reset_required() {
            let read_stream_id = self.read.stream_id;
            let _ = self.write_throttle.send(&StreamMessage::Reset { stream_id: read_stream_id });
        }
    }

    // ---- application -> network ---------------------------------------------------

    /// Drains inbound DATA/END/ABORT frames from the application and applies
    /// them to the socket (§4.3).
    pub fn pump_write_forward(&mut self, counters: &mut TcpCounters) -> ConnOutcome {
        loop {
            match self.write_forward.try_recv() {
                Ok(Some(StreamMessage::Data { payload, .. })) => {
                    if !self.write.accept(payload.len()) {
                        counters.incr_overflow();
                        let stream_id = self.write.stream_id;
                        let _ = self.write_throttle.send(&StreamMessage::Reset { stream_id });
                        self.close_abortive(counters);
                        return ConnOutcome::Closed;
                    }
                    if self.write_data(&payload, counters) == ConnOutcome::Closed {
                        return ConnOutcome::Closed;
                    }
                }
                Ok(Some(StreamMessage::End { .. })) => {
                    if self.write_backlog.is_empty() {
                        self.finish_write_end(counters);
                        if self.closed() {
                            return ConnOutcome::Closed;
                        }
                    } else {
                        self.write.defer_end();
                    }
                }
                Ok(Some(StreamMessage::Abort { .. })) => {
                    self.abort_outbound(counters);
                    return ConnOutcome::Closed;
                }
                Ok(Some(StreamMessage::Begin { stream_id, .. })) => {
                    self.mark_correlated(stream_id);
                }
                Ok(Some(_)) => {}
                Ok(None) => return self.outcome(),
                Err(err) => {
                    warn!(?err, token = ?self.token, "tcp: malformed forward frame");
                    return self.outcome();
                }
            }
        }
    }

    fn write_data(&mut self, payload: &[u8], counters: &mut TcpCounters) -> ConnOutcome {
        if !self.write_backlog.is_empty() {
            self.write_backlog.extend_from_slice(payload);
            return ConnOutcome::Alive;
        }
        match self.stream.write(payload) {
            Ok(n) if n == payload.len() => {
                self.regrant_and_count(n, counters);
                ConnOutcome::Alive
            }
            Ok(n) => {
                self.write_backlog.extend_from_slice(&payload[n..]);
                self.arm_write_interest();
                // §4.3 step 2: a partial write stores the remainder and
                // defers its WINDOW to the next `OP_WRITE` drain rather than
                // granting it here.
                self.write_pending_regrant += n;
                ConnOutcome::Alive
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.write_backlog.extend_from_slice(payload);
                self.arm_write_interest();
                ConnOutcome::Alive
            }
            Err(err) => {
                debug!(?err, token = ?self.token, "tcp: write error");
                self.abort_outbound(counters);
                ConnOutcome::Closed
            }
        }
    }

    fn regrant_and_count(&mut self, n: usize, counters: &mut TcpCounters) {
        let padding = self.write.padding();
        let regrant = self.write.credit_to_regrant(n, padding);
        let stream_id = self.write.stream_id;
        let group_id = self.write.group_id();
        let _ = self
            .write_throttle
            .send(&StreamMessage::Window { stream_id, credit: regrant, padding, group_id });
        counters.incr(self.route_id, CounterKind::FramesWrote, 1);
        counters.incr(self.route_id, CounterKind::BytesWrote, n as u64);
    }

    fn finish_write_end(&mut self, counters: &mut TcpCounters) {
        self.write_terminated = true;
        let _ = self.stream.shutdown(std::net::Shutdown::Write);
        self.output_shutdown = true;
        if self.input_shutdown {
            counters.incr_connections_closed();
        }
    }

    fn abort_outbound(&mut self, counters: &mut TcpCounters) {
        if self.write_terminated {
            return;
        }
        self.write_backlog.clear();
        self.write_terminated = true;
        let stream_id = self.write.stream_id;
        let _ = self.write_throttle.send(&StreamMessage::Reset { stream_id });
        // The peer forward channel (the read stream) also observes an abort,
        // if it hasn't already terminated on its own.
        if !self.read_terminated {
            let read_stream_id = self.read.stream_id;
            let _ = self.read_forward.send(&StreamMessage::Abort {
                stream_id: read_stream_id,
                authorization: 0,
                extension: Vec::new(),
            });
            self.read_terminated = true;
        }
        self.close_abortive(counters);
    }

    /// Drains the write backlog when `OP_WRITE` fires.
    pub fn on_writable(&mut self, counters: &mut TcpCounters) -> ConnOutcome {
        let mut drained = std::mem::take(&mut self.write_pending_regrant);
        loop {
            if self.write_backlog.is_empty() {
                break;
            }
            match self.stream.write(&self.write_backlog) {
                Ok(0) => {
                    self.abort_outbound(counters);
                    return ConnOutcome::Closed;
                }
                Ok(n) => {
                    self.write_backlog.drain(..n);
                    drained += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, token = ?self.token, "tcp: backlog write error");
                    self.abort_outbound(counters);
                    return ConnOutcome::Closed;
                }
            }
        }
        if drained > 0 {
            self.regrant_and_count(drained, counters);
        }
        if self.write_backlog.is_empty() {
            self.disarm_write_interest();
            if self.write.take_deferred_abort() {
                self.abort_outbound(counters);
                return ConnOutcome::Closed;
            }
            if self.write.take_deferred_end() {
                self.finish_write_end(counters);
            }
        }
        self.outcome()
    }

    fn arm_write_interest(&mut self) {
        if !self.write_armed {
            self.write_armed = true;
            self.interest_dirty = true;
        }
    }

    fn disarm_write_interest(&mut self) {
        if self.write_armed {
            self.write_armed = false;
            self.interest_dirty = true;
        }
    }

    fn close_abortive(&mut self, counters: &mut TcpCounters) {
        let was_open = !(self.input_shutdown && self.output_shutdown);
        let _ = self.stream.set_linger(Some(std::time::Duration::ZERO));
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.input_shutdown = true;
        self.output_shutdown = true;
        if was_open {
            counters.incr_connections_closed();
        }
    }

    fn outcome(&self) -> ConnOutcome {
        if self.closed() { ConnOutcome::Closed } else { ConnOutcome::Alive }
    }

    pub fn socket(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use mio::net::{TcpListener, TcpStream as MioTcpStream};

    use super::*;
    use crate::{poller::Poller, rings::InMemoryRing};

    fn loopback_pair() -> (MioTcpStream, MioTcpStream) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let mut listener = TcpListener::bind(addr).unwrap();
        let bound = listener.local_addr().unwrap();
        let client = MioTcpStream::connect(bound).unwrap();
        // Loopback connects complete synchronously often enough in tests that a
        // short spin suffices without a real poller.
        let mut server = None;
        for _ in 0..10000 {
            if let Ok((s, _)) = listener.accept() {
                server = Some(s);
                break;
            }
        }
        (client, server.expect("loopback accept should complete promptly"))
    }

    fn make_connection(
        token: usize,
        stream: MioTcpStream,
        read_forward: InMemoryRing,
        read_throttle: InMemoryRing,
        write_forward: InMemoryRing,
        write_throttle: InMemoryRing,
        initial_write_credit: i32,
    ) -> Connection {
        let local = stream.local_addr().unwrap();
        let peer = stream.peer_addr().unwrap();
        Connection::new(
            Token(token),
            1,
            stream,
            local,
            peer,
            1,
            2,
            1 << 20,
            0,
            initial_write_credit,
            0,
            true,
            Box::new(read_forward),
            Box::new(read_throttle),
            Box::new(write_forward),
            Box::new(write_throttle),
        )
    }

    #[test]
    fn reads_available_bytes_into_one_data_frame() {
        let (mut client, server) = loopback_pair();
        let poller = Poller::new(8).unwrap();
        let read_forward = InMemoryRing::new();
        let mut read_forward_view = read_forward.clone();
        let mut conn = make_connection(
            1,
            server,
            read_forward,
            InMemoryRing::new(),
            InMemoryRing::new(),
            InMemoryRing::new(),
            0,
        );
        conn.register(&poller).unwrap();

        client.write_all(b"hello").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut counters = TcpCounters::new_in_memory(16);
        let mut scratch = vec![0u8; 4096];
        conn.on_readable(&mut scratch, &mut counters);

        match read_forward_view.try_recv().unwrap() {
            Some(StreamMessage::Data { payload, .. }) => assert_eq!(payload, b"hello"),
            other => panic!("expected DATA, got {other:?}"),
        }
        assert_eq!(counters.value(1, CounterKind::BytesRead), 5);
    }

    #[test]
    fn overflow_resets_and_aborts() {
        let (mut client, server) = loopback_pair();
        let write_throttle = InMemoryRing::new();
        let mut write_throttle_view = write_throttle.clone();
        let mut conn = make_connection(
            2,
            server,
            InMemoryRing::new(),
            InMemoryRing::new(),
            InMemoryRing::new(),
            write_throttle,
            50,
        );
        let mut counters = TcpCounters::new_in_memory(16);

        conn.write_forward = Box::new({
            let mut ring = InMemoryRing::new();
            ring.send(&StreamMessage::Data {
                stream_id: 2,
                authorization: 0,
                flags: 0,
                group_id: 0,
                padding: 0,
                payload: vec![0u8; 100],
                extension: Vec::new(),
            })
            .unwrap();
            ring
        });

        let outcome = conn.pump_write_forward(&mut counters);
        assert_eq!(outcome, ConnOutcome::Closed);
        assert_eq!(counters.overflows(), 1);
        assert!(matches!(
            write_throttle_view.try_recv().unwrap(),
            Some(StreamMessage::Reset { stream_id: 2 })
        ));
        drop(client);
    }

    #[test]
    fn reply_begin_correlates_and_flushes_a_latched_reset() {
        let (client, server) = loopback_pair();
        let write_throttle = InMemoryRing::new();
        let mut write_throttle_view = write_throttle.clone();
        let write_forward = InMemoryRing::new();
        let mut write_forward_view = write_forward.clone();
        let local = server.local_addr().unwrap();
        let peer = server.peer_addr().unwrap();
        let mut conn = Connection::new(
            Token(3),
            1,
            server,
            local,
            peer,
            1,
            2,
            1 << 20,
            0,
            0,
            0,
            false,
            Box::new(InMemoryRing::new()),
            Box::new(InMemoryRing::new()),
            Box::new(write_forward),
            Box::new(write_throttle),
        );
        let mut counters = TcpCounters::new_in_memory(16);

        // Closing the read side before correlation latches the RESET rather
        // than sending it.
        conn.abort_inbound(&mut counters);
        assert!(write_throttle_view.try_recv().unwrap().is_none());

        write_forward_view
            .send(&StreamMessage::Begin { stream_id: 2, authorization: 0, extension: Vec::new() })
            .unwrap();
        conn.pump_write_forward(&mut counters);

        assert!(conn.correlated);
        assert!(matches!(
            write_throttle_view.try_recv().unwrap(),
            Some(StreamMessage::Reset { stream_id: 1 })
        ));
        drop(client);
    }

    #[test]
    fn partial_direct_write_defers_its_regrant_to_the_next_drain() {
        let (mut client, server) = loopback_pair();
        let write_throttle = InMemoryRing::new();
        let mut write_throttle_view = write_throttle.clone();
        let mut conn = make_connection(
            4,
            server,
            InMemoryRing::new(),
            InMemoryRing::new(),
            InMemoryRing::new(),
            write_throttle,
            1 << 20,
        );
        let mut counters = TcpCounters::new_in_memory(16);

        // Force a partial write by filling the backlog field directly, then
        // simulate the "some bytes accepted, rest queued" outcome by
        // invoking write_data with a payload too big for one syscall isn't
        // reliably reproducible over loopback in a unit test, so drive the
        // deferred-credit bookkeeping directly instead.
        conn.write_pending_regrant = 64;
        conn.on_writable(&mut counters);

        assert_eq!(conn.write_pending_regrant, 0);
        match write_throttle_view.try_recv().unwrap() {
            Some(StreamMessage::Window { credit, .. }) => assert_eq!(credit, 64),
            other => panic!("expected WINDOW, got {other:?}"),
        }
        drop(client);
    }
}
