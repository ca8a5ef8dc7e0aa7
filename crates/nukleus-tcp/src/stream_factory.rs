//! Stream-id/correlation-id minting and BEGIN emission for both connection
//! directions (§4.6). Neither factory owns a [`crate::connection::Connection`]
//! — that stays in the worker's connection table — they only mint
//! identifiers, emit the opening BEGIN frame, and track the correlation
//! entry until its counterpart arrives.

use std::{collections::HashMap, net::SocketAddr};

use tracing::debug;

use crate::{
    addr_ext::TcpAddressExtension,
    messages::{MessageError, StreamMessage},
    rings::StreamSink,
};

/// A half-pair awaiting its counterpart, per §3's Correlation lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct PendingCorrelation {
    pub route_id: u64,
    pub read_stream_id: u64,
    pub write_stream_id: u64,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

/// Single-consumer correlation map: one [`Self::insert`] per
/// [`Self::remove`]. Shared by both factories since correlation ids are
/// minted from one counter regardless of which side originates the stream.
#[derive(Default)]
pub struct CorrelationMap {
    pending: HashMap<u64, PendingCorrelation>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self { pending: HashMap::new() }
    }

    pub fn insert(&mut self, correlation_id: u64, entry: PendingCorrelation) {
        self.pending.insert(correlation_id, entry);
    }

    /// Removes and returns the pending entry for `correlation_id`, if any
    /// (exactly one removal per insertion, per §3).
    pub fn remove(&mut self, correlation_id: u64) -> Option<PendingCorrelation> {
        self.pending.remove(&correlation_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Stream id allocation, shared by both directions so ids never collide
/// across a worker's lifetime.
#[derive(Default)]
pub struct StreamIdAllocator {
    next_stream_id: u64,
}

impl StreamIdAllocator {
    pub fn new() -> Self {
        Self { next_stream_id: 1 }
    }

    pub fn alloc_pair(&mut self) -> (u64, u64) {
        let a = self.next_stream_id;
        let b = self.next_stream_id + 1;
        self.next_stream_id += 2;
        (a, b)
    }
}

/// Handles inbound accepts: mints ids, emits BEGIN to the route's target
/// consumer, and records a [`PendingCorrelation`] for the worker to resolve
/// once the application replies.
pub struct ServerStreamFactory;

impl ServerStreamFactory {
    /// §4.6, steps 1-3. Takes stream ids already minted by the worker's
    /// [`StreamIdAllocator`] (the ring channels for them must exist before
    /// BEGIN can be sent on one) and emits BEGIN on `target`. The connection
    /// itself tracks whether the application's reply BEGIN has arrived yet
    /// (it is already known synchronously, unlike the client-connect path,
    /// which needs [`CorrelationMap`] to survive the wait for a real
    /// `connect()` to resolve across ticks).
    ///
    /// `correlationId` is not a wire field of BEGIN (§6 lists none); the
    /// stream's own `readStreamId` doubles as the correlation key, since it
    /// is already unique and known to both sides once BEGIN is dispatched.
    pub fn begin_accept(
        route_id: u64,
        read_stream_id: u64,
        write_stream_id: u64,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        target: &mut dyn StreamSink,
    ) -> Result<u64, MessageError> {
        let correlation_id = read_stream_id;
        let extension = TcpAddressExtension { local: local_addr, remote: peer_addr }.encode();
        target.send(&StreamMessage::Begin {
            stream_id: read_stream_id,
            authorization: 0,
            extension,
        })?;
        debug!(route_id, correlation_id, read_stream_id, write_stream_id, "tcp: BEGIN emitted for accept");
        Ok(correlation_id)
    }
}

/// Handles outbound connects: the application owns the `correlationId`
/// (§4.5), this factory only emits the reply BEGIN once the connect
/// resolves.
pub struct ClientStreamFactory;

impl ClientStreamFactory {
    /// Called once [`crate::connector::Connector::finish_connect`] reports a
    /// successful connect. Emits the reply BEGIN back to the application on
    /// the same `correlationId` it supplied originally.
    pub fn begin_reply(
        correlation_id: u64,
        read_stream_id: u64,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        reply_target: &mut dyn StreamSink,
    ) -> Result<(), MessageError> {
        let extension = TcpAddressExtension { local: local_addr, remote: peer_addr }.encode();
        reply_target.send(&StreamMessage::Begin {
            stream_id: read_stream_id,
            authorization: 0,
            extension,
        })?;
        debug!(correlation_id, read_stream_id, "tcp: reply BEGIN emitted for outbound connect");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rings::InMemoryRing;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn begin_accept_emits_begin_with_the_read_stream_id_as_correlation_id() {
        let mut ids = StreamIdAllocator::new();
        let mut target = InMemoryRing::new();
        let mut target_view = target.clone();
        let (read_stream_id, write_stream_id) = ids.alloc_pair();

        let correlation_id = ServerStreamFactory::begin_accept(
            1,
            read_stream_id,
            write_stream_id,
            addr(9000),
            addr(5555),
            &mut target,
        )
        .unwrap();

        assert_ne!(read_stream_id, write_stream_id);
        assert_eq!(correlation_id, read_stream_id);

        match target_view.try_recv().unwrap() {
            Some(StreamMessage::Begin { stream_id, extension, .. }) => {
                assert_eq!(stream_id, read_stream_id);
                assert!(!extension.is_empty());
            }
            other => panic!("expected BEGIN, got {other:?}"),
        }
    }

    #[test]
    fn two_accepts_never_collide_on_stream_id() {
        let mut ids = StreamIdAllocator::new();
        let (first_read, first_write) = ids.alloc_pair();
        let (second_read, second_write) = ids.alloc_pair();

        assert_ne!(first_read, second_read);
        assert_ne!(first_write, second_write);
    }
}
