//! Adapters onto the shared-memory ring-buffer substrate shared with peer
//! nuklei. The substrate itself (single-producer/single-consumer,
//! framed-record protocol) lives in [`nukleus_communication::queue`]; this
//! module only teaches it the `StreamMessage` wire format.
//!
//! The worker never depends on the concrete shared-memory type directly — it
//! is driven through [`StreamSink`] / [`StreamSource`], so tests can swap in
//! an in-process [`VecDeque`] ring without touching `/dev/shm`.

use std::{cell::RefCell, collections::VecDeque, path::Path, rc::Rc};

use nukleus_communication::{
    ReadError,
    queue::{ConsumerBare, Producer, Queue, QueueType},
};

use crate::messages::{MAX_FRAME_LEN, MessageError, MessageReader, MessageWriter, StreamMessage};

/// A producer-facing ring: the worker writes frames, a peer nukleus reads
/// them.
pub trait StreamSink {
    fn send(&mut self, msg: &StreamMessage) -> Result<(), MessageError>;
}

/// A consumer-facing ring: a peer nukleus writes frames, the worker reads
/// them.
pub trait StreamSource {
    /// Returns `Ok(None)` when the ring is empty. A producer that has lapped
    /// the consumer is treated as empty too (the record is simply gone);
    /// callers that care about loss should inspect telemetry instead.
    fn try_recv(&mut self) -> Result<Option<StreamMessage>, MessageError>;
}

/// One shared-memory slot: a length-prefixed encoded frame, capped at
/// [`MAX_FRAME_LEN`] to keep the record a fixed, `Copy` size.
#[derive(Clone, Copy)]
#[repr(C)]
struct RingFrame {
    len: u32,
    bytes: [u8; MAX_FRAME_LEN],
}

impl Default for RingFrame {
    fn default() -> Self {
        Self { len: 0, bytes: [0u8; MAX_FRAME_LEN] }
    }
}

/// Shared-memory-backed [`StreamSink`], one per outbound direction of a
/// streams ring file.
pub struct ShmemStreamSink {
    producer: Producer<RingFrame>,
    writer: MessageWriter,
    scratch: Vec<u8>,
}

impl ShmemStreamSink {
    pub fn create_or_open<P: AsRef<Path>>(path: P, capacity: usize) -> Self {
        let queue = Queue::create_or_open_shared(path, capacity, QueueType::SPMC);
        Self { producer: Producer::from(queue), writer: MessageWriter, scratch: Vec::new() }
    }
}

impl StreamSink for ShmemStreamSink {
    fn send(&mut self, msg: &StreamMessage) -> Result<(), MessageError> {
        self.writer.encode(msg, &mut self.scratch)?;
        if self.scratch.len() > MAX_FRAME_LEN {
            return Err(MessageError::TooLarge(self.scratch.len()));
        }
        let mut frame = RingFrame::default();
        frame.len = self.scratch.len() as u32;
        frame.bytes[..self.scratch.len()].copy_from_slice(&self.scratch);
        self.producer.produce(&frame);
        Ok(())
    }
}

/// Shared-memory-backed [`StreamSource`], one per inbound direction of a
/// streams ring file.
pub struct ShmemStreamSource {
    consumer: ConsumerBare<RingFrame>,
    reader: MessageReader,
}

impl ShmemStreamSource {
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Self {
        let queue = Queue::create_or_open_shared(path, capacity, QueueType::SPMC);
        Self { consumer: ConsumerBare::from(queue), reader: MessageReader }
    }
}

impl StreamSource for ShmemStreamSource {
    fn try_recv(&mut self) -> Result<Option<StreamMessage>, MessageError> {
        let mut frame = RingFrame::default();
        match self.consumer.try_consume(&mut frame) {
            Ok(()) => {
                let decoded = self.reader.decode(&frame.bytes[..frame.len as usize])?;
                Ok(Some(decoded))
            }
            Err(ReadError::Empty) => Ok(None),
            Err(ReadError::SpedPast) => {
                self.consumer.recover_after_error();
                Ok(None)
            }
        }
    }
}

/// In-process ring used by tests and single-binary deployments that don't
/// need a separate shared-memory segment for the application nukleus.
///
/// Cloning shares the same backing queue (cheap `Rc` bump), so a test can
/// hold one handle to feed a connection's forward channel and another to
/// inspect what it emits on the matching throttle channel.
#[derive(Default, Clone)]
pub struct InMemoryRing {
    queue: Rc<RefCell<VecDeque<StreamMessage>>>,
}

impl InMemoryRing {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StreamSink for InMemoryRing {
    fn send(&mut self, msg: &StreamMessage) -> Result<(), MessageError> {
        self.queue.borrow_mut().push_back(msg.clone());
        Ok(())
    }
}

impl StreamSource for InMemoryRing {
    fn try_recv(&mut self) -> Result<Option<StreamMessage>, MessageError> {
        Ok(self.queue.borrow_mut().pop_front())
    }
}

/// The four per-connection channels a stream pair needs, in the order
/// [`crate::connection::Connection::new`] takes them: the direction the
/// worker reads the socket into (forward, then its reverse throttle) and the
/// direction the worker writes to the socket from (forward, then its
/// reverse throttle).
pub struct ConnChannels {
    pub read_forward: Box<dyn StreamSink>,
    pub read_throttle: Box<dyn StreamSource>,
    pub write_forward: Box<dyn StreamSource>,
    pub write_throttle: Box<dyn StreamSink>,
}

/// Mints the ring channels for one connection's stream pair. The worker is
/// generic over this rather than hard-wired to [`ShmemStreamSink`]/
/// [`ShmemStreamSource`], so the same worker logic drives both a real
/// shared-memory deployment and an in-process test double.
pub trait RingFactory {
    fn server_channels(&mut self, route_id: u64, read_stream_id: u64, write_stream_id: u64) -> ConnChannels;
    fn client_channels(&mut self, route_id: u64, read_stream_id: u64, write_stream_id: u64) -> ConnChannels;
}

/// Test/single-binary [`RingFactory`]: every channel is an [`InMemoryRing`],
/// and a clone of each is retained so a test can act as "the application"
/// on the other end without touching the worker's internals.
#[derive(Default)]
pub struct InMemoryRingFactory {
    pub views: std::collections::HashMap<u64, InMemoryConnView>,
}

/// The application-facing handles for one connection: clones of the same
/// queues the worker holds, so a test can feed/inspect both directions.
#[derive(Clone)]
pub struct InMemoryConnView {
    /// What the application receives from the network (BEGIN/DATA/END/ABORT).
    pub from_network: InMemoryRing,
    /// What the application sends to pace the network read (WINDOW/RESET).
    pub to_network_throttle: InMemoryRing,
    /// What the application sends to be written to the network.
    pub to_network: InMemoryRing,
    /// What the application receives to pace its own sends (WINDOW/RESET).
    pub from_network_throttle: InMemoryRing,
}

impl InMemoryRingFactory {
    fn make(&mut self, read_stream_id: u64) -> ConnChannels {
        let from_network = InMemoryRing::new();
        let to_network_throttle = InMemoryRing::new();
        let to_network = InMemoryRing::new();
        let from_network_throttle = InMemoryRing::new();
        self.views.insert(
            read_stream_id,
            InMemoryConnView {
                from_network: from_network.clone(),
                to_network_throttle: to_network_throttle.clone(),
                to_network: to_network.clone(),
                from_network_throttle: from_network_throttle.clone(),
            },
        );
        ConnChannels {
            read_forward: Box::new(from_network),
            read_throttle: Box::new(to_network_throttle),
            write_forward: Box::new(to_network),
            write_throttle: Box::new(from_network_throttle),
        }
    }
}

impl RingFactory for InMemoryRingFactory {
    fn server_channels(&mut self, _route_id: u64, read_stream_id: u64, _write_stream_id: u64) -> ConnChannels {
        self.make(read_stream_id)
    }

    fn client_channels(&mut self, _route_id: u64, read_stream_id: u64, _write_stream_id: u64) -> ConnChannels {
        self.make(read_stream_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_ring_is_fifo() {
        let mut ring = InMemoryRing::new();
        ring.send(&StreamMessage::Reset { stream_id: 1 }).unwrap();
        ring.send(&StreamMessage::Reset { stream_id: 2 }).unwrap();
        assert_eq!(ring.try_recv().unwrap(), Some(StreamMessage::Reset { stream_id: 1 }));
        assert_eq!(ring.try_recv().unwrap(), Some(StreamMessage::Reset { stream_id: 2 }));
        assert_eq!(ring.try_recv().unwrap(), None);
    }
}
