//! TCP bridge core of a reactive messaging runtime: turns kernel TCP byte
//! streams into credit-controlled application streams and back, using
//! shared-memory rings to talk to peer nuklei in the same process.
//!
//! See the module docs on [`worker`] for the event loop that ties the rest
//! of this crate together, and [`connection`] for the per-socket read/write
//! state machine that is the hard part of the whole thing.

pub mod acceptor;
pub mod addr_ext;
pub mod config;
pub mod connection;
pub mod connector;
pub mod control;
pub mod counters;
pub mod errors;
pub mod messages;
pub mod poller;
pub mod read_stream;
pub mod rings;
pub mod route;
pub mod stream_factory;
pub mod worker;
pub mod write_stream;

pub use acceptor::Acceptor;
pub use addr_ext::TcpAddressExtension;
pub use config::{TcpConfig, TcpConfigBuilder};
pub use connection::{ConnOutcome, Connection};
pub use connector::{ConnectOutcome, Connector};
pub use control::{ControlCommand, ControlResponse, RouteCommand, RouteTable, UnrouteCommand};
pub use counters::{CounterKind, TcpCounters};
pub use errors::{ConfigError, RingError, RouteError, TcpWorkerError};
pub use messages::{MessageError, MessageReader, MessageWriter, StreamMessage};
pub use poller::{Poller, Readiness};
pub use read_stream::ReadStream;
pub use rings::{
    ConnChannels, InMemoryConnView, InMemoryRing, InMemoryRingFactory, RingFactory,
    ShmemStreamSink, ShmemStreamSource, StreamSink, StreamSource,
};
pub use route::{Role, Route};
pub use stream_factory::{
    ClientStreamFactory, CorrelationMap, PendingCorrelation, ServerStreamFactory, StreamIdAllocator,
};
pub use worker::TcpWorker;
pub use write_stream::WriteStream;
