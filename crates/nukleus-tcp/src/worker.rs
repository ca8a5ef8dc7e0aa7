//! The single-threaded cooperative event loop (§5) that owns every other
//! piece: [`Poller`], [`Acceptor`], [`Connector`], the route table, the
//! connection table, and the correlation map. A flat `Vec<(Token, _)>` token
//! table is scanned linearly rather than a hash map, one non-blocking poll
//! runs per tick, and `thread_boot` sets affinity/priority before entering
//! the loop.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration as StdDuration,
};

use mio::Token;
use nukleus_utils::{ThreadPriority, thread_boot};
use tracing::{debug, info, warn};

use crate::{
    acceptor::Acceptor,
    config::TcpConfig,
    connection::{ConnOutcome, Connection},
    connector::{ConnectOutcome, Connector},
    control::{ControlCommand, ControlResponse, RouteCommand, RouteTable, UnrouteCommand},
    counters::TcpCounters,
    errors::TcpWorkerError,
    poller::Poller,
    rings::{ConnChannels, RingFactory, StreamSink},
    route::Role,
    stream_factory::{ClientStreamFactory, CorrelationMap, ServerStreamFactory, StreamIdAllocator},
};

const ACCEPTOR_TOKEN_BASE: usize = 0;
const CONNECTOR_TOKEN_BASE: usize = 1 << 20;
const CONNECTION_TOKEN_BASE: usize = 2 << 20;

/// The worker thread's single cooperative run loop plus every table it
/// drives during a tick. Generic over [`RingFactory`] so the same logic
/// drives both a shared-memory deployment and the in-process test double.
pub struct TcpWorker<R: RingFactory> {
    config: TcpConfig,
    poller: Poller,
    acceptor: Acceptor,
    connector: Connector,
    routes: RouteTable,
    ring_factory: R,
    connections: Vec<(Token, Connection)>,
    correlations: CorrelationMap,
    ids: StreamIdAllocator,
    counters: TcpCounters,
    scratch: Vec<u8>,
    next_connection_token: usize,
    stop: Arc<AtomicBool>,
}

impl<R: RingFactory> TcpWorker<R> {
    pub fn new(config: TcpConfig, ring_factory: R) -> Result<Self, TcpWorkerError> {
        config.validate()?;
        let scratch = vec![0u8; config.max_message_length];
        let counters = TcpCounters::new_in_memory(config.counter_values_buffer_capacity);
        Ok(Self {
            poller: Poller::new(1024)?,
            acceptor: Acceptor::new(ACCEPTOR_TOKEN_BASE),
            connector: Connector::new(CONNECTOR_TOKEN_BASE, config.reconnect_interval, config.connect_retry_budget),
            routes: RouteTable::new(),
            ring_factory,
            connections: Vec::new(),
            correlations: CorrelationMap::new(),
            ids: StreamIdAllocator::new(),
            counters,
            scratch,
            next_connection_token: CONNECTION_TOKEN_BASE,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn counters(&self) -> &TcpCounters {
        &self.counters
    }

    /// Mutable access to the same counters, e.g. for callers that need
    /// [`TcpCounters::value`] (which lazily allocates a slot on first query
    /// and so needs `&mut`).
    pub fn counters_mut(&mut self) -> &mut TcpCounters {
        &mut self.counters
    }

    pub fn open_connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The ring factory this worker was built with, e.g. to reach an
    /// [`crate::rings::InMemoryRingFactory`]'s per-connection views from a
    /// test harness acting as "the application" on the other end of the
    /// rings.
    pub fn ring_factory(&self) -> &R {
        &self.ring_factory
    }

    fn alloc_connection_token(&mut self) -> Token {
        let t = Token(self.next_connection_token);
        self.next_connection_token += 1;
        t
    }

    // ---- control plane -------------------------------------------------------------

    pub fn apply(&mut self, cmd: ControlCommand) -> ControlResponse {
        match cmd {
            ControlCommand::Route(route_cmd) => self.route(route_cmd),
            ControlCommand::Unroute(unroute_cmd) => self.unroute(unroute_cmd),
        }
    }

    fn route(&mut self, mut cmd: RouteCommand) -> ControlResponse {
        if cmd.role == Role::Server {
            let saturated = self.counters.open_connections() >= self.config.max_connections as u64;
            match self.acceptor.bind(&self.poller, cmd.local_address, saturated) {
                // A port-0 route binds to whatever the OS hands back; accepted
                // connections are matched against that real address, not the
                // ephemeral-port request, so the route must remember it too.
                Ok((_token, bound_addr)) => cmd.local_address = bound_addr,
                Err(err) => {
                    warn!(?err, addr = ?cmd.local_address, "tcp: failed to bind listener");
                    return ControlResponse::Rejected { correlation_id: cmd.correlation_id };
                }
            }
        }
        let route_id = self.routes.insert(&cmd);
        info!(route_id, role = ?cmd.role, addr = ?cmd.local_address, "tcp: route installed");
        ControlResponse::Routed { correlation_id: cmd.correlation_id, route_id }
    }

    /// The live local address bound for `route_id`, if any (useful for
    /// callers that routed a server role at an ephemeral port and need to
    /// learn what the OS actually assigned).
    pub fn route_local_address(&self, route_id: u64) -> Option<SocketAddr> {
        self.routes.get(route_id).map(|r| r.local_address)
    }

    fn unroute(&mut self, cmd: UnrouteCommand) -> ControlResponse {
        match self.routes.remove(cmd.route_id) {
            Ok(Some(addr)) => {
                self.acceptor.unbind(&self.poller, addr);
                ControlResponse::Unrouted { correlation_id: cmd.correlation_id }
            }
            Ok(None) => ControlResponse::Unrouted { correlation_id: cmd.correlation_id },
            Err(_) => ControlResponse::Rejected { correlation_id: cmd.correlation_id },
        }
    }

    /// Initiates an outbound connect for a client-role stream (§4.5). The
    /// application owns `correlationId` elsewhere; here it is realized as
    /// the minted `readStreamId`, which the connector threads through to
    /// [`Connector::finish_connect`] so the reply BEGIN lands on the right
    /// channel once the connect resolves.
    pub fn connect_client_stream(&mut self, route_id: u64, target_addr: SocketAddr) -> Result<Token, TcpWorkerError> {
        let (read_stream_id, write_stream_id) = self.ids.alloc_pair();
        let token = self
            .connector
            .connect(&self.poller, target_addr, read_stream_id)
            .map_err(TcpWorkerError::Io)?;
        self.correlations.insert(
            read_stream_id,
            crate::stream_factory::PendingCorrelation {
                route_id,
                read_stream_id,
                write_stream_id,
                local_addr: target_addr,
                peer_addr: target_addr,
            },
        );
        Ok(token)
    }

    // ---- run loop --------------------------------------------------------------------

    /// Boots thread affinity/priority (best-effort) then runs [`Self::tick`]
    /// until the stop flag is observed.
    pub fn run(&mut self, core: Option<usize>, priority: ThreadPriority, tick_timeout: StdDuration) {
        thread_boot(core, priority);
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(err) = self.tick(Some(tick_timeout)) {
                warn!(?err, "tcp: tick failed");
            }
        }
    }

    /// Runs one iteration: poll readiness, dispatch, drain application-side
    /// rings, retry due connects. Returns the number of work units
    /// processed (used for utilization sampling per §5).
    pub fn tick(&mut self, timeout: Option<StdDuration>) -> io::Result<usize> {
        let mut work = self.poll_sockets(timeout)?;
        work += self.pump_rings();
        self.retry_connects();
        Ok(work)
    }

    fn poll_sockets(&mut self, timeout: Option<StdDuration>) -> io::Result<usize> {
        let Self {
            poller,
            acceptor,
            connector,
            connections,
            counters,
            scratch,
            routes,
            ring_factory,
            ids,
            correlations,
            next_connection_token,
            config,
            ..
        } = self;
        poller.tick(timeout, |readiness| {
            Self::dispatch(
                readiness.token,
                readiness.readable,
                readiness.writable,
                poller,
                acceptor,
                connector,
                connections,
                counters,
                scratch,
                routes,
                ring_factory,
                ids,
                correlations,
                next_connection_token,
                config,
            )
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        token: Token,
        readable: bool,
        writable: bool,
        poller: &Poller,
        acceptor: &mut Acceptor,
        connector: &mut Connector,
        connections: &mut Vec<(Token, Connection)>,
        counters: &mut TcpCounters,
        scratch: &mut [u8],
        routes: &RouteTable,
        ring_factory: &mut R,
        ids: &mut StreamIdAllocator,
        correlations: &mut CorrelationMap,
        next_connection_token: &mut usize,
        config: &TcpConfig,
    ) -> usize {
        if acceptor.is_listener(token) {
            let mut accepted: Option<(mio::net::TcpStream, SocketAddr, SocketAddr, u64)> = None;
            let work = acceptor.accept_ready(token, |stream, local_addr, peer_addr| {
                match routes.server_routes_at(local_addr).find(|r| r.accepts_remote(peer_addr)) {
                    Some(route) => accepted = Some((stream, local_addr, peer_addr, route.route_id)),
                    None => {
                        debug!(?local_addr, ?peer_addr, "tcp: no route matched accepted connection");
                        let mut stream = stream;
                        let _ = stream.set_linger(Some(StdDuration::ZERO));
                    }
                }
            });
            if let Some((stream, local_addr, peer_addr, route_id)) = accepted {
                Self::accept_connection(
                    poller,
                    route_id,
                    stream,
                    local_addr,
                    peer_addr,
                    ids,
                    ring_factory,
                    connections,
                    counters,
                    next_connection_token,
                    config,
                );
            }
            return work;
        }

        if connector.is_pending(token) {
            if let Some(outcome) = connector.finish_connect(token) {
                Self::handle_connect_outcome(
                    poller,
                    outcome,
                    correlations,
                    ring_factory,
                    connections,
                    counters,
                    next_connection_token,
                    config,
                );
            }
            return 1;
        }

        let Some(pos) = connections.iter().position(|(t, _)| *t == token) else {
            return 0;
        };
        let mut work = 0;
        if readable {
            work += 1;
            if connections[pos].1.on_readable(scratch, counters) == ConnOutcome::Closed {
                connections.swap_remove(pos);
                return work;
            }
        }
        if writable {
            work += 1;
            if connections[pos].1.on_writable(counters) == ConnOutcome::Closed {
                connections.swap_remove(pos);
                return work;
            }
        }
        let _ = connections[pos].1.sync_interest(poller);
        work
    }

    #[allow(clippy::too_many_arguments)]
    fn accept_connection(
        poller: &Poller,
        route_id: u64,
        mut stream: mio::net::TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        ids: &mut StreamIdAllocator,
        ring_factory: &mut R,
        connections: &mut Vec<(Token, Connection)>,
        counters: &mut TcpCounters,
        next_connection_token: &mut usize,
        config: &TcpConfig,
    ) {
        let (read_stream_id, write_stream_id) = ids.alloc_pair();
        let ConnChannels { mut read_forward, read_throttle, write_forward, write_throttle } =
            ring_factory.server_channels(route_id, read_stream_id, write_stream_id);

        if let Err(err) = ServerStreamFactory::begin_accept(
            route_id,
            read_stream_id,
            write_stream_id,
            local_addr,
            peer_addr,
            read_forward.as_mut(),
        ) {
            warn!(?err, "tcp: failed to encode BEGIN for accept");
            let _ = stream.set_linger(Some(StdDuration::ZERO));
            return;
        }

        let token = Token(*next_connection_token);
        *next_connection_token += 1;
        // Uncorrelated until the application's reply BEGIN arrives on
        // `write_forward` (§4.6); see `Connection::mark_correlated`.
        let mut conn = Connection::new(
            token,
            route_id,
            stream,
            local_addr,
            peer_addr,
            read_stream_id,
            write_stream_id,
            config.window_size,
            config.window_padding,
            0,
            config.window_padding.max(0) as u16,
            false,
            read_forward,
            read_throttle,
            write_forward,
            write_throttle,
        );
        if let Err(err) = conn.register(poller) {
            warn!(?err, "tcp: failed to register accepted socket");
            return;
        }
        counters.incr_connections_opened();
        connections.push((token, conn));
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_connect_outcome(
        poller: &Poller,
        outcome: ConnectOutcome,
        correlations: &mut CorrelationMap,
        ring_factory: &mut R,
        connections: &mut Vec<(Token, Connection)>,
        counters: &mut TcpCounters,
        next_connection_token: &mut usize,
        config: &TcpConfig,
    ) {
        match outcome {
            ConnectOutcome::Established { token: _, correlation_id, stream, local_addr } => {
                let Some(pending) = correlations.remove(correlation_id) else {
                    warn!(correlation_id, "tcp: connect completed with no pending correlation, dropping");
                    return;
                };
                let peer_addr = stream.peer_addr().unwrap_or(pending.peer_addr);
                let ConnChannels { mut read_forward, read_throttle, write_forward, write_throttle } = ring_factory
                    .client_channels(pending.route_id, pending.read_stream_id, pending.write_stream_id);
                if let Err(err) = ClientStreamFactory::begin_reply(
                    correlation_id,
                    pending.read_stream_id,
                    local_addr,
                    peer_addr,
                    read_forward.as_mut(),
                ) {
                    warn!(?err, "tcp: failed to encode reply BEGIN for outbound connect");
                    return;
                }
                let token = Token(*next_connection_token);
                *next_connection_token += 1;
                // Correlated from the start: the application already
                // supplied its BEGIN before the connect was initiated
                // (§4.5), so there is no separate reply BEGIN to wait for.
                let mut conn = Connection::new(
                    token,
                    pending.route_id,
                    stream,
                    local_addr,
                    peer_addr,
                    pending.read_stream_id,
                    pending.write_stream_id,
                    config.window_size,
                    config.window_padding,
                    0,
                    config.window_padding.max(0) as u16,
                    true,
                    read_forward,
                    read_throttle,
                    write_forward,
                    write_throttle,
                );
                if let Err(err) = conn.register(poller) {
                    warn!(?err, "tcp: failed to register outbound socket");
                    return;
                }
                counters.incr_connections_opened();
                connections.push((token, conn));
            }
            ConnectOutcome::Failed { correlation_id } => {
                correlations.remove(correlation_id);
                warn!(correlation_id, "tcp: outbound connect exhausted its retry budget");
            }
        }
    }

    fn pump_rings(&mut self) -> usize {
        let mut work = 0;
        let mut i = 0;
        while i < self.connections.len() {
            let outcome_a = self.connections[i].1.pump_read_throttle(&mut self.scratch, &mut self.counters);
            let outcome_b = if outcome_a == ConnOutcome::Alive {
                self.connections[i].1.pump_write_forward(&mut self.counters)
            } else {
                ConnOutcome::Closed
            };
            if outcome_a == ConnOutcome::Closed || outcome_b == ConnOutcome::Closed {
                self.connections.swap_remove(i);
                work += 1;
                continue;
            }
            let _ = self.connections[i].1.sync_interest(&self.poller);
            work += 1;
            i += 1;
        }
        let open = self.counters.open_connections();
        if open < self.config.max_connections as u64 {
            self.acceptor.rearm(&self.poller);
        } else {
            self.acceptor.saturate(&self.poller);
        }
        work
    }

    fn retry_connects(&mut self) {
        for outcome in self.connector.retry_due(&self.poller) {
            if let ConnectOutcome::Failed { correlation_id } = outcome {
                warn!(correlation_id, "tcp: dropping pending client BEGIN, retries exhausted");
                self.correlations.remove(correlation_id);
            }
        }
    }
}
