//! End-to-end scenario 1: a client writes bytes on a plain `TcpStream`, the
//! worker's server route picks it up, and the application side of the rings
//! (here, an [`InMemoryRingFactory`] view) receives exactly those bytes on
//! one DATA frame.

use std::{
    io::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream as StdTcpStream},
    time::{Duration, Instant},
};

use nukleus_tcp::{
    ControlCommand, ControlResponse, CounterKind, InMemoryRingFactory, RingFactory, Role,
    RouteCommand, StreamMessage, StreamSink, StreamSource, TcpConfig, TcpWorker,
};

fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

/// Ticks `worker` until `done` is satisfied or `deadline` passes, mirroring
/// the short-sleep polling loops used against a real poller elsewhere in
/// this crate.
fn tick_until<R: RingFactory>(
    worker: &mut TcpWorker<R>,
    deadline: Duration,
    mut done: impl FnMut(&TcpWorker<R>) -> bool,
) {
    let start = Instant::now();
    while !done(worker) {
        worker.tick(Some(Duration::from_millis(20))).unwrap();
        assert!(start.elapsed() < deadline, "condition never became true");
    }
}

#[test]
fn client_sends_hello_server_app_receives_exactly_hello() {
    let mut worker = TcpWorker::new(TcpConfig::default(), InMemoryRingFactory::default()).unwrap();

    let route_id = match worker.apply(ControlCommand::Route(RouteCommand {
        correlation_id: 1,
        role: Role::Server,
        local_address: loopback(),
        remote_address: None,
        authorization: 0,
    })) {
        ControlResponse::Routed { route_id, .. } => route_id,
        other => panic!("expected Routed, got {other:?}"),
    };
    let bound_addr = worker.route_local_address(route_id).unwrap();

    let mut client = StdTcpStream::connect(bound_addr).unwrap();

    tick_until(&mut worker, Duration::from_secs(2), |w| w.open_connection_count() == 1);

    let view = worker.ring_factory().views.values().next().cloned().unwrap();
    let mut from_network = view.from_network;
    let mut to_network_throttle = view.to_network_throttle;

    let stream_id = match from_network.try_recv().unwrap() {
        Some(StreamMessage::Begin { stream_id, .. }) => stream_id,
        other => panic!("expected BEGIN, got {other:?}"),
    };

    // Initial window 64, no padding, per the scenario.
    to_network_throttle
        .send(&StreamMessage::Window { stream_id, credit: 64, padding: 0, group_id: 0 })
        .unwrap();

    client.write_all(b"hello").unwrap();

    let payload = loop {
        match from_network.try_recv().unwrap() {
            Some(StreamMessage::Data { payload, .. }) => break payload,
            Some(other) => panic!("unexpected frame before DATA: {other:?}"),
            None => {
                worker.tick(Some(Duration::from_millis(50))).unwrap();
            }
        }
    };

    assert_eq!(payload, b"hello");
    assert_eq!(from_network.try_recv().unwrap(), None, "no ABORT/RESET expected");

    assert_eq!(worker.counters_mut().value(route_id, CounterKind::BytesRead), 5);
    assert!(worker.counters_mut().value(route_id, CounterKind::FramesRead) >= 1);
}
