//! End-to-end scenario 5: once `maxConnections` live sockets are open, a
//! further connect attempt is not accepted; once the application aborts one
//! of the existing streams, a new connect succeeds within bounded polling.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream as StdTcpStream},
    time::{Duration, Instant},
};

use nukleus_tcp::{
    ControlCommand, ControlResponse, InMemoryRingFactory, RingFactory, Role, RouteCommand,
    StreamMessage, StreamSink, TcpConfig, TcpWorker,
};

fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

fn tick_for<R: RingFactory>(worker: &mut TcpWorker<R>, total: Duration) {
    let start = Instant::now();
    while start.elapsed() < total {
        worker.tick(Some(Duration::from_millis(20))).unwrap();
    }
}

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
fn a_fourth_connect_is_rejected_until_the_app_aborts_one_of_three() {
    let config = TcpConfig::builder().max_connections(3).build().unwrap();
    let mut worker = TcpWorker::new(config, InMemoryRingFactory::default()).unwrap();

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

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(StdTcpStream::connect(bound_addr).unwrap());
        tick_until(&mut worker, Duration::from_secs(2), |w| {
            w.open_connection_count() == clients.len()
        });
    }
    assert_eq!(worker.open_connection_count(), 3);
    assert_eq!(worker.counters().open_connections(), 3);

    // The listener should now be disarmed: a fourth connect is never
    // surfaced as an accepted connection while the cap holds.
    let fourth = StdTcpStream::connect(bound_addr);
    tick_for(&mut worker, Duration::from_millis(200));
    assert_eq!(worker.open_connection_count(), 3, "cap must not be exceeded");
    drop(fourth);

    // The application aborts one of the three streams, freeing a slot.
    let mut to_network = worker.ring_factory().views.values().next().unwrap().to_network.clone();
    to_network
        .send(&StreamMessage::Abort { stream_id: 0, authorization: 0, extension: Vec::new() })
        .unwrap();
    tick_until(&mut worker, Duration::from_secs(2), |w| w.open_connection_count() == 2);
    assert_eq!(worker.counters().connections_closed(), 1);

    let retry = StdTcpStream::connect(bound_addr).unwrap();
    tick_until(&mut worker, Duration::from_secs(2), |w| w.open_connection_count() == 3);
    drop(retry);
}
