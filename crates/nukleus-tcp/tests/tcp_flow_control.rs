//! End-to-end scenario 2: a window smaller than the client's write forces
//! the worker to split it across several DATA frames, each gated by a fresh
//! WINDOW grant from the consumer.

use std::{
    io::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream as StdTcpStream},
    time::{Duration, Instant},
};

use nukleus_tcp::{
    ControlCommand, ControlResponse, InMemoryRingFactory, RingFactory, Role, RouteCommand,
    StreamMessage, StreamSink, StreamSource, TcpConfig, TcpWorker,
};

fn loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
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
fn narrow_window_splits_data_into_window_sized_frames() {
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
    let bound_addr = worker.route_local_address(route_id).expect("route was just installed");

    let mut client = StdTcpStream::connect(bound_addr).unwrap();
    tick_until(&mut worker, Duration::from_secs(2), |w| w.open_connection_count() == 1);

    let view = worker.ring_factory().views.values().next().cloned().unwrap();
    let mut from_network = view.from_network;
    let mut to_network_throttle = view.to_network_throttle;

    let stream_id = match from_network.try_recv().unwrap() {
        Some(StreamMessage::Begin { stream_id, .. }) => stream_id,
        other => panic!("expected BEGIN, got {other:?}"),
    };

    const MSG: &[u8] = b"hello world";
    const WINDOW: i32 = 6;

    client.write_all(MSG).unwrap();

    let mut received = Vec::new();
    while received.len() < MSG.len() {
        to_network_throttle
            .send(&StreamMessage::Window { stream_id, credit: WINDOW, padding: 0, group_id: 0 })
            .unwrap();

        let payload = loop {
            match from_network.try_recv().unwrap() {
                Some(StreamMessage::Data { payload, .. }) => break payload,
                Some(other) => panic!("unexpected frame: {other:?}"),
                None => {
                    worker.tick(Some(Duration::from_millis(50))).unwrap();
                }
            }
        };
        assert!(payload.len() <= WINDOW as usize, "DATA exceeded the granted window");
        received.extend_from_slice(&payload);
    }

    assert_eq!(received, MSG);
}
