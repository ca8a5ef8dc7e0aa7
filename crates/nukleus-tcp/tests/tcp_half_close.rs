//! End-to-end scenario 3: the client shuts down its write half after sending
//! data. The server-read stream sees END right after the DATA, but the
//! socket only fully closes once the reply stream is also ended.

use std::{
    io::Write,
    net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpStream as StdTcpStream},
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
fn shutdown_output_yields_end_after_data_then_waits_for_reply_end() {
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
    let mut to_network = view.to_network;

    let read_stream_id = match from_network.try_recv().unwrap() {
        Some(StreamMessage::Begin { stream_id, .. }) => stream_id,
        other => panic!("expected BEGIN, got {other:?}"),
    };

    to_network_throttle
        .send(&StreamMessage::Window { stream_id: read_stream_id, credit: 64, padding: 0, group_id: 0 })
        .unwrap();

    client.write_all(b"client data").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let payload = loop {
        match from_network.try_recv().unwrap() {
            Some(StreamMessage::Data { payload, .. }) => break payload,
            Some(other) => panic!("unexpected frame before DATA: {other:?}"),
            None => worker.tick(Some(Duration::from_millis(50))).unwrap(),
        };
    };
    assert_eq!(payload, b"client data");

    // END must follow the DATA, and the connection is still open: the reply
    // stream hasn't ended yet, so the socket stays half-open.
    let ended = loop {
        match from_network.try_recv().unwrap() {
            Some(StreamMessage::End { .. }) => break true,
            Some(other) => panic!("expected END, got {other:?}"),
            None => {
                worker.tick(Some(Duration::from_millis(50))).unwrap();
                if worker.open_connection_count() == 0 {
                    break false;
                }
            }
        }
    };
    assert!(ended, "expected END on the server-read stream");
    assert_eq!(worker.open_connection_count(), 1, "socket stays half-open until reply END");

    // The application still replies on the write-forward direction with
    // some data of its own, then ends its own stream. Only now does the
    // socket fully close.
    let write_stream_id = read_stream_id;
    to_network
        .send(&StreamMessage::Data {
            stream_id: write_stream_id,
            authorization: 0,
            flags: 0,
            group_id: 0,
            padding: 0,
            payload: b"reply".to_vec(),
            extension: Vec::new(),
        })
        .unwrap();
    to_network.send(&StreamMessage::End { stream_id: write_stream_id, authorization: 0, extension: Vec::new() }).unwrap();

    tick_until(&mut worker, Duration::from_secs(2), |w| w.open_connection_count() == 0);
}
