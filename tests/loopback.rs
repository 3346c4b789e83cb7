//! Both sides of a connection on two threads of this process, talking over
//! localhost TCP and one shared software fabric.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rcpair::bench::{self, MSG, RDMA_READ_MSG, RDMA_WRITE_MSG};
use rcpair::ctrl::{self, Channel, ConnMeta, MetadataError};
use rcpair::rdma::context::DeviceError;
use rcpair::rdma::cq::{Backoff, CompletionError, WcStatus};
use rcpair::rdma::provider::Verb;
use rcpair::resources::ResourceStep;
use rcpair::{Config, Error, Gid, Mode, Report, Resources, Role, SoftFabric};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

/// Configuration of the listening side; see [`client_of`].
fn server(mode: Mode, iterations: u32) -> Config {
    Config {
        tcp_port: free_port(),
        mode,
        iterations,
        backoff: Backoff::Yield,
        ..Config::default()
    }
}

fn client_of(server: &Config, mode: Mode) -> Config {
    Config {
        server_name: Some("127.0.0.1".to_owned()),
        mode,
        ..server.clone()
    }
}

/// Run both sides to completion.
fn run_pair(
    server_cfg: Config,
    client_cfg: Config,
) -> (Arc<SoftFabric>, rcpair::Result<Report>, rcpair::Result<Report>) {
    let fabric = Arc::new(SoftFabric::new());
    let server_fabric = fabric.clone();
    let server = thread::spawn(move || bench::run(&server_cfg, server_fabric));
    let client = bench::run(&client_cfg, fabric.clone());
    let server = server.join().unwrap();
    (fabric, server, client)
}

/// An established channel pair.
fn channels() -> (Channel, Channel) {
    let port = free_port();
    let listener = thread::spawn(move || Channel::listen(port).unwrap());
    let connector = Channel::connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
    (listener.join().unwrap(), connector)
}

#[test]
fn send_receive_once() {
    let server_cfg = server(Mode::Receive, 1);
    let client_cfg = client_of(&server_cfg, Mode::Send);
    let (fabric, server, client) = run_pair(server_cfg, client_cfg);

    let server = server.unwrap();
    let client = client.unwrap();
    assert_eq!(server.role, Role::Server);
    assert_eq!(client.role, Role::Client);
    assert_eq!(server.iterations, 1);
    assert_eq!(client.iterations, 1);
    assert_eq!(server.message(), MSG);
    assert_eq!((fabric.posted(), fabric.polled()), (2, 2));
    assert_eq!(fabric.live_resources(), 0);
}

#[test]
fn send_receive_many_times_either_way() {
    let server_cfg = server(Mode::Send, 7);
    let client_cfg = client_of(&server_cfg, Mode::Receive);
    let (fabric, server, client) = run_pair(server_cfg, client_cfg);

    let client = client.unwrap();
    assert_eq!(server.unwrap().iterations, 7);
    assert_eq!(client.iterations, 7);
    assert_eq!(client.message(), MSG);
    assert_eq!(fabric.live_resources(), 0);
}

#[test]
fn zero_iterations_only_connect() {
    let server_cfg = server(Mode::Receive, 0);
    let client_cfg = client_of(&server_cfg, Mode::Send);
    let (fabric, server, client) = run_pair(server_cfg, client_cfg);

    let server = server.unwrap();
    assert_eq!(server.iterations, 0);
    assert_eq!(client.unwrap().iterations, 0);
    assert!(server.buffer.iter().all(|&b| b == 0));
    assert_eq!(fabric.live_resources(), 0);
}

#[test]
fn rdma_write() {
    let server_cfg = server(Mode::Write, 3);
    let client_cfg = client_of(&server_cfg, Mode::Write);
    let (fabric, server, client) = run_pair(server_cfg, client_cfg);

    let server = server.unwrap();
    assert_eq!(server.iterations, 0);
    assert_eq!(server.message(), RDMA_WRITE_MSG);
    assert_eq!(client.unwrap().iterations, 3);
    // Every work request and completion on the fabric is the client's.
    assert_eq!((fabric.posted(), fabric.polled()), (3, 3));
    assert_eq!(fabric.live_resources(), 0);
}

#[test]
fn rdma_write_past_the_peer_buffer() {
    let server_cfg = server(Mode::Write, 1);
    let client_cfg = Config {
        msg_size: server_cfg.msg_size * 2,
        ..client_of(&server_cfg, Mode::Write)
    };
    let (fabric, _, client) = run_pair(server_cfg, client_cfg);

    match client {
        Err(Error::Completion(CompletionError::Status { status, code, .. })) => {
            assert_eq!((status, code), (WcStatus::RemAccessErr, 10))
        }
        other => panic!("expected a remote access error, got {:?}", other),
    }
    assert_eq!(fabric.live_resources(), 0);
}

#[test]
fn rdma_read() {
    let server_cfg = server(Mode::Read, 2);
    let client_cfg = client_of(&server_cfg, Mode::Read);
    let (fabric, server, client) = run_pair(server_cfg, client_cfg);

    let client = client.unwrap();
    assert_eq!(server.unwrap().iterations, 0);
    assert_eq!(client.iterations, 2);
    assert_eq!(client.message(), RDMA_READ_MSG);
    assert_eq!((fabric.posted(), fabric.polled()), (2, 2));
    assert_eq!(fabric.live_resources(), 0);
}

#[test]
fn gid_addressing() {
    let server_cfg = Config {
        gid_idx: Some(0),
        ..server(Mode::Write, 1)
    };
    let client_cfg = client_of(&server_cfg, Mode::Write);
    let (_, server, client) = run_pair(server_cfg, client_cfg);

    assert_eq!(server.unwrap().message(), RDMA_WRITE_MSG);
    client.unwrap();
}

#[test]
fn bad_gid_index_fails_both_sides() {
    let server_cfg = Config {
        gid_idx: Some(5),
        ..server(Mode::Receive, 1)
    };
    let client_cfg = Config {
        gid_idx: Some(0),
        ..client_of(&server_cfg, Mode::Send)
    };
    let (fabric, server, client) = run_pair(server_cfg, client_cfg);

    assert!(matches!(
        server,
        Err(Error::Device(DeviceError::QueryGid { index: 5, .. }))
    ));
    assert!(matches!(client, Err(Error::Channel(_))));
    assert_eq!(fabric.live_resources(), 0);
}

#[test]
fn poll_times_out_when_peer_never_posts() {
    let server_cfg = Config {
        poll_timeout_ms: 100,
        ..server(Mode::Receive, 1)
    };
    let client_cfg = client_of(&server_cfg, Mode::Receive);
    let (fabric, server, client) = run_pair(server_cfg, client_cfg);

    for res in [server, client] {
        match res {
            Err(Error::Completion(CompletionError::Timeout { timeout, .. })) => {
                assert_eq!(timeout, Duration::from_millis(100))
            }
            other => panic!("expected a poll timeout, got {:?}", other),
        }
    }
    assert_eq!(fabric.live_resources(), 0);
}

#[test]
fn create_failures_release_everything() {
    let cases = [
        (Verb::OpenDevice, "open"),
        (Verb::QueryPort, "query port"),
        (Verb::AllocPd, "alloc pd"),
        (Verb::CreateCq, "create cq"),
        (Verb::RegMr, "reg mr"),
        (Verb::CreateQp, "create qp"),
    ];
    for (verb, what) in cases {
        let fabric = Arc::new(SoftFabric::new());
        let (channel, _peer) = channels();
        fabric.fail_next(verb, libc::ENOMEM);

        let err = Resources::with_channel(channel, &Config::default(), fabric.clone()).unwrap_err();
        let step = match &err {
            Error::Resource { step, source } => {
                assert_eq!(source.raw_os_error(), Some(libc::ENOMEM));
                Some(*step)
            }
            Error::Device(DeviceError::Open { .. }) | Error::Device(DeviceError::QueryPort { .. }) => None,
            other => panic!("{}: unexpected error {:?}", what, other),
        };
        let expected = match verb {
            Verb::AllocPd => Some(ResourceStep::AllocPd),
            Verb::CreateCq => Some(ResourceStep::CreateCq),
            Verb::RegMr => Some(ResourceStep::RegMr),
            Verb::CreateQp => Some(ResourceStep::CreateQp),
            _ => None,
        };
        assert_eq!(step, expected, "{}", what);
        assert_eq!(fabric.live_resources(), 0, "{}", what);
    }
}

#[test]
fn missing_device() {
    let fabric = Arc::new(SoftFabric::new());
    let (channel, _peer) = channels();
    let cfg = Config {
        dev_name: Some("mlx5_9".to_owned()),
        ..Config::default()
    };
    let err = Resources::with_channel(channel, &cfg, fabric.clone()).unwrap_err();
    assert!(matches!(err, Error::Device(DeviceError::NotFound(Some(ref name))) if name == "mlx5_9"));
    assert_eq!(fabric.live_resources(), 0);
}

#[test]
fn teardown_goes_on_after_failures() {
    let fabric = Arc::new(SoftFabric::new());
    let (channel, _peer) = channels();
    let res = Resources::with_channel(channel, &Config::default(), fabric.clone()).unwrap();
    assert_eq!(fabric.live_resources(), 5);

    // The QP stays, so its CQ, PD and device are still busy.
    fabric.fail_next(Verb::DestroyQp, libc::EIO);
    let err = res.destroy().unwrap_err();
    assert_eq!(err.step, "destroy QP");
    assert_eq!(err.failures, 4);
    assert_eq!(err.source.raw_os_error(), Some(libc::EIO));
    assert_eq!(fabric.live_resources(), 4);
}

#[test]
fn peer_metadata_is_validated() {
    let fabric = Arc::new(SoftFabric::new());
    let (channel, mut peer) = channels();
    let cfg = Config::default();
    let mut res = Resources::with_channel(channel, &cfg, fabric.clone()).unwrap();

    let fake = thread::spawn(move || {
        let bogus = ConnMeta {
            addr: 0x1000,
            rkey: 1,
            qp_num: 0,
            lid: 1,
            gid: Gid::ZERO,
        };
        peer.exchange(&bogus).unwrap()
    });
    let err = ctrl::connect(&mut res, &cfg).unwrap_err();
    assert!(matches!(err, Error::Metadata(MetadataError::ZeroQpn)));

    let ours = fake.join().unwrap();
    assert_eq!(ours.qp_num, res.qp().qp_num());
    assert_eq!(ours.lid, res.context().lid());
    assert!(ours.gid.is_zero());
    assert!(res.remote().is_none());

    res.destroy().unwrap();
    assert_eq!(fabric.live_resources(), 0);
}
