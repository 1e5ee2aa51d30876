//! End-to-end scenarios against real OS objects: named pipes for the
//! read/write/cancel cases, loopback TCP sockets for accept/connect.

mod common;

use std::net::Ipv4Addr;

use wincp::{bind_local, CompletionPort, ConnectAddr, Dequeued, IocpError, Overlapped, Value};

use common::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Scenario 1: accept and connect complete independently and each
/// completion's overlapped address matches the originating op's `address`.
#[test]
fn echo_accept_and_connect_both_complete() {
    init_logging();

    let listener = new_tcp_socket(socket2::Domain::IPV4);
    bind_local(raw_socket(&listener), 2).expect("bind listener");
    listener.listen(16).expect("listen");
    let port_no = listener
        .local_addr()
        .expect("local addr")
        .as_socket_ipv4()
        .expect("ipv4 addr")
        .port();

    let port = CompletionPort::create(0).expect("create port");
    // `create_or_associate` returns a second `CompletionPort` value over the
    // same OS handle; forget it so dropping it doesn't close the handle the
    // original `port` still owns.
    std::mem::forget(
        CompletionPort::create_or_associate(raw_socket(&listener) as _, Some(&port), 1, 0)
            .expect("associate listener"),
    );

    let accept_socket = new_tcp_socket(socket2::Domain::IPV4);
    let accept_op = Overlapped::new().expect("accept op");
    accept_op
        .accept(raw_socket(&listener), raw_socket(&accept_socket))
        .expect("start accept");

    let client = new_tcp_socket(socket2::Domain::IPV4);
    bind_local(raw_socket(&client), 2).expect("bind client");
    std::mem::forget(
        CompletionPort::create_or_associate(raw_socket(&client) as _, Some(&port), 2, 0)
            .expect("associate client"),
    );
    let connect_op = Overlapped::new().expect("connect op");
    connect_op
        .connect(
            raw_socket(&client),
            &ConnectAddr::V4 { host: Ipv4Addr::LOCALHOST.to_string(), port: port_no },
        )
        .expect("start connect");

    let mut seen_accept = false;
    let mut seen_connect = false;
    for _ in 0..2 {
        match port.dequeue(5_000).expect("dequeue") {
            Dequeued::Complete { overlapped, .. } => {
                let addr = overlapped as usize;
                if addr == accept_op.address() {
                    seen_accept = true;
                } else if addr == connect_op.address() {
                    seen_connect = true;
                } else {
                    panic!("completion for an unknown overlapped address");
                }
            }
            Dequeued::Timeout => panic!("expected a completion"),
        }
    }
    assert!(seen_accept && seen_connect);

    matches!(accept_op.getresult(false).expect("accept result"), Value::Bytes(_));
    matches!(connect_op.getresult(false).expect("connect result"), Value::Unit);
}

/// Scenario 2: a 64-byte read against a pipe that only ever receives 10
/// bytes completes with a buffer truncated to exactly those 10 bytes.
#[test]
fn short_read_yields_exact_byte_count() {
    init_logging();
    let (server, mut client) = create_pipe_pair("short-read");
    let port = CompletionPort::create_or_associate(server, None, 1, 0).expect("associate pipe");

    write_all(&mut client, b"0123456789");

    let op = Overlapped::new().expect("op");
    op.read_file(server, 64).expect("start read");

    match port.dequeue(5_000).expect("dequeue") {
        Dequeued::Complete { overlapped, .. } => assert_eq!(overlapped as usize, op.address()),
        Dequeued::Timeout => panic!("expected a completion"),
    }
    match op.getresult(false).expect("getresult") {
        Value::Bytes(buf) => assert_eq!(buf.len(), 10),
        other => panic!("expected Bytes, got {other:?}"),
    }

    close_handle(server);
}

/// Scenario 3: cancelling a read against an idle pipe always settles the
/// object cleanly, regardless of which side of the cancel/complete race
/// actually won.
#[test]
fn cancel_against_idle_pipe_settles_cleanly() {
    init_logging();
    let (server, _client) = create_pipe_pair("cancel-race");
    let port = CompletionPort::create_or_associate(server, None, 1, 0).expect("associate pipe");

    let op = Overlapped::new().expect("op");
    op.read_file(server, 64).expect("start read");
    op.cancel().expect("cancel");

    match port.dequeue(5_000).expect("dequeue") {
        Dequeued::Complete { .. } => {}
        Dequeued::Timeout => panic!("expected a completion even for a cancelled op"),
    }
    // Success-with-zero, operation-aborted, or success are all acceptable;
    // the only failure mode worth asserting against is a panic.
    let _ = op.getresult(false);

    close_handle(server);
}

/// Scenario 4: a second submission on an already-pending operation is
/// rejected without disturbing the first, which still completes normally.
#[test]
fn double_submission_is_rejected_original_still_completes() {
    init_logging();
    let (server, mut client) = create_pipe_pair("double-submit");
    let port = CompletionPort::create_or_associate(server, None, 1, 0).expect("associate pipe");

    let op = Overlapped::new().expect("op");
    op.read_file(server, 64).expect("start first read");

    let err = op.read_file(server, 64).unwrap_err();
    assert!(matches!(err, IocpError::AlreadyAttempted));

    write_all(&mut client, b"hello");
    match port.dequeue(5_000).expect("dequeue") {
        Dequeued::Complete { .. } => {}
        Dequeued::Timeout => panic!("expected the original read to complete"),
    }
    match op.getresult(false).expect("getresult") {
        Value::Bytes(buf) => assert_eq!(&buf, b"hello"),
        other => panic!("expected Bytes, got {other:?}"),
    }

    close_handle(server);
}

/// Scenario 5: a numeric IPv6 loopback connect succeeds.
#[test]
fn connect_to_v6_loopback_succeeds() {
    init_logging();
    let listener = new_tcp_socket(socket2::Domain::IPV6);
    bind_local(raw_socket(&listener), 4).expect("bind v6 listener");
    listener.listen(16).expect("listen");
    let port_no = listener
        .local_addr()
        .expect("local addr")
        .as_socket_ipv6()
        .expect("ipv6 addr")
        .port();

    let port = CompletionPort::create(0).expect("create port");
    std::mem::forget(
        CompletionPort::create_or_associate(raw_socket(&listener) as _, Some(&port), 1, 0)
            .expect("associate listener"),
    );
    let accept_socket = new_tcp_socket(socket2::Domain::IPV6);
    let accept_op = Overlapped::new().expect("accept op");
    accept_op
        .accept(raw_socket(&listener), raw_socket(&accept_socket))
        .expect("start accept");

    let client = new_tcp_socket(socket2::Domain::IPV6);
    bind_local(raw_socket(&client), 4).expect("bind client");
    std::mem::forget(
        CompletionPort::create_or_associate(raw_socket(&client) as _, Some(&port), 2, 0)
            .expect("associate client"),
    );
    let connect_op = Overlapped::new().expect("connect op");
    connect_op
        .connect(
            raw_socket(&client),
            &ConnectAddr::V6 { host: "::1".into(), port: port_no, flow_info: 0, scope_id: 0 },
        )
        .expect("start connect");

    for _ in 0..2 {
        port.dequeue(5_000).expect("dequeue");
    }
    assert!(matches!(connect_op.getresult(false), Ok(Value::Unit)));
    assert_eq!(accept_op.getresult(false).map(|_| ()).is_ok(), true);
}

/// Scenario 6: dropping an operation mid-read must not panic or abort.
#[test]
fn destructor_with_pending_read_does_not_panic() {
    init_logging();
    let (server, _client) = create_pipe_pair("destructor");
    let _port = CompletionPort::create_or_associate(server, None, 1, 0).expect("associate pipe");

    {
        let op = Overlapped::new().expect("op");
        op.read_file(server, 64).expect("start read");
        assert_eq!(op.error(), windows_sys::Win32::Foundation::ERROR_IO_PENDING);
        // `op` drops here while the read is still outstanding.
    }

    close_handle(server);
}

/// A zero-byte read must succeed and yield an empty buffer rather than
/// erroring or corrupting the handle for subsequent use.
#[test]
fn zero_byte_read_succeeds_with_empty_buffer() {
    init_logging();
    let (server, mut client) = create_pipe_pair("zero-read");
    let port = CompletionPort::create_or_associate(server, None, 1, 0).expect("associate pipe");

    let op = Overlapped::new().expect("op");
    op.read_file(server, 0).expect("start zero-size read");
    write_all(&mut client, b"x");

    port.dequeue(5_000).expect("dequeue");
    match op.getresult(false).expect("getresult") {
        Value::Bytes(buf) => assert!(buf.is_empty()),
        other => panic!("expected Bytes, got {other:?}"),
    }

    close_handle(server);
}

/// A plain write completes and reports the exact byte count transferred.
#[test]
fn write_reports_bytes_transferred() {
    init_logging();
    let (server, mut client) = create_pipe_pair("write-count");
    let port = CompletionPort::create_or_associate(server, None, 1, 0).expect("associate pipe");

    let op = Overlapped::new().expect("op");
    let data = b"ping";
    op.write_file(server, data).expect("start write");
    port.dequeue(5_000).expect("dequeue");
    match op.getresult(false).expect("getresult") {
        Value::Transferred(n) => assert_eq!(n, data.len() as u32),
        other => panic!("expected Transferred, got {other:?}"),
    }

    let mut buf = [0u8; 4];
    use std::io::Read;
    client.read_exact(&mut buf).expect("read back what was written");
    assert_eq!(&buf, data);

    close_handle(server);
}
