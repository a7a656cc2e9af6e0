mod common;

use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout, timeout_at};

use common::{UploadError, abort_upload, stall_upload, start_server, upload};
use ferrisbak::error::IntakeError;
use ferrisbak::intake::{ErrorCode, Packet, Request};

const WAIT: Duration = Duration::from_secs(5);

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_payload_is_delivered_intact() {
    let (server, addr) = start_server().await;
    let handle = server.handle();

    // Multi-block, exact multiple of the block size, negotiated block size.
    for (token, len, blksize) in [
        ("a0", 1300, None),
        ("a1", 1024, None),
        ("a2", 5000, Some(1428)),
        ("a3", 0, None),
    ] {
        let (tx, mut rx) = mpsc::channel(3);
        let _guard = handle.expect_file(token, tx).unwrap();

        let data = payload(len);
        upload(addr, &format!("{}.cfg", token), &data, blksize)
            .await
            .unwrap();

        let file = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(file.name, format!("{}.cfg", token));
        assert_eq!(file.data.as_ref(), data.as_slice(), "token {}", token);
    }

    server.stop();
}

#[tokio::test]
async fn test_concurrent_tokens_do_not_cross() {
    let (server, addr) = start_server().await;
    let handle = server.handle();

    let (tx1, mut rx1) = mpsc::channel(3);
    let (tx2, mut rx2) = mpsc::channel(3);
    let _g1 = handle.expect_file("11111111", tx1).unwrap();
    let _g2 = handle.expect_file("22222222", tx2).unwrap();

    let one = payload(3000);
    let two = b"hostname sw2\n".to_vec();
    let (r2, r1) = tokio::join!(
        upload(addr, "22222222.tmp", &two, None),
        upload(addr, "11111111", &one, Some(1024)),
    );
    r1.unwrap();
    r2.unwrap();

    let got1 = timeout(WAIT, rx1.recv()).await.unwrap().unwrap();
    let got2 = timeout(WAIT, rx2.recv()).await.unwrap().unwrap();
    assert_eq!(got1.data.as_ref(), one.as_slice());
    assert_eq!(got2.data.as_ref(), two.as_slice());

    // Each transfer satisfied exactly one receipt.
    assert!(rx1.try_recv().is_err());
    assert!(rx2.try_recv().is_err());
}

#[tokio::test]
async fn test_unexpected_upload_is_rejected() {
    let (server, addr) = start_server().await;
    let handle = server.handle();

    let (tx, mut rx) = mpsc::channel(3);
    let _guard = handle.expect_file("cafebabe", tx).unwrap();

    match upload(addr, "deadbeef.cfg", b"junk", None).await {
        Err(UploadError::Rejected { code, message }) => {
            assert_eq!(code, ErrorCode::AccessViolation);
            assert_eq!(message, "unexpected upload");
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // Server keeps working and the pending receipt is unaffected.
    assert_eq!(handle.registry().tokens(), vec!["cafebabe".to_string()]);
    upload(addr, "cafebabe.cfg", b"hostname sw1\n", None)
        .await
        .unwrap();
    let file = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(file.data.as_ref(), b"hostname sw1\n");
}

#[tokio::test]
async fn test_read_requests_are_refused() {
    let (_server, addr) = start_server().await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(
            &Packet::ReadRequest(Request::new("startup-config", "octet")).encode(),
            addr,
        )
        .await
        .unwrap();

    let mut buf = [0u8; 512];
    let (len, _) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        Packet::decode(&buf[..len]).unwrap(),
        Packet::Error {
            code: ErrorCode::IllegalOperation,
            ..
        }
    ));
}

#[tokio::test]
async fn test_client_abort_is_published_with_token() {
    let (server, addr) = start_server().await;
    let handle = server.handle();
    let mut failures = handle.subscribe_failures();

    let (tx, mut rx) = mpsc::channel(3);
    let _guard = handle.expect_file("abcd", tx).unwrap();

    abort_upload(addr, "abcd.cfg").await.unwrap();

    let failure = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.token.as_deref(), Some("abcd"));
    assert_eq!(failure.filename, "abcd.cfg");
    assert!(failure.reason.contains("flash full"), "{}", failure.reason);

    // Failures never travel on the delivery channel.
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_stalled_transfer_is_abandoned_after_retries() {
    let (server, addr) = start_server().await;
    let handle = server.handle();
    let mut failures = handle.subscribe_failures();

    let (tx, _rx) = mpsc::channel(3);
    let _guard = handle.expect_file("stall", tx).unwrap();

    let _socket = stall_upload(addr, "stall.cfg").await.unwrap();

    let failure = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert_eq!(failure.token.as_deref(), Some("stall"));
}

#[tokio::test]
async fn test_repeated_write_request_joins_running_transfer() {
    let (server, addr) = start_server().await;
    let handle = server.handle();
    let mut failures = handle.subscribe_failures();

    let (tx, mut rx) = mpsc::channel(3);
    let _guard = handle.expect_file("abcd", tx).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = Packet::WriteRequest(Request::new("abcd.cfg", "octet")).encode();
    socket.send_to(&request, addr).await.unwrap();
    socket.send_to(&request, addr).await.unwrap();

    let mut buf = [0u8; 516];
    let (len, tid) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Packet::decode(&buf[..len]).unwrap(), Packet::Ack(0));

    // Shorter than the server's retransmit interval: only a second
    // transfer would answer here.
    let window = Instant::now() + Duration::from_millis(100);
    while let Ok(received) = timeout_at(window, socket.recv_from(&mut buf)).await {
        let (_, from) = received.unwrap();
        assert_eq!(from, tid, "second transfer started for a repeated request");
    }

    let data = Packet::Data {
        block: 1,
        data: Bytes::from_static(b"hostname sw1\n"),
    };
    socket.send_to(&data.encode(), tid).await.unwrap();
    let (len, _) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Packet::decode(&buf[..len]).unwrap(), Packet::Ack(1));

    let file = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(file.data.as_ref(), b"hostname sw1\n");

    // Longer than a stalled transfer takes to give up.
    assert!(
        timeout(Duration::from_secs(1), failures.recv()).await.is_err(),
        "a completed upload was reported as failed"
    );
}

#[tokio::test]
async fn test_lost_final_ack_is_repeated() {
    let (server, addr) = start_server().await;
    let handle = server.handle();
    let mut failures = handle.subscribe_failures();

    let (tx, mut rx) = mpsc::channel(3);
    let _guard = handle.expect_file("last", tx).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(
            &Packet::WriteRequest(Request::new("last.cfg", "octet")).encode(),
            addr,
        )
        .await
        .unwrap();

    let mut buf = [0u8; 516];
    let (_, tid) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();

    let data = Packet::Data {
        block: 1,
        data: Bytes::from_static(b"hostname sw1\n"),
    }
    .encode();
    socket.send_to(&data, tid).await.unwrap();
    let (len, _) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(Packet::decode(&buf[..len]).unwrap(), Packet::Ack(1));

    // Delivery does not wait for the transfer socket to close.
    let file = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(file.data.as_ref(), b"hostname sw1\n");

    // The client never saw the ACK and sends the last block again.
    socket.send_to(&data, tid).await.unwrap();
    let (len, from) = timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, tid);
    assert_eq!(Packet::decode(&buf[..len]).unwrap(), Packet::Ack(1));

    assert!(failures.try_recv().is_err());
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (server, _addr) = start_server().await;
    let handle = server.handle();

    let (tx, mut rx) = mpsc::channel(3);
    let guard = handle.expect_file("pending", tx).unwrap();

    server.stop();
    server.stop();
    assert!(!server.is_running());

    // Waiting jobs see a closed channel, new registrations are refused.
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    let (tx, _rx) = mpsc::channel(3);
    assert!(matches!(
        handle.expect_file("late", tx),
        Err(IntakeError::NotRunning)
    ));
    drop(guard);
}

#[tokio::test]
async fn test_run_twice_and_restart() {
    let (server, _addr) = start_server().await;
    assert!(matches!(
        server.run().await,
        Err(IntakeError::AlreadyRunning)
    ));

    server.stop();
    let addr = server.run().await.unwrap();
    assert_eq!(server.local_addr(), Some(addr));

    let handle = server.handle();
    let (tx, mut rx) = mpsc::channel(3);
    let _guard = handle.expect_file("again", tx).unwrap();
    upload(addr, "again", b"ok", None).await.unwrap();
    assert_eq!(
        timeout(WAIT, rx.recv()).await.unwrap().unwrap().data.as_ref(),
        b"ok"
    );
}

#[tokio::test]
async fn test_bind_failure_is_returned() {
    let (server, addr) = start_server().await;

    let other = ferrisbak::IntakeServer::new(ferrisbak::IntakeConfig::new(addr, "127.0.0.1"));
    assert!(matches!(other.run().await, Err(IntakeError::Bind { .. })));
    assert!(server.is_running());
}
