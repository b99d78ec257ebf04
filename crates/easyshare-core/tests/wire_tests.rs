//! Protocol-level tests that drive a peer with a hand-rolled wire client.

mod common;

use std::time::Duration;

use common::{create_test_file, make_peer, patterned_bytes, wait_for_event};
use easyshare_core::crypto;
use easyshare_core::device::Platform;
use easyshare_core::events::Event;
use easyshare_core::protocol::{encode_frame, Message, MessageBuffer, Payload};
use easyshare_core::storage::Storage;
use easyshare_core::CHUNK_SIZE;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Write one message as a wire frame.
async fn write_message(stream: &mut TcpStream, message: &Message) {
    let frame = encode_frame(message).expect("encode");
    stream.write_all(&frame).await.expect("write");
}

/// Read until a message matching the predicate arrives (pings and other
/// traffic are skipped).
async fn read_until<F>(stream: &mut TcpStream, buffer: &mut MessageBuffer, predicate: F) -> Message
where
    F: Fn(&Message) -> bool,
{
    let mut read_buf = vec![0u8; 16 * 1024];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);

    loop {
        for message in buffer.extract().expect("well-formed frames") {
            if predicate(&message) {
                return message;
            }
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("timed out waiting for a matching message");
        }
        let n = tokio::time::timeout(remaining, stream.read(&mut read_buf))
            .await
            .expect("read timed out")
            .expect("read");
        assert!(n > 0, "peer closed the connection unexpectedly");
        buffer.append(&read_buf[..n]);
    }
}

#[tokio::test]
async fn sender_emits_ascending_chunks_with_exact_sizes() {
    let alice = make_peer("Alice", Platform::Desktop);

    // A bare-wire receiver stands in for the peer.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let mut target = easyshare_core::device::DeviceInfo::generate("Raw", Platform::Desktop);
    target.host = Some("127.0.0.1".to_string());
    target.port = Some(port);

    let connect = alice.manager.connect_to_device(&target);
    let (accept, _) = tokio::join!(listener.accept(), connect);
    let (mut stream, _) = accept.expect("accept");

    // 64 KiB * 4 + 1 byte.
    let payload = patterned_bytes(262_145);
    let dir = common::create_temp_dir();
    let source = create_test_file(dir.path(), "dataset.bin", &payload);

    let manager = alice.manager.clone();
    let send_task = tokio::spawn(async move { manager.send_file(source).await });

    let mut buffer = MessageBuffer::new();
    let request = read_until(&mut stream, &mut buffer, |m| {
        matches!(m.payload, Payload::FileRequest { .. })
    })
    .await;

    let request_id = request.id.clone();
    match &request.payload {
        Payload::FileRequest {
            file_name,
            file_size,
            checksum,
            http_url,
            ..
        } => {
            assert_eq!(file_name, "dataset.bin");
            assert_eq!(*file_size, 262_145);
            assert_eq!(checksum, &crypto::checksum(&payload));
            assert!(http_url.is_none(), "small files must not use the HTTP path");
        }
        _ => unreachable!(),
    }

    write_message(
        &mut stream,
        &Message::new(Payload::FileAccept {
            request_id: request_id.clone(),
            upload_url: None,
        }),
    )
    .await;

    // Five chunks, ascending, with exact sizes; the last is one byte.
    use base64::prelude::*;
    let expected_sizes = [CHUNK_SIZE, CHUNK_SIZE, CHUNK_SIZE, CHUNK_SIZE, 1];
    let mut reassembled = Vec::new();
    for expected_index in 0..5u32 {
        let chunk = read_until(&mut stream, &mut buffer, |m| {
            matches!(m.payload, Payload::FileChunk { .. })
        })
        .await;
        match &chunk.payload {
            Payload::FileChunk {
                request_id: chunk_request,
                chunk_index,
                total_chunks,
                data,
            } => {
                assert_eq!(chunk_request, &request_id);
                assert_eq!(*chunk_index, expected_index);
                assert_eq!(*total_chunks, 5);
                let bytes = BASE64_STANDARD.decode(data).expect("chunk base64");
                assert_eq!(bytes.len(), expected_sizes[expected_index as usize]);
                reassembled.extend_from_slice(&bytes);
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(reassembled, payload);

    let complete = read_until(&mut stream, &mut buffer, |m| {
        matches!(m.payload, Payload::FileComplete { .. })
    })
    .await;
    match &complete.payload {
        Payload::FileComplete { checksum, .. } => {
            assert_eq!(checksum, &crypto::checksum(&payload));
        }
        _ => unreachable!(),
    }

    let delivered = send_task.await.expect("task").expect("send_file");
    assert!(delivered, "chunk-mode send resolves true on complete");
}

#[tokio::test]
async fn integrity_failure_drops_file_without_history() {
    let bob = make_peer("Bob", Platform::Desktop);
    let port = bob.manager.start_server().await.expect("server");

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
    let mut buffer = MessageBuffer::new();

    let payload = patterned_bytes(200_000);
    let honest_checksum = crypto::checksum(&payload);

    let request = Message::new(Payload::FileRequest {
        file_name: "tampered.bin".to_string(),
        file_size: payload.len() as u64,
        mime_type: "application/octet-stream".to_string(),
        checksum: honest_checksum.clone(),
        http_url: None,
    });
    let request_id = request.id.clone();
    write_message(&mut stream, &request).await;

    read_until(&mut stream, &mut buffer, |m| {
        matches!(&m.payload, Payload::FileAccept { request_id: r, .. } if r == &request_id)
    })
    .await;

    // Flip one byte in the second chunk.
    let mut tampered = payload.clone();
    tampered[CHUNK_SIZE + 17] ^= 0x01;

    use base64::prelude::*;
    let chunks: Vec<&[u8]> = tampered.chunks(CHUNK_SIZE).collect();
    for (index, chunk) in chunks.iter().enumerate() {
        write_message(
            &mut stream,
            &Message::new(Payload::FileChunk {
                request_id: request_id.clone(),
                chunk_index: index as u32,
                total_chunks: chunks.len() as u32,
                data: BASE64_STANDARD.encode(chunk),
            }),
        )
        .await;
    }
    write_message(
        &mut stream,
        &Message::new(Payload::FileComplete {
            request_id: request_id.clone(),
            checksum: honest_checksum,
        }),
    )
    .await;

    // Give the receiver time to verify and discard.
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert!(
        bob.storage.get_transfers().is_empty(),
        "a failed checksum must not produce a history entry"
    );
    assert!(
        !bob.save_dir.path().join("tampered.bin").exists(),
        "no file may be written at the final path"
    );

    // An integrity failure does not tear the socket down.
    let ping = Message::new(Payload::Ping);
    let ping_id = ping.id.clone();
    write_message(&mut stream, &ping).await;
    let pong = read_until(&mut stream, &mut buffer, |m| {
        matches!(m.payload, Payload::Pong)
    })
    .await;
    assert_eq!(pong.id, ping_id, "pong must echo the ping id");
}

#[tokio::test]
async fn second_inbound_connection_is_refused() {
    let bob = make_peer("Bob", Platform::Desktop);
    let port = bob.manager.start_server().await.expect("server");

    // First connection proves liveness with a frame.
    let mut first = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
    let mut first_buffer = MessageBuffer::new();
    let ping = Message::new(Payload::Ping);
    write_message(&mut first, &ping).await;
    read_until(&mut first, &mut first_buffer, |m| {
        matches!(m.payload, Payload::Pong)
    })
    .await;

    // The extra connection is destroyed without a frame.
    let mut second = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
    let mut probe = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(10), second.read(&mut probe))
        .await
        .expect("refusal must be prompt");
    assert!(
        matches!(read, Ok(0) | Err(_)),
        "the extra connection must be closed"
    );

    // The first connection keeps working.
    let ping = Message::new(Payload::Ping);
    write_message(&mut first, &ping).await;
    read_until(&mut first, &mut first_buffer, |m| {
        matches!(m.payload, Payload::Pong)
    })
    .await;
}

#[tokio::test]
async fn threshold_file_uses_http_path_and_disconnect_resolves_false() {
    let alice = make_peer("Alice", Platform::Desktop);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let mut target = easyshare_core::device::DeviceInfo::generate("Raw", Platform::Desktop);
    target.host = Some("127.0.0.1".to_string());
    target.port = Some(port);

    let connect = alice.manager.connect_to_device(&target);
    let (accept, _) = tokio::join!(listener.accept(), connect);
    let (mut stream, _) = accept.expect("accept");

    // Exactly 5 MiB: the large path applies at the threshold.
    let payload = patterned_bytes(easyshare_core::LARGE_FILE_THRESHOLD as usize);
    let dir = common::create_temp_dir();
    let source = create_test_file(dir.path(), "threshold.bin", &payload);

    let manager = alice.manager.clone();
    let send_task = tokio::spawn(async move { manager.send_file(source).await });

    let mut buffer = MessageBuffer::new();
    let request = read_until(&mut stream, &mut buffer, |m| {
        matches!(m.payload, Payload::FileRequest { .. })
    })
    .await;
    match &request.payload {
        Payload::FileRequest {
            checksum, http_url, ..
        } => {
            assert!(
                http_url.is_some(),
                "a file at the threshold must take the HTTP path"
            );
            assert!(
                !checksum.starts_with("size:"),
                "a desktop sender computes a real digest"
            );
        }
        _ => unreachable!(),
    }

    // Dropping the connection with the send outstanding resolves it
    // false, exactly once.
    drop(stream);
    let delivered = send_task.await.expect("task").expect("send_file");
    assert!(!delivered, "disconnect must resolve the pending send false");
}

#[tokio::test]
async fn oversized_frame_tears_the_connection_down() {
    let mut bob = make_peer("Bob", Platform::Desktop);
    let port = bob.manager.start_server().await.expect("server");

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");

    // Declare a payload one byte over the limit.
    let declared = (easyshare_core::MAX_FRAME_PAYLOAD as u32 + 1).to_be_bytes();
    stream.write_all(&declared).await.expect("write");
    stream.write_all(&[0x20]).await.expect("write");

    let mut probe = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut probe))
        .await
        .expect("teardown must be prompt");
    assert!(
        matches!(read, Ok(0) | Err(_)),
        "an oversized frame must close the socket"
    );

    let disconnect = wait_for_event(&mut bob.events, "disconnect", |e| {
        matches!(
            e,
            Event::ConnectionState(state)
                if state.status == easyshare_core::connection::ConnectionStatus::Disconnected
        )
    })
    .await;
    match disconnect {
        Event::ConnectionState(state) => assert!(state.error.is_some()),
        _ => unreachable!(),
    }
}
