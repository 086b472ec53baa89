use std::{sync::Arc, time::Duration};
use tether_core::{ChannelArgs, CoreError, Dialer, Endpoint, SliceBuffer, codes};
use tether_transport_tcp::{TcpDialer, TcpListener};
use tokio::time::Instant;

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

async fn read_exact(endpoint: &dyn Endpoint, len: usize) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut slices = SliceBuffer::new();
    while collected.len() < len {
        endpoint.read(&mut slices, false).await.expect("read");
        collected.extend(slices.to_vec());
    }
    collected
}

#[tokio::test]
async fn dial_and_accept_exchange_bytes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = format!("ipv4:{}", listener.local_addr());
    let dialer = TcpDialer::new();
    let args = ChannelArgs::new();
    let (client, server) = tokio::join!(
        dialer.dial(&address, &args, deadline()),
        listener.accept(),
    );
    let client = client.expect("dial");
    let server = server.expect("accept");
    assert_eq!(client.peer(), listener.local_addr().to_string());
    assert_eq!(server.peer_addr().to_string(), client.local_address());

    let mut outgoing = SliceBuffer::new();
    outgoing.push_copy(b"hello ");
    outgoing.push_copy(b"tcp");
    client.write(outgoing).await.expect("write");
    assert_eq!(read_exact(&server, 9).await, b"hello tcp");
}

#[tokio::test]
async fn peer_shutdown_is_seen_as_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().to_string();
    let dialer = TcpDialer::new();
    let (client, server) = tokio::join!(
        dialer.connect(&address, deadline()),
        listener.accept(),
    );
    let client = client.expect("dial");
    let server = server.expect("accept");
    server.shutdown(CoreError::new(codes::ENDPOINT_SHUTDOWN, "test"));
    assert!(server.is_shutdown());

    let mut slices = SliceBuffer::new();
    let err = client.read(&mut slices, false).await.expect_err("eof");
    assert!(
        err.code() == codes::ENDPOINT_CLOSED || err.code() == codes::ENDPOINT_READ_FAILED,
        "unexpected code {}",
        err.code()
    );
}

#[tokio::test]
async fn shutdown_interrupts_pending_read() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().to_string();
    let dialer = TcpDialer::new();
    let (client, _server) = tokio::join!(
        dialer.connect(&address, deadline()),
        listener.accept(),
    );
    let client = Arc::new(client.expect("dial"));
    let reader = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            let mut slices = SliceBuffer::new();
            client.read(&mut slices, false).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.shutdown(CoreError::new(codes::CONNECTOR_SHUTDOWN, "stop"));
    let err = reader.await.expect("join").expect_err("shut down");
    assert_eq!(err.code(), codes::ENDPOINT_SHUTDOWN);
    assert!(err.find_code(codes::CONNECTOR_SHUTDOWN).is_some());

    let err = client
        .write(SliceBuffer::from("late"))
        .await
        .expect_err("write after shutdown");
    assert_eq!(err.code(), codes::ENDPOINT_SHUTDOWN);
}

#[tokio::test]
async fn refused_connection_maps_to_connect_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().to_string();
    drop(listener);
    let err = TcpDialer::new()
        .dial(&address, &ChannelArgs::new(), deadline())
        .await
        .err()
        .expect("nothing listening");
    assert_eq!(err.code(), codes::TRANSPORT_CONNECT_FAILED);
}

#[tokio::test]
async fn unsupported_address_is_rejected_before_dialing() {
    let err = TcpDialer::new()
        .dial("unix:/tmp/tether.sock", &ChannelArgs::new(), deadline())
        .await
        .err()
        .expect("unix unsupported");
    assert_eq!(err.code(), codes::TRANSPORT_CONNECT_FAILED);
    assert!(err.message().contains("unsupported address scheme"));
}
