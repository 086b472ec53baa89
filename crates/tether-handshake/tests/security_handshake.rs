use std::{sync::Arc, time::Duration};
use tether_core::{
    ChannelArgs, CoreError, Endpoint, EndpointRef, SliceBuffer, codes, endpoint::testing::MemoryEndpoint,
    keys,
};
use tether_handshake::{
    HandshakeManager, HandshakerRegistry, HandshakerRole, SecurityConnector,
    fake::FakeSecurityConnector, find_auth_context, security_connector_arg,
};
use tokio::time::Instant;

fn secure_args(connector: Arc<dyn SecurityConnector>) -> ChannelArgs {
    ChannelArgs::new().with_pointer(keys::SECURITY_CONNECTOR, security_connector_arg(connector))
}

fn manager_for(role: HandshakerRole, args: &ChannelArgs) -> Arc<HandshakeManager> {
    let manager = HandshakeManager::new();
    HandshakerRegistry::with_defaults().add_handshakers(role, args, &manager);
    manager
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

async fn handshake_pair(
    client_connector: Arc<dyn SecurityConnector>,
    server_connector: Arc<dyn SecurityConnector>,
    chunk: usize,
) -> (
    Result<tether_handshake::HandshakerArgs, CoreError>,
    Result<tether_handshake::HandshakerArgs, CoreError>,
    Arc<MemoryEndpoint>,
) {
    let (client_ep, server_ep) = MemoryEndpoint::pair_with_chunk("client", "server", chunk);
    let client_args = secure_args(client_connector);
    let server_args = secure_args(server_connector);
    let client = manager_for(HandshakerRole::Client, &client_args);
    let server = manager_for(HandshakerRole::Server, &server_args);
    let raw_client = Arc::clone(&client_ep);
    let (c, s) = tokio::join!(
        client.do_handshake(client_ep, &client_args, deadline(), None),
        server.do_handshake(server_ep, &server_args, deadline(), None),
    );
    (c, s, raw_client)
}

async fn exchange(client: &EndpointRef, server: &EndpointRef) {
    client
        .write(SliceBuffer::from("ping over fake security"))
        .await
        .expect("client write");
    let mut slices = SliceBuffer::new();
    let mut collected = Vec::new();
    while collected.len() < 23 {
        server.read(&mut slices, false).await.expect("server read");
        collected.extend(slices.to_vec());
    }
    assert_eq!(collected, b"ping over fake security");
}

#[tokio::test]
async fn both_sides_end_with_secure_endpoints() {
    let (client, server, _) =
        handshake_pair(FakeSecurityConnector::new(), FakeSecurityConnector::new(), usize::MAX).await;
    let client = client.expect("client handshake");
    let server = server.expect("server handshake");
    assert!(client.read_buffer.is_empty());
    let auth = find_auth_context(&client.args).expect("auth context");
    assert!(auth.is_authenticated());
    assert!(find_auth_context(&server.args).is_some());
    exchange(&client.endpoint, &server.endpoint).await;
}

#[tokio::test]
async fn fragmented_wire_still_completes() {
    let (client, server, _) =
        handshake_pair(FakeSecurityConnector::zero_copy(), FakeSecurityConnector::zero_copy(), 3).await;
    let client = client.expect("client handshake");
    let server = server.expect("server handshake");
    exchange(&client.endpoint, &server.endpoint).await;
}

#[tokio::test]
async fn rejected_peer_fails_and_closes_the_endpoint() {
    let (client, _server, raw_client) = handshake_pair(
        FakeSecurityConnector::rejecting(),
        FakeSecurityConnector::new(),
        usize::MAX,
    )
    .await;
    let err = client.expect_err("peer check must fail");
    assert_eq!(err.code(), codes::SECURITY_PEER_CHECK_FAILED);
    assert!(raw_client.is_shutdown());
}

#[tokio::test]
async fn manager_shutdown_interrupts_a_pending_handshake() {
    let (client_ep, server_ep) = MemoryEndpoint::pair("client", "server");
    let args = secure_args(FakeSecurityConnector::new());
    let manager = manager_for(HandshakerRole::Client, &args);
    let task = {
        let manager = Arc::clone(&manager);
        let args = args.clone();
        tokio::spawn(async move { manager.do_handshake(client_ep, &args, deadline(), None).await })
    };

    let mut slices = SliceBuffer::new();
    server_ep.read(&mut slices, false).await.expect("client init arrives");
    manager.shutdown(CoreError::new(codes::CONNECTOR_SHUTDOWN, "connector shutdown"));

    let err = task.await.expect("join").expect_err("shut down");
    assert_eq!(err.code(), codes::HANDSHAKE_SHUTDOWN);
    assert_eq!(
        err.find_code(codes::CONNECTOR_SHUTDOWN).map(|e| e.code()),
        Some(codes::CONNECTOR_SHUTDOWN)
    );
}
