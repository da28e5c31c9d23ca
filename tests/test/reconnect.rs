//local shortcuts
use crate::*;

//third-party shortcuts
use simple_tunnel::{ConnectionStatus, MemoryStore, TunnelClient, TunnelClientRecord};

//standard shortcuts
use std::sync::Arc;
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------
//-------------------------------------------------------------------------------------------------------------------

const EVENT_WAIT: Duration = Duration::from_secs(10);

//-------------------------------------------------------------------------------------------------------------------
//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn server_drop_triggers_reconnect_and_reregistration()
{
    let mut server = StubServer::spawn(StubConfig{ remote_port_base: 13001, ..Default::default() }).await;
    let store = Arc::new(MemoryStore::new());
    let config = test_config("c1", server.port());
    store.insert_client(TunnelClientRecord::from_config(&config));

    // the service is persisted, so startup registers it and the reconnect run must re-register it
    let echo_port = spawn_echo_server().await;
    store.insert_service("c1", test_service("s1", echo_port));

    let client = TunnelClient::new(config, store.clone());
    client.start().await.unwrap();

    server.wait_for(|e| matches!(e, StubEvent::RegisterReceived{ .. }), EVENT_WAIT).await.unwrap();
    assert_eq!(client.status().registered_services, 1);
    let generation_before = client.heartbeat_generation();

    // the server drops the control connection; the client's receive worker hits EOF
    server.close_control();

    let Some(StubEvent::AuthReceived{ .. }) =
        server.wait_for(|e| matches!(e, StubEvent::AuthReceived{ .. }), EVENT_WAIT).await
    else { panic!("client should have reconnected and re-authenticated"); };

    let Some(StubEvent::RegisterReceived{ service_id, accepted }) =
        server.wait_for(|e| matches!(e, StubEvent::RegisterReceived{ .. }), EVENT_WAIT).await
    else { panic!("client should have re-registered its service"); };
    assert_eq!(service_id, "s1");
    assert!(accepted);

    assert!(
        wait_until(
            || {
                let status = client.status();
                status.status == ConnectionStatus::Connected && status.reconnect_count == 1
            },
            EVENT_WAIT,
        )
        .await
    );

    // the reconnect run replaced the sticky heartbeat worker rather than re-using it
    assert!(client.heartbeat_generation() > generation_before);

    // reconnect statistics were written through
    assert_eq!(store.client("c1").unwrap().reconnect_count, 1);

    client.stop(Duration::from_secs(5)).await.unwrap();
}

//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_triggers_coalesce_into_one_run()
{
    let mut server = StubServer::spawn(StubConfig{ remote_port_base: 13101, ..Default::default() }).await;
    let store = Arc::new(MemoryStore::new());
    let config = test_config("c1", server.port());
    store.insert_client(TunnelClientRecord::from_config(&config));

    let client = TunnelClient::new(config, store);
    client.start().await.unwrap();
    server.wait_for(|e| matches!(e, StubEvent::AuthReceived{ .. }), EVENT_WAIT).await.unwrap();

    // take the server away entirely: the read fault and the heartbeat failures all fire triggers while the
    // run spins in its backoff loop
    server.pause_accept();
    server.close_control();
    tokio::time::sleep(Duration::from_millis(2500)).await;
    server.resume_accept();

    assert!(
        wait_until(|| client.status().status == ConnectionStatus::Connected, Duration::from_secs(15)).await
    );

    // every trigger bounced off the run already in flight
    assert_eq!(client.status().reconnect_count, 1);
    assert!(!client.is_reconnecting());

    client.stop(Duration::from_secs(5)).await.unwrap();
}

//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn confusion_frame_forces_reconnect()
{
    let mut server = StubServer::spawn(StubConfig{ remote_port_base: 13201, ..Default::default() }).await;
    let store = Arc::new(MemoryStore::new());
    let config = test_config("c1", server.port());
    store.insert_client(TunnelClientRecord::from_config(&config));

    let client = TunnelClient::new(config, store);
    client.start().await.unwrap();
    server.wait_for(|e| matches!(e, StubEvent::AuthReceived{ .. }), EVENT_WAIT).await.unwrap();

    // a frame whose body opens with NUL bytes and never becomes JSON
    let mut frame = Vec::new();
    frame.extend_from_slice(&16u32.to_be_bytes());
    frame.extend_from_slice(&[0u8, 0u8, 0u8]);
    frame.extend_from_slice(&[0x42u8; 13]);
    server.send_raw(frame);

    // the receive worker classifies it, closes the socket, and the client comes back
    let Some(StubEvent::AuthReceived{ .. }) =
        server.wait_for(|e| matches!(e, StubEvent::AuthReceived{ .. }), EVENT_WAIT).await
    else { panic!("client should have reconnected after the confused frame"); };

    assert!(
        wait_until(
            || {
                let status = client.status();
                status.status == ConnectionStatus::Connected && status.reconnect_count == 1
            },
            EVENT_WAIT,
        )
        .await
    );

    client.stop(Duration::from_secs(5)).await.unwrap();
}

//-------------------------------------------------------------------------------------------------------------------
