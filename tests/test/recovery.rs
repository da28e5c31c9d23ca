//local shortcuts
use crate::*;

//third-party shortcuts
use simple_tunnel::{ConnectionStatus, MemoryStore, TunnelClient, TunnelClientRecord, TunnelError};

//standard shortcuts
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------
//-------------------------------------------------------------------------------------------------------------------

const EVENT_WAIT: Duration = Duration::from_secs(5);

//-------------------------------------------------------------------------------------------------------------------
//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn startup_recovers_persisted_services_in_order()
{
    let mut reject = HashSet::new();
    reject.insert(String::from("s2"));
    let mut server = StubServer::spawn(StubConfig{
            remote_port_base   : 14001,
            reject_service_ids : reject,
            ..Default::default()
        })
        .await;

    let store = Arc::new(MemoryStore::new());
    let config = test_config("c1", server.port());
    store.insert_client(TunnelClientRecord::from_config(&config));
    store.insert_service("c1", test_service("s1", 18081));
    store.insert_service("c1", test_service("s2", 18082));
    store.insert_service("c1", test_service("s3", 18083));

    // a mid-list rejection does not abort startup
    let client = TunnelClient::new(config, store);
    client.start().await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3
    {
        let Some(StubEvent::RegisterReceived{ service_id, accepted }) =
            server.wait_for(|e| matches!(e, StubEvent::RegisterReceived{ .. }), EVENT_WAIT).await
        else { panic!("expected three registration attempts"); };
        seen.push((service_id, accepted));
    }

    assert_eq!(
        seen,
        vec![
            (String::from("s1"), true),
            (String::from("s2"), false),
            (String::from("s3"), true),
        ]
    );

    let status = client.status();
    assert_eq!(status.status, ConnectionStatus::Connected);
    assert_eq!(status.registered_services, 2);
    assert!(client.service("s1").is_some());
    assert!(client.service("s2").is_none());
    assert!(client.service("s3").is_some());

    client.stop(Duration::from_secs(5)).await.unwrap();
}

//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn startup_fails_when_every_registration_fails()
{
    let mut reject = HashSet::new();
    reject.insert(String::from("s1"));
    reject.insert(String::from("s2"));
    let server = StubServer::spawn(StubConfig{
            remote_port_base   : 14101,
            reject_service_ids : reject,
            ..Default::default()
        })
        .await;

    let store = Arc::new(MemoryStore::new());
    let config = test_config("c1", server.port());
    store.insert_client(TunnelClientRecord::from_config(&config));
    store.insert_service("c1", test_service("s1", 18081));
    store.insert_service("c1", test_service("s2", 18082));

    let client = TunnelClient::new(config, store.clone());
    let result = client.start().await;

    let Err(TunnelError::StartupRegistrationFailed) = result
    else { panic!("start should fail when every registration fails, got {result:?}"); };

    assert!(!client.is_running());
    assert_eq!(client.status().status, ConnectionStatus::Error);
    assert_eq!(store.client("c1").unwrap().connection_status, ConnectionStatus::Error);
}

//-------------------------------------------------------------------------------------------------------------------
