//local shortcuts
use crate::*;

//third-party shortcuts
use simple_tunnel::{ConnectionStatus, MemoryStore, TunnelClientManager, TunnelClientRecord};

//standard shortcuts
use std::sync::Arc;
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------
//-------------------------------------------------------------------------------------------------------------------

const EVENT_WAIT: Duration = Duration::from_secs(5);

fn stored_config(client_id: &str, server_port: u16) -> TunnelClientRecord
{
    let mut config = test_config(client_id, server_port);
    config.heartbeat_interval = Duration::from_secs(1);
    config.retry_interval = Duration::from_secs(1);
    TunnelClientRecord::from_config(&config)
}

//-------------------------------------------------------------------------------------------------------------------
//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn manager_loads_starts_and_stops_clients()
{
    let mut server_a = StubServer::spawn(StubConfig{ remote_port_base: 16001, ..Default::default() }).await;
    let mut server_b = StubServer::spawn(StubConfig{ remote_port_base: 16101, ..Default::default() }).await;

    let store = Arc::new(MemoryStore::new());
    store.insert_client(stored_config("c1", server_a.port()));
    store.insert_client(stored_config("c2", server_b.port()));

    let manager = TunnelClientManager::new(store.clone()).await.unwrap();
    assert_eq!(manager.client_count().await, 2);

    assert_eq!(manager.start_all().await, 2);
    server_a.wait_for(|e| matches!(e, StubEvent::AuthReceived{ .. }), EVENT_WAIT).await.unwrap();
    server_b.wait_for(|e| matches!(e, StubEvent::AuthReceived{ .. }), EVENT_WAIT).await.unwrap();

    let client = manager.get_client("c1").await.unwrap();
    assert_eq!(client.status().status, ConnectionStatus::Connected);

    manager.stop("c2", Duration::from_secs(5)).await.unwrap();
    assert!(!manager.get_client("c2").await.unwrap().is_running());
    assert!(manager.get_client("c1").await.unwrap().is_running());

    manager.shutdown(Duration::from_secs(5)).await;
    assert!(!manager.get_client("c1").await.unwrap().is_running());
}

//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn reload_replaces_and_restarts_a_running_client()
{
    let mut server = StubServer::spawn(StubConfig{ remote_port_base: 16201, ..Default::default() }).await;

    let store = Arc::new(MemoryStore::new());
    store.insert_client(stored_config("c1", server.port()));

    let manager = TunnelClientManager::new(store.clone()).await.unwrap();
    manager.start("c1").await.unwrap();
    server.wait_for(|e| matches!(e, StubEvent::AuthReceived{ .. }), EVENT_WAIT).await.unwrap();

    // reload with a tweaked config; the old client is stopped and the new one comes up in its place
    let mut record = store.client("c1").unwrap();
    record.heartbeat_interval_secs = 2;
    manager.reload(record).await.unwrap();

    let Some(StubEvent::AuthReceived{ .. }) =
        server.wait_for(|e| matches!(e, StubEvent::AuthReceived{ .. }), EVENT_WAIT).await
    else { panic!("reloaded client should re-authenticate"); };

    let client = manager.get_client("c1").await.unwrap();
    assert!(client.is_running());
    assert_eq!(client.config().heartbeat_interval, Duration::from_secs(2));

    manager.shutdown(Duration::from_secs(5)).await;
}

//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn delete_removes_a_client()
{
    let server = StubServer::spawn(StubConfig{ remote_port_base: 16301, ..Default::default() }).await;

    let store = Arc::new(MemoryStore::new());
    store.insert_client(stored_config("c1", server.port()));

    let manager = TunnelClientManager::new(store.clone()).await.unwrap();
    manager.start("c1").await.unwrap();

    manager.delete("c1").await.unwrap();
    assert!(manager.get_client("c1").await.is_none());
    assert_eq!(manager.client_count().await, 0);

    // deleting an unknown client is a no-op
    manager.delete("ghost").await.unwrap();
}

//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn start_loads_unknown_clients_from_the_store()
{
    let mut server = StubServer::spawn(StubConfig{ remote_port_base: 16401, ..Default::default() }).await;

    let store = Arc::new(MemoryStore::new());
    let manager = TunnelClientManager::new(store.clone()).await.unwrap();
    assert_eq!(manager.client_count().await, 0);

    // the record appears after the manager was built (management surface added it)
    store.insert_client(stored_config("c9", server.port()));
    manager.start("c9").await.unwrap();
    server.wait_for(|e| matches!(e, StubEvent::AuthReceived{ .. }), EVENT_WAIT).await.unwrap();
    assert_eq!(manager.client_count().await, 1);

    let missing = manager.start("ghost").await;
    assert!(missing.is_err());

    manager.shutdown(Duration::from_secs(5)).await;
}

//-------------------------------------------------------------------------------------------------------------------
