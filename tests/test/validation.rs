//local shortcuts
use crate::*;

//third-party shortcuts
use simple_tunnel::{validate_bandwidth_limit, validate_service, ServiceType, ValidationError};
use tokio::net::{TcpListener, UdpSocket};

//standard shortcuts
use std::str::FromStr;

//-------------------------------------------------------------------------------------------------------------------
//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn accepts_reachable_tcp_service()
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let service = test_service("s1", port);
    validate_service(&service).await.unwrap();
}

//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn rejects_unreachable_tcp_service()
{
    // nothing listens on the discard port on a test host
    let service = test_service("s1", 9u16);

    let Err(ValidationError::UnreachableLocalEndpoint(_)) = validate_service(&service).await
    else { panic!("unreachable endpoint should fail validation"); };
}

//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn accepts_udp_service()
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();

    let mut service = test_service("s1", port);
    service.service_type = ServiceType::Udp;
    validate_service(&service).await.unwrap();
}

//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn rejects_structural_problems()
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut service = test_service("", port);
    let Err(ValidationError::EmptyServiceId) = validate_service(&service).await
    else { panic!("empty id should fail"); };

    service = test_service("s1", port);
    service.service_name = String::default();
    let Err(ValidationError::EmptyServiceName) = validate_service(&service).await
    else { panic!("empty name should fail"); };

    service = test_service("s1", port);
    service.local_port = 0;
    let Err(ValidationError::InvalidLocalPort) = validate_service(&service).await
    else { panic!("port 0 should fail"); };

    service = test_service("s1", port);
    service.remote_port = Some(0);
    let Err(ValidationError::InvalidRemotePort) = validate_service(&service).await
    else { panic!("remote port 0 should fail"); };

    service = test_service("s1", port);
    service.max_connections = 0;
    let Err(ValidationError::InvalidMaxConnections) = validate_service(&service).await
    else { panic!("max connections 0 should fail"); };
}

//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn http_requires_a_domain()
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut service = test_service("s1", port);
    service.service_type = ServiceType::Http;

    let Err(ValidationError::MissingDomain) = validate_service(&service).await
    else { panic!("http without a domain should fail"); };

    service.sub_domain = Some(String::from("app"));
    validate_service(&service).await.unwrap();

    service.sub_domain = None;
    service.custom_domains = vec![String::from("app.example.net")];
    validate_service(&service).await.unwrap();
}

//-------------------------------------------------------------------------------------------------------------------

#[tokio::test]
async fn secret_tunnel_types_skip_the_probe()
{
    // deliberately unreachable endpoint; stcp services may be dormant
    let mut service = test_service("s1", 9u16);
    service.service_type = ServiceType::Stcp;
    validate_service(&service).await.unwrap();
}

//-------------------------------------------------------------------------------------------------------------------

#[test]
fn bandwidth_limit_suffixes()
{
    for valid in ["10B", "10KB", "1MB", "2GB", "10B/S", "512KB/S", "1MB/S", "2GB/S", "1.5MB", "512kb/s"]
    {
        validate_bandwidth_limit(valid).unwrap_or_else(|_| panic!("{valid} should be a valid limit"));
    }

    for invalid in ["", "10", "MB", "0MB", "-1MB", "10TB", "10MB/H", "ten MB"]
    {
        let Err(ValidationError::InvalidBandwidthLimit(_)) = validate_bandwidth_limit(invalid)
        else { panic!("{invalid} should be an invalid limit"); };
    }
}

//-------------------------------------------------------------------------------------------------------------------

#[test]
fn service_type_parsing()
{
    for (text, expected) in [
        ("tcp", ServiceType::Tcp),
        ("udp", ServiceType::Udp),
        ("http", ServiceType::Http),
        ("https", ServiceType::Https),
        ("stcp", ServiceType::Stcp),
        ("sudp", ServiceType::Sudp),
        ("xtcp", ServiceType::Xtcp),
    ]
    {
        assert_eq!(ServiceType::from_str(text), Ok(expected));
        assert_eq!(expected.as_str(), text);
    }

    assert!(ServiceType::from_str("quic").is_err());
}

//-------------------------------------------------------------------------------------------------------------------

#[test]
fn wire_map_uses_stable_keys()
{
    let mut service = test_service("s1", 18080);
    service.remote_port = Some(12001);
    service.bandwidth_limit = Some(String::from("10MB"));

    let map = service.wire_map();
    assert_eq!(map.get("serviceId").and_then(|v| v.as_str()), Some("s1"));
    assert_eq!(map.get("serviceType").and_then(|v| v.as_str()), Some("tcp"));
    assert_eq!(map.get("localPort").and_then(|v| v.as_u64()), Some(18080));
    assert_eq!(map.get("remotePort").and_then(|v| v.as_u64()), Some(12001));
    assert_eq!(map.get("bandwidthLimit").and_then(|v| v.as_str()), Some("10MB"));
    assert_eq!(map.get("maxConnections").and_then(|v| v.as_u64()), Some(10));
    assert!(!map.contains_key("subDomain"));
}

//-------------------------------------------------------------------------------------------------------------------
