//local shortcuts

//third-party shortcuts
use serde::{Deserialize, Serialize};

//standard shortcuts
use core::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------

/// How long a local-endpoint reachability probe may take.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Allowed suffixes of a bandwidth limit string (e.g. `10MB`, `512KB/S`).
const BANDWIDTH_SUFFIXES: [&'static str; 8] = ["B", "KB", "MB", "GB", "B/S", "KB/S", "MB/S", "GB/S"];

//-------------------------------------------------------------------------------------------------------------------

/// Protocol of an exported service.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType
{
    Tcp,
    Udp,
    Http,
    Https,
    Stcp,
    Sudp,
    Xtcp,
}

impl ServiceType
{
    pub fn as_str(&self) -> &'static str
    {
        match self
        {
            ServiceType::Tcp   => "tcp",
            ServiceType::Udp   => "udp",
            ServiceType::Http  => "http",
            ServiceType::Https => "https",
            ServiceType::Stcp  => "stcp",
            ServiceType::Sudp  => "sudp",
            ServiceType::Xtcp  => "xtcp",
        }
    }

    /// Whether this type requires at least one of `custom_domains`/`sub_domain`.
    pub fn requires_domain(&self) -> bool
    {
        matches!(self, ServiceType::Http | ServiceType::Https)
    }
}

impl FromStr for ServiceType
{
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()>
    {
        match s
        {
            "tcp"   => Ok(ServiceType::Tcp),
            "udp"   => Ok(ServiceType::Udp),
            "http"  => Ok(ServiceType::Http),
            "https" => Ok(ServiceType::Https),
            "stcp"  => Ok(ServiceType::Stcp),
            "sudp"  => Ok(ServiceType::Sudp),
            "xtcp"  => Ok(ServiceType::Xtcp),
            _       => Err(()),
        }
    }
}

impl std::fmt::Display for ServiceType
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        write!(f, "{}", self.as_str())
    }
}

//-------------------------------------------------------------------------------------------------------------------

/// Registry-side status of an exported service.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus
{
    Inactive,
    Starting,
    Active,
    Stopping,
    Error,
}

impl ServiceStatus
{
    pub fn as_str(&self) -> &'static str
    {
        match self
        {
            ServiceStatus::Inactive => "inactive",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Active   => "active",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Error    => "error",
        }
    }
}

//-------------------------------------------------------------------------------------------------------------------

/// A locally reachable endpoint exported to the public internet via the tunnel server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service
{
    /// Unique within a client.
    pub service_id: String,
    pub service_name: String,
    pub service_type: ServiceType,
    /// Host the client dials when bridging a data connection.
    pub local_address: String,
    pub local_port: u16,
    /// Public port on the server; may be assigned by the server at registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_domains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_password: Option<String>,
    #[serde(default)]
    pub use_encryption: bool,
    #[serde(default)]
    pub use_compression: bool,
    /// Rate cap with a unit suffix (`10MB`, `512KB/S`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_limit: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 10u32 }

impl Service
{
    /// The `host:port` of the local endpoint.
    pub fn local_target(&self) -> String
    {
        format!("{}:{}", self.local_address, self.local_port)
    }

    /// Serialize to a plain key/value map for the `register_service` payload.
    ///
    /// The keys are written out explicitly so the wire names cannot drift from what the server expects, no
    /// matter how this struct evolves.
    pub fn wire_map(&self) -> crate::MessageData
    {
        let mut map = crate::MessageData::default();
        map.insert(String::from("serviceId"), self.service_id.clone().into());
        map.insert(String::from("serviceName"), self.service_name.clone().into());
        map.insert(String::from("serviceType"), self.service_type.as_str().into());
        map.insert(String::from("localAddress"), self.local_address.clone().into());
        map.insert(String::from("localPort"), self.local_port.into());
        if let Some(remote_port) = self.remote_port
        {
            map.insert(String::from("remotePort"), remote_port.into());
        }
        if !self.custom_domains.is_empty()
        {
            map.insert(String::from("customDomains"), self.custom_domains.clone().into());
        }
        if let Some(sub_domain) = &self.sub_domain
        {
            map.insert(String::from("subDomain"), sub_domain.clone().into());
        }
        if let Some(http_user) = &self.http_user
        {
            map.insert(String::from("httpUser"), http_user.clone().into());
        }
        if let Some(http_password) = &self.http_password
        {
            map.insert(String::from("httpPassword"), http_password.clone().into());
        }
        map.insert(String::from("useEncryption"), self.use_encryption.into());
        map.insert(String::from("useCompression"), self.use_compression.into());
        if let Some(bandwidth_limit) = &self.bandwidth_limit
        {
            map.insert(String::from("bandwidthLimit"), bandwidth_limit.clone().into());
        }
        map.insert(String::from("maxConnections"), self.max_connections.into());

        map
    }
}

//-------------------------------------------------------------------------------------------------------------------

/// Service-level validation failures. These never reach the wire.
#[derive(Debug)]
pub enum ValidationError
{
    EmptyServiceId,
    EmptyServiceName,
    InvalidLocalPort,
    InvalidRemotePort,
    /// http/https services must carry at least one of `custom_domains`/`sub_domain`.
    MissingDomain,
    UnreachableLocalEndpoint(String),
    InvalidBandwidthLimit(String),
    InvalidMaxConnections,
}

impl std::fmt::Display for ValidationError
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        let _ = write!(f, "ValidationError::");
        match self
        {
            ValidationError::EmptyServiceId                 => write!(f, "EmptyServiceId"),
            ValidationError::EmptyServiceName               => write!(f, "EmptyServiceName"),
            ValidationError::InvalidLocalPort               => write!(f, "InvalidLocalPort"),
            ValidationError::InvalidRemotePort              => write!(f, "InvalidRemotePort"),
            ValidationError::MissingDomain                  => write!(f, "MissingDomain"),
            ValidationError::UnreachableLocalEndpoint(addr) => write!(f, "UnreachableLocalEndpoint({})", addr),
            ValidationError::InvalidBandwidthLimit(limit)   => write!(f, "InvalidBandwidthLimit({})", limit),
            ValidationError::InvalidMaxConnections          => write!(f, "InvalidMaxConnections"),
        }
    }
}
impl std::error::Error for ValidationError {}

//-------------------------------------------------------------------------------------------------------------------

/// Validate a service before it is offered for registration.
///
/// Field checks first, then a reachability probe of the local endpoint: a bounded TCP dial for tcp/http/https,
/// a UDP socket association for udp. The secret-tunnel types (stcp/sudp/xtcp) are not probed; their endpoints
/// may legitimately be dormant until a visitor appears.
pub async fn validate_service(service: &Service) -> Result<(), ValidationError>
{
    if service.service_id.is_empty() { return Err(ValidationError::EmptyServiceId); }
    if service.service_name.is_empty() { return Err(ValidationError::EmptyServiceName); }
    if service.local_port == 0 { return Err(ValidationError::InvalidLocalPort); }
    if service.remote_port == Some(0) { return Err(ValidationError::InvalidRemotePort); }

    if service.service_type.requires_domain()
        && service.custom_domains.is_empty()
        && service.sub_domain.as_deref().map_or(true, str::is_empty)
    {
        return Err(ValidationError::MissingDomain);
    }

    if let Some(limit) = &service.bandwidth_limit
    {
        validate_bandwidth_limit(limit)?;
    }

    if service.max_connections == 0 { return Err(ValidationError::InvalidMaxConnections); }

    probe_local_endpoint(service).await
}

//-------------------------------------------------------------------------------------------------------------------

/// Check a bandwidth limit string: positive numeric prefix, suffix from [`BANDWIDTH_SUFFIXES`].
pub fn validate_bandwidth_limit(limit: &str) -> Result<(), ValidationError>
{
    let invalid = || ValidationError::InvalidBandwidthLimit(String::from(limit));

    let split = limit
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(invalid)?;
    let (number, suffix) = limit.split_at(split);

    let value: f64 = number.parse().map_err(|_| invalid())?;
    if value <= 0.0 { return Err(invalid()); }

    let suffix = suffix.to_ascii_uppercase();
    if !BANDWIDTH_SUFFIXES.contains(&suffix.as_str()) { return Err(invalid()); }

    Ok(())
}

//-------------------------------------------------------------------------------------------------------------------

async fn probe_local_endpoint(service: &Service) -> Result<(), ValidationError>
{
    let target = service.local_target();

    match service.service_type
    {
        ServiceType::Tcp | ServiceType::Http | ServiceType::Https =>
        {
            let dial = tokio::net::TcpStream::connect(&target);
            match tokio::time::timeout(PROBE_TIMEOUT, dial).await
            {
                Ok(Ok(_stream)) => Ok(()),
                _               => Err(ValidationError::UnreachableLocalEndpoint(target)),
            }
        }
        ServiceType::Udp =>
        {
            // a UDP association only checks that the address resolves and routes
            let Ok(socket) = tokio::net::UdpSocket::bind("0.0.0.0:0").await
            else { return Err(ValidationError::UnreachableLocalEndpoint(target)); };
            match tokio::time::timeout(PROBE_TIMEOUT, socket.connect(&target)).await
            {
                Ok(Ok(())) => Ok(()),
                _          => Err(ValidationError::UnreachableLocalEndpoint(target)),
            }
        }
        ServiceType::Stcp | ServiceType::Sudp | ServiceType::Xtcp => Ok(()),
    }
}

//-------------------------------------------------------------------------------------------------------------------
