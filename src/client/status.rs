//local shortcuts
use crate::*;

//third-party shortcuts
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//standard shortcuts
use core::fmt::Debug;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

//-------------------------------------------------------------------------------------------------------------------

/// How many recent server errors each client remembers.
const RECENT_ERROR_CAPACITY: usize = 10;

//-------------------------------------------------------------------------------------------------------------------

/// Per-socket bookkeeping for the control connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo
{
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ConnectionInfo
{
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self
    {
        let now = Utc::now();
        Self{
                local_addr,
                remote_addr,
                connected_at  : now,
                last_activity : now,
                bytes_sent    : 0u64,
                bytes_received: 0u64,
            }
    }
}

//-------------------------------------------------------------------------------------------------------------------

/// One entry of the recent-error ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentError
{
    pub at: DateTime<Utc>,
    pub code: String,
    pub message: String,
}

//-------------------------------------------------------------------------------------------------------------------

/// Bounded ring of the most recent server-reported and internal errors.
#[derive(Debug, Default)]
pub(crate) struct ErrorRing
{
    entries: Mutex<VecDeque<RecentError>>,
}

impl ErrorRing
{
    pub(crate) fn push(&self, code: impl Into<String>, message: impl Into<String>)
    {
        let Ok(mut entries) = self.entries.lock() else { return; };
        if entries.len() == RECENT_ERROR_CAPACITY { entries.pop_front(); }
        entries.push_back(RecentError{ at: Utc::now(), code: code.into(), message: message.into() });
    }

    pub(crate) fn snapshot(&self) -> Vec<RecentError>
    {
        let Ok(entries) = self.entries.lock() else { return Vec::default(); };
        entries.iter().cloned().collect()
    }
}

//-------------------------------------------------------------------------------------------------------------------

/// Mutable statistics of one client, written only by the owning client (single-writer discipline).
#[derive(Debug, Default, Clone)]
pub(crate) struct ClientStats
{
    pub(crate) last_connect_time: Option<DateTime<Utc>>,
    pub(crate) last_disconnect_time: Option<DateTime<Utc>>,
    pub(crate) reconnect_count: u32,
    pub(crate) total_reconnect_ms: u64,
}

//-------------------------------------------------------------------------------------------------------------------

/// Point-in-time view of a tunnel client, assembled by [`TunnelClient::status`](crate::TunnelClient::status).
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus
{
    pub client_id: String,
    pub status: ConnectionStatus,
    pub registered_services: usize,
    pub active_proxies: usize,
    pub reconnect_count: u32,
    pub last_connect_time: Option<DateTime<Utc>>,
    pub last_disconnect_time: Option<DateTime<Utc>>,
    pub recent_errors: Vec<RecentError>,
    pub connection: Option<ConnectionInfo>,
}

//-------------------------------------------------------------------------------------------------------------------
