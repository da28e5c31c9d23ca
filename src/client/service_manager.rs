//local shortcuts
use crate::*;

//third-party shortcuts
use chrono::{DateTime, Utc};

//standard shortcuts
use core::fmt::Debug;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

//-------------------------------------------------------------------------------------------------------------------

/// Deadline for the register/unregister request-response round trip.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);

//-------------------------------------------------------------------------------------------------------------------

/// Registry entry for one exported service.
#[derive(Debug, Clone)]
pub struct ServiceEntry
{
    pub service: Service,
    pub status: ServiceStatus,
    pub registered_at: DateTime<Utc>,
    pub last_active: Option<DateTime<Utc>>,
}

/// Registry shared between the service manager, the proxy manager, and the message router.
///
/// A service is present exactly while the server has acknowledged its registration (or a re-registration is in
/// flight after a reconnect).
pub(crate) type SharedServices = Arc<RwLock<HashMap<String, ServiceEntry>>>;

//-------------------------------------------------------------------------------------------------------------------

/// Validates, registers, and unregisters exported services against the server.
pub(crate) struct ServiceManager
{
    config: Arc<TunnelClientConfig>,
    control: Arc<ControlConnection>,
    proxies: Arc<ProxyManager>,
    registry: SharedServices,
    store: Arc<dyn ClientStore>,
}

impl ServiceManager
{
    pub(crate) fn new(
        config: Arc<TunnelClientConfig>,
        control: Arc<ControlConnection>,
        proxies: Arc<ProxyManager>,
        registry: SharedServices,
        store: Arc<dyn ClientStore>,
    ) -> Arc<Self>
    {
        Arc::new(Self{ config, control, proxies, registry, store })
    }

    /// Register a service with the server and arm its proxy.
    ///
    /// Returns the remote port in effect after registration (the server may assign one). The server's
    /// `{success, message}` verdict is surfaced verbatim on rejection.
    pub(crate) async fn register_service(&self, mut service: Service) -> Result<Option<u16>, TunnelError>
    {
        let service_id = service.service_id.clone();

        // a re-register replaces the existing registration
        let already_registered = match self.registry.read()
        {
            Ok(registry) => registry.contains_key(&service_id),
            Err(_)       => false,
        };
        if already_registered
        {
            if let Err(err) = self.unregister_service(&service_id).await
            {
                tracing::warn!(%err, %service_id, "failed to unregister before re-register, continuing");
            }
        }

        // the service rides in the payload as an explicit key/value map
        let mut data = MessageData::default();
        data.insert(String::from("service"), serde_json::Value::Object(service.wire_map()));
        let request = ControlMessage::new(MSG_REGISTER_SERVICE, data);

        let response = self.control.send_and_wait(request, REGISTRATION_TIMEOUT).await?;
        if !response.is_success()
        {
            let message = String::from(response.message_text().unwrap_or("registration rejected"));
            tracing::warn!(%service_id, %message, "server rejected registration");
            self.persist_service_status(&service_id, ServiceStatus::Error).await;
            return Err(TunnelError::RegistrationRejected(service_id, message));
        }

        if let Some(remote_port) = response.data_u16("remotePort")
        {
            service.remote_port = Some(remote_port);
        }
        let remote_port = service.remote_port;

        {
            let Ok(mut registry) = self.registry.write() else { return Err(TunnelError::ConnectionClosed); };
            registry.insert(
                service_id.clone(),
                ServiceEntry{
                        service,
                        status        : ServiceStatus::Inactive,
                        registered_at : Utc::now(),
                        last_active   : None,
                    },
            );
        }

        // arm the proxy; a service without a remote port (domain-routed http) stays unarmed
        if let Some(remote_port) = remote_port
        {
            if let Err(err) = self.proxies.start_proxy(&service_id, remote_port)
            {
                // roll the registry entry back so state stays consistent with the server's view
                if let Ok(mut registry) = self.registry.write() { registry.remove(&service_id); }
                return Err(err);
            }
        }

        self.persist_service_status(&service_id, ServiceStatus::Inactive).await;
        tracing::info!(%service_id, ?remote_port, "service registered");
        Ok(remote_port)
    }

    /// Unregister a service. Server-side failure is logged; local removal always proceeds.
    pub(crate) async fn unregister_service(&self, service_id: &str) -> Result<(), TunnelError>
    {
        let entry = {
            let Ok(mut registry) = self.registry.write() else { return Ok(()); };
            let Some(entry) = registry.get_mut(service_id) else { return Ok(()); };
            entry.status = ServiceStatus::Stopping;
            entry.clone()
        };

        let mut data = MessageData::default();
        data.insert(String::from("serviceId"), String::from(service_id).into());
        data.insert(String::from("serviceName"), entry.service.service_name.clone().into());
        let request = ControlMessage::new(MSG_UNREGISTER_SERVICE, data);

        match self.control.send_and_wait(request, REGISTRATION_TIMEOUT).await
        {
            Ok(response) if !response.is_success() =>
            {
                tracing::warn!(
                    %service_id,
                    message = response.message_text().unwrap_or(""),
                    "server rejected unregistration, removing locally"
                );
            }
            Ok(_) => (),
            Err(err) =>
            {
                tracing::warn!(%err, %service_id, "unregister request failed, removing locally");
            }
        }

        self.proxies.stop_proxy(service_id);
        if let Ok(mut registry) = self.registry.write() { registry.remove(service_id); }
        self.persist_service_status(service_id, ServiceStatus::Inactive).await;

        tracing::info!(%service_id, "service unregistered");
        Ok(())
    }

    /// Best-effort unregistration of everything in the registry (client stop path).
    pub(crate) async fn unregister_all(&self)
    {
        let service_ids: Vec<String> = match self.registry.read()
        {
            Ok(registry) => registry.keys().cloned().collect(),
            Err(_)       => Vec::default(),
        };

        for service_id in service_ids
        {
            if let Err(err) = self.unregister_service(&service_id).await
            {
                tracing::warn!(%err, %service_id, "failed to unregister during shutdown");
            }
        }
    }

    pub(crate) fn service_count(&self) -> usize
    {
        match self.registry.read()
        {
            Ok(registry) => registry.len(),
            Err(_)       => 0usize,
        }
    }

    pub(crate) fn get(&self, service_id: &str) -> Option<ServiceEntry>
    {
        self.registry.read().ok()?.get(service_id).cloned()
    }

    pub(crate) fn list(&self) -> Vec<ServiceEntry>
    {
        match self.registry.read()
        {
            Ok(registry) => registry.values().cloned().collect(),
            Err(_)       => Vec::default(),
        }
    }

    async fn persist_service_status(&self, service_id: &str, status: ServiceStatus)
    {
        if let Err(err) = self.store.update_service_status(service_id, status, Utc::now()).await
        {
            tracing::debug!(%err, %service_id, "failed to persist service status");
        }
    }
}

impl Debug for ServiceManager
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ServiceManager")
            .field("client_id", &self.config.client_id)
            .field("services", &self.service_count())
            .finish()
    }
}

//-------------------------------------------------------------------------------------------------------------------
