//! One shared client per registry host
//!
//! Token caches and the resolved scheme live on the client, so reusing it
//! across tasks keeps both warm for the whole run.

use crate::error::Result;
use crate::logging::Logger;
use crate::registry::client::RegistryClient;
use crate::registry::endpoint::{normalize_host, ProxySettings, RegistryEndpoint};
use crate::registry::transport::RegistryApi;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Source of registry clients by host
pub trait RegistryProvider: Send + Sync {
    fn registry(&self, address: &str) -> Result<Arc<dyn RegistryApi>>;
}

pub struct ClientPool {
    endpoints: HashMap<String, RegistryEndpoint>,
    proxy: ProxySettings,
    clients: Mutex<HashMap<String, Arc<RegistryClient>>>,
    logger: Logger,
}

impl ClientPool {
    pub fn new(endpoints: Vec<RegistryEndpoint>, proxy: ProxySettings, logger: Logger) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|endpoint| (endpoint.host.clone(), endpoint))
            .collect();
        Self {
            endpoints,
            proxy,
            clients: Mutex::new(HashMap::new()),
            logger,
        }
    }

    /// Settings for a host; unknown hosts get anonymous, secure defaults
    pub fn endpoint(&self, address: &str) -> RegistryEndpoint {
        let (host, _) = normalize_host(address);
        self.endpoints
            .get(&host)
            .cloned()
            .unwrap_or_else(|| RegistryEndpoint::new(address))
    }

    pub fn client(&self, address: &str) -> Result<Arc<RegistryClient>> {
        let endpoint = self.endpoint(address);
        let mut clients = self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(&endpoint.host) {
            return Ok(Arc::clone(client));
        }

        self.logger
            .detail(&format!("Creating registry client for {}", endpoint.host));
        let host = endpoint.host.clone();
        let client = Arc::new(RegistryClient::new(
            endpoint,
            &self.proxy,
            self.logger.clone(),
        )?);
        clients.insert(host, Arc::clone(&client));
        Ok(client)
    }
}

impl RegistryProvider for ClientPool {
    fn registry(&self, address: &str) -> Result<Arc<dyn RegistryApi>> {
        let client: Arc<dyn RegistryApi> = self.client(address)?;
        Ok(client)
    }
}
