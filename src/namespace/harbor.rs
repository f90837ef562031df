//! Harbor project API client

use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::namespace::ProjectApi;
use crate::registry::endpoint::{
    build_http_client, Credentials, ProxySettings, RegistryEndpoint, Scheme,
};
use crate::registry::transport::cancellable;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Project {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
struct ProjectRequest<'a> {
    project_name: &'a str,
    metadata: ProjectMetadata,
}

#[derive(Debug, Serialize)]
struct ProjectMetadata {
    public: &'static str,
}

#[derive(Debug)]
pub struct HarborClient {
    host: String,
    credentials: Option<Credentials>,
    http: Client,
    plaintext: AtomicBool,
    can_downgrade: bool,
    logger: Logger,
}

impl HarborClient {
    pub fn new(endpoint: &RegistryEndpoint, proxy: &ProxySettings, logger: Logger) -> Result<Self> {
        let http = build_http_client(endpoint.insecure, proxy, Some(REQUEST_TIMEOUT))?;
        Ok(Self {
            host: endpoint.host.clone(),
            credentials: endpoint.credentials.clone(),
            http,
            plaintext: AtomicBool::new(endpoint.initial_scheme() == Scheme::Http),
            can_downgrade: endpoint.scheme.is_none(),
            logger,
        })
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.plaintext.load(Ordering::SeqCst) {
            Scheme::Http
        } else {
            Scheme::Https
        };
        format!("{}://{}/api/v2.0", scheme.as_str(), self.host)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(creds) => request.basic_auth(&creds.username, Some(&creds.password)),
            None => request,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        operation: &str,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        cancellable(cancel, async {
            self.authorize(request)
                .send()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, operation))
        })
        .await
    }
}

#[async_trait]
impl ProjectApi for HarborClient {
    async fn project_exists(&self, name: &str, cancel: &CancellationToken) -> Result<bool> {
        let url = format!("{}/projects", self.base_url());
        let operation = format!("project lookup for {}", name);
        let request = self.http.get(&url).query(&[("name", name)]);
        let response = self.send(request, &operation, cancel).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HttpErrorHandler::handle_registry_error(status, &body, &operation));
        }

        // the name filter is fuzzy on some versions; compare exactly
        let projects: Vec<Project> = response
            .json::<Option<Vec<Project>>>()
            .await
            .map_err(|e| RegistryError::Parse(format!("Invalid project list: {}", e)))?
            .unwrap_or_default();
        Ok(projects.iter().any(|project| project.name == name))
    }

    async fn create_project(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let url = format!("{}/projects", self.base_url());
        let operation = format!("project creation for {}", name);
        let body = ProjectRequest {
            project_name: name,
            metadata: ProjectMetadata { public: "false" },
        };
        let request = self.http.post(&url).json(&body);
        let response = self.send(request, &operation, cancel).await?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            StatusCode::CONFLICT => {
                self.logger
                    .detail(&format!("Project {} was created concurrently", name));
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(HttpErrorHandler::handle_registry_error(status, &body, &operation))
            }
        }
    }

    fn downgrade_to_plaintext(&self) -> bool {
        if !self.can_downgrade {
            return false;
        }
        // swap returns the previous value: true means already downgraded
        !self.plaintext.swap(true, Ordering::SeqCst)
    }
}
