//! HTTP implementation of [`RegistryApi`]
//!
//! Every request goes through [`RegistryClient::send`], which attaches any cached
//! authorization, answers a 401 challenge and replays the request once. Insecure
//! registries without an explicit scheme are probed over https first and fall
//! back to http when the server turns out to be plaintext or unreachable on TLS.

use crate::error::handlers::{HttpErrorHandler, NetworkErrorHandler};
use crate::error::{ErrorKind, RegistryError, Result};
use crate::image::digest::DigestUtils;
use crate::image::media_types::MANIFEST_ACCEPT;
use crate::logging::Logger;
use crate::registry::auth::{repository_scope, AuthChallenge, Authenticator, CATALOG_SCOPE};
use crate::registry::endpoint::{build_http_client, ProxySettings, RegistryEndpoint, Scheme};
use crate::registry::transport::{cancellable, BlobStream, RegistryApi, RemoteDescriptor};
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::{
    HeaderMap, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LINK, LOCATION, WWW_AUTHENTICATE,
};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use url::Url;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
const PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct CatalogPage {
    #[serde(default)]
    repositories: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TagsPage {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Client for one registry host
#[derive(Debug)]
pub struct RegistryClient {
    endpoint: RegistryEndpoint,
    http: Client,
    auth: Authenticator,
    base_url: OnceCell<String>,
    logger: Logger,
}

impl RegistryClient {
    pub fn new(endpoint: RegistryEndpoint, proxy: &ProxySettings, logger: Logger) -> Result<Self> {
        let http = build_http_client(endpoint.insecure, proxy, None)?;
        let auth = Authenticator::new(endpoint.credentials.clone(), logger.clone());
        Ok(Self {
            endpoint,
            http,
            auth,
            base_url: OnceCell::new(),
            logger,
        })
    }

    pub fn endpoint(&self) -> &RegistryEndpoint {
        &self.endpoint
    }

    /// Scheme and host prefix, resolved once per client
    async fn base_url(&self, cancel: &CancellationToken) -> Result<&str> {
        self.base_url
            .get_or_try_init(|| self.resolve_base_url(cancel))
            .await
            .map(String::as_str)
    }

    async fn resolve_base_url(&self, cancel: &CancellationToken) -> Result<String> {
        let scheme = self.endpoint.initial_scheme();
        if !self.endpoint.allows_plaintext_fallback() {
            return Ok(self.endpoint.base_url(scheme));
        }

        let https = self.endpoint.base_url(Scheme::Https);
        let probe = self.http.get(format!("{}/v2/", https));
        let result = cancellable(cancel, async {
            probe
                .send()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, "registry probe"))
        })
        .await;

        match result {
            // any HTTP answer, including 401, proves TLS works
            Ok(_) => Ok(https),
            Err(err) if matches!(err.kind(), ErrorKind::SchemeMismatch | ErrorKind::Transport) => {
                self.logger.warning(&format!(
                    "{} is not reachable over https ({}), falling back to http",
                    self.endpoint.host, err
                ));
                Ok(self.endpoint.base_url(Scheme::Http))
            }
            Err(err) => Err(err),
        }
    }

    /// Send a request built by `build`, answering at most one auth challenge
    async fn send<F>(
        &self,
        scope: &str,
        operation: &str,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let request = self.auth.authorize(build(&self.http), scope);
        let response = self.execute(request, operation, cancel).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(AuthChallenge::parse);
        let Some(challenge) = challenge else {
            return Ok(response);
        };

        self.logger.detail(&format!(
            "{} requires authentication for {}",
            self.endpoint.host, scope
        ));
        let authorization =
            cancellable(cancel, self.auth.negotiate(&self.http, &challenge, scope)).await?;
        let retry = self.auth.apply(build(&self.http), &authorization);
        self.execute(retry, operation, cancel).await
    }

    async fn execute(
        &self,
        request: RequestBuilder,
        operation: &str,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        cancellable(cancel, async {
            request
                .send()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, operation))
        })
        .await
    }

    async fn fail(response: Response, operation: &str) -> RegistryError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        HttpErrorHandler::handle_registry_error(status, &body, operation)
    }

    /// Follow `Link: <...>; rel="next"` pages, collecting names from each page
    async fn paginate<T, F>(
        &self,
        first: Url,
        scope: &str,
        operation: &str,
        cancel: &CancellationToken,
        extract: F,
    ) -> Result<Vec<String>>
    where
        T: for<'de> Deserialize<'de>,
        F: Fn(T) -> Vec<String>,
    {
        let mut names = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(first);

        while let Some(url) = next.take() {
            if !visited.insert(url.to_string()) {
                break;
            }
            let response = self
                .send(scope, operation, cancel, |http| http.get(url.clone()))
                .await?;
            if !response.status().is_success() {
                return Err(Self::fail(response, operation).await);
            }
            next = next_link(response.headers(), &url);
            let page: T = cancellable(cancel, async {
                response.json::<T>().await.map_err(|e| {
                    RegistryError::Parse(format!("Invalid {} response: {}", operation, e))
                })
            })
            .await?;
            names.extend(extract(page));
        }
        Ok(names)
    }
}

/// Resolve the `rel="next"` target of a Link header against the current page
fn next_link(headers: &HeaderMap, current: &Url) -> Option<Url> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|link| {
            let (target, params) = link.split_once(';')?;
            let is_next = params
                .split(';')
                .any(|p| p.trim().replace(' ', "") == "rel=\"next\"" || p.trim() == "rel=next");
            if !is_next {
                return None;
            }
            let target = target.trim().trim_start_matches('<').trim_end_matches('>');
            current.join(target).ok()
        })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[async_trait]
impl RegistryApi for RegistryClient {
    fn host(&self) -> &str {
        &self.endpoint.host
    }

    async fn list_repositories(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let base = self.base_url(cancel).await?;
        let first = Url::parse(&format!("{}/v2/_catalog?n={}", base, PAGE_SIZE))?;
        self.paginate(first, CATALOG_SCOPE, "catalog listing", cancel, |page: CatalogPage| {
            page.repositories.unwrap_or_default()
        })
        .await
    }

    async fn list_tags(&self, repository: &str, cancel: &CancellationToken) -> Result<Vec<String>> {
        let base = self.base_url(cancel).await?;
        let first = Url::parse(&format!(
            "{}/v2/{}/tags/list?n={}",
            base, repository, PAGE_SIZE
        ))?;
        let scope = repository_scope(repository, false);
        let operation = format!("tag listing for {}", repository);
        self.paginate(first, &scope, &operation, cancel, |page: TagsPage| {
            page.tags.unwrap_or_default()
        })
        .await
    }

    async fn get_descriptor(
        &self,
        repository: &str,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteDescriptor> {
        let base = self.base_url(cancel).await?;
        let url = format!("{}/v2/{}/manifests/{}", base, repository, reference);
        let scope = repository_scope(repository, false);
        let operation = format!("manifest fetch for {}:{}", repository, reference);
        let accept = MANIFEST_ACCEPT.join(", ");

        let response = self
            .send(&scope, &operation, cancel, |http| {
                http.get(&url).header(ACCEPT, accept.as_str())
            })
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response, &operation).await);
        }

        let content_type = header_str(response.headers(), CONTENT_TYPE.as_str()).map(str::to_string);
        let digest = header_str(response.headers(), DOCKER_CONTENT_DIGEST).map(str::to_string);
        let data = cancellable(cancel, async {
            response
                .bytes()
                .await
                .map_err(|e| NetworkErrorHandler::handle_network_error(&e, &operation))
        })
        .await?
        .to_vec();

        if DigestUtils::is_digest_reference(reference) {
            DigestUtils::verify(&data, reference)?;
        }

        self.logger.detail(&format!(
            "Fetched {}:{} ({} bytes, {})",
            repository,
            reference,
            data.len(),
            content_type.as_deref().unwrap_or("no content type")
        ));
        Ok(RemoteDescriptor::new(
            content_type.as_deref(),
            digest.as_deref(),
            data,
        ))
    }

    async fn blob_exists(
        &self,
        repository: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let base = self.base_url(cancel).await?;
        let url = format!("{}/v2/{}/blobs/{}", base, repository, digest);
        // destination side: ask for push so the token also covers the upload
        let scope = repository_scope(repository, true);
        let operation = format!("blob check for {}", digest);

        let response = self
            .send(&scope, &operation, cancel, |http| http.head(&url))
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::fail(response, &operation).await),
        }
    }

    async fn get_blob(
        &self,
        repository: &str,
        digest: &str,
        cancel: &CancellationToken,
    ) -> Result<BlobStream> {
        let base = self.base_url(cancel).await?;
        let url = format!("{}/v2/{}/blobs/{}", base, repository, digest);
        let scope = repository_scope(repository, false);
        let operation = format!("blob download for {}", digest);

        let response = self
            .send(&scope, &operation, cancel, |http| http.get(&url))
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response, &operation).await);
        }

        let stream = response
            .bytes_stream()
            .map_err(move |e| NetworkErrorHandler::handle_network_error(&e, &operation));
        Ok(Box::pin(stream))
    }

    async fn put_blob(
        &self,
        repository: &str,
        digest: &str,
        size: u64,
        data: BlobStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let base = self.base_url(cancel).await?;
        let start = Url::parse(&format!("{}/v2/{}/blobs/uploads/", base, repository))?;
        let scope = repository_scope(repository, true);
        let operation = format!("blob upload for {}", digest);

        let response = self
            .send(&scope, &operation, cancel, |http| {
                http.post(start.clone()).header(CONTENT_LENGTH, 0)
            })
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response, &operation).await);
        }

        let location = header_str(response.headers(), LOCATION.as_str()).ok_or_else(|| {
            RegistryError::Registry {
                status: response.status().as_u16(),
                message: format!("{}: upload session has no Location header", operation),
            }
        })?;
        // absolute, root-relative and relative locations all resolve against the POST URL
        let mut upload = start.join(location)?;
        upload.query_pairs_mut().append_pair("digest", digest);

        let request = self.auth.authorize(
            self.http
                .put(upload)
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(CONTENT_LENGTH, size)
                .body(Body::wrap_stream(data)),
            &scope,
        );
        let response = self.execute(request, &operation, cancel).await?;
        if !response.status().is_success() {
            return Err(Self::fail(response, &operation).await);
        }
        self.logger
            .detail(&format!("Uploaded blob {} to {}", digest, repository));
        Ok(())
    }

    async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let base = self.base_url(cancel).await?;
        let url = format!("{}/v2/{}/manifests/{}", base, repository, reference);
        let scope = repository_scope(repository, true);
        let operation = format!("manifest upload for {}:{}", repository, reference);
        let computed = DigestUtils::compute_docker_digest(&data);

        let response = self
            .send(&scope, &operation, cancel, |http| {
                http.put(&url)
                    .header(CONTENT_TYPE, media_type)
                    .body(data.clone())
            })
            .await?;
        if !response.status().is_success() {
            return Err(Self::fail(response, &operation).await);
        }

        let digest = header_str(response.headers(), DOCKER_CONTENT_DIGEST)
            .map(str::to_string)
            .unwrap_or(computed);
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn next_link_resolves_relative_targets() {
        let current = Url::parse("https://registry.local/v2/_catalog?n=100").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static("</v2/_catalog?last=team%2Fapp&n=100>; rel=\"next\""),
        );
        let next = next_link(&headers, &current).unwrap();
        assert_eq!(
            next.as_str(),
            "https://registry.local/v2/_catalog?last=team%2Fapp&n=100"
        );
    }

    #[test]
    fn next_link_ignores_other_relations() {
        let current = Url::parse("https://registry.local/v2/app/tags/list").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static("</v2/app/tags/list?last=a>; rel=\"prev\""),
        );
        assert!(next_link(&headers, &current).is_none());
    }

    #[test]
    fn upload_locations_resolve_against_session_url() {
        let start = Url::parse("https://harbor.local/v2/team/app/blobs/uploads/").unwrap();
        let absolute = start.join("https://storage.local/upload/1?state=x").unwrap();
        assert_eq!(absolute.host_str(), Some("storage.local"));
        let rooted = start.join("/v2/team/app/blobs/uploads/abc?_state=1").unwrap();
        assert_eq!(rooted.path(), "/v2/team/app/blobs/uploads/abc");
        let relative = start.join("abc").unwrap();
        assert_eq!(relative.path(), "/v2/team/app/blobs/uploads/abc");
    }

    #[tokio::test]
    async fn explicit_scheme_skips_probe() {
        let endpoint = RegistryEndpoint::new("http://127.0.0.1:9").with_insecure(true);
        let client =
            RegistryClient::new(endpoint, &ProxySettings::default(), Logger::default()).unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(client.base_url(&cancel).await.unwrap(), "http://127.0.0.1:9");
    }
}
