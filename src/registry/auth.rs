//! Registry authentication
//!
//! Registries announce their scheme through `WWW-Authenticate` on a 401. Basic
//! challenges are answered with the configured credentials; Bearer challenges are
//! exchanged for a token at the realm and cached per scope for the lifetime of
//! the client.

use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use crate::registry::endpoint::Credentials;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use url::Url;

/// Parsed `WWW-Authenticate` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthChallenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

impl AuthChallenge {
    /// Parse a challenge. Quoted values may contain commas (`scope="repo:a:pull,push"`).
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

        if scheme.eq_ignore_ascii_case("basic") {
            return Some(AuthChallenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let params = parse_params(params);
        let realm = params.get("realm")?.clone();
        Some(AuthChallenge::Bearer {
            realm,
            service: params.get("service").cloned(),
            scope: params.get("scope").cloned(),
        })
    }
}

fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut escaped = false;
            for c in chars.by_ref() {
                match c {
                    _ if escaped => {
                        value.push(c);
                        escaped = false;
                    }
                    '\\' => escaped = true,
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(c) = chars.peek() {
                if *c == ',' {
                    break;
                }
                value.push(*c);
                chars.next();
            }
        }
        params.insert(key.trim().to_lowercase(), value.trim().to_string());
    }
    params
}

/// Scope string for repository access
pub fn repository_scope(repository: &str, push: bool) -> String {
    if push {
        format!("repository:{}:pull,push", repository)
    } else {
        format!("repository:{}:pull", repository)
    }
}

pub const CATALOG_SCOPE: &str = "registry:catalog:*";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// How to authorize a request once a challenge has been answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Basic,
    Bearer(String),
}

/// Answers challenges for one registry and caches the result per scope
#[derive(Debug)]
pub struct Authenticator {
    credentials: Option<Credentials>,
    cache: RwLock<HashMap<String, Authorization>>,
    logger: Logger,
}

impl Authenticator {
    pub fn new(credentials: Option<Credentials>, logger: Logger) -> Self {
        Self {
            credentials,
            cache: RwLock::new(HashMap::new()),
            logger,
        }
    }

    pub fn cached(&self, scope: &str) -> Option<Authorization> {
        self.cache.read().ok()?.get(scope).cloned()
    }

    fn store(&self, scope: &str, authorization: Authorization) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(scope.to_string(), authorization);
        }
    }

    /// Attach cached authorization for `scope` to a request
    pub fn authorize(&self, request: RequestBuilder, scope: &str) -> RequestBuilder {
        match self.cached(scope) {
            Some(authorization) => self.apply(request, &authorization),
            None => request,
        }
    }

    pub fn apply(&self, request: RequestBuilder, authorization: &Authorization) -> RequestBuilder {
        match authorization {
            Authorization::Bearer(token) => request.bearer_auth(token),
            Authorization::Basic => match &self.credentials {
                Some(creds) => request.basic_auth(&creds.username, Some(&creds.password)),
                None => request,
            },
        }
    }

    /// Answer a challenge for `scope` and cache the outcome
    pub async fn negotiate(
        &self,
        http: &Client,
        challenge: &AuthChallenge,
        scope: &str,
    ) -> Result<Authorization> {
        let authorization = match challenge {
            AuthChallenge::Basic => {
                if self.credentials.is_none() {
                    return Err(RegistryError::PermissionDenied(
                        "Registry requires basic authentication but no credentials are configured"
                            .to_string(),
                    ));
                }
                Authorization::Basic
            }
            AuthChallenge::Bearer {
                realm,
                service,
                scope: challenge_scope,
            } => {
                // the server's own scope wins; it may ask for more than we derived
                let requested = challenge_scope.as_deref().unwrap_or(scope);
                let token = self
                    .fetch_token(http, realm, service.as_deref(), requested)
                    .await?;
                Authorization::Bearer(token)
            }
        };
        self.store(scope, authorization.clone());
        Ok(authorization)
    }

    async fn fetch_token(
        &self,
        http: &Client,
        realm: &str,
        service: Option<&str>,
        scope: &str,
    ) -> Result<String> {
        let mut url = Url::parse(realm).map_err(|e| {
            RegistryError::Parse(format!("Invalid token realm '{}': {}", realm, e))
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            if !scope.is_empty() {
                query.append_pair("scope", scope);
            }
        }

        self.logger
            .detail(&format!("Requesting token for scope {} from {}", scope, realm));

        let mut request = http.get(url);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request.send().await.map_err(|e| {
            crate::error::handlers::NetworkErrorHandler::handle_network_error(&e, "token request")
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(crate::error::handlers::HttpErrorHandler::handle_registry_error(
                status,
                &body,
                "token request",
            ));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            RegistryError::Parse(format!("Invalid token response: {}", e))
        })?;
        token
            .token
            .or(token.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::Parse("Token response carried no token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge_with_quoted_commas() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull,push""#;
        assert_eq!(
            AuthChallenge::parse(header),
            Some(AuthChallenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/nginx:pull,push".to_string()),
            })
        );
    }

    #[test]
    fn parses_basic_and_rejects_unknown_schemes() {
        assert_eq!(
            AuthChallenge::parse(r#"Basic realm="Harbor""#),
            Some(AuthChallenge::Basic)
        );
        assert_eq!(AuthChallenge::parse("Negotiate abc"), None);
        assert_eq!(AuthChallenge::parse("Bearer service=\"x\""), None);
    }

    #[test]
    fn scopes_follow_registry_conventions() {
        assert_eq!(
            repository_scope("library/nginx", false),
            "repository:library/nginx:pull"
        );
        assert_eq!(
            repository_scope("team/app", true),
            "repository:team/app:pull,push"
        );
    }

    #[tokio::test]
    async fn basic_challenge_without_credentials_is_denied() {
        let auth = Authenticator::new(None, Logger::default());
        let http = Client::new();
        let err = auth
            .negotiate(&http, &AuthChallenge::Basic, CATALOG_SCOPE)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PermissionDenied);
        assert!(auth.cached(CATALOG_SCOPE).is_none());
    }
}
