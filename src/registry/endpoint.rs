//! Registry endpoint settings and HTTP client construction
//!
//! Hosts are normalized once here: schemes are stripped (an explicit `http://`
//! is remembered as a plaintext request) and the Docker Hub aliases collapse to
//! `docker.io`, which is contacted at `registry-1.docker.io`.

use crate::error::{RegistryError, Result};
use reqwest::{Client, Proxy};
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

pub const DOCKER_HUB: &str = "docker.io";
pub const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
const DOCKER_HUB_ALIASES: &[&str] = &[
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "registry.hub.docker.com",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Https,
    Http,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

/// Username/password pair for a registry
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// `None` unless a username is given
    pub fn from_parts(username: Option<&str>, password: Option<&str>) -> Option<Self> {
        let username = username.map(str::trim).filter(|u| !u.is_empty())?;
        Some(Self {
            username: username.to_string(),
            password: password.unwrap_or_default().to_string(),
        })
    }
}

/// Split a configured registry address into a normalized host and an explicit scheme
pub fn normalize_host(address: &str) -> (String, Option<Scheme>) {
    let trimmed = address.trim();
    let (rest, scheme) = if let Some(rest) = trimmed.strip_prefix("https://") {
        (rest, Some(Scheme::Https))
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        (rest, Some(Scheme::Http))
    } else {
        (trimmed, None)
    };
    let host = rest.split('/').next().unwrap_or(rest).to_lowercase();
    if DOCKER_HUB_ALIASES.contains(&host.as_str()) {
        (DOCKER_HUB.to_string(), scheme)
    } else {
        (host, scheme)
    }
}

/// Host to put on the wire for a normalized host
pub fn api_host(host: &str) -> &str {
    if host == DOCKER_HUB {
        DOCKER_HUB_API_HOST
    } else {
        host
    }
}

/// Connection settings for one registry host
#[derive(Debug, Clone)]
pub struct RegistryEndpoint {
    pub host: String,
    pub scheme: Option<Scheme>,
    pub credentials: Option<Credentials>,
    pub insecure: bool,
}

impl RegistryEndpoint {
    pub fn new(address: &str) -> Self {
        let (host, scheme) = normalize_host(address);
        Self {
            host,
            scheme,
            credentials: None,
            insecure: false,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn api_host(&self) -> &str {
        api_host(&self.host)
    }

    /// Scheme tried first; insecure hosts may still fall back to http later
    pub fn initial_scheme(&self) -> Scheme {
        self.scheme.unwrap_or(Scheme::Https)
    }

    /// Plaintext fallback allowed only for insecure hosts without an explicit scheme
    pub fn allows_plaintext_fallback(&self) -> bool {
        self.insecure && self.scheme.is_none()
    }

    pub fn base_url(&self, scheme: Scheme) -> String {
        format!("{}://{}", scheme.as_str(), self.api_host())
    }
}

/// One rule of a no-proxy list
#[derive(Debug, Clone, PartialEq, Eq)]
enum NoProxyRule {
    Everything,
    Network { addr: IpAddr, prefix: u8 },
    Domain { name: String, port: Option<u16> },
}

impl NoProxyRule {
    fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim().to_lowercase();
        if entry.is_empty() {
            return None;
        }
        if entry == "*" {
            return Some(NoProxyRule::Everything);
        }
        if let Some((addr, prefix)) = entry.split_once('/') {
            let addr: IpAddr = addr.parse().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            return Some(NoProxyRule::Network { addr, prefix });
        }
        if let Ok(addr) = entry.trim_matches(['[', ']']).parse::<IpAddr>() {
            let prefix = if addr.is_ipv4() { 32 } else { 128 };
            return Some(NoProxyRule::Network { addr, prefix });
        }
        let (name, port) = match entry.rsplit_once(':') {
            Some((name, port)) => match port.parse() {
                Ok(port) => (name, Some(port)),
                Err(_) => (entry.as_str(), None),
            },
            None => (entry.as_str(), None),
        };
        let name = name.trim_start_matches("*.").trim_start_matches('.');
        Some(NoProxyRule::Domain {
            name: name.to_string(),
            port,
        })
    }

    fn matches(&self, host: &str, port: Option<u16>) -> bool {
        match self {
            NoProxyRule::Everything => true,
            NoProxyRule::Network { addr, prefix } => host
                .trim_matches(['[', ']'])
                .parse::<IpAddr>()
                .is_ok_and(|ip| in_network(ip, *addr, *prefix)),
            NoProxyRule::Domain { name, port: rule_port } => {
                let port_ok = rule_port.is_none() || *rule_port == port;
                let name_ok = host == name || host.ends_with(&format!(".{}", name));
                port_ok && name_ok
            }
        }
    }
}

fn in_network(ip: IpAddr, network: IpAddr, prefix: u8) -> bool {
    match (ip, network) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let prefix = u32::from(prefix.min(32));
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            u32::from(ip) & mask == u32::from(net) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let prefix = u32::from(prefix.min(128));
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            u128::from(ip) & mask == u128::from(net) & mask
        }
        _ => false,
    }
}

/// Outbound proxy with its bypass list
#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
    proxy: Option<Url>,
    no_proxy: Vec<NoProxyRule>,
}

impl ProxySettings {
    /// `no_proxy` is a comma separated list of hosts, domains, IPs and CIDR ranges
    pub fn new(proxy: Option<&str>, no_proxy: Option<&str>) -> Result<Self> {
        let proxy = match proxy.map(str::trim).filter(|p| !p.is_empty()) {
            Some(raw) => {
                let with_scheme = if raw.contains("://") {
                    raw.to_string()
                } else {
                    format!("http://{}", raw)
                };
                Some(Url::parse(&with_scheme).map_err(|e| {
                    RegistryError::Config(format!("Invalid proxy address '{}': {}", raw, e))
                })?)
            }
            None => None,
        };
        let no_proxy = no_proxy
            .unwrap_or_default()
            .split(',')
            .filter_map(NoProxyRule::parse)
            .collect();
        Ok(Self { proxy, no_proxy })
    }

    pub fn proxy_url(&self) -> Option<&Url> {
        self.proxy.as_ref()
    }

    pub fn bypasses(&self, host: &str, port: Option<u16>) -> bool {
        let host = host.to_lowercase();
        self.no_proxy.iter().any(|rule| rule.matches(&host, port))
    }

    /// Proxy to use for a request URL, if any
    pub fn proxy_for(&self, url: &Url) -> Option<Url> {
        let proxy = self.proxy.as_ref()?;
        let host = url.host_str()?;
        if self.bypasses(host, url.port_or_known_default()) {
            None
        } else {
            Some(proxy.clone())
        }
    }
}

/// Build the HTTP client for one registry or management endpoint.
///
/// Without a configured proxy reqwest keeps honouring the environment proxies.
pub fn build_http_client(
    insecure: bool,
    proxy: &ProxySettings,
    timeout: Option<Duration>,
) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(concat!("registry-migrator/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30));

    if insecure {
        builder = builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if proxy.proxy_url().is_some() {
        let settings = proxy.clone();
        builder = builder.proxy(Proxy::custom(move |url| settings.proxy_for(url)));
    }

    builder
        .build()
        .map_err(|e| RegistryError::Transport(format!("Failed to create HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_hub_aliases_collapse() {
        assert_eq!(normalize_host("index.docker.io").0, DOCKER_HUB);
        assert_eq!(normalize_host("https://registry-1.docker.io/").0, DOCKER_HUB);
        assert_eq!(api_host(DOCKER_HUB), DOCKER_HUB_API_HOST);
        assert_eq!(api_host("harbor.local:8443"), "harbor.local:8443");
    }

    #[test]
    fn explicit_http_scheme_is_kept() {
        let endpoint = RegistryEndpoint::new("http://registry.local:5000").with_insecure(true);
        assert_eq!(endpoint.host, "registry.local:5000");
        assert_eq!(endpoint.initial_scheme(), Scheme::Http);
        assert!(!endpoint.allows_plaintext_fallback());

        let endpoint = RegistryEndpoint::new("registry.local:5000").with_insecure(true);
        assert_eq!(endpoint.initial_scheme(), Scheme::Https);
        assert!(endpoint.allows_plaintext_fallback());
    }

    #[test]
    fn no_proxy_rules_match_domains_ports_and_networks() {
        let settings = ProxySettings::new(
            Some("proxy.corp:3128"),
            Some("localhost, .internal.corp,harbor.local:8443,10.0.0.0/8"),
        )
        .unwrap();

        assert_eq!(settings.proxy_url().unwrap().as_str(), "http://proxy.corp:3128/");
        assert!(settings.bypasses("localhost", Some(5000)));
        assert!(settings.bypasses("registry.internal.corp", Some(443)));
        assert!(settings.bypasses("harbor.local", Some(8443)));
        assert!(!settings.bypasses("harbor.local", Some(443)));
        assert!(settings.bypasses("10.20.30.40", Some(443)));
        assert!(!settings.bypasses("registry-1.docker.io", Some(443)));

        let url = Url::parse("https://registry-1.docker.io/v2/").unwrap();
        assert!(settings.proxy_for(&url).is_some());
        let url = Url::parse("https://10.1.1.1/v2/").unwrap();
        assert!(settings.proxy_for(&url).is_none());
    }

    #[test]
    fn credentials_require_username() {
        assert!(Credentials::from_parts(None, Some("secret")).is_none());
        assert!(Credentials::from_parts(Some(" "), Some("secret")).is_none());
        let creds = Credentials::from_parts(Some("robot"), None).unwrap();
        assert_eq!(creds.password, "");
        assert!(!format!("{:?}", creds).contains("secret"));
    }
}
