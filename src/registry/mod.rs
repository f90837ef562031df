//! Registry access over the Docker Registry v2 / OCI distribution API
//!
//! - [`endpoint`]: host normalization, proxy rules, HTTP client construction
//! - [`auth`]: challenge parsing and per-scope authorization cache
//! - [`transport`]: the [`RegistryApi`] trait and cancellation helper
//! - [`client`]: the HTTP implementation
//! - [`pool`]: one client per host

pub mod auth;
pub mod client;
pub mod endpoint;
pub mod pool;
pub mod transport;

pub use client::RegistryClient;
pub use endpoint::{Credentials, ProxySettings, RegistryEndpoint};
pub use pool::{ClientPool, RegistryProvider};
pub use transport::{cancellable, BlobStream, RegistryApi, RemoteDescriptor};
