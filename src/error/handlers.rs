//! Standardized classification of HTTP and network failures

use crate::error::RegistryError;
use reqwest::StatusCode;
use std::error::Error as _;

/// TLS handshake failures that mean the server answered in plaintext HTTP
const SCHEME_MISMATCH_MARKERS: &[&str] = &[
    "server gave http response to https client",
    "wrong version number",
    "packet length too long",
    "invalidcontenttype",
    "received corrupt message",
    "http request to an https server",
];

/// Standard error handler for HTTP responses
pub struct HttpErrorHandler;

impl HttpErrorHandler {
    /// Map a non-success registry response to an error kind
    pub fn handle_registry_error(
        status: StatusCode,
        error_text: &str,
        operation: &str,
    ) -> RegistryError {
        let body = error_text.trim();
        match status.as_u16() {
            401 => RegistryError::PermissionDenied(format!(
                "Unauthorized to perform {}: {}",
                operation, body
            )),
            403 => RegistryError::PermissionDenied(format!(
                "Forbidden: insufficient permissions for {}: {}",
                operation, body
            )),
            404 => RegistryError::NotFound(format!("{}: {}", operation, body)),
            429 => RegistryError::Registry {
                status: 429,
                message: format!("Rate limited during {}: {}", operation, body),
            },
            502 | 503 => RegistryError::Registry {
                status: status.as_u16(),
                message: format!("Registry unavailable for {}: {}", operation, body),
            },
            code => RegistryError::Registry {
                status: code,
                message: format!("{} failed: {}", operation, body),
            },
        }
    }
}

/// Network error categorization and handling
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize network errors, detecting TLS-to-plaintext scheme mismatches
    pub fn handle_network_error(error: &reqwest::Error, context: &str) -> RegistryError {
        let chain = Self::error_chain(error);

        if Self::is_scheme_mismatch(&chain) {
            RegistryError::SchemeMismatch(format!("{}: {}", context, chain))
        } else if error.is_timeout() {
            RegistryError::Transport(format!("{} timeout: {}", context, chain))
        } else if error.is_connect() {
            RegistryError::Transport(format!("Connection error during {}: {}", context, chain))
        } else if error.is_decode() || error.is_body() {
            RegistryError::Transport(format!("Failed to read response for {}: {}", context, chain))
        } else {
            RegistryError::Transport(format!("{} network error: {}", context, chain))
        }
    }

    /// True when a transport failure message indicates a plaintext-only server
    pub fn is_scheme_mismatch(message: &str) -> bool {
        let lower = message.to_lowercase();
        SCHEME_MISMATCH_MARKERS
            .iter()
            .any(|marker| lower.contains(marker))
    }

    /// Flatten an error and its sources into one line
    fn error_chain(error: &reqwest::Error) -> String {
        let mut message = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn status_codes_map_to_kinds() {
        let denied = HttpErrorHandler::handle_registry_error(
            StatusCode::UNAUTHORIZED,
            "{\"errors\":[{\"code\":\"UNAUTHORIZED\"}]}",
            "catalog listing",
        );
        assert_eq!(denied.kind(), ErrorKind::PermissionDenied);

        let missing =
            HttpErrorHandler::handle_registry_error(StatusCode::NOT_FOUND, "", "tag listing");
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let other = HttpErrorHandler::handle_registry_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "boom",
            "manifest upload",
        );
        assert!(matches!(other, RegistryError::Registry { status: 500, .. }));
    }

    #[test]
    fn detects_plaintext_server_messages() {
        assert!(NetworkErrorHandler::is_scheme_mismatch(
            "error trying to connect: error:0A00010B:SSL routines:ssl3_get_record:wrong version number"
        ));
        assert!(NetworkErrorHandler::is_scheme_mismatch(
            "http: server gave HTTP response to HTTPS client"
        ));
        assert!(!NetworkErrorHandler::is_scheme_mismatch(
            "error trying to connect: tcp connect error: Connection refused"
        ));
    }
}
