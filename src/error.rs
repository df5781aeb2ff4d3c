use std::path::PathBuf;

use thiserror::Error;

/// Failures of the `bw` CLI boundary.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("bw CLI not found on PATH")]
    NotInstalled,
    #[error("unlock failed: {message}")]
    Unlock { message: String },
    #[error("no session token returned")]
    EmptySession,
    #[error("bw {operation}: {output}")]
    Query {
        operation: &'static str,
        output: String,
    },
    #[error("failed to parse bw output: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("failed to run bw: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Field-path resolution against a vault record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("bitwarden item has no login section")]
    NoLogin,
    #[error("custom field {name:?} not found in bitwarden item")]
    NotFound { name: String },
    #[error(
        "unsupported field path: {path} (use login.username, login.password, fields.<name>, or notes)"
    )]
    UnsupportedPath { path: String },
}

/// OIDC discovery and token exchange failures.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("{what} must use HTTPS: {url}")]
    InsecureScheme { what: &'static str, url: String },
    #[error("OIDC discovery returned status {status}")]
    DiscoveryStatus { status: u16 },
    #[error("OIDC discovery response missing token_endpoint")]
    MissingTokenEndpoint,
    #[error("token endpoint returned status {status}: {body}")]
    TokenExchange { status: u16, body: String },
    #[error("{what} timed out")]
    Timeout { what: &'static str },
    #[error("{what} failed: {source}")]
    Transport {
        what: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to parse {what}: {source}")]
    MalformedResponse {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Loading or saving `clients.json`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHomeDir,
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: invalid clients file: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct ClipboardError {
    pub message: String,
}

/// A token fetch failure, tagged with the step that failed.
#[derive(Debug, Error)]
pub enum TokenFetchError {
    #[error("bitwarden: {0}")]
    Vault(#[source] VaultError),
    #[error("resolve client_id ({path}): {source}")]
    ClientId {
        path: String,
        #[source]
        source: FieldError,
    },
    #[error("resolve client_secret ({path}): {source}")]
    ClientSecret {
        path: String,
        #[source]
        source: FieldError,
    },
    #[error("oidc discovery: {0}")]
    Discovery(#[source] OAuthError),
    #[error("token request: {0}")]
    Exchange(#[source] OAuthError),
}

impl TokenFetchError {
    /// True when the vault CLI itself failed, meaning the session can no
    /// longer be trusted. A record that came back but could not be parsed
    /// does not count.
    pub fn is_vault_error(&self) -> bool {
        matches!(
            self,
            TokenFetchError::Vault(
                VaultError::Query { .. } | VaultError::Spawn(_) | VaultError::NotInstalled
            )
        )
    }
}
