use std::fmt;

use crossterm::event::KeyEvent;
use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;

use crate::error::{ClipboardError, ConfigError, TokenFetchError, VaultError};

/// Which screen the state machine is on. Exactly one is active at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    ClientList,
    VaultItemSelect,
    ClientForm,
    TokenResult,
    ErrorDisplay { return_to: Box<Mode> },
    DeleteConfirm,
    VaultPasswordPrompt,
    VaultLoginRequired,
}

/// A user intent parked while the vault unlock detour runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Add,
    Edit,
    Token,
}

/// A configured OAuth client as stored in `clients.json`.
///
/// The three override fields are omitted from disk when empty and default to
/// empty when an older file lacks them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthClient {
    pub name: String,
    pub bitwarden_item_id: String,
    pub issuer: String,
    pub scopes: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_id_field: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub client_secret_field: String,
}

impl OAuthClient {
    /// One-line summary shown under the name in the client list.
    pub fn description(&self) -> String {
        let mut desc = if self.issuer.chars().count() > 50 {
            let head: String = self.issuer.chars().take(47).collect();
            format!("{}...", head)
        } else {
            self.issuer.clone()
        };
        if !self.client_id.is_empty() {
            desc.push_str(&format!(" (ID: {})", self.client_id));
        }
        desc
    }
}

/// Process-local identity of a stored client. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientEntry {
    pub key: ClientKey,
    pub client: OAuthClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultStatus {
    Unlocked,
    Locked,
    Unauthenticated,
}

impl VaultStatus {
    /// Maps the `status` string reported by `bw status`. Anything unknown is
    /// treated as the most restrictive state.
    pub fn from_reported(status: &str) -> Self {
        match status {
            "unlocked" => VaultStatus::Unlocked,
            "locked" => VaultStatus::Locked,
            _ => VaultStatus::Unauthenticated,
        }
    }
}

/// Deserializes an explicit JSON `null` as the type's default.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LoginUri {
    #[serde(default, deserialize_with = "nullable")]
    pub uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Login {
    #[serde(default, deserialize_with = "nullable")]
    pub username: String,
    #[serde(default, deserialize_with = "nullable")]
    pub password: String,
    #[serde(default, deserialize_with = "nullable")]
    pub uris: Vec<LoginUri>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CustomField {
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub value: String,
    #[serde(rename = "type", default, deserialize_with = "nullable")]
    pub kind: i64,
}

/// Projection of a vault item returned by `bw list items`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VaultItem {
    pub id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default)]
    pub login: Option<Login>,
}

impl VaultItem {
    pub fn description(&self) -> &str {
        match &self.login {
            Some(login) if !login.username.is_empty() => &login.username,
            _ => &self.id,
        }
    }

    pub fn first_uri(&self) -> Option<&str> {
        self.login
            .as_ref()
            .and_then(|l| l.uris.first())
            .map(|u| u.uri.as_str())
    }
}

/// Full vault record returned by `bw get item`, used for field-path resolution.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VaultRecord {
    pub id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default)]
    pub login: Option<Login>,
    #[serde(default, deserialize_with = "nullable")]
    pub fields: Vec<CustomField>,
    #[serde(default, deserialize_with = "nullable")]
    pub notes: String,
}

impl fmt::Debug for VaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("fields", &self.fields.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OidcConfig {
    #[serde(default)]
    pub token_endpoint: String,
    #[serde(default)]
    pub issuer: String,
}

#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Most recent successful fetch, shown on the token screen.
#[derive(Debug, Clone)]
pub struct TokenOutcome {
    pub token: TokenResponse,
    pub client: OAuthClient,
    pub fetched_at: OffsetDateTime,
}

/// Tags a token fetch so a result for an abandoned request can be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub u64);

/// Everything the state machine reacts to.
#[derive(Debug)]
pub enum AppEvent {
    Key(KeyEvent),
    Tick,
    StatusChecked {
        installed: bool,
        status: VaultStatus,
        session: String,
    },
    Unlocked(Result<String, VaultError>),
    ItemsLoaded(Result<Vec<VaultItem>, VaultError>),
    TokenFetched {
        request: RequestId,
        result: Result<TokenOutcome, TokenFetchError>,
    },
    Copied {
        what: &'static str,
        result: Result<(), ClipboardError>,
    },
    ClientsSaved(Result<(), ConfigError>),
}

/// Side-effecting work requested by the state machine.
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    CheckStatus { session: String },
    Unlock { passphrase: String },
    ListItems { session: String, search: Option<String> },
    FetchToken { request: RequestId, session: String, client: OAuthClient },
    Copy { text: String, what: &'static str },
    SaveClients(Vec<OAuthClient>),
}

impl fmt::Debug for Command {
    // session tokens, passphrases and copied tokens stay out of logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::CheckStatus { session } => f
                .debug_struct("CheckStatus")
                .field("has_session", &!session.is_empty())
                .finish(),
            Command::Unlock { .. } => f.write_str("Unlock"),
            Command::ListItems { search, .. } => {
                f.debug_struct("ListItems").field("search", search).finish()
            }
            Command::FetchToken { request, client, .. } => f
                .debug_struct("FetchToken")
                .field("request", request)
                .field("client", &client.name)
                .finish(),
            Command::Copy { what, .. } => f.debug_struct("Copy").field("what", what).finish(),
            Command::SaveClients(clients) => {
                f.debug_tuple("SaveClients").field(&clients.len()).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_client_defaults_overrides() {
        let raw = r#"{"name":"kc","bitwarden_item_id":"bw-1","issuer":"https://auth","scopes":"openid"}"#;
        let client: OAuthClient = serde_json::from_str(raw).unwrap();
        assert_eq!(client.client_id, "");
        assert_eq!(client.client_id_field, "");
        assert_eq!(client.client_secret_field, "");
    }

    #[test]
    fn test_empty_overrides_are_not_written() {
        let client = OAuthClient {
            name: "kc".into(),
            bitwarden_item_id: "bw-1".into(),
            issuer: "https://auth".into(),
            scopes: String::new(),
            ..Default::default()
        };
        let json = serde_json::to_string(&client).unwrap();
        assert!(!json.contains("client_id\""));
        assert!(json.contains("\"scopes\":\"\""));
    }

    #[test]
    fn test_record_tolerates_nulls() {
        let raw = r#"{"id":"1","name":"x","login":{"username":null,"password":"p","uris":null},"fields":null,"notes":null}"#;
        let record: VaultRecord = serde_json::from_str(raw).unwrap();
        let login = record.login.unwrap();
        assert_eq!(login.username, "");
        assert!(login.uris.is_empty());
        assert!(record.fields.is_empty());
        assert_eq!(record.notes, "");
    }

    #[test]
    fn test_description_truncates_long_issuer() {
        let client = OAuthClient {
            issuer: format!("https://{}", "a".repeat(60)),
            client_id: "svc".into(),
            ..Default::default()
        };
        let desc = client.description();
        assert!(desc.starts_with("https://"));
        assert!(desc.contains("... (ID: svc)"));
        assert_eq!(desc.chars().count(), 50 + " (ID: svc)".len());
    }

    #[test]
    fn test_command_debug_hides_secrets() {
        let cmd = Command::Unlock { passphrase: "hunter2".into() };
        assert!(!format!("{:?}", cmd).contains("hunter2"));
        let cmd = Command::Copy { text: "eyJ.secret".into(), what: "token" };
        assert!(!format!("{:?}", cmd).contains("eyJ"));
    }
}
