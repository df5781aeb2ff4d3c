use std::sync::Arc;

use clipboard::{ClipboardContext, ClipboardProvider};
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task;
use tracing::{debug, info, warn};

use crate::error::{ClipboardError, ConfigError, TokenFetchError};
use crate::model::{AppEvent, Command, OAuthClient, TokenOutcome, VaultRecord, VaultStatus};
use crate::oauth::TokenClient;
use crate::store::ClientStore;
use crate::vault::{Bitwarden, DEFAULT_CLIENT_ID_FIELD, DEFAULT_CLIENT_SECRET_FIELD, resolve_field};

/// Runs each [`Command`] as a background task that reports back with exactly
/// one [`AppEvent`]. No retries and no deduplication.
///
/// Saves are the exception to running side by side: they go through a single
/// writer task and hit the disk in the order they were dispatched.
#[derive(Clone)]
pub struct Dispatcher {
    tx: UnboundedSender<AppEvent>,
    vault: Arc<Bitwarden>,
    oauth: Arc<TokenClient>,
    store: Arc<ClientStore>,
    saves: UnboundedSender<Vec<OAuthClient>>,
}

impl Dispatcher {
    /// Must be called from inside a Tokio runtime; it starts the writer task.
    pub fn new(
        tx: UnboundedSender<AppEvent>,
        vault: Bitwarden,
        oauth: TokenClient,
        store: ClientStore,
    ) -> Self {
        let store = Arc::new(store);
        let (saves, queued) = mpsc::unbounded_channel();
        tokio::spawn(write_in_order(store.clone(), queued, tx.clone()));
        Self {
            tx,
            vault: Arc::new(vault),
            oauth: Arc::new(oauth),
            store,
            saves,
        }
    }

    pub fn dispatch(&self, command: Command) {
        debug!("dispatching {:?}", command);
        if let Command::SaveClients(clients) = command {
            if let Err(mpsc::error::SendError(clients)) = self.saves.send(clients) {
                warn!("writer task gone; saving directly");
                self.spawn(Command::SaveClients(clients));
            }
            return;
        }
        self.spawn(command);
    }

    fn spawn(&self, command: Command) {
        let tx = self.tx.clone();
        let vault = self.vault.clone();
        let oauth = self.oauth.clone();
        let store = self.store.clone();
        tokio::spawn(async move {
            let event = run(command, &vault, &oauth, &store).await;
            if tx.send(event).is_err() {
                debug!("event loop closed; dropping result");
            }
        });
    }
}

/// Writes queued client lists one at a time, reporting each.
async fn write_in_order(
    store: Arc<ClientStore>,
    mut queued: UnboundedReceiver<Vec<OAuthClient>>,
    tx: UnboundedSender<AppEvent>,
) {
    while let Some(clients) = queued.recv().await {
        let result = save_clients(&store, clients).await;
        if tx.send(AppEvent::ClientsSaved(result)).is_err() {
            debug!("event loop closed; save result dropped");
        }
    }
}

/// Executes one command to completion.
pub async fn run(
    command: Command,
    vault: &Bitwarden,
    oauth: &TokenClient,
    store: &ClientStore,
) -> AppEvent {
    match command {
        Command::CheckStatus { session } => {
            let installed = vault.is_installed();
            let status = if installed {
                vault.status(&session).await
            } else {
                VaultStatus::Unauthenticated
            };
            info!("vault status: installed={} status={:?}", installed, status);
            AppEvent::StatusChecked {
                installed,
                status,
                session,
            }
        }
        Command::Unlock { passphrase } => AppEvent::Unlocked(vault.unlock(&passphrase).await),
        Command::ListItems { session, search } => {
            AppEvent::ItemsLoaded(vault.list_items(&session, search.as_deref()).await)
        }
        Command::FetchToken {
            request,
            session,
            client,
        } => AppEvent::TokenFetched {
            request,
            result: fetch_token(vault, oauth, &session, client).await,
        },
        Command::Copy { text, what } => AppEvent::Copied {
            what,
            result: copy_to_clipboard(text).await,
        },
        Command::SaveClients(clients) => {
            AppEvent::ClientsSaved(save_clients(store, clients).await)
        }
    }
}

/// Vault record -> client id -> client secret -> discovery -> exchange.
/// The first failing step ends the sequence.
pub async fn fetch_token(
    vault: &Bitwarden,
    oauth: &TokenClient,
    session: &str,
    client: OAuthClient,
) -> Result<TokenOutcome, TokenFetchError> {
    let record = vault
        .fetch_item(session, &client.bitwarden_item_id)
        .await
        .map_err(TokenFetchError::Vault)?;
    let (client_id, client_secret) = resolve_credentials(&record, &client)?;
    let oidc = oauth
        .discover(&client.issuer)
        .await
        .map_err(TokenFetchError::Discovery)?;
    let token = oauth
        .exchange_client_credentials(&oidc.token_endpoint, &client_id, &client_secret, &client.scopes)
        .await
        .map_err(TokenFetchError::Exchange)?;
    info!("token fetched for '{}' (expires in {}s)", client.name, token.expires_in);
    Ok(TokenOutcome {
        token,
        client,
        fetched_at: OffsetDateTime::now_utc(),
    })
}

/// Client id: manual override, else the configured or default field path.
/// Client secret: always read from the vault record.
pub fn resolve_credentials(
    record: &VaultRecord,
    client: &OAuthClient,
) -> Result<(String, String), TokenFetchError> {
    let client_id = if client.client_id.is_empty() {
        let path = field_or(&client.client_id_field, DEFAULT_CLIENT_ID_FIELD);
        resolve_field(record, path).map_err(|source| TokenFetchError::ClientId {
            path: path.to_string(),
            source,
        })?
    } else {
        client.client_id.clone()
    };
    let path = field_or(&client.client_secret_field, DEFAULT_CLIENT_SECRET_FIELD);
    let client_secret = resolve_field(record, path).map_err(|source| TokenFetchError::ClientSecret {
        path: path.to_string(),
        source,
    })?;
    Ok((client_id, client_secret))
}

fn field_or<'a>(configured: &'a str, default: &'a str) -> &'a str {
    if configured.is_empty() { default } else { configured }
}

async fn copy_to_clipboard(text: String) -> Result<(), ClipboardError> {
    task::spawn_blocking(move || {
        let mut ctx: ClipboardContext = ClipboardProvider::new().map_err(|e| ClipboardError {
            message: format!("clipboard init error: {}", e),
        })?;
        ctx.set_contents(text).map_err(|e| ClipboardError {
            message: e.to_string(),
        })
    })
    .await
    .unwrap_or_else(|e| {
        Err(ClipboardError {
            message: e.to_string(),
        })
    })
}

async fn save_clients(store: &ClientStore, clients: Vec<OAuthClient>) -> Result<(), ConfigError> {
    let path = store.path().to_path_buf();
    let store = store.clone();
    task::spawn_blocking(move || store.save(&clients))
        .await
        .unwrap_or_else(|e| {
            warn!("save task failed: {}", e);
            Err(ConfigError::Io {
                path,
                source: std::io::Error::other(e),
            })
        })
}
