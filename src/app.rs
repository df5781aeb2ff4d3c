use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use ratatui::widgets::ListState;
use throbber_widgets_tui::ThrobberState;
use tracing::{debug, info, warn};

use crate::error::{ClipboardError, ConfigError, TokenFetchError, VaultError};
use crate::model::{
    AppEvent, ClientEntry, ClientKey, Command, Mode, OAuthClient, PendingAction, RequestId,
    TokenOutcome, VaultItem, VaultStatus,
};

/// Labels and placeholders of the client form, in field order.
pub const FORM_FIELDS: [(&str, &str); 6] = [
    ("Display Name", "e.g., keycloak-dev"),
    ("Client ID", "leave empty to pull from Bitwarden"),
    ("Client ID Field", "login.username"),
    ("Client Secret Field", "login.password"),
    ("Issuer URL", "https://auth.example.com/realms/myrealm"),
    ("Scopes (space-separated)", "openid profile email"),
];

/// A list with an optional fuzzy filter. `visible` holds indices into the
/// backing collection, best match first.
#[derive(Debug, Clone, Default)]
pub struct FilteredList {
    pub query: String,
    pub filtering: bool,
    visible: Vec<usize>,
    pub state: ListState,
}

impl FilteredList {
    /// Recomputes the visible rows, keeping the cursor in range.
    pub fn refresh<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        let names: Vec<&str> = names.into_iter().collect();
        if self.query.is_empty() {
            self.visible = (0..names.len()).collect();
        } else {
            let matcher = SkimMatcherV2::default();
            let mut results: Vec<(i64, usize)> = names
                .iter()
                .enumerate()
                .filter_map(|(i, name)| matcher.fuzzy_match(name, &self.query).map(|score| (score, i)))
                .collect();
            results.sort_by(|a, b| b.0.cmp(&a.0));
            self.visible = results.into_iter().map(|(_, i)| i).collect();
        }
        if self.visible.is_empty() {
            self.state.select(None);
        } else {
            let cursor = self.state.selected().unwrap_or(0).min(self.visible.len() - 1);
            self.state.select(Some(cursor));
        }
    }

    pub fn visible(&self) -> &[usize] {
        &self.visible
    }

    /// Index into the backing collection of the highlighted row.
    pub fn selected(&self) -> Option<usize> {
        self.state.selected().and_then(|i| self.visible.get(i).copied())
    }

    pub fn select_first(&mut self) {
        self.state.select(if self.visible.is_empty() { None } else { Some(0) });
    }

    pub fn next(&mut self) {
        if let Some(i) = self.state.selected() {
            if i + 1 < self.visible.len() {
                self.state.select(Some(i + 1));
            }
        }
    }

    pub fn prev(&mut self) {
        if let Some(i) = self.state.selected() {
            self.state.select(Some(i.saturating_sub(1)));
        }
    }

    pub fn clear_filter(&mut self) {
        self.query.clear();
        self.filtering = false;
    }

    /// Handles a key while the filter is being typed. Returns true when the
    /// query changed and the rows need recomputing.
    fn edit_filter(&mut self, code: KeyCode) -> bool {
        match code {
            KeyCode::Esc => {
                self.clear_filter();
                true
            }
            KeyCode::Enter => {
                self.filtering = false;
                false
            }
            KeyCode::Backspace => self.query.pop().is_some(),
            KeyCode::Char(c) => {
                self.query.push(c);
                true
            }
            KeyCode::Down => {
                self.next();
                false
            }
            KeyCode::Up => {
                self.prev();
                false
            }
            _ => false,
        }
    }
}

/// Single-line text input; `masked` hides the contents when drawn.
#[derive(Debug, Clone, Default)]
pub struct TextInput {
    pub value: String,
    pub masked: bool,
}

impl TextInput {
    pub fn masked() -> Self {
        Self {
            value: String::new(),
            masked: true,
        }
    }

    pub fn clear(&mut self) {
        self.value.clear();
    }

    pub fn display(&self) -> String {
        if self.masked {
            "*".repeat(self.value.chars().count())
        } else {
            self.value.clone()
        }
    }

    fn handle(&mut self, code: KeyCode) {
        match code {
            KeyCode::Backspace => {
                self.value.pop();
            }
            KeyCode::Char(c) => self.value.push(c),
            _ => {}
        }
    }
}

/// Add/edit form over a draft client.
#[derive(Debug, Clone)]
pub struct ClientForm {
    pub draft: OAuthClient,
    pub focus: usize,
}

impl ClientForm {
    pub fn new(draft: OAuthClient) -> Self {
        Self { draft, focus: 0 }
    }

    pub fn field(&self, index: usize) -> &str {
        let d = &self.draft;
        match index {
            0 => &d.name,
            1 => &d.client_id,
            2 => &d.client_id_field,
            3 => &d.client_secret_field,
            4 => &d.issuer,
            _ => &d.scopes,
        }
    }

    fn focused_mut(&mut self) -> &mut String {
        let d = &mut self.draft;
        match self.focus {
            0 => &mut d.name,
            1 => &mut d.client_id,
            2 => &mut d.client_id_field,
            3 => &mut d.client_secret_field,
            4 => &mut d.issuer,
            _ => &mut d.scopes,
        }
    }

    fn is_last(&self) -> bool {
        self.focus + 1 == FORM_FIELDS.len()
    }
}

/// What a form key press asks the state machine to do.
enum FormStep {
    Stay,
    Submit,
    Abort,
}

/// The orchestration state. All mutation happens in [`App::update`], one
/// event at a time; side effects leave as [`Command`]s.
pub struct App {
    pub mode: Mode,
    pub clients: Vec<ClientEntry>,
    next_key: u64,
    pub client_list: FilteredList,

    pub vault_items: Vec<VaultItem>,
    pub item_list: FilteredList,

    pub status_message: Option<String>,
    pub error_message: String,

    pub session: String,
    pub vault_installed: bool,
    pub vault_status: VaultStatus,
    pub vault_unlocked: bool,
    pub vault_checking: bool,
    pub unlocking: bool,
    pub unlock_error: Option<String>,
    pub password: TextInput,

    pub pending_action: Option<PendingAction>,
    pub form: Option<ClientForm>,
    pub editing: Option<ClientKey>,
    pub delete_target: Option<ClientKey>,

    pub token_outcome: Option<TokenOutcome>,
    pub token_loading: bool,
    token_request: Option<RequestId>,
    next_request: u64,

    saves_held: Option<String>,

    pub throbber_state: ThrobberState,
    pub should_quit: bool,
}

impl App {
    pub fn new(clients: Vec<OAuthClient>, session: String) -> Self {
        let mut app = Self {
            mode: Mode::ClientList,
            clients: Vec::new(),
            next_key: 0,
            client_list: FilteredList::default(),
            vault_items: Vec::new(),
            item_list: FilteredList::default(),
            status_message: None,
            error_message: String::new(),
            session,
            vault_installed: false,
            vault_status: VaultStatus::Unauthenticated,
            vault_unlocked: false,
            vault_checking: true,
            unlocking: false,
            unlock_error: None,
            password: TextInput::masked(),
            pending_action: None,
            form: None,
            editing: None,
            delete_target: None,
            token_outcome: None,
            token_loading: false,
            token_request: None,
            next_request: 0,
            saves_held: None,
            throbber_state: ThrobberState::default(),
            should_quit: false,
        };
        for client in clients {
            app.insert_client(client);
        }
        app.refresh_clients();
        app.client_list.select_first();
        app
    }

    /// Commands to run once the event loop is up.
    pub fn startup_commands(&self) -> Vec<Command> {
        vec![Command::CheckStatus {
            session: self.session.clone(),
        }]
    }

    pub fn is_busy(&self) -> bool {
        self.vault_checking || self.unlocking || self.token_loading
    }

    pub fn is_editing(&self) -> bool {
        self.editing.is_some()
    }

    /// Client list as it is written to disk.
    pub fn persisted_clients(&self) -> Vec<OAuthClient> {
        self.clients.iter().map(|e| e.client.clone()).collect()
    }

    pub fn selected_client(&self) -> Option<&ClientEntry> {
        self.client_list.selected().and_then(|i| self.clients.get(i))
    }

    pub fn selected_item(&self) -> Option<&VaultItem> {
        self.item_list.selected().and_then(|i| self.vault_items.get(i))
    }

    pub fn delete_candidate(&self) -> Option<&ClientEntry> {
        let key = self.delete_target?;
        self.clients.iter().find(|e| e.key == key)
    }

    fn insert_client(&mut self, client: OAuthClient) -> ClientKey {
        let key = ClientKey(self.next_key);
        self.next_key += 1;
        self.clients.push(ClientEntry { key, client });
        key
    }

    fn refresh_clients(&mut self) {
        self.client_list
            .refresh(self.clients.iter().map(|e| e.client.name.as_str()));
    }

    fn refresh_items(&mut self) {
        self.item_list
            .refresh(self.vault_items.iter().map(|i| i.name.as_str()));
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            debug!("mode {:?} -> {:?}", self.mode, mode);
        }
        self.mode = mode;
    }

    /// Stops every later save, keeping whatever is on disk. Used when the
    /// clients file could not be read and no copy of it could be made.
    pub fn hold_saves(&mut self, reason: String) {
        warn!("saving disabled: {}", reason);
        self.saves_held = Some(reason);
    }

    fn save(&mut self) -> Vec<Command> {
        if let Some(reason) = &self.saves_held {
            self.status_message = Some(format!("Not saved: {}", reason));
            return Vec::new();
        }
        vec![Command::SaveClients(self.persisted_clients())]
    }

    /// Applies one event and returns the commands it triggers.
    pub fn update(&mut self, event: AppEvent) -> Vec<Command> {
        match event {
            AppEvent::Key(key) => self.handle_key(key),
            AppEvent::Tick => {
                if self.is_busy() {
                    self.throbber_state.calc_next();
                }
                Vec::new()
            }
            AppEvent::StatusChecked {
                installed,
                status,
                session,
            } => self.on_status(installed, status, session),
            AppEvent::Unlocked(result) => self.on_unlocked(result),
            AppEvent::ItemsLoaded(result) => self.on_items(result),
            AppEvent::TokenFetched { request, result } => self.on_token(request, result),
            AppEvent::Copied { what, result } => {
                self.on_copied(what, result);
                Vec::new()
            }
            AppEvent::ClientsSaved(result) => {
                self.on_saved(result);
                Vec::new()
            }
        }
    }

    fn on_status(&mut self, installed: bool, status: VaultStatus, session: String) -> Vec<Command> {
        self.vault_checking = false;
        self.vault_installed = installed;
        self.vault_status = status;
        if !session.is_empty() {
            self.session = session;
        }
        if !installed {
            self.vault_unlocked = false;
            self.status_message = Some("bw CLI not found".into());
            self.set_mode(Mode::VaultLoginRequired);
            return Vec::new();
        }
        match status {
            VaultStatus::Unauthenticated => {
                self.vault_unlocked = false;
                self.status_message = Some("Not logged in to Bitwarden".into());
                self.set_mode(Mode::VaultLoginRequired);
                Vec::new()
            }
            VaultStatus::Locked => {
                self.vault_unlocked = false;
                self.status_message = Some("Vault locked".into());
                self.open_password_prompt();
                Vec::new()
            }
            VaultStatus::Unlocked => {
                self.vault_unlocked = true;
                self.status_message = Some("Vault unlocked".into());
                vec![self.list_items()]
            }
        }
    }

    fn on_unlocked(&mut self, result: Result<String, VaultError>) -> Vec<Command> {
        match result {
            Err(e) => {
                warn!("vault unlock failed: {}", e);
                self.unlocking = false;
                self.password.clear();
                self.unlock_error = Some(e.to_string());
                Vec::new()
            }
            Ok(session) => {
                info!("vault unlocked");
                // stays busy until the item list arrives
                self.session = session;
                self.vault_unlocked = true;
                self.vault_status = VaultStatus::Unlocked;
                self.unlock_error = None;
                self.status_message = Some("Vault unlocked".into());
                vec![self.list_items()]
            }
        }
    }

    fn on_items(&mut self, result: Result<Vec<VaultItem>, VaultError>) -> Vec<Command> {
        self.unlocking = false;
        self.password.clear();
        match result {
            Ok(items) => {
                debug!("loaded {} vault item(s)", items.len());
                self.vault_items = items;
                self.item_list.clear_filter();
                self.refresh_items();
                self.item_list.select_first();
            }
            Err(e) => {
                warn!("listing vault items failed: {}", e);
                self.status_message = Some(format!("Failed to load vault items: {}", e));
            }
        }

        match self.pending_action.take() {
            Some(action) => {
                debug!("resuming pending action {:?}", action);
                match action {
                    PendingAction::Add => {
                        self.begin_add();
                        Vec::new()
                    }
                    PendingAction::Edit => {
                        self.begin_edit();
                        Vec::new()
                    }
                    PendingAction::Token => self.begin_token_fetch(),
                }
            }
            None => {
                if matches!(self.mode, Mode::VaultPasswordPrompt | Mode::VaultLoginRequired) {
                    self.set_mode(Mode::ClientList);
                }
                Vec::new()
            }
        }
    }

    fn on_token(
        &mut self,
        request: RequestId,
        result: Result<TokenOutcome, TokenFetchError>,
    ) -> Vec<Command> {
        // a failed vault call condemns the session even if nobody waits for the result
        if let Err(e) = &result {
            if e.is_vault_error() {
                warn!("vault error during token fetch, session invalidated: {}", e);
                self.invalidate_vault();
            }
        }
        if self.token_request != Some(request) {
            debug!("discarding result of abandoned token request {:?}", request);
            return Vec::new();
        }
        self.token_request = None;
        self.token_loading = false;
        match result {
            Ok(outcome) => {
                self.token_outcome = Some(outcome);
            }
            Err(e) => {
                warn!("token fetch failed: {}", e);
                self.show_error(e.to_string(), Mode::TokenResult);
            }
        }
        Vec::new()
    }

    fn invalidate_vault(&mut self) {
        self.vault_unlocked = false;
        if self.vault_status == VaultStatus::Unlocked {
            self.vault_status = VaultStatus::Locked;
        }
    }

    fn on_copied(&mut self, what: &'static str, result: Result<(), ClipboardError>) {
        self.status_message = Some(match result {
            Ok(()) => format!("Copied {} to clipboard", what),
            Err(e) => format!("Failed to copy: {}", e),
        });
    }

    fn on_saved(&mut self, result: Result<(), ConfigError>) {
        match result {
            Ok(()) => self.status_message = Some("Client saved".into()),
            Err(e) => {
                warn!("saving clients failed: {}", e);
                self.status_message = Some(format!("Error saving: {}", e));
            }
        }
    }

    fn show_error(&mut self, message: String, return_to: Mode) {
        self.error_message = message;
        self.set_mode(Mode::ErrorDisplay {
            return_to: Box::new(return_to),
        });
    }

    fn list_items(&self) -> Command {
        Command::ListItems {
            session: self.session.clone(),
            search: None,
        }
    }

    fn open_password_prompt(&mut self) {
        self.password.clear();
        self.unlock_error = None;
        self.set_mode(Mode::VaultPasswordPrompt);
    }

    /// Detour for actions that need an unlocked vault.
    fn require_unlock(&mut self, action: PendingAction) {
        self.pending_action = Some(action);
        if self.vault_checking {
            self.status_message = Some("Checking Bitwarden status...".into());
            return;
        }
        if !self.vault_installed || self.vault_status == VaultStatus::Unauthenticated {
            self.set_mode(Mode::VaultLoginRequired);
        } else {
            self.open_password_prompt();
        }
    }

    fn begin_add(&mut self) {
        self.editing = None;
        self.form = Some(ClientForm::new(OAuthClient::default()));
        self.item_list.clear_filter();
        self.refresh_items();
        self.item_list.select_first();
        self.set_mode(Mode::VaultItemSelect);
    }

    fn begin_edit(&mut self) {
        let Some(entry) = self.selected_client().cloned() else {
            return;
        };
        self.editing = Some(entry.key);
        self.form = Some(ClientForm::new(entry.client));
        self.set_mode(Mode::ClientForm);
    }

    fn begin_token_fetch(&mut self) -> Vec<Command> {
        let Some(entry) = self.selected_client().cloned() else {
            return Vec::new();
        };
        let request = RequestId(self.next_request);
        self.next_request += 1;
        self.token_request = Some(request);
        self.token_loading = true;
        self.token_outcome = None;
        self.set_mode(Mode::TokenResult);
        info!("fetching token for '{}'", entry.client.name);
        vec![Command::FetchToken {
            request,
            session: self.session.clone(),
            client: entry.client,
        }]
    }

    fn handle_key(&mut self, key: KeyEvent) -> Vec<Command> {
        if key.kind != KeyEventKind::Press {
            return Vec::new();
        }
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.should_quit = true;
            return Vec::new();
        }
        match self.mode {
            Mode::ClientList => self.handle_list_key(key.code),
            Mode::VaultItemSelect => {
                self.handle_item_select_key(key.code);
                Vec::new()
            }
            Mode::ClientForm => self.handle_form_key(key.code),
            Mode::TokenResult => self.handle_token_key(key.code),
            Mode::ErrorDisplay { .. } => {
                self.handle_error_key(key.code);
                Vec::new()
            }
            Mode::DeleteConfirm => self.handle_delete_key(key.code),
            Mode::VaultPasswordPrompt => self.handle_password_key(key.code),
            Mode::VaultLoginRequired => self.handle_login_key(key.code),
        }
    }

    fn handle_list_key(&mut self, code: KeyCode) -> Vec<Command> {
        if self.client_list.filtering {
            if self.client_list.edit_filter(code) {
                self.refresh_clients();
                self.client_list.select_first();
            }
            return Vec::new();
        }
        match code {
            KeyCode::Char('q') => self.should_quit = true,
            KeyCode::Esc => {
                if !self.client_list.query.is_empty() {
                    self.client_list.clear_filter();
                    self.refresh_clients();
                }
            }
            KeyCode::Down | KeyCode::Char('j') => self.client_list.next(),
            KeyCode::Up | KeyCode::Char('k') => self.client_list.prev(),
            KeyCode::Char('/') => {
                self.client_list.filtering = true;
                self.client_list.query.clear();
            }
            KeyCode::Enter => {
                if self.selected_client().is_some() {
                    if !self.vault_unlocked {
                        self.require_unlock(PendingAction::Token);
                        return Vec::new();
                    }
                    return self.begin_token_fetch();
                }
            }
            KeyCode::Char('a') => {
                if !self.vault_unlocked {
                    self.require_unlock(PendingAction::Add);
                } else {
                    self.begin_add();
                }
            }
            KeyCode::Char('e') => {
                if self.selected_client().is_some() {
                    if !self.vault_unlocked {
                        self.require_unlock(PendingAction::Edit);
                    } else {
                        self.begin_edit();
                    }
                }
            }
            KeyCode::Char('d') | KeyCode::Char('x') => {
                if let Some(key) = self.selected_client().map(|e| e.key) {
                    self.delete_target = Some(key);
                    self.set_mode(Mode::DeleteConfirm);
                }
            }
            _ => {}
        }
        Vec::new()
    }

    fn handle_item_select_key(&mut self, code: KeyCode) {
        if self.item_list.filtering {
            if self.item_list.edit_filter(code) {
                self.refresh_items();
                self.item_list.select_first();
            }
            return;
        }
        match code {
            KeyCode::Esc => {
                self.form = None;
                self.set_mode(Mode::ClientList);
            }
            KeyCode::Down | KeyCode::Char('j') => self.item_list.next(),
            KeyCode::Up | KeyCode::Char('k') => self.item_list.prev(),
            KeyCode::Char('/') => {
                self.item_list.filtering = true;
                self.item_list.query.clear();
            }
            KeyCode::Enter => {
                let Some(item) = self.selected_item().cloned() else {
                    return;
                };
                let form = self
                    .form
                    .get_or_insert_with(|| ClientForm::new(OAuthClient::default()));
                form.draft.bitwarden_item_id = item.id.clone();
                if form.draft.name.is_empty() {
                    form.draft.name = item.name.clone();
                }
                if form.draft.issuer.is_empty() {
                    if let Some(uri) = item.first_uri() {
                        form.draft.issuer = uri.to_string();
                    }
                }
                form.focus = 0;
                self.set_mode(Mode::ClientForm);
            }
            _ => {}
        }
    }

    fn handle_form_key(&mut self, code: KeyCode) -> Vec<Command> {
        let Some(form) = self.form.as_mut() else {
            self.set_mode(Mode::ClientList);
            return Vec::new();
        };
        let step = match code {
            KeyCode::Esc => FormStep::Abort,
            KeyCode::Tab | KeyCode::Down => {
                form.focus = (form.focus + 1).min(FORM_FIELDS.len() - 1);
                FormStep::Stay
            }
            KeyCode::BackTab | KeyCode::Up => {
                form.focus = form.focus.saturating_sub(1);
                FormStep::Stay
            }
            KeyCode::Enter if form.is_last() => FormStep::Submit,
            KeyCode::Enter => {
                form.focus += 1;
                FormStep::Stay
            }
            KeyCode::Backspace => {
                form.focused_mut().pop();
                FormStep::Stay
            }
            KeyCode::Char(c) => {
                form.focused_mut().push(c);
                FormStep::Stay
            }
            _ => FormStep::Stay,
        };
        match step {
            FormStep::Stay => Vec::new(),
            FormStep::Abort => {
                self.form = None;
                self.editing = None;
                self.set_mode(Mode::ClientList);
                Vec::new()
            }
            FormStep::Submit => self.submit_form(),
        }
    }

    fn submit_form(&mut self) -> Vec<Command> {
        let Some(form) = self.form.take() else {
            return Vec::new();
        };
        let client = form.draft;
        let existing = self
            .editing
            .take()
            .and_then(|key| self.clients.iter_mut().find(|e| e.key == key));
        match existing {
            Some(entry) => {
                info!("updated client '{}'", client.name);
                entry.client = client;
            }
            None => {
                info!("added client '{}'", client.name);
                self.insert_client(client);
            }
        }
        self.refresh_clients();
        self.set_mode(Mode::ClientList);
        self.save()
    }

    fn handle_token_key(&mut self, code: KeyCode) -> Vec<Command> {
        match code {
            KeyCode::Esc => {
                if self.token_request.take().is_some() {
                    debug!("token fetch abandoned");
                }
                self.token_outcome = None;
                self.token_loading = false;
                self.set_mode(Mode::ClientList);
            }
            KeyCode::Char('c') => {
                if let Some(outcome) = &self.token_outcome {
                    return vec![Command::Copy {
                        text: outcome.token.access_token.clone(),
                        what: "token",
                    }];
                }
            }
            KeyCode::Char('h') => {
                if let Some(outcome) = &self.token_outcome {
                    return vec![Command::Copy {
                        text: format!("Authorization: Bearer {}", outcome.token.access_token),
                        what: "header",
                    }];
                }
            }
            KeyCode::Char('q') => self.should_quit = true,
            _ => {}
        }
        Vec::new()
    }

    fn handle_error_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char('q') => self.should_quit = true,
            KeyCode::Esc | KeyCode::Enter => {
                self.error_message.clear();
                let previous = std::mem::replace(&mut self.mode, Mode::ClientList);
                let back = match previous {
                    Mode::ErrorDisplay { return_to } => match *return_to {
                        Mode::TokenResult => Mode::ClientList,
                        other => other,
                    },
                    other => other,
                };
                debug!("error dismissed, returning to {:?}", back);
                self.mode = back;
            }
            _ => {}
        }
    }

    fn handle_delete_key(&mut self, code: KeyCode) -> Vec<Command> {
        match code {
            KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => {
                let target = self.delete_target.take();
                self.set_mode(Mode::ClientList);
                let Some(index) = target.and_then(|key| self.clients.iter().position(|e| e.key == key))
                else {
                    return Vec::new();
                };
                let removed = self.clients.remove(index);
                info!("deleted client '{}'", removed.client.name);
                self.refresh_clients();
                self.status_message = Some("Client deleted".into());
                self.save()
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                self.delete_target = None;
                self.set_mode(Mode::ClientList);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn handle_password_key(&mut self, code: KeyCode) -> Vec<Command> {
        if self.unlocking {
            return Vec::new();
        }
        match code {
            KeyCode::Esc => {
                self.pending_action = None;
                self.password.clear();
                self.set_mode(Mode::ClientList);
                Vec::new()
            }
            KeyCode::Enter => {
                if self.password.value.is_empty() {
                    return Vec::new();
                }
                self.unlocking = true;
                self.unlock_error = None;
                vec![Command::Unlock {
                    passphrase: std::mem::take(&mut self.password.value),
                }]
            }
            other => {
                self.password.handle(other);
                Vec::new()
            }
        }
    }

    fn handle_login_key(&mut self, code: KeyCode) -> Vec<Command> {
        match code {
            KeyCode::Char('q') => self.should_quit = true,
            KeyCode::Char('r') => {
                self.status_message = Some("Checking Bitwarden status...".into());
                return vec![Command::CheckStatus {
                    session: self.session.clone(),
                }];
            }
            KeyCode::Esc => {
                self.pending_action = None;
                self.set_mode(Mode::ClientList);
            }
            _ => {}
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Login, LoginUri, TokenResponse};
    use time::OffsetDateTime;

    fn key(c: char) -> AppEvent {
        AppEvent::Key(KeyEvent::new(KeyCode::Char(c), KeyModifiers::NONE))
    }

    fn press(code: KeyCode) -> AppEvent {
        AppEvent::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn client(name: &str, item: &str) -> OAuthClient {
        OAuthClient {
            name: name.into(),
            bitwarden_item_id: item.into(),
            issuer: "https://auth.example.com".into(),
            scopes: "openid".into(),
            ..Default::default()
        }
    }

    fn item(id: &str, name: &str) -> VaultItem {
        VaultItem {
            id: id.into(),
            name: name.into(),
            login: Some(Login {
                username: "svc".into(),
                password: "pw".into(),
                uris: vec![LoginUri { uri: "https://idp.example.com/realms/x".into() }],
            }),
        }
    }

    fn outcome(c: OAuthClient) -> TokenOutcome {
        TokenOutcome {
            token: TokenResponse {
                access_token: "abc.def".into(),
                token_type: "Bearer".into(),
                expires_in: 300,
                scope: None,
            },
            client: c,
            fetched_at: OffsetDateTime::now_utc(),
        }
    }

    /// App whose startup status check came back locked.
    fn locked_app(clients: Vec<OAuthClient>) -> App {
        let mut app = App::new(clients, String::new());
        app.update(AppEvent::StatusChecked {
            installed: true,
            status: VaultStatus::Locked,
            session: String::new(),
        });
        app.set_mode(Mode::ClientList);
        app
    }

    fn unlocked_app(clients: Vec<OAuthClient>) -> App {
        let mut app = App::new(clients, "sess".into());
        let cmds = app.update(AppEvent::StatusChecked {
            installed: true,
            status: VaultStatus::Unlocked,
            session: "sess".into(),
        });
        assert_eq!(cmds.len(), 1);
        app.update(AppEvent::ItemsLoaded(Ok(vec![item("bw-1", "Keycloak")])));
        app
    }

    fn type_text(app: &mut App, text: &str) {
        for c in text.chars() {
            app.update(key(c));
        }
    }

    fn fetch_request(cmds: &[Command]) -> RequestId {
        match cmds {
            [Command::FetchToken { request, .. }] => *request,
            other => panic!("expected one FetchToken, got {:?}", other),
        }
    }

    #[test]
    fn test_startup_checks_status() {
        let app = App::new(vec![], "env-session".into());
        assert_eq!(app.mode, Mode::ClientList);
        assert!(app.vault_checking);
        assert_eq!(
            app.startup_commands(),
            vec![Command::CheckStatus { session: "env-session".into() }]
        );
    }

    #[test]
    fn test_status_unauthenticated_or_missing_requires_login() {
        let mut app = App::new(vec![], String::new());
        app.update(AppEvent::StatusChecked {
            installed: true,
            status: VaultStatus::Unauthenticated,
            session: String::new(),
        });
        assert_eq!(app.mode, Mode::VaultLoginRequired);
        assert!(!app.vault_checking);

        let mut app = App::new(vec![], String::new());
        app.update(AppEvent::StatusChecked {
            installed: false,
            status: VaultStatus::Unauthenticated,
            session: String::new(),
        });
        assert_eq!(app.mode, Mode::VaultLoginRequired);
        assert_eq!(app.status_message.as_deref(), Some("bw CLI not found"));
    }

    #[test]
    fn test_status_locked_opens_prompt() {
        let mut app = App::new(vec![], String::new());
        app.password.value = "leftover".into();
        let cmds = app.update(AppEvent::StatusChecked {
            installed: true,
            status: VaultStatus::Locked,
            session: String::new(),
        });
        assert!(cmds.is_empty());
        assert_eq!(app.mode, Mode::VaultPasswordPrompt);
        assert!(app.password.value.is_empty());
    }

    #[test]
    fn test_status_unlocked_fetches_items_in_place() {
        let mut app = App::new(vec![], String::new());
        let cmds = app.update(AppEvent::StatusChecked {
            installed: true,
            status: VaultStatus::Unlocked,
            session: "sess".into(),
        });
        assert_eq!(
            cmds,
            vec![Command::ListItems { session: "sess".into(), search: None }]
        );
        assert_eq!(app.mode, Mode::ClientList);
        assert!(app.vault_unlocked);
    }

    #[test]
    fn test_unlock_stays_busy_until_items_arrive() {
        let mut app = App::new(vec![client("kc", "bw-1")], String::new());
        app.update(AppEvent::StatusChecked {
            installed: true,
            status: VaultStatus::Locked,
            session: String::new(),
        });
        type_text(&mut app, "hunter2");
        let cmds = app.update(press(KeyCode::Enter));
        assert_eq!(cmds, vec![Command::Unlock { passphrase: "hunter2".into() }]);
        assert!(app.unlocking);

        let cmds = app.update(AppEvent::Unlocked(Ok("new-session".into())));
        assert_eq!(app.session, "new-session");
        assert!(app.vault_unlocked);
        assert_eq!(app.vault_status, VaultStatus::Unlocked);
        assert!(app.unlocking, "busy flag must survive the unlock itself");
        assert_eq!(app.mode, Mode::VaultPasswordPrompt);
        assert_eq!(
            cmds,
            vec![Command::ListItems { session: "new-session".into(), search: None }]
        );

        app.update(AppEvent::ItemsLoaded(Ok(vec![item("bw-1", "Keycloak")])));
        assert!(!app.unlocking);
        assert_eq!(app.mode, Mode::ClientList);
        assert_eq!(app.vault_items.len(), 1);
    }

    #[test]
    fn test_prompt_ignores_keys_while_unlocking() {
        let mut app = locked_app(vec![]);
        app.set_mode(Mode::VaultPasswordPrompt);
        type_text(&mut app, "pw");
        app.update(press(KeyCode::Enter));
        assert!(app.update(press(KeyCode::Enter)).is_empty());
        app.update(press(KeyCode::Esc));
        type_text(&mut app, "more");
        assert_eq!(app.mode, Mode::VaultPasswordPrompt);
        assert!(app.password.value.is_empty());
    }

    #[test]
    fn test_empty_passphrase_is_not_submitted() {
        let mut app = locked_app(vec![]);
        app.set_mode(Mode::VaultPasswordPrompt);
        assert!(app.update(press(KeyCode::Enter)).is_empty());
        assert!(!app.unlocking);
    }

    #[test]
    fn test_unlock_failure_stays_on_prompt() {
        let mut app = locked_app(vec![]);
        app.set_mode(Mode::VaultPasswordPrompt);
        type_text(&mut app, "wrong");
        app.update(press(KeyCode::Enter));
        let cmds = app.update(AppEvent::Unlocked(Err(VaultError::Unlock {
            message: "Invalid master password.".into(),
        })));
        assert!(cmds.is_empty());
        assert_eq!(app.mode, Mode::VaultPasswordPrompt);
        assert!(!app.unlocking);
        assert!(app.password.value.is_empty());
        assert_eq!(
            app.unlock_error.as_deref(),
            Some("unlock failed: Invalid master password.")
        );
    }

    #[test]
    fn test_add_while_locked_resumes_into_item_select() {
        let mut app = locked_app(vec![]);
        app.update(key('a'));
        assert_eq!(app.pending_action, Some(PendingAction::Add));
        assert_eq!(app.mode, Mode::VaultPasswordPrompt);

        type_text(&mut app, "hunter2");
        app.update(press(KeyCode::Enter));
        app.update(AppEvent::Unlocked(Ok("s".into())));
        app.update(AppEvent::ItemsLoaded(Ok(vec![item("bw-1", "Keycloak")])));

        assert_eq!(app.mode, Mode::VaultItemSelect);
        assert_eq!(app.pending_action, None);
        assert_eq!(app.editing, None);
        assert!(app.form.is_some());
    }

    #[test]
    fn test_edit_while_locked_resumes_into_form() {
        let mut app = locked_app(vec![client("a", "bw-1"), client("b", "bw-2")]);
        app.update(press(KeyCode::Down));
        app.update(key('e'));
        assert_eq!(app.pending_action, Some(PendingAction::Edit));

        app.update(AppEvent::Unlocked(Ok("s".into())));
        app.update(AppEvent::ItemsLoaded(Ok(vec![])));

        assert_eq!(app.mode, Mode::ClientForm);
        assert_eq!(app.pending_action, None);
        assert_eq!(app.editing, Some(app.clients[1].key));
        assert_eq!(app.form.as_ref().unwrap().draft.name, "b");
    }

    #[test]
    fn test_token_while_locked_resumes_into_fetch() {
        let mut app = locked_app(vec![client("kc", "bw-1")]);
        assert!(app.update(press(KeyCode::Enter)).is_empty());
        assert_eq!(app.pending_action, Some(PendingAction::Token));

        app.update(AppEvent::Unlocked(Ok("fresh".into())));
        let cmds = app.update(AppEvent::ItemsLoaded(Ok(vec![])));
        assert_eq!(app.mode, Mode::TokenResult);
        assert!(app.token_loading);
        match cmds.as_slice() {
            [Command::FetchToken { session, client: c, .. }] => {
                assert_eq!(session, "fresh");
                assert_eq!(c.name, "kc");
            }
            other => panic!("unexpected commands: {:?}", other),
        }
    }

    #[test]
    fn test_pending_without_selection_stays_put() {
        let mut app = locked_app(vec![]);
        app.set_mode(Mode::VaultPasswordPrompt);
        app.pending_action = Some(PendingAction::Token);
        app.update(AppEvent::Unlocked(Ok("s".into())));
        let cmds = app.update(AppEvent::ItemsLoaded(Ok(vec![])));
        assert!(cmds.is_empty());
        assert_eq!(app.mode, Mode::VaultPasswordPrompt);
        assert_eq!(app.pending_action, None);
    }

    #[test]
    fn test_action_while_checking_waits() {
        let mut app = App::new(vec![client("kc", "bw-1")], String::new());
        app.update(key('a'));
        assert_eq!(app.mode, Mode::ClientList);
        assert_eq!(app.pending_action, Some(PendingAction::Add));
        assert_eq!(app.status_message.as_deref(), Some("Checking Bitwarden status..."));

        // the startup check finds the vault unlocked and the add resumes
        app.update(AppEvent::StatusChecked {
            installed: true,
            status: VaultStatus::Unlocked,
            session: "s".into(),
        });
        app.update(AppEvent::ItemsLoaded(Ok(vec![])));
        assert_eq!(app.mode, Mode::VaultItemSelect);
    }

    #[test]
    fn test_action_when_logged_out_goes_to_login() {
        let mut app = App::new(vec![client("kc", "bw-1")], String::new());
        app.update(AppEvent::StatusChecked {
            installed: true,
            status: VaultStatus::Unauthenticated,
            session: String::new(),
        });
        app.update(press(KeyCode::Esc));
        assert_eq!(app.mode, Mode::ClientList);
        app.update(key('e'));
        assert_eq!(app.mode, Mode::VaultLoginRequired);
        assert_eq!(app.pending_action, Some(PendingAction::Edit));

        let cmds = app.update(key('r'));
        assert!(matches!(cmds.as_slice(), [Command::CheckStatus { .. }]));
    }

    #[test]
    fn test_vault_error_during_fetch_invalidates_unlock() {
        let mut app = unlocked_app(vec![client("kc", "bw-1")]);
        let request = fetch_request(&app.update(press(KeyCode::Enter)));
        assert_eq!(app.mode, Mode::TokenResult);

        app.update(AppEvent::TokenFetched {
            request,
            result: Err(TokenFetchError::Vault(VaultError::Query {
                operation: "get item",
                output: "Vault is locked.".into(),
            })),
        });
        assert!(!app.vault_unlocked);
        assert!(!app.token_loading);
        assert_eq!(
            app.mode,
            Mode::ErrorDisplay { return_to: Box::new(Mode::TokenResult) }
        );
        assert!(app.error_message.starts_with("bitwarden:"));

        app.update(press(KeyCode::Esc));
        assert_eq!(app.mode, Mode::ClientList);

        // next sensitive action goes through the unlock prompt again
        app.update(press(KeyCode::Enter));
        assert_eq!(app.mode, Mode::VaultPasswordPrompt);
        assert_eq!(app.pending_action, Some(PendingAction::Token));
    }

    #[test]
    fn test_non_vault_error_keeps_session() {
        let mut app = unlocked_app(vec![client("kc", "bw-1")]);
        let request = fetch_request(&app.update(press(KeyCode::Enter)));
        app.update(AppEvent::TokenFetched {
            request,
            result: Err(TokenFetchError::Exchange(crate::error::OAuthError::TokenExchange {
                status: 401,
                body: "invalid_client".into(),
            })),
        });
        assert!(app.vault_unlocked);
        assert!(matches!(app.mode, Mode::ErrorDisplay { .. }));
    }

    #[test]
    fn test_token_success_and_copy() {
        let mut app = unlocked_app(vec![client("kc", "bw-1")]);
        let request = fetch_request(&app.update(press(KeyCode::Enter)));
        app.update(AppEvent::TokenFetched { request, result: Ok(outcome(client("kc", "bw-1"))) });
        assert_eq!(app.mode, Mode::TokenResult);
        assert!(!app.token_loading);
        assert!(app.token_outcome.is_some());

        assert_eq!(
            app.update(key('c')),
            vec![Command::Copy { text: "abc.def".into(), what: "token" }]
        );
        assert_eq!(
            app.update(key('h')),
            vec![Command::Copy { text: "Authorization: Bearer abc.def".into(), what: "header" }]
        );
        app.update(AppEvent::Copied { what: "header", result: Ok(()) });
        assert_eq!(app.status_message.as_deref(), Some("Copied header to clipboard"));

        app.update(press(KeyCode::Esc));
        assert_eq!(app.mode, Mode::ClientList);
        assert!(app.token_outcome.is_none());
    }

    #[test]
    fn test_abandoned_fetch_result_is_discarded() {
        let mut app = unlocked_app(vec![client("kc", "bw-1")]);
        let stale = fetch_request(&app.update(press(KeyCode::Enter)));
        app.update(press(KeyCode::Esc));
        assert_eq!(app.mode, Mode::ClientList);

        app.update(AppEvent::TokenFetched {
            request: stale,
            result: Err(TokenFetchError::Exchange(crate::error::OAuthError::MissingTokenEndpoint)),
        });
        assert_eq!(app.mode, Mode::ClientList);
        assert!(app.vault_unlocked);
        assert!(app.error_message.is_empty());

        let fresh = fetch_request(&app.update(press(KeyCode::Enter)));
        assert_ne!(stale, fresh);
        app.update(AppEvent::TokenFetched { request: stale, result: Ok(outcome(client("old", "x"))) });
        assert!(app.token_outcome.is_none());
        assert!(app.token_loading);
        app.update(AppEvent::TokenFetched { request: fresh, result: Ok(outcome(client("kc", "bw-1"))) });
        assert_eq!(app.token_outcome.as_ref().unwrap().client.name, "kc");
    }

    #[test]
    fn test_abandoned_fetch_vault_error_still_locks() {
        let mut app = unlocked_app(vec![client("kc", "bw-1")]);
        let stale = fetch_request(&app.update(press(KeyCode::Enter)));
        app.update(press(KeyCode::Esc));

        app.update(AppEvent::TokenFetched {
            request: stale,
            result: Err(TokenFetchError::Vault(VaultError::Query {
                operation: "get item",
                output: "Vault is locked.".into(),
            })),
        });
        // no error screen for a fetch the user walked away from
        assert_eq!(app.mode, Mode::ClientList);
        assert!(!app.vault_unlocked);
        assert_eq!(app.vault_status, VaultStatus::Locked);

        let cmds = app.update(press(KeyCode::Enter));
        assert!(cmds.is_empty());
        assert_eq!(app.mode, Mode::VaultPasswordPrompt);
        assert_eq!(app.pending_action, Some(PendingAction::Token));
    }

    #[test]
    fn test_held_saves_emit_nothing() {
        let mut app = unlocked_app(vec![client("a", "bw-1")]);
        app.hold_saves("clients.json is unreadable".into());
        app.update(key('d'));
        let cmds = app.update(key('y'));
        assert!(cmds.is_empty());
        assert!(app.clients.is_empty());
        assert_eq!(
            app.status_message.as_deref(),
            Some("Not saved: clients.json is unreadable")
        );
    }

    #[test]
    fn test_delete_cancel_leaves_list_untouched() {
        let mut app = unlocked_app(vec![client("a", "bw-1"), client("b", "bw-2")]);
        let before = serde_json::to_vec(&app.persisted_clients()).unwrap();
        app.update(key('d'));
        assert_eq!(app.mode, Mode::DeleteConfirm);
        let cmds = app.update(key('n'));
        assert!(cmds.is_empty());
        assert_eq!(app.mode, Mode::ClientList);
        assert_eq!(serde_json::to_vec(&app.persisted_clients()).unwrap(), before);
    }

    #[test]
    fn test_delete_confirm_removes_and_persists() {
        let mut app = unlocked_app(vec![client("a", "bw-1"), client("b", "bw-2")]);
        app.update(press(KeyCode::Down));
        app.update(key('d'));
        assert_eq!(app.delete_candidate().unwrap().client.name, "b");
        let cmds = app.update(key('y'));
        assert_eq!(cmds, vec![Command::SaveClients(vec![client("a", "bw-1")])]);
        assert_eq!(app.mode, Mode::ClientList);
        assert_eq!(app.selected_client().unwrap().client.name, "a");
    }

    #[test]
    fn test_add_flow_seeds_form_and_appends() {
        let mut app = unlocked_app(vec![client("a", "bw-1")]);
        app.update(key('a'));
        assert_eq!(app.mode, Mode::VaultItemSelect);
        app.update(press(KeyCode::Enter));
        assert_eq!(app.mode, Mode::ClientForm);
        let draft = &app.form.as_ref().unwrap().draft;
        assert_eq!(draft.bitwarden_item_id, "bw-1");
        assert_eq!(draft.name, "Keycloak");
        assert_eq!(draft.issuer, "https://idp.example.com/realms/x");

        // move to the scopes field and submit
        for _ in 0..5 {
            app.update(press(KeyCode::Tab));
        }
        type_text(&mut app, "api");
        let cmds = app.update(press(KeyCode::Enter));
        assert_eq!(app.mode, Mode::ClientList);
        assert_eq!(app.clients.len(), 2);
        match cmds.as_slice() {
            [Command::SaveClients(saved)] => {
                assert_eq!(saved[1].name, "Keycloak");
                assert_eq!(saved[1].scopes, "api");
            }
            other => panic!("unexpected commands: {:?}", other),
        }
    }

    #[test]
    fn test_edit_targets_the_selected_duplicate() {
        let mut app = unlocked_app(vec![client("dup", "bw-1"), client("dup", "bw-1")]);
        app.update(press(KeyCode::Down));
        app.update(key('e'));
        type_text(&mut app, "-2");
        for _ in 0..5 {
            app.update(press(KeyCode::Enter));
        }
        app.update(press(KeyCode::Enter));
        let names: Vec<_> = app.clients.iter().map(|e| e.client.name.as_str()).collect();
        assert_eq!(names, ["dup", "dup-2"]);
        assert_eq!(app.editing, None);
    }

    #[test]
    fn test_form_abort_discards_draft() {
        let mut app = unlocked_app(vec![client("a", "bw-1")]);
        let before = app.persisted_clients();
        app.update(key('e'));
        type_text(&mut app, "changed");
        let cmds = app.update(press(KeyCode::Esc));
        assert!(cmds.is_empty());
        assert_eq!(app.mode, Mode::ClientList);
        assert_eq!(app.persisted_clients(), before);
        assert!(app.form.is_none());
    }

    #[test]
    fn test_error_dismiss_returns_to_previous_mode() {
        let mut app = unlocked_app(vec![]);
        app.set_mode(Mode::VaultItemSelect);
        app.show_error("boom".into(), Mode::VaultItemSelect);
        app.update(press(KeyCode::Enter));
        assert_eq!(app.mode, Mode::VaultItemSelect);
        assert!(app.error_message.is_empty());
    }

    #[test]
    fn test_save_result_messages() {
        let mut app = App::new(vec![], String::new());
        app.update(AppEvent::ClientsSaved(Ok(())));
        assert_eq!(app.status_message.as_deref(), Some("Client saved"));
        app.update(AppEvent::ClientsSaved(Err(ConfigError::NoHomeDir)));
        assert!(app.status_message.unwrap().starts_with("Error saving:"));
    }

    #[test]
    fn test_client_filter() {
        let mut app = App::new(
            vec![
                client("production-keycloak", "1"),
                client("staging-keycloak", "2"),
                client("auth0-dev", "3"),
            ],
            String::new(),
        );
        app.vault_checking = false;
        app.update(key('/'));
        type_text(&mut app, "auth0");
        assert_eq!(app.client_list.visible(), &[2]);
        assert_eq!(app.selected_client().unwrap().client.name, "auth0-dev");

        app.update(press(KeyCode::Enter));
        assert!(!app.client_list.filtering);
        assert_eq!(app.client_list.visible().len(), 1);

        app.update(press(KeyCode::Esc));
        assert_eq!(app.client_list.visible().len(), 3);

        app.update(key('/'));
        type_text(&mut app, "zzz");
        assert!(app.selected_client().is_none());
        app.update(press(KeyCode::Esc));
        assert_eq!(app.client_list.visible().len(), 3);
    }

    #[test]
    fn test_quit_keys() {
        let mut app = App::new(vec![], String::new());
        app.update(AppEvent::Key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)));
        assert!(app.should_quit);

        let mut app = locked_app(vec![]);
        app.set_mode(Mode::VaultPasswordPrompt);
        app.update(key('q'));
        assert!(!app.should_quit, "q is text on the password prompt");
        assert_eq!(app.password.value, "q");
    }

    #[test]
    fn test_tick_spins_only_when_busy() {
        let mut app = App::new(vec![], String::new());
        assert!(app.is_busy());
        assert!(app.update(AppEvent::Tick).is_empty());
        app.vault_checking = false;
        assert!(!app.is_busy());
    }
}
