use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
};
use throbber_widgets_tui::{BRAILLE_SIX, Throbber, WhichUse};

use crate::app::{App, FORM_FIELDS, FilteredList};
use crate::model::{Mode, TokenOutcome, VaultStatus};

const TOKEN_PREVIEW_EDGE: usize = 40;

/// Draw router
pub fn draw_ui(f: &mut Frame<'_>, app: &mut App) {
    let area = f.area();
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(4),
            Constraint::Length(3),
            Constraint::Length(1),
        ])
        .split(area);

    draw_header(f, app, chunks[0]);
    match app.mode.clone() {
        Mode::ClientList | Mode::DeleteConfirm => draw_client_list(f, app, chunks[1]),
        Mode::VaultItemSelect => draw_item_select(f, app, chunks[1]),
        Mode::ClientForm => draw_form(f, app, chunks[1]),
        Mode::TokenResult => draw_token(f, app, chunks[1]),
        Mode::ErrorDisplay { .. } => draw_error(f, app, chunks[1]),
        Mode::VaultPasswordPrompt => draw_password_prompt(f, app, chunks[1]),
        Mode::VaultLoginRequired => draw_login_required(f, app, chunks[1]),
    }

    let footer = Paragraph::new(app.status_message.clone().unwrap_or_default())
        .block(Block::default().borders(Borders::ALL).title("Message"))
        .style(Style::default().fg(Color::Cyan));
    f.render_widget(footer, chunks[2]);

    let help = Paragraph::new(help_line(app)).style(Style::default().fg(Color::Gray));
    f.render_widget(help, chunks[3]);

    if app.mode == Mode::DeleteConfirm {
        draw_delete_confirm(f, app, area);
    }
}

fn help_line(app: &App) -> &'static str {
    match &app.mode {
        Mode::ClientList if app.client_list.filtering => "type to filter | Enter: keep filter | Esc: clear",
        Mode::ClientList => {
            "Enter: get token | a: add | e: edit | d: delete | /: filter | q: quit"
        }
        Mode::VaultItemSelect if app.item_list.filtering => {
            "type to filter | Enter: keep filter | Esc: clear"
        }
        Mode::VaultItemSelect => "Enter: select item | /: filter | Esc: cancel",
        Mode::ClientForm => "Tab/↓: next | Shift-Tab/↑: previous | Enter on last field: save | Esc: cancel",
        Mode::TokenResult => "c: copy token | h: copy header | Esc: back | q: quit",
        Mode::ErrorDisplay { .. } => "Esc/Enter: back | q: quit",
        Mode::DeleteConfirm => "y: delete | n/Esc: cancel",
        Mode::VaultPasswordPrompt => "Enter: unlock | Esc: cancel",
        Mode::VaultLoginRequired => "r: retry | Esc: back | q: quit",
    }
}

fn vault_indicator(app: &App) -> Span<'static> {
    if app.vault_checking {
        return Span::styled("[checking vault]", Style::default().fg(Color::Yellow));
    }
    if !app.vault_installed {
        return Span::styled("[bw not found]", Style::default().fg(Color::Red));
    }
    if app.vault_unlocked {
        return Span::styled("🔓 [vault unlocked]", Style::default().fg(Color::Green));
    }
    match app.vault_status {
        VaultStatus::Unauthenticated => {
            Span::styled("[not logged in]", Style::default().fg(Color::Red))
        }
        _ => Span::styled("🔒 [vault locked]", Style::default().fg(Color::Yellow)),
    }
}

fn draw_header(f: &mut Frame<'_>, app: &mut App, area: Rect) {
    let title = Span::styled(
        "🔑 tkz",
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );
    let line = Line::from(vec![title, Span::raw("  "), vault_indicator(app)]);
    let block = Block::default().borders(Borders::ALL).title("Token Manager");
    let inner = block.inner(area);
    f.render_widget(Paragraph::new(line).block(block), area);

    if app.is_busy() {
        let label = if app.unlocking {
            " Unlocking..."
        } else if app.token_loading {
            " Fetching token..."
        } else {
            " Checking Bitwarden..."
        };
        let throbber = Throbber::default()
            .label(label)
            .style(Style::default().fg(Color::Yellow))
            .throbber_set(BRAILLE_SIX)
            .use_type(WhichUse::Spin);
        let width = 24.min(inner.width);
        let spinner_area = Rect {
            x: inner.right().saturating_sub(width),
            y: inner.y,
            width,
            height: 1,
        };
        f.render_stateful_widget(throbber, spinner_area, &mut app.throbber_state);
    }
}

fn list_title(base: &str, list: &FilteredList) -> String {
    if list.filtering {
        format!("{} (Search: {}_ )", base, list.query)
    } else if !list.query.is_empty() {
        format!("{} (Filter: {})", base, list.query)
    } else {
        format!("{} (Press '/' to filter)", base)
    }
}

fn highlight() -> Style {
    Style::default()
        .fg(Color::Yellow)
        .add_modifier(Modifier::BOLD)
}

fn draw_client_list(f: &mut Frame<'_>, app: &mut App, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(list_title("OAuth Clients", &app.client_list));

    let items: Vec<ListItem> = if app.client_list.visible().is_empty() {
        if app.clients.is_empty() {
            vec![ListItem::new("No clients yet. Press 'a' to add one.")]
        } else {
            vec![ListItem::new("No matching clients...")]
        }
    } else {
        app.client_list
            .visible()
            .iter()
            .filter_map(|&i| app.clients.get(i))
            .map(|entry| {
                ListItem::new(vec![
                    Line::from(entry.client.name.clone()),
                    Line::styled(
                        format!("  {}", entry.client.description()),
                        Style::default().fg(Color::DarkGray),
                    ),
                ])
            })
            .collect()
    };
    let list = List::new(items).block(block).highlight_style(highlight());
    f.render_stateful_widget(list, area, &mut app.client_list.state);
}

fn draw_item_select(f: &mut Frame<'_>, app: &mut App, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title(list_title("🔐 Select Bitwarden Item", &app.item_list));

    let items: Vec<ListItem> = if app.item_list.visible().is_empty() {
        if app.vault_items.is_empty() {
            vec![ListItem::new("No vault items found...")]
        } else {
            vec![ListItem::new("No matching items...")]
        }
    } else {
        app.item_list
            .visible()
            .iter()
            .filter_map(|&i| app.vault_items.get(i))
            .map(|item| {
                ListItem::new(vec![
                    Line::from(item.name.clone()),
                    Line::styled(
                        format!("  {}", item.description()),
                        Style::default().fg(Color::DarkGray),
                    ),
                ])
            })
            .collect()
    };
    let list = List::new(items).block(block).highlight_style(highlight());
    f.render_stateful_widget(list, area, &mut app.item_list.state);
}

fn draw_form(f: &mut Frame<'_>, app: &App, area: Rect) {
    let Some(form) = &app.form else {
        return;
    };
    let title = if app.is_editing() {
        "Edit Client"
    } else {
        "Add Client"
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .title(title)
        .title_alignment(Alignment::Center);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let mut constraints = vec![Constraint::Length(1)];
    constraints.extend(FORM_FIELDS.iter().map(|_| Constraint::Length(3)));
    constraints.push(Constraint::Min(0));
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(inner);

    let item = Paragraph::new(format!("Bitwarden item: {}", form.draft.bitwarden_item_id))
        .style(Style::default().fg(Color::DarkGray));
    f.render_widget(item, rows[0]);

    for (index, (label, placeholder)) in FORM_FIELDS.iter().enumerate() {
        let focused = index == form.focus;
        let value = form.field(index);
        let (text, style) = if value.is_empty() {
            (placeholder.to_string(), Style::default().fg(Color::DarkGray))
        } else if focused {
            (value.to_string(), Style::default().fg(Color::Yellow))
        } else {
            (value.to_string(), Style::default().fg(Color::White))
        };
        let text = if focused { format!("{}_", text) } else { text };
        let border = if focused {
            Style::default().fg(Color::Yellow)
        } else {
            Style::default()
        };
        let field = Paragraph::new(text).style(style).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(border)
                .title(*label),
        );
        f.render_widget(field, rows[index + 1]);
    }
}

/// Long tokens show their first and last 40 characters.
pub fn truncate_token(token: &str) -> String {
    let len = token.chars().count();
    if len <= TOKEN_PREVIEW_EDGE * 2 {
        return token.to_string();
    }
    let head: String = token.chars().take(TOKEN_PREVIEW_EDGE).collect();
    let tail: String = token.chars().skip(len - TOKEN_PREVIEW_EDGE).collect();
    format!("{}...{}", head, tail)
}

fn token_lines(outcome: &TokenOutcome) -> Vec<Line<'static>> {
    let label = Style::default()
        .fg(Color::Cyan)
        .add_modifier(Modifier::BOLD);
    let t = &outcome.token;
    let fetched = outcome.fetched_at;
    let expires = i64::try_from(t.expires_in)
        .ok()
        .and_then(|secs| fetched.checked_add(time::Duration::seconds(secs)));
    let mut lines = vec![
        Line::from(vec![
            Span::styled("Client:     ", label),
            Span::raw(outcome.client.name.clone()),
        ]),
        Line::from(vec![
            Span::styled("Token type: ", label),
            Span::raw(t.token_type.clone()),
        ]),
        Line::from(vec![
            Span::styled("Expires in: ", label),
            Span::raw(match expires {
                Some(at) => format!(
                    "{}s (at {:02}:{:02}:{:02} UTC)",
                    t.expires_in,
                    at.hour(),
                    at.minute(),
                    at.second()
                ),
                None => format!("{}s", t.expires_in),
            }),
        ]),
    ];
    if let Some(scope) = &t.scope {
        lines.push(Line::from(vec![
            Span::styled("Scope:      ", label),
            Span::raw(scope.clone()),
        ]));
    }
    lines.push(Line::from(""));
    lines.push(Line::styled("Access token:", label));
    lines.push(Line::styled(
        truncate_token(&t.access_token),
        Style::default().fg(Color::Green),
    ));
    lines
}

fn draw_token(f: &mut Frame<'_>, app: &App, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Access Token")
        .title_alignment(Alignment::Center);

    let body = match &app.token_outcome {
        Some(outcome) => Paragraph::new(token_lines(outcome)),
        None if app.token_loading => {
            let name = app
                .selected_client()
                .map(|e| e.client.name.clone())
                .unwrap_or_default();
            Paragraph::new(format!("\nFetching token for '{}'...", name))
                .alignment(Alignment::Center)
                .style(Style::default().fg(Color::Yellow))
        }
        None => Paragraph::new(""),
    };
    f.render_widget(body.block(block).wrap(Wrap { trim: false }), area);
}

fn draw_error(f: &mut Frame<'_>, app: &App, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Error")
        .title_alignment(Alignment::Center)
        .border_style(Style::default().fg(Color::Red));
    let p = Paragraph::new(app.error_message.clone())
        .block(block)
        .style(Style::default().fg(Color::Red))
        .wrap(Wrap { trim: false });
    f.render_widget(p, area);
}

fn draw_password_prompt(f: &mut Frame<'_>, app: &App, area: Rect) {
    let popup = centered_rect(60, 60, area);
    f.render_widget(Clear, popup);
    let block = Block::default()
        .borders(Borders::ALL)
        .title("🔒 Unlock Bitwarden")
        .title_alignment(Alignment::Center);
    let inner = block.inner(popup);
    f.render_widget(block, popup);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(1),
            Constraint::Length(3),
            Constraint::Min(1),
        ])
        .split(inner);

    f.render_widget(Paragraph::new("Enter your master password:"), rows[0]);

    let input = if app.unlocking {
        Paragraph::new("Unlocking...").style(Style::default().fg(Color::Yellow))
    } else {
        Paragraph::new(format!("{}_", app.password.display()))
            .style(Style::default().fg(Color::Yellow))
    };
    f.render_widget(
        input.block(Block::default().borders(Borders::ALL).title("Master Password")),
        rows[1],
    );

    if let Some(err) = &app.unlock_error {
        let p = Paragraph::new(err.clone())
            .style(Style::default().fg(Color::Red))
            .wrap(Wrap { trim: false });
        f.render_widget(p, rows[2]);
    }
}

fn draw_login_required(f: &mut Frame<'_>, app: &App, area: Rect) {
    let text = if !app.vault_installed {
        "The Bitwarden CLI (bw) was not found on PATH.\n\nInstall it, then press r to retry."
    } else {
        "You are not logged in to Bitwarden.\n\nRun `bw login` in another terminal, then press r to retry."
    };
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Bitwarden Login Required")
        .title_alignment(Alignment::Center);
    let p = Paragraph::new(text)
        .block(block)
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: false });
    f.render_widget(p, centered_rect(70, 50, area));
}

fn draw_delete_confirm(f: &mut Frame<'_>, app: &App, area: Rect) {
    let name = app
        .delete_candidate()
        .map(|e| e.client.name.clone())
        .unwrap_or_default();
    let area_confirm = centered_rect(40, 20, area);
    f.render_widget(Clear, area_confirm);
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Confirm Delete")
        .style(Style::default().bg(Color::Red));
    let text = format!(
        "\nAre you sure you want to delete\n'{}'?\n\n(y) Yes / (n) No",
        name
    );
    let p = Paragraph::new(text)
        .block(block)
        .alignment(Alignment::Center)
        .style(
            Style::default()
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        );
    f.render_widget(p, area_confirm);
}

/// Helper to center a rect
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
