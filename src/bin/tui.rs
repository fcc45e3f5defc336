mod tui_app;

use std::io;
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, Wrap},
    Frame, Terminal,
};
use tui_app::{format_age, format_ms, format_uptime, truncate, AppState, ConnectionStatus};

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> io::Result<()> {
    let base_url = std::env::var("API_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(io::Error::other)?;

    let mut app = AppState::new(base_url);

    // Initial fetch before rendering
    app.refresh(&client).await;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_loop(&mut terminal, &mut app, &client).await;

    // Restore terminal regardless of result
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut AppState,
    client: &reqwest::Client,
) -> io::Result<()> {
    let refresh_interval = Duration::from_secs(2);
    let mut last_tick = std::time::Instant::now();

    loop {
        terminal.draw(|f| render(f, app))?;

        let timeout = refresh_interval
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') => return Ok(()),
                        KeyCode::Char('r') | KeyCode::Char('R') => {
                            app.refresh(client).await;
                            last_tick = std::time::Instant::now();
                        }
                        _ => {}
                    }
                }
            }
        }

        if last_tick.elapsed() >= refresh_interval {
            app.refresh(client).await;
            last_tick = std::time::Instant::now();
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, app: &AppState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // body
            Constraint::Length(5), // warnings
            Constraint::Length(1), // footer
        ])
        .split(f.area());

    render_header(f, app, chunks[0]);
    render_body(f, app, chunks[1]);
    render_warnings(f, app, chunks[2]);
    render_footer(f, chunks[3]);
}

fn render_header(f: &mut Frame, app: &AppState, area: Rect) {
    let (conn_text, conn_color) = match &app.status {
        ConnectionStatus::Connected => ("● connected".to_string(), Color::Green),
        ConnectionStatus::Connecting => ("◌ connecting".to_string(), Color::Yellow),
        ConnectionStatus::Error(e) => (format!("✗ {}", truncate(e, 40)), Color::Red),
    };

    let h = &app.health;
    let status_color = match h.status.as_str() {
        "healthy" => Color::Green,
        "degraded" => Color::Yellow,
        "unhealthy" => Color::Red,
        _ => Color::DarkGray,
    };
    let polling = if !h.polling.enabled {
        ("polling off", Color::DarkGray)
    } else if h.polling.recovery_mode {
        ("polling RECOVERY", Color::Yellow)
    } else {
        ("polling on", Color::Green)
    };

    let spans = vec![
        Span::styled(
            " Linefinder  ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::styled(conn_text, Style::default().fg(conn_color)),
        Span::raw("  │  "),
        Span::styled(
            if h.status.is_empty() { "—".to_string() } else { h.status.to_uppercase() },
            Style::default().fg(status_color).add_modifier(Modifier::BOLD),
        ),
        Span::raw("  │  "),
        Span::styled(polling.0, Style::default().fg(polling.1)),
        Span::raw("  │  "),
        Span::styled(
            format!("{}/{} clients", h.hub.connections, h.hub.max_connections),
            Style::default().fg(Color::White),
        ),
        Span::raw("  │  "),
        Span::styled(
            format!("{} pending alerts", h.pending_alerts),
            Style::default().fg(Color::White),
        ),
        Span::raw("  │  "),
        Span::styled(
            format!("up {}", format_uptime(h.metrics.uptime_secs)),
            Style::default().fg(Color::DarkGray),
        ),
    ];

    let paragraph = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray)),
    );
    f.render_widget(paragraph, area);
}

fn render_body(f: &mut Frame, app: &AppState, area: Rect) {
    let halves = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(area);

    render_topics_table(f, app, halves[0]);
    render_counters(f, app, halves[1]);
}

fn render_topics_table(f: &mut Frame, app: &AppState, area: Rect) {
    let header_cells = ["Topic", "State", "Errors", "Last poll", "Subs", "Polls", "Changes"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1);

    let rows: Vec<Row> = app
        .topic_rows()
        .into_iter()
        .map(|(name, status, metrics)| {
            let (state, state_color) = if status.in_recovery {
                ("RECOVERY", Color::Yellow)
            } else {
                ("normal", Color::Green)
            };
            let err_color = match status.consecutive_errors {
                0 => Color::DarkGray,
                1..=2 => Color::Yellow,
                _ => Color::Red,
            };
            let subs = app.health.hub.subscribers.get(name).copied().unwrap_or(0);

            Row::new(vec![
                Cell::from(name.to_uppercase()).style(Style::default().fg(Color::Cyan)),
                Cell::from(state).style(Style::default().fg(state_color)),
                Cell::from(status.consecutive_errors.to_string()).style(Style::default().fg(err_color)),
                Cell::from(format_age(status.last_poll_age_secs)),
                Cell::from(subs.to_string()),
                Cell::from(metrics.polls.to_string()).style(Style::default().fg(Color::DarkGray)),
                Cell::from(metrics.changes.to_string()),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(6),
            Constraint::Length(9),
            Constraint::Length(7),
            Constraint::Length(10),
            Constraint::Length(5),
            Constraint::Length(6),
            Constraint::Length(8),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray))
            .title(Span::styled(
                " TOPICS ",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            )),
    );

    f.render_widget(table, area);
}

fn render_counters(f: &mut Frame, app: &AppState, area: Rect) {
    let m = &app.health.metrics;
    let label = |s: &'static str| Span::styled(s, Style::default().fg(Color::Yellow));

    let lines = vec![
        Line::from(vec![
            label("polls      "),
            Span::raw(format!(
                "{} total, {} failed ({:.1}% ok), every {}s",
                m.polling.total,
                m.polling.failed,
                m.polling.success_rate_pct,
                app.health.polling.current_interval_secs
            )),
        ]),
        Line::from(vec![
            label("latency    "),
            Span::raw(format!(
                "p50 {}  p95 {}  p99 {}",
                format_ms(m.polling.latency_p50_ms),
                format_ms(m.polling.latency_p95_ms),
                format_ms(m.polling.latency_p99_ms)
            )),
        ]),
        Line::from(vec![
            label("changes    "),
            Span::raw(m.polling.changes_detected.to_string()),
        ]),
        Line::from(vec![
            label("messages   "),
            Span::raw(format!(
                "{} sent, {} failed ({:.1}%), {} broadcasts",
                m.websocket.messages_sent,
                m.websocket.messages_failed,
                m.websocket.delivery_rate_pct,
                m.websocket.broadcasts
            )),
        ]),
        Line::from(vec![
            label("clients    "),
            Span::raw(format!(
                "peak {}, {} total",
                m.websocket.peak_connections, m.websocket.total_connections
            )),
        ]),
        Line::from(vec![
            label("alerts     "),
            Span::raw(format!(
                "{} queued, {} pushed, {} push failures",
                m.notifications.alerts_queued, m.notifications.pushes_sent, m.notifications.pushes_failed
            )),
        ]),
        Line::from(vec![
            label("quota      "),
            Span::raw(format!("{} remaining, {} used", m.quota.remaining, m.quota.used)),
        ]),
    ];

    let paragraph = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray))
            .title(Span::styled(
                " COUNTERS ",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            )),
    );
    f.render_widget(paragraph, area);
}

fn render_warnings(f: &mut Frame, app: &AppState, area: Rect) {
    let mut lines: Vec<Line> = app
        .health
        .warnings
        .iter()
        .map(|w| Line::from(Span::styled(format!("! {w}"), Style::default().fg(Color::Yellow))))
        .collect();

    for (name, status) in &app.health.polling.topics {
        if let Some(err) = &status.last_error {
            lines.push(Line::from(Span::styled(
                format!("{name}: {}", truncate(err, 100)),
                Style::default().fg(Color::DarkGray),
            )));
        }
    }
    if lines.is_empty() {
        lines.push(Line::from(Span::styled("no warnings", Style::default().fg(Color::DarkGray))));
    }

    let paragraph = Paragraph::new(lines).wrap(Wrap { trim: true }).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray))
            .title(" WARNINGS "),
    );
    f.render_widget(paragraph, area);
}

fn render_footer(f: &mut Frame, area: Rect) {
    let line = Line::from(vec![
        Span::styled(" [q] ", Style::default().fg(Color::Yellow)),
        Span::raw("quit  "),
        Span::styled("[r] ", Style::default().fg(Color::Yellow)),
        Span::raw("refresh  "),
        Span::styled("auto-refresh: 2s", Style::default().fg(Color::DarkGray)),
    ]);
    let paragraph = Paragraph::new(line).style(Style::default().fg(Color::White));
    f.render_widget(paragraph, area);
}
