//! Terminal backend for the dashboard: crossterm for raw mode and input,
//! ratatui for drawing the frames the dashboard runtime produces.

use std::io::{self, Stdout};

use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use futures::StreamExt;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Rect};
use ratatui::style::{Color, Style};
use ratatui::widgets::{Block, Borders, Clear, Paragraph};
use ratatui::Frame;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use valkit_core::dashboard::{Key, Msg, Screen, Terminal};
use valkit_core::Error;

/// Raw mode plus the alternate screen for as long as it lives.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        enable_raw_mode()?;
        if let Err(e) = execute!(io::stdout(), EnterAlternateScreen, crossterm::cursor::Hide) {
            let _ = disable_raw_mode();
            return Err(e);
        }
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), crossterm::cursor::Show, LeaveAlternateScreen);
    }
}

pub struct CrosstermTerminal {
    terminal: ratatui::Terminal<CrosstermBackend<Stdout>>,
    _guard: TerminalGuard,
}

impl CrosstermTerminal {
    pub fn enter() -> io::Result<Self> {
        let guard = TerminalGuard::enter()?;
        let mut terminal = ratatui::Terminal::new(CrosstermBackend::new(io::stdout()))?;
        terminal.clear()?;
        Ok(Self {
            terminal,
            _guard: guard,
        })
    }
}

impl Terminal for CrosstermTerminal {
    fn size(&self) -> valkit_core::Result<(u16, u16)> {
        crossterm::terminal::size().map_err(|e| Error::io("query terminal size", e))
    }

    fn draw(&mut self, screen: &Screen) -> valkit_core::Result<()> {
        self.terminal
            .draw(|frame| render(frame, screen))
            .map(|_| ())
            .map_err(|e| Error::io("draw terminal", e))
    }
}

fn render(frame: &mut Frame, screen: &Screen) {
    let area = frame.area();
    if let Some(loading) = &screen.loading {
        frame.render_widget(Paragraph::new(loading.as_str()).alignment(Alignment::Center), area);
        return;
    }

    for rendered in &screen.cells {
        let c = rendered.cell;
        let rect = Rect::new(c.x, c.y, c.w, c.h).intersection(area);
        if rect.width < 2 || rect.height < 2 {
            continue;
        }
        let block = Block::default()
            .borders(Borders::ALL)
            .title(rendered.title.as_str());
        frame.render_widget(Paragraph::new(rendered.body.as_str()).block(block), rect);
    }

    if let Some(warning) = screen.warning {
        let row = Rect::new(area.x, area.bottom().saturating_sub(1), area.width, 1.min(area.height));
        frame.render_widget(
            Paragraph::new(warning).style(Style::default().fg(Color::Yellow)),
            row,
        );
    }

    if let Some(overlay) = &screen.overlay {
        let lines = overlay.lines().count() as u16 + 2;
        let width = overlay.lines().map(|l| l.chars().count()).max().unwrap_or(0) as u16 + 4;
        let rect = centered_rect(width, lines, area);
        frame.render_widget(Clear, rect);
        frame.render_widget(
            Paragraph::new(overlay.as_str()).block(Block::default().borders(Borders::ALL).title("Help")),
            rect,
        );
    }
}

fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
    let w = width.min(area.width);
    let h = height.min(area.height);
    Rect::new(
        area.x + (area.width - w) / 2,
        area.y + (area.height - h) / 2,
        w,
        h,
    )
}

/// Maps a crossterm key press to a dashboard key.
pub fn key_from_event(event: KeyEvent) -> Option<Key> {
    if event.kind != KeyEventKind::Press {
        return None;
    }
    if event.modifiers.contains(KeyModifiers::CONTROL) {
        return match event.code {
            KeyCode::Char(c) => Some(Key::Ctrl(c.to_ascii_lowercase())),
            _ => None,
        };
    }
    Some(match event.code {
        KeyCode::Char(c) => Key::Char(c),
        KeyCode::Up => Key::Up,
        KeyCode::Down => Key::Down,
        KeyCode::Left => Key::Left,
        KeyCode::Right => Key::Right,
        KeyCode::PageUp => Key::PageUp,
        KeyCode::PageDown => Key::PageDown,
        KeyCode::Home => Key::Home,
        KeyCode::End => Key::End,
        KeyCode::Enter => Key::Enter,
        KeyCode::Esc => Key::Esc,
        KeyCode::Backspace => Key::Backspace,
        KeyCode::Tab => Key::Tab,
        _ => return None,
    })
}

/// Forwards key presses and resizes into the dashboard's queue until
/// cancelled or the terminal closes its event stream.
pub fn spawn_input(tx: UnboundedSender<Msg>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = EventStream::new();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.next() => event,
            };
            let msg = match event {
                Some(Ok(Event::Key(key))) => key_from_event(key).map(Msg::Key),
                Some(Ok(Event::Resize(width, height))) => Some(Msg::WindowSize { width, height }),
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    debug!(error = %e, "terminal event error");
                    None
                }
                None => break,
            };
            if let Some(msg) = msg {
                if tx.send(msg).is_err() {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEventState;

    fn press(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        }
    }

    #[test]
    fn maps_keys() {
        assert_eq!(key_from_event(press(KeyCode::Char('q'), KeyModifiers::NONE)), Some(Key::Char('q')));
        assert_eq!(key_from_event(press(KeyCode::Char('C'), KeyModifiers::CONTROL)), Some(Key::Ctrl('c')));
        assert_eq!(key_from_event(press(KeyCode::PageDown, KeyModifiers::NONE)), Some(Key::PageDown));
        assert_eq!(key_from_event(press(KeyCode::F(5), KeyModifiers::NONE)), None);

        let mut release = press(KeyCode::Char('q'), KeyModifiers::NONE);
        release.kind = KeyEventKind::Release;
        assert_eq!(key_from_event(release), None);
    }

    #[test]
    fn overlay_rect_is_centered_and_clamped() {
        let area = Rect::new(0, 0, 100, 40);
        assert_eq!(centered_rect(40, 10, area), Rect::new(30, 15, 40, 10));
        assert_eq!(centered_rect(200, 50, area), area);
    }
}
