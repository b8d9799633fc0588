//! # Dashboard Runtime
//!
//! A single-threaded message loop in the Elm style. [`App`] owns every piece
//! of UI state and is only touched by the loop: `update(msg)` returns the
//! follow-up work as [`Cmd`]s, and [`Program`] turns those into tasks that
//! each report back with exactly one [`Msg`].
//!
//! ## Refresh state machine
//!
//! ```text
//! Idle ── Tick/ForceRefresh ──► Fetching
//! Fetching ── Data ──► Idle            (snapshot replaced, last_ok = now)
//! Fetching ── DataErr ──► Idle         (snapshot kept, stale after 10s)
//! Fetching ── Tick ──► Fetching        (no second fetch)
//! Fetching ── ForceRefresh ──► cancel previous, start new
//! ```
//!
//! Every fetch carries a sequence number. Its cancel handle reaches the app
//! through `FetchStarted`, so it is only ever stored by the loop. Results for
//! a superseded sequence are dropped.
//!
//! One timer drives ticks: 1s while the node is catching up, 5s once a
//! successful fetch reports it in sync.

pub mod component;
pub mod fetch;
pub mod layout;
pub mod panels;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub use self::component::{Component, ComponentId, RenderCache};
pub use self::fetch::{DashboardSnapshot, NodeDataSource, ProcessInfo, SnapshotSource};
pub use self::layout::{Cell, Layout, RowSpec};
pub use self::panels::{HeaderStatus, Panel};

use self::component::centered;
use self::panels::{
    ChainStatusPanel, HeaderPanel, LogsPanel, NodeStatusPanel, PeersPanel, SystemPanel, ValidatorsPanel,
};
use crate::config::{
    REFRESH_CATCHING_UP, REFRESH_IN_SYNC, REWARD_TIMEOUT, RPC_TIMEOUT, SPINNER_INTERVAL, STALE_AFTER,
    VALIDATOR_PAGE_SIZE,
};
use crate::error::Result;
use crate::ringbuf::SharedRingBuffer;

const SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

pub const LOADING_TEXT: &str = "CONNECTING TO RPC";

const HELP: [&str; 12] = [
    "Keys",
    "",
    "q / Ctrl-C   quit",
    "r            refresh now",
    "h            toggle this help",
    "← / →        validator page",
    "↑ ↓ PgUp PgDn scroll logs",
    "Home / End   log top / bottom",
    "f            follow logs",
    "/            search logs",
    "Esc          clear search",
    "",
];

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Terminal-independent key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Ctrl(char),
    Up,
    Down,
    Left,
    Right,
    PageUp,
    PageDown,
    Home,
    End,
    Enter,
    Esc,
    Backspace,
    Tab,
}

#[derive(Debug, Clone)]
pub enum Msg {
    Tick,
    WindowSize { width: u16, height: u16 },
    Key(Key),
    FetchStarted { seq: u64, cancel: CancellationToken },
    Data { seq: u64, snapshot: Arc<DashboardSnapshot> },
    DataErr { seq: u64, error: String },
    ForceRefresh,
    ToggleHelp,
    /// Outstanding rewards per operator for one validator page.
    RewardsFetched {
        page: usize,
        rewards: Vec<(String, std::result::Result<String, String>)>,
    },
    SpinnerTick,
}

/// Work the loop performs on the app's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    Fetch { seq: u64 },
    FetchRewards { page: usize, operators: Vec<String> },
    /// Re-arms the single tick timer.
    ScheduleTick(Duration),
    ScheduleSpinner(Duration),
    Quit,
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardOptions {
    pub refresh_catching_up: Duration,
    pub refresh_in_sync: Duration,
    pub stale_after: Duration,
    /// Deadline for one whole fetch.
    pub fetch_timeout: Duration,
    /// Deadline for each reward lookup.
    pub reward_timeout: Duration,
    pub spinner_interval: Duration,
    pub page_size: usize,
}

impl Default for DashboardOptions {
    fn default() -> Self {
        Self {
            refresh_catching_up: REFRESH_CATCHING_UP,
            refresh_in_sync: REFRESH_IN_SYNC,
            stale_after: STALE_AFTER,
            fetch_timeout: RPC_TIMEOUT,
            reward_timeout: REWARD_TIMEOUT,
            spinner_interval: SPINNER_INTERVAL,
            page_size: VALIDATOR_PAGE_SIZE,
        }
    }
}

/// Header, three status panels, peers next to validators, logs.
pub fn default_rows() -> Vec<RowSpec> {
    use ComponentId::*;
    vec![
        RowSpec::new(vec![Header], vec![1], 4),
        RowSpec::new(vec![NodeStatus, ChainStatus, System], vec![1, 1, 1], 9),
        RowSpec::new(vec![Peers, Validators], vec![1, 2], 8),
        RowSpec::new(vec![Logs], vec![1], 6),
    ]
}

// ---------------------------------------------------------------------------
// Screen
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCell {
    pub cell: Cell,
    pub title: String,
    /// Text for the area inside the border.
    pub body: String,
}

/// One frame, ready for a terminal to draw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Screen {
    pub width: u16,
    pub height: u16,
    pub cells: Vec<RenderedCell>,
    pub warning: Option<&'static str>,
    pub overlay: Option<String>,
    /// Full-screen text shown instead of cells before the first data.
    pub loading: Option<String>,
}

impl Screen {
    /// Plain-text rendering with box-drawing borders.
    pub fn to_text(&self) -> String {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut grid = vec![vec![' '; w]; h];
        if let Some(loading) = &self.loading {
            put_block(&mut grid, 0, 0, loading);
        } else {
            for rc in &self.cells {
                draw_box(&mut grid, rc.cell, &rc.title, &rc.body);
            }
        }
        if let Some(overlay) = &self.overlay {
            let lines: Vec<&str> = overlay.lines().collect();
            let bw = (lines.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4).min(w) as u16;
            let bh = (lines.len() + 2).min(h) as u16;
            let cell = Cell {
                id: ComponentId::Header,
                x: (self.width - bw) / 2,
                y: (self.height - bh) / 2,
                w: bw,
                h: bh,
            };
            let body = component::fit_block(&lines, bw.saturating_sub(2), bh.saturating_sub(2));
            draw_box(&mut grid, cell, "Help", &body);
        }
        if let (Some(warning), Some(last)) = (self.warning, h.checked_sub(1)) {
            put_block(&mut grid, 0, last, &component::truncate(warning, w));
        }
        grid.into_iter()
            .map(|row| row.into_iter().collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn put_block(grid: &mut [Vec<char>], x: usize, y: usize, text: &str) {
    for (dy, line) in text.lines().enumerate() {
        let Some(row) = grid.get_mut(y + dy) else { break };
        for (dx, c) in line.chars().enumerate() {
            if let Some(slot) = row.get_mut(x + dx) {
                *slot = c;
            }
        }
    }
}

fn draw_box(grid: &mut [Vec<char>], cell: Cell, title: &str, body: &str) {
    let (x, y, w, h) = (cell.x as usize, cell.y as usize, cell.w as usize, cell.h as usize);
    if w < 2 || h < 2 {
        return;
    }
    let mut top = format!("┌{}┐", "─".repeat(w - 2));
    if w > 4 && !title.is_empty() {
        let t = component::truncate(&format!(" {title} "), w - 4);
        top = format!("┌─{t}{}┐", "─".repeat(w - 3 - t.chars().count()));
    }
    put_block(grid, x, y, &top);
    for dy in 1..h - 1 {
        put_block(grid, x, y + dy, "│");
        put_block(grid, x + w - 1, y + dy, "│");
    }
    put_block(grid, x, y + h - 1, &format!("└{}┘", "─".repeat(w - 2)));
    put_block(grid, x + 1, y + 1, body);
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

pub struct App {
    options: DashboardOptions,
    panels: Vec<Panel>,
    rows: Vec<RowSpec>,
    width: u16,
    height: u16,
    snapshot: Option<Arc<DashboardSnapshot>>,
    last_ok: Option<Instant>,
    last_error: Option<String>,
    seq: u64,
    in_flight: Option<u64>,
    fetch_cancel: Option<CancellationToken>,
    interval: Duration,
    help: bool,
    spinner: usize,
    quitting: bool,
}

impl App {
    pub fn new(options: DashboardOptions, logs: SharedRingBuffer) -> Self {
        let panels = vec![
            Panel::Header(HeaderPanel::default()),
            Panel::NodeStatus(NodeStatusPanel::default()),
            Panel::ChainStatus(ChainStatusPanel::default()),
            Panel::System(SystemPanel::default()),
            Panel::Peers(PeersPanel::default()),
            Panel::Validators(ValidatorsPanel::new(options.page_size)),
            Panel::Logs(LogsPanel::new(logs)),
        ];
        Self {
            interval: options.refresh_catching_up,
            options,
            panels,
            rows: default_rows(),
            width: 0,
            height: 0,
            snapshot: None,
            last_ok: None,
            last_error: None,
            seq: 0,
            in_flight: None,
            fetch_cancel: None,
            help: false,
            spinner: 0,
            quitting: false,
        }
    }

    pub fn options(&self) -> &DashboardOptions {
        &self.options
    }

    pub fn refresh_interval(&self) -> Duration {
        self.interval
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn has_fetch_cancel(&self) -> bool {
        self.fetch_cancel.is_some()
    }

    pub fn snapshot(&self) -> Option<&Arc<DashboardSnapshot>> {
        self.snapshot.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn help_visible(&self) -> bool {
        self.help
    }

    pub fn should_quit(&self) -> bool {
        self.quitting
    }

    /// True when the shown snapshot is older than the stale threshold.
    pub fn is_stale(&self) -> bool {
        self.last_ok
            .is_some_and(|at| at.elapsed() > self.options.stale_after)
    }

    /// Initial work: first fetch, the tick timer, the spinner, panel inits.
    pub fn init(&mut self) -> Vec<Cmd> {
        let mut cmds = vec![
            self.start_fetch(),
            Cmd::ScheduleTick(self.interval),
            Cmd::ScheduleSpinner(self.options.spinner_interval),
        ];
        cmds.extend(self.panels.iter_mut().filter_map(Component::init));
        cmds
    }

    fn start_fetch(&mut self) -> Cmd {
        self.seq += 1;
        self.in_flight = Some(self.seq);
        Cmd::Fetch { seq: self.seq }
    }

    /// Cancels any in-flight fetch.
    pub fn shutdown(&mut self) {
        if let Some(cancel) = self.fetch_cancel.take() {
            cancel.cancel();
        }
        self.in_flight = None;
    }

    fn quit(&mut self) -> Vec<Cmd> {
        self.shutdown();
        self.quitting = true;
        vec![Cmd::Quit]
    }

    fn broadcast(&mut self, msg: &Msg) -> Vec<Cmd> {
        self.panels.iter_mut().filter_map(|p| p.update(msg)).collect()
    }

    pub fn update(&mut self, msg: Msg) -> Vec<Cmd> {
        match msg {
            Msg::Tick => {
                let mut cmds = Vec::with_capacity(2);
                if self.in_flight.is_none() {
                    cmds.push(self.start_fetch());
                }
                cmds.push(Cmd::ScheduleTick(self.interval));
                cmds
            }
            Msg::WindowSize { width, height } => {
                if width > 0 && height > 0 {
                    self.width = width;
                    self.height = height;
                }
                Vec::new()
            }
            Msg::Key(key) => self.handle_key(key),
            Msg::FetchStarted { seq, cancel } => {
                if self.in_flight == Some(seq) {
                    if let Some(old) = self.fetch_cancel.replace(cancel) {
                        old.cancel();
                    }
                } else {
                    debug!(seq, "fetch superseded before start");
                    cancel.cancel();
                }
                Vec::new()
            }
            Msg::Data { seq, snapshot } => {
                if self.in_flight != Some(seq) {
                    debug!(seq, "dropping stale fetch result");
                    return Vec::new();
                }
                self.in_flight = None;
                self.fetch_cancel = None;
                self.last_ok = Some(Instant::now());
                self.last_error = snapshot.error.clone();

                let interval = if snapshot.in_sync() {
                    self.options.refresh_in_sync
                } else {
                    self.options.refresh_catching_up
                };
                self.snapshot = Some(Arc::clone(&snapshot));
                let mut cmds = self.broadcast(&Msg::Data { seq, snapshot });
                if interval != self.interval {
                    info!(interval = ?interval, "refresh interval changed");
                    self.interval = interval;
                    cmds.push(Cmd::ScheduleTick(interval));
                }
                cmds
            }
            Msg::DataErr { seq, error } => {
                if self.in_flight != Some(seq) {
                    debug!(seq, "dropping stale fetch error");
                    return Vec::new();
                }
                self.in_flight = None;
                self.fetch_cancel = None;
                debug!(%error, "dashboard fetch failed");
                self.last_error = Some(error);
                Vec::new()
            }
            Msg::ForceRefresh => {
                if let Some(cancel) = self.fetch_cancel.take() {
                    cancel.cancel();
                }
                vec![self.start_fetch()]
            }
            Msg::ToggleHelp => {
                self.help = !self.help;
                Vec::new()
            }
            msg @ Msg::RewardsFetched { .. } => self.broadcast(&msg),
            Msg::SpinnerTick => {
                self.spinner = self.spinner.wrapping_add(1);
                if self.snapshot.is_none() || self.in_flight.is_some() {
                    vec![Cmd::ScheduleSpinner(self.options.spinner_interval)]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn handle_key(&mut self, key: Key) -> Vec<Cmd> {
        if self.help {
            if matches!(key, Key::Char('q') | Key::Char('h') | Key::Esc) {
                self.help = false;
            }
            return Vec::new();
        }
        if key == Key::Ctrl('c') {
            return self.quit();
        }
        // A panel taking text input gets every key but Ctrl-C.
        if !self.panels.iter().any(Component::captures_input) {
            match key {
                Key::Char('q') => return self.quit(),
                Key::Char('r') => return self.update(Msg::ForceRefresh),
                Key::Char('h') => return self.update(Msg::ToggleHelp),
                _ => {}
            }
        }
        self.broadcast(&Msg::Key(key))
    }

    fn header_status(&self, warning: Option<&'static str>) -> HeaderStatus {
        let node = self.snapshot.as_ref().map(|s| &s.metrics.node);
        HeaderStatus {
            chain_id: node.map(|n| n.chain_id.clone()).unwrap_or_default(),
            moniker: node.map(|n| n.moniker.clone()).unwrap_or_default(),
            interval: self.interval,
            fetching: self.in_flight.is_some(),
            stale: self.is_stale(),
            error: self.last_error.clone(),
            age_secs: self.last_ok.map(|at| at.elapsed().as_secs()),
            warning,
        }
    }

    pub fn view(&mut self) -> Screen {
        let (width, height) = (self.width, self.height);
        let mut screen = Screen {
            width,
            height,
            ..Screen::default()
        };
        if width == 0 || height == 0 {
            return screen;
        }
        if self.snapshot.is_none() {
            let frame = SPINNER[self.spinner % SPINNER.len()];
            let headline = format!("{frame} {LOADING_TEXT}");
            let detail = self.last_error.clone().unwrap_or_default();
            screen.loading = Some(centered(&[headline.as_str(), "", detail.as_str()], width, height));
            return screen;
        }

        let layout = {
            let panels = &self.panels;
            let min_width = |id: ComponentId| panels.iter().find(|p| p.id() == id).map(Component::min_width);
            layout::compute(&self.rows, width, height, &min_width)
        };
        let status = self.header_status(layout.warning);
        for panel in &mut self.panels {
            if let Panel::Header(header) = panel {
                header.set_status(status.clone());
            }
        }

        for cell in layout.cells {
            let Some(panel) = self.panels.iter_mut().find(|p| p.id() == cell.id) else {
                continue;
            };
            let (w, h) = (cell.w.saturating_sub(2), cell.h.saturating_sub(2));
            let body = match catch_unwind(AssertUnwindSafe(|| panel.view(w, h))) {
                Ok(body) => body,
                Err(_) => {
                    error!(panel = %cell.id, "panel render panicked");
                    centered(&["render error"], w, h)
                }
            };
            screen.cells.push(RenderedCell {
                cell,
                title: panel.title(),
                body,
            });
        }
        screen.warning = layout.warning;
        if self.help {
            screen.overlay = Some(HELP.join("\n"));
        }
        screen
    }
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// The terminal capability: a size and a way to show a frame.
pub trait Terminal {
    fn size(&self) -> Result<(u16, u16)>;
    fn draw(&mut self, screen: &Screen) -> Result<()>;
}

/// Drives an [`App`]: owns the message queue and the tick timer, runs
/// commands as tasks, and draws after every message.
pub struct Program<T: Terminal> {
    app: App,
    source: Arc<dyn SnapshotSource>,
    terminal: T,
    tx: mpsc::UnboundedSender<Msg>,
    rx: mpsc::UnboundedReceiver<Msg>,
    next_tick: Option<Instant>,
}

impl<T: Terminal> Program<T> {
    pub fn new(app: App, source: Arc<dyn SnapshotSource>, terminal: T) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            app,
            source,
            terminal,
            tx,
            rx,
            next_tick: None,
        }
    }

    /// Feeds key and resize events from outside the loop.
    pub fn sender(&self) -> mpsc::UnboundedSender<Msg> {
        self.tx.clone()
    }

    /// Runs until the app quits or `cancel` fires. Returns the final app.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<App> {
        let (width, height) = self.terminal.size()?;
        self.app.update(Msg::WindowSize { width, height });
        let cmds = self.app.init();
        self.exec(cmds);
        self.terminal.draw(&self.app.view())?;

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    self.app.shutdown();
                    break;
                }
                Some(msg) = self.rx.recv() => msg,
                _ = wait_until(self.next_tick) => {
                    self.next_tick = None;
                    Msg::Tick
                }
            };
            let cmds = self.app.update(msg);
            if self.exec(cmds) {
                break;
            }
            self.terminal.draw(&self.app.view())?;
        }
        Ok(self.app)
    }

    /// Runs commands. Returns true on quit.
    fn exec(&mut self, cmds: Vec<Cmd>) -> bool {
        let mut quit = false;
        for cmd in cmds {
            match cmd {
                Cmd::Fetch { seq } => self.spawn_fetch(seq),
                Cmd::FetchRewards { page, operators } => self.spawn_rewards(page, operators),
                Cmd::ScheduleTick(after) => self.next_tick = Some(Instant::now() + after),
                Cmd::ScheduleSpinner(after) => {
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(Msg::SpinnerTick);
                    });
                }
                Cmd::Quit => quit = true,
            }
        }
        quit
    }

    fn spawn_fetch(&self, seq: u64) {
        let cancel = CancellationToken::new();
        // Queued before the task can report, so the app adopts the handle first.
        let _ = self.tx.send(Msg::FetchStarted {
            seq,
            cancel: cancel.clone(),
        });
        let tx = self.tx.clone();
        let source = Arc::clone(&self.source);
        let timeout = self.app.options().fetch_timeout;
        tokio::spawn(async move {
            let msg = tokio::select! {
                _ = cancel.cancelled() => Msg::DataErr { seq, error: "fetch cancelled".into() },
                r = tokio::time::timeout(timeout, source.fetch()) => match r {
                    Ok(Ok(snapshot)) => Msg::Data { seq, snapshot: Arc::new(snapshot) },
                    Ok(Err(e)) => Msg::DataErr { seq, error: e.to_string() },
                    Err(_) => Msg::DataErr { seq, error: format!("fetch timed out after {timeout:?}") },
                },
            };
            let _ = tx.send(msg);
        });
    }

    fn spawn_rewards(&self, page: usize, operators: Vec<String>) {
        let tx = self.tx.clone();
        let source = Arc::clone(&self.source);
        let timeout = self.app.options().reward_timeout;
        tokio::spawn(async move {
            let lookups = operators.into_iter().map(|operator| {
                let source = Arc::clone(&source);
                async move {
                    let result = match tokio::time::timeout(timeout, source.rewards(&operator)).await {
                        Ok(Ok(rewards)) => Ok(rewards),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("timed out".to_string()),
                    };
                    (operator, result)
                }
            });
            let rewards = join_all(lookups).await;
            let _ = tx.send(Msg::RewardsFetched { page, rewards });
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsSnapshot;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn app() -> App {
        let mut app = App::new(DashboardOptions::default(), SharedRingBuffer::new(50));
        app.update(Msg::WindowSize { width: 140, height: 45 });
        app
    }

    fn snapshot(catching_up: bool) -> Arc<DashboardSnapshot> {
        let mut metrics = MetricsSnapshot::default();
        metrics.node.rpc_listening = true;
        metrics.node.chain_id = "C-1".into();
        metrics.chain.catching_up = catching_up;
        Arc::new(DashboardSnapshot {
            metrics,
            ..DashboardSnapshot::default()
        })
    }

    fn fetch_seq(cmds: &[Cmd]) -> Option<u64> {
        cmds.iter().find_map(|c| match c {
            Cmd::Fetch { seq } => Some(*seq),
            _ => None,
        })
    }

    #[test]
    fn tick_while_fetching_does_not_start_another() {
        let mut app = app();
        let seq = fetch_seq(&app.init()).unwrap();
        assert!(app.is_fetching());

        let cmds = app.update(Msg::Tick);
        assert_eq!(fetch_seq(&cmds), None);
        assert!(cmds.contains(&Cmd::ScheduleTick(Duration::from_secs(1))));

        app.update(Msg::Data { seq, snapshot: snapshot(true) });
        assert!(!app.is_fetching());
        assert!(fetch_seq(&app.update(Msg::Tick)).is_some());
    }

    #[test]
    fn cancel_handle_lives_between_start_and_result() {
        let mut app = app();
        let seq = fetch_seq(&app.init()).unwrap();
        assert!(!app.has_fetch_cancel());

        let first = CancellationToken::new();
        app.update(Msg::FetchStarted { seq, cancel: first.clone() });
        assert!(app.has_fetch_cancel());

        let cmds = app.update(Msg::ForceRefresh);
        assert!(first.is_cancelled());
        let second_seq = fetch_seq(&cmds).unwrap();
        assert_ne!(second_seq, seq);

        // The cancelled fetch reports late; it must not land.
        app.update(Msg::DataErr { seq, error: "fetch cancelled".into() });
        assert!(app.is_fetching());
        assert_eq!(app.last_error(), None);

        let second = CancellationToken::new();
        app.update(Msg::FetchStarted { seq: second_seq, cancel: second.clone() });
        app.update(Msg::Data { seq: second_seq, snapshot: snapshot(true) });
        assert!(!app.has_fetch_cancel());
        assert!(!second.is_cancelled());
        assert!(app.snapshot().is_some());
    }

    #[test]
    fn superseded_fetch_started_is_cancelled_immediately() {
        let mut app = app();
        let seq = fetch_seq(&app.init()).unwrap();
        app.update(Msg::ForceRefresh);
        let late = CancellationToken::new();
        app.update(Msg::FetchStarted { seq, cancel: late.clone() });
        assert!(late.is_cancelled());
        assert!(!app.has_fetch_cancel());
    }

    #[test]
    fn interval_slows_once_in_sync() {
        let mut app = app();
        let seq = fetch_seq(&app.init()).unwrap();
        assert_eq!(app.refresh_interval(), Duration::from_secs(1));

        let cmds = app.update(Msg::Data { seq, snapshot: snapshot(true) });
        assert!(!cmds.iter().any(|c| matches!(c, Cmd::ScheduleTick(_))));

        let seq = fetch_seq(&app.update(Msg::Tick)).unwrap();
        let cmds = app.update(Msg::Data { seq, snapshot: snapshot(false) });
        assert_eq!(app.refresh_interval(), Duration::from_secs(5));
        assert!(cmds.contains(&Cmd::ScheduleTick(Duration::from_secs(5))));

        // A failed fetch keeps the interval.
        let seq = fetch_seq(&app.update(Msg::Tick)).unwrap();
        app.update(Msg::DataErr { seq, error: "boom".into() });
        assert_eq!(app.refresh_interval(), Duration::from_secs(5));
    }

    #[test]
    fn keys_follow_precedence() {
        let mut app = app();
        app.init();
        app.update(Msg::Key(Key::Char('h')));
        assert!(app.help_visible());
        assert!(app.update(Msg::Key(Key::Char('r'))).is_empty(), "help swallows keys");
        app.update(Msg::Key(Key::Esc));
        assert!(!app.help_visible());

        // Typing into log search does not trigger global keys.
        app.update(Msg::Key(Key::Char('/')));
        assert!(app.update(Msg::Key(Key::Char('r'))).is_empty());
        assert!(!app.should_quit());
        app.update(Msg::Key(Key::Enter));

        let cmds = app.update(Msg::Key(Key::Char('q')));
        assert_eq!(cmds, vec![Cmd::Quit]);
        assert!(app.should_quit());
    }

    #[test]
    fn quit_cancels_in_flight_fetch() {
        let mut app = app();
        let seq = fetch_seq(&app.init()).unwrap();
        let cancel = CancellationToken::new();
        app.update(Msg::FetchStarted { seq, cancel: cancel.clone() });
        app.update(Msg::Key(Key::Ctrl('c')));
        assert!(cancel.is_cancelled());
        assert!(!app.is_fetching());
    }

    #[tokio::test(start_paused = true)]
    async fn errors_keep_snapshot_and_mark_stale() {
        let mut app = app();
        let seq = fetch_seq(&app.init()).unwrap();
        app.update(Msg::Data { seq, snapshot: snapshot(true) });
        tokio::time::advance(Duration::from_secs(11)).await;

        let seq = fetch_seq(&app.update(Msg::Tick)).unwrap();
        app.update(Msg::DataErr { seq, error: "connection refused".into() });
        assert!(app.snapshot().is_some());
        assert!(app.is_stale());
        let text = app.view().to_text();
        assert!(text.contains("STALE"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn loading_screen_until_first_data() {
        let mut app = App::new(DashboardOptions::default(), SharedRingBuffer::new(5));
        assert_eq!(app.view(), Screen::default());
        app.update(Msg::WindowSize { width: 0, height: 10 });
        assert_eq!(app.view().width, 0);

        app.update(Msg::WindowSize { width: 60, height: 12 });
        let seq = fetch_seq(&app.init()).unwrap();
        let screen = app.view();
        assert!(screen.loading.as_deref().unwrap().contains(LOADING_TEXT));
        assert!(screen.cells.is_empty());

        app.update(Msg::Data { seq, snapshot: snapshot(true) });
        assert!(app.view().loading.is_none());
    }

    #[test]
    fn rendered_frame_fits_and_repeats() {
        let mut app = app();
        let seq = fetch_seq(&app.init()).unwrap();
        app.update(Msg::Data { seq, snapshot: snapshot(true) });
        let a = app.view();
        let b = app.view();
        assert_eq!(a.cells, b.cells);
        let text = a.to_text();
        assert_eq!(text.lines().count(), 45);
        assert!(text.lines().all(|l| l.chars().count() == 140));
        assert!(text.contains("Validators"));

        app.update(Msg::ToggleHelp);
        assert!(app.view().to_text().contains("toggle this help"));
    }

    // -- Program -----------------------------------------------------------

    struct ScriptedSource {
        fetches: Mutex<Vec<Instant>>,
        in_sync_from: usize,
        stop_after: usize,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch(&self) -> Result<DashboardSnapshot> {
            let n = {
                let mut fetches = self.fetches.lock();
                fetches.push(Instant::now());
                fetches.len()
            };
            if n >= self.stop_after {
                self.cancel.cancel();
            }
            Ok(snapshot(n < self.in_sync_from).as_ref().clone())
        }

        async fn rewards(&self, operator: &str) -> Result<String> {
            Ok(format!("{operator}-rewards"))
        }
    }

    #[derive(Default)]
    struct NullTerminal {
        draws: usize,
    }

    impl Terminal for NullTerminal {
        fn size(&self) -> Result<(u16, u16)> {
            Ok((120, 40))
        }

        fn draw(&mut self, screen: &Screen) -> Result<()> {
            assert!(screen.to_text().lines().count() <= 40);
            self.draws += 1;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn program_ticks_fast_then_slow() {
        let cancel = CancellationToken::new();
        let source = Arc::new(ScriptedSource {
            fetches: Mutex::new(Vec::new()),
            in_sync_from: 3,
            stop_after: 5,
            cancel: cancel.clone(),
        });
        let app = App::new(DashboardOptions::default(), SharedRingBuffer::new(10));
        let start = Instant::now();
        let program = Program::new(app, source.clone(), NullTerminal::default());

        let app = program.run(cancel).await.unwrap();
        assert!(!app.is_fetching());

        let offsets: Vec<u64> = source
            .fetches
            .lock()
            .iter()
            .map(|t| (*t - start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 1, 2, 7, 12]);
    }
}
