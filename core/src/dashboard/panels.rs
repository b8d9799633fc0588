//! The dashboard panels. Each is a variant of [`Panel`]; the enum implements
//! [`Component`] by delegating to the variant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::component::{bar, kv_line, truncate, Component, ComponentId, RenderCache};
use super::fetch::DashboardSnapshot;
use super::{Cmd, Key, Msg};
use crate::fsutil::format_bytes;
use crate::ringbuf::SharedRingBuffer;
use crate::validator::ValidatorInfo;

// ---------------------------------------------------------------------------
// Registry Enum
// ---------------------------------------------------------------------------

pub enum Panel {
    Header(HeaderPanel),
    NodeStatus(NodeStatusPanel),
    ChainStatus(ChainStatusPanel),
    System(SystemPanel),
    Peers(PeersPanel),
    Validators(ValidatorsPanel),
    Logs(LogsPanel),
}

macro_rules! each_panel {
    ($panel:expr, $p:ident => $body:expr) => {
        match $panel {
            Panel::Header($p) => $body,
            Panel::NodeStatus($p) => $body,
            Panel::ChainStatus($p) => $body,
            Panel::System($p) => $body,
            Panel::Peers($p) => $body,
            Panel::Validators($p) => $body,
            Panel::Logs($p) => $body,
        }
    };
}

impl Component for Panel {
    fn id(&self) -> ComponentId {
        each_panel!(self, p => p.id())
    }

    fn title(&self) -> String {
        each_panel!(self, p => p.title())
    }

    fn min_width(&self) -> u16 {
        each_panel!(self, p => p.min_width())
    }

    fn min_height(&self) -> u16 {
        each_panel!(self, p => p.min_height())
    }

    fn init(&mut self) -> Option<Cmd> {
        each_panel!(self, p => p.init())
    }

    fn update(&mut self, msg: &Msg) -> Option<Cmd> {
        each_panel!(self, p => p.update(msg))
    }

    fn view(&mut self, width: u16, height: u16) -> String {
        each_panel!(self, p => p.view(width, height))
    }

    fn captures_input(&self) -> bool {
        each_panel!(self, p => p.captures_input())
    }
}

/// Renders `lines` through `cache`, keyed by their joined text.
fn cached_block(cache: &mut RenderCache, lines: &[String], width: u16, height: u16) -> String {
    let content = lines.join("\n");
    cache
        .get_or_render(width, height, &content, || {
            super::component::fit_block(lines, width, height)
        })
        .to_string()
}

fn snapshot_of(msg: &Msg) -> Option<&Arc<DashboardSnapshot>> {
    match msg {
        Msg::Data { snapshot, .. } => Some(snapshot),
        _ => None,
    }
}

pub fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    let (days, hours, mins) = (secs / 86_400, secs / 3_600 % 24, secs / 60 % 60);
    match (days, hours) {
        (0, 0) => format!("{mins}m {}s", secs % 60),
        (0, _) => format!("{hours}h {mins}m"),
        _ => format!("{days}d {hours}h {mins}m"),
    }
}

/// Base-denomination amount (6 decimals) in display units.
pub fn format_tokens(amount: u128) -> String {
    let whole = amount as f64 / 1_000_000.0;
    if whole >= 1_000_000.0 {
        format!("{:.2}M", whole / 1_000_000.0)
    } else if whole >= 1_000.0 {
        format!("{:.2}K", whole / 1_000.0)
    } else {
        format!("{whole:.2}")
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Loop state the header shows. Set by the app before each render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderStatus {
    pub chain_id: String,
    pub moniker: String,
    pub interval: Duration,
    pub fetching: bool,
    pub stale: bool,
    pub error: Option<String>,
    pub age_secs: Option<u64>,
    pub warning: Option<&'static str>,
}

#[derive(Debug, Default)]
pub struct HeaderPanel {
    status: HeaderStatus,
    cache: RenderCache,
}

impl HeaderPanel {
    pub fn set_status(&mut self, status: HeaderStatus) {
        self.status = status;
    }
}

impl Component for HeaderPanel {
    fn id(&self) -> ComponentId {
        ComponentId::Header
    }

    fn title(&self) -> String {
        format!("valkit {}", crate::config::TOOL_VERSION)
    }

    fn min_width(&self) -> u16 {
        20
    }

    fn min_height(&self) -> u16 {
        4
    }

    fn update(&mut self, _msg: &Msg) -> Option<Cmd> {
        None
    }

    fn view(&mut self, width: u16, height: u16) -> String {
        let s = &self.status;
        let mut first = Vec::new();
        if !s.chain_id.is_empty() {
            first.push(format!("chain {}", s.chain_id));
        }
        if !s.moniker.is_empty() {
            first.push(format!("moniker {}", s.moniker));
        }
        first.push(format!("refresh {}s", s.interval.as_secs()));
        match s.age_secs {
            Some(age) => first.push(format!("updated {age}s ago")),
            None => first.push("waiting for data".to_string()),
        }
        if s.fetching {
            first.push("⟳".to_string());
        }

        let second = if let Some(err) = &s.error {
            let prefix = if s.stale { "STALE · " } else { "" };
            format!("{prefix}error: {err}")
        } else if let Some(warning) = s.warning {
            warning.to_string()
        } else {
            "q quit · r refresh · h help · ←/→ page · / search · f follow".to_string()
        };
        let lines = vec![first.join("  │  "), second];
        cached_block(&mut self.cache, &lines, width, height)
    }
}

// ---------------------------------------------------------------------------
// Node / Chain / System
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct NodeStatusPanel {
    data: Option<Arc<DashboardSnapshot>>,
    cache: RenderCache,
}

impl Component for NodeStatusPanel {
    fn id(&self) -> ComponentId {
        ComponentId::NodeStatus
    }

    fn title(&self) -> String {
        "Node".to_string()
    }

    fn min_width(&self) -> u16 {
        26
    }

    fn min_height(&self) -> u16 {
        9
    }

    fn update(&mut self, msg: &Msg) -> Option<Cmd> {
        if let Some(snapshot) = snapshot_of(msg) {
            self.data = Some(Arc::clone(snapshot));
        }
        None
    }

    fn view(&mut self, width: u16, height: u16) -> String {
        let w = width as usize;
        let lines = match &self.data {
            None => vec!["no data".to_string()],
            Some(d) => {
                let p = &d.process;
                let node = &d.metrics.node;
                vec![
                    kv_line("Status", if p.running { "● running" } else { "○ stopped" }, w),
                    kv_line("PID", &p.pid.map_or("-".into(), |pid| pid.to_string()), w),
                    kv_line("Uptime", &p.uptime.map_or("-".into(), format_uptime), w),
                    kv_line("Version", p.version.as_deref().unwrap_or("-"), w),
                    kv_line("Node ID", &truncate(&node.node_id, w.saturating_sub(9)), w),
                    kv_line("Moniker", &node.moniker, w),
                    kv_line("RPC", if node.rpc_listening { "listening" } else { "down" }, w),
                ]
            }
        };
        cached_block(&mut self.cache, &lines, width, height)
    }
}

#[derive(Debug, Default)]
pub struct ChainStatusPanel {
    data: Option<Arc<DashboardSnapshot>>,
    cache: RenderCache,
}

impl Component for ChainStatusPanel {
    fn id(&self) -> ComponentId {
        ComponentId::ChainStatus
    }

    fn title(&self) -> String {
        "Chain".to_string()
    }

    fn min_width(&self) -> u16 {
        26
    }

    fn min_height(&self) -> u16 {
        9
    }

    fn update(&mut self, msg: &Msg) -> Option<Cmd> {
        if let Some(snapshot) = snapshot_of(msg) {
            self.data = Some(Arc::clone(snapshot));
        }
        None
    }

    fn view(&mut self, width: u16, height: u16) -> String {
        let w = width as usize;
        let lines = match &self.data {
            None => vec!["no data".to_string()],
            Some(d) => {
                let chain = &d.metrics.chain;
                let sync = if !d.metrics.node.rpc_listening {
                    "unknown"
                } else if chain.catching_up {
                    "catching up"
                } else {
                    "in sync"
                };
                let opt = |v: Option<i64>| v.map_or("-".to_string(), |h| h.to_string());
                vec![
                    kv_line("Chain ID", &d.metrics.node.chain_id, w),
                    kv_line("Height", &chain.local_height.to_string(), w),
                    kv_line("Network", &opt(chain.remote_height), w),
                    kv_line("Behind", &opt(chain.blocks_behind()), w),
                    kv_line("Sync", sync, w),
                    kv_line(
                        "Latency",
                        &d.metrics.network.latency_ms.map_or("-".into(), |ms| format!("{ms} ms")),
                        w,
                    ),
                ]
            }
        };
        cached_block(&mut self.cache, &lines, width, height)
    }
}

#[derive(Debug, Default)]
pub struct SystemPanel {
    data: Option<Arc<DashboardSnapshot>>,
    cache: RenderCache,
}

impl Component for SystemPanel {
    fn id(&self) -> ComponentId {
        ComponentId::System
    }

    fn title(&self) -> String {
        "System".to_string()
    }

    fn min_width(&self) -> u16 {
        30
    }

    fn min_height(&self) -> u16 {
        8
    }

    fn update(&mut self, msg: &Msg) -> Option<Cmd> {
        if let Some(snapshot) = snapshot_of(msg) {
            self.data = Some(Arc::clone(snapshot));
        }
        None
    }

    fn view(&mut self, width: u16, height: u16) -> String {
        let w = width as usize;
        let lines = match &self.data {
            None => vec!["no data".to_string()],
            Some(d) => {
                let s = &d.metrics.system;
                let usage = |used: u64, total: u64| format!("{} / {}", format_bytes(used), format_bytes(total));
                vec![
                    kv_line("CPU", &format!("{:.1}%", s.cpu_percent), w),
                    bar(s.cpu_percent, w),
                    kv_line("Memory", &usage(s.memory_used, s.memory_total), w),
                    bar(s.memory_percent(), w),
                    kv_line("Disk", &usage(s.disk_used, s.disk_total), w),
                    bar(s.disk_percent(), w),
                ]
            }
        };
        cached_block(&mut self.cache, &lines, width, height)
    }
}

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct PeersPanel {
    data: Option<Arc<DashboardSnapshot>>,
    cache: RenderCache,
}

impl Component for PeersPanel {
    fn id(&self) -> ComponentId {
        ComponentId::Peers
    }

    fn title(&self) -> String {
        match &self.data {
            Some(d) => format!("Peers ({})", d.peers.len()),
            None => "Peers".to_string(),
        }
    }

    fn min_width(&self) -> u16 {
        30
    }

    fn min_height(&self) -> u16 {
        6
    }

    fn update(&mut self, msg: &Msg) -> Option<Cmd> {
        if let Some(snapshot) = snapshot_of(msg) {
            self.data = Some(Arc::clone(snapshot));
        }
        None
    }

    fn view(&mut self, width: u16, height: u16) -> String {
        let w = width as usize;
        let lines = match &self.data {
            None => vec!["no data".to_string()],
            Some(d) if d.peers.is_empty() => vec!["no peers connected".to_string()],
            Some(d) => d
                .peers
                .iter()
                .map(|p| {
                    let name = if p.moniker.is_empty() { "-" } else { &p.moniker };
                    let id: String = p.id.chars().take(12).collect();
                    kv_line(name, &format!("{id} {}", p.remote_ip), w)
                })
                .collect(),
        };
        cached_block(&mut self.cache, &lines, width, height)
    }
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

/// Paginated validator list. Rewards are fetched per page on demand.
#[derive(Debug)]
pub struct ValidatorsPanel {
    data: Option<Arc<DashboardSnapshot>>,
    page: usize,
    page_size: usize,
    rewards: HashMap<String, Result<String, String>>,
    pending_page: Option<usize>,
    cache: RenderCache,
}

impl ValidatorsPanel {
    pub fn new(page_size: usize) -> Self {
        Self {
            data: None,
            page: 0,
            page_size: page_size.max(1),
            rewards: HashMap::new(),
            pending_page: None,
            cache: RenderCache::default(),
        }
    }

    pub fn page(&self) -> usize {
        self.page
    }

    fn validators(&self) -> &[ValidatorInfo] {
        match &self.data {
            Some(d) => &d.validators,
            None => &[],
        }
    }

    pub fn page_count(&self) -> usize {
        self.validators().len().div_ceil(self.page_size).max(1)
    }

    fn page_slice(&self) -> &[ValidatorInfo] {
        let list = self.validators();
        let start = (self.page * self.page_size).min(list.len());
        let end = (start + self.page_size).min(list.len());
        &list[start..end]
    }

    /// Requests rewards for the current page unless known or in flight.
    fn rewards_cmd(&mut self) -> Option<Cmd> {
        let operators: Vec<String> = self
            .page_slice()
            .iter()
            .map(|v| v.operator_address.clone())
            .filter(|op| !self.rewards.contains_key(op))
            .collect();
        if operators.is_empty() || self.pending_page == Some(self.page) {
            return None;
        }
        self.pending_page = Some(self.page);
        Some(Cmd::FetchRewards {
            page: self.page,
            operators,
        })
    }
}

impl Component for ValidatorsPanel {
    fn id(&self) -> ComponentId {
        ComponentId::Validators
    }

    fn title(&self) -> String {
        format!("Validators · page {}/{}", self.page + 1, self.page_count())
    }

    fn min_width(&self) -> u16 {
        48
    }

    fn min_height(&self) -> u16 {
        8
    }

    fn update(&mut self, msg: &Msg) -> Option<Cmd> {
        match msg {
            Msg::Data { snapshot, .. } => {
                self.data = Some(Arc::clone(snapshot));
                self.page = self.page.min(self.page_count() - 1);
                self.rewards_cmd()
            }
            Msg::Key(Key::Right) if self.page + 1 < self.page_count() => {
                self.page += 1;
                self.rewards_cmd()
            }
            Msg::Key(Key::Left) if self.page > 0 => {
                self.page -= 1;
                self.rewards_cmd()
            }
            Msg::RewardsFetched { page, rewards } => {
                for (operator, result) in rewards {
                    self.rewards.insert(operator.clone(), result.clone());
                }
                if self.pending_page == Some(*page) {
                    self.pending_page = None;
                }
                None
            }
            _ => None,
        }
    }

    fn view(&mut self, width: u16, height: u16) -> String {
        let w = width as usize;
        let mine = self
            .data
            .as_ref()
            .and_then(|d| d.my_validator.as_ref())
            .map(|v| v.operator_address.clone());
        let mut lines = Vec::new();
        if self.validators().is_empty() {
            lines.push("no validators".to_string());
        } else {
            lines.push(format!("{:>3}  {:<16} {:>10} {:<8} {}", "#", "Moniker", "Tokens", "Status", "Rewards"));
            let offset = self.page * self.page_size;
            for (i, v) in self.page_slice().iter().enumerate() {
                let marker = if mine.as_deref() == Some(v.operator_address.as_str()) { '*' } else { ' ' };
                let status = if v.jailed {
                    "jailed"
                } else if v.is_bonded() {
                    "bonded"
                } else {
                    "inactive"
                };
                let rewards = match self.rewards.get(&v.operator_address) {
                    Some(Ok(r)) => r.clone(),
                    Some(Err(_)) => "error".to_string(),
                    None => "…".to_string(),
                };
                lines.push(format!(
                    "{marker}{:>2}  {:<16} {:>10} {:<8} {rewards}",
                    offset + i + 1,
                    truncate(&v.moniker, 16),
                    format_tokens(v.token_amount()),
                    status,
                ));
            }
        }
        let lines: Vec<String> = lines.iter().map(|l| truncate(l, w)).collect();
        cached_block(&mut self.cache, &lines, width, height)
    }
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// Node log viewer over the tailer's ring buffer, with search and follow.
#[derive(Debug)]
pub struct LogsPanel {
    buffer: SharedRingBuffer,
    /// Lines scrolled up from the bottom.
    scroll: usize,
    follow: bool,
    search: String,
    editing: bool,
    last_height: usize,
    cache: RenderCache,
}

impl LogsPanel {
    pub fn new(buffer: SharedRingBuffer) -> Self {
        Self {
            buffer,
            scroll: 0,
            follow: true,
            search: String::new(),
            editing: false,
            last_height: 10,
            cache: RenderCache::default(),
        }
    }

    pub fn is_following(&self) -> bool {
        self.follow
    }

    pub fn search(&self) -> &str {
        &self.search
    }

    fn matching_lines(&self) -> Vec<String> {
        let lines = self.buffer.get_all();
        if self.search.is_empty() {
            return lines;
        }
        let needle = self.search.to_lowercase();
        lines
            .into_iter()
            .filter(|l| l.to_lowercase().contains(&needle))
            .collect()
    }

    fn scroll_up(&mut self, n: usize) {
        self.follow = false;
        self.scroll = self.scroll.saturating_add(n);
    }

    fn scroll_down(&mut self, n: usize) {
        self.scroll = self.scroll.saturating_sub(n);
    }

    fn edit(&mut self, key: Key) {
        match key {
            Key::Char(c) => self.search.push(c),
            Key::Backspace => {
                self.search.pop();
            }
            Key::Enter => self.editing = false,
            Key::Esc => {
                self.search.clear();
                self.editing = false;
            }
            _ => {}
        }
        self.scroll = 0;
    }
}

impl Component for LogsPanel {
    fn id(&self) -> ComponentId {
        ComponentId::Logs
    }

    fn title(&self) -> String {
        if self.search.is_empty() {
            "Logs".to_string()
        } else {
            format!("Logs · /{}", self.search)
        }
    }

    fn min_width(&self) -> u16 {
        30
    }

    fn min_height(&self) -> u16 {
        6
    }

    fn captures_input(&self) -> bool {
        self.editing
    }

    fn update(&mut self, msg: &Msg) -> Option<Cmd> {
        let Msg::Key(key) = msg else {
            return None;
        };
        if self.editing {
            self.edit(*key);
            return None;
        }
        let page = self.last_height.max(1);
        match key {
            Key::Up => self.scroll_up(1),
            Key::Down => self.scroll_down(1),
            Key::PageUp => self.scroll_up(page),
            Key::PageDown => self.scroll_down(page),
            Key::Home => self.scroll_up(usize::MAX / 2),
            Key::End => {
                self.scroll = 0;
                self.follow = true;
            }
            Key::Char('f') => {
                self.follow = !self.follow;
                if self.follow {
                    self.scroll = 0;
                }
            }
            Key::Char('/') => {
                self.editing = true;
                self.search.clear();
            }
            Key::Esc => self.search.clear(),
            _ => {}
        }
        None
    }

    fn view(&mut self, width: u16, height: u16) -> String {
        let visible = (height as usize).saturating_sub(1);
        self.last_height = visible;
        let lines = self.matching_lines();
        if self.follow {
            self.scroll = 0;
        }
        let max_scroll = lines.len().saturating_sub(visible);
        self.scroll = self.scroll.min(max_scroll);
        let end = lines.len() - self.scroll;
        let start = end.saturating_sub(visible);

        let mut out: Vec<String> = lines[start..end].to_vec();
        while out.len() < visible {
            out.insert(0, String::new());
        }
        let mode = if self.editing {
            format!("search: {}▏", self.search)
        } else if self.follow {
            "[FOLLOW]".to_string()
        } else {
            format!("[SCROLL -{}]", self.scroll)
        };
        out.push(format!("{mode}  {} lines", lines.len()));
        cached_block(&mut self.cache, &out, width, height)
    }
}
