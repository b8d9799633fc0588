//! Component capability shared by every dashboard panel, plus the render
//! cache and text-fitting helpers the panels compose.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use super::{Cmd, Msg};

/// Default minimum width for ids the layout does not know.
pub const DEFAULT_MIN_WIDTH: u16 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentId {
    Header,
    NodeStatus,
    ChainStatus,
    System,
    Peers,
    Validators,
    Logs,
}

impl ComponentId {
    pub const ALL: [ComponentId; 7] = [
        ComponentId::Header,
        ComponentId::NodeStatus,
        ComponentId::ChainStatus,
        ComponentId::System,
        ComponentId::Peers,
        ComponentId::Validators,
        ComponentId::Logs,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ComponentId::Header => "header",
            ComponentId::NodeStatus => "node_status",
            ComponentId::ChainStatus => "chain_status",
            ComponentId::System => "system",
            ComponentId::Peers => "peers",
            ComponentId::Validators => "validators",
            ComponentId::Logs => "logs",
        }
    }

    /// Kept when a row has to degrade on a narrow terminal.
    pub const fn is_essential(self) -> bool {
        matches!(
            self,
            ComponentId::Header | ComponentId::NodeStatus | ComponentId::ChainStatus
        )
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dashboard panel. Views are pure: same size and data, same output.
pub trait Component {
    fn id(&self) -> ComponentId;
    fn title(&self) -> String;
    fn min_width(&self) -> u16;
    fn min_height(&self) -> u16;

    /// Follow-up work to run once the loop starts.
    fn init(&mut self) -> Option<Cmd> {
        None
    }

    fn update(&mut self, msg: &Msg) -> Option<Cmd>;

    /// Body text for an inner area of `width` x `height` cells.
    fn view(&mut self, width: u16, height: u16) -> String;

    /// True while the panel consumes printable keys as text input.
    fn captures_input(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Render Cache
// ---------------------------------------------------------------------------

/// Last rendered output keyed by a 64-bit hash of `"WxH|content"`.
#[derive(Debug, Clone, Default)]
pub struct RenderCache {
    key: Option<u64>,
    output: String,
    hits: u64,
    misses: u64,
}

impl RenderCache {
    pub fn key(width: u16, height: u16, content: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        format!("{width}x{height}|{content}").hash(&mut hasher);
        hasher.finish()
    }

    /// Returns the cached output for an unchanged key, otherwise renders.
    pub fn get_or_render(
        &mut self,
        width: u16,
        height: u16,
        content: &str,
        render: impl FnOnce() -> String,
    ) -> &str {
        let key = Self::key(width, height, content);
        if self.key == Some(key) {
            self.hits += 1;
        } else {
            self.output = render();
            self.key = Some(key);
            self.misses += 1;
        }
        &self.output
    }

    pub fn invalidate(&mut self) {
        self.key = None;
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

// ---------------------------------------------------------------------------
// Text Helpers
// ---------------------------------------------------------------------------

/// Truncates to `width` chars, marking the cut with `…`.
pub fn truncate(s: &str, width: usize) -> String {
    let count = s.chars().count();
    if count <= width {
        return s.to_string();
    }
    if width == 0 {
        return String::new();
    }
    let mut out: String = s.chars().take(width - 1).collect();
    out.push('…');
    out
}

/// Pads or truncates to exactly `width` chars.
pub fn fit(s: &str, width: usize) -> String {
    let t = truncate(s, width);
    let pad = width.saturating_sub(t.chars().count());
    format!("{t}{}", " ".repeat(pad))
}

/// `label` left, `value` right, exactly `width` chars.
pub fn kv_line(label: &str, value: &str, width: usize) -> String {
    let label_len = label.chars().count();
    let value_len = value.chars().count();
    if label_len + 1 + value_len > width {
        return fit(&format!("{label} {value}"), width);
    }
    format!("{label}{}{value}", " ".repeat(width - label_len - value_len))
}

/// Fits `lines` into a `width` x `height` block.
pub fn fit_block<S: AsRef<str>>(lines: &[S], width: u16, height: u16) -> String {
    let (w, h) = (width as usize, height as usize);
    let mut out: Vec<String> = lines.iter().take(h).map(|l| fit(l.as_ref(), w)).collect();
    while out.len() < h {
        out.push(" ".repeat(w));
    }
    out.join("\n")
}

/// Centers `text` inside a `width` x `height` block.
pub fn centered(text: &[&str], width: u16, height: u16) -> String {
    let (w, h) = (width as usize, height as usize);
    let top = h.saturating_sub(text.len()) / 2;
    let mut lines = vec![String::new(); top];
    for line in text {
        let t = truncate(line, w);
        let left = w.saturating_sub(t.chars().count()) / 2;
        lines.push(format!("{}{t}", " ".repeat(left)));
    }
    fit_block(&lines, width, height)
}

/// Horizontal bar of `width` chars filled to `percent`.
pub fn bar(percent: f64, width: usize) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * width as f64).round() as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled.min(width)))
}
