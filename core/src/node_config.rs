//! # Node Config Rewriter
//!
//! The node's `config.toml` is edited as lines, not parsed into a tree. Only
//! the keys valkit owns are touched:
//!
//! - `[p2p] persistent_peers`, `[p2p] addr_book_strict`
//! - `[statesync] enable`, `rpc_servers`, `trust_height`, `trust_hash`, `trust_period`
//!
//! Everything else, including comments and key order, is preserved byte for
//! byte. A key that does not exist yet is inserted after the last key of its
//! section; a missing section is appended. Writes go through a temp file and
//! a rename so the node never reads a half-written config.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::config::HomeLayout;
use crate::error::{Error, Result};
use crate::fsutil::write_atomic;

/// Inputs for [`NodeConfig::enable_state_sync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSyncParams {
    pub trust_height: i64,
    pub trust_hash: String,
    /// At least two light-client witnesses.
    pub rpc_servers: Vec<String>,
    pub trust_period: Duration,
}

/// Handle on one node config file.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    path: PathBuf,
}

impl NodeConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<home>/config/config.toml`.
    pub fn for_home(home: &Path) -> Self {
        Self::new(HomeLayout::new(home).config_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn load(&self) -> Result<ConfigDocument> {
        let text = fs::read_to_string(&self.path)
            .map_err(|e| Error::io(format!("read {}", self.path.display()), e))?;
        Ok(ConfigDocument::parse(&text))
    }

    fn store(&self, doc: &ConfigDocument) -> Result<()> {
        let mode = fs::metadata(&self.path)
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(0o644);
        write_atomic(&self.path, doc.render().as_bytes(), mode)
            .map_err(|e| Error::io(format!("write {}", self.path.display()), e))
    }

    /// Raw value of `key` under `[section]` (empty section = top level), with
    /// surrounding quotes removed.
    pub fn get(&self, section: &str, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.get(section, key))
    }

    /// The configured persistent peers, in file order.
    pub fn persistent_peers(&self) -> Result<Vec<String>> {
        Ok(self
            .get("p2p", "persistent_peers")?
            .map(|v| split_list(&v))
            .unwrap_or_default())
    }

    pub fn set_persistent_peers(&self, peers: &[String]) -> Result<()> {
        let mut doc = self.load()?;
        doc.set("p2p", "persistent_peers", &quote(&peers.join(",")));
        doc.set("p2p", "addr_book_strict", "false");
        self.store(&doc)?;
        info!(count = peers.len(), "persistent peers updated");
        Ok(())
    }

    pub fn enable_state_sync(&self, params: &StateSyncParams) -> Result<()> {
        if params.rpc_servers.len() < 2 {
            return Err(Error::invalid_args(format!(
                "state sync needs at least two RPC servers, got {}",
                params.rpc_servers.len()
            )));
        }
        if params.trust_hash.trim().is_empty() || params.trust_height <= 0 {
            return Err(Error::invalid_args("state sync needs a trust height and hash"));
        }
        let mut doc = self.load()?;
        doc.set("statesync", "enable", "true");
        doc.set("statesync", "rpc_servers", &quote(&params.rpc_servers.join(",")));
        doc.set("statesync", "trust_height", &params.trust_height.to_string());
        doc.set("statesync", "trust_hash", &quote(&params.trust_hash.to_uppercase()));
        doc.set("statesync", "trust_period", &quote(&format_go_duration(params.trust_period)));
        self.store(&doc)?;
        info!(height = params.trust_height, "state sync enabled");
        Ok(())
    }

    /// Turns state sync off, leaving the rest of the block intact.
    pub fn disable_state_sync(&self) -> Result<()> {
        let mut doc = self.load()?;
        doc.set("statesync", "enable", "false");
        self.store(&doc)
    }

    /// Copies the config to a timestamped sibling and returns its path.
    pub fn backup(&self) -> Result<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let name = format!(
            "{}.backup.{stamp}",
            self.path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );
        let target = self.path.with_file_name(name);
        fs::copy(&self.path, &target)
            .map_err(|e| Error::io(format!("back up {}", self.path.display()), e))?;
        debug!(backup = %target.display(), "config backed up");
        Ok(target)
    }
}

// ---------------------------------------------------------------------------
// Line Editor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfigDocument {
    lines: Vec<String>,
    trailing_newline: bool,
}

impl ConfigDocument {
    fn parse(text: &str) -> Self {
        Self {
            lines: text.lines().map(str::to_string).collect(),
            trailing_newline: text.is_empty() || text.ends_with('\n'),
        }
    }

    fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline {
            out.push('\n');
        }
        out
    }

    /// Line range `[start, end)` holding the body of `section`. The top level
    /// is the empty section.
    fn section_range(&self, section: &str) -> Option<(usize, usize)> {
        let start = if section.is_empty() {
            0
        } else {
            self.lines
                .iter()
                .position(|l| section_name(l).as_deref() == Some(section))?
                + 1
        };
        let end = self.lines[start..]
            .iter()
            .position(|l| section_name(l).is_some())
            .map_or(self.lines.len(), |offset| start + offset);
        Some((start, end))
    }

    fn find_key(&self, section: &str, key: &str) -> Option<usize> {
        let (start, end) = self.section_range(section)?;
        (start..end).find(|&i| key_of(&self.lines[i]) == Some(key))
    }

    fn get(&self, section: &str, key: &str) -> Option<String> {
        let line = &self.lines[self.find_key(section, key)?];
        let (_, value) = line.split_once('=')?;
        Some(unquote(strip_comment(value).trim()))
    }

    fn set(&mut self, section: &str, key: &str, value: &str) {
        if let Some(i) = self.find_key(section, key) {
            let indent: String = self.lines[i]
                .chars()
                .take_while(|c| c.is_whitespace())
                .collect();
            self.lines[i] = format!("{indent}{key} = {value}");
            return;
        }
        match self.section_range(section) {
            Some((start, end)) => {
                let insert_at = (start..end)
                    .rev()
                    .find(|&i| key_of(&self.lines[i]).is_some())
                    .map_or(start, |i| i + 1);
                self.lines.insert(insert_at, format!("{key} = {value}"));
            }
            None => {
                if self.lines.last().is_some_and(|l| !l.trim().is_empty()) {
                    self.lines.push(String::new());
                }
                self.lines.push(format!("[{section}]"));
                self.lines.push(format!("{key} = {value}"));
            }
        }
    }
}

fn section_name(line: &str) -> Option<String> {
    let trimmed = strip_comment(line).trim();
    let inner = trimmed.strip_prefix('[')?.strip_suffix(']')?;
    // Arrays of tables (`[[x]]`) are not sections valkit writes to.
    if inner.starts_with('[') {
        return None;
    }
    Some(inner.trim().to_string())
}

fn key_of(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') || trimmed.starts_with('[') {
        return None;
    }
    let (key, _) = trimmed.split_once('=')?;
    let key = key.trim();
    (!key.is_empty()).then_some(key)
}

/// Drops a trailing `# comment` that is not inside a quoted string.
fn strip_comment(s: &str) -> &str {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            '\\' if in_quotes && !escaped => {
                escaped = true;
                continue;
            }
            '"' if !escaped => in_quotes = !in_quotes,
            '#' if !in_quotes => return &s[..i],
            _ => {}
        }
        escaped = false;
    }
    s
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Formats like Go's `time.Duration.String` for whole seconds: `336h0m0s`,
/// `1m30s`, `45s`.
pub fn format_go_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"# top comment
proxy_app = "tcp://127.0.0.1:26658"
moniker = "node"

[p2p]
# Comma separated list of nodes to keep persistent connections to
persistent_peers = ""
addr_book_strict = true
max_num_inbound_peers = 40

[statesync]
enable = false
rpc_servers = ""
trust_height = 0
trust_hash = ""
trust_period = "168h0m0s"
"#;

    fn sample() -> (tempfile::TempDir, NodeConfig) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, SAMPLE).unwrap();
        (dir, NodeConfig::new(path))
    }

    #[test]
    fn persistent_peers_replace_in_place() {
        let (_dir, cfg) = sample();
        cfg.set_persistent_peers(&["a@1.2.3.4:26656".into(), "S@5.6.7.8:26656".into()])
            .unwrap();

        let text = fs::read_to_string(cfg.path()).unwrap();
        assert!(text.contains("persistent_peers = \"a@1.2.3.4:26656,S@5.6.7.8:26656\""));
        assert!(text.contains("addr_book_strict = false"));
        assert!(text.contains("# Comma separated list of nodes"));
        assert!(text.contains("max_num_inbound_peers = 40"));
        assert_eq!(
            cfg.persistent_peers().unwrap(),
            vec!["a@1.2.3.4:26656".to_string(), "S@5.6.7.8:26656".to_string()]
        );
    }

    #[test]
    fn state_sync_block_written() {
        let (_dir, cfg) = sample();
        cfg.enable_state_sync(&StateSyncParams {
            trust_height: 24_000,
            trust_hash: "def456".into(),
            rpc_servers: vec!["https://a:443".into(), "https://b:443".into()],
            trust_period: Duration::from_secs(336 * 3600),
        })
        .unwrap();

        assert_eq!(cfg.get("statesync", "enable").unwrap().as_deref(), Some("true"));
        assert_eq!(cfg.get("statesync", "trust_height").unwrap().as_deref(), Some("24000"));
        assert_eq!(cfg.get("statesync", "trust_hash").unwrap().as_deref(), Some("DEF456"));
        assert_eq!(cfg.get("statesync", "trust_period").unwrap().as_deref(), Some("336h0m0s"));
        assert_eq!(
            cfg.get("statesync", "rpc_servers").unwrap().as_deref(),
            Some("https://a:443,https://b:443")
        );
        // Top level keys are untouched.
        assert_eq!(cfg.get("", "moniker").unwrap().as_deref(), Some("node"));

        cfg.disable_state_sync().unwrap();
        assert_eq!(cfg.get("statesync", "enable").unwrap().as_deref(), Some("false"));
    }

    #[test]
    fn state_sync_needs_two_witnesses() {
        let (_dir, cfg) = sample();
        let err = cfg
            .enable_state_sync(&StateSyncParams {
                trust_height: 1000,
                trust_hash: "AA".into(),
                rpc_servers: vec!["https://a:443".into()],
                trust_period: Duration::from_secs(3600),
            })
            .unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidArgs);
    }

    #[test]
    fn missing_keys_and_sections_are_added() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "moniker = \"x\"\n\n[p2p]\nladdr = \"tcp://0.0.0.0:26656\"\n\n[mempool]\nsize = 5000\n").unwrap();
        let cfg = NodeConfig::new(&path);

        cfg.set_persistent_peers(&["p@1.1.1.1:26656".into()]).unwrap();
        cfg.disable_state_sync().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let p2p = text.find("[p2p]").unwrap();
        let mempool = text.find("[mempool]").unwrap();
        let peers = text.find("persistent_peers").unwrap();
        assert!(p2p < peers && peers < mempool, "{text}");
        assert!(text.ends_with("[statesync]\nenable = false\n"), "{text}");
    }

    #[test]
    fn comments_and_hashes_in_strings() {
        let doc = ConfigDocument::parse("[p2p]\nseeds = \"a#b\" # trailing\n");
        assert_eq!(doc.get("p2p", "seeds").as_deref(), Some("a#b"));
        assert_eq!(doc.get("p2p", "missing"), None);
        assert_eq!(doc.get("nope", "seeds"), None);
    }

    #[test]
    fn backup_creates_sibling_copy() {
        let (_dir, cfg) = sample();
        let backup = cfg.backup().unwrap();
        assert_eq!(backup.parent(), cfg.path().parent());
        assert!(backup.file_name().unwrap().to_string_lossy().starts_with("config.toml.backup."));
        assert_eq!(fs::read_to_string(backup).unwrap(), SAMPLE);
    }

    #[test]
    fn go_duration_format() {
        assert_eq!(format_go_duration(Duration::from_secs(336 * 3600)), "336h0m0s");
        assert_eq!(format_go_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_go_duration(Duration::from_secs(5)), "5s");
    }
}
