//! Global trading gates and compliance predicates.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::logging::{log, obj, v_str, Domain, Level};

/// Halt / freeze switches shared by every agent.
#[derive(Debug, Default)]
pub struct SafetySwitch {
    halted: AtomicBool,
    frozen: RwLock<HashSet<String>>,
    kill_file: Option<PathBuf>,
}

impl SafetySwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also halted while `path` exists.
    pub fn with_kill_file(path: impl AsRef<Path>) -> Self {
        Self { kill_file: Some(path.as_ref().to_path_buf()), ..Self::default() }
    }

    pub fn halt_all(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            log(Level::Warn, Domain::System, "halt", obj(&[]));
        }
    }

    pub fn resume(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
            || self.kill_file.as_deref().map(Path::exists).unwrap_or(false)
    }

    pub fn freeze(&self, agent: &str) {
        let mut set = self.frozen.write().unwrap_or_else(|e| e.into_inner());
        if set.insert(agent.to_string()) {
            log(Level::Warn, Domain::System, "freeze", obj(&[("agent", v_str(agent))]));
        }
    }

    pub fn unfreeze(&self, agent: &str) {
        let mut set = self.frozen.write().unwrap_or_else(|e| e.into_inner());
        set.remove(agent);
    }

    pub fn is_frozen(&self, agent: &str) -> bool {
        let set = self.frozen.read().unwrap_or_else(|e| e.into_inner());
        set.contains(agent)
    }

    /// True when `agent` must not touch state or publish.
    pub fn blocked(&self, agent: &str) -> bool {
        self.is_halted() || self.is_frozen(agent)
    }
}

pub trait Compliance: Send + Sync {
    fn is_asset_allowed(&self, asset: &str) -> bool;
    fn is_trade_legal(&self, agent: &str, asset: &str) -> bool;
}

/// Static deny-lists: restricted assets, and per-agent forbidden assets.
#[derive(Debug, Clone)]
pub struct RestrictedList {
    restricted: HashSet<String>,
    agent_bans: Vec<(String, String)>,
}

impl Default for RestrictedList {
    fn default() -> Self {
        Self::new(&["GME", "AMC"], &[("sentiment-agent", "TSLA")])
    }
}

impl RestrictedList {
    pub fn new(restricted: &[&str], agent_bans: &[(&str, &str)]) -> Self {
        Self {
            restricted: restricted.iter().map(|a| a.to_uppercase()).collect(),
            agent_bans: agent_bans
                .iter()
                .map(|(agent, asset)| (agent.to_string(), asset.to_uppercase()))
                .collect(),
        }
    }

    pub fn permissive() -> Self {
        Self::new(&[], &[])
    }
}

impl Compliance for RestrictedList {
    fn is_asset_allowed(&self, asset: &str) -> bool {
        !self.restricted.contains(&asset.to_uppercase())
    }

    fn is_trade_legal(&self, agent: &str, asset: &str) -> bool {
        let asset = asset.to_uppercase();
        !self.agent_bans.iter().any(|(a, s)| a == agent && *s == asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_and_freeze() {
        let safety = SafetySwitch::new();
        assert!(!safety.blocked("signal-agent"));
        safety.freeze("signal-agent");
        assert!(safety.blocked("signal-agent"));
        assert!(!safety.blocked("trend-agent"));
        safety.unfreeze("signal-agent");
        safety.halt_all();
        assert!(safety.blocked("trend-agent"));
        safety.resume();
        assert!(!safety.is_halted());
    }

    #[test]
    fn test_kill_file_halts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("STOP");
        let safety = SafetySwitch::with_kill_file(&path);
        assert!(!safety.is_halted());
        std::fs::write(&path, b"").unwrap();
        assert!(safety.is_halted());
    }

    #[test]
    fn test_restricted_list() {
        let list = RestrictedList::default();
        assert!(!list.is_asset_allowed("GME"));
        assert!(!list.is_asset_allowed("amc"));
        assert!(list.is_asset_allowed("AAPL"));
        assert!(!list.is_trade_legal("sentiment-agent", "TSLA"));
        assert!(list.is_trade_legal("strategy-agent", "TSLA"));
    }
}
