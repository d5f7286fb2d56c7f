use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// 策略组选择结果持久化
///
/// selector 的选中节点、管理面的 mode 与分组展开状态写入一个 JSON 文件，
/// 重启时恢复。读写都经本组件串行化，调用方不得持有其他锁。
pub struct CacheFile {
    path: PathBuf,
    state: Mutex<CacheState>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheState {
    #[serde(default)]
    selected: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(default)]
    group_expand: HashMap<String, bool>,
}

impl CacheFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// 尝试从文件加载，失败时使用默认空状态（降级行为）
    pub fn load_or_default(path: PathBuf) -> Self {
        let cache = Self::new(path);
        if let Err(e) = cache.load() {
            warn!(error = %e, "failed to load selection cache, using defaults");
        }
        cache
    }

    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "selection cache not found, using defaults");
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.path)?;
        let loaded: CacheState = serde_json::from_str(&content)?;
        debug!(
            path = %self.path.display(),
            groups = loaded.selected.len(),
            "loaded selection cache"
        );
        *self.state.lock().expect("cache lock poisoned") = loaded;
        Ok(())
    }

    fn save(&self, state: &CacheState) -> Result<()> {
        let content = serde_json::to_string_pretty(state)?;
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, content)?;
        debug!(path = %self.path.display(), "saved selection cache");
        Ok(())
    }

    pub fn load_selected(&self, group: &str) -> Option<String> {
        let state = self.state.lock().expect("cache lock poisoned");
        state.selected.get(group).cloned()
    }

    pub fn store_selected(&self, group: &str, selected: &str) -> Result<()> {
        let mut state = self.state.lock().expect("cache lock poisoned");
        state
            .selected
            .insert(group.to_string(), selected.to_string());
        self.save(&state)
    }

    pub fn load_mode(&self) -> Option<String> {
        let state = self.state.lock().expect("cache lock poisoned");
        state.mode.clone()
    }

    pub fn store_mode(&self, mode: &str) -> Result<()> {
        let mut state = self.state.lock().expect("cache lock poisoned");
        state.mode = Some(mode.to_string());
        self.save(&state)
    }

    pub fn load_group_expand(&self, group: &str) -> Option<bool> {
        let state = self.state.lock().expect("cache lock poisoned");
        state.group_expand.get(group).copied()
    }

    pub fn store_group_expand(&self, group: &str, expand: bool) -> Result<()> {
        let mut state = self.state.lock().expect("cache lock poisoned");
        state.group_expand.insert(group.to_string(), expand);
        self.save(&state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selected_roundtrip_via_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        {
            let cache = CacheFile::new(path.clone());
            cache.store_selected("selector-1", "proxy-hk").unwrap();
            cache.store_selected("selector-2", "proxy-jp").unwrap();
        }

        let cache = CacheFile::load_or_default(path);
        assert_eq!(cache.load_selected("selector-1").as_deref(), Some("proxy-hk"));
        assert_eq!(cache.load_selected("selector-2").as_deref(), Some("proxy-jp"));
        assert!(cache.load_selected("other").is_none());
    }

    #[test]
    fn overwrite_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheFile::new(dir.path().join("cache.json"));
        cache.store_selected("g", "a").unwrap();
        cache.store_selected("g", "b").unwrap();
        assert_eq!(cache.load_selected("g").as_deref(), Some("b"));
    }

    #[test]
    fn mode_and_group_expand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        {
            let cache = CacheFile::new(path.clone());
            cache.store_mode("rule").unwrap();
            cache.store_group_expand("g1", true).unwrap();
        }
        let cache = CacheFile::load_or_default(path);
        assert_eq!(cache.load_mode().as_deref(), Some("rule"));
        assert_eq!(cache.load_group_expand("g1"), Some(true));
        assert!(cache.load_group_expand("g2").is_none());
    }

    #[test]
    fn corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"not valid json!!!").unwrap();

        let cache = CacheFile::load_or_default(path);
        assert!(cache.load_selected("any").is_none());
    }

    #[test]
    fn missing_file_loads_empty() {
        let cache = CacheFile::new(PathBuf::from("/nonexistent/dir/cache.json"));
        assert!(cache.load().is_ok());
        assert!(cache.load_selected("g").is_none());
    }
}
