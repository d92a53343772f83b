/// Server configuration: defaults, then an optional JSON file, then environment overrides
use anyhow::Context;
use collab_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Where session snapshots are written; `None` disables persistence
    pub snapshot_dir: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            snapshot_dir: Some(PathBuf::from("collab_data")),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("COLLAB_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("COLLAB_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(dir) = lookup("COLLAB_SNAPSHOT_DIR") {
            // Empty turns persistence off
            self.snapshot_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("COLLAB_BIND_ADDR", "0.0.0.0:9000"),
            ("COLLAB_SNAPSHOT_DIR", ""),
        ]
        .into_iter()
        .collect();

        let mut config = ServerConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.snapshot_dir, None);
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(
            &path,
            r#"{"bind_addr": "127.0.0.1:7000", "engine": {"sweep_interval_secs": 5}}"#,
        )
        .unwrap();

        let config = ServerConfig::from_file(&path).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:7000");
        assert_eq!(config.engine.sweep_interval_secs, 5);
        assert_eq!(config.engine.conflict_column_window, 10);
        assert_eq!(config.snapshot_dir, Some(PathBuf::from("collab_data")));
    }
}
