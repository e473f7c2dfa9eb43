use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::host::Rank;

pub const DEFAULT_MAX_SCRIPT_SIZE: u64 = 2_000_000;
pub const DEFAULT_CALL_BUDGET_MS: u64 = 1_000;
pub const DEFAULT_HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 30;

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PluginConfig {
    pub base_dir: PathBuf,
    pub temp_dir: String,
    pub scripts_dir: String,
    pub staff_maps_file: String,
    pub max_script_size: u64,
    /// Players above this rank see "logged" notices and get full errors in the server log.
    pub detail_rank: Rank,
    /// Rank allowed to upload, reload and call on maps the player does not own.
    pub manage_any_rank: Rank,
    /// Rank allowed to grant the staff script profile.
    pub staff_rank: Rank,
    /// Wall-clock budget per outermost script call. 0 disables the budget.
    pub call_budget_ms: u64,
    pub hook_instruction_interval: u32,
    pub download_timeout_secs: u64,
    pub watch_scripts: bool,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("lua"),
            temp_dir: "temp".to_string(),
            scripts_dir: "scripts".to_string(),
            staff_maps_file: "staffmaps.txt".to_string(),
            max_script_size: DEFAULT_MAX_SCRIPT_SIZE,
            detail_rank: Rank::ADV_BUILDER,
            manage_any_rank: Rank::OPERATOR,
            staff_rank: Rank::ADMIN,
            call_budget_ms: DEFAULT_CALL_BUDGET_MS,
            hook_instruction_interval: DEFAULT_HOOK_INSTRUCTION_INTERVAL,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            watch_scripts: false,
        }
    }
}

impl PluginConfig {
    /// Reads the JSON config named by `LEVELSCRIPT_CONFIG` (default `levelscript.json`),
    /// then applies environment overrides.
    pub fn load() -> Self {
        let path = std::env::var("LEVELSCRIPT_CONFIG")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "levelscript.json".to_string());
        let mut config = Self::from_file(Path::new(&path));
        config.apply_env();
        config.normalize();
        config
    }

    pub fn from_file(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<PluginConfig>(&contents) {
                Ok(cfg) => {
                    info!("[Lua config] Loaded config from {}", path.display());
                    cfg
                }
                Err(e) => {
                    warn!("[Lua config] Failed to parse {}: {}", path.display(), e);
                    PluginConfig::default()
                }
            },
            Err(_) => PluginConfig::default(),
        }
    }

    fn apply_env(&mut self) {
        if let Some(dir) = std::env::var("LEVELSCRIPT_BASE_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
        {
            self.base_dir = PathBuf::from(dir.trim());
        }
        self.max_script_size = env_u64("LEVELSCRIPT_MAX_SCRIPT_SIZE", self.max_script_size);
        self.call_budget_ms = env_u64("LEVELSCRIPT_CALL_BUDGET_MS", self.call_budget_ms);
        self.hook_instruction_interval = env_u64(
            "LEVELSCRIPT_HOOK_INSTRUCTION_INTERVAL",
            self.hook_instruction_interval as u64,
        )
        .min(u32::MAX as u64) as u32;
    }

    pub(crate) fn normalize(&mut self) {
        self.hook_instruction_interval = self.hook_instruction_interval.clamp(100, 1_000_000);
        self.max_script_size = self.max_script_size.max(1);
    }

    pub fn temp_path(&self) -> PathBuf {
        self.base_dir.join(&self.temp_dir)
    }

    pub fn scripts_path(&self) -> PathBuf {
        self.base_dir.join(&self.scripts_dir)
    }

    pub fn staff_maps_path(&self) -> PathBuf {
        self.base_dir.join(&self.staff_maps_file)
    }

    pub fn call_budget(&self) -> Option<Duration> {
        (self.call_budget_ms > 0).then(|| Duration::from_millis(self.call_budget_ms))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs.max(1))
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("levelscript.json");
        std::fs::write(
            &path,
            r#"{ "base_dir": "/srv/lua", "call_budget_ms": 0, "detail_rank": 100 }"#,
        )
        .expect("write config");

        let cfg = PluginConfig::from_file(&path);
        assert_eq!(cfg.base_dir, PathBuf::from("/srv/lua"));
        assert_eq!(cfg.detail_rank, Rank::ADMIN);
        assert_eq!(cfg.max_script_size, DEFAULT_MAX_SCRIPT_SIZE);
        assert!(cfg.call_budget().is_none());
        assert_eq!(cfg.scripts_path(), PathBuf::from("/srv/lua/scripts"));
    }

    #[test]
    fn malformed_json_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").expect("write config");

        let cfg = PluginConfig::from_file(&path);
        assert_eq!(cfg.max_script_size, DEFAULT_MAX_SCRIPT_SIZE);
        assert_eq!(cfg.temp_path(), PathBuf::from("lua/temp"));
    }

    #[test]
    fn normalize_clamps_hook_interval() {
        let mut cfg = PluginConfig {
            hook_instruction_interval: 1,
            ..PluginConfig::default()
        };
        cfg.normalize();
        assert_eq!(cfg.hook_instruction_interval, 100);
    }
}
