//! 配置管理器 - 负责处理不同环境下的配置覆盖
//!
//! - 加载 `config/environments/{LIVE_ENV}.toml` 并合并到基础配置
//! - 应用环境变量覆盖（端口、本人标识、推送通道端点）

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use toml::Value;
use tracing::warn;

use super::{LiveAppConfig, merge_value};

/// 环境名称变量
pub const ENV_NAME_VAR: &str = "LIVE_ENV";
/// 服务端口变量
pub const SERVER_PORT_VAR: &str = "LIVE_SERVER_PORT";
/// 本人标识变量
pub const SELF_ID_VAR: &str = "LIVE_SELF_ID";
/// 推送通道端点变量
pub const PIPE_PATH_VAR: &str = "LIVE_PIPE_PATH";

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 获取当前环境名称
    ///
    /// 从环境变量 LIVE_ENV 获取，未设置时默认为 "development"
    pub fn get_environment() -> String {
        env::var(ENV_NAME_VAR).unwrap_or_else(|_| "development".to_string())
    }

    /// 根据环境加载特定配置
    ///
    /// 加载 config/environments/{environment}.toml，整体合并到基础配置中
    pub fn load_environment_config(base: &mut Value) -> Result<()> {
        let env_name = Self::get_environment();
        let env_config_path = format!("config/environments/{}.toml", env_name);
        Self::merge_file(base, Path::new(&env_config_path))
    }

    /// 合并单个 TOML 文件（不存在时跳过）
    pub fn merge_file(base: &mut Value, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("无法读取环境配置文件: {}", path.display()))?;
        let overlay: Value = toml::from_str(&content)
            .with_context(|| format!("无效的环境配置格式: {}", path.display()))?;

        merge_value(base, overlay);
        Ok(())
    }

    /// 应用环境变量覆盖
    pub fn apply_env_overrides(config: &mut LiveAppConfig) {
        Self::apply_overrides(config, |key| env::var(key).ok());
    }

    /// 从任意来源读取覆盖值
    pub fn apply_overrides<F>(config: &mut LiveAppConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(SERVER_PORT_VAR) {
            match port.parse::<u16>() {
                Ok(port) => config.server.port = port,
                Err(e) => warn!(value = %port, error = %e, "Ignoring invalid {}", SERVER_PORT_VAR),
            }
        }

        if let Some(self_id) = lookup(SELF_ID_VAR).filter(|v| !v.is_empty()) {
            config.accessor.self_id = self_id;
        }

        if let Some(pipe_path) = lookup(PIPE_PATH_VAR) {
            config.accessor.pipe_path = Some(pipe_path).filter(|v| !v.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_apply_overrides() {
        let vars: HashMap<&str, &str> = [
            (SERVER_PORT_VAR, "9001"),
            (SELF_ID_VAR, "wxid_me"),
            (PIPE_PATH_VAR, ""),
        ]
        .into_iter()
        .collect();

        let mut config = LiveAppConfig::default();
        config.accessor.pipe_path = Some("/tmp/old.sock".to_string());
        ConfigManager::apply_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9001);
        assert_eq!(config.accessor.self_id, "wxid_me");
        assert_eq!(config.accessor.pipe_path, None);
    }

    #[test]
    fn test_invalid_port_is_ignored() {
        let mut config = LiveAppConfig::default();
        ConfigManager::apply_overrides(&mut config, |key| {
            (key == SERVER_PORT_VAR).then(|| "not-a-port".to_string())
        });
        assert_eq!(config.server.port, 5031);
    }

    #[test]
    fn test_merge_file_overlays_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("production.toml");
        fs::write(&path, "[live]\npoll_interval_ms = 500\n").unwrap();

        let mut base: Value = toml::from_str("[live]\nfetch_limit = 20\n").unwrap();
        ConfigManager::merge_file(&mut base, &path).unwrap();

        let config: LiveAppConfig = base.try_into().unwrap();
        assert_eq!(config.live.poll_interval_ms, 500);
        assert_eq!(config.live.fetch_limit, 20);
    }
}
