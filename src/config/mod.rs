//! 配置模块
//!
//! 该模块提供实时推送服务的配置管理功能，包括：
//! - 配置文件加载和解析（单文件或目录）
//! - 环境特定配置覆盖
//! - 环境变量覆盖
//!
//! 目录结构：
//! ```text
//! config/
//! ├── base.toml
//! ├── shared/*.toml
//! ├── services/*.toml
//! ├── overrides/*.toml
//! └── environments/{LIVE_ENV}.toml
//! ```

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use toml::Value;
use tracing::warn;

use crate::error::LiveError;

mod manager;
pub use manager::ConfigManager;

/// 全局应用配置实例，使用 OnceLock 确保只初始化一次
static APP_CONFIG: OnceLock<LiveAppConfig> = OnceLock::new();

/// 配置路径环境变量
pub const CONFIG_PATH_ENV: &str = "LIVE_CONFIG_PATH";

/// 服务监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 5031,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（EnvFilter 语法）
    pub level: String,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub with_file: bool,
    pub with_line_number: bool,
    /// 输出 JSON 格式
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
            with_thread_ids: false,
            with_file: false,
            with_line_number: false,
            json: false,
        }
    }
}

/// 访问器配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessorConfig {
    /// 本人标识，本人发送的消息以此作为发送者
    pub self_id: String,
    /// 推送通道端点（Unix socket 路径或命名管道名），为空时只用轮询
    pub pipe_path: Option<String>,
    /// 内存访问器的 JSON 快照
    pub snapshot_path: Option<String>,
}

/// 实时推送配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// 每次增量检查拉取的条数
    pub fetch_limit: usize,
    /// 每个会话已投递集合的容量上限
    pub seen_capacity: usize,
    /// 无目标信号的防抖窗口（毫秒）
    pub debounce_ms: u64,
    /// 轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// 通配订阅时扫描的最近活跃会话数
    pub wildcard_sweep_limit: usize,
    /// 推送连接确认超时（毫秒），超时后启动轮询
    pub push_confirm_timeout_ms: u64,
    /// 信号队列和每个连接发送队列的容量
    pub event_buffer: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 10,
            seen_capacity: 1000,
            debounce_ms: 100,
            poll_interval_ms: 1000,
            wildcard_sweep_limit: 20,
            push_confirm_timeout_ms: 2000,
            event_buffer: 256,
        }
    }
}

/// 推送通道重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    pub channel_start_delays_ms: Vec<u64>,
    pub first_connect_delay_ms: u64,
    pub connect_step_ms: u64,
    pub connect_delay_cap_ms: u64,
    pub max_connect_retries: u32,
    pub restart_delay_ms: u64,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            channel_start_delays_ms: vec![0, 200, 500],
            first_connect_delay_ms: 200,
            connect_step_ms: 500,
            connect_delay_cap_ms: 5000,
            max_connect_retries: 5,
            restart_delay_ms: 3000,
        }
    }
}

/// 历史查询配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    pub batch_size: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 5000,
            batch_size: 500,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveAppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub accessor: AccessorConfig,
    pub live: LiveConfig,
    pub pipe: PipeConfig,
    pub history: HistoryConfig,
}

impl LiveAppConfig {
    /// 校验并修正明显不合理的取值
    pub fn ensure_defaults(&mut self) {
        if self.server.address.is_empty() {
            self.server.address = ServerConfig::default().address;
        }
        if self.live.fetch_limit == 0 {
            self.live.fetch_limit = LiveConfig::default().fetch_limit;
        }
        if self.live.seen_capacity < self.live.fetch_limit {
            warn!(
                seen_capacity = self.live.seen_capacity,
                fetch_limit = self.live.fetch_limit,
                "seen_capacity below fetch_limit, raising it"
            );
            self.live.seen_capacity = self.live.fetch_limit;
        }
        if self.live.event_buffer == 0 {
            self.live.event_buffer = LiveConfig::default().event_buffer;
        }
        if self.pipe.channel_start_delays_ms.is_empty() {
            self.pipe.channel_start_delays_ms = PipeConfig::default().channel_start_delays_ms;
        }
        if self.history.batch_size == 0 {
            self.history.batch_size = HistoryConfig::default().batch_size;
        }
        if self.history.max_limit < self.history.default_limit {
            self.history.max_limit = self.history.default_limit;
        }
    }

    /// 启动实时链路前的硬性检查；`ensure_defaults` 不修正的取值在这里拒绝
    pub fn validate(&self) -> std::result::Result<(), LiveError> {
        if self.live.poll_interval_ms == 0 {
            return Err(LiveError::Config("live.poll_interval_ms must be positive".to_string()));
        }
        if self.live.event_buffer == 0 {
            return Err(LiveError::Config("live.event_buffer must be positive".to_string()));
        }
        if self.live.fetch_limit == 0 {
            return Err(LiveError::Config("live.fetch_limit must be positive".to_string()));
        }
        if self.pipe.channel_start_delays_ms.is_empty() {
            return Err(LiveError::Config(
                "pipe.channel_start_delays_ms must not be empty".to_string(),
            ));
        }
        if self.history.batch_size == 0 {
            return Err(LiveError::Config("history.batch_size must be positive".to_string()));
        }
        Ok(())
    }
}

/// 加载配置（进程内只加载一次）
///
/// 未指定路径时依次尝试 `LIVE_CONFIG_PATH`、`config/`、`config.toml`，
/// 全部失败时使用默认配置。
pub fn load_config(path: Option<&str>) -> &'static LiveAppConfig {
    APP_CONFIG.get_or_init(|| load_config_uncached(path))
}

/// 获取已加载的应用配置
pub fn app_config() -> Option<&'static LiveAppConfig> {
    APP_CONFIG.get()
}

/// 不经过全局缓存加载配置
pub fn load_config_uncached(path: Option<&str>) -> LiveAppConfig {
    let candidates: Vec<PathBuf> = match path {
        Some(p) => vec![PathBuf::from(p)],
        None => match env::var(CONFIG_PATH_ENV) {
            Ok(p) if !p.is_empty() => vec![PathBuf::from(p)],
            _ => vec![PathBuf::from("config"), PathBuf::from("config.toml")],
        },
    };

    let mut value = load_with_fallback(&candidates);

    if let Err(e) = ConfigManager::load_environment_config(&mut value) {
        warn!("failed to load environment config: {}", e);
    }

    let parsed: std::result::Result<LiveAppConfig, _> = value.try_into();
    let mut cfg = match parsed {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("invalid configuration, falling back to defaults: {}", e);
            LiveAppConfig::default()
        }
    };

    ConfigManager::apply_env_overrides(&mut cfg);
    cfg.ensure_defaults();
    cfg
}

/// 使用备选方案加载配置
fn load_with_fallback(candidates: &[PathBuf]) -> Value {
    for path in candidates {
        match load_config_from_source(path) {
            Ok(value) => return value,
            Err(err) => {
                warn!("failed to load config from {}: {err}", path.display());
            }
        }
    }

    warn!("no configuration source succeeded, falling back to defaults");
    Value::Table(toml::Table::new())
}

/// 从源加载配置
pub fn load_config_from_source(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Err(anyhow!(
            "configuration path {} does not exist",
            path.display()
        ));
    }

    let metadata = path
        .metadata()
        .with_context(|| format!("unable to read metadata for {}", path.display()))?;

    if metadata.is_dir() {
        load_config_from_directory(path)
    } else {
        load_toml_value(path)
    }
}

/// 从目录加载配置
fn load_config_from_directory(path: &Path) -> Result<Value> {
    let base_file = path.join("base.toml");
    if !base_file.exists() {
        return Err(anyhow!(
            "missing base configuration: {}",
            base_file.display()
        ));
    }

    let mut merged = load_toml_value(&base_file)?;

    if !merged.is_table() {
        return Err(anyhow!(
            "base configuration must be a table: {}",
            base_file.display()
        ));
    }

    merge_directory(&mut merged, &path.join("shared"))?;
    merge_directory(&mut merged, &path.join("services"))?;
    merge_directory(&mut merged, &path.join("overrides"))?;

    Ok(merged)
}

/// 合并目录中的配置
fn merge_directory(root: &mut Value, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("unable to read config directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(OsStr::to_str)
                .map(|ext| ext.eq_ignore_ascii_case("toml"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    entries.sort_by_key(|entry| entry.path());

    for entry in entries {
        let value = load_toml_value(&entry.path())?;
        merge_value(root, value);
    }

    Ok(())
}

/// 加载 TOML 值
fn load_toml_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config fragment {}", path.display()))?;
    let value: Value = toml::from_str(&content)
        .with_context(|| format!("invalid TOML content in fragment {}", path.display()))?;
    Ok(value)
}

/// 合并值
pub(crate) fn merge_value(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Table(overlay_table) => {
            if let Value::Table(base_table) = base {
                for (key, overlay_value) in overlay_table.into_iter() {
                    match base_table.get_mut(&key) {
                        Some(base_value) => merge_value(base_value, overlay_value),
                        None => {
                            base_table.insert(key, overlay_value);
                        }
                    }
                }
            } else {
                *base = Value::Table(overlay_table);
            }
        }
        other => {
            *base = other;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_unusable_values() {
        assert!(LiveAppConfig::default().validate().is_ok());

        let mut cfg = LiveAppConfig::default();
        cfg.live.poll_interval_ms = 0;
        assert!(matches!(cfg.validate(), Err(LiveError::Config(msg)) if msg.contains("poll_interval_ms")));

        let mut cfg = LiveAppConfig::default();
        cfg.pipe.channel_start_delays_ms.clear();
        assert!(matches!(cfg.validate(), Err(LiveError::Config(_))));
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = LiveAppConfig::default();
        assert_eq!(cfg.server.bind_addr(), "127.0.0.1:5031");
        assert_eq!(cfg.live.fetch_limit, 10);
        assert_eq!(cfg.live.seen_capacity, 1000);
        assert_eq!(cfg.live.debounce_ms, 100);
        assert_eq!(cfg.live.poll_interval_ms, 1000);
        assert_eq!(cfg.live.wildcard_sweep_limit, 20);
        assert_eq!(cfg.live.push_confirm_timeout_ms, 2000);
        assert_eq!(cfg.pipe.channel_start_delays_ms, vec![0, 200, 500]);
        assert_eq!(cfg.pipe.max_connect_retries, 5);
        assert_eq!(cfg.pipe.restart_delay_ms, 3000);
    }

    #[test]
    fn test_directory_merge_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("base.toml"),
            "[server]\nport = 6000\n[live]\nfetch_limit = 5\n",
        )
        .unwrap();
        fs::create_dir(dir.path().join("overrides")).unwrap();
        fs::write(dir.path().join("overrides/10-port.toml"), "[server]\nport = 7000\n").unwrap();

        let value = load_config_from_source(dir.path()).unwrap();
        let cfg: LiveAppConfig = value.try_into().unwrap();
        assert_eq!(cfg.server.port, 7000);
        assert_eq!(cfg.live.fetch_limit, 5);
        assert_eq!(cfg.live.seen_capacity, 1000);
        assert_eq!(cfg.server.address, "127.0.0.1");
    }

    #[test]
    fn test_missing_base_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config_from_source(dir.path()).is_err());
    }

    #[test]
    fn test_ensure_defaults_raises_capacity() {
        let mut cfg = LiveAppConfig::default();
        cfg.live.seen_capacity = 3;
        cfg.live.fetch_limit = 10;
        cfg.ensure_defaults();
        assert_eq!(cfg.live.seen_capacity, 10);
    }
}
