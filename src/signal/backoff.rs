//! 推送通道重试退避策略

use std::time::Duration;

use crate::config::PipeConfig;

/// 推送通道退避策略
#[derive(Debug, Clone)]
pub struct PipeBackoff {
    /// 创建通道的各次尝试前等待（毫秒），长度即最大尝试次数
    pub channel_start_delays_ms: Vec<u64>,
    /// 首次连接前的等待（毫秒）
    pub first_connect_delay_ms: u64,
    /// 之后每次连接的等待步长（毫秒）
    pub connect_step_ms: u64,
    /// 连接等待上限（毫秒）
    pub connect_delay_cap_ms: u64,
    /// 首次连接之外的最大重连次数
    pub max_connect_retries: u32,
    /// 整体重启间隔（毫秒）
    pub restart_delay_ms: u64,
}

impl Default for PipeBackoff {
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

impl PipeBackoff {
    /// 从配置创建退避策略
    pub fn from_config(config: &PipeConfig) -> Self {
        Self {
            channel_start_delays_ms: config.channel_start_delays_ms.clone(),
            first_connect_delay_ms: config.first_connect_delay_ms,
            connect_step_ms: config.connect_step_ms,
            connect_delay_cap_ms: config.connect_delay_cap_ms,
            max_connect_retries: config.max_connect_retries,
            restart_delay_ms: config.restart_delay_ms,
        }
    }

    /// 创建通道的尝试序列
    pub fn channel_start_delays(&self) -> impl Iterator<Item = Duration> + '_ {
        self.channel_start_delays_ms.iter().map(|ms| Duration::from_millis(*ms))
    }

    /// 第 `attempt` 次连接（从 0 开始）前的等待
    pub fn connect_delay(&self, attempt: u32) -> Duration {
        let delay_ms = if attempt == 0 {
            self.first_connect_delay_ms
        } else {
            self.connect_step_ms
                .saturating_mul(u64::from(attempt))
                .min(self.connect_delay_cap_ms)
        };
        Duration::from_millis(delay_ms)
    }

    /// 连续失败 `failures` 次后是否已耗尽重试
    pub fn connect_exhausted(&self, failures: u32) -> bool {
        failures > self.max_connect_retries
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}
