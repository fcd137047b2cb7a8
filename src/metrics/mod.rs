//! # Prometheus 指标收集模块
//!
//! 实时推送链路的统一指标，注册在进程级 [`REGISTRY`] 上，由网关的 `/metrics` 导出。

use once_cell::sync::Lazy;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 进程级实时推送指标
pub static LIVE_METRICS: Lazy<LiveMetrics> = Lazy::new(LiveMetrics::new);

/// 实时推送指标
pub struct LiveMetrics {
    /// 推送给订阅者的新消息数
    pub messages_published_total: IntCounter,
    /// 冷启动建立基线的会话数
    pub baselines_seeded_total: IntCounter,
    /// 增量检查次数（按触发来源）
    pub checks_total: IntCounterVec,
    /// 单次增量检查耗时（秒）
    pub check_duration_seconds: Histogram,
    /// 访问器调用失败次数（按操作）
    pub accessor_failures_total: IntCounterVec,
    /// 推送通道重连次数
    pub pipe_reconnects_total: IntCounter,
    /// 信号模式切换次数（按目标模式）
    pub mode_switches_total: IntCounterVec,
    /// 当前信号模式（取值为 1 的标签即当前模式）
    pub live_mode: IntGaugeVec,
    /// 轮询扫描次数
    pub poll_sweeps_total: IntCounter,
    /// 因上一次扫描未结束而跳过的扫描
    pub sweeps_skipped_total: IntCounter,
    /// 当前订阅连接数
    pub connections_active: IntGauge,
}

impl LiveMetrics {
    pub fn new() -> Self {
        let messages_published_total = IntCounter::new(
            "live_messages_published_total",
            "Total number of new messages published to subscribers",
        )
        .expect("Failed to create live_messages_published_total metric");

        let baselines_seeded_total = IntCounter::new(
            "live_baselines_seeded_total",
            "Total number of destinations baselined on first observation",
        )
        .expect("Failed to create live_baselines_seeded_total metric");

        let checks_total = IntCounterVec::new(
            Opts::new("live_checks_total", "Total number of incremental checks"),
            &["trigger"],
        )
        .expect("Failed to create live_checks_total metric");

        let check_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "live_check_duration_seconds",
                "Incremental check duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )
        .expect("Failed to create live_check_duration_seconds metric");

        let accessor_failures_total = IntCounterVec::new(
            Opts::new(
                "live_accessor_failures_total",
                "Total number of failed accessor calls",
            ),
            &["operation"],
        )
        .expect("Failed to create live_accessor_failures_total metric");

        let pipe_reconnects_total = IntCounter::new(
            "live_pipe_reconnects_total",
            "Total number of push channel reconnect attempts",
        )
        .expect("Failed to create live_pipe_reconnects_total metric");

        let mode_switches_total = IntCounterVec::new(
            Opts::new("live_mode_switches_total", "Total number of signal mode switches"),
            &["mode"],
        )
        .expect("Failed to create live_mode_switches_total metric");

        let live_mode = IntGaugeVec::new(
            Opts::new("live_mode", "Current signal mode"),
            &["mode"],
        )
        .expect("Failed to create live_mode metric");

        let poll_sweeps_total = IntCounter::new(
            "live_poll_sweeps_total",
            "Total number of fallback poll sweeps",
        )
        .expect("Failed to create live_poll_sweeps_total metric");

        let sweeps_skipped_total = IntCounter::new(
            "live_sweeps_skipped_total",
            "Total number of sweeps skipped while another sweep was in flight",
        )
        .expect("Failed to create live_sweeps_skipped_total metric");

        let connections_active = IntGauge::new(
            "live_connections_active",
            "Number of active subscriber connections",
        )
        .expect("Failed to create live_connections_active metric");

        // 注册指标，忽略重复注册错误（测试中可能会重复创建）
        let _ = REGISTRY.register(Box::new(messages_published_total.clone()));
        let _ = REGISTRY.register(Box::new(baselines_seeded_total.clone()));
        let _ = REGISTRY.register(Box::new(checks_total.clone()));
        let _ = REGISTRY.register(Box::new(check_duration_seconds.clone()));
        let _ = REGISTRY.register(Box::new(accessor_failures_total.clone()));
        let _ = REGISTRY.register(Box::new(pipe_reconnects_total.clone()));
        let _ = REGISTRY.register(Box::new(mode_switches_total.clone()));
        let _ = REGISTRY.register(Box::new(live_mode.clone()));
        let _ = REGISTRY.register(Box::new(poll_sweeps_total.clone()));
        let _ = REGISTRY.register(Box::new(sweeps_skipped_total.clone()));
        let _ = REGISTRY.register(Box::new(connections_active.clone()));

        Self {
            messages_published_total,
            baselines_seeded_total,
            checks_total,
            check_duration_seconds,
            accessor_failures_total,
            pipe_reconnects_total,
            mode_switches_total,
            live_mode,
            poll_sweeps_total,
            sweeps_skipped_total,
            connections_active,
        }
    }

    /// 记录模式切换
    pub fn record_mode(&self, mode: &str) {
        for label in ["starting", "push", "poll", "stopped"] {
            self.live_mode
                .with_label_values(&[label])
                .set(i64::from(label == mode));
        }
        self.mode_switches_total.with_label_values(&[mode]).inc();
    }
}

impl Default for LiveMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 获取 Prometheus 指标导出格式
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_live_metrics() {
        LIVE_METRICS.messages_published_total.inc();
        LIVE_METRICS.record_mode("poll");

        let text = gather_metrics();
        assert!(text.contains("live_messages_published_total"));
        assert!(text.contains("live_mode{mode=\"poll\"} 1"));
    }
}
