use anyhow::Result;
use chatlog_live::ApplicationBootstrap;
use chatlog_live::config::load_config;
use chatlog_live::tracing::init_tracing_from_config;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置（LIVE_CONFIG_PATH 优先，其次 config/）
    let app_config = load_config(None);

    init_tracing_from_config(Some(&app_config.logging));

    ApplicationBootstrap::run(app_config).await
}
