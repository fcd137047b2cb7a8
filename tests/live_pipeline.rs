//! 实时推送链路端到端场景
//!
//! 内存访问器 + 脚本化推送连接器，使用缩短后的计时参数在真实时间上运行。

use std::time::Duration;

use chatlog_live::config::LiveAppConfig;
use chatlog_live::gateway::{ClientCommand, ConnectionSession, ServerEvent};
use chatlog_live::live::NewMessageEvent;
use chatlog_live::signal::{LiveMode, ScriptedConnector};
use chatlog_live::{LiveError, LivePipeline, MemoryAccessor};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> LiveAppConfig {
    let mut config = LiveAppConfig::default();
    config.accessor.self_id = "wxid_me".to_string();
    config.live.debounce_ms = 20;
    config.live.poll_interval_ms = 50;
    config.live.push_confirm_timeout_ms = 150;
    config.pipe.channel_start_delays_ms = vec![0, 5, 10];
    config.pipe.first_connect_delay_ms = 5;
    config.pipe.connect_step_ms = 5;
    config.pipe.connect_delay_cap_ms = 20;
    config.pipe.restart_delay_ms = 400;
    config
}

async fn connect_subscriber(
    pipeline: &LivePipeline,
    id: &str,
) -> (ConnectionSession, mpsc::Receiver<NewMessageEvent>) {
    let state = pipeline.state().clone();
    let events = state.registry.register(id).await;
    (ConnectionSession::new(id, state), events)
}

async fn wait_mode(pipeline: &LivePipeline, mode: LiveMode) {
    let mut rx = pipeline.watch_mode();
    timeout(WAIT, rx.wait_for(|current| *current == mode))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", mode))
        .unwrap();
}

async fn notify(writer: &mut DuplexStream, destination: &str) {
    let line = format!("{{\"action\":\"change\",\"talker\":\"{}\"}}\n", destination);
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.flush().await.unwrap();
}

async fn next_event(events: &mut mpsc::Receiver<NewMessageEvent>) -> NewMessageEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for new_message")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_failed_push_falls_back_to_poll_and_recovers() {
    let _ = tracing_subscriber::fmt::try_init();

    let memory = MemoryAccessor::new();
    memory.push_text("wxid_a", "wxid_a", "before subscribe", 100);

    let connector = ScriptedConnector::new();
    connector.refuse_next(6);
    let mut writer = connector.accept_next();

    let pipeline =
        LivePipeline::start(Box::new(memory.clone()), connector.clone(), &fast_config()).unwrap();
    let (session, mut events) = connect_subscriber(&pipeline, "c1").await;

    let replies = session.handle_command(ClientCommand::SubscribeAll).await;
    assert_eq!(replies, vec![ServerEvent::Subscribed { destinations: vec!["*".into()] }]);

    // 6 次连接失败后切到轮询
    wait_mode(&pipeline, LiveMode::Poll).await;
    assert!(connector.attempts() >= 6);

    memory.push_text("wxid_a", "wxid_a", "via poll", 101);
    let event = next_event(&mut events).await;
    assert_eq!(event.destination, "wxid_a");
    assert_eq!(event.message.summary, "via poll");

    // 重启轮次连接成功，轮询停止
    wait_mode(&pipeline, LiveMode::Push).await;
    assert_eq!(connector.attempts(), 7);

    memory.push_text("wxid_a", "wxid_a", "via push", 102);
    notify(&mut writer, "wxid_a").await;
    let event = next_event(&mut events).await;
    assert_eq!(event.message.summary, "via push");

    // 没有重复投递
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());

    pipeline.stop().await;
    assert_eq!(pipeline.mode(), LiveMode::Stopped);
    assert!(!memory.channel_open());
}

#[tokio::test]
async fn test_dropped_push_connection_falls_back_to_poll() {
    let memory = MemoryAccessor::new();
    memory.push_text("wxid_a", "wxid_a", "before drop", 100);

    let connector = ScriptedConnector::new();
    let writer = connector.accept_next();

    // 重连间隔远大于确认超时
    let mut config = fast_config();
    config.pipe.connect_step_ms = 2_000;
    config.pipe.connect_delay_cap_ms = 5_000;

    let pipeline =
        LivePipeline::start(Box::new(memory.clone()), connector.clone(), &config).unwrap();
    wait_mode(&pipeline, LiveMode::Push).await;

    let (session, mut events) = connect_subscriber(&pipeline, "c1").await;
    session
        .handle_command(ClientCommand::Subscribe { destinations: vec!["wxid_a".into()] })
        .await;

    drop(writer);
    wait_mode(&pipeline, LiveMode::Poll).await;
    assert_eq!(connector.attempts(), 1);

    memory.push_text("wxid_a", "wxid_a", "after drop", 101);
    let event = next_event(&mut events).await;
    assert_eq!(event.message.summary, "after drop");

    pipeline.stop().await;
}

#[tokio::test]
async fn test_channel_start_failures_fall_back_to_poll_and_recover() {
    let memory = MemoryAccessor::new();
    memory.push_text("wxid_a", "wxid_a", "backlog", 100);
    memory.fail_channel_opens(6);

    let connector = ScriptedConnector::new();
    let mut writer = connector.accept_next();

    // 只有推送通道上报不可用才会切到轮询
    let mut config = fast_config();
    config.live.push_confirm_timeout_ms = 60_000;

    let pipeline =
        LivePipeline::start(Box::new(memory.clone()), connector.clone(), &config).unwrap();
    let (session, mut events) = connect_subscriber(&pipeline, "c1").await;
    session.handle_command(ClientCommand::SubscribeAll).await;

    // 首轮 3 次失败不切换，等待 400 ms 后的重启轮次
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(memory.channel_open_calls(), 3);
    assert_eq!(pipeline.mode(), LiveMode::Starting);

    wait_mode(&pipeline, LiveMode::Poll).await;
    assert_eq!(memory.channel_open_calls(), 6);
    assert_eq!(connector.attempts(), 0);

    memory.push_text("wxid_a", "wxid_a", "via poll", 101);
    assert_eq!(next_event(&mut events).await.message.summary, "via poll");

    // 下一轮通道创建成功，推送恢复
    wait_mode(&pipeline, LiveMode::Push).await;
    assert_eq!(memory.channel_open_calls(), 7);

    memory.push_text("wxid_a", "wxid_a", "via push", 102);
    notify(&mut writer, "wxid_a").await;
    assert_eq!(next_event(&mut events).await.message.summary, "via push");

    pipeline.stop().await;
    assert!(!memory.channel_open());
}

#[tokio::test]
async fn test_unusable_config_is_rejected() {
    let mut config = fast_config();
    config.live.poll_interval_ms = 0;

    let result =
        LivePipeline::start(Box::new(MemoryAccessor::new()), ScriptedConnector::new(), &config);
    assert!(matches!(result, Err(LiveError::Config(_))));
}

#[tokio::test]
async fn test_back_to_back_directed_signals_stay_separate() {
    let memory = MemoryAccessor::new();
    memory.push_text("wxid_a", "wxid_a", "a0", 100);
    memory.push_text("wxid_b", "wxid_b", "b0", 100);

    let connector = ScriptedConnector::new();
    let mut writer = connector.accept_next();

    let pipeline =
        LivePipeline::start(Box::new(memory.clone()), connector.clone(), &fast_config()).unwrap();
    wait_mode(&pipeline, LiveMode::Push).await;

    let (session, mut events) = connect_subscriber(&pipeline, "c1").await;
    session
        .handle_command(ClientCommand::Subscribe {
            destinations: vec!["wxid_a".into(), "wxid_b".into()],
        })
        .await;

    memory.push_text("wxid_a", "wxid_a", "a1", 101);
    memory.push_text("wxid_a", "wxid_a", "a2", 102);
    memory.push_text("wxid_b", "wxid_b", "b1", 101);

    notify(&mut writer, "wxid_a").await;
    notify(&mut writer, "wxid_b").await;

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = next_event(&mut events).await;
        received.push((event.destination, event.message.summary));
    }

    let from_a: Vec<&str> = received
        .iter()
        .filter(|(d, _)| d == "wxid_a")
        .map(|(_, s)| s.as_str())
        .collect();
    let from_b: Vec<&str> = received
        .iter()
        .filter(|(d, _)| d == "wxid_b")
        .map(|(_, s)| s.as_str())
        .collect();
    assert_eq!(from_a, vec!["a1", "a2"]);
    assert_eq!(from_b, vec!["b1"]);

    // 重复通知不会重复投递
    notify(&mut writer, "wxid_a").await;
    notify(&mut writer, "wxid_b").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());

    pipeline.stop().await;
}

#[tokio::test]
async fn test_first_observation_never_publishes() {
    let memory = MemoryAccessor::new();
    for i in 0..5 {
        memory.push_text("wxid_a", "wxid_a", &format!("old {}", i), 100 + i);
    }

    let connector = ScriptedConnector::new();
    let mut writer = connector.accept_next();
    let pipeline =
        LivePipeline::start(Box::new(memory.clone()), connector.clone(), &fast_config()).unwrap();
    wait_mode(&pipeline, LiveMode::Push).await;

    // 订阅前已存在的消息全部作为基线
    let (session, mut events) = connect_subscriber(&pipeline, "c1").await;
    session
        .handle_command(ClientCommand::Subscribe { destinations: vec!["wxid_a".into()] })
        .await;

    notify(&mut writer, "wxid_a").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(pipeline.state().broadcaster.seen_len("wxid_a").await, Some(5));

    memory.push_text("wxid_a", "wxid_a", "fresh", 200);
    notify(&mut writer, "wxid_a").await;
    assert_eq!(next_event(&mut events).await.message.summary, "fresh");

    pipeline.stop().await;
}

#[tokio::test]
async fn test_undirected_notifications_sweep_subscribed_destinations() {
    let memory = MemoryAccessor::new();
    memory.ensure_destination("wxid_a");
    memory.ensure_destination("wxid_b");

    let connector = ScriptedConnector::new();
    let mut writer = connector.accept_next();
    let pipeline =
        LivePipeline::start(Box::new(memory.clone()), connector.clone(), &fast_config()).unwrap();
    wait_mode(&pipeline, LiveMode::Push).await;

    let (session, mut events) = connect_subscriber(&pipeline, "c1").await;
    session
        .handle_command(ClientCommand::Subscribe { destinations: vec!["wxid_b".into()] })
        .await;

    memory.push_text("wxid_a", "wxid_a", "not subscribed", 10);
    memory.push_text("wxid_b", "wxid_b", "subscribed", 10);

    for _ in 0..3 {
        writer.write_all(b"{\"action\":\"change\"}\n").await.unwrap();
    }
    writer.flush().await.unwrap();

    let event = next_event(&mut events).await;
    assert_eq!(event.destination, "wxid_b");
    assert_eq!(event.message.summary, "subscribed");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(events.try_recv().is_err());

    pipeline.stop().await;
}
