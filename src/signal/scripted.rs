//! 脚本化推送连接器
//!
//! 基于 `tokio::io::duplex`，在没有真实访问器时驱动推送通道。
//! 只在测试或启用 `test-util` 特性时编译。

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::io::DuplexStream;

use super::connector::{PipeConnector, PipeStream};

enum Scripted {
    Refuse,
    Accept(DuplexStream),
}

/// 脚本化连接器
///
/// 按入队顺序决定每次连接的结果，脚本为空时拒绝连接。
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<VecDeque<Scripted>>,
    attempts: AtomicU32,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 接下来 n 次连接被拒绝
    pub fn refuse_next(&self, n: usize) {
        let mut script = self.lock();
        for _ in 0..n {
            script.push_back(Scripted::Refuse);
        }
    }

    /// 下一次连接成功，返回写入端
    pub fn accept_next(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.lock().push_back(Scripted::Accept(client));
        server
    }

    /// 已发生的连接次数
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Scripted>> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PipeConnector for ScriptedConnector {
    async fn connect(&self) -> io::Result<Box<dyn PipeStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.lock().pop_front() {
            Some(Scripted::Accept(stream)) => Ok(Box::new(stream)),
            Some(Scripted::Refuse) | None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted connection refused",
            )),
        }
    }

    fn endpoint(&self) -> String {
        "scripted".to_string()
    }
}
