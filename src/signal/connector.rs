//! 推送通道连接器
//!
//! Unix 上连接访问器创建的 Unix socket，Windows 上连接命名管道。

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

/// 可读的通知流
pub trait PipeStream: AsyncRead + Unpin + Send {}

impl<T: AsyncRead + Unpin + Send> PipeStream for T {}

/// 推送通道连接器
#[async_trait]
pub trait PipeConnector: Send + Sync + 'static {
    async fn connect(&self) -> io::Result<Box<dyn PipeStream>>;

    /// 日志里展示的端点
    fn endpoint(&self) -> String;
}

/// Unix socket 连接器
#[cfg(unix)]
pub struct UnixSocketConnector {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixSocketConnector {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
#[async_trait]
impl PipeConnector for UnixSocketConnector {
    async fn connect(&self) -> io::Result<Box<dyn PipeStream>> {
        let stream = tokio::net::UnixStream::connect(&self.path).await?;
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        self.path.display().to_string()
    }
}

/// 命名管道连接器
#[cfg(windows)]
pub struct NamedPipeConnector {
    name: String,
}

#[cfg(windows)]
impl NamedPipeConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[cfg(windows)]
#[async_trait]
impl PipeConnector for NamedPipeConnector {
    async fn connect(&self) -> io::Result<Box<dyn PipeStream>> {
        let client = tokio::net::windows::named_pipe::ClientOptions::new().open(&self.name)?;
        Ok(Box::new(client))
    }

    fn endpoint(&self) -> String {
        self.name.clone()
    }
}

/// 按平台选择连接器
pub fn default_connector(path: &str) -> Arc<dyn PipeConnector> {
    #[cfg(unix)]
    {
        Arc::new(UnixSocketConnector::new(path))
    }
    #[cfg(windows)]
    {
        Arc::new(NamedPipeConnector::new(path))
    }
}

/// 未配置推送端点时使用，每次连接都失败，监督器随之切到轮询
pub struct DisabledConnector;

#[async_trait]
impl PipeConnector for DisabledConnector {
    async fn connect(&self) -> io::Result<Box<dyn PipeStream>> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "push channel endpoint not configured",
        ))
    }

    fn endpoint(&self) -> String {
        "<disabled>".to_string()
    }
}
