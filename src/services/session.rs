//! SSH 会话管理
//!
//! 临时模式：每个远程步骤新建连接，执行后关闭。
//! 持久模式：序列开始时建立一个连接，远程步骤共用，序列结束或停止时关闭。

use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::project::SshConfig;
use crate::error::{EngineError, EngineResult};
use crate::infra::ssh::{SshConnection, SshConnector};

/// 会话模式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionMode {
    Ephemeral,
    Persistent,
}

impl SessionMode {
    pub fn from_flag(persistent: bool) -> Self {
        if persistent {
            SessionMode::Persistent
        } else {
            SessionMode::Ephemeral
        }
    }
}

/// 单个序列的 SSH 会话管理器
pub struct SshSessionManager {
    connector: Arc<dyn SshConnector>,
    config: SshConfig,
    mode: SessionMode,
    persistent: Option<Arc<dyn SshConnection>>,
    opened: usize,
}

impl SshSessionManager {
    pub fn new(connector: Arc<dyn SshConnector>, config: SshConfig, mode: SessionMode) -> Self {
        Self {
            connector,
            config,
            mode,
            persistent: None,
            opened: 0,
        }
    }

    /// 序列开始：持久模式立即建立连接
    pub async fn start(&mut self) -> EngineResult<()> {
        if self.mode == SessionMode::Persistent && self.persistent.is_none() {
            let conn = self.open().await?;
            info!(target = %self.config.display_target(), "Persistent SSH session opened");
            self.persistent = Some(conn);
        }
        Ok(())
    }

    /// 获取执行下一个远程步骤的连接
    pub async fn acquire(&mut self) -> EngineResult<Arc<dyn SshConnection>> {
        match self.mode {
            SessionMode::Persistent => {
                if let Some(conn) = &self.persistent {
                    return Ok(conn.clone());
                }
                self.start().await?;
                self.acquire_persistent()
            }
            SessionMode::Ephemeral => self.open().await,
        }
    }

    fn acquire_persistent(&self) -> EngineResult<Arc<dyn SshConnection>> {
        self.persistent
            .clone()
            .ok_or_else(|| EngineError::ConnectionFailed {
                host: self.config.host.clone(),
                port: self.config.port,
                message: "persistent session unavailable".to_string(),
            })
    }

    /// 步骤结束：临时模式关闭连接
    pub async fn release(&mut self, conn: Arc<dyn SshConnection>) {
        if self.mode == SessionMode::Ephemeral {
            conn.close().await;
        }
    }

    /// 序列结束或停止：关闭持久连接
    pub async fn shutdown(&mut self) {
        if let Some(conn) = self.persistent.take() {
            conn.close().await;
            info!(target = %self.config.display_target(), "Persistent SSH session closed");
        }
    }

    /// 已建立的连接数
    pub fn connections_opened(&self) -> usize {
        self.opened
    }

    async fn open(&mut self) -> EngineResult<Arc<dyn SshConnection>> {
        let conn = self.connector.connect(&self.config).await?;
        self.opened += 1;
        debug!(
            target = %self.config.display_target(),
            mode = ?self.mode,
            opened = self.opened,
            "SSH connection opened"
        );
        Ok(conn)
    }
}
