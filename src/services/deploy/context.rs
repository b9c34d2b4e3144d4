//! 部署上下文
//!
//! 一次运行内所有序列共享的执行上下文：事件发送、取消令牌、提示登记、SSH 连接器

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::EngineSettings;
use crate::domain::event::EventPayload;
use crate::infra::ssh::SshConnector;
use crate::services::prompt::PromptBroker;
use crate::state::event_hub::RunEmitter;

/// 运行上下文
#[derive(Clone)]
pub struct RunContext {
    /// 运行 ID
    pub run_id: String,
    /// 事件发送端
    pub emitter: RunEmitter,
    /// 取消令牌（停止或超时）
    pub cancel_token: CancellationToken,
    pub prompts: PromptBroker,
    pub connector: Arc<dyn SshConnector>,
    pub settings: Arc<EngineSettings>,
}

impl RunContext {
    /// 发送事件
    pub fn emit(&self, sub_deployment: Option<&str>, payload: EventPayload) {
        self.emitter.emit(sub_deployment, payload);
    }

    /// 发送进度消息
    pub fn progress(&self, sub_deployment: Option<&str>, message: impl Into<String>) {
        self.emit(sub_deployment, EventPayload::progress(message));
    }

    /// 检查是否被取消
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}
