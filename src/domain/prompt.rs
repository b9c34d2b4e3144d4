//! 交互提示会话

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 等待用户输入的提示会话
///
/// 由提示检测器升级时创建，输入提交或运行结束时销毁。
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PromptSession {
    pub session_id: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_deployment: Option<String>,
    pub step: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
}
