//! 部署事件（推送给客户端的流帧）

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::run::{RunStatus, StepPhase};

/// 输出流类型
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Stdout,
    Stderr,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputType::Stdout => "stdout",
            OutputType::Stderr => "stderr",
        }
    }
}

/// 事件负载，`type` 字段区分种类
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventPayload {
    Start {
        message: String,
        project: String,
        #[serde(rename = "subDeployments")]
        sub_deployments: Vec<String>,
    },
    Progress {
        message: String,
    },
    Step {
        message: String,
        step: String,
        phase: StepPhase,
    },
    StepComplete {
        step: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    StepError {
        step: String,
        message: String,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    Output {
        data: String,
        #[serde(rename = "outputType")]
        output_type: OutputType,
    },
    Prompt {
        #[serde(rename = "sessionId")]
        session_id: String,
        step: String,
        prompt: String,
    },
    Error {
        message: String,
    },
    Complete {
        message: String,
        status: RunStatus,
        stopped: bool,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Start { .. } => "start",
            EventPayload::Progress { .. } => "progress",
            EventPayload::Step { .. } => "step",
            EventPayload::StepComplete { .. } => "step-complete",
            EventPayload::StepError { .. } => "step-error",
            EventPayload::Output { .. } => "output",
            EventPayload::Prompt { .. } => "prompt",
            EventPayload::Error { .. } => "error",
            EventPayload::Complete { .. } => "complete",
        }
    }

    /// 终止事件：`complete` 或运行级 `error`
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventPayload::Complete { .. } | EventPayload::Error { .. })
    }

    pub fn progress(message: impl Into<String>) -> Self {
        EventPayload::Progress {
            message: message.into(),
        }
    }
}

/// 带序号的事件帧
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployEvent {
    /// 每个运行内单调递增
    pub seq: u64,
    pub run_id: String,
    /// 来源子部署（fan-out 时区分交错事件）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_deployment: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl DeployEvent {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}
