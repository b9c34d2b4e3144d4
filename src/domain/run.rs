//! 部署运行相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 运行状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Stopped => "stopped",
        }
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// 步骤所在阶段
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Local,
    Remote,
}

impl StepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::Local => "local",
            StepPhase::Remote => "remote",
        }
    }
}

/// 单个步骤的执行结果
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step: String,
    pub phase: StepPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_deployment: Option<String>,
    pub success: bool,
    /// 失败但 `continueOnError` 允许继续
    #[serde(default)]
    pub continued: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl StepResult {
    /// 步骤是否满足成功条件（成功，或失败但允许继续）
    pub fn is_acceptable(&self) -> bool {
        self.success || self.continued
    }
}

/// 运行目标：项目 + 子部署集合
///
/// 子部署集合排序去重，空集合表示整个（非 monorepo）项目。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct RunTarget {
    pub project: String,
    #[serde(default)]
    pub sub_deployments: Vec<String>,
}

impl RunTarget {
    pub fn project(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            sub_deployments: Vec::new(),
        }
    }

    pub fn with_subs<I, S>(project: impl Into<String>, subs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sub_deployments: Vec<String> = subs.into_iter().map(Into::into).collect();
        sub_deployments.sort();
        sub_deployments.dedup();
        Self {
            project: project.into(),
            sub_deployments,
        }
    }

    /// 稳定的目标标识，如 `shop` 或 `shop[api,web]`
    pub fn key(&self) -> String {
        if self.sub_deployments.is_empty() {
            self.project.clone()
        } else {
            format!("{}[{}]", self.project, self.sub_deployments.join(","))
        }
    }

    /// 两个目标是否争用同一组资源
    ///
    /// 同一项目下，任一方为整项目运行，或子部署集合有交集，即视为冲突。
    pub fn overlaps(&self, other: &RunTarget) -> bool {
        if self.project != other.project {
            return false;
        }
        if self.sub_deployments.is_empty() || other.sub_deployments.is_empty() {
            return true;
        }
        self.sub_deployments
            .iter()
            .any(|s| other.sub_deployments.contains(s))
    }
}

impl std::fmt::Display for RunTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// 一次部署运行
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRun {
    pub id: String,
    pub target: RunTarget,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepResult>,
    pub error: Option<String>,
}

impl DeploymentRun {
    pub fn new(id: String, target: RunTarget) -> Self {
        Self {
            id,
            target,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
            error: None,
        }
    }

    /// 进入终态，之后不应再修改
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    /// 成功：状态为 success 且所有步骤可接受
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success && self.steps.iter().all(StepResult::is_acceptable)
    }
}
