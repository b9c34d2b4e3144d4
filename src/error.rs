//! 统一错误处理
//!
//! - `EngineError`: 部署引擎内部错误（配置、SSH、进程、提示、并发）
//! - `ApiError`: 实现 `IntoResponse`，由 `EngineError` 转换而来

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// 部署引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    /// 配置无效（项目、子部署、步骤）
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Project '{0}' not found")]
    ProjectNotFound(String),

    #[error("Sub-deployment '{sub}' not found in project '{project}'")]
    SubDeploymentNotFound { project: String, sub: String },

    /// monorepo 运行未选择任何子部署
    #[error("No sub-deployment selected")]
    NoTargetSelected,

    #[error("Invalid SSH config: {0}")]
    InvalidSshConfig(String),

    #[error("Invalid working directory: {0}")]
    InvalidWorkingDir(String),

    #[error("SSH authentication failed for {user}@{host}")]
    AuthenticationFailed { user: String, host: String },

    #[error("SSH connection to {host}:{port} failed: {message}")]
    ConnectionFailed {
        host: String,
        port: u16,
        message: String,
    },

    /// 进程失败：非零退出、启动失败或 SSH 通道错误
    #[error("Process failed: {0}")]
    ProcessFailed(String),

    #[error("Timed out waiting for input to prompt '{0}'")]
    PromptTimeout(String),

    #[error("Prompt '{0}' was cancelled")]
    PromptCancelled(String),

    #[error("Prompt session '{0}' not found")]
    PromptNotFound(String),

    /// 同一目标已有运行中的部署
    #[error("A deployment is already running for {target} (run {run_id})")]
    ConcurrentRunRejected { target: String, run_id: String },

    #[error("No active run for {0}")]
    RunNotFound(String),

    #[error("Deployment stopped")]
    Stopped,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// 配置类错误：在任何步骤执行前即终止运行
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            EngineError::Config(_)
                | EngineError::ProjectNotFound(_)
                | EngineError::SubDeploymentNotFound { .. }
                | EngineError::NoTargetSelected
                | EngineError::InvalidSshConfig(_)
        )
    }

    /// SSH 连接类错误：只终止当前序列的远程阶段
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            EngineError::AuthenticationFailed { .. } | EngineError::ConnectionFailed { .. }
        )
    }
}

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 统一 API 错误类型
#[derive(Debug)]
pub enum ApiError {
    /// 401 - 未授权（API Key 无效或缺失）
    Unauthorized,
    /// 404 - 资源未找到
    NotFound(String),
    /// 400 - 请求无效
    BadRequest(String),
    /// 409 - 冲突（如：部署已在进行）
    Conflict(String),
    /// 500 - 内部错误
    Internal(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match &err {
            EngineError::ConcurrentRunRejected { .. } => ApiError::Conflict(err.to_string()),
            EngineError::ProjectNotFound(project) => {
                ApiError::NotFound(format!("Project '{}'", project))
            }
            EngineError::SubDeploymentNotFound { project, sub } => ApiError::NotFound(format!(
                "Sub-deployment '{}' of project '{}'",
                sub, project
            )),
            EngineError::PromptNotFound(id) => {
                ApiError::NotFound(format!("Prompt session '{}'", id))
            }
            EngineError::RunNotFound(target) => {
                ApiError::NotFound(format!("Active run for {}", target))
            }
            e if e.is_config() => ApiError::BadRequest(err.to_string()),
            EngineError::InvalidWorkingDir(_) => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Invalid or missing API key".to_string(),
            ),
            ApiError::NotFound(resource) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("{} not found", resource),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = ErrorResponse::new(error_type, message);
        (status, Json(body)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "Unauthorized"),
            ApiError::NotFound(r) => write!(f, "Not found: {}", r),
            ApiError::BadRequest(m) => write!(f, "Bad request: {}", m),
            ApiError::Conflict(m) => write!(f, "Conflict: {}", m),
            ApiError::Internal(m) => write!(f, "Internal error: {}", m),
        }
    }
}

impl std::error::Error for ApiError {}

/// 便捷类型别名
pub type ApiResult<T> = Result<T, ApiError>;

/// 引擎结果别名
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_with_details() {
        let resp = ErrorResponse::new("test_error", "Test message").with_details("Extra info");
        assert_eq!(resp.error, "test_error");
        assert_eq!(resp.details, Some("Extra info".to_string()));
    }

    #[test]
    fn test_engine_error_classification() {
        assert!(EngineError::NoTargetSelected.is_config());
        assert!(EngineError::InvalidSshConfig("x".into()).is_config());
        assert!(!EngineError::ProcessFailed("exit 1".into()).is_config());

        let auth = EngineError::AuthenticationFailed {
            user: "deploy".into(),
            host: "example.com".into(),
        };
        assert!(auth.is_connection());
        assert!(!auth.is_config());
    }

    #[test]
    fn test_engine_error_to_api_status() {
        let conflict: ApiError = EngineError::ConcurrentRunRejected {
            target: "web".into(),
            run_id: "r1".into(),
        }
        .into();
        assert!(matches!(conflict, ApiError::Conflict(_)));

        let missing: ApiError = EngineError::ProjectNotFound("web".into()).into();
        assert!(matches!(missing, ApiError::NotFound(_)));

        let bad: ApiError = EngineError::NoTargetSelected.into();
        assert!(matches!(bad, ApiError::BadRequest(_)));

        let internal: ApiError = EngineError::ProcessFailed("boom".into()).into();
        assert!(matches!(internal, ApiError::Internal(_)));
    }
}
