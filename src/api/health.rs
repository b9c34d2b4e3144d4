//! 健康检查和项目信息 API
//!
//! 包含 /health, /status, /projects 端点

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::config::env::constants::VERSION;
use crate::domain::project::{Project, SshConfig, Step};
use crate::domain::run::RunStatus;
use crate::error::ApiResult;
use crate::middleware::RequireApiKey;
use crate::state::{AppState, HistoryRecord};

/// 健康检查响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    timestamp: String,
    uptime_secs: i64,
    active_runs: usize,
    pending_prompts: usize,
}

/// SSH 摘要（不含密码或私钥路径）
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SshSummary {
    host: String,
    port: u16,
    username: String,
    auth_method: Option<&'static str>,
}

impl From<&SshConfig> for SshSummary {
    fn from(ssh: &SshConfig) -> Self {
        Self {
            host: ssh.host.clone(),
            port: ssh.port,
            username: ssh.username.clone(),
            auth_method: ssh.auth().ok().map(|auth| auth.method_name()),
        }
    }
}

/// 最近一次部署
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LastDeployment {
    run_id: String,
    status: RunStatus,
    timestamp: DateTime<Utc>,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<HistoryRecord> for LastDeployment {
    fn from(record: HistoryRecord) -> Self {
        Self {
            run_id: record.run_id,
            status: record.status,
            timestamp: record.timestamp,
            duration_ms: record.duration_ms,
            error: record.error,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubDeploymentSummary {
    name: String,
    relative_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ssh: Option<SshSummary>,
    local_steps: Vec<String>,
    remote_steps: Vec<String>,
    last_deployment: Option<LastDeployment>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectSummary {
    name: String,
    local_path: String,
    remote_path: String,
    monorepo: bool,
    persistent_session: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    ssh: Option<SshSummary>,
    local_steps: Vec<String>,
    remote_steps: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sub_deployments: Vec<SubDeploymentSummary>,
    running: bool,
    last_deployment: Option<LastDeployment>,
}

/// 创建健康检查和项目路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(health_check))
        .route("/projects", get(list_projects))
        .route("/projects/:name", get(get_project))
}

/// 健康检查 - 返回状态、版本、运行时间
///
/// GET /health, GET /status
/// 无需认证
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        service: "autodeploy",
        version: VERSION,
        timestamp: Utc::now().to_rfc3339(),
        uptime_secs: state.uptime_secs(),
        active_runs: state.engine.active_runs().len(),
        pending_prompts: state.engine.pending_prompts(None).len(),
    })
}

/// 列出配置的项目及最近一次部署
///
/// GET /projects
/// 需要 API Key 认证
async fn list_projects(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    let projects = state.engine.catalog().load_all().await?;
    let mut summaries = Vec::with_capacity(projects.len());
    for project in &projects {
        summaries.push(summarize(&state, project).await);
    }
    Ok(Json(serde_json::json!({
        "projects": summaries,
        "total": summaries.len(),
    })))
}

/// 单个项目
///
/// GET /projects/:name
/// 需要 API Key 认证
async fn get_project(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let project = state.engine.catalog().get(&name).await?;
    Ok(Json(summarize(&state, &project).await))
}

async fn summarize(state: &AppState, project: &Project) -> ProjectSummary {
    let history = state.engine.history();

    let mut sub_deployments = Vec::with_capacity(project.sub_deployments.len());
    for sub in &project.sub_deployments {
        sub_deployments.push(SubDeploymentSummary {
            name: sub.name.clone(),
            relative_path: sub.relative_path.clone(),
            ssh: sub.ssh.as_ref().map(SshSummary::from),
            local_steps: step_names(&sub.local_steps),
            remote_steps: step_names(&sub.remote_steps),
            last_deployment: history
                .latest(&project.name, Some(&sub.name))
                .await
                .map(LastDeployment::from),
        });
    }

    ProjectSummary {
        name: project.name.clone(),
        local_path: project.local_path.clone(),
        remote_path: project.remote_path.clone(),
        monorepo: project.is_monorepo(),
        persistent_session: project.persistent_session,
        ssh: project.ssh.as_ref().map(SshSummary::from),
        local_steps: step_names(&project.local_steps),
        remote_steps: step_names(&project.remote_steps),
        sub_deployments,
        running: state
            .engine
            .active_runs()
            .iter()
            .any(|run| run.project == project.name),
        last_deployment: history
            .latest(&project.name, None)
            .await
            .map(LastDeployment::from),
    }
}

fn step_names(steps: &[Step]) -> Vec<String> {
    steps.iter().map(|s| s.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use crate::api::tests::{json_body, request, test_state, TEST_API_KEY};
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health() {
        let (app, _dir) = test_state();
        let response = crate::api::router(app)
            .oneshot(request("GET", "/health", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["activeRuns"], 0);
    }

    #[tokio::test]
    async fn test_projects_redact_credentials() {
        let (app, _dir) = test_state();
        let response = crate::api::router(app)
            .oneshot(request("GET", "/projects", Some(TEST_API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let shop = &body["projects"][0];
        assert_eq!(shop["name"], "shop");
        assert_eq!(shop["ssh"]["authMethod"], "password");
        assert!(shop["ssh"].get("password").is_none());
        assert!(shop["lastDeployment"].is_null());
        assert!(!body.to_string().contains("s3cret"));
    }

    #[tokio::test]
    async fn test_project_requires_api_key() {
        let (app, _dir) = test_state();
        let response = crate::api::router(app)
            .oneshot(request("GET", "/projects/shop", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
