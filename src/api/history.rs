//! 部署历史 API
//!
//! 包含 /history/:project, /history/:project/:sub 端点

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, HistoryRecord};

/// 历史查询参数
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// 返回数量限制，默认 20
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// 历史响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_deployment: Option<String>,
    pub records: Vec<HistoryRecord>,
    pub total: usize,
}

/// 创建历史路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/history/:project", get(project_history))
        .route("/history/:project/:sub", get(sub_deployment_history))
}

/// 项目历史
///
/// GET /history/:project?limit=
async fn project_history(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    state.engine.catalog().get(&project).await?;
    let records = state.engine.history().list(&project, None, query.limit).await;
    Ok(Json(HistoryResponse {
        total: records.len(),
        project,
        sub_deployment: None,
        records,
    }))
}

/// 子部署历史
///
/// GET /history/:project/:sub?limit=
async fn sub_deployment_history(
    State(state): State<Arc<AppState>>,
    Path((project, sub)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let config = state.engine.catalog().get(&project).await?;
    if config.sub_deployment(&sub).is_none() {
        return Err(ApiError::not_found(format!(
            "Sub-deployment '{}' of project '{}'",
            sub, project
        )));
    }
    let records = state
        .engine
        .history()
        .list(&project, Some(&sub), query.limit)
        .await;
    Ok(Json(HistoryResponse {
        total: records.len(),
        project,
        sub_deployment: Some(sub),
        records,
    }))
}
