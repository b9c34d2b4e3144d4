//! 部署管理 API
//!
//! 包含 /deploy/*, /runs/* 端点

use axum::{
    extract::{Path, RawQuery, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::env::constants::SSE_KEEPALIVE_SECS;
use crate::domain::event::DeployEvent;
use crate::error::ApiResult;
use crate::middleware::RequireApiKey;
use crate::services::deploy::Selection;
use crate::state::AppState;

/// 提交提示输入请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub session_id: String,
    pub input: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputResponse {
    pub ok: bool,
    pub session_id: String,
    pub run_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub stopped: Vec<String>,
}

/// 目标查询参数：`sub` 可重复或逗号分隔，`all=true` 选择所有子部署
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TargetQuery {
    pub subs: Vec<String>,
    pub all: bool,
}

impl TargetQuery {
    pub fn parse(query: Option<&str>) -> Self {
        let mut parsed = TargetQuery::default();
        let Some(query) = query else {
            return parsed;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "sub" | "subDeployment" => parsed.subs.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from),
                ),
                "all" => parsed.all = matches!(value.as_ref(), "true" | "1"),
                _ => {}
            }
        }
        parsed
    }

    pub fn selection(self) -> Selection {
        Selection::from_request(self.subs, self.all)
    }
}

/// 创建部署管理路由
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/deploy/input", post(submit_input))
        .route("/deploy/:project", get(start_deploy).post(start_deploy))
        .route("/deploy/:project/stop", post(stop_deploy))
        .route("/runs/active", get(list_active_runs))
        .route("/runs/:run_id", get(get_run))
        .route("/runs/:run_id/stop", post(stop_run))
        .route("/runs/:run_id/events", get(stream_run_events))
}

/// 启动部署并以 SSE 返回事件流
///
/// GET|POST /deploy/:project?sub=<name>&all=true
/// 需要 API Key
///
/// 客户端断开不会停止运行，运行结束后写入历史
async fn start_deploy(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    RawQuery(query): RawQuery,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let selection = TargetQuery::parse(query.as_deref()).selection();
    let handle = state.engine.start(&project, selection).await?;

    info!(run_id = %handle.run_id, target = %handle.target, "Streaming deployment events");

    Ok(sse(event_stream(handle.run_id, handle.events)))
}

/// 提交提示输入
///
/// POST /deploy/input
/// 需要 API Key
async fn submit_input(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Json(request): Json<InputRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = state
        .engine
        .submit_input(&request.session_id, &request.input)?;

    Ok(Json(InputResponse {
        ok: true,
        session_id: session.session_id,
        run_id: session.run_id,
    }))
}

/// 停止项目的运行
///
/// POST /deploy/:project/stop?sub=<name>
/// 需要 API Key
async fn stop_deploy(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
    RawQuery(query): RawQuery,
) -> ApiResult<impl IntoResponse> {
    let target = TargetQuery::parse(query.as_deref());
    let stopped = state.engine.stop(&project, &target.subs)?;

    info!(project = %project, runs = ?stopped, "Stop requested");

    Ok(Json(StopResponse { stopped }))
}

/// 按运行 ID 停止
///
/// POST /runs/:run_id/stop
/// 需要 API Key
async fn stop_run(
    _auth: RequireApiKey,
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.engine.stop_run(&run_id)?;

    info!(run_id = %run_id, "Stop requested");

    Ok(Json(StopResponse {
        stopped: vec![run_id],
    }))
}

/// 运行中的部署
///
/// GET /runs/active
async fn list_active_runs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let runs = state.engine.active_runs();
    Json(serde_json::json!({
        "runs": runs,
        "total": runs.len(),
        "pendingPrompts": state.engine.pending_prompts(None),
    }))
}

/// 单个运行中的部署及其等待中的提示
///
/// GET /runs/:run_id
async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run = state.engine.active_run(&run_id)?;
    Ok(Json(serde_json::json!({
        "run": run,
        "pendingPrompts": state.engine.pending_prompts(Some(&run_id)),
    })))
}

/// 附加到运行中的事件流（只接收之后的事件）
///
/// GET /runs/:run_id/events
async fn stream_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let rx = state.engine.subscribe(&run_id).await?;
    Ok(sse(event_stream(run_id, rx)))
}

fn sse<S>(stream: S) -> Sse<S>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
            .text("keepalive"),
    )
}

/// 事件帧：每帧一个 JSON 事件，终止事件之后关闭
fn event_stream(
    run_id: String,
    mut rx: broadcast::Receiver<DeployEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    match serde_json::to_string(&event) {
                        Ok(json) => yield Ok(Event::default().id(event.seq.to_string()).data(json)),
                        Err(e) => warn!(run_id = %run_id, error = %e, "Failed to serialize event"),
                    }
                    if terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(run_id = %run_id, lagged = n, "Event subscriber lagged");
                    yield Ok(lag_frame(&run_id, n));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

/// 订阅者落后时告知被丢弃的事件数，不占用序号
fn lag_frame(run_id: &str, dropped: u64) -> Event {
    let frame = serde_json::json!({
        "type": "progress",
        "runId": run_id,
        "message": format!("{} events dropped", dropped),
        "dropped": dropped,
    });
    Event::default().data(frame.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::{json_body, request, test_state, text_body, TEST_API_KEY};
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[test]
    fn test_target_query_parse() {
        assert_eq!(TargetQuery::parse(None), TargetQuery::default());
        assert_eq!(
            TargetQuery::parse(Some("sub=web&sub=api,cron&api_key=x")),
            TargetQuery {
                subs: vec!["web".into(), "api".into(), "cron".into()],
                all: false
            }
        );
        assert!(TargetQuery::parse(Some("all=true")).all);
        assert!(!TargetQuery::parse(Some("all=no")).all);
        assert_eq!(
            TargetQuery::parse(Some("all=1&sub=web")).selection(),
            Selection::All
        );
    }

    #[tokio::test]
    async fn test_deploy_requires_api_key() {
        let (app, _dir) = test_state();
        let response = crate::api::router(app)
            .oneshot(request("POST", "/deploy/shop", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_deploy_streams_until_complete() {
        let (app, _dir) = test_state();
        let response = crate::api::router(app.clone())
            .oneshot(request(
                "GET",
                &format!("/deploy/shop?api_key={}", TEST_API_KEY),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = text_body(response).await;
        let frames: Vec<serde_json::Value> = body
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect();
        assert_eq!(frames.first().unwrap()["type"], "start");
        assert_eq!(frames.last().unwrap()["type"], "complete");
        assert_eq!(frames.last().unwrap()["status"], "success");
        assert!(frames.iter().any(|f| f["data"] == "hello\n"));

        let history = app.engine.history().list("shop", None, 10).await;
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_project_is_not_found() {
        let (app, _dir) = test_state();
        let response = crate::api::router(app)
            .oneshot(request("POST", "/deploy/missing", Some(TEST_API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "not_found");
    }

    #[tokio::test]
    async fn test_stop_without_active_run() {
        let (app, _dir) = test_state();
        let response = crate::api::router(app)
            .oneshot(request("POST", "/deploy/shop/stop", Some(TEST_API_KEY)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_unknown_session() {
        let (app, _dir) = test_state();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/deploy/input")
            .header("x-api-key", TEST_API_KEY)
            .header("content-type", "application/json")
            .body(axum::body::Body::from(
                r#"{"sessionId":"nope","input":"y"}"#,
            ))
            .unwrap();
        let response = crate::api::router(app).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn data_frames(body: &str) -> Vec<serde_json::Value> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|data| serde_json::from_str(data).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_lagged_subscriber_gets_dropped_count() {
        let (tx, rx) = broadcast::channel(1);
        for seq in 1..=3 {
            tx.send(DeployEvent {
                seq,
                run_id: "run-1".into(),
                sub_deployment: None,
                timestamp: chrono::Utc::now(),
                payload: crate::domain::event::EventPayload::progress(format!("event {}", seq)),
            })
            .unwrap();
        }
        drop(tx);

        let response = sse(event_stream("run-1".into(), rx)).into_response();
        let frames = data_frames(&text_body(response).await);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], "progress");
        assert_eq!(frames[0]["message"], "2 events dropped");
        assert_eq!(frames[0]["dropped"], 2);
        assert_eq!(frames[1]["seq"], 3);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let (app, _dir) = test_state();
        let response = crate::api::router(app)
            .oneshot(request("GET", "/runs/nope", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_active_runs_empty() {
        let (app, _dir) = test_state();
        let response = crate::api::router(app)
            .oneshot(request("GET", "/runs/active", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["total"], 0);
    }
}
