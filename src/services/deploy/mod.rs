//! 部署服务模块
//!
//! 部署引擎入口：解析运行目标、登记运行锁、启动工作任务，
//! 汇总各序列结果后写入历史并发出终止事件。

pub mod context;
pub mod fanout;
pub mod sequencer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{EngineSettings, ProjectCatalog};
use crate::domain::event::{DeployEvent, EventPayload};
use crate::domain::prompt::PromptSession;
use crate::domain::run::{DeploymentRun, RunStatus, RunTarget};
use crate::error::{EngineError, EngineResult};
use crate::infra::ssh::SshConnector;
use crate::services::prompt::PromptBroker;
use crate::state::event_hub::EventHub;
use crate::state::history::{HistoryRecord, HistoryStore};
use crate::state::run_registry::{ActiveRun, RunGuard, RunRegistry};

pub use context::RunContext;
pub use fanout::Selection;
pub use sequencer::{SequenceOutcome, SequencePlan};

/// 已启动的运行
pub struct RunHandle {
    pub run_id: String,
    pub target: RunTarget,
    /// 从 `start` 事件开始的完整事件流
    pub events: broadcast::Receiver<DeployEvent>,
}

/// 部署引擎
pub struct DeployEngine {
    catalog: Arc<ProjectCatalog>,
    settings: Arc<EngineSettings>,
    connector: Arc<dyn SshConnector>,
    registry: RunRegistry,
    events: EventHub,
    prompts: PromptBroker,
    history: Arc<HistoryStore>,
}

impl DeployEngine {
    pub fn new(
        catalog: Arc<ProjectCatalog>,
        settings: EngineSettings,
        connector: Arc<dyn SshConnector>,
        history: Arc<HistoryStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            settings: Arc::new(settings),
            connector,
            registry: RunRegistry::new(),
            events: EventHub::new(),
            prompts: PromptBroker::new(),
            history,
        })
    }

    pub fn catalog(&self) -> &ProjectCatalog {
        &self.catalog
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// 启动运行
    ///
    /// 配置错误与目标冲突在这里直接返回，不产生任何事件。
    pub async fn start(
        self: &Arc<Self>,
        project: &str,
        selection: Selection,
    ) -> EngineResult<RunHandle> {
        let project = self.catalog.get(project).await?;
        let (target, plans) = fanout::build_plans(&project, &selection)?;

        let run_id = Uuid::new_v4().to_string();
        let cancel_token = CancellationToken::new();
        let guard = self
            .registry
            .register(&run_id, target.clone(), cancel_token.clone())?;

        let emitter = self.events.create(&run_id).await;
        let events = emitter
            .subscribe()
            .ok_or_else(|| EngineError::RunNotFound(run_id.clone()))?;

        info!(
            run_id = %run_id,
            target = %target,
            sequences = plans.len(),
            steps = plans.iter().map(SequencePlan::step_count).sum::<usize>(),
            "Deployment started"
        );

        let ctx = RunContext {
            run_id: run_id.clone(),
            emitter,
            cancel_token,
            prompts: self.prompts.clone(),
            connector: self.connector.clone(),
            settings: self.settings.clone(),
        };
        let run = DeploymentRun::new(run_id.clone(), target.clone());
        tokio::spawn(self.clone().execute(run, plans, ctx, guard));

        Ok(RunHandle {
            run_id,
            target,
            events,
        })
    }

    /// 停止项目（或其部分子部署）的运行，返回被停止的运行 ID
    pub fn stop(&self, project: &str, subs: &[String]) -> EngineResult<Vec<String>> {
        let stopped = self.registry.cancel_project(project, subs);
        if stopped.is_empty() {
            return Err(EngineError::RunNotFound(
                RunTarget::with_subs(project, subs.iter().cloned()).key(),
            ));
        }
        for run_id in &stopped {
            self.prompts.cancel_run(run_id);
        }
        Ok(stopped)
    }

    pub fn stop_run(&self, run_id: &str) -> EngineResult<()> {
        if !self.registry.cancel_run(run_id) {
            return Err(EngineError::RunNotFound(run_id.to_string()));
        }
        self.prompts.cancel_run(run_id);
        Ok(())
    }

    /// 停止所有运行（关闭服务时）
    pub fn stop_all(&self) -> usize {
        let runs = self.registry.list();
        self.registry.cancel_all();
        for run in &runs {
            self.prompts.cancel_run(&run.run_id);
        }
        runs.len()
    }

    /// 等待所有运行结束
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.registry.count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// 提交提示输入
    pub fn submit_input(&self, session_id: &str, input: &str) -> EngineResult<PromptSession> {
        self.prompts.submit(session_id, input)
    }

    pub fn pending_prompts(&self, run_id: Option<&str>) -> Vec<PromptSession> {
        self.prompts.pending(run_id)
    }

    /// 订阅运行中的事件流（只包含订阅之后的事件）
    pub async fn subscribe(&self, run_id: &str) -> EngineResult<broadcast::Receiver<DeployEvent>> {
        self.events
            .subscribe(run_id)
            .await
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    pub fn active_runs(&self) -> Vec<ActiveRun> {
        self.registry.list()
    }

    pub fn active_run(&self, run_id: &str) -> EngineResult<ActiveRun> {
        self.registry
            .get(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    /// 运行工作任务
    async fn execute(
        self: Arc<Self>,
        mut run: DeploymentRun,
        plans: Vec<SequencePlan>,
        ctx: RunContext,
        guard: RunGuard,
    ) {
        ctx.emit(
            None,
            EventPayload::Start {
                message: format!("Starting deployment of {}", run.target),
                project: run.target.project.clone(),
                sub_deployments: run.target.sub_deployments.clone(),
            },
        );

        let timed_out = Arc::new(AtomicBool::new(false));
        let timeout_task = spawn_timeout(
            run.id.clone(),
            ctx.cancel_token.clone(),
            self.settings.run_timeout,
            timed_out.clone(),
        );

        let outcomes = fanout::run_fanout(&ctx, &plans, self.settings.fanout).await;
        timeout_task.abort();

        for outcome in &outcomes {
            run.steps.extend(outcome.steps.iter().cloned());
        }
        let (status, error) = summarize(
            &outcomes,
            ctx.is_cancelled(),
            timed_out.load(Ordering::SeqCst).then_some(self.settings.run_timeout),
        );
        run.finish(status, error);
        self.prompts.cancel_run(&run.id);

        // 子部署失败单独报告，不影响其它子部署
        for outcome in &outcomes {
            let sub = outcome.sub_deployment.as_deref();
            if let (Some(sub), RunStatus::Error) = (sub, outcome.status) {
                ctx.progress(
                    Some(sub),
                    format!(
                        "Sub-deployment '{}' failed: {}",
                        sub,
                        outcome.error.as_deref().unwrap_or("unknown error")
                    ),
                );
            }
        }

        self.record_history(&run, &outcomes).await;

        info!(
            run_id = %run.id,
            target = %run.target,
            status = run.status.as_str(),
            duration_ms = run.duration_ms(),
            steps = run.steps.len(),
            "Deployment finished"
        );

        // 先释放运行锁，客户端收到终止事件后即可重新部署
        drop(guard);
        ctx.emit(None, terminal_event(&run));
        self.events.remove(&run.id).await;
    }

    /// 写入历史：项目集合一条，monorepo 每个子部署集合各一条
    async fn record_history(&self, run: &DeploymentRun, outcomes: &[SequenceOutcome]) {
        if let Err(e) = self.history.append(HistoryRecord::for_run(run)).await {
            error!(run_id = %run.id, error = %e, "Failed to write deployment history");
        }
        for outcome in outcomes {
            let Some(sub) = outcome.sub_deployment.as_deref() else {
                continue;
            };
            let record =
                HistoryRecord::for_sub_deployment(run, sub, outcome.status, outcome.error.clone());
            if let Err(e) = self.history.append(record).await {
                error!(
                    run_id = %run.id,
                    sub_deployment = sub,
                    error = %e,
                    "Failed to write sub-deployment history"
                );
            }
        }
    }
}

/// 汇总各序列结果为运行状态
fn summarize(
    outcomes: &[SequenceOutcome],
    cancelled: bool,
    timed_out: Option<Duration>,
) -> (RunStatus, Option<String>) {
    if let Some(timeout) = timed_out {
        return (
            RunStatus::Error,
            Some(format!("Deployment timed out after {}s", timeout.as_secs())),
        );
    }

    let errors: Vec<String> = outcomes
        .iter()
        .filter(|o| o.status == RunStatus::Error)
        .map(|o| {
            let message = o.error.as_deref().unwrap_or("unknown error");
            match &o.sub_deployment {
                Some(sub) => format!("{}: {}", sub, message),
                None => message.to_string(),
            }
        })
        .collect();

    if cancelled || outcomes.iter().any(|o| o.status == RunStatus::Stopped) {
        (RunStatus::Stopped, None)
    } else if !errors.is_empty() {
        (RunStatus::Error, Some(errors.join("; ")))
    } else {
        (RunStatus::Success, None)
    }
}

fn terminal_event(run: &DeploymentRun) -> EventPayload {
    match run.status {
        RunStatus::Success => EventPayload::Complete {
            message: format!(
                "Deployment of {} completed in {:.1}s",
                run.target,
                run.duration_ms() as f64 / 1000.0
            ),
            status: RunStatus::Success,
            stopped: false,
        },
        RunStatus::Stopped => EventPayload::Complete {
            message: format!("Deployment of {} stopped", run.target),
            status: RunStatus::Stopped,
            stopped: true,
        },
        RunStatus::Error | RunStatus::Running => EventPayload::Error {
            message: run
                .error
                .clone()
                .unwrap_or_else(|| "Deployment failed".to_string()),
        },
    }
}

/// 运行超时看门狗
fn spawn_timeout(
    run_id: String,
    cancel_token: CancellationToken,
    timeout: Duration,
    timed_out: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        warn!(run_id = %run_id, "Deployment timed out after {} seconds", timeout.as_secs());
        timed_out.store(true, Ordering::SeqCst);
        cancel_token.cancel();
    })
}
