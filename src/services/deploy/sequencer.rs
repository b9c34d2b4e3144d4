//! 步骤序列执行
//!
//! 先按顺序执行本地步骤，再执行远程步骤。每个步骤输出实时转发，
//! 交互步骤的提示先用预设输入应答，没有预设时升级为 `prompt` 事件等待用户输入。
//! 步骤失败且不允许继续时中止序列剩余部分。

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::domain::event::EventPayload;
use crate::domain::project::{SshConfig, Step};
use crate::domain::run::{RunStatus, StepPhase, StepResult};
use crate::error::{EngineError, EngineResult};
use crate::infra::command::{
    resolve_local_dir, CommandError, CommandHandle, CommandRunner, CommandSpec, LineBuffer,
    OutputChunk,
};
use crate::infra::ssh::{remote_command, remote_dir_check, resolve_remote_dir, SshConnection};
use crate::services::prompt::{InputQueue, PromptDetector, PromptWaiter};
use crate::services::session::{SessionMode, SshSessionManager};

use super::context::RunContext;

/// 一个序列的执行计划（项目或单个子部署）
#[derive(Clone, Debug)]
pub struct SequencePlan {
    pub project: String,
    pub sub_deployment: Option<String>,
    /// 本地步骤的根目录
    pub local_root: PathBuf,
    /// 远程步骤的根目录
    pub remote_root: String,
    /// 有效 SSH 配置（已合并继承）
    pub ssh: Option<SshConfig>,
    pub persistent_session: bool,
    pub local_steps: Vec<Step>,
    pub remote_steps: Vec<Step>,
}

impl SequencePlan {
    pub fn step_count(&self) -> usize {
        self.local_steps.len() + self.remote_steps.len()
    }
}

/// 序列执行结果
#[derive(Clone, Debug)]
pub struct SequenceOutcome {
    pub sub_deployment: Option<String>,
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
    pub error: Option<String>,
    /// 本序列建立的 SSH 连接数
    pub connections_opened: usize,
}

impl SequenceOutcome {
    fn new(plan: &SequencePlan) -> Self {
        Self {
            sub_deployment: plan.sub_deployment.clone(),
            status: RunStatus::Success,
            steps: Vec::new(),
            error: None,
            connections_opened: 0,
        }
    }

    fn abort(&mut self, status: RunStatus, error: String) {
        self.status = status;
        self.error = Some(error);
    }

    fn stop(&mut self) {
        self.abort(RunStatus::Stopped, EngineError::Stopped.to_string());
    }

    pub fn is_aborted(&self) -> bool {
        self.status != RunStatus::Success
    }
}

/// 执行一个序列
pub async fn run_sequence(ctx: &RunContext, plan: &SequencePlan) -> SequenceOutcome {
    let sub = plan.sub_deployment.as_deref();
    let mut outcome = SequenceOutcome::new(plan);

    info!(
        run_id = %ctx.run_id,
        project = %plan.project,
        sub_deployment = ?sub,
        local_steps = plan.local_steps.len(),
        remote_steps = plan.remote_steps.len(),
        "Starting step sequence"
    );

    if !plan.local_steps.is_empty() {
        ctx.progress(
            sub,
            format!(
                "Running {} local step(s) in {}",
                plan.local_steps.len(),
                plan.local_root.display()
            ),
        );
        for step in &plan.local_steps {
            if ctx.is_cancelled() {
                outcome.stop();
                return outcome;
            }
            let clock = StepClock::begin(ctx, sub, step, StepPhase::Local);
            let result = run_local_step(ctx, plan, step).await;
            if finish_step(ctx, &mut outcome, sub, step, clock, result) {
                return outcome;
            }
        }
    }

    if !plan.remote_steps.is_empty() {
        if ctx.is_cancelled() {
            outcome.stop();
            return outcome;
        }
        run_remote_phase(ctx, plan, &mut outcome).await;
    }

    debug!(
        run_id = %ctx.run_id,
        sub_deployment = ?sub,
        status = outcome.status.as_str(),
        "Step sequence finished"
    );
    outcome
}

async fn run_remote_phase(ctx: &RunContext, plan: &SequencePlan, outcome: &mut SequenceOutcome) {
    let sub = plan.sub_deployment.as_deref();
    let Some(ssh) = plan.ssh.clone() else {
        let err = EngineError::InvalidSshConfig("no SSH configuration for remote steps".into());
        ctx.progress(sub, err.to_string());
        outcome.abort(RunStatus::Error, err.to_string());
        return;
    };

    let mode = SessionMode::from_flag(plan.persistent_session);
    let mut sessions = SshSessionManager::new(ctx.connector.clone(), ssh.clone(), mode);
    ctx.progress(
        sub,
        format!(
            "Running {} remote step(s) on {} ({} session)",
            plan.remote_steps.len(),
            ssh.display_target(),
            if plan.persistent_session {
                "persistent"
            } else {
                "ephemeral"
            }
        ),
    );

    let started = tokio::select! {
        result = sessions.start() => result,
        _ = ctx.cancel_token.cancelled() => Err(EngineError::Stopped),
    };
    if let Err(e) = started {
        match e {
            EngineError::Stopped => outcome.stop(),
            e => {
                warn!(
                    run_id = %ctx.run_id,
                    sub_deployment = ?sub,
                    error = %e,
                    "SSH session failed"
                );
                ctx.progress(sub, format!("Remote phase aborted: {}", e));
                outcome.abort(RunStatus::Error, e.to_string());
            }
        }
        outcome.connections_opened = sessions.connections_opened();
        return;
    }

    for step in &plan.remote_steps {
        if ctx.is_cancelled() {
            outcome.stop();
            break;
        }
        let clock = StepClock::begin(ctx, sub, step, StepPhase::Remote);
        let result = run_remote_step(ctx, plan, step, &mut sessions).await;
        if finish_step(ctx, outcome, sub, step, clock, result) {
            break;
        }
    }

    sessions.shutdown().await;
    outcome.connections_opened = sessions.connections_opened();
}

/// 步骤计时，开始时发送 `step` 事件
struct StepClock {
    phase: StepPhase,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl StepClock {
    fn begin(ctx: &RunContext, sub: Option<&str>, step: &Step, phase: StepPhase) -> Self {
        ctx.emit(
            sub,
            EventPayload::Step {
                message: format!("Running {} step '{}'", phase.as_str(), step.name),
                step: step.name.clone(),
                phase,
            },
        );
        Self {
            phase,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }
}

/// 记录步骤结果并发送完成/失败事件，返回是否中止序列
fn finish_step(
    ctx: &RunContext,
    outcome: &mut SequenceOutcome,
    sub: Option<&str>,
    step: &Step,
    clock: StepClock,
    result: EngineResult<()>,
) -> bool {
    let duration_ms = clock.started.elapsed().as_millis() as u64;
    let error = result.as_ref().err();

    match error {
        None => ctx.emit(
            sub,
            EventPayload::StepComplete {
                step: step.name.clone(),
                message: Some(format!("Step '{}' completed", step.name)),
                duration_ms,
            },
        ),
        Some(e) => ctx.emit(
            sub,
            EventPayload::StepError {
                step: step.name.clone(),
                message: e.to_string(),
                duration_ms,
            },
        ),
    }

    let stopped = matches!(error, Some(EngineError::Stopped));
    // 连接失败中止远程阶段，不受 continueOnError 影响
    let continued = error.map_or(false, |e| {
        step.continue_on_error && !stopped && !e.is_connection()
    });

    outcome.steps.push(StepResult {
        step: step.name.clone(),
        phase: clock.phase,
        sub_deployment: sub.map(String::from),
        success: error.is_none(),
        continued,
        duration_ms,
        error: error.map(|e| e.to_string()),
        started_at: clock.started_at,
    });

    match error {
        None => false,
        Some(_) if stopped => {
            outcome.stop();
            true
        }
        Some(e) if continued => {
            ctx.progress(
                sub,
                format!("Step '{}' failed, continuing: {}", step.name, e),
            );
            false
        }
        Some(e) => {
            outcome.abort(
                RunStatus::Error,
                format!("Step '{}' failed: {}", step.name, e),
            );
            true
        }
    }
}

async fn run_local_step(ctx: &RunContext, plan: &SequencePlan, step: &Step) -> EngineResult<()> {
    let working_dir = resolve_local_dir(&plan.local_root, &step.working_dir)?;
    let spec = CommandSpec {
        command: step.command.clone(),
        working_dir,
        env: step.env.clone(),
        interactive: step.interactive,
    };
    debug!(
        run_id = %ctx.run_id,
        step = %step.name,
        dir = %spec.working_dir.display(),
        "Spawning local step"
    );
    let handle = CommandRunner::spawn_local(&spec, ctx.settings.stop_grace)?;
    drive_command(ctx, plan.sub_deployment.as_deref(), step, handle).await
}

async fn run_remote_step(
    ctx: &RunContext,
    plan: &SequencePlan,
    step: &Step,
    sessions: &mut SshSessionManager,
) -> EngineResult<()> {
    let conn = tokio::select! {
        conn = sessions.acquire() => conn?,
        _ = ctx.cancel_token.cancelled() => return Err(EngineError::Stopped),
    };
    let result = exec_remote_step(ctx, plan, step, conn.as_ref()).await;
    sessions.release(conn).await;
    result
}

async fn exec_remote_step(
    ctx: &RunContext,
    plan: &SequencePlan,
    step: &Step,
    conn: &dyn SshConnection,
) -> EngineResult<()> {
    let dir = resolve_remote_dir(&plan.remote_root, &step.working_dir);
    if let Some(dir) = &dir {
        let check = conn.exec(&remote_dir_check(dir), false).await?;
        match check.wait().await {
            Ok(()) => {}
            Err(CommandError::NonZeroExit(_)) => {
                return Err(EngineError::InvalidWorkingDir(dir.clone()))
            }
            Err(e) => return Err(e.into()),
        }
    }

    let command = remote_command(dir.as_deref(), &step.env, &step.command);
    let handle = conn.exec(&command, step.interactive).await?;
    drive_command(ctx, plan.sub_deployment.as_deref(), step, handle).await
}

/// 转发命令输出并处理交互提示，直到命令结束
async fn drive_command(
    ctx: &RunContext,
    sub: Option<&str>,
    step: &Step,
    mut handle: CommandHandle,
) -> EngineResult<()> {
    let mut lines = LineBuffer::new();
    let mut detector = step
        .interactive
        .then(|| PromptDetector::new(ctx.settings.prompt.clone()));
    let mut inputs = InputQueue::new(&step.inputs);
    let mut waiter: Option<PromptWaiter> = None;
    let mut prompt_deadline: Option<Instant> = None;
    let mut failure: Option<EngineError> = None;
    let mut terminating = false;
    let mut stopped = false;

    loop {
        let idle_at = match (&detector, &waiter) {
            (Some(d), None) if !terminating => d.next_check(&lines),
            _ => None,
        };

        tokio::select! {
            chunk = handle.next_output() => {
                let Some(chunk) = chunk else { break };
                if let Some(d) = detector.as_mut() {
                    d.touch();
                }
                for line in lines.push(chunk) {
                    emit_output(ctx, sub, line);
                }
            }
            _ = sleep_until(idle_at) => {
                let found = detector
                    .as_ref()
                    .and_then(|d| d.poll_idle(&mut lines, Instant::now()));
                let Some(found) = found else { continue };
                let prompt = found.text.trim().to_string();
                emit_output(ctx, sub, OutputChunk { stream: found.stream, data: found.text });

                match inputs.next_answer() {
                    Some(input) => {
                        debug!(
                            run_id = %ctx.run_id,
                            step = %step.name,
                            prompt = %prompt,
                            "Answering prompt from configured input"
                        );
                        ctx.progress(
                            sub,
                            format!("Answering prompt '{}' with configured input", prompt),
                        );
                        if let Err(e) = handle.write_line(&input.default_value).await {
                            warn!(
                                run_id = %ctx.run_id,
                                step = %step.name,
                                error = %e,
                                "Failed to write input"
                            );
                        }
                    }
                    None => {
                        let w = ctx.prompts.open(&ctx.run_id, sub, &step.name, &prompt);
                        info!(
                            run_id = %ctx.run_id,
                            step = %step.name,
                            session_id = %w.session().session_id,
                            "Waiting for user input"
                        );
                        ctx.emit(sub, EventPayload::Prompt {
                            session_id: w.session().session_id.clone(),
                            step: step.name.clone(),
                            prompt,
                        });
                        prompt_deadline = ctx.settings.prompt_timeout.map(|t| Instant::now() + t);
                        waiter = Some(w);
                    }
                }
            }
            answer = wait_answer(&mut waiter), if waiter.is_some() => {
                waiter = None;
                prompt_deadline = None;
                match answer {
                    Ok(input) => {
                        if let Err(e) = handle.write_line(&input).await {
                            warn!(
                                run_id = %ctx.run_id,
                                step = %step.name,
                                error = %e,
                                "Failed to write input"
                            );
                        }
                    }
                    Err(e) => {
                        if !ctx.is_cancelled() {
                            failure = Some(e);
                        }
                        terminating = true;
                        handle.terminate();
                    }
                }
            }
            _ = sleep_until(prompt_deadline) => {
                prompt_deadline = None;
                let prompt = waiter
                    .take()
                    .map(|w| w.session().prompt.clone())
                    .unwrap_or_default();
                warn!(run_id = %ctx.run_id, step = %step.name, "Prompt timed out");
                failure = Some(EngineError::PromptTimeout(prompt));
                terminating = true;
                handle.terminate();
            }
            _ = ctx.cancel_token.cancelled(), if !stopped => {
                info!(run_id = %ctx.run_id, step = %step.name, "Stopping step");
                stopped = true;
                terminating = true;
                handle.terminate();
            }
        }
    }

    for chunk in lines.flush() {
        emit_output(ctx, sub, chunk);
    }
    // 命令已结束，撤销未应答的提示
    drop(waiter);

    let exit = handle.wait().await;
    if stopped {
        return Err(EngineError::Stopped);
    }
    if let Some(e) = failure {
        return Err(e);
    }
    exit.map_err(EngineError::from)
}

fn emit_output(ctx: &RunContext, sub: Option<&str>, chunk: OutputChunk) {
    ctx.emit(
        sub,
        EventPayload::Output {
            data: chunk.data,
            output_type: chunk.stream,
        },
    );
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

async fn wait_answer(waiter: &mut Option<PromptWaiter>) -> EngineResult<String> {
    match waiter {
        Some(w) => w.answer().await,
        None => std::future::pending().await,
    }
}

/// 测试辅助：构造运行上下文
#[cfg(test)]
pub(crate) fn test_context(
    connector: std::sync::Arc<dyn crate::infra::ssh::SshConnector>,
    settings: crate::config::EngineSettings,
) -> (
    RunContext,
    tokio::sync::broadcast::Receiver<crate::domain::event::DeployEvent>,
) {
    use crate::services::prompt::PromptBroker;
    use crate::state::event_hub::RunEmitter;

    let emitter = RunEmitter::new("run-test");
    let rx = emitter.subscribe().expect("fresh emitter is open");
    let ctx = RunContext {
        run_id: "run-test".to_string(),
        emitter,
        cancel_token: tokio_util::sync::CancellationToken::new(),
        prompts: PromptBroker::new(),
        connector,
        settings: std::sync::Arc::new(settings),
    };
    (ctx, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::broadcast;

    use crate::config::{EngineSettings, PromptSettings};
    use crate::domain::event::DeployEvent;
    use crate::domain::project::InputSpec;
    use crate::infra::ssh::testing::LoopbackConnector;

    fn settings() -> EngineSettings {
        EngineSettings {
            prompt: PromptSettings {
                idle: Duration::from_millis(150),
                fallback_idle: Duration::from_millis(1500),
                ..PromptSettings::default()
            },
            stop_grace: Duration::from_millis(500),
            ..EngineSettings::default()
        }
    }

    fn plan(root: &std::path::Path, local: Vec<Step>, remote: Vec<Step>) -> SequencePlan {
        SequencePlan {
            project: "shop".into(),
            sub_deployment: None,
            local_root: root.to_path_buf(),
            remote_root: root.display().to_string(),
            ssh: Some(SshConfig::with_password("127.0.0.1", "deploy", "pw")),
            persistent_session: false,
            local_steps: local,
            remote_steps: remote,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<DeployEvent>) -> Vec<DeployEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn output_text(events: &[DeployEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Output { data, .. } => Some(data.as_str()),
                _ => None,
            })
            .collect()
    }

    fn interactive(name: &str, command: &str, answers: &[&str]) -> Step {
        let mut step = Step::new(name, command);
        step.interactive = true;
        step.inputs = answers
            .iter()
            .map(|a| InputSpec {
                prompt: String::new(),
                default_value: a.to_string(),
                required: true,
            })
            .collect();
        step
    }

    #[tokio::test]
    async fn test_local_steps_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = test_context(Arc::new(LoopbackConnector::default()), settings());
        let plan = plan(
            dir.path(),
            vec![Step::new("one", "echo first"), Step::new("two", "echo second")],
            vec![],
        );

        let outcome = run_sequence(&ctx, &plan).await;
        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.steps.len(), 2);
        assert!(outcome.steps.iter().all(|s| s.success));

        let events = drain(&mut rx);
        let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec!["progress", "step", "output", "step-complete", "step", "output", "step-complete"]
        );
        assert_eq!(output_text(&events), "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_output_emitted_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = test_context(Arc::new(LoopbackConnector::default()), settings());
        let step = Step::new(
            "lines",
            "printf 'one\\ntwo\\nthree\\n'; printf 'par'; sleep 0.3; printf 'tial\\n'",
        );

        let outcome = run_sequence(&ctx, &plan(dir.path(), vec![step], vec![])).await;
        assert_eq!(outcome.status, RunStatus::Success);

        let lines: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e.payload {
                EventPayload::Output { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(lines, ["one\n", "two\n", "three\n", "partial\n"]);
    }

    #[tokio::test]
    async fn test_unterminated_output_flushed_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = test_context(Arc::new(LoopbackConnector::default()), settings());
        let step = Step::new("tail", "printf 'done\\nno newline'");

        run_sequence(&ctx, &plan(dir.path(), vec![], vec![step])).await;
        let events = drain(&mut rx);
        let outputs: Vec<_> = events.iter().filter(|e| e.kind() == "output").collect();
        assert_eq!(outputs.len(), 2);
        assert_eq!(output_text(&events), "done\nno newline");
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = test_context(Arc::new(LoopbackConnector::default()), settings());
        let plan = plan(
            dir.path(),
            vec![Step::new("fail", "exit 1"), Step::new("never", "echo never")],
            vec![Step::new("remote", "echo remote")],
        );

        let outcome = run_sequence(&ctx, &plan).await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert_eq!(outcome.steps.len(), 1);
        assert!(!outcome.steps[0].success);
        assert_eq!(outcome.connections_opened, 0);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| e.kind() == "step-error"));
        assert!(!output_text(&events).contains("never"));
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = test_context(Arc::new(LoopbackConnector::default()), settings());
        let mut lint = Step::new("lint", "exit 2");
        lint.continue_on_error = true;
        let plan = plan(dir.path(), vec![lint, Step::new("build", "true")], vec![]);

        let outcome = run_sequence(&ctx, &plan).await;
        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.steps.len(), 2);
        assert!(outcome.steps[0].continued);
        assert!(outcome.steps[1].success);
    }

    #[tokio::test]
    async fn test_invalid_working_dir_fails_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = test_context(Arc::new(LoopbackConnector::default()), settings());
        let mut step = Step::new("build", "touch created");
        step.working_dir = "missing".into();
        let plan = plan(dir.path(), vec![step], vec![]);

        let outcome = run_sequence(&ctx, &plan).await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.steps[0]
            .error
            .as_deref()
            .unwrap()
            .contains("Invalid working directory"));
        assert!(!dir.path().join("created").exists());
    }

    #[tokio::test]
    async fn test_remote_exit_aborts_and_env_exported() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = test_context(Arc::new(LoopbackConnector::default()), settings());
        let mut first = Step::new("env", "echo $STAGE");
        first.env.push(crate::domain::project::EnvVar {
            name: "STAGE".into(),
            value: "prod".into(),
        });
        let plan = plan(
            dir.path(),
            vec![],
            vec![first, Step::new("fail", "exit 1"), Step::new("never", "echo never")],
        );

        let outcome = run_sequence(&ctx, &plan).await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.steps[0].phase, StepPhase::Remote);
        assert_eq!(output_text(&drain(&mut rx)), "prod\n");
    }

    #[tokio::test]
    async fn test_persistent_session_opens_one_connection() {
        let dir = tempfile::tempdir().unwrap();
        let steps = vec![
            Step::new("a", "true"),
            Step::new("b", "true"),
            Step::new("c", "true"),
        ];

        let connector = Arc::new(LoopbackConnector::default());
        let (ctx, _rx) = test_context(connector.clone(), settings());
        let mut persistent = plan(dir.path(), vec![], steps.clone());
        persistent.persistent_session = true;
        let outcome = run_sequence(&ctx, &persistent).await;
        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.connections_opened, 1);
        assert_eq!(connector.opened(), 1);
        assert_eq!(connector.closed(), 1);

        let connector = Arc::new(LoopbackConnector::default());
        let (ctx, _rx) = test_context(connector.clone(), settings());
        let outcome = run_sequence(&ctx, &plan(dir.path(), vec![], steps)).await;
        assert_eq!(outcome.connections_opened, 3);
        assert_eq!(connector.closed(), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_keeps_local_results() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = test_context(
            Arc::new(LoopbackConnector::rejecting("127.0.0.1")),
            settings(),
        );
        let mut p = plan(
            dir.path(),
            vec![Step::new("build", "true")],
            vec![Step::new("restart", "true")],
        );
        p.persistent_session = true;

        let outcome = run_sequence(&ctx, &p).await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert_eq!(outcome.steps.len(), 1);
        assert!(outcome.steps[0].success);
        assert!(outcome.error.unwrap().contains("authentication failed"));
    }

    #[tokio::test]
    async fn test_missing_remote_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = test_context(Arc::new(LoopbackConnector::default()), settings());
        let mut step = Step::new("restart", "true");
        step.working_dir = "not-there".into();
        let outcome = run_sequence(&ctx, &plan(dir.path(), vec![], vec![step])).await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.steps[0]
            .error
            .as_deref()
            .unwrap()
            .contains("not-there"));
    }

    #[tokio::test]
    async fn test_prompt_answered_from_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = test_context(Arc::new(LoopbackConnector::default()), settings());
        let step = interactive(
            "confirm",
            "printf 'Proceed? '; read answer; echo \"answer=$answer\"",
            &["yes"],
        );

        let outcome = run_sequence(&ctx, &plan(dir.path(), vec![step], vec![])).await;
        assert_eq!(outcome.status, RunStatus::Success);

        let events = drain(&mut rx);
        assert!(output_text(&events).contains("answer=yes"));
        assert!(!events.iter().any(|e| e.kind() == "prompt"));
    }

    #[tokio::test]
    async fn test_prompt_escalates_to_user() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = test_context(Arc::new(LoopbackConnector::default()), settings());
        let step = interactive(
            "confirm",
            "printf 'Name: '; read name; echo \"hello $name\"",
            &[],
        );
        let plan = plan(dir.path(), vec![step], vec![]);

        let answer = async {
            loop {
                let event = rx.recv().await.unwrap();
                if let EventPayload::Prompt { session_id, prompt, .. } = &event.payload {
                    assert_eq!(prompt, "Name:");
                    ctx.prompts.submit(session_id, "ops").unwrap();
                    break;
                }
            }
        };
        let (outcome, _) = tokio::join!(run_sequence(&ctx, &plan), answer);
        assert_eq!(outcome.status, RunStatus::Success);
        assert!(output_text(&drain(&mut rx)).contains("hello ops"));
        assert!(ctx.prompts.pending(None).is_empty());
    }

    #[tokio::test]
    async fn test_extra_prompt_escalates_after_inputs_run_out() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = test_context(Arc::new(LoopbackConnector::default()), settings());
        let step = interactive(
            "confirm",
            "printf 'A? '; read a; printf 'B? '; read b; echo \"a=$a b=$b\"",
            &["first"],
        );
        let plan = plan(dir.path(), vec![step], vec![]);

        let answer = async {
            let mut seen = Vec::new();
            loop {
                let event = rx.recv().await.unwrap();
                if let EventPayload::Prompt { session_id, prompt, .. } = &event.payload {
                    assert_eq!(prompt, "B?");
                    ctx.prompts.submit(session_id, "second").unwrap();
                    seen.push(event);
                    break;
                }
                seen.push(event);
            }
            seen
        };
        let (outcome, mut events) = tokio::join!(run_sequence(&ctx, &plan), answer);
        assert_eq!(outcome.status, RunStatus::Success);
        events.extend(drain(&mut rx));

        let prompts = events.iter().filter(|e| e.kind() == "prompt").count();
        assert_eq!(prompts, 1);
        assert!(events.iter().any(|e| matches!(
            &e.payload,
            EventPayload::Progress { message } if message.contains("'A?'")
        )));
        assert!(output_text(&events).contains("a=first b=second"));
    }

    #[tokio::test]
    async fn test_prompt_timeout_fails_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings();
        s.prompt_timeout = Some(Duration::from_millis(300));
        let (ctx, _rx) = test_context(Arc::new(LoopbackConnector::default()), s);
        let step = interactive("confirm", "printf 'Continue? '; read answer", &[]);

        let outcome = run_sequence(&ctx, &plan(dir.path(), vec![step], vec![])).await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert!(outcome.steps[0].error.as_deref().unwrap().contains("Timed out"));
        assert!(ctx.prompts.pending(None).is_empty());
    }

    #[tokio::test]
    async fn test_stop_mid_step() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = test_context(Arc::new(LoopbackConnector::default()), settings());
        let plan = plan(
            dir.path(),
            vec![Step::new("done", "true"), Step::new("slow", "sleep 30")],
            vec![Step::new("remote", "true")],
        );

        let cancel = ctx.cancel_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let outcome = run_sequence(&ctx, &plan).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.status, RunStatus::Stopped);
        assert_eq!(outcome.steps.len(), 2);
        assert!(outcome.steps[0].success);
        assert!(!outcome.steps[1].success);
    }

    #[tokio::test]
    async fn test_stop_mid_remote_step_closes_persistent_session() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(LoopbackConnector::default());
        let (ctx, _rx) = test_context(connector.clone(), settings());
        let mut p = plan(
            dir.path(),
            vec![],
            vec![Step::new("a", "true"), Step::new("b", "sleep 30")],
        );
        p.persistent_session = true;

        let cancel = ctx.cancel_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let outcome = run_sequence(&ctx, &p).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(outcome.status, RunStatus::Stopped);
        assert_eq!(outcome.steps.len(), 2);
        assert!(outcome.steps[0].success);
        assert!(!outcome.steps[1].success);
        assert_eq!(connector.opened(), 1);
        assert_eq!(connector.closed(), 1);
    }
}
