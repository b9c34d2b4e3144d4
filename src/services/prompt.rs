//! 交互提示检测与应答
//!
//! - `PromptDetector`: 每个流末尾的半行静默一段时间后判定为提示
//! - `InputQueue`: 步骤预设的输入，按顺序消费
//! - `PromptBroker`: 按 sessionId 登记等待中的提示，每个会话恰好被应答或取消一次

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::PromptSettings;
use crate::domain::event::OutputType;
use crate::domain::project::InputSpec;
use crate::domain::prompt::PromptSession;
use crate::error::{EngineError, EngineResult};
use crate::infra::command::LineBuffer;

/// 检测到的提示
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectedPrompt {
    pub stream: OutputType,
    pub text: String,
}

/// 提示检测器
///
/// 只看 `LineBuffer` 中每个流末尾的半行，完整的行不会成为提示。
pub struct PromptDetector {
    settings: PromptSettings,
    last_activity: Instant,
}

impl PromptDetector {
    pub fn new(settings: PromptSettings) -> Self {
        Self {
            settings,
            last_activity: Instant::now(),
        }
    }

    /// 记录一次输出，静默计时重新开始
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// 尾部文本是否像提示（以配置的后缀结尾）
    pub fn looks_like_prompt(&self, text: &str) -> bool {
        let trimmed = text.trim_end();
        !trimmed.is_empty() && self.settings.patterns.iter().any(|p| trimmed.ends_with(p.as_str()))
    }

    fn quiet_needed(&self, text: &str) -> Option<Duration> {
        if text.trim().is_empty() {
            None
        } else if self.looks_like_prompt(text) {
            Some(self.settings.idle)
        } else {
            Some(self.settings.fallback_idle)
        }
    }

    /// 下一次需要检查的时间点；没有半行时返回 `None`
    pub fn next_check(&self, lines: &LineBuffer) -> Option<Instant> {
        [OutputType::Stdout, OutputType::Stderr]
            .into_iter()
            .filter_map(|stream| self.quiet_needed(lines.partial(stream)))
            .min()
            .map(|quiet| self.last_activity + quiet)
    }

    /// 静默期满时取出提示文本（取出后不会再次触发）
    pub fn poll_idle(&self, lines: &mut LineBuffer, now: Instant) -> Option<DetectedPrompt> {
        let quiet = now.saturating_duration_since(self.last_activity);
        for stream in [OutputType::Stdout, OutputType::Stderr] {
            if let Some(needed) = self.quiet_needed(lines.partial(stream)) {
                if quiet >= needed {
                    let text = lines.take_partial(stream);
                    return Some(DetectedPrompt { stream, text });
                }
            }
        }
        None
    }
}

/// 步骤预设输入，按配置顺序消费
pub struct InputQueue {
    remaining: VecDeque<InputSpec>,
}

impl InputQueue {
    pub fn new(inputs: &[InputSpec]) -> Self {
        Self {
            remaining: inputs.iter().cloned().collect(),
        }
    }

    /// 取出下一个预设回答
    pub fn next_answer(&mut self) -> Option<InputSpec> {
        self.remaining.pop_front()
    }
}

struct PendingPrompt {
    session: PromptSession,
    reply: oneshot::Sender<String>,
}

type PendingMap = HashMap<String, PendingPrompt>;

/// 提示会话登记表
#[derive(Clone, Default)]
pub struct PromptBroker {
    pending: Arc<Mutex<PendingMap>>,
}

impl PromptBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 登记新的提示会话
    pub fn open(
        &self,
        run_id: &str,
        sub_deployment: Option<&str>,
        step: &str,
        prompt: &str,
    ) -> PromptWaiter {
        let session = PromptSession {
            session_id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            sub_deployment: sub_deployment.map(String::from),
            step: step.to_string(),
            prompt: prompt.to_string(),
            created_at: Utc::now(),
        };
        let (reply, rx) = oneshot::channel();
        self.lock().insert(
            session.session_id.clone(),
            PendingPrompt {
                session: session.clone(),
                reply,
            },
        );
        debug!(session_id = %session.session_id, run_id, step, "Prompt session opened");

        PromptWaiter {
            session,
            rx,
            broker: self.clone(),
        }
    }

    /// 提交用户输入
    pub fn submit(&self, session_id: &str, input: &str) -> EngineResult<PromptSession> {
        let pending = self
            .lock()
            .remove(session_id)
            .ok_or_else(|| EngineError::PromptNotFound(session_id.to_string()))?;

        // 等待方已放弃（步骤已结束），视同会话不存在
        pending
            .reply
            .send(input.to_string())
            .map_err(|_| EngineError::PromptNotFound(session_id.to_string()))?;
        info!(session_id, step = %pending.session.step, "Prompt answered");
        Ok(pending.session)
    }

    /// 取消运行的所有提示会话，等待方收到取消
    pub fn cancel_run(&self, run_id: &str) -> usize {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|_, p| p.session.run_id != run_id);
        before - pending.len()
    }

    /// 等待中的会话，可按运行过滤
    pub fn pending(&self, run_id: Option<&str>) -> Vec<PromptSession> {
        let mut sessions: Vec<PromptSession> = self
            .lock()
            .values()
            .filter(|p| run_id.map_or(true, |id| p.session.run_id == id))
            .map(|p| p.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    fn discard(&self, session_id: &str) {
        self.lock().remove(session_id);
    }
}

/// 等待单个提示的应答，释放时注销会话
pub struct PromptWaiter {
    session: PromptSession,
    rx: oneshot::Receiver<String>,
    broker: PromptBroker,
}

impl PromptWaiter {
    pub fn session(&self) -> &PromptSession {
        &self.session
    }

    /// 等待应答；会话被取消时返回 `PromptCancelled`
    ///
    /// 可在 `select!` 中反复轮询。
    pub async fn answer(&mut self) -> EngineResult<String> {
        (&mut self.rx)
            .await
            .map_err(|_| EngineError::PromptCancelled(self.session.prompt.clone()))
    }
}

impl Drop for PromptWaiter {
    fn drop(&mut self) {
        self.broker.discard(&self.session.session_id);
    }
}
