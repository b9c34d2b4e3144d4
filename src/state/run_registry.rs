//! 运行中部署登记
//!
//! 按目标加锁：同一项目下整项目运行与任何子部署运行互斥，
//! 子部署运行之间仅在集合有交集时互斥。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::run::RunTarget;
use crate::error::{EngineError, EngineResult};

/// 运行中的部署
struct RunningDeploy {
    target: RunTarget,
    started_at: DateTime<Utc>,
    cancel_token: CancellationToken,
}

/// 运行中部署的摘要
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRun {
    pub run_id: String,
    pub project: String,
    pub sub_deployments: Vec<String>,
    pub started_at: DateTime<Utc>,
}

type RunMap = HashMap<String, RunningDeploy>;

/// 运行登记表
#[derive(Clone, Default)]
pub struct RunRegistry {
    running: Arc<Mutex<RunMap>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RunMap> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 登记运行；与现有运行冲突时拒绝且不改变任何状态
    pub fn register(
        &self,
        run_id: &str,
        target: RunTarget,
        cancel_token: CancellationToken,
    ) -> EngineResult<RunGuard> {
        let mut running = self.lock();
        if let Some((existing_id, _)) = running.iter().find(|(_, r)| r.target.overlaps(&target)) {
            return Err(EngineError::ConcurrentRunRejected {
                target: target.key(),
                run_id: existing_id.clone(),
            });
        }

        debug!(run_id, target = %target, "Registered running deploy");
        running.insert(
            run_id.to_string(),
            RunningDeploy {
                target,
                started_at: Utc::now(),
                cancel_token,
            },
        );
        Ok(RunGuard {
            registry: self.clone(),
            run_id: run_id.to_string(),
        })
    }

    fn unregister(&self, run_id: &str) {
        if self.lock().remove(run_id).is_some() {
            debug!(run_id, "Unregistered running deploy");
        }
    }

    /// 停止项目的运行
    ///
    /// `subs` 为空时停止项目下所有运行，否则停止与该子部署集合相交的运行。
    /// 返回被取消的运行 ID。
    pub fn cancel_project(&self, project: &str, subs: &[String]) -> Vec<String> {
        let filter = RunTarget::with_subs(project, subs.iter().cloned());
        let running = self.lock();
        let mut cancelled = Vec::new();
        for (run_id, deploy) in running.iter() {
            let hit = if subs.is_empty() {
                deploy.target.project == project
            } else {
                deploy.target.overlaps(&filter)
            };
            if hit {
                deploy.cancel_token.cancel();
                cancelled.push(run_id.clone());
            }
        }
        if !cancelled.is_empty() {
            info!(project, runs = ?cancelled, "Cancelling deploys");
        }
        cancelled
    }

    pub fn cancel_run(&self, run_id: &str) -> bool {
        match self.lock().get(run_id) {
            Some(deploy) => {
                info!(run_id, "Cancelling deploy");
                deploy.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消所有运行，返回数量
    pub fn cancel_all(&self) -> usize {
        let running = self.lock();
        for deploy in running.values() {
            deploy.cancel_token.cancel();
        }
        running.len()
    }

    pub fn get(&self, run_id: &str) -> Option<ActiveRun> {
        self.lock().get(run_id).map(|d| summarize(run_id, d))
    }

    /// 所有运行中的部署，按开始时间排序
    pub fn list(&self) -> Vec<ActiveRun> {
        let mut runs: Vec<ActiveRun> = self
            .lock()
            .iter()
            .map(|(id, d)| summarize(id, d))
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }
}

fn summarize(run_id: &str, deploy: &RunningDeploy) -> ActiveRun {
    ActiveRun {
        run_id: run_id.to_string(),
        project: deploy.target.project.clone(),
        sub_deployments: deploy.target.sub_deployments.clone(),
        started_at: deploy.started_at,
    }
}

/// 运行登记凭据，释放时注销
pub struct RunGuard {
    registry: RunRegistry,
    run_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.run_id);
    }
}
