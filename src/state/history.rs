//! 部署历史存储
//!
//! 每个项目一个历史集合，每个子部署一个历史集合。
//! 集合首次访问时从磁盘加载，写入采用临时文件 + 重命名的原子方式。

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::run::{DeploymentRun, RunStatus, StepResult};
use crate::error::EngineResult;

/// 历史记录
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_deployment: Option<String>,
    pub status: RunStatus,
    pub success: bool,
    #[serde(default)]
    pub stopped: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepResult>,
}

impl HistoryRecord {
    /// 整个运行的记录
    pub fn for_run(run: &DeploymentRun) -> Self {
        Self {
            run_id: run.id.clone(),
            timestamp: run.finished_at.unwrap_or(run.started_at),
            project: run.target.project.clone(),
            sub_deployment: None,
            status: run.status,
            success: run.is_success(),
            stopped: run.status == RunStatus::Stopped,
            duration_ms: run.duration_ms(),
            error: run.error.clone(),
            steps: run.steps.clone(),
        }
    }

    /// 单个子部署的记录，只包含该子部署的步骤
    pub fn for_sub_deployment(
        run: &DeploymentRun,
        sub: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Self {
        let steps: Vec<StepResult> = run
            .steps
            .iter()
            .filter(|s| s.sub_deployment.as_deref() == Some(sub))
            .cloned()
            .collect();
        Self {
            run_id: run.id.clone(),
            timestamp: run.finished_at.unwrap_or(run.started_at),
            project: run.target.project.clone(),
            sub_deployment: Some(sub.to_string()),
            status,
            success: status == RunStatus::Success && steps.iter().all(StepResult::is_acceptable),
            stopped: status == RunStatus::Stopped,
            duration_ms: run.duration_ms(),
            error,
            steps,
        }
    }

    fn collection_key(&self) -> String {
        collection_key(&self.project, self.sub_deployment.as_deref())
    }
}

/// 历史存储
pub struct HistoryStore {
    /// `None` 时仅保存在内存
    dir: Option<PathBuf>,
    limit: usize,
    /// 集合键 -> 记录（最新在前）
    collections: Mutex<HashMap<String, VecDeque<HistoryRecord>>>,
}

impl HistoryStore {
    /// 持久化到目录
    pub fn new(dir: impl Into<PathBuf>, limit: usize) -> Self {
        Self {
            dir: Some(dir.into()),
            limit: limit.max(1),
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// 纯内存存储
    pub fn in_memory(limit: usize) -> Self {
        Self {
            dir: None,
            limit: limit.max(1),
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// 追加记录并持久化所属集合
    pub async fn append(&self, record: HistoryRecord) -> EngineResult<()> {
        let key = record.collection_key();
        let mut collections = self.collections.lock().await;
        let records = self.load_collection(&mut collections, &key).await;

        records.push_front(record);
        records.truncate(self.limit);

        if let Some(dir) = &self.dir {
            let snapshot: Vec<&HistoryRecord> = records.iter().collect();
            save_atomic(&collection_path(dir, &key), &snapshot).await?;
        }
        Ok(())
    }

    /// 最近的记录（最新在前）
    pub async fn list(
        &self,
        project: &str,
        sub_deployment: Option<&str>,
        limit: usize,
    ) -> Vec<HistoryRecord> {
        let key = collection_key(project, sub_deployment);
        let mut collections = self.collections.lock().await;
        let records = self.load_collection(&mut collections, &key).await;
        records.iter().take(limit).cloned().collect()
    }

    /// 最后一次部署
    pub async fn latest(
        &self,
        project: &str,
        sub_deployment: Option<&str>,
    ) -> Option<HistoryRecord> {
        self.list(project, sub_deployment, 1).await.into_iter().next()
    }

    async fn load_collection<'a>(
        &self,
        collections: &'a mut HashMap<String, VecDeque<HistoryRecord>>,
        key: &str,
    ) -> &'a mut VecDeque<HistoryRecord> {
        if !collections.contains_key(key) {
            let loaded = match &self.dir {
                Some(dir) => load_file(&collection_path(dir, key)).await,
                None => VecDeque::new(),
            };
            collections.insert(key.to_string(), loaded);
        }
        collections.entry(key.to_string()).or_default()
    }
}

fn collection_key(project: &str, sub_deployment: Option<&str>) -> String {
    match sub_deployment {
        Some(sub) => format!("{}/{}", project, sub),
        None => project.to_string(),
    }
}

/// 集合文件路径：`<dir>/<project>.json` 或 `<dir>/<project>@<sub>.json`
fn collection_path(dir: &Path, key: &str) -> PathBuf {
    let name: String = key
        .chars()
        .map(|c| match c {
            '/' => '@',
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' => c,
            _ => '_',
        })
        .collect();
    dir.join(format!("{}.json", name))
}

async fn load_file(path: &Path) -> VecDeque<HistoryRecord> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return VecDeque::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read history file");
            return VecDeque::new();
        }
    };
    match serde_json::from_str::<VecDeque<HistoryRecord>>(&content) {
        Ok(records) => {
            debug!(path = %path.display(), count = records.len(), "Loaded history");
            records
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse history file, ignoring");
            VecDeque::new()
        }
    }
}

async fn save_atomic(path: &Path, records: &[&HistoryRecord]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");
    let content = serde_json::to_vec_pretty(records).map_err(std::io::Error::from)?;
    fs::write(&temp_path, &content).await?;
    fs::rename(&temp_path, path).await?;
    debug!(path = %path.display(), count = records.len(), "Saved history");
    Ok(())
}
