//! 事件通道管理
//!
//! 每个运行一个广播通道。事件序号在发送锁内分配，
//! 并发的子部署序列交错发送时，订阅者看到的序号严格递增。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use crate::config::env::constants::EVENT_CHANNEL_CAPACITY;
use crate::domain::event::{DeployEvent, EventPayload};

struct EmitterState {
    seq: u64,
    /// 终止事件发出后置空，订阅者随之收到 Closed
    sender: Option<broadcast::Sender<DeployEvent>>,
}

/// 单个运行的事件发送端
#[derive(Clone)]
pub struct RunEmitter {
    run_id: Arc<str>,
    state: Arc<Mutex<EmitterState>>,
}

impl RunEmitter {
    pub fn new(run_id: &str) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            run_id: Arc::from(run_id),
            state: Arc::new(Mutex::new(EmitterState {
                seq: 0,
                sender: Some(sender),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EmitterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 发送事件，返回分配的序号
    ///
    /// 终止事件之后的发送被忽略并返回 `None`。
    pub fn emit(&self, sub_deployment: Option<&str>, payload: EventPayload) -> Option<u64> {
        let mut state = self.lock();
        let sender = state.sender.as_ref()?.clone();

        state.seq += 1;
        let terminal = payload.is_terminal();
        let event = DeployEvent {
            seq: state.seq,
            run_id: self.run_id.to_string(),
            sub_deployment: sub_deployment.map(String::from),
            timestamp: Utc::now(),
            payload,
        };
        // 没有订阅者时发送失败，忽略
        let _ = sender.send(event);

        if terminal {
            state.sender = None;
        }
        Some(state.seq)
    }

    /// 订阅后续事件；通道已关闭时返回 `None`
    pub fn subscribe(&self) -> Option<broadcast::Receiver<DeployEvent>> {
        self.lock().sender.as_ref().map(|s| s.subscribe())
    }

    /// 是否已发出终止事件
    pub fn is_closed(&self) -> bool {
        self.lock().sender.is_none()
    }
}

/// 事件中心
///
/// 按运行 ID 管理事件通道，运行结束后移除。
pub struct EventHub {
    runs: RwLock<HashMap<String, RunEmitter>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// 为运行创建通道
    pub async fn create(&self, run_id: &str) -> RunEmitter {
        let mut runs = self.runs.write().await;
        runs.entry(run_id.to_string())
            .or_insert_with(|| RunEmitter::new(run_id))
            .clone()
    }

    /// 订阅运行的事件流
    pub async fn subscribe(&self, run_id: &str) -> Option<broadcast::Receiver<DeployEvent>> {
        let runs = self.runs.read().await;
        runs.get(run_id).and_then(|e| e.subscribe())
    }

    pub async fn remove(&self, run_id: &str) {
        self.runs.write().await.remove(run_id);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
