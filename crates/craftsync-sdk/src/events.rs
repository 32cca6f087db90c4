//! 通知总线 - 队列状态的发布/订阅
//!
//! 两条通道：
//! - 快照通道：每次状态变更后同步调用所有注册观察者（GUI 状态镜像用），
//!   新订阅者注册时立即收到当前快照，不存在错过初始状态的窗口
//! - 生命周期通道：粗粒度事件广播（后台/系统级观察者用）

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::action::{ActionType, SyncAction, SyncErrorKind};

/// 队列状态快照
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSnapshot {
    pub actions: Vec<SyncAction>,
    pub last_sync_time: Option<u64>,
    pub is_processing: bool,
    pub is_corrupted: bool,
    pub storage_error: Option<String>,
}

/// 粗粒度生命周期事件
#[derive(Debug, Clone, Serialize)]
pub enum SyncEvent {
    /// 一轮处理开始
    SyncStarted,
    /// 一轮处理结束
    SyncCompleted { processed: usize },
    /// 动作重试耗尽，进入终态（区别于常规的快照通知）
    ActionFailed {
        action_id: String,
        action_type: ActionType,
        error: String,
        error_kind: SyncErrorKind,
    },
    /// 存储层异常（损坏恢复、配额清理等）
    SyncError { message: String },
}

impl SyncEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::SyncStarted => "started",
            SyncEvent::SyncCompleted { .. } => "completed",
            SyncEvent::ActionFailed { .. } => "action-failed",
            SyncEvent::SyncError { .. } => "error",
        }
    }
}

/// 快照观察者类型
pub type SnapshotListener = Box<dyn Fn(&QueueSnapshot) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
}

/// 通知总线
pub struct SyncEventBus {
    lifecycle_sender: broadcast::Sender<SyncEvent>,
    listeners: Arc<RwLock<Vec<SnapshotListener>>>,
    current: Arc<RwLock<QueueSnapshot>>,
    stats: Arc<RwLock<EventStats>>,
}

impl SyncEventBus {
    pub fn new(capacity: usize) -> Self {
        let (lifecycle_sender, _) = broadcast::channel(capacity);

        Self {
            lifecycle_sender,
            listeners: Arc::new(RwLock::new(Vec::new())),
            current: Arc::new(RwLock::new(QueueSnapshot::default())),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布新快照：缓存为当前状态并同步调用所有观察者
    pub async fn publish_snapshot(&self, snapshot: QueueSnapshot) {
        {
            let mut current = self.current.write().await;
            *current = snapshot.clone();
        }

        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener(&snapshot);
        }
    }

    /// 注册快照观察者，注册时立即回放当前快照
    pub async fn add_snapshot_listener<F>(&self, listener: F)
    where
        F: Fn(&QueueSnapshot) + Send + Sync + 'static,
    {
        {
            let current = self.current.read().await;
            listener(&current);
        }

        let mut listeners = self.listeners.write().await;
        listeners.push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.len();
    }

    /// 当前快照
    pub async fn latest_snapshot(&self) -> QueueSnapshot {
        self.current.read().await.clone()
    }

    /// 发布生命周期事件
    pub async fn emit(&self, event: SyncEvent) {
        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
        }

        // 无订阅者时 send 会失败，属正常场景（如无后台观察者），仅打 debug
        if let Err(e) = self.lifecycle_sender.send(event) {
            debug!("No active lifecycle receivers: {}", e);
        }
    }

    /// 订阅生命周期事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.lifecycle_sender.subscribe()
    }

    pub async fn stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }
}
