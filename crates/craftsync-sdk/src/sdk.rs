//! 统一 SDK 接口 - CraftSyncSDK 主入口
//!
//! 分层架构：
//! ```text
//! CraftSyncSDK (组合根)
//!   ├── SyncQueue (队列管理层)
//!   ├── Processor (批处理层)
//!   ├── SyncStore (持久化层)
//!   ├── HealthMonitor (健康检查层)
//!   ├── SyncEventBus (通知总线层)
//!   └── ConnectivityMonitor (连接监控层)
//! ```
//!
//! 显式构造、显式持有：由应用的组合根创建一个实例并按引用传递，
//! 不做模块级单例，测试里可以并存任意多个独立队列。

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::select;
use tokio::sync::{Notify, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::action::{now_ms, ActionType};
use crate::config::SyncQueueConfig;
use crate::error::{CraftSyncError, Result};
use crate::events::{QueueSnapshot, SyncEvent, SyncEventBus};
use crate::executor::ActionExecutor;
use crate::health::HealthMonitor;
use crate::network::{ConnectivityListener, ConnectivityMonitor};
use crate::processor::{Processor, SyncMetrics};
use crate::queue::{QueueStats, SyncQueue};
use crate::store::SyncStore;

/// SDK 配置
#[derive(Debug, Clone)]
pub struct CraftSyncConfig {
    /// 本地数据目录
    pub data_dir: PathBuf,
    /// 队列行为配置
    pub queue: SyncQueueConfig,
}

impl CraftSyncConfig {
    pub fn builder() -> CraftSyncConfigBuilder {
        CraftSyncConfigBuilder::default()
    }
}

/// SDK 配置构建器
#[derive(Debug, Default)]
pub struct CraftSyncConfigBuilder {
    data_dir: Option<PathBuf>,
    queue: Option<SyncQueueConfig>,
}

impl CraftSyncConfigBuilder {
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    pub fn queue(mut self, queue: SyncQueueConfig) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn build(self) -> Result<CraftSyncConfig> {
        let data_dir = self
            .data_dir
            .ok_or_else(|| CraftSyncError::Config("data_dir 未设置".to_string()))?;
        Ok(CraftSyncConfig {
            data_dir,
            queue: self.queue.unwrap_or_default(),
        })
    }
}

/// 后台同步桥接的应答
#[derive(Debug, Clone, Serialize)]
pub struct ProcessAck {
    pub success: bool,
    pub processed: usize,
}

/// CraftSync SDK 主入口
pub struct CraftSyncSDK {
    config: CraftSyncConfig,
    queue: Arc<SyncQueue>,
    events: Arc<SyncEventBus>,
    connectivity: Arc<ConnectivityMonitor>,
    processor: Arc<Processor>,
    health: HealthMonitor,
    shutdown_signal: Arc<Notify>,
    is_running: RwLock<bool>,
}

impl CraftSyncSDK {
    /// 初始化 SDK：恢复持久化队列、接入连接监控、启动健康检查
    pub async fn initialize(
        config: CraftSyncConfig,
        executor: Arc<dyn ActionExecutor>,
        listener: Arc<dyn ConnectivityListener>,
    ) -> Result<Arc<Self>> {
        info!("初始化 CraftSync SDK: {:?}", config.data_dir);

        let store = Arc::new(SyncStore::open(&config.data_dir).await?);
        let events = Arc::new(SyncEventBus::new(256));
        let queue = SyncQueue::restore(config.queue.clone(), store, events.clone()).await;

        let connectivity = Arc::new(ConnectivityMonitor::new(listener));
        connectivity.start().await?;

        let processor = Processor::new(
            config.queue.clone(),
            queue.clone(),
            executor,
            connectivity.clone(),
            events.clone(),
        );

        let health = HealthMonitor::new(config.queue.clone(), queue.clone());
        health.start().await;

        let sdk = Arc::new(Self {
            config,
            queue,
            events,
            connectivity,
            processor,
            health,
            shutdown_signal: Arc::new(Notify::new()),
            is_running: RwLock::new(true),
        });

        sdk.spawn_connectivity_watcher();

        // 启动即在线时，把历史积压交给处理器
        if !sdk.connectivity.is_offline().await {
            sdk.processor.trigger_debounced();
        }

        Ok(sdk)
    }

    /// 恢复在线后等一个静置延迟再开跑，给网络栈一点收敛时间
    fn spawn_connectivity_watcher(self: &Arc<Self>) {
        let mut receiver = self.connectivity.subscribe();
        let processor = self.processor.clone();
        let settle_ms = self.config.queue.online_settle_ms;
        let shutdown_signal = self.shutdown_signal.clone();

        tokio::spawn(async move {
            loop {
                select! {
                    _ = shutdown_signal.notified() => break,
                    event = receiver.recv() => {
                        match event {
                            Ok(event) if event.is_back_online() => {
                                info!("恢复在线，{}ms 后开始处理积压", settle_ms);
                                sleep(Duration::from_millis(settle_ms)).await;
                                processor.process().await;
                            }
                            Ok(_) => {}
                            Err(_) => break,
                        }
                    }
                }
            }
        });
    }

    /// 入队一条用户变更；在线时安排防抖处理
    pub async fn enqueue(&self, action_type: ActionType, payload: serde_json::Value) -> Result<String> {
        self.ensure_running().await?;
        let id = self.queue.enqueue(action_type, payload).await?;

        if !self.connectivity.is_offline().await {
            self.processor.trigger_debounced();
        }
        Ok(id)
    }

    /// 按 ID 删除动作
    pub async fn dequeue(&self, id: &str) -> bool {
        self.queue.dequeue(id).await
    }

    /// 手动重试一条 failed 动作；在线时立即处理
    pub async fn retry_action(&self, id: &str) -> bool {
        let reset = self.queue.retry_action(id).await;
        if reset && !self.connectivity.is_offline().await {
            let processor = self.processor.clone();
            tokio::spawn(async move {
                processor.process().await;
            });
        }
        reset
    }

    /// 手动重试全部 failed 动作
    pub async fn retry_all_failed(&self) -> usize {
        let count = self.queue.retry_all_failed().await;
        if count > 0 && !self.connectivity.is_offline().await {
            let processor = self.processor.clone();
            tokio::spawn(async move {
                processor.process().await;
            });
        }
        count
    }

    pub async fn clear_completed(&self) -> usize {
        self.queue.clear_completed().await
    }

    pub async fn clear_failed(&self) -> usize {
        self.queue.clear_failed().await
    }

    pub async fn clear_all(&self) -> usize {
        self.queue.clear_all().await
    }

    pub async fn stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    pub async fn metrics(&self) -> SyncMetrics {
        self.processor.metrics().await
    }

    /// 后台同步桥接："现在就处理"，返回 {success, processed} 应答
    pub async fn process_now(&self) -> ProcessAck {
        if self.connectivity.is_offline().await {
            debug!("process_now: 当前离线");
            return ProcessAck {
                success: false,
                processed: 0,
            };
        }

        let processed = self.processor.process().await;
        ProcessAck {
            success: true,
            processed,
        }
    }

    /// 诊断导出：用户触发的排障转储
    pub async fn export_diagnostics(&self) -> Result<String> {
        let snapshot = self.events.latest_snapshot().await;
        let stats = self.queue.stats().await;

        let dump = serde_json::json!({
            "actions": snapshot.actions,
            "last_sync_time": snapshot.last_sync_time,
            "exported_at": now_ms(),
            "stats": stats,
        });
        Ok(serde_json::to_string_pretty(&dump)?)
    }

    /// 注册快照观察者（注册时立即收到当前快照）
    pub async fn on_snapshot<F>(&self, listener: F)
    where
        F: Fn(&QueueSnapshot) + Send + Sync + 'static,
    {
        self.events.add_snapshot_listener(listener).await;
    }

    /// 订阅粗粒度生命周期事件
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// 连接监控器（平台层回调 set_status 用）
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub async fn is_offline(&self) -> bool {
        self.connectivity.is_offline().await
    }

    /// 关闭 SDK：停掉健康检查与监听任务
    pub async fn shutdown(&self) {
        {
            let mut running = self.is_running.write().await;
            if !*running {
                warn!("SDK 已关闭，忽略重复 shutdown");
                return;
            }
            *running = false;
        }

        self.shutdown_signal.notify_waiters();
        self.health.stop().await;
        info!("CraftSync SDK 已关闭");
    }

    async fn ensure_running(&self) -> Result<()> {
        if *self.is_running.read().await {
            Ok(())
        } else {
            Err(CraftSyncError::ShuttingDown("SDK 已关闭".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::SyncAction;
    use crate::error::Result;
    use crate::network::{ConnectivityStatus, StaticConnectivityListener};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct OkExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ActionExecutor for OkExecutor {
        async fn execute(&self, _action: &SyncAction) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    /// 第一次调用失败、之后成功
    #[derive(Debug, Default)]
    struct FailOnceExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ActionExecutor for FailOnceExecutor {
        async fn execute(&self, _action: &SyncAction) -> Result<bool> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CraftSyncError::Executor("server 500".to_string()))
            } else {
                Ok(true)
            }
        }
    }

    fn fast_queue_config() -> SyncQueueConfig {
        SyncQueueConfig {
            action_timeout_ms: 500,
            completed_grace_ms: 10_000,
            inter_action_delay_ms: 0,
            batch_follow_up_delay_ms: 60_000,
            enqueue_debounce_ms: 10,
            online_settle_ms: 10,
            backoff_table_ms: vec![0, 0, 0, 0, 0],
            ..Default::default()
        }
    }

    async fn build_sdk(
        queue_config: SyncQueueConfig,
        executor: Arc<dyn ActionExecutor>,
        status: ConnectivityStatus,
    ) -> (Arc<CraftSyncSDK>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = CraftSyncConfig::builder()
            .data_dir(dir.path())
            .queue(queue_config)
            .build()
            .unwrap();
        let listener = Arc::new(StaticConnectivityListener::new(status));
        let sdk = CraftSyncSDK::initialize(config, executor, listener)
            .await
            .unwrap();
        (sdk, dir)
    }

    #[tokio::test]
    async fn test_builder_requires_data_dir() {
        assert!(CraftSyncConfig::builder().build().is_err());
        assert!(CraftSyncConfig::builder().data_dir("/tmp/x").build().is_ok());
    }

    #[tokio::test]
    async fn test_offline_enqueue_then_online_drains_in_order() {
        let executor = Arc::new(OkExecutor::default());
        let (sdk, _dir) = build_sdk(
            fast_queue_config(),
            executor.clone(),
            ConnectivityStatus::Offline,
        )
        .await;

        for i in 0..3 {
            sdk.enqueue(ActionType::SettingsUpdate, json!({"seq": i}))
                .await
                .unwrap();
        }

        let stats = sdk.stats().await;
        assert_eq!(stats.pending, 3);
        let snapshot = sdk.events.latest_snapshot().await;
        assert!(!snapshot.is_processing);

        // 恢复在线：静置延迟后自动开始处理
        sdk.connectivity().set_status(ConnectivityStatus::Online).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = sdk.stats().await;
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.pending, 0);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_enqueue_while_online_triggers_debounced_run() {
        let executor = Arc::new(OkExecutor::default());
        let (sdk, _dir) = build_sdk(
            fast_queue_config(),
            executor.clone(),
            ConnectivityStatus::Online,
        )
        .await;

        sdk.enqueue(ActionType::SkinUpdate, json!({"skin": "alex"}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sdk.stats().await.completed, 1);
    }

    #[tokio::test]
    async fn test_process_now_acknowledgement() {
        let executor = Arc::new(OkExecutor::default());
        let (sdk, _dir) = build_sdk(
            fast_queue_config(),
            executor.clone(),
            ConnectivityStatus::Offline,
        )
        .await;

        sdk.enqueue(ActionType::CapeUpdate, json!({})).await.unwrap();

        // 离线时桥接请求直接失败应答
        let ack = sdk.process_now().await;
        assert!(!ack.success);
        assert_eq!(ack.processed, 0);

        sdk.connectivity().set_status(ConnectivityStatus::Online).await;
        // 等静置窗口的自动轮次跑完，再验证桥接应答本身
        tokio::time::sleep(Duration::from_millis(100)).await;
        sdk.enqueue(ActionType::SkinUpdate, json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let ack = sdk.process_now().await;
        assert!(ack.success);
    }

    #[tokio::test]
    async fn test_manual_retry_after_terminal_failure() {
        let executor = Arc::new(FailOnceExecutor::default());
        let config = SyncQueueConfig {
            max_retries: 1,
            ..fast_queue_config()
        };
        let (sdk, _dir) = build_sdk(config, executor.clone(), ConnectivityStatus::Online).await;

        let id = sdk
            .enqueue(ActionType::FriendAccept, json!({"from": "Alex"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sdk.stats().await.failed, 1);

        // 手动重试触发立即处理，这次执行器会成功
        assert!(sdk.retry_action(&id).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = sdk.stats().await;
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn test_export_diagnostics_shape() {
        let executor = Arc::new(OkExecutor::default());
        let (sdk, _dir) = build_sdk(
            fast_queue_config(),
            executor,
            ConnectivityStatus::Offline,
        )
        .await;

        sdk.enqueue(ActionType::InstanceCreate, json!({"name": "skyblock"}))
            .await
            .unwrap();

        let dump = sdk.export_diagnostics().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&dump).unwrap();
        assert_eq!(value["actions"].as_array().unwrap().len(), 1);
        assert!(value["exported_at"].is_u64());
        assert_eq!(value["stats"]["pending"], 1);
        assert!(value.get("last_sync_time").is_some());
    }

    #[tokio::test]
    async fn test_snapshot_listener_gets_initial_state() {
        let executor = Arc::new(OkExecutor::default());
        let (sdk, _dir) = build_sdk(
            fast_queue_config(),
            executor,
            ConnectivityStatus::Offline,
        )
        .await;

        sdk.enqueue(ActionType::SettingsUpdate, json!({})).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        sdk.on_snapshot(move |snapshot| {
            seen_clone.store(snapshot.actions.len(), Ordering::SeqCst);
        })
        .await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let executor = Arc::new(OkExecutor::default());
        let (sdk, _dir) = build_sdk(
            fast_queue_config(),
            executor,
            ConnectivityStatus::Offline,
        )
        .await;

        sdk.shutdown().await;
        let result = sdk.enqueue(ActionType::SkinUpdate, json!({})).await;
        assert!(matches!(result, Err(CraftSyncError::ShuttingDown(_))));
    }

    #[tokio::test]
    async fn test_queue_restored_after_restart() {
        let dir = TempDir::new().unwrap();
        let listener = Arc::new(StaticConnectivityListener::new(ConnectivityStatus::Offline));
        let config = CraftSyncConfig::builder()
            .data_dir(dir.path())
            .queue(fast_queue_config())
            .build()
            .unwrap();

        {
            let sdk = CraftSyncSDK::initialize(
                config.clone(),
                Arc::new(OkExecutor::default()),
                listener.clone(),
            )
            .await
            .unwrap();
            sdk.enqueue(ActionType::InstanceDelete, json!({"id": 9}))
                .await
                .unwrap();
            sdk.shutdown().await;
        }

        let sdk = CraftSyncSDK::initialize(config, Arc::new(OkExecutor::default()), listener)
            .await
            .unwrap();
        assert_eq!(sdk.stats().await.pending, 1);
    }
}
