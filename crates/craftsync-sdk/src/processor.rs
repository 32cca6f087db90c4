//! 处理器 - 按批次排空可处理动作
//!
//! 排序规则：(retry_count 升序, timestamp 升序)。从未失败的动作优先，
//! 同档内最旧的优先，避免反复失败的动作饿死新鲜工作。
//! 单轮受批大小与墙钟上限约束，中途离线立即收束，剩余工作留给下一轮。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::action::{classify_error, now_ms, SyncAction};
use crate::config::SyncQueueConfig;
use crate::events::{SyncEvent, SyncEventBus};
use crate::executor::ActionExecutor;
use crate::network::ConnectivityMonitor;
use crate::queue::SyncQueue;

/// 处理统计信息
#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    pub attempt_total: u64,
    pub success_total: u64,
    pub failure_total: u64,
    pub retry_count_total: u64,
    pub runs_total: u64,
}

impl SyncMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.attempt_total == 0 {
            0.0
        } else {
            self.success_total as f64 / self.attempt_total as f64
        }
    }
}

/// 处理器运行器
pub struct Processor {
    config: SyncQueueConfig,
    queue: Arc<SyncQueue>,
    executor: Arc<dyn ActionExecutor>,
    monitor: Arc<ConnectivityMonitor>,
    events: Arc<SyncEventBus>,
    /// 并发护栏：同一时间只允许一轮处理；也被快照引用
    is_processing: Arc<AtomicBool>,
    /// 续批任务已排定
    follow_up_pending: AtomicBool,
    /// 入队防抖窗口已开启
    debounce_pending: AtomicBool,
    metrics: Arc<RwLock<SyncMetrics>>,
}

impl Processor {
    pub fn new(
        config: SyncQueueConfig,
        queue: Arc<SyncQueue>,
        executor: Arc<dyn ActionExecutor>,
        monitor: Arc<ConnectivityMonitor>,
        events: Arc<SyncEventBus>,
    ) -> Arc<Self> {
        let is_processing = queue.processing_flag();
        Arc::new(Self {
            config,
            queue,
            executor,
            monitor,
            events,
            is_processing,
            follow_up_pending: AtomicBool::new(false),
            debounce_pending: AtomicBool::new(false),
            metrics: Arc::new(RwLock::new(SyncMetrics::default())),
        })
    }

    /// 执行一轮处理，返回本轮尝试的动作数
    ///
    /// 已有一轮在跑时静默返回 0（重入是 no-op）。
    pub async fn process(self: &Arc<Self>) -> usize {
        if self.is_processing.swap(true, Ordering::SeqCst) {
            debug!("已有处理轮次在进行，忽略本次触发");
            return 0;
        }

        if self.monitor.is_offline().await {
            self.is_processing.store(false, Ordering::SeqCst);
            debug!("当前离线，跳过处理");
            return 0;
        }

        self.events.emit(SyncEvent::SyncStarted).await;
        self.queue.publish_snapshot().await;
        let run_started = Instant::now();
        let ceiling = Duration::from_millis(self.config.run_time_ceiling_ms);

        let batch = self
            .queue
            .eligible_batch(now_ms(), self.config.batch_size)
            .await;
        info!("开始处理，本批 {} 条", batch.len());

        let mut processed = 0;
        let total = batch.len();
        for (index, action) in batch.into_iter().enumerate() {
            if self.monitor.is_offline().await {
                info!("中途离线，收束本轮，剩余动作留给下一轮");
                break;
            }
            if run_started.elapsed() >= ceiling {
                warn!("本轮超过墙钟上限，提前收束");
                break;
            }

            self.execute_one(action).await;
            processed += 1;

            // 批内间隔，避免打爆后端
            if index + 1 < total && self.config.inter_action_delay_ms > 0 {
                sleep(Duration::from_millis(self.config.inter_action_delay_ms)).await;
            }
        }

        self.queue.set_last_sync_time(now_ms()).await;

        {
            let mut metrics = self.metrics.write().await;
            metrics.runs_total += 1;
        }

        self.is_processing.store(false, Ordering::SeqCst);
        self.queue.publish_snapshot().await;
        self.events
            .emit(SyncEvent::SyncCompleted { processed })
            .await;

        if self.queue.has_remaining_work().await && !self.monitor.is_offline().await {
            self.schedule_follow_up();
        }

        processed
    }

    /// 执行单个动作：processing → 成功/失败 → 每次状态迁移都落盘并通知
    async fn execute_one(self: &Arc<Self>, action: SyncAction) {
        let id = action.id.clone();

        if !self.queue.begin_attempt(&id, now_ms()).await {
            debug!("动作 {} 已不在队列，跳过", id);
            return;
        }

        {
            let mut metrics = self.metrics.write().await;
            metrics.attempt_total += 1;
            metrics.retry_count_total += action.retry_count as u64;
        }

        let attempt = timeout(
            Duration::from_millis(self.config.action_timeout_ms),
            self.executor.execute(&action),
        )
        .await;

        match attempt {
            Ok(Ok(true)) => {
                info!("动作同步成功: {} ({})", id, action.action_type);
                {
                    let mut metrics = self.metrics.write().await;
                    metrics.success_total += 1;
                }
                self.queue.complete_action(&id).await;
                self.schedule_grace_removal(id);
            }
            Ok(Ok(false)) => {
                self.handle_failure(&action, "executor rejected action".to_string())
                    .await;
            }
            Ok(Err(e)) => {
                self.handle_failure(&action, e.to_string()).await;
            }
            Err(_) => {
                // 超时按失败处理；底层调用可能仍在后台运行，执行器须可安全丢弃
                let message = format!(
                    "attempt timed out after {}ms",
                    self.config.action_timeout_ms
                );
                self.handle_failure(&action, message).await;
            }
        }
    }

    async fn handle_failure(&self, action: &SyncAction, message: String) {
        let kind = classify_error(&message);
        warn!(
            "动作同步失败: {} ({}) kind={} err={}",
            action.id, action.action_type, kind, message
        );

        {
            let mut metrics = self.metrics.write().await;
            metrics.failure_total += 1;
        }

        let terminal = self
            .queue
            .fail_action(&action.id, message.clone(), kind)
            .await;

        if terminal == Some(true) {
            // 终态通知与常规快照通知分开，便于后台观察者只关心重试耗尽
            self.events
                .emit(SyncEvent::ActionFailed {
                    action_id: action.id.clone(),
                    action_type: action.action_type,
                    error: message,
                    error_kind: kind,
                })
                .await;
        }
    }

    /// 完成后的宽限移除：让观察者先看到"已同步"再消失
    fn schedule_grace_removal(self: &Arc<Self>, id: String) {
        let queue = self.queue.clone();
        let grace = self.config.completed_grace_ms;
        tokio::spawn(async move {
            sleep(Duration::from_millis(grace)).await;
            queue.dequeue(&id).await;
        });
    }

    /// 剩余工作的续批：固定延迟后再跑一轮，与主入口共用同一护栏
    fn schedule_follow_up(self: &Arc<Self>) {
        if self.follow_up_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(this.config.batch_follow_up_delay_ms)).await;
            this.follow_up_pending.store(false, Ordering::SeqCst);
            this.process().await;
        });
    }

    /// 入队触发的防抖处理：短窗口内的突发入队合并为一次
    pub fn trigger_debounced(self: &Arc<Self>) {
        if self.debounce_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(this.config.enqueue_debounce_ms)).await;
            this.debounce_pending.store(false, Ordering::SeqCst);
            this.process().await;
        });
    }

    pub async fn metrics(&self) -> SyncMetrics {
        self.metrics.read().await.clone()
    }
}
