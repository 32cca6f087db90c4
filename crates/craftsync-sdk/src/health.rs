//! 健康检查 - 独立于处理轮次的周期巡检
//!
//! 两件事：复位卡死在 processing 的动作；裁剪超过硬上限的队列。
//! 巡检永远不会淘汰 pending/failed 工作，那只属于存储层的配额路径。

use std::sync::Arc;
use tokio::select;
use tokio::sync::{Notify, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::config::SyncQueueConfig;
use crate::queue::SyncQueue;

/// 健康检查器
pub struct HealthMonitor {
    config: SyncQueueConfig,
    queue: Arc<SyncQueue>,
    shutdown_signal: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
}

impl HealthMonitor {
    pub fn new(config: SyncQueueConfig, queue: Arc<SyncQueue>) -> Self {
        Self {
            config,
            queue,
            shutdown_signal: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// 启动周期巡检任务
    pub async fn start(&self) {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return;
            }
            *running = true;
        }

        let config = self.config.clone();
        let queue = self.queue.clone();
        let shutdown_signal = self.shutdown_signal.clone();
        let is_running = self.is_running.clone();

        tokio::spawn(async move {
            info!("健康检查启动，周期 {}ms", config.health_check_interval_ms);

            loop {
                select! {
                    _ = shutdown_signal.notified() => {
                        debug!("健康检查收到停止信号");
                        break;
                    }
                    _ = sleep(Duration::from_millis(config.health_check_interval_ms)) => {
                        if !*is_running.read().await {
                            break;
                        }
                        Self::sweep_once(&config, &queue).await;
                    }
                }
            }

            info!("健康检查停止");
        });
    }

    /// 停止巡检
    pub async fn stop(&self) {
        {
            let mut running = self.is_running.write().await;
            *running = false;
        }
        self.shutdown_signal.notify_waiters();
    }

    /// 单次巡检（也供测试直接调用）
    pub async fn sweep(&self) {
        Self::sweep_once(&self.config, &self.queue).await;
    }

    async fn sweep_once(config: &SyncQueueConfig, queue: &Arc<SyncQueue>) {
        let recovered = queue.recover_stuck(config.stuck_threshold_ms()).await;
        if recovered > 0 {
            info!("巡检复位 {} 条卡死动作", recovered);
        }

        let trimmed = queue.trim_over_cap().await;
        if trimmed > 0 {
            info!("巡检裁剪 {} 条超限动作", trimmed);
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }
}
