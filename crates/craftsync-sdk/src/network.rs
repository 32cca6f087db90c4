use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::action::now_ms;
use crate::error::Result;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
}

/// 连接状态变化事件
#[derive(Debug, Clone)]
pub struct ConnectivityEvent {
    pub old_status: ConnectivityStatus,
    pub new_status: ConnectivityStatus,
    pub timestamp: u64,
}

impl ConnectivityEvent {
    /// 是否是"离线 → 在线"的恢复沿
    pub fn is_back_online(&self) -> bool {
        self.old_status == ConnectivityStatus::Offline && self.new_status == ConnectivityStatus::Online
    }
}

/// 连接状态监听器 trait（由平台层实现，如 Windows/macOS/Linux 桌面端）
#[async_trait]
pub trait ConnectivityListener: Send + Sync + std::fmt::Debug {
    /// 获取当前连接状态
    async fn current_status(&self) -> ConnectivityStatus;

    /// 开始监听连接状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<ConnectivityEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 连接状态监控器
///
/// 队列核心只消费一个布尔离线信号和变化订阅，平台细节留在监听器里。
#[derive(Debug)]
pub struct ConnectivityMonitor {
    listener: Arc<dyn ConnectivityListener>,
    status_sender: broadcast::Sender<ConnectivityEvent>,
    current_status: Arc<tokio::sync::RwLock<ConnectivityStatus>>,
}

impl ConnectivityMonitor {
    pub fn new(listener: Arc<dyn ConnectivityListener>) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            listener,
            status_sender,
            current_status: Arc::new(tokio::sync::RwLock::new(ConnectivityStatus::Offline)),
        }
    }

    /// 启动监控：接入平台监听器并转发状态变化
    pub async fn start(&self) -> Result<()> {
        let initial = self.listener.current_status().await;
        {
            let mut status = self.current_status.write().await;
            *status = initial;
        }

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                {
                    let mut status = current_status.write().await;
                    *status = event.new_status;
                }
                let _ = status_sender.send(event);
            }
        });

        Ok(())
    }

    /// 当前是否离线
    pub async fn is_offline(&self) -> bool {
        *self.current_status.read().await == ConnectivityStatus::Offline
    }

    /// 手动设置连接状态（平台回调或测试使用）
    pub async fn set_status(&self, new_status: ConnectivityStatus) {
        let old_status = {
            let mut status = self.current_status.write().await;
            let old = *status;
            *status = new_status;
            old
        };

        if old_status == new_status {
            return;
        }

        let event = ConnectivityEvent {
            old_status,
            new_status,
            timestamp: now_ms(),
        };
        let _ = self.status_sender.send(event);
    }

    /// 订阅连接状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.status_sender.subscribe()
    }
}


#[cfg(test)]
pub use test_helpers::StaticConnectivityListener;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monitor_tracks_manual_status() {
        let listener = Arc::new(StaticConnectivityListener::new(ConnectivityStatus::Offline));
        let monitor = ConnectivityMonitor::new(listener);
        monitor.start().await.unwrap();
        assert!(monitor.is_offline().await);

        monitor.set_status(ConnectivityStatus::Online).await;
        assert!(!monitor.is_offline().await);
    }

    #[tokio::test]
    async fn test_subscribe_sees_transition() {
        let listener = Arc::new(StaticConnectivityListener::new(ConnectivityStatus::Offline));
        let monitor = ConnectivityMonitor::new(listener);
        monitor.start().await.unwrap();

        let mut receiver = monitor.subscribe();
        monitor.set_status(ConnectivityStatus::Online).await;

        let event = receiver.recv().await.unwrap();
        assert!(event.is_back_online());
    }

    #[tokio::test]
    async fn test_same_status_does_not_emit() {
        let listener = Arc::new(StaticConnectivityListener::new(ConnectivityStatus::Online));
        let monitor = ConnectivityMonitor::new(listener);
        monitor.start().await.unwrap();

        let mut receiver = monitor.subscribe();
        monitor.set_status(ConnectivityStatus::Online).await;
        assert!(receiver.try_recv().is_err());
    }
}
