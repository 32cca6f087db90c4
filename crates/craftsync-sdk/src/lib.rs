//! CraftSync SDK - 离线优先的持久化同步队列
//!
//! 为桌面启动器 GUI 提供：
//! - 📥 离线入队：实例/设置/皮肤/好友等用户变更先落盘再说
//! - 🔁 恢复在线后按批回放，指数退避 + 有界重试
//! - 💾 主副本 + 备份副本双写，损坏自动回退，坏透了冷启动空队列
//! - 🧹 健康巡检：复位卡死动作、裁剪超限队列
//! - 📡 通知总线：快照同步推送 + 粗粒度生命周期广播
//! - 🧵 并发安全：单轮处理护栏，入队防抖合并
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use craftsync_sdk::{
//!     ActionExecutor, ActionType, CraftSyncConfig, CraftSyncSDK, Result, SyncAction,
//! };
//!
//! #[derive(Debug)]
//! struct HttpExecutor;
//!
//! #[async_trait::async_trait]
//! impl ActionExecutor for HttpExecutor {
//!     async fn execute(&self, action: &SyncAction) -> Result<bool> {
//!         // 调用远端 API 重放 action.payload，一次调用只代表一次尝试
//!         Ok(true)
//!     }
//! }
//!
//! # #[derive(Debug)] struct PlatformListener;
//! # #[async_trait::async_trait]
//! # impl craftsync_sdk::ConnectivityListener for PlatformListener {
//! #     async fn current_status(&self) -> craftsync_sdk::ConnectivityStatus {
//! #         craftsync_sdk::ConnectivityStatus::Online
//! #     }
//! #     async fn start_monitoring(
//! #         &self,
//! #     ) -> Result<tokio::sync::broadcast::Receiver<craftsync_sdk::ConnectivityEvent>> {
//! #         Ok(tokio::sync::broadcast::channel(8).1)
//! #     }
//! #     async fn stop_monitoring(&self) {}
//! # }
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = CraftSyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .build()?;
//!
//!     let sdk = CraftSyncSDK::initialize(
//!         config,
//!         Arc::new(HttpExecutor),
//!         Arc::new(PlatformListener),
//!     )
//!     .await?;
//!
//!     // GUI 变更入队，离线也照常返回
//!     let id = sdk
//!         .enqueue(ActionType::SettingsUpdate, serde_json::json!({"theme": "dark"}))
//!         .await?;
//!     println!("已入队: {}", id);
//!
//!     // 观察队列状态
//!     sdk.on_snapshot(|snapshot| {
//!         println!("队列中 {} 条动作", snapshot.actions.len());
//!     })
//!     .await;
//!
//!     sdk.shutdown().await;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod action;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod health;
pub mod network;
pub mod processor;
pub mod queue;
pub mod sdk;
pub mod store;

// 重新导出核心类型，方便使用
pub use action::{classify_error, ActionStatus, ActionType, SyncAction, SyncErrorKind};
pub use config::SyncQueueConfig;
pub use error::{CraftSyncError, Result};
pub use events::{EventStats, QueueSnapshot, SyncEvent, SyncEventBus};
pub use executor::ActionExecutor;
pub use health::HealthMonitor;
pub use network::{
    ConnectivityEvent, ConnectivityListener, ConnectivityMonitor, ConnectivityStatus,
};
pub use processor::{Processor, SyncMetrics};
pub use queue::{QueueStats, SyncQueue};
pub use sdk::{CraftSyncConfig, CraftSyncConfigBuilder, CraftSyncSDK, ProcessAck};
pub use store::{LoadOutcome, LoadSource, SaveReport, SyncStore};
