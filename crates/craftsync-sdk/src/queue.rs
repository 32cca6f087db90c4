//! 队列管理 - 内存中的权威状态与全部变更入口
//!
//! 每次变更都经过同一条路径：改内存 → 持久化 → 发布快照。
//! 持久化失败不阻断变更（内存优先，错误通过快照上报）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::action::{now_ms, ActionStatus, ActionType, SyncAction, SyncErrorKind};
use crate::config::SyncQueueConfig;
use crate::error::{CraftSyncError, Result};
use crate::events::{QueueSnapshot, SyncEvent, SyncEventBus};
use crate::store::SyncStore;

/// 队列统计信息
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub avg_retry_count: f64,
    pub oldest_timestamp: Option<u64>,
}

/// 同步队列
pub struct SyncQueue {
    config: SyncQueueConfig,
    store: Arc<SyncStore>,
    events: Arc<SyncEventBus>,
    actions: RwLock<Vec<SyncAction>>,
    last_sync_time: RwLock<Option<u64>>,
    is_processing: Arc<AtomicBool>,
    is_corrupted: AtomicBool,
    storage_error: RwLock<Option<String>>,
}

impl SyncQueue {
    /// 从存储恢复队列并发布初始快照
    pub async fn restore(
        config: SyncQueueConfig,
        store: Arc<SyncStore>,
        events: Arc<SyncEventBus>,
    ) -> Arc<Self> {
        let mut outcome = store.load();
        if outcome.corrupted {
            events
                .emit(SyncEvent::SyncError {
                    message: "主副本损坏，已回退".to_string(),
                })
                .await;
        }

        // completed 只为宽限期短暂停留，跨重启的直接出队
        let before = outcome.actions.len();
        outcome
            .actions
            .retain(|a| a.status != ActionStatus::Completed);
        let purged = before - outcome.actions.len();
        if purged > 0 {
            debug!("启动时清理 {} 条跨重启的 completed 动作", purged);
        }

        let queue = Arc::new(Self {
            config,
            store,
            events,
            actions: RwLock::new(outcome.actions),
            last_sync_time: RwLock::new(outcome.last_sync_time),
            is_processing: Arc::new(AtomicBool::new(false)),
            is_corrupted: AtomicBool::new(outcome.corrupted),
            storage_error: RwLock::new(None),
        });

        if outcome.interrupted > 0 || purged > 0 {
            // 恢复时的修正立即落盘，避免再次非正常退出时重复修正
            queue.sync_state().await;
        } else {
            queue.publish_snapshot().await;
        }

        queue
    }

    /// 入队新动作
    ///
    /// 容量到顶先淘汰 completed；仍满则返回 QueueFull（背压），
    /// 绝不静默丢弃 pending/processing。
    pub async fn enqueue(&self, action_type: ActionType, payload: serde_json::Value) -> Result<String> {
        let action = SyncAction::new(action_type, payload);
        let id = action.id.clone();

        {
            let mut actions = self.actions.write().await;
            if actions.len() >= self.config.max_queue_size {
                let before = actions.len();
                actions.retain(|a| a.status != ActionStatus::Completed);
                let evicted = before - actions.len();
                if evicted > 0 {
                    debug!("容量淘汰 {} 条 completed 动作", evicted);
                }
                if actions.len() >= self.config.max_queue_size {
                    warn!("队列已满（{} 条），拒绝入队 {}", actions.len(), action_type);
                    return Err(CraftSyncError::QueueFull(format!(
                        "{} actions queued",
                        actions.len()
                    )));
                }
            }
            actions.push(action);
        }

        info!("动作入队: {} ({})", id, action_type);
        self.sync_state().await;
        Ok(id)
    }

    /// 按 ID 移除动作；未找到时为 no-op
    pub async fn dequeue(&self, id: &str) -> bool {
        let removed = {
            let mut actions = self.actions.write().await;
            let before = actions.len();
            actions.retain(|a| a.id != id);
            before != actions.len()
        };

        if removed {
            self.sync_state().await;
        }
        removed
    }

    /// 手动重试单条 failed 动作
    pub async fn retry_action(&self, id: &str) -> bool {
        let reset = {
            let mut actions = self.actions.write().await;
            match actions.iter_mut().find(|a| a.id == id) {
                Some(action) if action.status == ActionStatus::Failed => {
                    action.reset_for_manual_retry();
                    true
                }
                _ => false,
            }
        };

        if reset {
            info!("手动重试动作: {}", id);
            self.sync_state().await;
        }
        reset
    }

    /// 手动重试全部 failed 动作，返回重置条数
    pub async fn retry_all_failed(&self) -> usize {
        let count = {
            let mut actions = self.actions.write().await;
            let mut count = 0;
            for action in actions.iter_mut() {
                if action.status == ActionStatus::Failed {
                    action.reset_for_manual_retry();
                    count += 1;
                }
            }
            count
        };

        if count > 0 {
            info!("手动重试 {} 条失败动作", count);
            self.sync_state().await;
        }
        count
    }

    pub async fn clear_completed(&self) -> usize {
        self.clear_by(|a| a.status == ActionStatus::Completed).await
    }

    pub async fn clear_failed(&self) -> usize {
        self.clear_by(|a| a.status == ActionStatus::Failed).await
    }

    pub async fn clear_all(&self) -> usize {
        self.clear_by(|_| true).await
    }

    async fn clear_by<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SyncAction) -> bool,
    {
        let removed = {
            let mut actions = self.actions.write().await;
            let before = actions.len();
            actions.retain(|a| !predicate(a));
            before - actions.len()
        };

        if removed > 0 {
            self.sync_state().await;
        }
        removed
    }

    /// 统计摘要（观察者展示用，也可作为属性测试的 oracle）
    pub async fn stats(&self) -> QueueStats {
        let actions = self.actions.read().await;
        let mut stats = QueueStats {
            total: actions.len(),
            ..Default::default()
        };

        let mut retry_sum = 0u64;
        for action in actions.iter() {
            match action.status {
                ActionStatus::Pending => stats.pending += 1,
                ActionStatus::Processing => stats.processing += 1,
                ActionStatus::Completed => stats.completed += 1,
                ActionStatus::Failed => stats.failed += 1,
            }
            retry_sum += action.retry_count as u64;
        }
        if !actions.is_empty() {
            stats.avg_retry_count = retry_sum as f64 / actions.len() as f64;
        }
        stats.oldest_timestamp = actions.iter().map(|a| a.timestamp).min();

        stats
    }

    // ---- 处理器 / 健康检查入口 ----

    /// 取一批可处理动作：(retry_count 升序, timestamp 升序)，新鲜工作优先
    pub async fn eligible_batch(&self, now: u64, limit: usize) -> Vec<SyncAction> {
        let actions = self.actions.read().await;
        let mut eligible: Vec<SyncAction> = actions
            .iter()
            .filter(|a| a.is_eligible(now, self.config.max_retries))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| {
            a.retry_count
                .cmp(&b.retry_count)
                .then(a.timestamp.cmp(&b.timestamp))
        });
        eligible.truncate(limit);
        eligible
    }

    /// 是否还有未完成的自动工作（含退避门未到的）
    pub async fn has_remaining_work(&self) -> bool {
        let actions = self.actions.read().await;
        actions.iter().any(|a| {
            matches!(a.status, ActionStatus::Pending | ActionStatus::Failed)
                && a.retry_count < self.config.max_retries
        })
    }

    /// 标记动作进入 processing 并记录尝试时间；动作已不存在时返回 false
    pub async fn begin_attempt(&self, id: &str, now: u64) -> bool {
        let marked = {
            let mut actions = self.actions.write().await;
            match actions.iter_mut().find(|a| a.id == id) {
                Some(action) => {
                    action.mark_processing(now);
                    true
                }
                None => false,
            }
        };

        if marked {
            self.sync_state().await;
        }
        marked
    }

    /// 标记动作成功完成
    pub async fn complete_action(&self, id: &str) -> bool {
        let completed = {
            let mut actions = self.actions.write().await;
            match actions.iter_mut().find(|a| a.id == id) {
                Some(action) => {
                    action.mark_completed();
                    true
                }
                None => false,
            }
        };

        if completed {
            self.sync_state().await;
        }
        completed
    }

    /// 记录动作失败；返回 Some(true) 表示重试耗尽进入终态
    pub async fn fail_action(&self, id: &str, error: String, kind: SyncErrorKind) -> Option<bool> {
        let terminal = {
            let mut actions = self.actions.write().await;
            let action = actions.iter_mut().find(|a| a.id == id)?;
            Some(action.record_failure(
                error,
                kind,
                self.config.max_retries,
                &self.config.backoff_table_ms,
                now_ms(),
            ))
        };

        if terminal.is_some() {
            self.sync_state().await;
        }
        terminal
    }

    /// 更新最近同步时间
    pub async fn set_last_sync_time(&self, timestamp: u64) {
        {
            let mut last = self.last_sync_time.write().await;
            *last = Some(timestamp);
        }
        self.sync_state().await;
    }

    /// 复位卡死动作：processing 且最近尝试早于阈值
    pub async fn recover_stuck(&self, threshold_ms: u64) -> usize {
        let now = now_ms();
        let recovered = {
            let mut actions = self.actions.write().await;
            let mut recovered = 0;
            for action in actions.iter_mut() {
                if action.status == ActionStatus::Processing {
                    let stale = action
                        .last_attempt
                        .map(|t| now.saturating_sub(t) > threshold_ms)
                        .unwrap_or(true);
                    if stale {
                        warn!("复位卡死动作: {} ({})", action.id, action.action_type);
                        action.mark_stuck_reset();
                        recovered += 1;
                    }
                }
            }
            recovered
        };

        if recovered > 0 {
            self.sync_state().await;
        }
        recovered
    }

    /// 超限裁剪：超过硬上限只淘汰最旧的 completed，活跃工作不动
    pub async fn trim_over_cap(&self) -> usize {
        let trimmed = {
            let mut actions = self.actions.write().await;
            let mut trimmed = 0;
            while actions.len() > self.config.hard_cap {
                let oldest_completed = actions
                    .iter()
                    .enumerate()
                    .filter(|(_, a)| a.status == ActionStatus::Completed)
                    .min_by_key(|(_, a)| a.timestamp)
                    .map(|(i, _)| i);
                match oldest_completed {
                    Some(index) => {
                        actions.remove(index);
                        trimmed += 1;
                    }
                    None => break,
                }
            }
            trimmed
        };

        if trimmed > 0 {
            info!("超限裁剪 {} 条 completed 动作", trimmed);
            self.sync_state().await;
        }
        trimmed
    }

    /// 供处理器共享的 processing 标记（快照用）
    pub fn processing_flag(&self) -> Arc<AtomicBool> {
        self.is_processing.clone()
    }

    /// 只发布快照不落盘（processing 标记翻转等运行时状态变化用）
    pub async fn publish_snapshot(&self) {
        let snapshot = self.build_snapshot().await;
        self.events.publish_snapshot(snapshot).await;
    }

    async fn build_snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            actions: self.actions.read().await.clone(),
            last_sync_time: *self.last_sync_time.read().await,
            is_processing: self.is_processing.load(Ordering::SeqCst),
            is_corrupted: self.is_corrupted.load(Ordering::SeqCst),
            storage_error: self.storage_error.read().await.clone(),
        }
    }

    /// 变更后的统一路径：落盘 → 应用配额清理结果 → 发布快照
    async fn sync_state(&self) {
        let (actions_copy, last_sync) = {
            let actions = self.actions.read().await;
            let last = self.last_sync_time.read().await;
            (actions.clone(), *last)
        };

        let report = self.store.save(&actions_copy, last_sync);

        if !report.pruned.is_empty() {
            let mut actions = self.actions.write().await;
            actions.retain(|a| !report.pruned.contains(&a.id));
            drop(actions);
            self.events
                .emit(SyncEvent::SyncError {
                    message: format!("存储配额清理，丢弃 {} 条历史动作", report.pruned.len()),
                })
                .await;
        }

        {
            let mut storage_error = self.storage_error.write().await;
            *storage_error = report.error.clone();
        }
        if let Some(message) = report.error {
            self.events.emit(SyncEvent::SyncError { message }).await;
        }

        self.publish_snapshot().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn build_queue(config: SyncQueueConfig) -> (Arc<SyncQueue>, Arc<SyncEventBus>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SyncStore::open(temp_dir.path()).await.unwrap());
        let events = Arc::new(SyncEventBus::new(64));
        let queue = SyncQueue::restore(config, store, events.clone()).await;
        (queue, events, temp_dir)
    }

    #[tokio::test]
    async fn test_enqueue_starts_pending() {
        let (queue, _events, _dir) = build_queue(SyncQueueConfig::default()).await;

        for _ in 0..3 {
            queue
                .enqueue(ActionType::SettingsUpdate, json!({"v": 1}))
                .await
                .unwrap();
        }

        let stats = queue.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.avg_retry_count, 0.0);
    }

    #[tokio::test]
    async fn test_queue_full_rejects_without_dropping_pending() {
        let config = SyncQueueConfig {
            max_queue_size: 2,
            ..Default::default()
        };
        let (queue, _events, _dir) = build_queue(config).await;

        queue.enqueue(ActionType::SkinUpdate, json!({})).await.unwrap();
        queue.enqueue(ActionType::CapeUpdate, json!({})).await.unwrap();

        let result = queue.enqueue(ActionType::FriendRequest, json!({})).await;
        assert!(matches!(result, Err(CraftSyncError::QueueFull(_))));
        // pending 动作一条不少
        assert_eq!(queue.stats().await.pending, 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_completed_first() {
        let config = SyncQueueConfig {
            max_queue_size: 2,
            ..Default::default()
        };
        let (queue, _events, _dir) = build_queue(config).await;

        let id = queue.enqueue(ActionType::SkinUpdate, json!({})).await.unwrap();
        queue.enqueue(ActionType::CapeUpdate, json!({})).await.unwrap();
        queue.complete_action(&id).await;

        // completed 被淘汰腾位，入队成功
        queue.enqueue(ActionType::FriendAccept, json!({})).await.unwrap();
        let stats = queue.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn test_dequeue_unknown_id_is_noop() {
        let (queue, _events, _dir) = build_queue(SyncQueueConfig::default()).await;
        assert!(!queue.dequeue("missing").await);

        let id = queue.enqueue(ActionType::InstanceDelete, json!({})).await.unwrap();
        assert!(queue.dequeue(&id).await);
        assert_eq!(queue.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_retry_action_only_valid_on_failed() {
        let config = SyncQueueConfig {
            max_retries: 1,
            ..Default::default()
        };
        let (queue, _events, _dir) = build_queue(config).await;

        let id = queue.enqueue(ActionType::FriendRemove, json!({})).await.unwrap();
        // pending 状态不可手动重试
        assert!(!queue.retry_action(&id).await);

        let terminal = queue
            .fail_action(&id, "server error".to_string(), SyncErrorKind::Server)
            .await;
        assert_eq!(terminal, Some(true));
        assert_eq!(queue.stats().await.failed, 1);

        assert!(queue.retry_action(&id).await);
        let stats = queue.stats().await;
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.avg_retry_count, 0.0);
    }

    #[tokio::test]
    async fn test_retry_all_failed() {
        let config = SyncQueueConfig {
            max_retries: 1,
            ..Default::default()
        };
        let (queue, _events, _dir) = build_queue(config).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(queue.enqueue(ActionType::SkinUpdate, json!({})).await.unwrap());
        }
        for id in &ids {
            queue
                .fail_action(id, "network down".to_string(), SyncErrorKind::Network)
                .await;
        }
        assert_eq!(queue.stats().await.failed, 3);

        assert_eq!(queue.retry_all_failed().await, 3);
        assert_eq!(queue.stats().await.pending, 3);
    }

    #[tokio::test]
    async fn test_clear_by_status() {
        let config = SyncQueueConfig {
            max_retries: 1,
            ..Default::default()
        };
        let (queue, _events, _dir) = build_queue(config).await;

        let a = queue.enqueue(ActionType::SkinUpdate, json!({})).await.unwrap();
        let b = queue.enqueue(ActionType::CapeUpdate, json!({})).await.unwrap();
        queue.enqueue(ActionType::FriendRequest, json!({})).await.unwrap();
        queue.complete_action(&a).await;
        queue
            .fail_action(&b, "server 500".to_string(), SyncErrorKind::Server)
            .await;

        assert_eq!(queue.clear_completed().await, 1);
        assert_eq!(queue.clear_failed().await, 1);
        assert_eq!(queue.stats().await.total, 1);
        assert_eq!(queue.clear_all().await, 1);
        assert_eq!(queue.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_eligible_batch_orders_fresh_work_first() {
        let (queue, _events, _dir) = build_queue(SyncQueueConfig {
            backoff_table_ms: vec![0],
            ..Default::default()
        })
        .await;

        let retried = queue.enqueue(ActionType::InstanceUpdate, json!({})).await.unwrap();
        queue
            .fail_action(&retried, "network".to_string(), SyncErrorKind::Network)
            .await;
        let fresh = queue.enqueue(ActionType::SettingsUpdate, json!({})).await.unwrap();

        let batch = queue.eligible_batch(now_ms() + 1, 10).await;
        assert_eq!(batch.len(), 2);
        // 从未失败的动作排在退避回来的动作前面，即便它更年轻
        assert_eq!(batch[0].id, fresh);
        assert_eq!(batch[1].id, retried);
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SyncStore::open(temp_dir.path()).await.unwrap());
        let events = Arc::new(SyncEventBus::new(64));
        let queue = SyncQueue::restore(SyncQueueConfig::default(), store.clone(), events).await;
        let id = queue.enqueue(ActionType::InstanceCreate, json!({"name": "survival"})).await.unwrap();
        drop(queue);

        let events = Arc::new(SyncEventBus::new(64));
        let revived = SyncQueue::restore(SyncQueueConfig::default(), store, events).await;
        let stats = revived.stats().await;
        assert_eq!(stats.total, 1);
        let batch = revived.eligible_batch(now_ms(), 10).await;
        assert_eq!(batch[0].id, id);
    }

    #[tokio::test]
    async fn test_completed_actions_do_not_survive_restart() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SyncStore::open(temp_dir.path()).await.unwrap());
        let events = Arc::new(SyncEventBus::new(64));
        let queue = SyncQueue::restore(SyncQueueConfig::default(), store.clone(), events).await;
        let id = queue.enqueue(ActionType::SkinUpdate, json!({})).await.unwrap();
        queue.complete_action(&id).await;
        drop(queue);

        // 宽限期内进程退出，completed 不应跨重启存活
        let events = Arc::new(SyncEventBus::new(64));
        let revived = SyncQueue::restore(SyncQueueConfig::default(), store, events).await;
        assert_eq!(revived.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_recover_stuck_resets_to_pending() {
        let (queue, _events, _dir) = build_queue(SyncQueueConfig::default()).await;
        let id = queue.enqueue(ActionType::SkinUpdate, json!({})).await.unwrap();
        // 模拟一次很久以前开始、从未结束的尝试
        queue.begin_attempt(&id, now_ms() - 600_000).await;
        assert_eq!(queue.stats().await.processing, 1);

        let recovered = queue.recover_stuck(60_000).await;
        assert_eq!(recovered, 1);
        let batch = queue.eligible_batch(now_ms(), 10).await;
        assert_eq!(batch[0].error.as_deref(), Some("timed out"));
        assert_eq!(batch[0].status, ActionStatus::Pending);
    }

    #[tokio::test]
    async fn test_recent_processing_not_treated_as_stuck() {
        let (queue, _events, _dir) = build_queue(SyncQueueConfig::default()).await;
        let id = queue.enqueue(ActionType::SkinUpdate, json!({})).await.unwrap();
        queue.begin_attempt(&id, now_ms()).await;

        assert_eq!(queue.recover_stuck(60_000).await, 0);
        assert_eq!(queue.stats().await.processing, 1);
    }

    #[tokio::test]
    async fn test_trim_over_cap_only_evicts_completed() {
        let config = SyncQueueConfig {
            max_queue_size: 100,
            hard_cap: 3,
            ..Default::default()
        };
        let (queue, _events, _dir) = build_queue(config).await;

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(queue.enqueue(ActionType::SkinUpdate, json!({})).await.unwrap());
        }
        queue.complete_action(&ids[0]).await;
        queue.complete_action(&ids[1]).await;

        assert_eq!(queue.trim_over_cap().await, 2);
        assert_eq!(queue.stats().await.total, 3);

        // 只剩活跃工作时不再自动淘汰
        assert_eq!(queue.trim_over_cap().await, 0);
    }
}
