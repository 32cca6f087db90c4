//! 持久化存储 - 基于 sled 的队列落盘
//!
//! 主副本 + 备份副本双写：主副本每次保存都写，备份约每十次保存刷新一次，
//! 允许落后但不会落后太远。加载时逐字段校验，主副本损坏回退备份，
//! 两份都坏则以空队列冷启动，永不向上抛错（fail-open）。

use serde::{Deserialize, Serialize};
use sled::Db;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::action::{now_ms, ActionStatus, ActionType, SyncAction};
use crate::error::{CraftSyncError, Result};

const PRIMARY_KEY: &[u8] = b"sync:queue";
const BACKUP_KEY: &[u8] = b"sync:queue:backup";

/// 备份刷新概率：备份"最终一致、尽力而为"，不保证比几十次保存更新
const BACKUP_REFRESH_PROBABILITY: f64 = 0.1;

/// 主存储布局
#[derive(Debug, Serialize, Deserialize)]
struct PersistedQueue {
    actions: Vec<SyncAction>,
    last_sync_time: Option<u64>,
}

/// 备份存储布局（多一个备份时间戳）
#[derive(Debug, Serialize, Deserialize)]
struct PersistedBackup {
    actions: Vec<SyncAction>,
    last_sync_time: Option<u64>,
    backed_up_at: u64,
}

/// 加载来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    Backup,
    Empty,
}

/// 加载结果 - 永远可用，损坏信息随结果返回
#[derive(Debug)]
pub struct LoadOutcome {
    pub actions: Vec<SyncAction>,
    pub last_sync_time: Option<u64>,
    pub source: LoadSource,
    /// 主副本曾损坏（含回退备份成功的情况）
    pub corrupted: bool,
    /// 重启时从 processing 强制复位的动作数
    pub interrupted: usize,
}

/// 保存结果 - 持久化失败不是致命错误，由调用方决定如何上报
#[derive(Debug, Default)]
pub struct SaveReport {
    pub success: bool,
    /// 配额清理时被永久丢弃的动作 ID（只会是 completed / 最旧的 failed）
    pub pruned: Vec<String>,
    pub error: Option<String>,
}

/// 持久化存储组件
#[derive(Debug)]
pub struct SyncStore {
    db: Db,
}

impl SyncStore {
    /// 打开存储（上一实例可能刚释放锁，重试多次带退避）
    pub async fn open(base_path: &Path) -> Result<Self> {
        let store_path = base_path.join("syncqueue");

        tokio::fs::create_dir_all(&store_path)
            .await
            .map_err(|e| CraftSyncError::IO(format!("创建存储目录失败: {}", e)))?;

        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&store_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            CraftSyncError::Storage(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        Ok(Self { db })
    }

    /// 加载队列状态
    ///
    /// 校验失败整份丢弃并回退备份；两份都不可用则冷启动空队列。
    /// 任何 processing 状态的动作强制复位为 pending（带 "interrupted by restart"）。
    pub fn load(&self) -> LoadOutcome {
        let mut corrupted = false;

        let primary = self
            .db
            .get(PRIMARY_KEY)
            .ok()
            .flatten()
            .and_then(|bytes| Self::decode_and_validate(&bytes));

        let (mut actions, last_sync_time, source) = match primary {
            Some(queue) => (queue.actions, queue.last_sync_time, LoadSource::Primary),
            None => {
                let primary_present = matches!(self.db.get(PRIMARY_KEY), Ok(Some(_)));
                if primary_present {
                    warn!("主副本校验失败，尝试从备份恢复");
                    corrupted = true;
                }

                let backup = self
                    .db
                    .get(BACKUP_KEY)
                    .ok()
                    .flatten()
                    .and_then(|bytes| Self::decode_and_validate(&bytes));

                match backup {
                    Some(queue) => {
                        info!("已从备份副本恢复 {} 条动作", queue.actions.len());
                        (queue.actions, queue.last_sync_time, LoadSource::Backup)
                    }
                    None => {
                        if corrupted {
                            error!("主副本与备份均不可用，以空队列冷启动");
                        }
                        (Vec::new(), None, LoadSource::Empty)
                    }
                }
            }
        };

        let mut interrupted = 0;
        for action in actions.iter_mut() {
            if action.status == ActionStatus::Processing {
                action.mark_interrupted();
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            warn!("复位 {} 条重启前处于 processing 的动作", interrupted);
        }

        LoadOutcome {
            actions,
            last_sync_time,
            source,
            corrupted,
            interrupted,
        }
    }

    /// 解码并逐字段校验；任何一条记录非法则整份作废
    fn decode_and_validate(bytes: &[u8]) -> Option<PersistedQueue> {
        let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
        let records = value.get("actions")?.as_array()?;

        for record in records {
            if !Self::validate_record(record) {
                debug!("发现非法记录，丢弃整份存储: {}", record);
                return None;
            }
        }

        serde_json::from_value(value).ok()
    }

    /// 单条记录的必要字段校验
    fn validate_record(record: &serde_json::Value) -> bool {
        let id_ok = record
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        let type_ok = record
            .get("action_type")
            .and_then(|v| v.as_str())
            .map(ActionType::is_valid_tag)
            .unwrap_or(false);
        let status_ok = record
            .get("status")
            .and_then(|v| v.as_str())
            .map(ActionStatus::is_valid_tag)
            .unwrap_or(false);
        let timestamp_ok = record
            .get("timestamp")
            .map(|v| v.is_u64())
            .unwrap_or(false);
        let retry_ok = record
            .get("retry_count")
            .map(|v| v.is_u64())
            .unwrap_or(false);

        id_ok && type_ok && status_ok && timestamp_ok && retry_ok
    }

    /// 保存队列状态
    ///
    /// 配额不足时先丢弃全部 completed 再试；仍不足则丢弃最旧的一半 failed
    /// 再试最后一次。pending/processing 永不在此丢弃。
    pub fn save(&self, actions: &[SyncAction], last_sync_time: Option<u64>) -> SaveReport {
        match self.write_primary(actions, last_sync_time) {
            Ok(()) => {
                if rand::random::<f64>() < BACKUP_REFRESH_PROBABILITY {
                    self.refresh_backup(actions, last_sync_time);
                }
                SaveReport {
                    success: true,
                    ..Default::default()
                }
            }
            Err(e) if Self::is_quota_error(&e) => {
                warn!("存储配额不足，开始清理: {}", e);

                let (remaining, mut pruned) = drop_completed(actions);
                if let Ok(()) = self.write_primary(&remaining, last_sync_time) {
                    info!("丢弃 {} 条 completed 后保存成功", pruned.len());
                    self.refresh_backup(&remaining, last_sync_time);
                    return SaveReport {
                        success: true,
                        pruned,
                        error: None,
                    };
                }

                let (remaining, pruned_failed) = drop_oldest_failed_half(&remaining);
                pruned.extend(pruned_failed);
                match self.write_primary(&remaining, last_sync_time) {
                    Ok(()) => {
                        info!("配额清理后保存成功，共丢弃 {} 条历史动作", pruned.len());
                        self.refresh_backup(&remaining, last_sync_time);
                        SaveReport {
                            success: true,
                            pruned,
                            error: None,
                        }
                    }
                    Err(e) => {
                        error!("配额清理后保存仍失败: {}", e);
                        SaveReport {
                            success: false,
                            pruned: Vec::new(),
                            error: Some(e.to_string()),
                        }
                    }
                }
            }
            Err(e) => {
                error!("保存队列失败: {}", e);
                SaveReport {
                    success: false,
                    pruned: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn write_primary(&self, actions: &[SyncAction], last_sync_time: Option<u64>) -> Result<()> {
        let blob = serde_json::to_vec(&PersistedQueue {
            actions: actions.to_vec(),
            last_sync_time,
        })?;
        self.db.insert(PRIMARY_KEY, blob)?;
        self.db.flush()?;
        Ok(())
    }

    /// 刷新备份副本；备份失败只记日志，不影响主流程
    fn refresh_backup(&self, actions: &[SyncAction], last_sync_time: Option<u64>) {
        let blob = match serde_json::to_vec(&PersistedBackup {
            actions: actions.to_vec(),
            last_sync_time,
            backed_up_at: now_ms(),
        }) {
            Ok(blob) => blob,
            Err(e) => {
                warn!("备份序列化失败: {}", e);
                return;
            }
        };
        if let Err(e) = self.db.insert(BACKUP_KEY, blob) {
            warn!("备份写入失败: {}", e);
        }
    }

    fn is_quota_error(error: &CraftSyncError) -> bool {
        let msg = error.to_string().to_lowercase();
        msg.contains("no space") || msg.contains("quota") || msg.contains("disk full")
    }

    #[cfg(test)]
    fn put_raw(&self, key: &[u8], bytes: &[u8]) {
        self.db.insert(key, bytes).unwrap();
        self.db.flush().unwrap();
    }
}

/// 丢弃所有 completed，返回（剩余, 被丢弃的 ID）
fn drop_completed(actions: &[SyncAction]) -> (Vec<SyncAction>, Vec<String>) {
    let mut remaining = Vec::with_capacity(actions.len());
    let mut pruned = Vec::new();
    for action in actions {
        if action.status == ActionStatus::Completed {
            pruned.push(action.id.clone());
        } else {
            remaining.push(action.clone());
        }
    }
    (remaining, pruned)
}

/// 丢弃最旧的一半 failed，返回（剩余, 被丢弃的 ID）
fn drop_oldest_failed_half(actions: &[SyncAction]) -> (Vec<SyncAction>, Vec<String>) {
    let mut failed: Vec<&SyncAction> = actions
        .iter()
        .filter(|a| a.status == ActionStatus::Failed)
        .collect();
    failed.sort_by_key(|a| a.timestamp);

    let drop_count = failed.len() / 2;
    let doomed: std::collections::HashSet<String> = failed
        .iter()
        .take(drop_count)
        .map(|a| a.id.clone())
        .collect();

    let mut remaining = Vec::with_capacity(actions.len());
    let mut pruned = Vec::new();
    for action in actions {
        if doomed.contains(&action.id) {
            pruned.push(action.id.clone());
        } else {
            remaining.push(action.clone());
        }
    }
    (remaining, pruned)
}
