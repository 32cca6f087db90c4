use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 当前毫秒时间戳
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// 生成动作 ID：毫秒时间戳 + 随机十六进制后缀，创建后不可变
pub(crate) fn generate_action_id() -> String {
    format!("{}-{:08x}", now_ms(), rand::random::<u32>())
}

/// 同步动作类型 - 封闭集合
///
/// 类型只决定执行器如何解释 payload，队列本身不理解 payload 内容。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    /// 创建游戏实例
    InstanceCreate,
    /// 更新游戏实例
    InstanceUpdate,
    /// 删除游戏实例
    InstanceDelete,
    /// 更新用户设置
    SettingsUpdate,
    /// 更新皮肤
    SkinUpdate,
    /// 更新披风
    CapeUpdate,
    /// 发起好友请求
    FriendRequest,
    /// 接受好友请求
    FriendAccept,
    /// 删除好友
    FriendRemove,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::InstanceCreate => "instance-create",
            ActionType::InstanceUpdate => "instance-update",
            ActionType::InstanceDelete => "instance-delete",
            ActionType::SettingsUpdate => "settings-update",
            ActionType::SkinUpdate => "skin-update",
            ActionType::CapeUpdate => "cape-update",
            ActionType::FriendRequest => "friend-request",
            ActionType::FriendAccept => "friend-accept",
            ActionType::FriendRemove => "friend-remove",
        }
    }

    /// 校验持久化数据中的类型标签是否属于封闭集合
    pub fn is_valid_tag(tag: &str) -> bool {
        matches!(
            tag,
            "instance-create"
                | "instance-update"
                | "instance-delete"
                | "settings-update"
                | "skin-update"
                | "cape-update"
                | "friend-request"
                | "friend-accept"
                | "friend-remove"
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 动作状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// 等待同步
    Pending,
    /// 正在同步
    Processing,
    /// 同步完成
    Completed,
    /// 同步失败（重试耗尽，等待手动重试）
    Failed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::Processing => "processing",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
        }
    }

    pub fn is_valid_tag(tag: &str) -> bool {
        matches!(tag, "pending" | "processing" | "completed" | "failed")
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStatus::Pending => write!(f, "等待同步"),
            ActionStatus::Processing => write!(f, "正在同步"),
            ActionStatus::Completed => write!(f, "同步完成"),
            ActionStatus::Failed => write!(f, "同步失败"),
        }
    }
}

/// 失败原因分类
///
/// 所有分类走同一张退避表，分类只用于展示和诊断。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncErrorKind {
    /// 网络不可达
    Network,
    /// 执行超时
    Timeout,
    /// 服务端错误 (5xx)
    Server,
    /// 认证失败
    Auth,
    /// 数据冲突 (409)
    Conflict,
    /// 未知错误
    Unknown,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::Network => "network",
            SyncErrorKind::Timeout => "timeout",
            SyncErrorKind::Server => "server",
            SyncErrorKind::Auth => "auth",
            SyncErrorKind::Conflict => "conflict",
            SyncErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 错误消息子串分类 - 唯一的分类入口
///
/// 执行器契约是文本的：错误消息里应带有可识别的子串。
/// 这里集中所有匹配规则，将来换成类型化错误契约时只改这一处。
pub fn classify_error(message: &str) -> SyncErrorKind {
    let msg = message.to_lowercase();

    if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline") {
        SyncErrorKind::Timeout
    } else if msg.contains("network")
        || msg.contains("connection")
        || msg.contains("dns")
        || msg.contains("unreachable")
        || msg.contains("offline")
        || msg.contains("fetch")
    {
        SyncErrorKind::Network
    } else if msg.contains("auth")
        || msg.contains("unauthorized")
        || msg.contains("forbidden")
        || msg.contains("401")
        || msg.contains("403")
        || msg.contains("token")
    {
        SyncErrorKind::Auth
    } else if msg.contains("conflict") || msg.contains("409") {
        SyncErrorKind::Conflict
    } else if msg.contains("server")
        || msg.contains("500")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("5xx")
        || msg.contains("internal")
    {
        SyncErrorKind::Server
    } else {
        SyncErrorKind::Unknown
    }
}

/// 同步动作 - 一条等待远端重放的变更
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAction {
    /// 唯一标识，创建后不可变
    pub id: String,
    /// 动作类型
    pub action_type: ActionType,
    /// 重放所需的数据，对队列不透明
    pub payload: Value,
    /// 创建时间戳（毫秒），用于 FIFO 排序和按龄淘汰
    pub timestamp: u64,
    /// 已失败的尝试次数，仅手动重试时归零
    pub retry_count: u32,
    /// 当前状态
    pub status: ActionStatus,
    /// 最近一次失败的错误消息
    pub error: Option<String>,
    /// 最近一次失败的分类
    pub error_kind: Option<SyncErrorKind>,
    /// 最近一次执行尝试的时间戳（毫秒）
    pub last_attempt: Option<u64>,
    /// 退避门：在此时间戳之前不再参与处理
    pub next_retry_at: Option<u64>,
}

impl SyncAction {
    /// 创建新动作，初始为 pending
    pub fn new(action_type: ActionType, payload: Value) -> Self {
        Self {
            id: generate_action_id(),
            action_type,
            payload,
            timestamp: now_ms(),
            retry_count: 0,
            status: ActionStatus::Pending,
            error: None,
            error_kind: None,
            last_attempt: None,
            next_retry_at: None,
        }
    }

    /// 是否可参与处理：pending/failed、退避门已过、重试未耗尽
    ///
    /// 重试耗尽的 failed 动作只能通过手动重试回到队列。
    pub fn is_eligible(&self, now: u64, max_retries: u32) -> bool {
        if !matches!(self.status, ActionStatus::Pending | ActionStatus::Failed) {
            return false;
        }
        if self.retry_count >= max_retries {
            return false;
        }
        match self.next_retry_at {
            Some(gate) => now >= gate,
            None => true,
        }
    }

    /// 标记为正在处理并记录尝试时间
    pub fn mark_processing(&mut self, now: u64) {
        self.status = ActionStatus::Processing;
        self.last_attempt = Some(now);
    }

    /// 标记为完成并清空错误字段
    pub fn mark_completed(&mut self) {
        self.status = ActionStatus::Completed;
        self.error = None;
        self.error_kind = None;
        self.next_retry_at = None;
    }

    /// 重启恢复：processing 状态不允许跨进程存活
    pub fn mark_interrupted(&mut self) {
        self.status = ActionStatus::Pending;
        self.error = Some("interrupted by restart".to_string());
        self.next_retry_at = None;
    }

    /// 健康检查恢复：卡死的 processing 动作回到 pending
    pub fn mark_stuck_reset(&mut self) {
        self.status = ActionStatus::Pending;
        self.error = Some("timed out".to_string());
        self.error_kind = Some(SyncErrorKind::Timeout);
        self.next_retry_at = None;
    }

    /// 手动重试：重置计数与错误，回到初始 pending
    pub fn reset_for_manual_retry(&mut self) {
        self.status = ActionStatus::Pending;
        self.retry_count = 0;
        self.error = None;
        self.error_kind = None;
        self.next_retry_at = None;
    }

    /// 记录一次失败尝试
    ///
    /// 未耗尽重试：回到 pending 并设置退避门 `now + backoff_table_ms[retry_count-1]`
    /// （超出表长取最后一项）；耗尽：转为 failed 终态，返回 true。
    pub fn record_failure(
        &mut self,
        error: String,
        kind: SyncErrorKind,
        max_retries: u32,
        backoff_table_ms: &[u64],
        now: u64,
    ) -> bool {
        self.retry_count += 1;
        self.error = Some(error);
        self.error_kind = Some(kind);

        if self.retry_count < max_retries {
            let delay = if backoff_table_ms.is_empty() {
                0
            } else {
                let index = (self.retry_count as usize - 1).min(backoff_table_ms.len() - 1);
                backoff_table_ms[index]
            };
            self.next_retry_at = Some(now + delay);
            self.status = ActionStatus::Pending;
            false
        } else {
            self.status = ActionStatus::Failed;
            self.next_retry_at = None;
            true
        }
    }

    /// 动作年龄（毫秒）
    pub fn age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.timestamp)
    }
}
