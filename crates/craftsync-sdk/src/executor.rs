use async_trait::async_trait;

use crate::action::SyncAction;
use crate::error::Result;

/// 动作执行器 - 队列把一次远端重放当作单个不透明调用
///
/// 契约：
/// - 每次调用只代表一次尝试，实现方不得自行重试；
/// - 返回 `Ok(true)` 表示成功，`Ok(false)` 与 `Err` 都按失败处理；
/// - 失败分类靠错误消息子串（timeout / network / auth / conflict / server），
///   实现方的错误消息应包含可识别的字样；
/// - 超时后队列会放弃等待，调用可能仍在后台运行，实现必须可安全丢弃。
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &SyncAction) -> Result<bool>;
}
