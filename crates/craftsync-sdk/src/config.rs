use serde::{Deserialize, Serialize};

/// 同步队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueConfig {
    /// 入队容量上限，到达后先淘汰 completed，仍满则拒绝（背压）
    pub max_queue_size: usize,
    /// 健康检查硬上限，超过只淘汰最旧的 completed
    pub hard_cap: usize,
    /// 单轮处理的最大动作数
    pub batch_size: usize,
    /// 剩余工作的续批延迟（毫秒）
    pub batch_follow_up_delay_ms: u64,
    /// 单个动作的执行超时（毫秒）
    pub action_timeout_ms: u64,
    /// 完成后保留在队列中的宽限时间（毫秒），让观察者渲染"已同步"过渡
    pub completed_grace_ms: u64,
    /// 批内相邻动作之间的间隔（毫秒）
    pub inter_action_delay_ms: u64,
    /// 单轮处理的墙钟上限（毫秒），超过则提前收束
    pub run_time_ceiling_ms: u64,
    /// 入队触发处理的防抖窗口（毫秒），合并突发入队
    pub enqueue_debounce_ms: u64,
    /// 恢复在线后的静置延迟（毫秒）
    pub online_settle_ms: u64,
    /// 健康检查周期（毫秒）
    pub health_check_interval_ms: u64,
    /// 自动重试次数上限
    pub max_retries: u32,
    /// 退避延迟表（毫秒），按 retry_count 索引，超出取最后一项
    pub backoff_table_ms: Vec<u64>,
}

impl Default for SyncQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 200,
            hard_cap: 500,
            batch_size: 50,
            batch_follow_up_delay_ms: 30_000,
            action_timeout_ms: 30_000,
            completed_grace_ms: 5_000,
            inter_action_delay_ms: 1_000,
            run_time_ceiling_ms: 300_000,
            enqueue_debounce_ms: 500,
            online_settle_ms: 2_000,
            health_check_interval_ms: 30_000,
            max_retries: 5,
            backoff_table_ms: vec![1_000, 5_000, 15_000, 60_000, 300_000],
        }
    }
}

impl SyncQueueConfig {
    /// 卡死判定阈值：超过两倍动作超时仍在 processing 即视为卡死
    pub fn stuck_threshold_ms(&self) -> u64 {
        self.action_timeout_ms * 2
    }
}
