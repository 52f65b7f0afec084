//! 积分管道错误类型
//!
//! 在共享库 LoyaltyError 基础上定义管道特有的错误。
//! 轮询过程中的可恢复结果（未登记、限流、瞬时错误）都在 worker 内部消化，
//! 不会出现在这里；这里只有生命周期、提交背压和落库失败。

use loyalty_shared::error::LoyaltyError;

use crate::models::AccrualJob;

/// 管道错误
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// start 被重复调用
    #[error("积分管道已启动")]
    AlreadyStarted,

    /// 在 start 之前提交或停止
    #[error("积分管道尚未启动")]
    NotStarted,

    /// 终态结果在用尽落库重试后仍未写入账本
    #[error("订单 {order_number} 终态落库失败: {source}")]
    LedgerCommitFailed {
        order_number: String,
        #[source]
        source: LoyaltyError,
    },

    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// 透传共享库错误
    #[error(transparent)]
    Shared(#[from] LoyaltyError),
}

/// 提交失败
///
/// 两种情况都把任务原样交还给调用方，任务绝不会被静默丢弃。
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// 在调用方给定的期限内队列一直是满的
    #[error("提交队列已满，等待超时: order={}", .0.order_number)]
    DeadlineElapsed(AccrualJob),

    /// 管道已停止接收新任务
    #[error("积分管道已关闭: order={}", .0.order_number)]
    Closed(AccrualJob),
}

impl SubmitError {
    /// 取回未能入队的任务
    pub fn into_job(self) -> AccrualJob {
        match self {
            Self::DeadlineElapsed(job) | Self::Closed(job) => job,
        }
    }
}
