//! 订单、用户与管道内任务的数据模型

use std::fmt;

use chrono::{DateTime, Utc};
use loyalty_shared::Money;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// 订单积分状态
///
/// 状态流转：NEW -> {REGISTERED, PROCESSING} -> {PROCESSED, INVALID}。
/// PROCESSED / INVALID 为终态，进入后不再变化。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// 已创建，积分系统尚未确认
    #[default]
    New,
    /// 积分系统已登记，尚未开始计算
    Registered,
    /// 积分系统计算中
    Processing,
    /// 计算完成，积分已入账
    Processed,
    /// 订单不参与积分
    Invalid,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Invalid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Registered => "REGISTERED",
            Self::Processing => "PROCESSING",
            Self::Processed => "PROCESSED",
            Self::Invalid => "INVALID",
        }
    }

    /// 数据库中所有非终态的取值，用于恢复扫描
    pub const UNFINISHED: [OrderStatus; 3] = [Self::New, Self::Registered, Self::Processing];
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 订单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub number: String,
    pub user_id: i64,
    pub status: OrderStatus,
    /// 仅在 PROCESSED 时有意义，其余状态恒为 0
    pub accrual: Money,
    pub submitted_at: DateTime<Utc>,
    /// 最近一次状态变更时间
    pub processed_at: DateTime<Utc>,
}

/// 用户余额视图
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub login: String,
    pub balance: Money,
    pub withdrawn: Money,
}

/// 管道内的积分任务（不落库）
///
/// 同一时刻只归一个 worker 或延时队列所有，通过移动所有权保证
/// 同一订单不会被两个 worker 同时查询。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccrualJob {
    pub order_number: String,
    pub user_id: i64,
    /// 已发起的查询次数（含限流）
    pub attempt: u32,
    /// 其中被限流的次数，不消耗尝试预算
    pub rate_limited: u32,
    /// 最早可再次查询的时间；新任务为 None
    pub next_eligible_at: Option<Instant>,
}

impl AccrualJob {
    pub fn new(order_number: impl Into<String>, user_id: i64) -> Self {
        Self {
            order_number: order_number.into(),
            user_id,
            attempt: 0,
            rate_limited: 0,
            next_eligible_at: None,
        }
    }

    /// 已消耗的尝试预算
    pub fn budget_used(&self) -> u32 {
        self.attempt.saturating_sub(self.rate_limited)
    }

    /// 记录一次查询
    pub fn record_attempt(&mut self, rate_limited: bool) {
        self.attempt += 1;
        if rate_limited {
            self.rate_limited += 1;
        }
    }
}
