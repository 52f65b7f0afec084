//! 账本 Trait 定义

use async_trait::async_trait;
use loyalty_shared::Money;
use loyalty_shared::error::Result;

use crate::models::{Order, OrderStatus, User};

/// 终态提交结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// 状态已写入，PROCESSED 时积分已入账
    Committed,
    /// 订单此前已是终态，本次未做任何修改
    AlreadyFinal,
}

/// 订单账本接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderLedger: Send + Sync {
    async fn get_order(&self, number: &str) -> Result<Option<Order>>;

    async fn get_user(&self, id: i64) -> Result<Option<User>>;

    /// 原子地写入终态，并在 PROCESSED 时把 accrual 计入订单所属用户的余额
    ///
    /// 只有订单仍处于非终态时才会生效；未知订单返回 `NotFound`。
    async fn update_order(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Money,
    ) -> Result<CommitOutcome>;

    /// 登记新订单（状态 NEW）
    ///
    /// 订单号已存在时：同一用户返回 `OrderAlreadyUploaded`，
    /// 其他用户返回 `OrderOwnedByAnotherUser`。
    async fn create_order(&self, number: &str, user_id: i64) -> Result<Order>;

    async fn create_user(&self, login: &str) -> Result<User>;

    /// 用户的订单，按上传时间倒序
    async fn list_orders(&self, user_id: i64) -> Result<Vec<Order>>;

    /// 所有非终态订单，按上传时间正序，用于启动时恢复
    async fn list_unfinished_orders(&self) -> Result<Vec<Order>>;
}

/// 终态写入前的参数校验，两种实现共用
pub(crate) fn validate_commit(number: &str, status: OrderStatus, accrual: Money) -> Result<()> {
    use loyalty_shared::error::LoyaltyError;

    if !status.is_terminal() {
        return Err(LoyaltyError::Validation(format!(
            "订单 {number} 只能提交终态, 收到 {status}"
        )));
    }
    if status != OrderStatus::Processed && !accrual.is_zero() {
        return Err(LoyaltyError::Validation(format!(
            "订单 {number} 状态为 {status} 时积分必须为 0"
        )));
    }
    Ok(())
}
