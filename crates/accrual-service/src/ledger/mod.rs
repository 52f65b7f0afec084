//! 订单账本
//!
//! 持久化订单与用户余额，是积分管道唯一触碰的共享可变资源。
//!
//! ## 约定
//!
//! - 余额只通过 `update_order` 变动，订单状态与余额在同一事务中提交
//! - 终态订单不可再变，重复提交返回 `CommitOutcome::AlreadyFinal`
//! - 非终态（REGISTERED / PROCESSING）不写入账本
//! - 定义 trait 接口以支持 mock 测试

mod memory;
mod postgres;
mod traits;

pub use memory::InMemoryLedger;
pub use postgres::PgOrderLedger;
pub use traits::*;
