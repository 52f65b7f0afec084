//! 共享库
//!
//! 积分系统各组件共用的基础设施：配置加载、统一错误、定点金额、
//! 数据库连接池、通用重试执行器以及日志/指标初始化。

pub mod config;
pub mod database;
pub mod error;
pub mod money;
pub mod observability;
pub mod retry;
pub mod test_utils;

pub use money::{Money, MoneyError};
