//! 订单积分处理服务
//!
//! 接收新创建的订单，轮询外部积分计算系统直至得到终态结果，
//! 再把订单状态与用户余额在同一事务中落库。
//! 提交队列有界，队列满时向订单创建方施加背压；等待重试的任务
//! 进入延时队列，不占用 worker。

pub mod backoff;
pub mod client;
pub mod error;
pub mod ledger;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use client::{AccrualClient, FetchResult, HttpAccrualClient};
pub use error::{PipelineError, SubmitError};
pub use ledger::{CommitOutcome, InMemoryLedger, OrderLedger, PgOrderLedger};
pub use models::{AccrualJob, Order, OrderStatus, User};
pub use pipeline::{AccrualPipeline, PipelineStats};
