//! 统一错误处理模块
//!
//! 定义账本、配置与外部服务交互中共享的错误类型，使用 thiserror 提供可读的错误信息。

use thiserror::Error;

use crate::money::MoneyError;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum LoyaltyError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    // ==================== 订单错误 ====================
    /// 同一用户重复上传同一订单号
    #[error("订单已由当前用户上传: {order_number}")]
    OrderAlreadyUploaded { order_number: String },

    /// 订单号已被其他用户占用
    #[error("订单已被其他用户上传: {order_number}")]
    OrderOwnedByAnotherUser { order_number: String },

    // ==================== 金额错误 ====================
    #[error(transparent)]
    Money(#[from] MoneyError),

    // ==================== 验证错误 ====================
    #[error("参数验证失败: {0}")]
    Validation(String),

    // ==================== 外部服务错误 ====================
    #[error("外部服务错误: {service} - {message}")]
    ExternalService { service: String, message: String },
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, LoyaltyError>;

impl LoyaltyError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::OrderAlreadyUploaded { .. } => "ORDER_ALREADY_UPLOADED",
            Self::OrderOwnedByAnotherUser { .. } => "ORDER_OWNED_BY_ANOTHER_USER",
            Self::Money(MoneyError::Underflow { .. }) => "INSUFFICIENT_BALANCE",
            Self::Money(_) => "INVALID_AMOUNT",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有连接层面的瞬时故障值得重试；约束冲突等业务错误重试也不会成功。
    pub fn is_retryable(&self) -> bool {
        match self {
            // 数据库返回的错误中只有非约束类（死锁、序列化冲突等）可以重试
            Self::Database(sqlx::Error::Database(db)) => {
                matches!(db.kind(), sqlx::error::ErrorKind::Other)
            }
            Self::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::Decode(_)
                    | sqlx::Error::TypeNotFound { .. }
            ),
            _ => false,
        }
    }

    /// 构造外部服务错误
    pub fn external(service: &str, message: impl ToString) -> Self {
        Self::ExternalService {
            service: service.to_string(),
            message: message.to_string(),
        }
    }

    /// 构造记录未找到错误
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}
