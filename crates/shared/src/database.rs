//! 数据库连接管理模块
//!
//! 提供 PostgreSQL 连接池的创建、健康检查与关闭。

use crate::config::DatabaseConfig;
use crate::error::{LoyaltyError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::{Duration, Instant};
use tracing::{info, instrument};

/// 数据库连接池包装
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 创建数据库连接池
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(
            max_connections = config.max_connections,
            "正在连接数据库..."
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!("数据库连接池已创建");

        Ok(Self { pool })
    }

    /// 获取连接池引用
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 健康检查，返回一次往返耗时
    ///
    /// 启动时先于迁移调用，连接串有误时尽早失败。
    pub async fn health_check(&self) -> Result<Duration> {
        let start = Instant::now();
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(LoyaltyError::from)?;
        Ok(start.elapsed())
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_database_config;

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_database_connection() {
        let db = Database::connect(&test_database_config()).await.unwrap();
        let latency = db.health_check().await.unwrap();
        assert!(latency < Duration::from_secs(5));
        db.close().await;
    }
}
