//! PostgreSQL 账本
//!
//! 终态提交使用条件更新：只有非终态的订单行会被改动，
//! 改动成功且为 PROCESSED 时才在同一事务里给用户加余额。
//! 重复提交（落库重试、恢复后重新查询）因此不会重复入账。

use async_trait::async_trait;
use loyalty_shared::Money;
use loyalty_shared::error::{LoyaltyError, Result};
use sqlx::PgPool;
use tracing::{debug, info};

use super::traits::{CommitOutcome, OrderLedger, validate_commit};
use crate::models::{Order, OrderStatus, User};

const ORDER_COLUMNS: &str = "number, user_id, status, accrual, submitted_at, processed_at";

/// PostgreSQL 订单账本
#[derive(Clone)]
pub struct PgOrderLedger {
    pool: PgPool,
}

impl PgOrderLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 执行内嵌的数据库迁移
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("数据库迁移完成");
        Ok(())
    }
}

#[async_trait]
impl OrderLedger for PgOrderLedger {
    async fn get_order(&self, number: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE number = $1"
        ))
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, login, balance, withdrawn FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn update_order(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Money,
    ) -> Result<CommitOutcome> {
        validate_commit(number, status, accrual)?;

        // 事务保证订单状态与余额一致
        let mut tx = self.pool.begin().await?;

        // 1. 条件更新订单，终态行不会命中
        let owner: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE orders
            SET status = $2, accrual = $3, processed_at = NOW()
            WHERE number = $1 AND status NOT IN ('PROCESSED', 'INVALID')
            RETURNING user_id
            "#,
        )
        .bind(number)
        .bind(status)
        .bind(accrual)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(user_id) = owner else {
            let exists: Option<String> =
                sqlx::query_scalar("SELECT status FROM orders WHERE number = $1")
                    .bind(number)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;

            return match exists {
                Some(current) => {
                    debug!(order_number = number, current = %current, "订单已是终态，跳过提交");
                    Ok(CommitOutcome::AlreadyFinal)
                }
                None => Err(LoyaltyError::not_found("order", number)),
            };
        };

        // 2. PROCESSED 时入账
        if status == OrderStatus::Processed && !accrual.is_zero() {
            let credited = sqlx::query("UPDATE users SET balance = balance + $2 WHERE id = $1")
                .bind(user_id)
                .bind(accrual)
                .execute(&mut *tx)
                .await?;

            // 未提交的事务在 drop 时回滚
            if credited.rows_affected() == 0 {
                return Err(LoyaltyError::not_found("user", user_id));
            }
        }

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn create_order(&self, number: &str, user_id: i64) -> Result<Order> {
        let inserted = sqlx::query_as::<_, Order>(&format!(
            r#"
            INSERT INTO orders (number, user_id, status, accrual)
            VALUES ($1, $2, 'NEW', 0)
            ON CONFLICT (number) DO NOTHING
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(number)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(order) = inserted {
            return Ok(order);
        }

        let owner: i64 = sqlx::query_scalar("SELECT user_id FROM orders WHERE number = $1")
            .bind(number)
            .fetch_one(&self.pool)
            .await?;

        Err(if owner == user_id {
            LoyaltyError::OrderAlreadyUploaded {
                order_number: number.to_string(),
            }
        } else {
            LoyaltyError::OrderOwnedByAnotherUser {
                order_number: number.to_string(),
            }
        })
    }

    async fn create_user(&self, login: &str) -> Result<User> {
        let result = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (login)
            VALUES ($1)
            RETURNING id, login, balance, withdrawn
            "#,
        )
        .bind(login)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(user) => Ok(user),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(LoyaltyError::Validation(format!("登录名已存在: {login}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_orders(&self, user_id: i64) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            r#"
            SELECT {ORDER_COLUMNS}
            FROM orders
            WHERE user_id = $1
            ORDER BY submitted_at DESC
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }

    async fn list_unfinished_orders(&self) -> Result<Vec<Order>> {
        let orders = sqlx::query_as::<_, Order>(&format!(
            r#"
            SELECT {ORDER_COLUMNS}
            FROM orders
            WHERE status NOT IN ('PROCESSED', 'INVALID')
            ORDER BY submitted_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(orders)
    }
}
