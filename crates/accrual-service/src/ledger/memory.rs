//! 内存账本
//!
//! 单把锁保护用户和订单两张表，每个操作在持锁期间完成，
//! 天然满足"状态与余额一起变"的原子性。用于测试和本地演示。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use loyalty_shared::Money;
use loyalty_shared::error::{LoyaltyError, Result};
use parking_lot::Mutex;

use super::traits::{CommitOutcome, OrderLedger, validate_commit};
use crate::models::{Order, OrderStatus, User};

#[derive(Debug, Default)]
struct Tables {
    next_user_id: i64,
    users: HashMap<i64, User>,
    orders: HashMap<String, Order>,
}

/// 内存账本
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    tables: Mutex<Tables>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderLedger for InMemoryLedger {
    async fn get_order(&self, number: &str) -> Result<Option<Order>> {
        Ok(self.tables.lock().orders.get(number).cloned())
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>> {
        Ok(self.tables.lock().users.get(&id).cloned())
    }

    async fn update_order(
        &self,
        number: &str,
        status: OrderStatus,
        accrual: Money,
    ) -> Result<CommitOutcome> {
        validate_commit(number, status, accrual)?;

        let mut tables = self.tables.lock();
        let Tables { users, orders, .. } = &mut *tables;

        let order = orders
            .get_mut(number)
            .ok_or_else(|| LoyaltyError::not_found("order", number))?;
        if order.status.is_terminal() {
            return Ok(CommitOutcome::AlreadyFinal);
        }

        // 先入账再改订单：入账失败（溢出）时两张表都不动
        if status == OrderStatus::Processed {
            let user = users
                .get_mut(&order.user_id)
                .ok_or_else(|| LoyaltyError::not_found("user", order.user_id))?;
            user.balance.deposit(accrual)?;
        }

        order.status = status;
        order.accrual = accrual;
        order.processed_at = Utc::now();

        Ok(CommitOutcome::Committed)
    }

    async fn create_order(&self, number: &str, user_id: i64) -> Result<Order> {
        let mut tables = self.tables.lock();

        if let Some(existing) = tables.orders.get(number) {
            return Err(if existing.user_id == user_id {
                LoyaltyError::OrderAlreadyUploaded {
                    order_number: number.to_string(),
                }
            } else {
                LoyaltyError::OrderOwnedByAnotherUser {
                    order_number: number.to_string(),
                }
            });
        }
        if !tables.users.contains_key(&user_id) {
            return Err(LoyaltyError::not_found("user", user_id));
        }

        let now = Utc::now();
        let order = Order {
            number: number.to_string(),
            user_id,
            status: OrderStatus::New,
            accrual: Money::ZERO,
            submitted_at: now,
            processed_at: now,
        };
        tables.orders.insert(order.number.clone(), order.clone());
        Ok(order)
    }

    async fn create_user(&self, login: &str) -> Result<User> {
        let mut tables = self.tables.lock();

        if tables.users.values().any(|u| u.login == login) {
            return Err(LoyaltyError::Validation(format!("登录名已存在: {login}")));
        }

        tables.next_user_id += 1;
        let user = User {
            id: tables.next_user_id,
            login: login.to_string(),
            balance: Money::ZERO,
            withdrawn: Money::ZERO,
        };
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn list_orders(&self, user_id: i64) -> Result<Vec<Order>> {
        let tables = self.tables.lock();
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(orders)
    }

    async fn list_unfinished_orders(&self) -> Result<Vec<Order>> {
        let tables = self.tables.lock();
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(orders)
    }
}
