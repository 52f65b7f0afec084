//! 定点金额类型
//!
//! 所有积分/余额一律以最小货币单位（分）的 i64 表示，贯穿传输、存储和运算，
//! 不再在各层之间用浮点数做 ×100 / ÷100 的临时换算。
//! 与外部表示（十进制字符串、积分系统返回的 JSON 数字）的换算只发生在
//! `from_major_units` / `from_decimal` 这一处边界。

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 主单位保留的小数位数
const MINOR_DIGITS: u32 = 2;

/// 金额运算错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoneyError {
    #[error("无效的金额格式: {0}")]
    InvalidFormat(String),

    #[error("金额不能为负数: {0}")]
    Negative(String),

    #[error("金额溢出")]
    Overflow,

    /// 扣减后余额为负
    #[error("余额不足: 当前 {balance} 分, 需要扣减 {amount} 分")]
    Underflow { balance: i64, amount: i64 },
}

/// 金额（最小货币单位计数）
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor_units(minor: i64) -> Self {
        Self(minor)
    }

    pub const fn minor_units(self) -> i64 {
        self.0
    }

    /// 解析主单位的十进制字符串，如 "12.50" -> 1250 分
    ///
    /// 超过两位的小数按四舍五入（远离零）处理，负数与非数字输入直接拒绝。
    pub fn from_major_units(input: &str) -> Result<Self, MoneyError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(MoneyError::InvalidFormat(input.to_string()));
        }

        let value =
            Decimal::from_str(trimmed).map_err(|_| MoneyError::InvalidFormat(input.to_string()))?;

        Self::from_decimal(value).map_err(|e| match e {
            MoneyError::Negative(_) => MoneyError::Negative(input.to_string()),
            other => other,
        })
    }

    /// 十进制主单位 -> 分
    pub fn from_decimal(value: Decimal) -> Result<Self, MoneyError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(MoneyError::Negative(value.to_string()));
        }

        let rounded = value.round_dp_with_strategy(MINOR_DIGITS, RoundingStrategy::MidpointAwayFromZero);
        let minor = rounded
            .checked_mul(Decimal::ONE_HUNDRED)
            .and_then(|v| v.to_i64())
            .ok_or(MoneyError::Overflow)?;

        Ok(Self(minor))
    }

    /// 分 -> 十进制主单位
    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, MINOR_DIGITS)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Money) -> Result<Money, MoneyError> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    /// 余额扣减，结果为负时返回 `Underflow`
    pub fn checked_sub(self, other: Money) -> Result<Money, MoneyError> {
        if other.0 > self.0 {
            return Err(MoneyError::Underflow {
                balance: self.0,
                amount: other.0,
            });
        }
        self.0
            .checked_sub(other.0)
            .map(Money)
            .ok_or(MoneyError::Overflow)
    }

    /// 原地扣减；失败时 self 保持不变
    pub fn withdraw(&mut self, amount: Money) -> Result<(), MoneyError> {
        *self = self.checked_sub(amount)?;
        Ok(())
    }

    /// 原地入账；失败时 self 保持不变
    pub fn deposit(&mut self, amount: Money) -> Result<(), MoneyError> {
        *self = self.checked_add(amount)?;
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_major_units(s)
    }
}
