//! 积分计算系统 HTTP 客户端
//!
//! 每次调用只发一次 `GET /api/orders/{number}`，不在内部重试：
//! 重试节奏由 `backoff` 决定，这样重试语义可以脱离网络单独测试。
//! 所有响应都被归类为四种结果之一，无法归类的一律视为瞬时错误。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use loyalty_shared::Money;
use loyalty_shared::config::AccrualConfig;
use loyalty_shared::error::LoyaltyError;
use loyalty_shared::observability::metrics;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::models::OrderStatus;

/// 429 未携带（或携带了无法解析的）Retry-After 时的等待时间
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// 错误中使用的外部服务名
const ACCRUAL_SERVICE: &str = "accrual";

/// 积分系统自己的状态词汇
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OracleStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

impl OracleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Invalid | Self::Processed)
    }
}

impl From<OracleStatus> for OrderStatus {
    fn from(status: OracleStatus) -> Self {
        match status {
            OracleStatus::Registered => OrderStatus::Registered,
            OracleStatus::Processing => OrderStatus::Processing,
            OracleStatus::Invalid => OrderStatus::Invalid,
            OracleStatus::Processed => OrderStatus::Processed,
        }
    }
}

/// 积分系统对单个订单给出的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccrualOutcome {
    pub order_number: String,
    pub status: OracleStatus,
    /// 仅 PROCESSED 时非零
    pub accrual: Money,
}

/// 一次查询的归类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    /// 200，结果可用（可能仍是非终态）
    Ready(AccrualOutcome),
    /// 204，订单尚未到达积分系统
    NotRegisteredYet,
    /// 429，必须等待给定时长
    RateLimited(Duration),
    /// 网络错误、超时、意外状态码或无法解析的响应体
    TransientError(String),
}

impl FetchResult {
    /// 指标标签
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready(_) => "ready",
            Self::NotRegisteredYet => "not_registered",
            Self::RateLimited(_) => "rate_limited",
            Self::TransientError(_) => "transient",
        }
    }
}

/// 积分系统客户端抽象，便于测试时注入脚本化实现
#[async_trait]
pub trait AccrualClient: Send + Sync {
    async fn fetch(&self, order_number: &str) -> FetchResult;
}

/// 积分系统响应体
#[derive(Debug, Deserialize)]
struct OracleResponse {
    order: String,
    status: OracleStatus,
    #[serde(default)]
    accrual: Option<Decimal>,
}

/// 基于 reqwest 的客户端
///
/// reqwest::Client 内部带连接池，所有 worker 共享同一个实例。
pub struct HttpAccrualClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAccrualClient {
    /// 构造失败（TLS 后端初始化等）时返回 `ExternalService` 错误
    pub fn new(config: &AccrualConfig) -> Result<Self, LoyaltyError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| {
                LoyaltyError::external(ACCRUAL_SERVICE, format!("创建 HTTP 客户端失败: {e}"))
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn order_url(&self, order_number: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, order_number)
    }

    async fn lookup(&self, order_number: &str) -> FetchResult {
        let response = match self.http.get(self.order_url(order_number)).send().await {
            Ok(resp) => resp,
            Err(e) => return FetchResult::TransientError(format!("请求积分系统失败: {e}")),
        };

        match response.status() {
            StatusCode::OK => match response.bytes().await {
                Ok(body) => match parse_outcome(order_number, &body) {
                    Ok(outcome) => FetchResult::Ready(outcome),
                    Err(reason) => FetchResult::TransientError(reason),
                },
                Err(e) => FetchResult::TransientError(format!("读取响应体失败: {e}")),
            },
            StatusCode::NO_CONTENT => FetchResult::NotRegisteredYet,
            StatusCode::TOO_MANY_REQUESTS => {
                let advised = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok());
                FetchResult::RateLimited(parse_retry_after(advised))
            }
            other => FetchResult::TransientError(format!("积分系统返回意外状态码: {other}")),
        }
    }
}

#[async_trait]
impl AccrualClient for HttpAccrualClient {
    async fn fetch(&self, order_number: &str) -> FetchResult {
        let start = Instant::now();
        let result = self.lookup(order_number).await;
        metrics::record_oracle_request(result.kind(), start.elapsed().as_secs_f64());

        match &result {
            FetchResult::TransientError(reason) => {
                warn!(order_number, reason = %reason, "积分系统查询失败");
            }
            other => {
                debug!(order_number, result = other.kind(), "积分系统查询完成");
            }
        }

        result
    }
}

/// 解析 Retry-After（秒）
///
/// 缺失、为空或不是非负整数时回落到 60 秒。
pub fn parse_retry_after(value: Option<&str>) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// 解析 200 响应体
///
/// 金额在这里从积分系统的十进制数字换算为分，这是唯一的换算入口。
pub fn parse_outcome(order_number: &str, body: &[u8]) -> Result<AccrualOutcome, String> {
    let response: OracleResponse =
        serde_json::from_slice(body).map_err(|e| format!("无法解析积分系统响应: {e}"))?;

    if response.order != order_number {
        return Err(format!(
            "积分系统返回了其他订单: 期望 {order_number}, 实际 {}",
            response.order
        ));
    }

    let accrual = match (response.status, response.accrual) {
        (OracleStatus::Processed, Some(amount)) => {
            Money::from_decimal(amount).map_err(|e| format!("积分金额无效: {e}"))?
        }
        _ => Money::ZERO,
    };

    Ok(AccrualOutcome {
        order_number: response.order,
        status: response.status,
        accrual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(Some("30")), Duration::from_secs(30));
        assert_eq!(parse_retry_after(Some(" 5 ")), Duration::from_secs(5));
        assert_eq!(parse_retry_after(None), DEFAULT_RETRY_AFTER);
        assert_eq!(parse_retry_after(Some("")), DEFAULT_RETRY_AFTER);
        assert_eq!(parse_retry_after(Some("soon")), DEFAULT_RETRY_AFTER);
        assert_eq!(parse_retry_after(Some("-1")), DEFAULT_RETRY_AFTER);
    }

    #[test]
    fn test_parse_processed_outcome() {
        let body = br#"{"order":"12345678903","status":"PROCESSED","accrual":729.98}"#;
        let outcome = parse_outcome("12345678903", body).unwrap();

        assert_eq!(outcome.status, OracleStatus::Processed);
        assert_eq!(outcome.accrual.minor_units(), 72998);
    }

    #[test]
    fn test_parse_processed_without_accrual_is_zero() {
        let body = br#"{"order":"12345678903","status":"PROCESSED"}"#;
        let outcome = parse_outcome("12345678903", body).unwrap();
        assert!(outcome.accrual.is_zero());
    }

    #[test]
    fn test_non_processed_outcome_carries_no_accrual() {
        let body = br#"{"order":"12345678903","status":"PROCESSING","accrual":10}"#;
        let outcome = parse_outcome("12345678903", body).unwrap();
        assert_eq!(outcome.status, OracleStatus::Processing);
        assert!(outcome.accrual.is_zero());
    }

    #[test]
    fn test_unclassifiable_bodies_are_errors() {
        assert!(parse_outcome("1", b"not json").is_err());
        assert!(parse_outcome("1", br#"{"order":"1","status":"UNKNOWN"}"#).is_err());
        assert!(parse_outcome("1", br#"{"order":"2","status":"INVALID"}"#).is_err());
        assert!(parse_outcome("1", br#"{"order":"1","status":"PROCESSED","accrual":-5}"#).is_err());
    }

    #[test]
    fn test_order_url_trims_trailing_slash() {
        let client = HttpAccrualClient::new(&AccrualConfig {
            base_url: "http://accrual:8080/".to_string(),
            request_timeout_ms: 100,
        })
        .unwrap();
        assert_eq!(
            client.order_url("12345678903"),
            "http://accrual:8080/api/orders/12345678903"
        );
    }
}
