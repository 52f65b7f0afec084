//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。
//! 未安装 recorder 时（如单元测试）所有记录函数都是空操作。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_pipeline_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册积分管道指标的描述，出现在 /metrics 的 HELP 注释中
fn describe_pipeline_metrics(service_name: &str) {
    metrics::describe_counter!(
        "accrual_jobs_submitted_total",
        "Total number of orders submitted for accrual tracking"
    );
    metrics::describe_counter!(
        "accrual_jobs_finished_total",
        "Total number of jobs committed with a terminal status"
    );
    metrics::describe_counter!(
        "accrual_jobs_abandoned_total",
        "Total number of jobs abandoned after exhausting the attempt budget"
    );
    metrics::describe_counter!(
        "accrual_oracle_requests_total",
        "Total number of accrual system lookups by result class"
    );
    metrics::describe_histogram!(
        "accrual_oracle_request_duration_seconds",
        "Accrual system lookup duration in seconds"
    );
    metrics::describe_counter!(
        "accrual_commit_failures_total",
        "Terminal commits that failed after all ledger retries"
    );
    metrics::describe_gauge!(
        "accrual_retry_pending",
        "Jobs waiting in the delayed-ready queue"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 指标记录函数
// ============================================================================

#[inline]
pub fn record_job_submitted() {
    metrics::counter!("accrual_jobs_submitted_total").increment(1);
}

/// 记录任务以终态落库
#[inline]
pub fn record_job_finished(status: &str) {
    metrics::counter!("accrual_jobs_finished_total", "status" => status.to_string()).increment(1);
}

#[inline]
pub fn record_job_abandoned() {
    metrics::counter!("accrual_jobs_abandoned_total").increment(1);
}

/// 记录一次积分系统查询
///
/// result 取值：ready / not_registered / rate_limited / transient
#[inline]
pub fn record_oracle_request(result: &str, duration_secs: f64) {
    metrics::counter!("accrual_oracle_requests_total", "result" => result.to_string())
        .increment(1);
    metrics::histogram!("accrual_oracle_request_duration_seconds").record(duration_secs);
}

#[inline]
pub fn record_commit_failure() {
    metrics::counter!("accrual_commit_failures_total").increment(1);
}

#[inline]
pub fn set_retry_pending(count: usize) {
    metrics::gauge!("accrual_retry_pending").set(count as f64);
}
