//! 积分处理 Worker 入口
//!
//! 连接订单账本，启动积分管道，恢复上次未完成的订单，直到收到停止信号。

use std::sync::Arc;

use accrual_service::{AccrualPipeline, HttpAccrualClient, PgOrderLedger};
use clap::Parser;
use loyalty_shared::{config::AppConfig, database::Database, observability};
use tracing::{error, info};

/// 订单积分处理服务
///
/// 命令行参数优先于配置文件和环境变量。
#[derive(Parser, Debug)]
#[command(name = "accrual-worker")]
#[command(version, about = "订单积分处理服务")]
struct Args {
    /// 数据库连接地址
    #[arg(short = 'd', long)]
    database_uri: Option<String>,

    /// 积分计算系统地址
    #[arg(short = 'r', long)]
    accrual_address: Option<String>,

    /// worker 数量
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// 提交队列容量
    #[arg(short = 'q', long)]
    queue_capacity: Option<usize>,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(url) = self.database_uri {
            config.database.url = url;
        }
        if let Some(addr) = self.accrual_address {
            config.accrual.base_url = addr;
        }
        if let Some(workers) = self.workers {
            config.pipeline.workers = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            config.pipeline.queue_capacity = capacity;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = AppConfig::load("accrual-worker")?;
    args.apply(&mut config);

    let _guard = observability::init(&config.service_name, &config.observability).await?;

    info!(
        environment = %config.environment,
        accrual = %config.accrual.base_url,
        workers = config.pipeline.workers,
        queue_capacity = config.pipeline.queue_capacity,
        "Starting accrual-worker"
    );

    let db = Database::connect(&config.database).await?;
    let latency = db.health_check().await?;
    info!(latency_ms = latency.as_millis() as u64, "数据库健康检查通过");

    let ledger = PgOrderLedger::new(db.pool().clone());
    ledger.run_migrations().await?;

    let client = HttpAccrualClient::new(&config.accrual)?;
    let mut pipeline = AccrualPipeline::new(config.pipeline.clone(), Arc::new(client), Arc::new(ledger));
    pipeline.start()?;

    match pipeline.recover_pending().await {
        Ok(count) => info!(count, "未完成订单恢复完毕"),
        Err(e) => error!(error = %e, "恢复未完成订单失败，将在下次启动时重试"),
    }

    shutdown_signal().await;

    let stats = pipeline.stop().await;
    db.close().await;

    info!(
        finished = stats.finished,
        left_pending = stats.left_pending,
        "accrual-worker shutdown complete"
    );
    Ok(())
}

/// 监听关闭信号
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("收到关闭信号，正在停止积分管道...");
}
