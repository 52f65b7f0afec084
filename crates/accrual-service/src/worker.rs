//! 积分任务 Worker
//!
//! 每个 worker 循环地从调度器领取一个任务，对积分系统发起一次查询，然后：
//! - 终态结果：在账本事务中写入状态并入账，任务结束
//! - 需要等待：把任务交回调度器的延时队列，自己立即去领下一个
//! - 尝试预算耗尽：记录放弃，不修改账本
//!
//! 停止信号只在两次任务之间检查，正在进行的查询和落库总会执行完。

use std::sync::Arc;
use std::time::Duration;

use loyalty_shared::Money;
use loyalty_shared::error::LoyaltyError;
use loyalty_shared::observability::metrics;
use loyalty_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::backoff::{AttemptOutcome, BackoffPolicy, Decision};
use crate::client::{AccrualClient, AccrualOutcome, FetchResult, OracleStatus};
use crate::error::PipelineError;
use crate::ledger::{CommitOutcome, OrderLedger};
use crate::models::{AccrualJob, OrderStatus};
use crate::pipeline::Counters;
use crate::scheduler::{RetryHandle, WorkReceiver};

/// 一次处理的结果
#[derive(Debug, PartialEq, Eq)]
pub enum JobStep {
    /// 终态已写入账本（或此前已是终态）
    Finished(OrderStatus),
    /// 尝试预算耗尽，账本保持原样
    Abandoned,
    /// 需要在 delay 之后再查
    Retry { job: AccrualJob, delay: Duration },
    /// 终态结果落库失败，已告警
    CommitFailed,
}

/// 积分任务 Worker
pub struct Worker {
    id: usize,
    client: Arc<dyn AccrualClient>,
    ledger: Arc<dyn OrderLedger>,
    backoff: BackoffPolicy,
    commit_policy: RetryPolicy,
}

impl Worker {
    pub fn new(
        id: usize,
        client: Arc<dyn AccrualClient>,
        ledger: Arc<dyn OrderLedger>,
        backoff: BackoffPolicy,
        commit_policy: RetryPolicy,
    ) -> Self {
        Self {
            id,
            client,
            ledger,
            backoff,
            commit_policy,
        }
    }

    /// 主循环：领取任务直到收到停止信号或调度器关闭
    pub async fn run(
        self,
        work: WorkReceiver,
        retry: RetryHandle,
        counters: Arc<Counters>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(worker_id = self.id, "worker 已启动");

        loop {
            let job = tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                job = work.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            match self.process(job).await {
                JobStep::Finished(_) => counters.finished(),
                JobStep::Abandoned => counters.abandoned(),
                JobStep::CommitFailed => counters.commit_failed(),
                JobStep::Retry { job, delay } => {
                    if let Err(job) = retry.schedule(job, delay) {
                        // 调度器已停止：订单保持非终态，下次启动时恢复
                        info!(
                            worker_id = self.id,
                            order_number = %job.order_number,
                            "调度器已停止，任务留待下次启动恢复"
                        );
                        counters.left_pending(1);
                    }
                }
            }
        }

        debug!(worker_id = self.id, "worker 已停止");
    }

    /// 对任务执行一次查询并决定下一步
    pub async fn process(&self, mut job: AccrualJob) -> JobStep {
        let result = self.client.fetch(&job.order_number).await;
        job.record_attempt(matches!(result, FetchResult::RateLimited(_)));

        let outcome = match result {
            FetchResult::Ready(outcome) if outcome.status.is_terminal() => {
                return self.commit(&job, outcome).await;
            }
            FetchResult::Ready(_) => AttemptOutcome::StillProcessing,
            FetchResult::NotRegisteredYet => AttemptOutcome::NotRegistered,
            FetchResult::RateLimited(advised) => AttemptOutcome::RateLimited(advised),
            FetchResult::TransientError(_) => AttemptOutcome::Transient,
        };

        match self.backoff.decide(outcome, &job) {
            Decision::RetryAfter(delay) => {
                debug!(
                    worker_id = self.id,
                    order_number = %job.order_number,
                    attempt = job.attempt,
                    outcome = ?outcome,
                    delay_ms = delay.as_millis() as u64,
                    "订单尚未完成，稍后重试"
                );
                JobStep::Retry { job, delay }
            }
            Decision::GiveUp => {
                warn!(
                    worker_id = self.id,
                    order_number = %job.order_number,
                    attempt = job.attempt,
                    budget = self.backoff.max_attempts,
                    last_outcome = ?outcome,
                    "尝试次数耗尽，放弃该订单，账本保持原状态"
                );
                metrics::record_job_abandoned();
                JobStep::Abandoned
            }
        }
    }

    /// 写入终态结果
    ///
    /// 使用独立的有限重试预算；仍然失败时记录告警，订单保持非终态。
    async fn commit(&self, job: &AccrualJob, outcome: AccrualOutcome) -> JobStep {
        let status = OrderStatus::from(outcome.status);
        let accrual = if outcome.status == OracleStatus::Processed {
            outcome.accrual
        } else {
            Money::ZERO
        };

        let committed = retry_with_policy(
            &self.commit_policy,
            "update_order",
            LoyaltyError::is_retryable,
            || self.ledger.update_order(&job.order_number, status, accrual),
        )
        .await;

        match committed {
            Ok(CommitOutcome::Committed) => {
                info!(
                    worker_id = self.id,
                    order_number = %job.order_number,
                    user_id = job.user_id,
                    status = %status,
                    accrual = %accrual,
                    attempt = job.attempt,
                    "订单积分已入账"
                );
                metrics::record_job_finished(status.as_str());
                JobStep::Finished(status)
            }
            Ok(CommitOutcome::AlreadyFinal) => {
                info!(
                    worker_id = self.id,
                    order_number = %job.order_number,
                    "订单此前已是终态，未重复入账"
                );
                metrics::record_job_finished(status.as_str());
                JobStep::Finished(status)
            }
            Err(source) => {
                let err = PipelineError::LedgerCommitFailed {
                    order_number: job.order_number.clone(),
                    source,
                };
                error!(
                    alert = true,
                    worker_id = self.id,
                    order_number = %job.order_number,
                    user_id = job.user_id,
                    status = %status,
                    accrual = %accrual,
                    error = %err,
                    "终态结果落库失败，订单保持非终态，需人工介入或等待下次启动恢复"
                );
                metrics::record_commit_failure();
                JobStep::CommitFailed
            }
        }
    }
}
