//! 积分管道
//!
//! 对外只暴露 提交 / 启动 / 停止 三个动作：
//!
//! ```text
//! submit ─▶ 提交队列(Q) ─▶ 调度器 ─▶ worker × W ─▶ 积分系统
//!                            ▲  │                   │
//!                            │  └── 延时队列 ◀──────┘ 需要等待
//!                            └──────────────────────  终态 ─▶ 账本事务
//! ```
//!
//! 提交在队列满时挂起调用方直到期限到达，这是唯一会反馈给订单创建方的压力；
//! 之后的查询、重试和落库都在管道内部消化。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use loyalty_shared::config::PipelineConfig;
use loyalty_shared::observability::metrics;
use loyalty_shared::retry::RetryPolicy;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::client::AccrualClient;
use crate::error::{PipelineError, SubmitError};
use crate::ledger::OrderLedger;
use crate::models::AccrualJob;
use crate::queue::{QueueReceiver, SubmissionQueue};
use crate::scheduler::{self, WorkReceiver};
use crate::worker::Worker;

/// 管道运行计数
#[derive(Debug, Default)]
pub(crate) struct Counters {
    submitted: AtomicU64,
    finished: AtomicU64,
    abandoned: AtomicU64,
    commit_failed: AtomicU64,
    left_pending: AtomicU64,
}

impl Counters {
    pub(crate) fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn finished(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn abandoned(&self) {
        self.abandoned.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn commit_failed(&self) {
        self.commit_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn left_pending(&self, count: u64) {
        self.left_pending.fetch_add(count, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            commit_failed: self.commit_failed.load(Ordering::Relaxed),
            left_pending: self.left_pending.load(Ordering::Relaxed),
        }
    }
}

/// 管道统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// 成功入队的任务数
    pub submitted: u64,
    /// 终态已落库（含此前已是终态）
    pub finished: u64,
    /// 尝试预算耗尽
    pub abandoned: u64,
    /// 终态落库失败并已告警
    pub commit_failed: u64,
    /// 停止时仍未完成、留待下次启动恢复
    pub left_pending: u64,
}

impl PipelineStats {
    /// 已经离开管道的任务数
    pub fn completed(&self) -> u64 {
        self.finished + self.abandoned + self.commit_failed
    }
}

/// 运行中的后台任务
struct Running {
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<usize>,
    workers: Vec<JoinHandle<()>>,
    work: WorkReceiver,
}

/// 积分管道
///
/// 所有对外操作都只需 `&self`，可放进 `Arc` 在提交方和停止方之间共享。
pub struct AccrualPipeline {
    config: PipelineConfig,
    client: Arc<dyn AccrualClient>,
    ledger: Arc<dyn OrderLedger>,
    queue: SubmissionQueue,
    receiver: Option<QueueReceiver>,
    accepting: AtomicBool,
    counters: Arc<Counters>,
    running: Mutex<Option<Running>>,
}

impl AccrualPipeline {
    pub fn new(
        config: PipelineConfig,
        client: Arc<dyn AccrualClient>,
        ledger: Arc<dyn OrderLedger>,
    ) -> Self {
        let (queue, receiver) = SubmissionQueue::bounded(config.queue_capacity);

        Self {
            config,
            client,
            ledger,
            queue,
            receiver: Some(receiver),
            accepting: AtomicBool::new(true),
            counters: Arc::new(Counters::default()),
            running: Mutex::new(None),
        }
    }

    /// 启动调度器与 W 个 worker
    ///
    /// 只能调用一次。启动前提交的任务会先在队列中等待。
    pub fn start(&mut self) -> Result<(), PipelineError> {
        let receiver = self.receiver.take().ok_or(PipelineError::AlreadyStarted)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, retry, work) = scheduler::dispatcher(receiver, shutdown_rx.clone());
        let dispatcher = tokio::spawn(dispatcher.run());

        let worker_count = self.config.workers.max(1);
        let backoff = BackoffPolicy::from_config(&self.config);
        let commit_policy =
            RetryPolicy::new(self.config.commit_max_retries, self.config.commit_retry_delay());

        let workers = (0..worker_count)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    self.client.clone(),
                    self.ledger.clone(),
                    backoff.clone(),
                    commit_policy.clone(),
                );
                tokio::spawn(worker.run(
                    work.clone(),
                    retry.clone(),
                    self.counters.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        *self.running.get_mut() = Some(Running {
            shutdown: shutdown_tx,
            dispatcher,
            workers,
            work,
        });

        info!(
            workers = worker_count,
            queue_capacity = self.queue.capacity(),
            poll_interval_ms = self.config.poll_interval_ms,
            max_attempts = self.config.max_attempts,
            "积分管道已启动"
        );
        Ok(())
    }

    /// 提交订单，队列满时最多等待配置的默认期限
    pub async fn submit(
        &self,
        order_number: impl Into<String>,
        user_id: i64,
    ) -> Result<(), SubmitError> {
        self.submit_with_deadline(order_number, user_id, self.config.submit_timeout())
            .await
    }

    /// 提交订单，队列满时最多等待 deadline
    ///
    /// 超时或管道已停止时任务随错误交还调用方。
    pub async fn submit_with_deadline(
        &self,
        order_number: impl Into<String>,
        user_id: i64,
        deadline: Duration,
    ) -> Result<(), SubmitError> {
        let job = AccrualJob::new(order_number, user_id);
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SubmitError::Closed(job));
        }

        match self.queue.submit_with_deadline(job, deadline).await {
            Ok(()) => {
                self.counters.submitted();
                metrics::record_job_submitted();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "订单提交失败");
                Err(e)
            }
        }
    }

    /// 重新提交账本中所有非终态订单
    ///
    /// 进程启动后、接收新订单前调用一次。
    pub async fn recover_pending(&self) -> Result<usize, PipelineError> {
        if self.running.lock().is_none() {
            return Err(PipelineError::NotStarted);
        }

        let orders = self.ledger.list_unfinished_orders().await?;
        let total = orders.len();

        for order in orders {
            // worker 已在运行，队列总会腾出空位
            self.queue
                .submit(AccrualJob::new(order.number, order.user_id))
                .await?;
            self.counters.submitted();
            metrics::record_job_submitted();
        }

        if total > 0 {
            info!(count = total, "已重新提交未完成的订单");
        }
        Ok(total)
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// 停止管道
    ///
    /// 不再接收新提交，通知调度器和 worker 退出，等待正在进行的查询和落库完成。
    /// 未完成的任务不会落库，订单保持非终态，由下次启动的 `recover_pending` 接手。
    /// 重复调用只返回当前统计。
    pub async fn stop(&self) -> PipelineStats {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return self.counters.snapshot();
        }

        let running = self.running.lock().take();
        let Some(running) = running else {
            // 从未启动：提交队列中的任务全部留待恢复
            self.counters.left_pending(self.queue.len() as u64);
            return self.counters.snapshot();
        };

        let _ = running.shutdown.send(true);

        for handle in running.workers {
            if let Err(e) = handle.await {
                error!(error = %e, "worker 异常退出");
            }
        }

        match running.dispatcher.await {
            Ok(left) => self.counters.left_pending(left as u64),
            Err(e) => error!(error = %e, "调度器异常退出"),
        }

        // 调度器已递出、worker 尚未领取的任务
        let mut undelivered = 0;
        while let Some(job) = running.work.try_recv() {
            debug!(order_number = %job.order_number, "停止时 worker 通道中仍有任务");
            undelivered += 1;
        }
        self.counters.left_pending(undelivered);

        let stats = self.counters.snapshot();
        info!(
            submitted = stats.submitted,
            finished = stats.finished,
            abandoned = stats.abandoned,
            commit_failed = stats.commit_failed,
            left_pending = stats.left_pending,
            "积分管道已停止"
        );
        stats
    }
}
