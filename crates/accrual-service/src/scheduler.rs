//! 任务调度器（延时就绪队列）
//!
//! 单独一个任务持有 `DelayQueue`，把两路任务汇入 worker 通道：
//! - 提交队列中的新任务
//! - 等待期已满的重试任务（优先于新任务派发）
//!
//! worker 遇到需要等待的结果时，通过 `RetryHandle` 把任务交回调度器后立即去取下一个，
//! 而不是原地 sleep。这样 W 个 worker 始终代表真实的并发查询能力。

use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use loyalty_shared::observability::metrics;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tokio_util::time::DelayQueue;
use tracing::{debug, info};

use crate::models::AccrualJob;
use crate::queue::QueueReceiver;

/// 待重新调度的任务
#[derive(Debug)]
struct ScheduledRetry {
    job: AccrualJob,
    delay: Duration,
}

/// worker 用来交回需要延时重试的任务
///
/// 无界通道：条目数受在途任务总数约束，交回操作永不阻塞 worker。
#[derive(Debug, Clone)]
pub struct RetryHandle {
    tx: mpsc::UnboundedSender<ScheduledRetry>,
}

impl RetryHandle {
    /// 安排任务在 delay 之后重新派发
    ///
    /// 调度器已停止时把任务交还调用方。
    pub fn schedule(&self, mut job: AccrualJob, delay: Duration) -> Result<(), AccrualJob> {
        job.next_eligible_at = Some(Instant::now() + delay);
        self.tx
            .send(ScheduledRetry { job, delay })
            .map_err(|e| e.0.job)
    }
}

/// worker 共享的就绪任务接收端
#[derive(Debug, Clone)]
pub struct WorkReceiver {
    rx: Arc<Mutex<mpsc::Receiver<AccrualJob>>>,
}

impl WorkReceiver {
    pub async fn recv(&self) -> Option<AccrualJob> {
        self.rx.lock().await.recv().await
    }

    /// 取出已递入通道、尚无 worker 领取的任务
    ///
    /// 仅在 worker 全部退出后调用；锁被占用时视为空。
    pub fn try_recv(&self) -> Option<AccrualJob> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

/// 调度器
pub struct Dispatcher {
    submissions: QueueReceiver,
    retries: mpsc::UnboundedReceiver<ScheduledRetry>,
    delayed: DelayQueue<AccrualJob>,
    work_tx: mpsc::Sender<AccrualJob>,
    shutdown: watch::Receiver<bool>,
}

/// 创建调度器及其两个句柄
pub fn dispatcher(
    submissions: QueueReceiver,
    shutdown: watch::Receiver<bool>,
) -> (Dispatcher, RetryHandle, WorkReceiver) {
    let (retry_tx, retry_rx) = mpsc::unbounded_channel();
    // 容量为 1：调度器每次只把一个任务递到空闲 worker 手中，排队都留在提交队列里
    let (work_tx, work_rx) = mpsc::channel(1);

    let dispatcher = Dispatcher {
        submissions,
        retries: retry_rx,
        delayed: DelayQueue::new(),
        work_tx,
        shutdown,
    };

    (
        dispatcher,
        RetryHandle { tx: retry_tx },
        WorkReceiver {
            rx: Arc::new(Mutex::new(work_rx)),
        },
    )
}

impl Dispatcher {
    /// 运行直到收到停止信号
    ///
    /// 返回停止时仍未派发的任务数（延时队列 + 提交队列 + 手中的一个），
    /// 这些订单在账本中保持非终态，下次启动时由恢复流程重新提交。
    pub async fn run(mut self) -> usize {
        info!("任务调度器已启动");

        let mut in_hand = None;
        let mut submissions_open = true;

        loop {
            let next = tokio::select! {
                biased;

                _ = self.shutdown.wait_for(|stop| *stop) => break,

                Some(retry) = self.retries.recv() => {
                    debug!(
                        order_number = %retry.job.order_number,
                        attempt = retry.job.attempt,
                        delay_ms = retry.delay.as_millis() as u64,
                        "任务进入延时队列"
                    );
                    self.delayed.insert(retry.job, retry.delay);
                    metrics::set_retry_pending(self.delayed.len());
                    continue;
                }

                Some(expired) = poll_fn(|cx| self.delayed.poll_expired(cx)) => {
                    metrics::set_retry_pending(self.delayed.len());
                    expired.into_inner()
                }

                job = self.submissions.recv(), if submissions_open => match job {
                    Some(job) => job,
                    // 所有提交端都已释放，只继续服务延时队列
                    None => {
                        submissions_open = false;
                        continue;
                    }
                },
            };

            tokio::select! {
                biased;

                _ = self.shutdown.wait_for(|stop| *stop) => {
                    in_hand = Some(next);
                    break;
                }

                // 先占位再移交，停止时任务仍在手中
                permit = self.work_tx.reserve() => match permit {
                    Ok(permit) => permit.send(next),
                    Err(_) => {
                        in_hand = Some(next);
                        break;
                    }
                },
            }
        }

        // 先关闭两路入口再清点，之后交回的任务由 worker 自行计数
        self.submissions.close();
        self.retries.close();
        let mut left = self.delayed.len() + usize::from(in_hand.is_some());
        while let Ok(retry) = self.retries.try_recv() {
            debug!(order_number = %retry.job.order_number, "停止时丢弃待调度任务");
            left += 1;
        }
        while let Some(job) = self.submissions.try_recv() {
            debug!(order_number = %job.order_number, "停止时提交队列中仍有任务");
            left += 1;
        }
        metrics::set_retry_pending(0);

        info!(left_pending = left, "任务调度器已停止");
        left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SubmissionQueue;

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_dispatched_after_delay() {
        let (queue, receiver) = SubmissionQueue::bounded(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, retry, work) = dispatcher(receiver, shutdown_rx);
        let handle = tokio::spawn(dispatcher.run());

        queue.submit(AccrualJob::new("1", 1)).await.unwrap();
        let job = work.recv().await.unwrap();
        assert_eq!(job.order_number, "1");

        let start = Instant::now();
        retry.schedule(job, Duration::from_secs(30)).unwrap();

        let again = work.recv().await.unwrap();
        assert_eq!(again.order_number, "1");
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(again.next_eligible_at.unwrap() <= Instant::now());

        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_retry_does_not_block_new_jobs() {
        let (queue, receiver) = SubmissionQueue::bounded(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, retry, work) = dispatcher(receiver, shutdown_rx);
        let handle = tokio::spawn(dispatcher.run());

        queue.submit(AccrualJob::new("slow", 1)).await.unwrap();
        let slow = work.recv().await.unwrap();
        retry.schedule(slow, Duration::from_secs(60)).unwrap();

        let start = Instant::now();
        queue.submit(AccrualJob::new("fast", 1)).await.unwrap();
        let fast = work.recv().await.unwrap();
        assert_eq!(fast.order_number, "fast");
        assert!(start.elapsed() < Duration::from_secs(60));

        shutdown_tx.send(true).unwrap();
        // slow 仍在延时队列中
        assert_eq!(handle.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_counts_queued_jobs() {
        let (queue, receiver) = SubmissionQueue::bounded(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, _retry, _work) = dispatcher(receiver, shutdown_rx);

        queue.submit(AccrualJob::new("a", 1)).await.unwrap();
        queue.submit(AccrualJob::new("b", 1)).await.unwrap();
        shutdown_tx.send(true).unwrap();

        // 停止信号先于任何派发
        assert_eq!(dispatcher.run().await, 2);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_with_job_in_hand() {
        let (queue, receiver) = SubmissionQueue::bounded(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, _retry, work) = dispatcher(receiver, shutdown_rx);
        let handle = tokio::spawn(dispatcher.run());

        for number in ["a", "b", "c"] {
            queue.submit(AccrualJob::new(number, 1)).await.unwrap();
        }

        // 没有 worker 领取：a 占满通道，b 在调度器手中等待空位，c 留在提交队列
        while queue.len() > 1 {
            tokio::task::yield_now().await;
        }
        shutdown_tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), 2);
        assert_eq!(work.try_recv().unwrap().order_number, "a");
        assert!(work.try_recv().is_none());
    }
}
