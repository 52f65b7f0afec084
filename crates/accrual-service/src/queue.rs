//! 有界提交队列
//!
//! 订单创建方通过 `submit` 把任务放入容量为 Q 的 FIFO。
//! 队列满时提交方被挂起，直到有空位或自身期限到达：积分系统变慢时，
//! 压力传导到订单创建方，而不是在内存里无限堆积。
//! 超时或关闭时任务随错误交还调用方，不会被静默丢弃。

use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::debug;

use crate::error::SubmitError;
use crate::models::AccrualJob;

/// 提交端，可被多个生产者克隆共享
#[derive(Debug, Clone)]
pub struct SubmissionQueue {
    tx: mpsc::Sender<AccrualJob>,
}

/// 消费端，由调度器独占
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<AccrualJob>,
}

impl SubmissionQueue {
    /// 创建容量为 capacity 的队列；容量至少为 1
    pub fn bounded(capacity: usize) -> (Self, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, QueueReceiver { rx })
    }

    /// 提交任务，队列满时一直等待
    pub async fn submit(&self, job: AccrualJob) -> Result<(), SubmitError> {
        self.log_if_full(&job);
        self.tx
            .send(job)
            .await
            .map_err(|e| SubmitError::Closed(e.0))
    }

    /// 提交任务，最多等待 deadline
    pub async fn submit_with_deadline(
        &self,
        job: AccrualJob,
        deadline: Duration,
    ) -> Result<(), SubmitError> {
        self.log_if_full(&job);
        self.tx
            .send_timeout(job, deadline)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(job) => SubmitError::DeadlineElapsed(job),
                SendTimeoutError::Closed(job) => SubmitError::Closed(job),
            })
    }

    /// 当前排队的任务数
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn log_if_full(&self, job: &AccrualJob) {
        if self.tx.capacity() == 0 {
            debug!(
                order_number = %job.order_number,
                capacity = self.capacity(),
                "提交队列已满，等待空位"
            );
        }
    }
}

impl QueueReceiver {
    pub async fn recv(&mut self) -> Option<AccrualJob> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AccrualJob> {
        self.rx.try_recv().ok()
    }

    /// 拒绝后续提交，已排队的任务仍可取出
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(number: &str) -> AccrualJob {
        AccrualJob::new(number, 1)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (queue, mut rx) = SubmissionQueue::bounded(3);
        queue.submit(job("1")).await.unwrap();
        queue.submit(job("2")).await.unwrap();
        queue.submit(job("3")).await.unwrap();
        assert_eq!(queue.len(), 3);

        assert_eq!(rx.recv().await.unwrap().order_number, "1");
        assert_eq!(rx.recv().await.unwrap().order_number, "2");
        assert_eq!(rx.recv().await.unwrap().order_number, "3");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_times_out_and_returns_job() {
        let (queue, _rx) = SubmissionQueue::bounded(1);
        queue.submit(job("1")).await.unwrap();

        let err = queue
            .submit_with_deadline(job("2"), Duration::from_millis(50))
            .await
            .unwrap_err();

        match err {
            SubmitError::DeadlineElapsed(returned) => assert_eq!(returned.order_number, "2"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_slot_frees() {
        let (queue, mut rx) = SubmissionQueue::bounded(1);
        queue.submit(job("1")).await.unwrap();

        let producer = queue.clone();
        let pending = tokio::spawn(async move { producer.submit(job("2")).await });

        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert_eq!(rx.recv().await.unwrap().order_number, "1");
        pending.await.unwrap().unwrap();
        assert_eq!(rx.recv().await.unwrap().order_number, "2");
    }

    #[tokio::test]
    async fn test_closed_queue_hands_job_back() {
        let (queue, mut rx) = SubmissionQueue::bounded(2);
        rx.close();

        let err = queue.submit(job("9")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Closed(_)));
        assert_eq!(err.into_job().order_number, "9");
        assert!(queue.is_closed());
    }
}
