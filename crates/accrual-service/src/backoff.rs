//! 轮询退避策略
//!
//! 纯函数：输入本次查询的归类结果和任务的尝试计数，输出"多久后再查"或"放弃"。
//! 没有 I/O 和共享状态，重试语义不需要假的积分系统就能测试。
//!
//! 非限流的可重试结果使用固定的小间隔而不是指数增长：
//! 真正的节流信号是积分系统自己的 429。

use std::time::Duration;

use loyalty_shared::config::PipelineConfig;

use crate::models::AccrualJob;

/// 需要重试的查询结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 积分系统返回 REGISTERED / PROCESSING
    StillProcessing,
    /// 204，订单还没到达积分系统
    NotRegistered,
    /// 429，附带建议等待时间
    RateLimited(Duration),
    /// 网络错误、意外状态码、无法解析的响应
    Transient,
}

/// 退避决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RetryAfter(Duration),
    GiveUp,
}

/// 退避策略
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// 非终态/未登记时的轮询间隔
    pub poll_interval: Duration,
    /// 瞬时错误后的等待间隔
    pub error_delay: Duration,
    /// 尝试预算，限流的查询不计入
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            error_delay: config.error_delay(),
            max_attempts: config.max_attempts,
        }
    }

    /// 决定任务的下一步
    ///
    /// 调用前 job 已经记录了本次查询（`record_attempt`）。
    /// 限流永远按建议时长重试，不会因预算耗尽而放弃。
    pub fn decide(&self, outcome: AttemptOutcome, job: &AccrualJob) -> Decision {
        if let AttemptOutcome::RateLimited(advised) = outcome {
            return Decision::RetryAfter(advised);
        }

        if job.budget_used() >= self.max_attempts {
            return Decision::GiveUp;
        }

        match outcome {
            AttemptOutcome::StillProcessing | AttemptOutcome::NotRegistered => {
                Decision::RetryAfter(self.poll_interval)
            }
            AttemptOutcome::Transient => Decision::RetryAfter(self.error_delay),
            AttemptOutcome::RateLimited(advised) => Decision::RetryAfter(advised),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            poll_interval: Duration::from_secs(1),
            error_delay: Duration::from_secs(2),
            max_attempts,
        }
    }

    fn job_after(attempts: u32, rate_limited: u32) -> AccrualJob {
        let mut job = AccrualJob::new("12345678903", 1);
        for i in 0..attempts {
            job.record_attempt(i < rate_limited);
        }
        job
    }

    #[test]
    fn test_rate_limited_uses_advised_delay_exactly() {
        let decision = policy(3).decide(
            AttemptOutcome::RateLimited(Duration::from_secs(30)),
            &job_after(1, 1),
        );
        assert_eq!(decision, Decision::RetryAfter(Duration::from_secs(30)));
    }

    #[test]
    fn test_rate_limited_never_gives_up() {
        // 即使普通预算已经耗尽，限流依旧按建议时长重试
        let decision = policy(1).decide(
            AttemptOutcome::RateLimited(Duration::from_secs(5)),
            &job_after(10, 1),
        );
        assert_eq!(decision, Decision::RetryAfter(Duration::from_secs(5)));
    }

    #[test]
    fn test_fixed_delays_for_other_outcomes() {
        let p = policy(10);
        let job = job_after(3, 0);

        assert_eq!(
            p.decide(AttemptOutcome::StillProcessing, &job),
            Decision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            p.decide(AttemptOutcome::NotRegistered, &job),
            Decision::RetryAfter(Duration::from_secs(1))
        );
        // 固定间隔，不随尝试次数增长
        assert_eq!(
            p.decide(AttemptOutcome::Transient, &job),
            Decision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            p.decide(AttemptOutcome::Transient, &job_after(9, 0)),
            Decision::RetryAfter(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_gives_up_when_budget_exhausted() {
        let p = policy(3);
        assert_eq!(
            p.decide(AttemptOutcome::StillProcessing, &job_after(2, 0)),
            Decision::RetryAfter(Duration::from_secs(1))
        );
        assert_eq!(
            p.decide(AttemptOutcome::StillProcessing, &job_after(3, 0)),
            Decision::GiveUp
        );
        assert_eq!(p.decide(AttemptOutcome::Transient, &job_after(3, 0)), Decision::GiveUp);
    }

    #[test]
    fn test_rate_limited_attempts_extend_budget() {
        // 5 次查询中 2 次被限流，只消耗了 3 次预算
        let p = policy(4);
        assert_eq!(
            p.decide(AttemptOutcome::StillProcessing, &job_after(5, 2)),
            Decision::RetryAfter(Duration::from_secs(1))
        );
    }
}
