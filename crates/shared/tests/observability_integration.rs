//! 可观测性模块集成测试
//!
//! 测试 metrics、tracing 和 guard 的核心功能。

// ============================================================================
// 指标记录测试
// ============================================================================

mod metrics_tests {
    use loyalty_shared::observability::metrics::{
        record_commit_failure, record_job_abandoned, record_job_finished, record_job_submitted,
        record_oracle_request, set_retry_pending,
    };

    #[test]
    fn test_record_job_lifecycle() {
        record_job_submitted();
        record_job_finished("PROCESSED");
        record_job_finished("INVALID");
        record_job_abandoned();
        record_commit_failure();
    }

    #[test]
    fn test_record_oracle_request() {
        // 各种查询结果分类
        record_oracle_request("ready", 0.05);
        record_oracle_request("not_registered", 0.01);
        record_oracle_request("rate_limited", 0.02);
        record_oracle_request("transient", 5.0);
    }

    #[test]
    fn test_set_retry_pending() {
        set_retry_pending(0);
        set_retry_pending(1_000);
    }

    #[tokio::test]
    async fn test_metrics_server_starts_on_ephemeral_port() {
        // 全局 recorder 只能安装一次，本进程内仅此一处调用 init
        let handle = loyalty_shared::observability::metrics::init("accrual-worker-test", 0)
            .await
            .expect("启动指标服务失败");
        record_job_submitted();
        drop(handle);
    }
}

// ============================================================================
// 日志测试
// ============================================================================

mod tracing_tests {
    use loyalty_shared::config::ObservabilityConfig;
    use loyalty_shared::observability::tracing::env_filter;

    #[test]
    fn test_env_filter_accepts_directives() {
        let _ = env_filter("info");
        let _ = env_filter("accrual_service=debug,sqlx=warn,info");
    }

    #[test]
    fn test_log_format_selection() {
        let mut config = ObservabilityConfig::default();
        assert!(!config.json_logs());

        config.log_format = "JSON".to_string();
        assert!(config.json_logs());
    }
}

// ============================================================================
// 配置测试
// ============================================================================

mod config_tests {
    use loyalty_shared::config::ObservabilityConfig;

    #[test]
    fn test_default_config() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, "pretty");
        assert!(config.metrics_enabled);
    }
}

// ============================================================================
// Guard 测试
// ============================================================================

mod guard_tests {
    use loyalty_shared::observability::ObservabilityGuard;

    #[test]
    fn test_empty_guard() {
        let guard = ObservabilityGuard::empty();
        drop(guard);
    }
}
