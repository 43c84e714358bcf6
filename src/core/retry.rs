//! 重试策略：是否重试 + 指数退避延迟
//!
//! 纯函数，不做任何 IO；`max_attempts == 0` 在构造时即报配置错误。

use std::time::Duration;

use crate::config::OrchestratorSection;
use crate::core::OrchestratorError;

/// 单个步骤尝试循环内的可变状态，只归 ExecutionEngine 所有
#[derive(Debug, Clone, PartialEq)]
pub struct RetryContext {
    /// 当前尝试序号，从 1 开始
    pub attempt_number: u32,
    pub max_attempts: u32,
    /// 此前各次失败的说明（按发生顺序）
    pub failure_history: Vec<String>,
    pub last_delay: Duration,
}

impl RetryContext {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt_number: 1,
            max_attempts,
            failure_history: Vec::new(),
            last_delay: Duration::ZERO,
        }
    }

    pub fn record_failure(&mut self, explanation: impl Into<String>) {
        self.failure_history.push(explanation.into());
    }
}

/// 重试策略：第 N 次（N = max_attempts）尝试为最后一次
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
    ) -> Result<Self, OrchestratorError> {
        if max_attempts == 0 {
            return Err(OrchestratorError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
        })
    }

    /// 从 [orchestrator] 配置段构造
    pub fn from_config(cfg: &OrchestratorSection) -> Result<Self, OrchestratorError> {
        Self::new(
            cfg.max_attempts,
            Duration::from_millis(cfg.backoff_base_ms),
            Duration::from_millis(cfg.backoff_cap_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn create_initial_context(&self) -> RetryContext {
        RetryContext::new(self.max_attempts)
    }

    pub fn should_retry(&self, context: &RetryContext) -> bool {
        context.attempt_number < context.max_attempts
    }

    /// `base * 2^(n-1)`，饱和计算并以 max_delay 封顶；n <= 1 时返回 base
    pub fn get_delay(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_millis(1_000),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_max_attempts_is_config_error() {
        let err = RetryPolicy::new(0, Duration::from_millis(1), Duration::from_millis(1))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn test_should_retry_boundary() {
        for max in 1..=6 {
            let policy = policy(max);
            let mut ctx = policy.create_initial_context();
            assert_eq!(ctx.attempt_number, 1);
            assert!(ctx.failure_history.is_empty());
            for attempt in 1..max {
                ctx.attempt_number = attempt;
                assert!(policy.should_retry(&ctx), "max={max} attempt={attempt}");
            }
            ctx.attempt_number = max;
            assert!(!policy.should_retry(&ctx), "max={max} must stop at {max}");
        }
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = policy(5);
        assert_eq!(policy.get_delay(1), Duration::from_millis(100));
        assert_eq!(policy.get_delay(2), Duration::from_millis(200));
        assert_eq!(policy.get_delay(3), Duration::from_millis(400));
        assert_eq!(policy.get_delay(4), Duration::from_millis(800));
        assert_eq!(policy.get_delay(5), Duration::from_millis(1_000));
    }

    #[test]
    fn test_delay_monotonic_and_bounded() {
        let policy = policy(3);
        let mut previous = Duration::ZERO;
        for n in 1..200 {
            let delay = policy.get_delay(n);
            assert!(delay >= previous, "delay decreased at n={n}");
            assert!(delay <= Duration::from_millis(1_000));
            previous = delay;
        }
        assert_eq!(policy.get_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_cap_below_base_is_clamped() {
        let policy =
            RetryPolicy::new(2, Duration::from_millis(500), Duration::from_millis(10)).unwrap();
        assert_eq!(policy.get_delay(1), Duration::from_millis(500));
        assert_eq!(policy.get_delay(4), Duration::from_millis(500));
    }

    #[test]
    fn test_from_config_defaults() {
        let policy = RetryPolicy::from_config(&OrchestratorSection::default()).unwrap();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.get_delay(1), Duration::from_millis(1_000));
    }
}
