//! 重投与死信策略

use crate::config::{Config, DispatchConfig};
use crate::error::ProcessingError;
use chunkq_common::ChunkResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 死信分块的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DeadLetterPolicy {
    /// 判定为终止失败，死信留待外部重新提交
    #[default]
    Hold,
    /// 由死信监视器自动重新派发，最多 max_rounds 轮
    Redispatch {
        #[serde(default = "default_max_rounds")]
        max_rounds: u32,
    },
}

fn default_max_rounds() -> u32 {
    1
}

impl DeadLetterPolicy {
    /// 该轮次的死信是否还会被重新派发
    pub fn will_redispatch(&self, dispatch_round: u32) -> bool {
        match self {
            DeadLetterPolicy::Hold => false,
            DeadLetterPolicy::Redispatch { max_rounds } => dispatch_round < *max_rounds,
        }
    }
}

/// 一次投递处理完之后对消息的处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub disposition: Disposition,
    pub result: ChunkResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub redelivery_limit: u32,
    pub dead_letter: DeadLetterPolicy,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            redelivery_limit: config.queue.redelivery_limit,
            dead_letter: config.dead_letter,
        }
    }

    pub fn decide(
        &self,
        redelivery_count: u32,
        dispatch_round: u32,
        processed: &Result<(), ProcessingError>,
    ) -> Decision {
        match processed {
            Ok(()) => Decision {
                disposition: Disposition::Ack,
                result: ChunkResult::Success,
            },
            Err(ProcessingError::Permanent(_)) => Decision {
                disposition: Disposition::Ack,
                result: ChunkResult::TerminalFailure,
            },
            Err(ProcessingError::Transient(_)) if redelivery_count < self.redelivery_limit => {
                Decision {
                    disposition: Disposition::Requeue,
                    result: ChunkResult::RetriableFailure,
                }
            }
            Err(ProcessingError::Transient(_)) => {
                let result = if self.dead_letter.will_redispatch(dispatch_round) {
                    ChunkResult::RetriableFailure
                } else {
                    ChunkResult::TerminalFailure
                };
                Decision {
                    disposition: Disposition::DeadLetter,
                    result,
                }
            }
        }
    }
}

/// 指数退避，封顶于 max
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            base: Duration::from_millis(config.publish_backoff_ms),
            max: Duration::from_millis(config.publish_backoff_max_ms),
        }
    }

    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始）
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << exp).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(dead_letter: DeadLetterPolicy) -> RetryPolicy {
        RetryPolicy {
            redelivery_limit: 5,
            dead_letter,
        }
    }

    #[test]
    fn transient_failures_requeue_until_limit() {
        let p = policy(DeadLetterPolicy::Hold);
        let err = Err(ProcessingError::transient("timeout"));

        for count in 0..5 {
            let decision = p.decide(count, 0, &err);
            assert_eq!(decision.disposition, Disposition::Requeue);
            assert_eq!(decision.result, ChunkResult::RetriableFailure);
        }

        let decision = p.decide(5, 0, &err);
        assert_eq!(decision.disposition, Disposition::DeadLetter);
        assert_eq!(decision.result, ChunkResult::TerminalFailure);
    }

    #[test]
    fn permanent_failure_is_acked_as_terminal() {
        let decision = policy(DeadLetterPolicy::Hold).decide(
            0,
            0,
            &Err(ProcessingError::permanent("malformed")),
        );
        assert_eq!(decision.disposition, Disposition::Ack);
        assert_eq!(decision.result, ChunkResult::TerminalFailure);
    }

    #[test]
    fn redispatch_policy_keeps_chunk_open_while_rounds_remain() {
        let p = policy(DeadLetterPolicy::Redispatch { max_rounds: 1 });
        let err = Err(ProcessingError::transient("busy"));

        let first_round = p.decide(5, 0, &err);
        assert_eq!(first_round.disposition, Disposition::DeadLetter);
        assert_eq!(first_round.result, ChunkResult::RetriableFailure);

        let last_round = p.decide(5, 1, &err);
        assert_eq!(last_round.result, ChunkResult::TerminalFailure);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(40), Duration::from_millis(500));
    }
}
