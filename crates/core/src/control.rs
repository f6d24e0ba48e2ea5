#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

/// Control-plane limits applied to one agent execution, plus the retry
/// budget applied across executions of the same inbox task.
#[derive(Clone, Copy, Debug)]
pub struct Policy {
    pub max_turns: i64,
    pub max_wall_time: Duration,
    pub max_tokens: i64,
    pub max_retries: i64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_turns: 1,
            max_wall_time: Duration::from_secs(120),
            max_tokens: 100_000,
            max_retries: 3,
        }
    }
}

/// Which limit tripped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitType {
    Turns,
    WallTime,
    Tokens,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Turns => "max_turns",
            Self::WallTime => "max_wall_time_seconds",
            Self::Tokens => "max_tokens",
        }
    }
}

/// A run limit was reached. Carries the observed value and the threshold so
/// the caller can record a `control.limit_reached` event verbatim.
#[derive(Clone, Copy, Debug)]
pub struct LimitError {
    pub limit_type: LimitType,
    pub value: i64,
    pub threshold: i64,
}

impl std::fmt::Display for LimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "limit reached type={} value={} threshold={}",
            self.limit_type.as_str(),
            self.value,
            self.threshold
        )
    }
}

impl std::error::Error for LimitError {}

impl Policy {
    /// A non-positive `max_turns` denies all work.
    pub fn check_turn_limit(&self, used_turns: i64) -> Result<(), LimitError> {
        if self.max_turns <= 0 || used_turns >= self.max_turns {
            return Err(LimitError {
                limit_type: LimitType::Turns,
                value: used_turns,
                threshold: self.max_turns,
            });
        }
        Ok(())
    }

    pub fn check_wall_time(&self, started_at: Instant, now: Instant) -> Result<(), LimitError> {
        if self.max_wall_time.is_zero() {
            return Err(LimitError {
                limit_type: LimitType::WallTime,
                value: 0,
                threshold: 0,
            });
        }
        let elapsed = now.saturating_duration_since(started_at);
        if elapsed > self.max_wall_time {
            return Err(LimitError {
                limit_type: LimitType::WallTime,
                value: elapsed.as_secs() as i64,
                threshold: self.max_wall_time.as_secs() as i64,
            });
        }
        Ok(())
    }

    /// Checked against the cumulative input+output token usage of the run.
    /// `max_tokens <= 0` disables the check.
    pub fn check_token_limit(&self, used_tokens: i64) -> Result<(), LimitError> {
        if self.max_tokens > 0 && used_tokens > self.max_tokens {
            return Err(LimitError {
                limit_type: LimitType::Tokens,
                value: used_tokens,
                threshold: self.max_tokens,
            });
        }
        Ok(())
    }
}

/// Exponential backoff with a fixed 30 second cap: 1,2,4,8,16,30,30,...
pub fn retry_backoff_seconds(attempt: i64) -> i64 {
    if attempt <= 0 {
        return 0;
    }
    let shift = (attempt - 1).min(62) as u32;
    1i64.checked_shl(shift).unwrap_or(i64::MAX).min(30)
}

pub fn should_retry(policy: &Policy, attempts: i64) -> bool {
    attempts <= policy.max_retries
}

/// True when the last `k` fingerprints are all identical.
pub fn no_progress(fingerprints: &[&str], k: usize) -> bool {
    if k <= 1 || fingerprints.len() < k {
        return false;
    }
    let reference = fingerprints[fingerprints.len() - 1];
    fingerprints[fingerprints.len() - k..fingerprints.len() - 1]
        .iter()
        .all(|fp| *fp == reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_limit_boundary() {
        let p = Policy {
            max_turns: 1,
            ..Policy::default()
        };
        assert!(p.check_turn_limit(0).is_ok());
        let err = p.check_turn_limit(1).unwrap_err();
        assert_eq!(err.limit_type, LimitType::Turns);
        assert_eq!(err.threshold, 1);
    }

    #[test]
    fn turn_limit_zero_denies_everything() {
        let p = Policy {
            max_turns: 0,
            ..Policy::default()
        };
        assert!(p.check_turn_limit(0).is_err());
    }

    #[test]
    fn wall_time_boundary() {
        let p = Policy {
            max_wall_time: Duration::from_secs(2),
            ..Policy::default()
        };
        let start = Instant::now();
        assert!(p.check_wall_time(start, start + Duration::from_secs(1)).is_ok());
        let err = p
            .check_wall_time(start, start + Duration::from_secs(3))
            .unwrap_err();
        assert_eq!(err.limit_type, LimitType::WallTime);
        assert_eq!(err.value, 3);
    }

    #[test]
    fn token_limit_boundary() {
        let p = Policy {
            max_tokens: 10,
            ..Policy::default()
        };
        assert!(p.check_token_limit(10).is_ok());
        let err = p.check_token_limit(11).unwrap_err();
        assert_eq!(err.limit_type, LimitType::Tokens);
    }

    #[test]
    fn backoff_schedule() {
        let got: Vec<i64> = (1..=7).map(retry_backoff_seconds).collect();
        assert_eq!(got, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(retry_backoff_seconds(0), 0);
        assert_eq!(retry_backoff_seconds(-3), 0);
    }

    #[test]
    fn should_retry_boundary() {
        let p = Policy {
            max_retries: 3,
            ..Policy::default()
        };
        assert!(should_retry(&p, 1));
        assert!(should_retry(&p, 3));
        assert!(!should_retry(&p, 4));
    }

    #[test]
    fn no_progress_needs_k_identical() {
        assert!(no_progress(&["a", "a", "a"], 3));
        assert!(!no_progress(&["a", "b", "b"], 3));
        assert!(!no_progress(&["a", "a"], 3));
        assert!(!no_progress(&["a", "a", "a"], 1));
    }
}
