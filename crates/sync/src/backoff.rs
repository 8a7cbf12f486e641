use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Capped exponential delay: `base * factor^(attempt - 1)`, never above `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub factor: u32,
    pub cap_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2,
            cap_ms: 60_000,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let multiplier = u64::from(self.factor.max(1)).saturating_pow(exponent);
        self.base_ms.saturating_mul(multiplier).min(self.cap_ms)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }

    pub fn cap(&self) -> Duration {
        Duration::from_millis(self.cap_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_the_cap() {
        let policy = BackoffPolicy::default();
        let delays = (1..=8)
            .map(|attempt| policy.delay_ms(attempt))
            .collect::<Vec<_>>();

        assert_eq!(
            delays,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000]
        );
        assert_eq!(policy.delay_ms(400), 60_000);
    }
}
